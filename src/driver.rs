//! Core driver logic for Talos
//!
//! This module owns the polling loop that feeds the decision engine:
//! it reads battery telemetry from the Victron system service, runs one
//! evaluation per tick, drives the grid actuator when the engine asks
//! for a change, and publishes the resulting state over D-Bus and the
//! status broadcast channel.

use crate::config::{Config, ControlMethod};
use crate::dbus::DbusService;
use crate::engine::{ActuatorRequest, ConditionFlags, Controller, ProtectionFlags, Sample};
use crate::error::{Result, TalosError};
use crate::logging::{LogContext, get_logger_with_context};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::{Duration, interval};

/// Main driver state
#[derive(Debug, Clone)]
pub enum DriverState {
    /// Driver is initializing
    Initializing,
    /// Driver is running normally
    Running,
    /// Driver is in error state
    Error(String),
    /// Driver is shutting down
    ShuttingDown,
}

/// One published status frame, also the /api/status payload
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: String,
    pub device_instance: u32,
    pub state: String,
    pub grid_on: bool,
    pub reason: String,
    pub pending_disable_remaining_s: Option<f64>,
    pub soc: Option<f64>,
    pub capacity_kwh: Option<f64>,
    pub chemistry: Option<String>,
    pub cell_count: Option<u32>,
    pub voltage: Option<f64>,
    pub charge_power: Option<f64>,
    pub ac_load: Option<f64>,
    pub conditions: ConditionFlags,
    pub protections: ProtectionFlags,
    pub control_target: Option<String>,
    /// Last actuator state successfully written, which can lag the
    /// engine state after a failed write
    pub last_commanded: Option<bool>,
    pub poll_interval_ms: u64,
    pub total_polls: u64,
    pub driver_state: String,
}

/// Main driver for Talos
pub struct GridDriver {
    /// Configuration
    config: Config,

    /// Current driver state
    state: watch::Sender<DriverState>,

    /// Logger with context
    logger: crate::logging::StructuredLogger,

    /// Shutdown signal
    shutdown_tx: mpsc::UnboundedSender<()>,

    /// Shutdown receiver, taken by the run loop
    shutdown_rx: Option<mpsc::UnboundedReceiver<()>>,

    /// D-Bus service handle
    dbus: Option<DbusService>,

    /// Decision engine
    controller: Controller,

    /// Last valid telemetry sample, replayed on debounce deadlines
    last_sample: Option<Sample>,

    /// Last actuator state successfully written
    last_commanded: Option<bool>,

    /// Service and path the actuator writes go to
    control_target: Option<String>,

    /// Whether the last evaluation cycle failed, which disarms the
    /// deadline wakeup until a cycle succeeds again
    last_cycle_errored: bool,

    /// Poll cycles since startup
    total_polls: u64,

    /// Broadcast channel for streaming live status updates (SSE)
    status_tx: broadcast::Sender<String>,
}

impl GridDriver {
    /// Create a new driver instance
    pub async fn new() -> Result<Self> {
        let config = Config::load().map_err(|e| {
            eprintln!("Failed to load configuration: {e}");
            e
        })?;

        // Initialize logging
        crate::logging::init_logging(&config.logging)?;

        let logger = get_logger_with_context(
            LogContext::new("driver").with_device_instance(config.device_instance),
        );

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DriverState::Initializing);

        logger.info("Initializing grid connection controller");

        let controller = Controller::new(std::time::Instant::now());

        // Create status broadcast channel
        let (status_tx, _status_rx) = broadcast::channel::<String>(100);

        Ok(Self {
            config,
            state: state_tx,
            logger,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            dbus: None,
            controller,
            last_sample: None,
            last_commanded: None,
            control_target: None,
            last_cycle_errored: false,
            total_polls: 0,
            status_tx,
        })
    }

    /// Run the driver main loop over a shared handle. The lock is taken
    /// per cycle and released while the loop sleeps, so the web handlers
    /// are served between cycles.
    pub async fn run_shared(driver: Arc<Mutex<GridDriver>>) -> Result<()> {
        let (poll_ms, mut shutdown_rx) = {
            let mut drv = driver.lock().await;
            drv.initialize().await?;
            let rx = drv
                .shutdown_rx
                .take()
                .ok_or_else(|| TalosError::generic("Driver is already running"))?;
            (drv.config.poll_interval_ms, rx)
        };

        let mut poll_interval = interval(Duration::from_millis(poll_ms));

        // The deadline arm wakes the loop exactly when a debounce timer or
        // pending disconnect expires, so transitions land on time even with
        // a slow poll interval.
        loop {
            let deadline = driver.lock().await.next_wakeup();
            tokio::select! {
                _ = poll_interval.tick() => {
                    let mut drv = driver.lock().await;
                    if let Err(e) = drv.poll_cycle().await {
                        drv.logger.error(&format!("Poll cycle failed: {e}"));
                        // Continue polling even on errors
                    }
                }
                _ = Self::sleep_until_deadline(deadline) => {
                    driver.lock().await.deadline_cycle().await;
                }
                _ = shutdown_rx.recv() => {
                    driver.lock().await.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        // Shutdown sequence
        let mut drv = driver.lock().await;
        drv.state.send(DriverState::ShuttingDown).ok();
        drv.shutdown().await
    }

    /// Bring up D-Bus, publish identity, and energize the actuator into
    /// the engine's known starting state.
    async fn initialize(&mut self) -> Result<()> {
        self.logger.info("Starting grid controller main loop");

        // Bring up D-Bus; a missing bus is fatal only when required
        let mut dbus = DbusService::new(self.config.device_instance)?;
        match dbus.start().await {
            Ok(()) => {
                self.dbus = Some(dbus);
            }
            Err(e) if self.config.require_dbus => {
                self.state.send(DriverState::Error(e.to_string())).ok();
                return Err(e);
            }
            Err(e) => {
                self.logger
                    .warn(&format!("D-Bus unavailable ({e}); running detached"));
            }
        }

        self.publish_identity().await;
        self.state.send(DriverState::Running).ok();

        // Known starting point: energize the grid connection
        let startup = self.controller.startup_command();
        self.apply_actuator(&startup).await;
        Ok(())
    }

    async fn sleep_until_deadline(deadline: Option<std::time::Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Register the mandatory VeDbus identity paths
    async fn publish_identity(&mut self) {
        let device_instance = self.config.device_instance;
        let Some(dbus) = &mut self.dbus else {
            return;
        };
        let _ = dbus
            .ensure_item("/Mgmt/ProcessName", serde_json::json!("talos"))
            .await;
        let _ = dbus
            .ensure_item("/Mgmt/ProcessVersion", serde_json::json!(env!("APP_VERSION")))
            .await;
        let _ = dbus
            .ensure_item("/Mgmt/Connection", serde_json::json!("Local D-Bus"))
            .await;
        let _ = dbus
            .ensure_item("/DeviceInstance", serde_json::json!(device_instance))
            .await;
        let _ = dbus.ensure_item("/Connected", serde_json::json!(1)).await;
        let _ = dbus
            .ensure_item(
                "/ProductName",
                serde_json::json!("Talos Grid Connection Controller"),
            )
            .await;
        let _ = dbus
            .ensure_item("/ProductId", serde_json::json!(0xB051u32))
            .await;
    }

    /// Single polling cycle: read telemetry, evaluate, publish
    async fn poll_cycle(&mut self) -> Result<()> {
        self.total_polls += 1;
        let Some(sample) = self.read_sample().await else {
            return Ok(());
        };
        if sample.validity_error().is_none() {
            self.last_sample = Some(sample);
        }
        self.decide_and_apply(&sample).await;
        Ok(())
    }

    /// A debounce or disconnect deadline fired between polls; re-evaluate
    /// the last valid sample at the current time.
    async fn deadline_cycle(&mut self) {
        let Some(mut sample) = self.last_sample else {
            return;
        };
        sample.timestamp = chrono::Utc::now();
        self.decide_and_apply(&sample).await;
    }

    async fn decide_and_apply(&mut self, sample: &Sample) {
        match self
            .controller
            .evaluate(&self.config, sample, std::time::Instant::now())
        {
            Ok(Some(cmd)) => {
                self.last_cycle_errored = false;
                self.apply_actuator(&cmd).await;
            }
            Ok(None) => {
                self.last_cycle_errored = false;
                // A previously failed write leaves the actuator out of
                // step with the engine; re-issue until a write lands
                if self.dbus.is_some()
                    && let Some(cmd) = self.reassert_command()
                {
                    self.apply_actuator(&cmd).await;
                }
            }
            // Fail closed: no actuator command, state held, logged every cycle
            Err(e) => {
                self.last_cycle_errored = true;
                self.logger.error(&format!("Decision cycle aborted: {e}"));
            }
        }
        self.publish_status(sample).await;
    }

    /// Command that brings the actuator back in line with the engine, if
    /// the last successful write diverges from the desired state.
    fn reassert_command(&self) -> Option<ActuatorRequest> {
        let desired = self.controller.state().actuator_on();
        if self.last_commanded == Some(desired) {
            return None;
        }
        Some(ActuatorRequest {
            on: desired,
            reason: self.controller.last_reason().to_string(),
        })
    }

    /// Deadline for the loop's wakeup arm. An errored cycle disarms the
    /// wakeup so a held engine timer cannot spin the loop while the
    /// config is broken.
    fn next_wakeup(&self) -> Option<std::time::Instant> {
        if self.last_cycle_errored {
            None
        } else {
            self.controller.next_deadline()
        }
    }

    /// Write a commanded grid state to the actuator. A failed write is
    /// logged and the divergence is re-asserted on following cycles.
    async fn apply_actuator(&mut self, cmd: &ActuatorRequest) {
        let verb = if cmd.on { "on" } else { "off" };
        self.logger
            .info(&format!("Actuator command: grid {verb} ({})", cmd.reason));
        match self.write_actuator(cmd.on).await {
            Ok(target) => {
                self.last_commanded = Some(cmd.on);
                self.control_target = Some(target);
            }
            Err(e) => {
                self.logger.error(&format!("Actuator write failed: {e}"));
            }
        }
    }

    /// Route the actuator write per the configured control method.
    /// Returns the service:path actually written.
    async fn write_actuator(&self, on: bool) -> Result<String> {
        let dbus = self
            .dbus
            .as_ref()
            .ok_or_else(|| TalosError::dbus("No D-Bus connection for actuator"))?;

        let method = self.config.control.method;
        if matches!(method, ControlMethod::DirectAcInput | ControlMethod::Auto) {
            match self.find_vebus_service().await {
                Some(service) => {
                    // IgnoreAcIn1 is inverted: 0 lets the input through
                    let value = serde_json::json!(if on { 0 } else { 1 });
                    dbus.set_remote_value(&service, "/Ac/Control/IgnoreAcIn1", value)
                        .await?;
                    return Ok(format!("{service}:/Ac/Control/IgnoreAcIn1"));
                }
                None if method == ControlMethod::DirectAcInput => {
                    return Err(TalosError::dbus("No vebus service found for AC input control"));
                }
                None => {
                    self.logger
                        .debug("No vebus service found; falling back to relay control");
                }
            }
        }

        let path = format!("/Relay/{}/State", self.config.control.relay_index);
        dbus.set_remote_value(
            "com.victronenergy.system",
            &path,
            serde_json::json!(u8::from(on)),
        )
        .await?;
        Ok(format!("com.victronenergy.system:{path}"))
    }

    /// First vebus service on the bus, if any
    async fn find_vebus_service(&self) -> Option<String> {
        let dbus = self.dbus.as_ref()?;
        let mut names = dbus
            .list_service_names_with_prefix("com.victronenergy.vebus.")
            .await
            .ok()?;
        names.sort();
        names.into_iter().next()
    }

    /// Read one telemetry sample from the Victron system service.
    /// A missing pack voltage skips the cycle; load and charge power
    /// default to zero when absent.
    async fn read_sample(&self) -> Option<Sample> {
        let dbus = self.dbus.as_ref()?;

        let voltage = match dbus
            .read_remote_value("com.victronenergy.system", "/Dc/Battery/Voltage")
            .await
        {
            Ok(v) => match v.as_f64().or_else(|| v.as_i64().map(|x| x as f64)) {
                Some(f) => f,
                None => {
                    self.logger
                        .warn(&format!("Battery voltage is not numeric: {v}"));
                    return None;
                }
            },
            Err(e) => {
                self.logger
                    .warn(&format!("Battery voltage read failed: {e}"));
                return None;
            }
        };

        // Helper to read f64, defaulting to 0
        async fn get_f64(svc: &DbusService, path: &str) -> f64 {
            match svc
                .read_remote_value("com.victronenergy.system", path)
                .await
            {
                Ok(v) => v
                    .as_f64()
                    .or_else(|| v.as_i64().map(|x| x as f64))
                    .or_else(|| v.as_u64().map(|x| x as f64))
                    .unwrap_or(0.0),
                Err(_) => 0.0,
            }
        }

        // Signed DC battery power: positive while charging
        let charge_power = get_f64(dbus, "/Dc/Battery/Power").await;

        let load_l1 = get_f64(dbus, "/Ac/Consumption/L1/Power").await;
        let load_l2 = get_f64(dbus, "/Ac/Consumption/L2/Power").await;
        let load_l3 = get_f64(dbus, "/Ac/Consumption/L3/Power").await;
        let ac_load = load_l1 + load_l2 + load_l3;

        Some(Sample {
            voltage,
            ac_load,
            charge_power,
            timestamp: chrono::Utc::now(),
        })
    }

    /// Publish the status frame over D-Bus and the SSE broadcast
    async fn publish_status(&mut self, sample: &Sample) {
        let snap = self.build_status(Some(sample));
        if let Some(dbus) = &mut self.dbus
            && let Err(e) = dbus.export_snapshot(&snap).await
        {
            self.logger.warn(&format!("D-Bus export failed: {e}"));
        }
        if let Ok(json) = serde_json::to_string(&snap) {
            let _ = self.status_tx.send(json);
        }
        self.logger.debug(&format!(
            "cycle: state={} soc={} v={:.2}V load={:.0}W power={:.0}W reason={}",
            snap.state,
            snap.soc.map(|s| format!("{s:.1}%")).unwrap_or_else(|| "?".into()),
            sample.voltage,
            sample.ac_load,
            sample.charge_power,
            snap.reason,
        ));
    }

    fn build_status(&self, sample: Option<&Sample>) -> StatusSnapshot {
        let c = self.controller.snapshot(std::time::Instant::now());
        StatusSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            device_instance: self.config.device_instance,
            state: c.state.to_string(),
            grid_on: c.grid_on,
            reason: c.reason,
            pending_disable_remaining_s: c.pending_disable_remaining_s,
            soc: c.soc,
            capacity_kwh: c.capacity_kwh,
            chemistry: c.chemistry,
            cell_count: c.cell_count,
            voltage: sample.map(|s| s.voltage),
            charge_power: sample.map(|s| s.charge_power),
            ac_load: sample.map(|s| s.ac_load),
            conditions: c.conditions,
            protections: c.protections,
            control_target: self.control_target.clone(),
            last_commanded: self.last_commanded,
            poll_interval_ms: self.config.poll_interval_ms,
            total_polls: self.total_polls,
            driver_state: match &*self.state.borrow() {
                DriverState::Initializing => "Initializing".to_string(),
                DriverState::Running => "Running".to_string(),
                DriverState::Error(e) => format!("Error: {e}"),
                DriverState::ShuttingDown => "ShuttingDown".to_string(),
            },
        }
    }

    /// Shutdown the driver
    async fn shutdown(&mut self) -> Result<()> {
        self.logger.info("Shutting down driver");
        if let Some(mut dbus) = self.dbus.take() {
            dbus.stop().await?;
        }
        self.logger.info("Driver shutdown complete");
        Ok(())
    }

    /// Get current driver state
    pub fn get_state(&self) -> DriverState {
        self.state.borrow().clone()
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Get configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration; thresholds take effect next cycle
    pub fn update_config(&mut self, new_config: Config) -> Result<()> {
        self.config = new_config;
        Ok(())
    }

    /// Current status frame for the web API
    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.build_status(self.last_sample.as_ref())
    }

    pub fn get_db_value(&self, path: &str) -> Option<serde_json::Value> {
        self.dbus.as_ref().and_then(|d| d.get(path))
    }

    /// Snapshot of cached D-Bus paths (subset of known keys)
    pub fn get_dbus_cache_snapshot(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for key in [
            "/DeviceInstance",
            "/ProductName",
            "/State",
            "/Reason",
            "/Soc",
            "/Dc/Battery/Voltage",
            "/Dc/Battery/Power",
            "/Ac/Load",
            "/Capacity/Kwh",
            "/Conditions/Load",
            "/Conditions/Voltage",
            "/Conditions/Soc",
            "/Conditions/Time",
        ] {
            if let Some(v) = self.get_db_value(key) {
                root.insert(key.to_string(), v);
            }
        }
        serde_json::Value::Object(root)
    }

    /// Subscribe to status updates (for SSE)
    pub fn subscribe_status(&self) -> broadcast::Receiver<String> {
        self.status_tx.subscribe()
    }
}

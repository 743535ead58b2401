//! D-Bus integration for Venus OS
//!
//! Registers the controller as a Victron-style service and publishes its
//! state tree in the VeDbus BusItem convention (GetValue/GetText/GetItems
//! plus ItemsChanged signals). The same connection is used to pull
//! telemetry from `com.victronenergy.system` and to drive the grid
//! actuator on a remote service. All published items are read-only: the
//! decision engine is the only writer of its own state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, Result as ZbusResult, names::WellKnownName};

use crate::driver::StatusSnapshot;
use crate::error::{Result, TalosError};
use crate::logging::{StructuredLogger, get_logger};

/// Budget for one remote BusItem call; Venus services answer well within this
const REMOTE_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(600);

/// State shared between the service handle and its registered objects
pub(crate) struct DbusSharedState {
    pub(crate) paths: HashMap<String, serde_json::Value>,
    pub(crate) connection: Option<Connection>,
    pub(crate) root_path: OwnedObjectPath,
}

impl DbusSharedState {
    fn new(root_path: OwnedObjectPath) -> Self {
        Self {
            paths: HashMap::new(),
            connection: None,
            root_path,
        }
    }
}

/// Human-readable text for a published value, per VeDbus GetText
pub(crate) fn format_text_value(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                format!("{f:.2}")
            } else {
                n.to_string()
            }
        }
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => val.to_string(),
    }
}

/// VeDbus-style item implementing com.victronenergy.BusItem for one path
pub struct BusItem {
    path: String,
    shared: Arc<Mutex<DbusSharedState>>,
}

impl BusItem {
    pub(crate) fn new(path: String, shared: Arc<Mutex<DbusSharedState>>) -> Self {
        Self { path, shared }
    }

    pub(crate) fn serde_to_owned_value(v: &serde_json::Value) -> OwnedValue {
        match v {
            serde_json::Value::Null => OwnedValue::from(0i64),
            serde_json::Value::Bool(b) => OwnedValue::from(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OwnedValue::from(i)
                } else if let Some(u) = n.as_u64() {
                    OwnedValue::from(u)
                } else {
                    OwnedValue::from(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => OwnedValue::try_from(Value::from(s.as_str()))
                .unwrap_or_else(|_| OwnedValue::from(0i64)),
            _ => OwnedValue::from(0i64),
        }
    }

    pub(crate) fn owned_value_to_serde(v: &OwnedValue) -> serde_json::Value {
        if let Ok(b) = <bool as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(b);
        }
        if let Ok(i) = <i64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(i);
        }
        if let Ok(u) = <u64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(u);
        }
        if let Ok(f) = <f64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(f);
        }
        if let Ok(s) = <&str as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(s.to_string());
        }
        serde_json::json!(v.to_string())
    }

    /// "Value" and "Text" entries for a change signal payload
    fn change_entry(value: &serde_json::Value) -> HashMap<&'static str, OwnedValue> {
        let mut entry: HashMap<&'static str, OwnedValue> = HashMap::new();
        entry.insert("Value", Self::serde_to_owned_value(value));
        let text = format_text_value(value);
        let text_ov = OwnedValue::try_from(Value::from(text.as_str()))
            .unwrap_or_else(|_| OwnedValue::from(0i64));
        entry.insert("Text", text_ov);
        entry
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let val = {
            let shared = self.shared.lock().unwrap();
            shared
                .paths
                .get(&self.path)
                .cloned()
                .unwrap_or(serde_json::json!(0))
        };
        Self::serde_to_owned_value(&val)
    }

    /// The whole tree is read-only; the engine is the single writer
    #[zbus(name = "SetValue")]
    async fn set_value(&self, _value: OwnedValue) -> i32 {
        1
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> String {
        let val = {
            let shared = self.shared.lock().unwrap();
            shared
                .paths
                .get(&self.path)
                .cloned()
                .unwrap_or(serde_json::json!(0))
        };
        format_text_value(&val)
    }

    #[zbus(signal)]
    pub async fn properties_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, OwnedValue>,
    ) -> zbus::Result<()>;
}

/// Root BusItem at "/" exposing the whole tree via GetItems/GetValue
pub struct RootBus {
    shared: Arc<Mutex<DbusSharedState>>,
}

impl RootBus {
    fn collect_subtree_map(&self, prefix: &str, as_text: bool) -> HashMap<String, OwnedValue> {
        collect_subtree(&self.shared, prefix, as_text)
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl RootBus {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let map = self.collect_subtree_map("/", false);
        OwnedValue::try_from(map).unwrap_or_else(|_| OwnedValue::from(0i64))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        let map = self.collect_subtree_map("/", true);
        OwnedValue::try_from(map).unwrap_or_else(|_| OwnedValue::from(0i64))
    }

    #[zbus(name = "GetItems")]
    async fn get_items(&self) -> HashMap<String, HashMap<String, OwnedValue>> {
        let shared = self.shared.lock().unwrap();
        let mut out: HashMap<String, HashMap<String, OwnedValue>> = HashMap::new();
        for (path, val) in shared.paths.iter() {
            let entry = BusItem::change_entry(val)
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            out.insert(path.clone(), entry);
        }
        out
    }

    #[zbus(signal)]
    pub async fn items_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, HashMap<&str, OwnedValue>>,
    ) -> zbus::Result<()>;
}

/// Intermediate tree node; answers GetValue/GetText with its subtree
pub struct TreeNode {
    path: String,
    shared: Arc<Mutex<DbusSharedState>>,
}

impl TreeNode {
    pub(crate) fn new(path: String, shared: Arc<Mutex<DbusSharedState>>) -> Self {
        Self { path, shared }
    }

    fn collect_subtree_map(&self, as_text: bool) -> HashMap<String, OwnedValue> {
        collect_subtree(&self.shared, &self.path, as_text)
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl TreeNode {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let map = self.collect_subtree_map(false);
        OwnedValue::try_from(map).unwrap_or_else(|_| OwnedValue::from(0i64))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        let map = self.collect_subtree_map(true);
        OwnedValue::try_from(map).unwrap_or_else(|_| OwnedValue::from(0i64))
    }
}

fn collect_subtree(
    shared: &Arc<Mutex<DbusSharedState>>,
    prefix: &str,
    as_text: bool,
) -> HashMap<String, OwnedValue> {
    let shared = shared.lock().unwrap();
    let mut px = prefix.to_string();
    if !px.ends_with('/') {
        px.push('/');
    }
    let mut result: HashMap<String, OwnedValue> = HashMap::new();
    for (path, val) in shared.paths.iter() {
        if let Some(suffix) = path.strip_prefix(&px) {
            let ov = if as_text {
                let text = format_text_value(val);
                OwnedValue::try_from(Value::from(text.as_str()))
                    .unwrap_or_else(|_| OwnedValue::from(0i64))
            } else {
                BusItem::serde_to_owned_value(val)
            };
            result.insert(suffix.to_string(), ov);
        }
    }
    result
}

/// Handle for the controller's own Venus OS service
pub struct DbusService {
    logger: StructuredLogger,
    service_name: String,
    connection: Option<Connection>,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
    registered_paths: HashSet<String>,
    root_path: OwnedObjectPath,
}

impl DbusService {
    pub fn new(device_instance: u32) -> Result<Self> {
        let logger = get_logger("dbus");
        let service_name = format!("com.victronenergy.gridcontrol.talos_{device_instance}");
        let root_path = OwnedObjectPath::try_from("/")
            .map_err(|e| TalosError::dbus(format!("Invalid object path: {e}")))?;
        Ok(Self {
            logger,
            service_name,
            connection: None,
            shared: Arc::new(Mutex::new(DbusSharedState::new(root_path.clone()))),
            registered_paths: HashSet::new(),
            root_path,
        })
    }

    /// Connect (system bus first, session bus as a development fallback),
    /// claim the service name and register the root item.
    pub async fn start(&mut self) -> Result<()> {
        let connection = match Connection::system().await {
            Ok(c) => {
                self.logger.info("Connected to D-Bus: system bus");
                c
            }
            Err(e_sys) => match Connection::session().await {
                Ok(c) => {
                    self.logger
                        .warn(&format!("System bus unavailable ({e_sys}); using session bus"));
                    c
                }
                Err(e_sess) => {
                    return Err(TalosError::dbus(format!(
                        "DBus connect failed: system={e_sys} session={e_sess}"
                    )));
                }
            },
        };
        self.request_name(&connection)
            .await
            .map_err(|e| TalosError::dbus(format!("RequestName failed: {e}")))?;
        self.logger
            .info(&format!("D-Bus service started: {}", self.service_name));

        let root = RootBus {
            shared: Arc::clone(&self.shared),
        };
        connection
            .object_server()
            .at(&self.root_path, root)
            .await
            .map_err(|e| TalosError::dbus(format!("Register root BusItem failed: {e}")))?;

        {
            let mut shared = self.shared.lock().unwrap();
            shared.connection = Some(connection.clone());
        }
        self.connection = Some(connection);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.logger.info("Stopping D-Bus service");
        {
            let mut shared = self.shared.lock().unwrap();
            shared.connection = None;
        }
        self.connection = None;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn request_name(&self, connection: &Connection) -> ZbusResult<()> {
        use zbus::fdo::{DBusProxy, RequestNameFlags};
        let proxy = DBusProxy::new(connection).await?;
        let name = WellKnownName::try_from(self.service_name.as_str())?;
        let _ = proxy
            .request_name(name, RequestNameFlags::ReplaceExisting.into())
            .await?;
        Ok(())
    }

    /// Register BusItem objects for every segment of `path`, seeding the
    /// leaf with `initial_value` if it has none yet.
    pub async fn ensure_item(&mut self, path: &str, initial_value: serde_json::Value) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for i in 1..=segments.len() {
            let subpath = format!("/{}", segments[..i].join("/"));
            if self.registered_paths.contains(&subpath) {
                continue;
            }
            let obj_path = OwnedObjectPath::try_from(subpath.as_str()).map_err(|e| {
                TalosError::dbus(format!("Invalid object path '{subpath}': {e}"))
            })?;
            if let Some(conn) = &self.connection {
                let registered = if i == segments.len() {
                    let item = BusItem::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, item).await
                } else {
                    let node = TreeNode::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, node).await
                };
                registered.map_err(|e| {
                    TalosError::dbus(format!("Register BusItem failed for {subpath}: {e}"))
                })?;
            }
            self.registered_paths.insert(subpath);
        }
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.paths.contains_key(path) {
                shared.paths.insert(path.to_string(), initial_value);
            }
        }
        Ok(())
    }

    pub async fn update_paths(
        &mut self,
        updates: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<()> {
        for (k, v) in updates {
            self.update_path(&k, v).await?;
        }
        Ok(())
    }

    /// Publish a value, registering the item on first sight and emitting
    /// change signals. Unchanged values are dropped silently.
    pub async fn update_path(&mut self, path: &str, value: serde_json::Value) -> Result<()> {
        {
            let shared = self.shared.lock().unwrap();
            if let Some(old) = shared.paths.get(path)
                && old == &value
            {
                return Ok(());
            }
        }
        self.ensure_item(path, value.clone()).await?;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.paths.insert(path.to_string(), value.clone());
        }
        if let Some(conn) = &self.connection {
            let obj_path = OwnedObjectPath::try_from(path)
                .map_err(|e| TalosError::dbus(format!("Invalid object path '{path}': {e}")))?;
            let item_ctx = SignalEmitter::new(conn, obj_path)
                .map_err(|e| TalosError::dbus(format!("SignalEmitter new failed: {e}")))?;
            let _ = BusItem::properties_changed(&item_ctx, BusItem::change_entry(&value)).await;

            let root_ctx = SignalEmitter::new(conn, self.root_path.clone())
                .map_err(|e| TalosError::dbus(format!("Root SignalEmitter failed: {e}")))?;
            let mut outer: HashMap<&str, HashMap<&str, OwnedValue>> = HashMap::new();
            outer.insert(path, BusItem::change_entry(&value));
            let _ = RootBus::items_changed(&root_ctx, outer).await;
        }
        Ok(())
    }

    /// Cached value of a published path
    pub fn get(&self, path: &str) -> Option<serde_json::Value> {
        let shared = self.shared.lock().unwrap();
        shared.paths.get(path).cloned()
    }

    /// Map a status snapshot onto the published tree
    pub async fn export_snapshot(&mut self, snap: &StatusSnapshot) -> Result<()> {
        let mut updates: Vec<(String, serde_json::Value)> = vec![
            (
                "/State".to_string(),
                serde_json::json!(u8::from(snap.grid_on)),
            ),
            ("/Reason".to_string(), serde_json::json!(snap.reason)),
            (
                "/Conditions/Load".to_string(),
                serde_json::json!(u8::from(snap.conditions.load)),
            ),
            (
                "/Conditions/Voltage".to_string(),
                serde_json::json!(u8::from(snap.conditions.voltage)),
            ),
            (
                "/Conditions/Soc".to_string(),
                serde_json::json!(u8::from(snap.conditions.soc)),
            ),
            (
                "/Conditions/Time".to_string(),
                serde_json::json!(u8::from(snap.conditions.time)),
            ),
            (
                "/Protections/Standard".to_string(),
                serde_json::json!(u8::from(snap.protections.standard)),
            ),
            (
                "/Protections/Emergency".to_string(),
                serde_json::json!(u8::from(snap.protections.emergency)),
            ),
        ];
        if let Some(soc) = snap.soc {
            updates.push(("/Soc".to_string(), serde_json::json!(soc)));
        }
        if let Some(v) = snap.voltage {
            updates.push(("/Dc/Battery/Voltage".to_string(), serde_json::json!(v)));
        }
        if let Some(p) = snap.charge_power {
            updates.push(("/Dc/Battery/Power".to_string(), serde_json::json!(p)));
        }
        if let Some(w) = snap.ac_load {
            updates.push(("/Ac/Load".to_string(), serde_json::json!(w)));
        }
        if let Some(kwh) = snap.capacity_kwh {
            updates.push(("/Capacity/Kwh".to_string(), serde_json::json!(kwh)));
        }
        self.update_paths(updates).await
    }

    /// GetValue on a BusItem of another service, with a hard timeout
    pub async fn read_remote_value(
        &self,
        service_name: &str,
        path: &str,
    ) -> Result<serde_json::Value> {
        let conn = match &self.connection {
            Some(c) => c,
            None => return Err(TalosError::dbus("No D-Bus connection available")),
        };
        let proxy = tokio::time::timeout(
            REMOTE_CALL_TIMEOUT,
            zbus::Proxy::new(conn, service_name, path, "com.victronenergy.BusItem"),
        )
        .await
        .map_err(|_| TalosError::dbus("DBus proxy creation timed out"))?
        .map_err(|e| TalosError::dbus(format!("Proxy creation failed: {e}")))?;

        let val: OwnedValue = tokio::time::timeout(
            REMOTE_CALL_TIMEOUT,
            proxy.call("GetValue", &()),
        )
        .await
        .map_err(|_| TalosError::dbus("DBus GetValue timed out"))?
        .map_err(|e| TalosError::dbus(format!("GetValue call failed: {e}")))?;

        Ok(BusItem::owned_value_to_serde(&val))
    }

    /// SetValue on a BusItem of another service, with a hard timeout.
    /// A nonzero return code from the remote item is an error.
    pub async fn set_remote_value(
        &self,
        service_name: &str,
        path: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let conn = match &self.connection {
            Some(c) => c,
            None => return Err(TalosError::dbus("No D-Bus connection available")),
        };
        let proxy = tokio::time::timeout(
            REMOTE_CALL_TIMEOUT,
            zbus::Proxy::new(conn, service_name, path, "com.victronenergy.BusItem"),
        )
        .await
        .map_err(|_| TalosError::dbus("DBus proxy creation timed out"))?
        .map_err(|e| TalosError::dbus(format!("Proxy creation failed: {e}")))?;

        let ov = BusItem::serde_to_owned_value(&value);
        let code: i32 = tokio::time::timeout(
            REMOTE_CALL_TIMEOUT,
            proxy.call("SetValue", &(ov,)),
        )
        .await
        .map_err(|_| TalosError::dbus("DBus SetValue timed out"))?
        .map_err(|e| TalosError::dbus(format!("SetValue call failed: {e}")))?;

        if code != 0 {
            return Err(TalosError::dbus(format!(
                "SetValue rejected by {service_name}{path} (code {code})"
            )));
        }
        Ok(())
    }

    /// List available D-Bus service names that start with the provided prefix
    pub async fn list_service_names_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = match &self.connection {
            Some(c) => c,
            None => return Err(TalosError::dbus("No D-Bus connection available")),
        };
        let proxy = zbus::fdo::DBusProxy::new(conn)
            .await
            .map_err(|e| TalosError::dbus(format!("DBusProxy creation failed: {e}")))?;
        let names = proxy
            .list_names()
            .await
            .map_err(|e| TalosError::dbus(format!("ListNames failed: {e}")))?;
        Ok(names
            .into_iter()
            .map(|n| n.to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }
}

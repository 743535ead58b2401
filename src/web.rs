//! Axum-based HTTP API for monitoring and configuration
//!
//! Read-mostly surface: status, config, cached D-Bus values and log
//! access. The only writes are config replacement and the web log
//! level. Live status and log lines are exposed as SSE streams.

use crate::driver::GridDriver;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<Mutex<GridDriver>>,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Current decision state, telemetry and condition flags
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    let json = serde_json::to_value(drv.status_snapshot())
        .unwrap_or(serde_json::json!({"error":"serialization"}));
    Json(json)
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    let json = serde_json::to_value(drv.config().clone())
        .unwrap_or(serde_json::json!({"error":"serialization"}));
    Json(json)
}

async fn put_config(
    State(state): State<AppState>,
    Json(new_cfg_value): Json<serde_json::Value>,
) -> impl IntoResponse {
    let new_cfg: crate::config::Config = match serde_json::from_value(new_cfg_value) {
        Ok(c) => c,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error":"bad request"})),
            );
        }
    };
    if new_cfg.validate().is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error":"invalid config"})),
        );
    }
    let mut drv = state.driver.lock().await;
    if drv.update_config(new_cfg).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error":"apply failed"})),
        );
    }
    (StatusCode::OK, Json(serde_json::json!({"ok":true})))
}

/// Cached values of the published D-Bus tree
async fn dbus_dump(State(state): State<AppState>) -> impl IntoResponse {
    let drv = state.driver.lock().await;
    Json(drv.get_dbus_cache_snapshot())
}

/// Live status frames as SSE events
async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = {
        let drv = state.driver.lock().await;
        drv.subscribe_status()
    };
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(payload) => Some(Ok::<Event, std::convert::Infallible>(
            Event::default().event("status").data(payload),
        )),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct TailParams {
    pub lines: Option<usize>,
}

pub async fn logs_tail(
    State(state): State<AppState>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let (configured_path, max_lines) = {
        let drv = state.driver.lock().await;
        (
            drv.config().logging.file.clone(),
            params.lines.unwrap_or(200).min(10_000),
        )
    };
    let path = match resolve_log_file_path(&configured_path).await {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents.lines().collect();
            if lines.len() > max_lines {
                lines = lines.split_off(lines.len() - max_lines);
            }
            let body = lines.join("\n");
            let mut resp = Response::new(body.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

pub async fn logs_head(
    State(state): State<AppState>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let (configured_path, max_lines) = {
        let drv = state.driver.lock().await;
        (
            drv.config().logging.file.clone(),
            params.lines.unwrap_or(200).min(10_000),
        )
    };
    let path = match resolve_log_file_path(&configured_path).await {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents.lines().collect();
            if lines.len() > max_lines {
                lines.truncate(max_lines);
            }
            let body = lines.join("\n");
            let mut resp = Response::new(body.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

pub async fn logs_download(State(state): State<AppState>) -> impl IntoResponse {
    let configured_path = {
        let drv = state.driver.lock().await;
        drv.config().logging.file.clone()
    };
    let path = match resolve_log_file_path(&configured_path).await {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut resp = Response::new(bytes.into());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/octet-stream"),
            );
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, "Log file not available").into_response(),
    }
}

/// Log lines as SSE events, filtered by the runtime web log level
pub async fn logs_stream() -> impl IntoResponse {
    let rx = crate::logging::subscribe_log_lines();
    let stream = BroadcastStream::new(rx).filter_map(|res| match res {
        Ok(line) if crate::logging::should_emit_to_web(&line) => {
            Some(Ok::<Event, std::convert::Infallible>(
                Event::default().event("log").data(line),
            ))
        }
        _ => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn name_matches(file_name: &str, prefix: &str, suffix: &str) -> bool {
    if file_name == format!("{}.{}", prefix, suffix) {
        return true;
    }
    (file_name.starts_with(prefix) && file_name.ends_with(&format!(".{suffix}")))
        || (file_name.starts_with(&format!("{}.", prefix))
            && file_name.contains(&format!(".{suffix}.")))
}

fn derive_search_spec(configured: &Path) -> (PathBuf, String, String) {
    if configured.extension().is_some() {
        let dir = configured.parent().unwrap_or_else(|| Path::new("."));
        let stem = configured
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("talos")
            .to_string();
        let ext = configured
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("log")
            .to_string();
        (dir.to_path_buf(), stem, ext)
    } else {
        (
            configured.to_path_buf(),
            "talos".to_string(),
            "log".to_string(),
        )
    }
}

async fn configured_file_if_exists(configured: &Path) -> Option<PathBuf> {
    if let Ok(md) = fs::metadata(configured).await
        && md.is_file()
    {
        Some(configured.to_path_buf())
    } else {
        None
    }
}

async fn find_latest_matching(search_dir: &Path, prefix: &str, suffix: &str) -> Option<PathBuf> {
    let mut best_path: Option<PathBuf> = None;
    let mut best_mtime: SystemTime = SystemTime::UNIX_EPOCH;
    let mut stack: Vec<PathBuf> = vec![search_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = match fs::read_dir(&dir).await {
            Ok(v) => v,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let ft = match entry.file_type().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            if ft.is_file() {
                if let Some(name) = entry.file_name().to_str()
                    && name_matches(name, prefix, suffix)
                    && let Ok(md) = entry.metadata().await
                    && let Ok(modified) = md.modified()
                    && modified > best_mtime
                {
                    best_mtime = modified;
                    best_path = Some(entry.path());
                }
            } else if ft.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    best_path
}

// Resolve the actual log file taking rotation into account. If the
// configured path exists and is a file, use it. Otherwise search the
// directory tree for files matching the configured name pattern and
// pick the most recently modified one.
async fn resolve_log_file_path(configured_path: &str) -> Option<PathBuf> {
    let configured = Path::new(configured_path);
    if let Some(p) = configured_file_if_exists(configured).await {
        return Some(p);
    }
    let (search_dir, prefix, suffix) = derive_search_spec(configured);
    find_latest_matching(&search_dir, &prefix, &suffix).await
}

#[derive(Deserialize)]
struct WebLevelQuery {
    level: String,
}

async fn set_web_level(Query(q): Query<WebLevelQuery>) -> impl IntoResponse {
    match crate::logging::set_web_log_level_str(&q.level) {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "level": q.level})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": e.to_string()})),
        ),
    }
}

async fn get_web_level() -> impl IntoResponse {
    let lvl = crate::logging::get_web_log_level();
    Json(serde_json::json!({"level": lvl.to_string()}))
}

fn log_routes() -> Router<AppState> {
    Router::new()
        .route("/api/logs/tail", get(logs_tail))
        .route("/api/logs/head", get(logs_head))
        .route("/api/logs/download", get(logs_download))
        .route("/api/logs/stream", get(logs_stream))
        .route("/api/logs/web_level", post(set_web_level).get(get_web_level))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/dbus", get(dbus_dump))
        .route("/api/events", get(events))
        .merge(log_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(driver: Arc<Mutex<GridDriver>>, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState { driver };
    let router = build_router(state);

    let logger = crate::logging::get_logger("web");
    logger.info(&format!(
        "Starting web server; requested host={host}, port={port}"
    ));

    let (addr, parsed_ok): (SocketAddr, bool) = match host.parse::<IpAddr>() {
        Ok(ip) => (SocketAddr::new(ip, port), true),
        Err(_) => (([127, 0, 0, 1], port).into(), false),
    };
    if !parsed_ok {
        logger.warn(&format!("Invalid host '{host}'; falling back to 127.0.0.1"));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{} (API /api)",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}

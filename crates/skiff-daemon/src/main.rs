mod config;
mod engine;
mod metainfo;
mod upnp;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, info, warn};
use subtle::ConstantTimeEq;

use skiff_core::{
    activity,
    add_torrent,
    check_external_reachable,
    file_count,
    files,
    get_file,
    health,
    list_torrents,
    new_state,
    port_mapping,
    record_piece_completed,
    refresh_port_mapping,
    remove_torrent,
    rename_file,
    set_file_check,
    start_port_mapping_loop,
    stop_port_mapping_loop,
    torrent_started,
    torrent_stopped,
    version,
    CoreError,
    NatDiscovery,
    SharedState,
};

use crate::engine::{LocalEngine, LocalTorrent};

#[derive(Clone)]
struct AppCtx {
    state: SharedState,
    engine: Arc<LocalEngine>,
    discovery: Arc<dyn NatDiscovery>,
    download_dir: PathBuf,
    port_mapping_enabled: bool,
    admin_token: String,
    shutdown: Arc<tokio::sync::Notify>,
}

#[derive(Debug, Deserialize)]
struct AddTorrentRequest {
    torrent_b64: String,
}

#[derive(Debug, Deserialize)]
struct PatchFileRequest {
    check: bool,
}

#[derive(Debug, Deserialize)]
struct RenameFileRequest {
    name: String,
}

/// Torrents are addressed by their hex info hash. Keys are lowercase, so is the result.
fn torrent_id(raw: &str) -> Option<String> {
    if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(raw.to_ascii_lowercase())
    } else {
        None
    }
}

fn invalid_id() -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({
        "error": "Invalid torrent ID format"
    }))).into_response()
}

/// Why a body-carrying request is refused before it reaches a handler.
fn content_type_rejection(method: &Method, headers: &HeaderMap) -> Option<(StatusCode, &'static str)> {
    if !matches!(*method, Method::POST | Method::PATCH) {
        return None;
    }
    let body_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    if body_len == 0 {
        return None;
    }
    match headers.get(header::CONTENT_TYPE).map(|v| v.to_str().unwrap_or("")) {
        None => Some((StatusCode::BAD_REQUEST, "Content-Type header is required")),
        Some(ct) if !ct.starts_with("application/json") => {
            Some((StatusCode::UNSUPPORTED_MEDIA_TYPE, "Content-Type must be application/json"))
        }
        Some(_) => None,
    }
}

async fn require_json_body(request: Request, next: Next) -> Response {
    if let Some((status, msg)) = content_type_rejection(request.method(), request.headers()) {
        return (status, Json(serde_json::json!({"error": msg}))).into_response();
    }
    next.run(request).await
}

fn sanitize_error(e: &anyhow::Error, context: &str) -> String {
    let detailed = format!("{}: {:#}", context, e);
    error!("{}", detailed);
    let msg = e.to_string();
    let mut sanitized = msg.lines().take(1).collect::<String>();
    // Only replace if env var is non-empty; empty pattern would insert between every character
    for (var, label) in [("HOME", "[HOME]"), ("APPDATA", "[APPDATA]"), ("USERPROFILE", "[USERPROFILE]")] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                sanitized = sanitized.replace(value.as_str(), label);
            }
        }
    }
    if sanitized.to_lowercase().contains("token") || sanitized.to_lowercase().contains("secret") {
        sanitized = "An error occurred".to_string();
    }
    if sanitized.len() > 200 {
        let cut = (0..=200).rev().find(|i| sanitized.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &sanitized[..cut])
    } else {
        sanitized
    }
}

fn core_error_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::TorrentNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::FileIndexOutOfRange { .. } => StatusCode::BAD_REQUEST,
        CoreError::MetadataUnavailable | CoreError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        CoreError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        CoreError::TooManyTorrents(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::InvalidListenAddr(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn core_error_response(e: CoreError, context: &str) -> Response {
    let status = core_error_status(&e);
    let sanitized = sanitize_error(&anyhow::Error::from(e), context);
    (status, Json(serde_json::json!({"error": sanitized}))).into_response()
}

fn bad_request(e: anyhow::Error, context: &str) -> Response {
    let sanitized = sanitize_error(&e, context);
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": sanitized}))).into_response()
}

fn install_panic_logger() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string payload>");
        match panic_info.location() {
            Some(at) => error!(file = at.file(), line = at.line(), "skiff-daemon panicked: {}", message),
            None => error!("skiff-daemon panicked: {}", message),
        }
    }));
}

/// `<home>/Downloads/Skiff`, or `./downloads` without a usable home directory.
fn download_dir_under(home: Option<std::ffi::OsString>) -> PathBuf {
    match home.filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home).join("Downloads").join("Skiff"),
        None => PathBuf::from("downloads"),
    }
}

fn default_download_dir() -> PathBuf {
    #[cfg(windows)]
    let home = std::env::var_os("USERPROFILE");
    #[cfg(not(windows))]
    let home = std::env::var_os("HOME");
    download_dir_under(home)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_panic_logger();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let admin_token = std::env::var("DAEMON_ADMIN_TOKEN").unwrap_or_default();
    if !admin_token.is_empty() && admin_token.len() < 32 {
        warn!("DAEMON_ADMIN_TOKEN is shorter than recommended 32 characters. Consider using a longer token for better security.");
    }
    let bind = std::env::var("DAEMON_BIND").unwrap_or_else(|_| "127.0.0.1:8734".to_string());
    let addr: SocketAddr = bind.parse().map_err(|e| anyhow::anyhow!("Invalid DAEMON_BIND '{}': {}", bind, e))?;

    if !addr.ip().is_loopback() && admin_token.is_empty() {
        return Err(anyhow::anyhow!(
            "SECURITY ERROR: Binding to non-localhost address {} requires DAEMON_ADMIN_TOKEN to be set.",
            addr.ip()
        ));
    }

    let download_dir = std::env::var_os("SKIFF_DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(default_download_dir);
    info!("Download directory: {}", download_dir.display());
    let config = config::load_config().await
        .unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {e:#}");
            config::DaemonConfig::default()
        });

    info!("Using listen port: {}", config.listen_port);
    tokio::fs::create_dir_all(&download_dir).await?;

    let engine = LocalEngine::new(config.local_listen_addr());
    let state = new_state(engine.clone(), config.port_mapping_settings());
    let discovery: Arc<dyn NatDiscovery> = Arc::new(upnp::UpnpDiscovery);

    if config.port_mapping_enabled {
        let s = state.clone();
        let d = discovery.clone();
        tokio::spawn(async move {
            if let Err(e) = refresh_port_mapping(&s, d.as_ref()).await {
                warn!("initial port mapping failed: {}", e);
            }
            start_port_mapping_loop(&s, d).await;
        });
    } else {
        info!("Port mapping disabled by config");
    }

    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));
    use axum::http::HeaderValue;
    let security_headers = (
        SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::overriding(
            axum::http::header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
    );
    const MAX_CONCURRENT_REQUESTS: usize = 100;

    let ctx = AppCtx {
        state: state.clone(),
        engine: engine.clone(),
        discovery,
        download_dir,
        port_mapping_enabled: config.port_mapping_enabled,
        admin_token,
        shutdown: shutdown_notify.clone(),
    };

    let app = Router::new()
        .route("/health", get(h_health))
        .route("/version", get(h_version))
        .route("/torrents", get(h_list_torrents).post(h_add_torrent))
        .route("/torrents/:id/start", post(h_start))
        .route("/torrents/:id/stop", post(h_stop))
        .route("/torrents/:id/recheck", post(h_recheck))
        .route("/torrents/:id/remove", post(h_remove))
        .route("/torrents/:id/files", get(h_files))
        .route("/torrents/:id/files/:index", get(h_get_file).patch(h_patch_file))
        .route("/torrents/:id/files/:index/rename", post(h_rename_file))
        .route("/torrents/:id/activity", get(h_activity))
        .route("/net/ports", get(h_ports))
        .route("/net/ports/check", get(h_ports_check))
        .route("/net/ports/refresh", post(h_ports_refresh))
        .route("/admin/shutdown", post(h_admin_shutdown))
        .with_state(ctx)
        .layer(axum::middleware::from_fn(require_json_body))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(14 * 1024 * 1024))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(security_headers.0)
        .layer(security_headers.1)
        .layer(security_headers.2);

    info!("skiff-daemon listening on {}", addr);

    let shutdown_signal = {
        let shutdown_notify = shutdown_notify.clone();
        let engine = engine.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received; shutting down");
                }
                _ = shutdown_notify.notified() => {
                    info!("admin shutdown requested");
                }
            }
            engine.shutdown();
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    stop_port_mapping_loop(&state).await;
    Ok(())
}

async fn h_health(State(ctx): State<AppCtx>) -> impl IntoResponse {
    let guard = ctx.state.lock().await;
    Json(health(&guard))
}

async fn h_version() -> impl IntoResponse {
    Json(version())
}

async fn h_list_torrents(State(ctx): State<AppCtx>) -> impl IntoResponse {
    let guard = ctx.state.lock().await;
    Json(list_torrents(&guard))
}

/// Verifies the torrent's content on a blocking thread and books the newly complete
/// pieces.
async fn recheck_and_record(ctx: &AppCtx, torrent: Arc<LocalTorrent>) -> anyhow::Result<usize> {
    use skiff_core::TorrentHandle;

    let hash = torrent.info_hash();
    let fresh = tokio::task::spawn_blocking(move || torrent.recheck())
        .await
        .map_err(|e| anyhow::anyhow!("verification task failed: {}", e))??;
    let mut guard = ctx.state.lock().await;
    for piece in &fresh {
        record_piece_completed(&mut guard, &hash, *piece)?;
    }
    Ok(fresh.len())
}

async fn h_add_torrent(
    State(ctx): State<AppCtx>,
    Json(req): Json<AddTorrentRequest>,
) -> impl IntoResponse {
    const MAX_BASE64_SIZE: usize = 13 * 1024 * 1024;
    const MAX_DECODED_SIZE: usize = 10 * 1024 * 1024;
    if req.torrent_b64.len() > MAX_BASE64_SIZE {
        return bad_request(anyhow::anyhow!("Torrent file too large (max 10MB)"), "Invalid add torrent request");
    }
    let bytes = match general_purpose::STANDARD.decode(req.torrent_b64.as_bytes()) {
        Ok(b) if b.len() <= MAX_DECODED_SIZE => b,
        Ok(_) => return bad_request(anyhow::anyhow!("Decoded torrent file too large (max 10MB)"), "Invalid add torrent request"),
        Err(e) => return bad_request(anyhow::Error::from(e).context("Invalid base64 torrent"), "Invalid add torrent request"),
    };
    let meta = match metainfo::parse_metainfo(&bytes) {
        Ok(m) => m,
        Err(e) => return bad_request(e, "Failed to parse torrent"),
    };

    let id = meta.info_hash.clone();
    if ctx.engine.get(&id).is_some() {
        return (StatusCode::OK, Json(serde_json::json!({"id": id}))).into_response();
    }

    let torrent = Arc::new(LocalTorrent::new(meta, ctx.download_dir.clone()));
    let name = torrent.name().to_string();
    {
        let mut guard = ctx.state.lock().await;
        if let Err(e) = add_torrent(&mut guard, torrent.clone()) {
            return core_error_response(e, "Failed to add torrent");
        }
    }
    ctx.engine.insert(torrent.clone());

    match recheck_and_record(&ctx, torrent).await {
        Ok(n) => info!("added {} ({}), {} pieces already on disk", name, id, n),
        Err(e) => warn!("initial verification of {} failed: {:#}", id, e),
    }

    (StatusCode::OK, Json(serde_json::json!({"id": id, "name": name}))).into_response()
}

async fn h_start(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let Some(torrent) = ctx.engine.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    torrent.set_active(true);
    let mut guard = ctx.state.lock().await;
    match torrent_started(&mut guard, &id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error_response(e, "Failed to start torrent"),
    }
}

async fn h_stop(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let Some(torrent) = ctx.engine.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Close the running segment before the engine reports the torrent idle.
    let result = {
        let mut guard = ctx.state.lock().await;
        torrent_stopped(&mut guard, &id)
    };
    torrent.set_active(false);
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error_response(e, "Failed to stop torrent"),
    }
}

async fn h_recheck(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let Some(torrent) = ctx.engine.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match recheck_and_record(&ctx, torrent).await {
        Ok(n) => (StatusCode::OK, Json(serde_json::json!({"newly_verified": n}))).into_response(),
        Err(e) => {
            let sanitized = sanitize_error(&e, "Failed to recheck torrent");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": sanitized}))).into_response()
        }
    }
}

async fn h_remove(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let Some(torrent) = ctx.engine.remove(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut guard = ctx.state.lock().await;
    if let Err(e) = torrent_stopped(&mut guard, &id) {
        warn!("closing activity of {} before removal failed: {}", id, e);
    }
    torrent.set_active(false);
    match remove_torrent(&mut guard, &id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error_response(e, "Failed to remove torrent"),
    }
}

async fn h_files(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let mut guard = ctx.state.lock().await;
    let count = match file_count(&mut guard, &id) {
        Ok(n) => n,
        Err(e) => return core_error_response(e, "Failed to list files"),
    };
    match files(&mut guard, &id) {
        Ok(list) => (StatusCode::OK, Json(serde_json::json!({"count": count, "files": list}))).into_response(),
        Err(e) => core_error_response(e, "Failed to list files"),
    }
}

async fn h_get_file(
    State(ctx): State<AppCtx>,
    Path((id, index)): Path<(String, usize)>,
) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let mut guard = ctx.state.lock().await;
    match get_file(&mut guard, &id, index) {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => core_error_response(e, "Failed to read file"),
    }
}

async fn h_patch_file(
    State(ctx): State<AppCtx>,
    Path((id, index)): Path<(String, usize)>,
    Json(req): Json<PatchFileRequest>,
) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let mut guard = ctx.state.lock().await;
    if let Err(e) = set_file_check(&mut guard, &id, index, req.check) {
        return core_error_response(e, "Failed to update file selection");
    }
    match get_file(&mut guard, &id, index) {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => core_error_response(e, "Failed to read file"),
    }
}

async fn h_rename_file(
    State(ctx): State<AppCtx>,
    Path((id, index)): Path<(String, usize)>,
    Json(req): Json<RenameFileRequest>,
) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let mut guard = ctx.state.lock().await;
    match rename_file(&mut guard, &id, index, &req.name) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error_response(e, "Failed to rename file"),
    }
}

async fn h_activity(State(ctx): State<AppCtx>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(id) = torrent_id(&id) else {
        return invalid_id();
    };
    let mut guard = ctx.state.lock().await;
    match activity(&mut guard, &id) {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => core_error_response(e, "Failed to read activity"),
    }
}

async fn h_ports(State(ctx): State<AppCtx>) -> impl IntoResponse {
    let guard = ctx.state.lock().await;
    Json(port_mapping(&guard))
}

async fn h_ports_check(State(ctx): State<AppCtx>) -> impl IntoResponse {
    let reachable = check_external_reachable(&ctx.state).await;
    Json(serde_json::json!({"reachable": reachable}))
}

/// Runs a cycle now and restarts the refresher so the next one is a full interval away.
async fn h_ports_refresh(State(ctx): State<AppCtx>) -> impl IntoResponse {
    if !ctx.port_mapping_enabled {
        return (StatusCode::CONFLICT, Json(serde_json::json!({
            "error": "Port mapping is disabled"
        }))).into_response();
    }
    let result = refresh_port_mapping(&ctx.state, ctx.discovery.as_ref()).await;
    start_port_mapping_loop(&ctx.state, ctx.discovery.clone()).await;
    match result {
        Ok(mapping) => (StatusCode::OK, Json(mapping)).into_response(),
        Err(e) => core_error_response(e, "Failed to refresh port mapping"),
    }
}

/// An empty configured token leaves shutdown open, which is only allowed on loopback.
fn admin_token_accepted(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

async fn h_admin_shutdown(State(ctx): State<AppCtx>, headers: HeaderMap) -> impl IntoResponse {
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !admin_token_accepted(&ctx.admin_token, provided) {
        warn!("rejected admin shutdown: bad token");
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response();
    }
    info!("admin shutdown accepted");
    ctx.shutdown.notify_waiters();
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torrent_ids_are_info_hashes() {
        assert_eq!(torrent_id(&"ab".repeat(20)), Some("ab".repeat(20)));
        assert_eq!(torrent_id(&"aB".repeat(20)), Some("ab".repeat(20)));
        assert_eq!(torrent_id(&"ab".repeat(16)), None);
        assert_eq!(torrent_id(&"zz".repeat(20)), None);
        assert_eq!(torrent_id("../../etc/passwd"), None);
    }

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), value.parse().expect("header value"));
        }
        map
    }

    #[test]
    fn json_bodies_need_a_json_content_type() {
        let json = headers(&[(header::CONTENT_LENGTH, "12"), (header::CONTENT_TYPE, "application/json; charset=utf-8")]);
        assert_eq!(content_type_rejection(&Method::POST, &json), None);

        let form = headers(&[(header::CONTENT_LENGTH, "12"), (header::CONTENT_TYPE, "text/plain")]);
        assert_eq!(
            content_type_rejection(&Method::PATCH, &form).map(|r| r.0),
            Some(StatusCode::UNSUPPORTED_MEDIA_TYPE)
        );

        let untyped = headers(&[(header::CONTENT_LENGTH, "12")]);
        assert_eq!(
            content_type_rejection(&Method::POST, &untyped).map(|r| r.0),
            Some(StatusCode::BAD_REQUEST)
        );

        // Empty POSTs (start, stop, refresh) and reads pass untouched.
        assert_eq!(content_type_rejection(&Method::POST, &headers(&[(header::CONTENT_LENGTH, "0")])), None);
        assert_eq!(content_type_rejection(&Method::POST, &HeaderMap::new()), None);
        assert_eq!(content_type_rejection(&Method::GET, &form), None);
    }

    #[test]
    fn admin_token_must_match_exactly() {
        assert!(admin_token_accepted("", ""));
        assert!(admin_token_accepted("", "anything"));
        assert!(admin_token_accepted("s3cret-token", "s3cret-token"));
        assert!(!admin_token_accepted("s3cret-token", "s3cret-toke"));
        assert!(!admin_token_accepted("s3cret-token", "S3cret-token"));
        assert!(!admin_token_accepted("s3cret-token", ""));
    }

    #[test]
    fn download_dir_falls_back_without_home() {
        assert_eq!(
            download_dir_under(Some("/home/ada".into())),
            PathBuf::from("/home/ada").join("Downloads").join("Skiff")
        );
        assert_eq!(download_dir_under(Some("".into())), PathBuf::from("downloads"));
        assert_eq!(download_dir_under(None), PathBuf::from("downloads"));
    }

    #[test]
    fn core_errors_map_to_http_status() {
        assert_eq!(core_error_status(&CoreError::TorrentNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            core_error_status(&CoreError::FileIndexOutOfRange { index: 3, count: 2 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(core_error_status(&CoreError::MetadataUnavailable), StatusCode::CONFLICT);
        assert_eq!(core_error_status(&CoreError::Unsupported("rename_file")), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn sanitized_errors_hide_secrets_and_stay_short() {
        let e = anyhow::anyhow!("bad token abc");
        assert_eq!(sanitize_error(&e, "ctx"), "An error occurred");

        let long = anyhow::anyhow!("{}", "é".repeat(300));
        let out = sanitize_error(&long, "ctx");
        assert!(out.ends_with("..."));
        assert!(out.len() <= 203);
    }
}

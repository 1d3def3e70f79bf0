//! Admin and controller HTTP API
//!
//! Two authentication realms share one router:
//! - `/api/report` and `/api/node/whitelist` authenticate nodes by bearer
//!   token against the fleet registry
//! - everything else is operator-facing and requires the admin password via
//!   basic auth
//!
//! Node management is only available in master mode; in node mode those
//! endpoints answer 400. Error bodies are always `{"error": "..."}` with no
//! further detail.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{GuardConfig, Settings};
use crate::nodes::{NodeRecord, NodeRegistry, NodeStatus};
use crate::store::{LogEvent, Store};

/// Admin API state. `registry` is populated in master mode only.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<GuardConfig>,
    pub store: Arc<Store>,
    pub registry: Option<Arc<NodeRegistry>>,
    pub settings: Settings,
}

/// Body of a node report; the same shape the reporter serializes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub total_requests: usize,
    #[serde(default)]
    pub trusted_count: usize,
    #[serde(default)]
    pub blocked_count: usize,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub logs: Vec<LogEvent>,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    let node_api = Router::new()
        .route("/api/report", post(node_report))
        .route("/api/node/whitelist", get(node_whitelist_pull));

    let operator_api = Router::new()
        .route("/api/stats", get(stats))
        .route("/api/logs", get(logs))
        .route("/api/logs/summary", get(logs_summary))
        .route("/api/logs/cleanup", post(logs_cleanup))
        .route("/api/whitelist", get(whitelist_list).post(whitelist_add))
        .route("/api/whitelist/:hash", delete(whitelist_delete))
        .route("/api/settings", get(settings_get).post(settings_update))
        .route("/api/nodes", get(nodes_list).post(nodes_add))
        .route(
            "/api/nodes/:id",
            get(nodes_get).put(nodes_update).delete(nodes_delete),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            basic_auth_middleware,
        ));

    node_api
        .merge(operator_api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

/// Operator authentication: any username, password must match the config.
async fn basic_auth_middleware(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if basic_password(&headers).as_deref() == Some(state.config.admin_password.as_str()) {
        return next.run(request).await;
    }
    let mut response = json_error(StatusCode::UNAUTHORIZED, "unauthorized");
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"JA3Gate\""),
    );
    response
}

fn basic_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split_once(':').map(|(_, pass)| pass.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve the fleet registry or reject with 400 outside master mode.
fn registry(state: &AdminState) -> Result<&Arc<NodeRegistry>, Response> {
    state.registry.as_ref().ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "only available in master mode",
        )
    })
}

/// Authenticate a node call; unknown and missing tokens are both 401.
fn authenticate_node(state: &AdminState, headers: &HeaderMap) -> Result<NodeRecord, Response> {
    let registry = registry(state)?;
    let Some(token) = bearer_token(headers) else {
        return Err(json_error(StatusCode::UNAUTHORIZED, "missing token"));
    };
    registry
        .get_by_token(&token)
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "invalid token"))
}

// --- node API (token auth) ---

async fn node_report(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(report): Json<ReportPayload>,
) -> Response {
    let node = match authenticate_node(&state, &headers) {
        Ok(node) => node,
        Err(resp) => return resp,
    };

    if let Some(registry) = state.registry.as_ref() {
        registry.update_status(
            &node.id,
            NodeStatus {
                version: report.version.clone(),
                uptime: report.uptime,
                total_requests: report.total_requests,
                trusted_count: report.trusted_count,
                blocked_count: report.blocked_count,
                domain: report.domain.clone(),
                upstream: report.upstream.clone(),
                ..NodeStatus::default()
            },
        );
    }

    // Merge the node's log delta into the controller store. Timestamps are
    // kept as reported; duplicates are tolerated because aggregation is
    // count-based.
    for event in &report.logs {
        state.store.append_event(event);
    }
    if !report.logs.is_empty() {
        info!(
            "report from {}: {} events, {} total requests",
            node.name,
            report.logs.len(),
            report.total_requests
        );
    }

    Json(json!({ "status": "ok", "whitelist": state.store.list_allowed() })).into_response()
}

async fn node_whitelist_pull(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate_node(&state, &headers) {
        return resp;
    }
    Json(json!({ "whitelist": state.store.list_allowed() })).into_response()
}

// --- operator API (basic auth) ---

async fn stats(State(state): State<AdminState>) -> Response {
    Json(state.store.counters()).into_response()
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: usize,
    #[serde(default)]
    size: usize,
}

async fn logs(State(state): State<AdminState>, Query(query): Query<PageQuery>) -> Response {
    let page = query.page.max(1);
    let size = if (1..=200).contains(&query.size) {
        query.size
    } else {
        50
    };
    let (logs, total) = state.store.page_events(page, size);
    Json(json!({ "logs": logs, "total": total, "page": page, "size": size })).into_response()
}

async fn logs_summary(State(state): State<AdminState>) -> Response {
    Json(json!({ "summaries": state.store.aggregate_by_digest() })).into_response()
}

#[derive(Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    days: i64,
}

async fn logs_cleanup(
    State(state): State<AdminState>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    let days = if query.days < 1 { 30 } else { query.days };
    match state.store.prune(days) {
        Ok(removed) => Json(json!({ "status": "ok", "removed": removed })).into_response(),
        Err(e) => {
            warn!("log cleanup failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "cleanup failed")
        }
    }
}

async fn whitelist_list(State(state): State<AdminState>) -> Response {
    Json(json!({ "entries": state.store.list_allowed() })).into_response()
}

#[derive(Deserialize)]
struct WhitelistAddBody {
    ja3_hash: String,
    #[serde(default)]
    note: String,
}

async fn whitelist_add(
    State(state): State<AdminState>,
    Json(body): Json<WhitelistAddBody>,
) -> Response {
    if body.ja3_hash.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "ja3_hash must not be empty");
    }
    match state.store.add_allowed(&body.ja3_hash, &body.note) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!("whitelist add failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store error")
        }
    }
}

async fn whitelist_delete(State(state): State<AdminState>, Path(hash): Path<String>) -> Response {
    match state.store.remove_allowed(&hash) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!("whitelist delete failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store error")
        }
    }
}

async fn settings_get(State(state): State<AdminState>) -> Response {
    Json(json!({
        "mode": state.config.mode,
        "log_enabled": state.settings.log_enabled(),
        "upstream": state.config.upstream,
        "domain": state.config.domain,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct SettingsBody {
    log_enabled: Option<bool>,
}

async fn settings_update(
    State(state): State<AdminState>,
    Json(body): Json<SettingsBody>,
) -> Response {
    if let Some(enabled) = body.log_enabled {
        state.settings.set_log_enabled(enabled);
        info!("request logging {}", if enabled { "enabled" } else { "disabled" });
    }
    Json(json!({ "status": "ok" })).into_response()
}

// --- fleet registry (basic auth, master mode) ---

async fn nodes_list(State(state): State<AdminState>) -> Response {
    match registry(&state) {
        Ok(registry) => Json(json!({ "nodes": registry.list() })).into_response(),
        Err(resp) => resp,
    }
}

async fn nodes_add(State(state): State<AdminState>, Json(node): Json<NodeRecord>) -> Response {
    let registry = match registry(&state) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match registry.add(node) {
        Ok(id) => Json(json!({ "status": "ok", "id": id })).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn nodes_get(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let registry = match registry(&state) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match registry.get(&id) {
        Some(node) => Json(node).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "node not found"),
    }
}

async fn nodes_update(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(node): Json<NodeRecord>,
) -> Response {
    let registry = match registry(&state) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match registry.update(&id, node) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn nodes_delete(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let registry = match registry(&state) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match registry.remove(&id) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine as _;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn master_state(dir: &TempDir) -> AdminState {
        let config = GuardConfig {
            mode: crate::config::Mode::Master,
            admin_password: "hunter2".to_string(),
            ..GuardConfig::default()
        };
        AdminState {
            config: Arc::new(config),
            store: Arc::new(Store::open(dir.path()).unwrap()),
            registry: Some(Arc::new(NodeRegistry::open(dir.path()).unwrap())),
            settings: Settings::new(true),
        }
    }

    fn basic_auth(password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("admin:{password}"))
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_with_auth(uri: &str, auth: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn operator_api_requires_basic_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(master_state(&dir));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(get_with_auth("/api/stats", &basic_auth("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(get_with_auth("/api/stats", &basic_auth("hunter2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_requests"], 0);
    }

    #[tokio::test]
    async fn whitelist_crud_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = master_state(&dir);
        let app = router(state.clone());
        let auth = basic_auth("hunter2");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/whitelist")
                    .header(header::AUTHORIZATION, &auth)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"ja3_hash":"abc123","note":"laptop"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.is_allowed("abc123"));

        let response = app
            .clone()
            .oneshot(get_with_auth("/api/whitelist", &auth))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["entries"][0]["ja3_hash"], "abc123");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/whitelist/abc123")
                    .header(header::AUTHORIZATION, &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.store.is_allowed("abc123"));

        // empty hash rejected
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/whitelist")
                    .header(header::AUTHORIZATION, &auth)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"ja3_hash":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn report_requires_valid_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = master_state(&dir);
        let app = router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/api/report")
            .header(header::AUTHORIZATION, "Bearer tk_unknown")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"version":"1.0.0","logs":[{"ts":"2026-01-01 10:00:00","ip":"1.1.1.1","ja3":"aaa","ua":"x","ok":true}]}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.store.read_events().is_empty());
    }

    #[tokio::test]
    async fn report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = master_state(&dir);
        let registry = state.registry.clone().unwrap();
        let id = registry
            .add(NodeRecord {
                name: "tokyo-1".to_string(),
                host: "198.51.100.7".to_string(),
                ..NodeRecord::default()
            })
            .unwrap();
        let token = registry.get(&id).unwrap().token;
        state.store.add_allowed("bbb", "master entry").unwrap();

        let app = router(state.clone());
        let payload = ReportPayload {
            version: "1.0.0".to_string(),
            uptime: 120,
            total_requests: 2,
            trusted_count: 1,
            blocked_count: 1,
            domain: "sub.example.com".to_string(),
            upstream: "http://10.0.0.1".to_string(),
            logs: vec![
                LogEvent {
                    timestamp: "2026-01-01 10:00:00".to_string(),
                    client_ip: "1.1.1.1".to_string(),
                    ja3_hash: "aaa".to_string(),
                    ua: "clash".to_string(),
                    trusted: false,
                },
                LogEvent {
                    timestamp: "2026-01-01 10:00:01".to_string(),
                    client_ip: "2.2.2.2".to_string(),
                    ja3_hash: "bbb".to_string(),
                    ua: "clash".to_string(),
                    trusted: true,
                },
            ],
        };

        let request = Request::builder()
            .method("POST")
            .uri("/api/report")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["whitelist"][0]["ja3_hash"], "bbb");

        // events merged with their original timestamps
        let events = state.store.read_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, "2026-01-01 10:00:00");

        // liveness updated
        let views = registry.list();
        assert!(views[0].online);
        assert_eq!(views[0].status.as_ref().unwrap().total_requests, 2);
        assert_eq!(views[0].status.as_ref().unwrap().domain, "sub.example.com");
    }

    #[tokio::test]
    async fn node_endpoints_rejected_outside_master_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = master_state(&dir);
        state.registry = None;
        let app = router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/report")
            .header(header::AUTHORIZATION, "Bearer tk_x")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_toggle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = master_state(&dir);
        let app = router(state.clone());
        let auth = basic_auth("hunter2");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/settings")
                    .header(header::AUTHORIZATION, &auth)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"log_enabled":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.settings.log_enabled());

        let response = app
            .oneshot(get_with_auth("/api/settings", &auth))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["log_enabled"], false);
        assert_eq!(body["mode"], "master");
    }

    #[tokio::test]
    async fn node_whitelist_pull_by_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = master_state(&dir);
        let registry = state.registry.clone().unwrap();
        let id = registry
            .add(NodeRecord {
                name: "osaka-1".to_string(),
                host: "198.51.100.8".to_string(),
                ..NodeRecord::default()
            })
            .unwrap();
        let token = registry.get(&id).unwrap().token;
        state.store.add_allowed("ccc", "entry").unwrap();

        let app = router(state);
        let response = app
            .clone()
            .oneshot(get_with_auth(
                "/api/node/whitelist",
                &format!("Bearer {token}"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["whitelist"][0]["ja3_hash"], "ccc");

        let response = app
            .oneshot(get_with_auth("/api/node/whitelist", "Bearer nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

//! Reverse-proxy request director
//!
//! Every request is rewritten toward the single configured origin in a fixed
//! order: record the original Host, strip any client-forged trust headers,
//! snapshot the allow-list verdict for the connection's JA3 digest, inject
//! the standard forwarding headers, append a log event, then inject the
//! trust headers. The shared secret is what makes `X-JA3-Trusted`
//! trustworthy for the origin: a client talking to the origin directly
//! cannot present it.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version},
    response::IntoResponse,
    Router,
};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::listener::GuardConnection;
use crate::store::Store;

/// Trust headers injected toward the origin. Client-supplied values under
/// these names are always deleted first.
pub const HEADER_JA3_HASH: &str = "x-ja3-hash";
pub const HEADER_JA3_TRUSTED: &str = "x-ja3-trusted";
pub const HEADER_GUARD_SECRET: &str = "x-guard-secret";

/// Hop-by-hop headers that never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state of the data plane.
#[derive(Clone)]
pub struct ProxyState {
    /// Origin base URL without a trailing slash, e.g. "http://127.0.0.1:8080"
    upstream_base: String,
    guard_secret: String,
    store: Arc<Store>,
    settings: Settings,
    client: Client<HttpConnector, Body>,
}

impl ProxyState {
    pub fn new(upstream: &str, guard_secret: &str, store: Arc<Store>, settings: Settings) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build_http();
        Self {
            upstream_base: upstream.trim_end_matches('/').to_string(),
            guard_secret: guard_secret.to_string(),
            store,
            settings,
            client,
        }
    }
}

/// Build the data-plane router: every path falls through to the director.
pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Derive the client IP from the remote endpoint: strip the trailing port,
/// keep the IPv6 bracket form.
pub fn client_ip(conn: &GuardConnection) -> String {
    let remote = conn.remote_addr.to_string();
    match remote.rsplit_once(':') {
        Some((ip, _)) => ip.to_string(),
        None => remote,
    }
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(conn): ConnectInfo<GuardConnection>,
    req: Request<Body>,
) -> Response<Body> {
    // 1. The original Host is restored toward the origin and echoed in
    //    X-Forwarded-Host
    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target: Uri = match format!("{}{}", state.upstream_base, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!("failed to build upstream URI for {}: {}", path_and_query, e);
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = target;
    // The upstream leg is always HTTP/1.1 regardless of the client protocol
    parts.version = Version::HTTP_11;

    for name in HOP_BY_HOP {
        parts.headers.remove(*name);
    }

    // 2. Drop anything the client tried to smuggle under the trust names
    parts.headers.remove(HEADER_JA3_TRUSTED);
    parts.headers.remove(HEADER_JA3_HASH);
    parts.headers.remove(HEADER_GUARD_SECRET);

    // 3./4. Digest comes from the connection context; the verdict is
    // snapshotted once per request
    let digest = conn.ja3_hash.clone();
    let trusted = state.store.is_allowed(&digest);

    // 5. Client IP for the origin's logs
    let ip = client_ip(&conn);

    // 6. Standard reverse-proxy headers, then the original Host
    parts.headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static("https"),
    );
    if let Ok(v) = HeaderValue::from_str(&ip) {
        parts.headers.insert("x-real-ip", v);
    }
    if let Ok(v) = HeaderValue::from_str(&original_host) {
        parts.headers.insert("x-forwarded-host", v.clone());
        parts.headers.insert(header::HOST, v);
    }

    // 7. Audit trail (toggle consulted per request)
    if state.settings.log_enabled() {
        state.store.log_request(&ip, &digest, &user_agent, trusted);
    }

    // 8.-10. Trust headers toward the origin
    if let Ok(v) = HeaderValue::from_str(&digest) {
        parts.headers.insert(HEADER_JA3_HASH, v);
    }
    parts.headers.insert(
        HEADER_JA3_TRUSTED,
        HeaderValue::from_static(if trusted { "1" } else { "0" }),
    );
    match HeaderValue::from_str(&state.guard_secret) {
        Ok(v) => {
            parts.headers.insert(HEADER_GUARD_SECRET, v);
        }
        Err(e) => warn!("guard_secret is not a valid header value: {}", e),
    }

    debug!(
        "proxying {} {} (ja3={}, trusted={})",
        parts.method, parts.uri, digest, trusted
    );

    match state.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => {
            // Stream the origin response back unchanged
            let (parts, incoming) = response.into_parts();
            Response::from_parts(parts, Body::new(incoming))
        }
        Err(e) => {
            warn!("upstream error: {}", e);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

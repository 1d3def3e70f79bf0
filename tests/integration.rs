//! Integration tests for JA3Gate
//!
//! Drives a real controller (admin router served over TCP) and a node-side
//! reporter against it, verifying the report round trip: log delta upload,
//! liveness update, and allow-list reconciliation.

use std::net::SocketAddr;
use std::sync::Arc;

use ja3gate::admin::{self, AdminState};
use ja3gate::config::{GuardConfig, Mode, Settings};
use ja3gate::nodes::{NodeRecord, NodeRegistry};
use ja3gate::reporter::Reporter;
use ja3gate::store::{LogEvent, Store};

struct Controller {
    addr: SocketAddr,
    store: Arc<Store>,
    registry: Arc<NodeRegistry>,
    _dir: tempfile::TempDir,
}

async fn spawn_controller() -> Controller {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let registry = Arc::new(NodeRegistry::open(dir.path()).unwrap());

    let config = GuardConfig {
        mode: Mode::Master,
        admin_password: "hunter2".to_string(),
        ..GuardConfig::default()
    };
    let app = admin::router(AdminState {
        config: Arc::new(config),
        store: store.clone(),
        registry: Some(registry.clone()),
        settings: Settings::new(true),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Controller {
        addr,
        store,
        registry,
        _dir: dir,
    }
}

fn node_event(ts: &str, ip: &str, hash: &str, trusted: bool) -> LogEvent {
    LogEvent {
        timestamp: ts.to_string(),
        client_ip: ip.to_string(),
        ja3_hash: hash.to_string(),
        ua: "clash-verge/2.0".to_string(),
        trusted,
    }
}

fn node_config(addr: SocketAddr, token: &str) -> GuardConfig {
    GuardConfig {
        mode: Mode::Node,
        domain: "sub.example.com".to_string(),
        upstream: "http://127.0.0.1:8080".to_string(),
        admin_password: "pw".to_string(),
        guard_secret: "s3cret".to_string(),
        master_url: format!("http://{addr}"),
        node_token: token.to_string(),
        node_name: "tokyo-1".to_string(),
        ..GuardConfig::default()
    }
}

#[tokio::test]
async fn report_round_trip_merges_logs_and_reconciles_allow_list() {
    let controller = spawn_controller().await;
    controller.store.add_allowed("bbb", "ops laptop").unwrap();

    let node_id = controller
        .registry
        .add(NodeRecord {
            name: "tokyo-1".to_string(),
            host: "198.51.100.7".to_string(),
            ..NodeRecord::default()
        })
        .unwrap();
    let token = controller.registry.get(&node_id).unwrap().token;

    // Node with a local-only allow-list entry and two logged requests
    let node_dir = tempfile::tempdir().unwrap();
    let node_store = Arc::new(Store::open(node_dir.path()).unwrap());
    node_store.add_allowed("aaa", "stale local").unwrap();
    node_store.append_event(&node_event("2026-01-01 10:00:00", "1.1.1.1", "aaa", true));
    node_store.append_event(&node_event("2026-01-01 10:00:01", "2.2.2.2", "ccc", false));

    let config = Arc::new(node_config(controller.addr, &token));
    let mut reporter = Reporter::new(config, node_store.clone()).unwrap();
    reporter.report_once().await.unwrap();

    // Controller received the log delta with original timestamps
    let merged = controller.store.read_events();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].timestamp, "2026-01-01 10:00:00");
    assert_eq!(merged[1].ja3_hash, "ccc");

    // Node allow-list now mirrors the controller's
    let entries = node_store.list_allowed();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ja3_hash, "bbb");
    assert_eq!(entries[0].note, "[master] ops laptop");
    assert!(!node_store.is_allowed("aaa"));

    // Liveness reflects the report
    let views = controller.registry.list();
    assert!(views[0].online);
    let status = views[0].status.as_ref().unwrap();
    assert_eq!(status.total_requests, 2);
    assert_eq!(status.domain, "sub.example.com");

    // A second tick has nothing new to upload; the controller log stays put
    reporter.report_once().await.unwrap();
    assert_eq!(controller.store.read_events().len(), 2);
}

#[tokio::test]
async fn report_with_unknown_token_is_rejected() {
    let controller = spawn_controller().await;

    let node_dir = tempfile::tempdir().unwrap();
    let node_store = Arc::new(Store::open(node_dir.path()).unwrap());
    node_store.add_allowed("aaa", "local").unwrap();
    node_store.append_event(&node_event("2026-01-01 10:00:00", "1.1.1.1", "aaa", true));

    let config = Arc::new(node_config(controller.addr, "tk_forged"));
    let mut reporter = Reporter::new(config, node_store.clone()).unwrap();
    assert!(reporter.report_once().await.is_err());

    // Nothing leaked into the controller, nothing reconciled away locally
    assert!(controller.store.read_events().is_empty());
    assert!(node_store.is_allowed("aaa"));

    // The same tail is retried after the failure
    reporter.report_once().await.err().unwrap();
}

#[tokio::test]
async fn node_pulls_whitelist_with_token() {
    let controller = spawn_controller().await;
    controller.store.add_allowed("ddd", "entry").unwrap();

    let node_id = controller
        .registry
        .add(NodeRecord {
            name: "osaka-1".to_string(),
            host: "198.51.100.8".to_string(),
            ..NodeRecord::default()
        })
        .unwrap();
    let token = controller.registry.get(&node_id).unwrap().token;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/node/whitelist", controller.addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["whitelist"][0]["ja3_hash"], "ddd");

    let response = client
        .get(format!("http://{}/api/node/whitelist", controller.addr))
        .bearer_auth("tk_wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

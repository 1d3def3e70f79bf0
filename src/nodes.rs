//! Fleet registry: node records, tokens, and liveness (controller side)
//!
//! Node records persist in `nodes.json` (mode 0600 - the file carries
//! deployment credentials that are opaque to this crate). A token index
//! gives O(1) authentication of `/api/report` calls. Liveness is in-memory
//! only: populated on first report, flipped offline by a sweeper, never
//! deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::now_timestamp;

/// Nodes are marked offline after missing three default report intervals.
pub const OFFLINE_AFTER_SECS: i64 = 180;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A registered proxy node. `id` and `created_at` are immutable after
/// insert; `token` authenticates the node on every controller API call.
/// `ssh_credentials` belongs to the out-of-tree deployment tooling and is
/// carried verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub ssh_credentials: serde_json::Value,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub note: String,
    /// Optional defaults used when generating a node config
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub upstream: String,
}

/// Last reported state of a node, kept in memory only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub online: bool,
    pub last_heartbeat: String,
    pub version: String,
    pub uptime: i64,
    pub total_requests: usize,
    pub trusted_count: usize,
    pub blocked_count: usize,
    pub domain: String,
    pub upstream: String,
}

/// Node record joined with liveness for listings.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub record: NodeRecord,
    pub online: bool,
    pub last_heartbeat: String,
    pub status: Option<NodeStatus>,
}

struct RegistryInner {
    nodes: Vec<NodeRecord>,
    by_token: HashMap<String, String>, // token -> node id
}

/// Persistent node registry with an in-memory liveness map.
pub struct NodeRegistry {
    data_dir: PathBuf,
    inner: RwLock<RegistryInner>,
    statuses: RwLock<HashMap<String, NodeStatus>>,
}

fn generate_id() -> String {
    format!("node_{}", hex::encode(rand::random::<[u8; 8]>()))
}

fn generate_token() -> String {
    format!("tk_{}", hex::encode(rand::random::<[u8; 16]>()))
}

impl NodeRegistry {
    /// Open the registry; a missing or malformed `nodes.json` starts empty.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let registry = Self {
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(RegistryInner {
                nodes: Vec::new(),
                by_token: HashMap::new(),
            }),
            statuses: RwLock::new(HashMap::new()),
        };
        registry.load();
        Ok(registry)
    }

    fn nodes_path(&self) -> PathBuf {
        self.data_dir.join("nodes.json")
    }

    fn load(&self) {
        let Ok(data) = std::fs::read_to_string(self.nodes_path()) else {
            return;
        };
        let Ok(nodes) = serde_json::from_str::<Vec<NodeRecord>>(&data) else {
            return;
        };
        let mut inner = self.inner.write();
        inner.by_token = nodes
            .iter()
            .map(|n| (n.token.clone(), n.id.clone()))
            .collect();
        inner.nodes = nodes;
    }

    fn save(&self, nodes: &[NodeRecord]) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(nodes)?;
        let path = self.nodes_path();
        std::fs::write(&path, data)?;
        // Node tokens and deployment credentials live here
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Register a node. Name must be unique; id, token, and created_at are
    /// assigned when absent. Returns the assigned id.
    pub fn add(&self, mut node: NodeRecord) -> anyhow::Result<String> {
        if node.name.is_empty() {
            anyhow::bail!("node name must not be empty");
        }
        if node.host.is_empty() {
            anyhow::bail!("node host must not be empty");
        }

        let mut inner = self.inner.write();
        if inner.nodes.iter().any(|n| n.name == node.name) {
            anyhow::bail!("node name already exists: {}", node.name);
        }

        node.id = generate_id();
        if node.token.is_empty() {
            node.token = generate_token();
        }
        node.created_at = now_timestamp();

        let id = node.id.clone();
        inner.by_token.insert(node.token.clone(), id.clone());
        inner.nodes.push(node);
        self.save(&inner.nodes)?;
        Ok(id)
    }

    /// Update a node record, preserving id, created_at, and - when the
    /// update omits them - token and SSH credentials.
    pub fn update(&self, id: &str, mut updated: NodeRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.nodes.iter().position(|n| n.id == id) else {
            anyhow::bail!("node not found: {}", id);
        };

        let existing = &inner.nodes[pos];
        updated.id = existing.id.clone();
        updated.created_at = existing.created_at.clone();
        if updated.token.is_empty() {
            updated.token = existing.token.clone();
        }
        if updated.ssh_credentials.is_null() {
            updated.ssh_credentials = existing.ssh_credentials.clone();
        }

        let old_token = existing.token.clone();
        inner.by_token.remove(&old_token);
        inner.by_token.insert(updated.token.clone(), id.to_string());
        inner.nodes[pos] = updated;
        self.save(&inner.nodes)
    }

    /// Delete a node and its liveness entry.
    pub fn remove(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        let before = inner.nodes.len();
        inner.nodes.retain(|n| n.id != id);
        if inner.nodes.len() == before {
            anyhow::bail!("node not found: {}", id);
        }
        inner.by_token.retain(|_, v| v.as_str() != id);
        self.statuses.write().remove(id);
        self.save(&inner.nodes)
    }

    pub fn get(&self, id: &str) -> Option<NodeRecord> {
        self.inner.read().nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Authenticate by bearer token. O(1) average via the token index.
    pub fn get_by_token(&self, token: &str) -> Option<NodeRecord> {
        if token.is_empty() {
            return None;
        }
        let inner = self.inner.read();
        let id = inner.by_token.get(token)?;
        inner.nodes.iter().find(|n| &n.id == id).cloned()
    }

    /// All nodes joined with their liveness.
    pub fn list(&self) -> Vec<NodeView> {
        let inner = self.inner.read();
        let statuses = self.statuses.read();
        inner
            .nodes
            .iter()
            .map(|n| {
                let status = statuses.get(&n.id).cloned();
                let (online, last_heartbeat) = status
                    .as_ref()
                    .map(|s| (s.online, s.last_heartbeat.clone()))
                    .unwrap_or((false, String::new()));
                NodeView {
                    record: n.clone(),
                    online,
                    last_heartbeat,
                    status,
                }
            })
            .collect()
    }

    /// Record a report from a node: refresh the heartbeat and stash the
    /// reported snapshot.
    pub fn update_status(&self, node_id: &str, mut status: NodeStatus) {
        status.node_id = node_id.to_string();
        status.online = true;
        status.last_heartbeat = now_timestamp();
        self.statuses.write().insert(node_id.to_string(), status);
    }

    /// Mark nodes offline whose heartbeat is older than `timeout_secs`.
    /// Records and accumulated log events are untouched.
    pub fn sweep_offline(&self, timeout_secs: i64) {
        let now = chrono::Utc::now().naive_utc();
        let mut statuses = self.statuses.write();
        for status in statuses.values_mut() {
            if !status.online || status.last_heartbeat.is_empty() {
                continue;
            }
            if let Ok(hb) =
                NaiveDateTime::parse_from_str(&status.last_heartbeat, "%Y-%m-%d %H:%M:%S")
            {
                if (now - hb).num_seconds() > timeout_secs {
                    debug!("marking node {} offline", status.node_id);
                    status.online = false;
                }
            }
        }
    }

    /// Periodic offline sweep, running until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "offline sweeper started (timeout {}s, every {:?})",
            OFFLINE_AFTER_SECS, SWEEP_INTERVAL
        );
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep_offline(OFFLINE_AFTER_SECS),
            }
        }
    }
}

//! Configuration loading and validation
//!
//! The configuration is a single JSON document (the same file the fleet
//! controller pushes to nodes), deserialized with serde defaults so a minimal
//! document stays minimal. Validation runs once at startup; a failure exits
//! the process before any listener binds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Operating mode of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fleet controller: collects reports, owns the canonical allow-list
    Master,
    /// Proxy node: terminates TLS, fingerprints, forwards to the origin
    #[default]
    Node,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Operating mode: "master" or "node"
    pub mode: Mode,
    /// Public domain (used for the ACME certificate and SNI)
    pub domain: String,
    /// Origin URL requests are forwarded to, e.g. "http://127.0.0.1:8080"
    pub upstream: String,
    /// HTTPS listen address (":443" shorthand accepted)
    pub listen_https: String,
    /// Admin API listen address
    pub listen_admin: String,
    /// Operator password for the admin API (basic auth)
    pub admin_password: String,
    /// Shared secret injected as X-Guard-Secret toward the origin
    pub guard_secret: String,
    /// ACME account email
    pub acme_email: String,
    /// Data directory (allow-list, event log, certificates, node registry)
    pub data_dir: PathBuf,
    /// Whether proxied requests are appended to the event log
    pub log_enabled: bool,
    /// Controller base URL a node reports to
    pub master_url: String,
    /// Bearer token authenticating this node against the controller
    pub node_token: String,
    /// Display name of this node
    pub node_name: String,
    /// Report interval in seconds (values below 10 fall back to 60)
    pub report_interval: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Node,
            domain: String::new(),
            upstream: String::new(),
            listen_https: ":443".to_string(),
            listen_admin: ":8443".to_string(),
            admin_password: String::new(),
            guard_secret: String::new(),
            acme_email: String::new(),
            data_dir: PathBuf::from("/data"),
            log_enabled: true,
            master_url: String::new(),
            node_token: String::new(),
            node_name: String::new(),
            report_interval: 60,
        }
    }
}

impl GuardConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: GuardConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate mode-dependent requirements.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.admin_password.is_empty() {
            anyhow::bail!("admin_password must not be empty");
        }
        if self.mode == Mode::Node {
            if self.domain.is_empty() {
                anyhow::bail!("domain must not be empty in node mode");
            }
            if self.upstream.is_empty() {
                anyhow::bail!("upstream must not be empty in node mode");
            }
            if self.guard_secret.is_empty() {
                anyhow::bail!("guard_secret must not be empty in node mode");
            }
        }
        Ok(())
    }

    /// Effective report interval: floor of 10 s, misconfigured values fall
    /// back to the 60 s default.
    pub fn effective_report_interval(&self) -> u64 {
        if self.report_interval < 10 {
            60
        } else {
            self.report_interval
        }
    }

    /// Whether the HTTPS data plane should run (a controller-only deployment
    /// may have no domain/upstream at all).
    pub fn proxy_enabled(&self) -> bool {
        !self.domain.is_empty() && !self.upstream.is_empty()
    }

    pub fn https_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.listen_https)
    }

    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.listen_admin)
    }
}

/// Parse a listen address, accepting the ":443" shorthand for all interfaces.
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

/// Runtime-mutable settings shared between the admin API and the proxy
/// director. Only `log_enabled` is togglable today.
#[derive(Clone)]
pub struct Settings {
    log_enabled: Arc<AtomicBool>,
}

impl Settings {
    pub fn new(log_enabled: bool) -> Self {
        Self {
            log_enabled: Arc::new(AtomicBool::new(log_enabled)),
        }
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled.load(Ordering::Relaxed)
    }

    pub fn set_log_enabled(&self, v: bool) {
        self.log_enabled.store(v, Ordering::Relaxed);
    }
}

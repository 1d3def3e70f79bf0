//! Node-side reporting to the fleet controller
//!
//! A single periodic task uploads counters plus the unsent tail of the
//! request log and reconciles the local allow-list against the canonical one
//! returned by the controller. `last_sent` only advances after a successful
//! round trip, so a failed upload is retried with the same tail; the
//! controller tolerates duplicates because its store is append-only and
//! aggregation is count-based.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::ReportPayload;
use crate::config::GuardConfig;
use crate::store::{AllowEntry, LogEvent, Store};

/// Cap on the very first upload (tail of the existing log).
const FIRST_BATCH: usize = 100;
/// Cap per subsequent upload; the remainder follows next tick.
const MAX_BATCH: usize = 500;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Note prefix marking entries that were pushed down by the controller.
const MASTER_NOTE_PREFIX: &str = "[master] ";

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    #[allow(dead_code)]
    status: String,
    #[serde(default)]
    whitelist: Option<Vec<AllowEntry>>,
}

/// Periodic report task.
pub struct Reporter {
    config: Arc<GuardConfig>,
    store: Arc<Store>,
    client: reqwest::Client,
    started: Instant,
    /// Timestamp of the newest event the controller has acknowledged
    last_sent: Option<String>,
}

impl Reporter {
    pub fn new(config: Arc<GuardConfig>, store: Arc<Store>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            store,
            client,
            started: Instant::now(),
            last_sent: None,
        })
    }

    /// Run until shutdown. The first report fires immediately; in-flight
    /// uploads are dropped when the token is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.config.master_url.is_empty() || self.config.node_token.is_empty() {
            info!("master_url or node_token not configured, reporting disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.effective_report_interval());
        info!(
            "reporter started, every {:?} to {}",
            interval, self.config.master_url
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.report_once() => {
                    if let Err(e) = result {
                        warn!("report failed: {}", e);
                    }
                }
            }
        }
    }

    /// One report round trip. `last_sent` advances only on success.
    pub async fn report_once(&mut self) -> anyhow::Result<()> {
        let counters = self.store.counters();
        let (logs, newest_ts) = self.pending_tail();
        let sent = logs.len();

        let payload = ReportPayload {
            version: crate::VERSION.to_string(),
            uptime: self.started.elapsed().as_secs() as i64,
            total_requests: counters.total_requests,
            trusted_count: counters.trusted_count,
            blocked_count: counters.blocked_count,
            domain: self.config.domain.clone(),
            upstream: self.config.upstream.clone(),
            logs,
        };

        let url = format!(
            "{}/api/report",
            self.config.master_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.node_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("controller returned {}: {}", status, body);
        }

        let parsed: ReportResponse = response.json().await?;
        if let Some(whitelist) = parsed.whitelist {
            if reconcile_allow_list(&self.store, &whitelist)? {
                info!("allow-list synchronized, {} entries", whitelist.len());
            }
        }

        // The controller has the tail now
        if let Some(ts) = newest_ts {
            self.last_sent = Some(ts);
        }
        if sent > 0 {
            debug!("uploaded {} log events", sent);
        }
        Ok(())
    }

    /// Unsent log tail plus the timestamp to advance to on success.
    fn pending_tail(&self) -> (Vec<LogEvent>, Option<String>) {
        let all = self.store.read_events();
        let tail: Vec<LogEvent> = match &self.last_sent {
            None => {
                let start = all.len().saturating_sub(FIRST_BATCH);
                all[start..].to_vec()
            }
            Some(last) => all
                .into_iter()
                .filter(|e| e.timestamp > *last)
                .take(MAX_BATCH)
                .collect(),
        };
        let newest = tail.last().map(|e| e.timestamp.clone());
        (tail, newest)
    }
}

/// Make the local allow-list digests match the controller's: add missing
/// entries with a `[master]`-prefixed note, remove entries the controller no
/// longer has. Existing entries are untouched, so `created_at` survives.
/// Returns whether anything changed.
pub fn reconcile_allow_list(store: &Store, remote: &[AllowEntry]) -> anyhow::Result<bool> {
    let local = store.list_allowed();
    let remote_index: std::collections::HashSet<&str> =
        remote.iter().map(|e| e.ja3_hash.as_str()).collect();
    let local_index: std::collections::HashSet<&str> =
        local.iter().map(|e| e.ja3_hash.as_str()).collect();

    let mut changed = false;
    for entry in remote {
        if !local_index.contains(entry.ja3_hash.as_str()) {
            store.add_allowed(
                &entry.ja3_hash,
                &format!("{MASTER_NOTE_PREFIX}{}", entry.note),
            )?;
            changed = true;
        }
    }
    for entry in &local {
        if !remote_index.contains(entry.ja3_hash.as_str()) {
            store.remove_allowed(&entry.ja3_hash)?;
            changed = true;
        }
    }
    Ok(changed)
}

//! Persistent fingerprint store: allow-list and request log
//!
//! Two files under the data directory:
//! - `whitelist.json` - pretty-printed JSON array of allow-list entries,
//!   rewritten on every mutation, mirrored in memory behind a reader-writer
//!   guard with a hash index for O(1) lookups
//! - `ja3_logs.jsonl` - one JSON object per line, appended with
//!   `O_APPEND` semantics so concurrent writers never interleave a record
//!
//! Scans reopen the log file; malformed lines (e.g. a partial trailing
//! write) are skipped. Aggregation and counters are derived by scanning -
//! nothing is double-bookkept.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Allow-list entry. `created_at` is set on insert and never touched again;
/// `note` is mutable on re-add.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowEntry {
    pub ja3_hash: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub created_at: String,
}

/// One request log record. Field names are the wire format shared with the
/// controller, so they stay short.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(rename = "ip")]
    pub client_ip: String,
    #[serde(rename = "ja3")]
    pub ja3_hash: String,
    #[serde(default)]
    pub ua: String,
    #[serde(rename = "ok")]
    pub trusted: bool,
}

/// Per-fingerprint aggregation over the log.
#[derive(Debug, Clone, Serialize)]
pub struct Ja3Summary {
    pub ja3_hash: String,
    pub count: usize,
    pub last_ua: String,
    pub last_ip: String,
    pub last_seen: String,
    pub in_whitelist: bool,
}

/// Overall counters, derived from the log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub total_requests: usize,
    pub trusted_count: usize,
    pub blocked_count: usize,
}

struct Whitelist {
    entries: Vec<AllowEntry>,
    index: HashSet<String>,
}

/// Allow-list plus append-only request log.
pub struct Store {
    data_dir: PathBuf,
    whitelist: RwLock<Whitelist>,
    /// Unix second of the last append-failure warning (rate limit: 1/s)
    last_append_warn: AtomicU64,
}

/// Current timestamp in the persisted/wire format (`%Y-%m-%d %H:%M:%S`,
/// UTC-naive). The format sorts lexicographically, which the log tail
/// tracking relies on.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Store {
    /// Open the store, creating the data directory if needed. A missing or
    /// malformed allow-list file leaves the store empty.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            whitelist: RwLock::new(Whitelist {
                entries: Vec::new(),
                index: HashSet::new(),
            }),
            last_append_warn: AtomicU64::new(0),
        };
        store.load_whitelist();
        Ok(store)
    }

    fn whitelist_path(&self) -> PathBuf {
        self.data_dir.join("whitelist.json")
    }

    fn log_path(&self) -> PathBuf {
        self.data_dir.join("ja3_logs.jsonl")
    }

    // --- allow-list ---

    fn load_whitelist(&self) {
        let data = match std::fs::read_to_string(self.whitelist_path()) {
            Ok(d) => d,
            Err(_) => return, // missing file: start empty
        };
        let entries: Vec<AllowEntry> = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(e) => {
                warn!("malformed whitelist file, starting empty: {}", e);
                return;
            }
        };
        let mut guard = self.whitelist.write();
        guard.index = entries.iter().map(|e| e.ja3_hash.clone()).collect();
        guard.entries = entries;
    }

    fn save_whitelist(&self, entries: &[AllowEntry]) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(entries)?;
        std::fs::write(self.whitelist_path(), data)?;
        Ok(())
    }

    /// O(1) allow-list membership. The empty digest is never trusted.
    pub fn is_allowed(&self, hash: &str) -> bool {
        if hash.is_empty() {
            return false;
        }
        self.whitelist.read().index.contains(hash)
    }

    /// Insert an entry or update the note of an existing one. `created_at`
    /// is only set on first insert.
    pub fn add_allowed(&self, hash: &str, note: &str) -> Result<(), StoreError> {
        let mut guard = self.whitelist.write();
        if guard.index.contains(hash) {
            if let Some(entry) = guard.entries.iter_mut().find(|e| e.ja3_hash == hash) {
                entry.note = note.to_string();
            }
        } else {
            guard.entries.push(AllowEntry {
                ja3_hash: hash.to_string(),
                note: note.to_string(),
                created_at: now_timestamp(),
            });
            guard.index.insert(hash.to_string());
        }
        self.save_whitelist(&guard.entries)
    }

    /// Remove an entry; a no-op if absent.
    pub fn remove_allowed(&self, hash: &str) -> Result<(), StoreError> {
        let mut guard = self.whitelist.write();
        guard.index.remove(hash);
        guard.entries.retain(|e| e.ja3_hash != hash);
        self.save_whitelist(&guard.entries)
    }

    /// Snapshot of the allow-list in insertion order.
    pub fn list_allowed(&self) -> Vec<AllowEntry> {
        self.whitelist.read().entries.clone()
    }

    // --- request log ---

    /// Append a log event. Failures never stall the request path: they are
    /// dropped after a warning emitted at most once per second.
    pub fn append_event(&self, event: &LogEvent) {
        if let Err(e) = self.try_append(event) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let last = self.last_append_warn.load(Ordering::Relaxed);
            if now > last
                && self
                    .last_append_warn
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                warn!("failed to append log event: {}", e);
            }
        }
    }

    fn try_append(&self, event: &LogEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.log_path())?;
        // Single write of a full line; O_APPEND keeps concurrent records whole
        file.write_all(&line)?;
        Ok(())
    }

    /// Record a proxied request with the current timestamp.
    pub fn log_request(&self, client_ip: &str, ja3_hash: &str, ua: &str, trusted: bool) {
        self.append_event(&LogEvent {
            timestamp: now_timestamp(),
            client_ip: client_ip.to_string(),
            ja3_hash: ja3_hash.to_string(),
            ua: ua.to_string(),
            trusted,
        });
    }

    /// All log events in append order. Malformed lines are skipped.
    pub fn read_events(&self) -> Vec<LogEvent> {
        let file = match File::open(self.log_path()) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Ok(event) = serde_json::from_str::<LogEvent>(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Paged view of the log, newest first. `page` starts at 1; `size` is
    /// clamped to [1, 200]. Returns the slice and the total count.
    pub fn page_events(&self, page: usize, size: usize) -> (Vec<LogEvent>, usize) {
        let page = page.max(1);
        let size = size.clamp(1, 200);

        let mut events = self.read_events();
        let total = events.len();
        events.reverse();

        let start = (page - 1) * size;
        if start >= total {
            return (Vec::new(), total);
        }
        let end = (start + size).min(total);
        (events[start..end].to_vec(), total)
    }

    /// Overall counters derived from the log.
    pub fn counters(&self) -> Counters {
        let events = self.read_events();
        let trusted = events.iter().filter(|e| e.trusted).count();
        Counters {
            total_requests: events.len(),
            trusted_count: trusted,
            blocked_count: events.len() - trusted,
        }
    }

    /// Aggregate the log by fingerprint, sorted by request count descending.
    /// The "last" fields reflect the most recent event per digest.
    pub fn aggregate_by_digest(&self) -> Vec<Ja3Summary> {
        let events = self.read_events();

        let mut order: Vec<String> = Vec::new();
        let mut by_hash: HashMap<String, Ja3Summary> = HashMap::new();
        for event in events {
            let summary = by_hash
                .entry(event.ja3_hash.clone())
                .or_insert_with(|| {
                    order.push(event.ja3_hash.clone());
                    Ja3Summary {
                        ja3_hash: event.ja3_hash.clone(),
                        count: 0,
                        last_ua: String::new(),
                        last_ip: String::new(),
                        last_seen: String::new(),
                        in_whitelist: false,
                    }
                });
            summary.count += 1;
            summary.last_ua = event.ua;
            summary.last_ip = event.client_ip;
            summary.last_seen = event.timestamp;
        }

        let mut summaries: Vec<Ja3Summary> = order
            .into_iter()
            .filter_map(|h| by_hash.remove(&h))
            .map(|mut s| {
                s.in_whitelist = self.is_allowed(&s.ja3_hash);
                s
            })
            .collect();
        summaries.sort_by(|a, b| b.count.cmp(&a.count));
        summaries
    }

    /// Drop events older than `keep_days` and rewrite the log atomically
    /// (temp file + rename). Returns the number of removed events.
    pub fn prune(&self, keep_days: i64) -> Result<usize, StoreError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(keep_days))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let events = self.read_events();
        let kept: Vec<&LogEvent> = events.iter().filter(|e| e.timestamp >= cutoff).collect();
        let removed = events.len() - kept.len();

        let tmp_path = self.data_dir.join("ja3_logs.jsonl.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            for event in &kept {
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, self.log_path())?;
        Ok(removed)
    }
}

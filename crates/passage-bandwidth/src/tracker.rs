//! Bandwidth tracker: monthly byte counters, active-connection counts, and
//! quota checks, persisted to a JSON usage file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use passage_core::USAGE_PERSIST_INTERVAL_SECS;

/// Usage record for a single user within the current month.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUsage {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub last_reset_at: String,
    pub active_conns: u32,
}

/// On-disk shape of the usage file.
#[derive(Debug, Serialize, Deserialize)]
struct UsageFile {
    month: String,
    users: HashMap<String, UserUsage>,
}

struct TrackerState {
    month: String,
    users: HashMap<String, UserUsage>,
}

impl TrackerState {
    fn get_or_create(&mut self, username: &str) -> &mut UserUsage {
        self.users
            .entry(username.to_string())
            .or_insert_with(|| UserUsage {
                last_reset_at: Utc::now().to_rfc3339(),
                ..Default::default()
            })
    }

    /// Zero all counters when the wall-clock month moved past the tag.
    /// Returns true when a rollover happened (the caller persists).
    fn rollover_if_needed(&mut self) -> bool {
        let current = current_month();
        if current == self.month {
            return false;
        }
        info!(from = %self.month, to = %current, "monthly bandwidth reset");
        let now = Utc::now().to_rfc3339();
        for usage in self.users.values_mut() {
            usage.bytes_up = 0;
            usage.bytes_down = 0;
            usage.total_bytes = 0;
            usage.last_reset_at = now.clone();
        }
        self.month = current;
        true
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Per-user bandwidth tracker with durable monthly counters.
///
/// One coarse lock guards the map; it is held only across map updates —
/// file writes happen on a snapshot outside the lock.
pub struct Tracker {
    state: Mutex<TrackerState>,
    path: PathBuf,
}

impl Tracker {
    /// Create a tracker persisting to `path`, adopting any same-month state
    /// already on disk. Stale or unreadable files are discarded.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let month = current_month();
        let mut state = TrackerState {
            month: month.clone(),
            users: HashMap::new(),
        };

        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<UsageFile>(&data) {
                Ok(file) if file.month == month => {
                    state.users = file.users;
                    // Active connections never survive a restart.
                    for usage in state.users.values_mut() {
                        usage.active_conns = 0;
                    }
                    info!(
                        users = state.users.len(),
                        month = %month,
                        "restored bandwidth usage"
                    );
                }
                Ok(file) => {
                    info!(
                        stale = %file.month,
                        current = %month,
                        "discarding bandwidth usage from another month"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "unparsable bandwidth usage file, starting fresh");
                }
            },
            // Missing file on first run is expected.
            Err(_) => {}
        }

        Self {
            state: Mutex::new(state),
            path,
        }
    }

    /// Add transferred bytes for a user.
    pub fn record(&self, username: &str, up: u64, down: u64) {
        self.with_state(|state| {
            let usage = state.get_or_create(username);
            usage.bytes_up += up;
            usage.bytes_down += down;
            usage.total_bytes += up + down;
        });
    }

    /// True while the user is under their monthly cap. `limit_gb == 0`
    /// means unlimited.
    pub fn check_allowance(&self, username: &str, limit_gb: u64) -> bool {
        if limit_gb == 0 {
            return true;
        }
        self.with_state(|state| {
            let usage = state.get_or_create(username);
            usage.total_bytes < limit_gb * (1 << 30)
        })
    }

    pub fn increment_conns(&self, username: &str) {
        self.with_state(|state| {
            state.get_or_create(username).active_conns += 1;
        });
    }

    pub fn decrement_conns(&self, username: &str) {
        self.with_state(|state| {
            let usage = state.get_or_create(username);
            usage.active_conns = usage.active_conns.saturating_sub(1);
        });
    }

    /// True while the user is under their concurrent-connection cap.
    /// `max_conns == 0` means unlimited.
    pub fn check_conn_limit(&self, username: &str, max_conns: u32) -> bool {
        if max_conns == 0 {
            return true;
        }
        self.with_state(|state| state.get_or_create(username).active_conns < max_conns)
    }

    /// Current usage snapshot for one user.
    pub fn usage(&self, username: &str) -> UserUsage {
        self.with_state(|state| state.get_or_create(username).clone())
    }

    /// Snapshot of every user's usage.
    pub fn all_usage(&self) -> HashMap<String, UserUsage> {
        self.with_state(|state| state.users.clone())
    }

    /// The month tag currently being accounted, e.g. `"2026-08"`.
    pub fn month(&self) -> String {
        self.state.lock().month.clone()
    }

    /// Write the current state to the usage file (temp file + rename).
    ///
    /// I/O failures are logged and swallowed; data-plane correctness never
    /// depends on persistence succeeding.
    pub fn persist(&self) {
        let snapshot = {
            let state = self.state.lock();
            UsageFile {
                month: state.month.clone(),
                users: state.users.clone(),
            }
        };

        let data = match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to serialize bandwidth usage");
                return;
            }
        };

        let tmp = self.path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, &data).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "failed to save bandwidth usage");
        } else {
            debug!(users = snapshot.users.len(), "bandwidth usage persisted");
        }
    }

    /// Run the periodic persistence loop until `cancel` fires, then write a
    /// final snapshot.
    pub async fn run_persist_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(USAGE_PERSIST_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.persist();
                    debug!("bandwidth persistence loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.persist();
                }
            }
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let (result, rolled) = {
            let mut state = self.state.lock();
            let rolled = state.rollover_if_needed();
            (f(&mut state), rolled)
        };
        if rolled {
            self.persist();
        }
        result
    }

    #[cfg(test)]
    fn force_month(&self, month: &str) {
        self.state.lock().month = month.to_string();
    }
}

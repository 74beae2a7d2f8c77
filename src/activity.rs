//! Session liveness tracking.
//!
//! The gateway stamps every authenticated call into an in-memory map. A
//! single background task flushes new stamps to `sessions.last_seen_at`,
//! quickly while clients are active and slowly while they are idle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::session_store::SessionStore;

/// Flush cadence while some client called within [`ACTIVE_WINDOW`].
pub const ACTIVE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Flush cadence while every client is idle.
pub const IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_call: DashMap<String, DateTime<Utc>>,
    flushed: DashMap<String, DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, client_id: &str) {
        self.record_at(client_id, Utc::now());
    }

    pub fn record_at(&self, client_id: &str, at: DateTime<Utc>) {
        if client_id.is_empty() {
            return;
        }
        self.last_call
            .entry(client_id.to_string())
            .and_modify(|t| {
                if at > *t {
                    *t = at;
                }
            })
            .or_insert(at);
    }

    pub fn last_call(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.last_call.get(client_id).map(|t| *t)
    }

    /// Delay before the next flush, given the current time.
    pub fn next_interval(&self, now: DateTime<Utc>) -> Duration {
        let window = chrono::Duration::from_std(ACTIVE_WINDOW).unwrap_or(chrono::Duration::zero());
        let active = self.last_call.iter().any(|e| now - *e.value() <= window);
        if active {
            ACTIVE_FLUSH_INTERVAL
        } else {
            IDLE_FLUSH_INTERVAL
        }
    }

    /// Persist every stamp newer than what was last written. Returns the
    /// number of sessions updated.
    pub fn flush(&self, sessions: &SessionStore) -> usize {
        let pending: Vec<(String, DateTime<Utc>)> = self
            .last_call
            .iter()
            .filter(|e| {
                self.flushed
                    .get(e.key())
                    .map_or(true, |written| *written < *e.value())
            })
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut written = 0;
        for (client_id, at) in pending {
            match sessions.record_last_seen(&client_id, at) {
                Ok(true) => {
                    self.flushed.insert(client_id, at);
                    written += 1;
                }
                Ok(false) => {
                    // Session is gone; stop tracking it.
                    self.last_call.remove(&client_id);
                    self.flushed.remove(&client_id);
                }
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Failed to flush last-seen");
                }
            }
        }
        if written > 0 {
            tracing::debug!(written, "Flushed session activity");
        }
        written
    }

    pub fn clear(&self) {
        self.last_call.clear();
        self.flushed.clear();
    }
}

/// Run one flush on the blocking pool; SQLite writes stay off the
/// async workers.
async fn flush_blocking(tracker: &Arc<ActivityTracker>, sessions: &Arc<SessionStore>) -> usize {
    let tracker = Arc::clone(tracker);
    let sessions = Arc::clone(sessions);
    match tokio::task::spawn_blocking(move || tracker.flush(&sessions)).await {
        Ok(written) => written,
        Err(e) => {
            tracing::warn!(error = %e, "Activity flush task failed");
            0
        }
    }
}

/// Handle to the running flush task.
pub struct FlushTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl FlushTask {
    /// Start the single background flush loop.
    pub fn spawn(tracker: Arc<ActivityTracker>, sessions: Arc<SessionStore>) -> Self {
        let (tx, mut rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                let delay = tracker.next_interval(Utc::now());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        flush_blocking(&tracker, &sessions).await;
                    }
                    _ = &mut rx => {
                        flush_blocking(&tracker, &sessions).await;
                        tracing::debug!("Activity flush loop stopped");
                        break;
                    }
                }
            }
        });
        Self {
            shutdown: Some(tx),
            handle,
        }
    }

    /// Stop the loop after one final flush.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Activity flush task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SymmetricKey;
    use crate::db::Database;

    fn paired_store(client_id: &str) -> Arc<SessionStore> {
        let store = SessionStore::new(Database::open_in_memory().unwrap());
        let token = SymmetricKey::generate().as_bytes().to_vec();
        store.upsert(client_id, |s| s.token = token).unwrap();
        Arc::new(store)
    }

    #[test]
    fn interval_is_short_while_active() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        assert_eq!(tracker.next_interval(now), IDLE_FLUSH_INTERVAL);

        tracker.record_at("c1", now - chrono::Duration::seconds(2));
        assert_eq!(tracker.next_interval(now), ACTIVE_FLUSH_INTERVAL);

        let later = now + chrono::Duration::seconds(30);
        assert_eq!(tracker.next_interval(later), IDLE_FLUSH_INTERVAL);
    }

    #[test]
    fn record_keeps_latest_stamp() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_at("c1", now);
        tracker.record_at("c1", now - chrono::Duration::seconds(10));
        assert_eq!(tracker.last_call("c1"), Some(now));
    }

    #[test]
    fn flush_writes_only_new_stamps() {
        let store = paired_store("c1");
        let tracker = ActivityTracker::new();
        tracker.record("c1");

        assert_eq!(tracker.flush(&store), 1);
        assert_eq!(tracker.flush(&store), 0);
        assert!(store.list().unwrap()[0].last_seen_at.is_some());

        tracker.record_at("c1", Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(tracker.flush(&store), 1);
    }

    #[test]
    fn flush_forgets_removed_sessions() {
        let store = paired_store("c1");
        let tracker = ActivityTracker::new();
        tracker.record("ghost");
        assert_eq!(tracker.flush(&store), 0);
        assert!(tracker.last_call("ghost").is_none());
    }

    #[tokio::test]
    async fn stop_performs_final_flush() {
        let store = paired_store("c1");
        let tracker = Arc::new(ActivityTracker::new());
        let task = FlushTask::spawn(Arc::clone(&tracker), Arc::clone(&store));

        tracker.record("c1");
        task.stop().await;

        assert!(store.list().unwrap()[0].last_seen_at.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_flush_writes_from_single_threaded_runtime() {
        let store = paired_store("c1");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.record("c1");

        assert_eq!(flush_blocking(&tracker, &store).await, 1);
        assert_eq!(flush_blocking(&tracker, &store).await, 0);
        assert!(store.list().unwrap()[0].last_seen_at.is_some());
    }
}

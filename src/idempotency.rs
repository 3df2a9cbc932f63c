use chrono::Utc;
use std::{collections::HashMap, sync::Mutex};
use tracing::debug;

/// In-process duplicate-send guard keyed by request fingerprint.
///
/// Entries live for the configured window (24 h by default) and are evicted
/// lazily on lookup plus periodically via [`Self::sweep`]. The table is not
/// persisted: after a process restart, idempotency starts from scratch.
pub struct IdempotencyTable {
    window_ms: i64,
    entries: Mutex<HashMap<String, i64>>,
}

impl IdempotencyTable {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `fingerprint` was sent within the window. A stale entry is
    /// evicted on the spot and does not count as a duplicate.
    pub fn is_duplicate(&self, fingerprint: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");

        match entries.get(fingerprint) {
            Some(&first_sent) if now - first_sent < self.window_ms => true,
            Some(_) => {
                entries.remove(fingerprint);
                false
            }
            None => false,
        }
    }

    /// Record a successful send for `fingerprint`.
    pub fn record(&self, fingerprint: &str) {
        let now = Utc::now().timestamp_millis();
        self.entries
            .lock()
            .expect("idempotency lock poisoned")
            .insert(fingerprint.to_owned(), now);
    }

    /// Drop every entry older than the window. Runs from the periodic
    /// maintenance task.
    pub fn sweep(&self) {
        let cutoff = Utc::now().timestamp_millis() - self.window_ms;
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        let before = entries.len();
        entries.retain(|_, &mut first_sent| first_sent >= cutoff);

        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "swept idempotency table");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("idempotency lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn backdate(&self, fingerprint: &str, age_ms: i64) {
        let ts = Utc::now().timestamp_millis() - age_ms;
        self.entries
            .lock()
            .unwrap()
            .insert(fingerprint.to_owned(), ts);
    }
}

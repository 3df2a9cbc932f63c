use crate::{config::DomainLimits, request::recipient_domain};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

const GLOBAL_WINDOW_MS: i64 = 1_000;
const DOMAIN_WINDOW_MS: i64 = 60_000;
// Timestamps are retained a little longer than the enforcement window so a
// domain's recent history survives between checks.
const DOMAIN_RETENTION_MS: i64 = 120_000;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-recipient-domain sliding window plus an optional hard block.
#[derive(Debug, Default)]
struct DomainState {
    send_timestamps: VecDeque<i64>,
    cooldown_until: Option<i64>,
}

impl DomainState {
    fn prune(&mut self, cutoff: i64) {
        while self.send_timestamps.front().is_some_and(|&ts| ts < cutoff) {
            self.send_timestamps.pop_front();
        }
    }

    fn cooldown_remaining(&self, now_ms: i64) -> Option<i64> {
        self.cooldown_until
            .map(|until| until - now_ms)
            .filter(|&remaining| remaining > 0)
    }

    fn is_idle(&self, now_ms: i64) -> bool {
        self.send_timestamps.is_empty() && self.cooldown_remaining(now_ms).is_none()
    }
}

/// Two-tier send throttle: a global sends-per-second ceiling and a
/// per-recipient-domain sends-per-minute ceiling with dynamic cooldowns.
///
/// One instance per process, shared across all workers.
pub struct RateLimiter {
    global_limit: usize,
    limits: DomainLimits,
    global: Mutex<VecDeque<i64>>,
    domains: Mutex<HashMap<String, Arc<Mutex<DomainState>>>>,
}

#[derive(Debug, Serialize)]
pub struct DomainStats {
    pub in_window: usize,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LimiterStats {
    pub global_in_window: usize,
    pub global_limit: usize,
    pub domains: BTreeMap<String, DomainStats>,
}

impl RateLimiter {
    pub fn new(global_limit: usize, limits: DomainLimits) -> Self {
        Self {
            global_limit,
            limits,
            global: Mutex::new(VecDeque::new()),
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Block until a send to `recipient` is permissible. A single wait is
    /// computed and slept through; callers invoke this once per attempt.
    pub async fn wait_until_allowed(&self, recipient: &str) {
        let domain = recipient_domain(recipient);
        let wait = self.required_wait(&domain, Utc::now().timestamp_millis());

        if !wait.is_zero() {
            debug!(domain, wait_ms = wait.as_millis() as u64, "throttling send");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a successful send against both windows.
    pub fn record_send(&self, domain: &str) {
        self.record_send_at(domain, Utc::now().timestamp_millis());
    }

    /// Hard-block `domain` for `duration`, replacing any earlier cooldown.
    pub fn set_cooldown(&self, domain: &str, duration: Duration) {
        let until = Utc::now().timestamp_millis() + duration.as_millis() as i64;
        self.set_cooldown_until(domain, until);
    }

    pub fn clear_cooldown(&self, domain: &str) {
        if let Some(state) = self.domain_state(domain) {
            state.lock().expect("domain state lock poisoned").cooldown_until = None;
        }
    }

    /// Drop domains with an empty window and no live cooldown. Runs from the
    /// periodic maintenance task.
    pub fn evict_idle(&self) {
        let now = Utc::now().timestamp_millis();
        let mut domains = self.domains.lock().expect("domain map lock poisoned");

        domains.retain(|_, state| {
            let mut state = state.lock().expect("domain state lock poisoned");
            state.prune(now - DOMAIN_RETENTION_MS);
            !state.is_idle(now)
        });
    }

    pub fn stats(&self) -> LimiterStats {
        let now = Utc::now().timestamp_millis();

        let global_in_window = {
            let mut global = self.global.lock().expect("global window lock poisoned");
            prune_front(&mut global, now - GLOBAL_WINDOW_MS);
            global.len()
        };

        let domains = self
            .domains
            .lock()
            .expect("domain map lock poisoned")
            .iter()
            .map(|(domain, state)| {
                let mut state = state.lock().expect("domain state lock poisoned");
                state.prune(now - DOMAIN_WINDOW_MS);
                let stats = DomainStats {
                    in_window: state.send_timestamps.len(),
                    limit: self.limits.limit_for(domain),
                    cooldown_remaining_ms: state.cooldown_remaining(now),
                };
                (domain.clone(), stats)
            })
            .collect();

        LimiterStats {
            global_in_window,
            global_limit: self.global_limit,
            domains,
        }
    }

    /// The wait needed before a send to `domain` at `now_ms`: the maximum of
    /// the global-window wait and the domain wait, where an active cooldown
    /// takes priority over the domain's sliding window.
    pub(crate) fn required_wait(&self, domain: &str, now_ms: i64) -> Duration {
        let global_wait = {
            let mut global = self.global.lock().expect("global window lock poisoned");
            prune_front(&mut global, now_ms - GLOBAL_WINDOW_MS);
            if global.len() >= self.global_limit {
                global
                    .front()
                    .map(|&oldest| oldest + GLOBAL_WINDOW_MS - now_ms)
                    .unwrap_or(0)
            } else {
                0
            }
        };

        let domain_wait = match self.domain_state(domain) {
            None => 0,
            Some(state) => {
                let mut state = state.lock().expect("domain state lock poisoned");
                if let Some(remaining) = state.cooldown_remaining(now_ms) {
                    remaining
                } else {
                    state.prune(now_ms - DOMAIN_WINDOW_MS);
                    if state.send_timestamps.len() >= self.limits.limit_for(domain) {
                        state
                            .send_timestamps
                            .front()
                            .map(|&oldest| oldest + DOMAIN_WINDOW_MS - now_ms)
                            .unwrap_or(0)
                    } else {
                        0
                    }
                }
            }
        };

        Duration::from_millis(global_wait.max(domain_wait).max(0) as u64)
    }

    pub(crate) fn record_send_at(&self, domain: &str, now_ms: i64) {
        {
            let mut global = self.global.lock().expect("global window lock poisoned");
            prune_front(&mut global, now_ms - GLOBAL_WINDOW_MS);
            global.push_back(now_ms);
        }

        let state = self.domain_state_or_default(domain);
        let mut state = state.lock().expect("domain state lock poisoned");
        state.prune(now_ms - DOMAIN_RETENTION_MS);
        state.send_timestamps.push_back(now_ms);
    }

    pub(crate) fn set_cooldown_until(&self, domain: &str, until_ms: i64) {
        let state = self.domain_state_or_default(domain);
        state.lock().expect("domain state lock poisoned").cooldown_until = Some(until_ms);
    }

    fn domain_state(&self, domain: &str) -> Option<Arc<Mutex<DomainState>>> {
        self.domains
            .lock()
            .expect("domain map lock poisoned")
            .get(domain)
            .cloned()
    }

    fn domain_state_or_default(&self, domain: &str) -> Arc<Mutex<DomainState>> {
        self.domains
            .lock()
            .expect("domain map lock poisoned")
            .entry(domain.to_owned())
            .or_default()
            .clone()
    }
}

fn prune_front(window: &mut VecDeque<i64>, cutoff: i64) {
    while window.front().is_some_and(|&ts| ts < cutoff) {
        window.pop_front();
    }
}

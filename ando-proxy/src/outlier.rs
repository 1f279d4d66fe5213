//! Passive outlier detection (C5). No teacher counterpart — the teacher
//! only probes actively (`health_check.rs`). Grounded structurally on that
//! file's consecutive-counter-threshold pattern, but driven by
//! `record_request()` calls from the proxy's response path instead of a
//! periodic poll.

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TargetHealthState {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    isolated_at: Option<Instant>,
}

impl Default for TargetHealthState {
    fn default() -> Self {
        Self { healthy: true, consecutive_failures: 0, consecutive_successes: 0, isolated_at: None }
    }
}

pub struct OutlierConfig {
    /// Consecutive failures before a target is isolated.
    pub consecutive_failures: u32,
    /// Consecutive successes (during the post-cooldown probationary
    /// period) before a target is restored to healthy.
    pub consecutive_successes: u32,
    /// How long a target stays isolated before a probationary request is
    /// let through again.
    pub isolation_duration: Duration,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            consecutive_successes: 2,
            isolation_duration: Duration::from_secs(30),
        }
    }
}

/// `(upstream_id, target)` tuple keys, never back-pointers into `Upstream`
/// (cyclic ownership would otherwise force the data model and the
/// health-state store to know about each other).
pub struct PassiveOutlierDetector {
    state: DashMap<(String, String), TargetHealthState>,
    config: OutlierConfig,
}

impl PassiveOutlierDetector {
    pub fn new(config: OutlierConfig) -> Self {
        Self { state: DashMap::new(), config }
    }

    /// Unknown (not-yet-observed) targets report healthy — matches C4's
    /// default for not-yet-checked targets.
    pub fn is_healthy(&self, upstream_id: &str, target: &str) -> bool {
        let key = (upstream_id.to_string(), target.to_string());
        match self.state.get(&key) {
            None => true,
            Some(s) if s.healthy => true,
            Some(s) => {
                // Probationary allow after the cooldown elapses — checked
                // lazily here rather than via a dedicated timer task.
                match s.isolated_at {
                    Some(t) => t.elapsed() >= self.config.isolation_duration,
                    None => false,
                }
            }
        }
    }

    /// Record the outcome of a completed (or failed) upstream round trip.
    pub fn record_request(
        &self,
        upstream_id: &str,
        target: &str,
        status: Option<u16>,
        is_timeout: bool,
        dial_or_io_error: bool,
    ) {
        let is_failure = is_timeout || dial_or_io_error || matches!(status, Some(s) if s >= 500);
        let key = (upstream_id.to_string(), target.to_string());
        let mut entry = self.state.entry(key).or_default();

        if is_failure {
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            if entry.healthy && entry.consecutive_failures >= self.config.consecutive_failures {
                entry.healthy = false;
                entry.isolated_at = Some(Instant::now());
                tracing::warn!(
                    upstream_id,
                    target,
                    failures = entry.consecutive_failures,
                    "target isolated by passive outlier detector"
                );
            }
        } else {
            entry.consecutive_failures = 0;
            entry.consecutive_successes += 1;
            if !entry.healthy && entry.consecutive_successes >= self.config.consecutive_successes {
                entry.healthy = true;
                entry.isolated_at = None;
                tracing::info!(upstream_id, target, "target restored healthy after passive recovery");
            }
        }
    }

    /// Drop health state entries for targets that no longer belong to any
    /// known upstream — called after config reload to avoid unbounded
    /// growth of stale `(upstream_id, target)` keys.
    pub fn retain_known(&self, known: impl Fn(&str, &str) -> bool) {
        self.state.retain(|(upstream_id, target), _| known(upstream_id, target));
    }
}

impl Default for PassiveOutlierDetector {
    fn default() -> Self {
        Self::new(OutlierConfig::default())
    }
}

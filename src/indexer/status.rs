//! Backend health tracking
//!
//! Each backend carries a failure history that decides whether it is
//! skipped for a while. Repeated failures escalate the exclusion window up
//! to a ceiling; an explicit retry-after from the backend is honoured as is.
//!
//! The outer map lock is only held long enough to find or create a
//! backend's entry. Updates then lock that single entry, so unrelated
//! backends never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::Clock;

/// Escalation schedule for repeated failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Window after the first failure
    pub base: Duration,
    /// Longest window ever applied
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Window for the given escalation level (1-based), doubling each level
    pub fn window(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(level.saturating_sub(1).min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// First level whose window hits the ceiling
    pub fn max_level(&self) -> u32 {
        let mut level = 1;
        while self.window(level) < self.max && level < 32 {
            level += 1;
        }
        level
    }
}

/// Failure history of one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub initial_failure: Option<DateTime<Utc>>,
    pub most_recent_failure: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub escalation_level: u32,
}

/// Logical state derived from a [`BackendStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendState {
    Available,
    /// Skipped until the given time
    Backoff { until: DateTime<Utc> },
    /// Failing at the escalation ceiling; still queried once the window ends
    PermanentAttentionNeeded,
}

/// Tracks success/failure of every backend
pub struct BackendStatusTracker {
    entries: RwLock<HashMap<i32, Arc<Mutex<BackendStatus>>>>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl BackendStatusTracker {
    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    fn entry(&self, id: i32) -> Arc<Mutex<BackendStatus>> {
        if let Some(entry) = self.entries.read().get(&id) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(BackendStatus::default())))
            .clone()
    }

    fn existing(&self, id: i32) -> Option<Arc<Mutex<BackendStatus>>> {
        self.entries.read().get(&id).cloned()
    }

    /// Clear failures and any active backoff
    pub fn record_success(&self, id: i32) {
        let Some(entry) = self.existing(id) else {
            return;
        };
        let mut status = entry.lock();
        if status.failure_count > 0 || status.disabled_until.is_some() {
            info!(indexer_id = id, failures = status.failure_count, "Indexer recovered");
        }
        *status = BackendStatus::default();
    }

    /// Record a failure and open a new backoff window
    ///
    /// With `retry_after` the window is exactly that long; otherwise it
    /// escalates with the number of consecutive failures.
    pub fn record_failure(&self, id: i32, retry_after: Option<Duration>) {
        let now = self.clock.now();
        let entry = self.entry(id);
        let mut status = entry.lock();

        status.failure_count = status.failure_count.saturating_add(1);
        status.initial_failure.get_or_insert(now);
        status.most_recent_failure = Some(now);
        status.escalation_level = (status.escalation_level + 1).min(self.policy.max_level());

        let window = match retry_after {
            Some(retry_after) => retry_after,
            None => self.policy.window(status.escalation_level),
        };
        let until = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_add_signed(w))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        status.disabled_until = Some(until);

        if status.escalation_level >= self.policy.max_level() {
            warn!(
                indexer_id = id,
                failures = status.failure_count,
                disabled_until = %until,
                "Indexer keeps failing at the maximum backoff"
            );
        } else {
            debug!(
                indexer_id = id,
                failures = status.failure_count,
                level = status.escalation_level,
                disabled_until = %until,
                "Indexer placed in backoff"
            );
        }
    }

    /// Whether the backend may be queried at `now`
    pub fn is_available(&self, id: i32, now: DateTime<Utc>) -> bool {
        !matches!(self.state(id, now), BackendState::Backoff { .. })
    }

    pub fn state(&self, id: i32, now: DateTime<Utc>) -> BackendState {
        let Some(entry) = self.existing(id) else {
            return BackendState::Available;
        };
        let status = entry.lock();

        match status.disabled_until {
            Some(until) if until > now => BackendState::Backoff { until },
            _ if status.failure_count > 0 && status.escalation_level >= self.policy.max_level() => {
                BackendState::PermanentAttentionNeeded
            }
            _ => BackendState::Available,
        }
    }

    /// Time left in the backoff window, if any
    pub fn retry_after(&self, id: i32, now: DateTime<Utc>) -> Option<Duration> {
        match self.state(id, now) {
            BackendState::Backoff { until } => (until - now).to_std().ok(),
            _ => None,
        }
    }

    pub fn status(&self, id: i32) -> Option<BackendStatus> {
        self.existing(id).map(|entry| entry.lock().clone())
    }

    /// Snapshot of every backend that has ever failed
    pub fn all(&self) -> HashMap<i32, BackendStatus> {
        let entries: Vec<(i32, Arc<Mutex<BackendStatus>>)> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        entries
            .into_iter()
            .map(|(id, entry)| (id, entry.lock().clone()))
            .filter(|(_, status)| status.failure_count > 0)
            .collect()
    }
}

impl std::fmt::Debug for BackendStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStatusTracker")
            .field("tracked", &self.entries.read().len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn tracker() -> (BackendStatusTracker, ManualClock) {
        let clock = ManualClock::default();
        let tracker = BackendStatusTracker::new(BackoffPolicy::default(), Arc::new(clock.clone()));
        (tracker, clock)
    }

    fn window(tracker: &BackendStatusTracker, clock: &ManualClock, id: i32) -> Duration {
        tracker.retry_after(id, clock.now()).unwrap_or(Duration::ZERO)
    }

    #[test]
    fn test_policy_windows_double_up_to_ceiling() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.window(0), Duration::ZERO);
        assert_eq!(policy.window(1), Duration::from_secs(60));
        assert_eq!(policy.window(2), Duration::from_secs(120));
        assert_eq!(policy.window(8), Duration::from_secs(7680));
        assert_eq!(policy.window(9), Duration::from_secs(10800));
        assert_eq!(policy.window(40), Duration::from_secs(10800));
        assert_eq!(policy.max_level(), 9);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_bounded() {
        let (tracker, clock) = tracker();
        let mut previous = Duration::ZERO;

        for _ in 0..15 {
            tracker.record_failure(7, None);
            let current = window(&tracker, &clock, 7);
            assert!(current >= previous);
            assert!(current <= BackoffPolicy::default().max);
            previous = current;
        }
        assert_eq!(previous, BackoffPolicy::default().max);
    }

    #[test]
    fn test_explicit_retry_after_is_exact() {
        let (tracker, clock) = tracker();
        tracker.record_failure(3, None);
        tracker.record_failure(3, None);
        tracker.record_failure(3, Some(Duration::from_secs(30)));

        assert_eq!(window(&tracker, &clock, 3), Duration::from_secs(30));
        assert_eq!(tracker.status(3).map(|s| s.failure_count), Some(3));
    }

    #[test]
    fn test_success_resets_everything() {
        let (tracker, clock) = tracker();
        tracker.record_failure(1, None);
        assert!(!tracker.is_available(1, clock.now()));

        tracker.record_success(1);
        assert!(tracker.is_available(1, clock.now()));
        assert_eq!(tracker.status(1), Some(BackendStatus::default()));
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_backoff_expires_with_clock() {
        let (tracker, clock) = tracker();
        tracker.record_failure(2, None);
        assert!(!tracker.is_available(2, clock.now()));

        clock.advance(chrono::Duration::seconds(59));
        assert!(!tracker.is_available(2, clock.now()));

        clock.advance(chrono::Duration::seconds(1));
        assert!(tracker.is_available(2, clock.now()));
    }

    #[test]
    fn test_ceiling_flags_attention_but_stays_queryable() {
        let (tracker, clock) = tracker();
        for _ in 0..BackoffPolicy::default().max_level() {
            tracker.record_failure(9, None);
        }
        assert!(matches!(tracker.state(9, clock.now()), BackendState::Backoff { .. }));

        clock.advance(chrono::Duration::hours(3));
        assert_eq!(tracker.state(9, clock.now()), BackendState::PermanentAttentionNeeded);
        assert!(tracker.is_available(9, clock.now()));
    }

    #[test]
    fn test_unknown_backend_is_available() {
        let (tracker, clock) = tracker();
        assert_eq!(tracker.state(42, clock.now()), BackendState::Available);
        tracker.record_success(42);
        assert_eq!(tracker.status(42), None);
    }
}

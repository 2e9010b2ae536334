//! Per-host request spacing
//!
//! Backend sites throttle on wall-clock spacing between hits rather than on
//! burst budgets, so this keeps the time of the last request per host and
//! makes the next caller wait until the spacing has elapsed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default spacing between two requests to the same host
pub const DEFAULT_HOST_SPACING: Duration = Duration::from_secs(2);

/// Hosts unused for this long are forgotten
pub const HOST_IDLE_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Enforces a minimum interval between requests to each host
pub struct HostRateLimiter {
    hosts: RwLock<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
    default_spacing: Duration,
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_SPACING)
    }
}

impl HostRateLimiter {
    pub fn new(default_spacing: Duration) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            default_spacing,
        }
    }

    pub fn default_spacing(&self) -> Duration {
        self.default_spacing
    }

    fn slot(&self, host: &str) -> Arc<Mutex<Option<Instant>>> {
        if let Some(slot) = self.hosts.read().get(host) {
            return slot.clone();
        }
        self.hosts
            .write()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Wait for the host's turn, then claim it
    ///
    /// `spacing` falls back to the limiter default. Returns `false` if the
    /// token was cancelled while waiting; the slot is left untouched then.
    pub async fn acquire(&self, host: &str, spacing: Option<Duration>, cancel: &CancellationToken) -> bool {
        let spacing = spacing.unwrap_or(self.default_spacing);
        let slot = self.slot(host);

        let mut last = tokio::select! {
            guard = slot.lock() => guard,
            _ = cancel.cancelled() => return false,
        };

        if let Some(previous) = *last {
            let ready_at = previous + spacing;
            let now = Instant::now();
            if ready_at > now {
                trace!(host = host, wait_ms = (ready_at - now).as_millis() as u64, "Waiting for host spacing");
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at) => {}
                    _ = cancel.cancelled() => return false,
                }
            }
        }

        *last = Some(Instant::now());
        true
    }

    /// Drop hosts whose last request is older than `idle`
    ///
    /// Slots that are waited on or held stay. `idle` must not be shorter than
    /// the longest spacing in use. Returns how many hosts were dropped.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let mut hosts = self.hosts.write();
        let before = hosts.len();
        hosts.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(last) => last.is_some_and(|at| at.elapsed() < idle),
                Err(_) => true,
            }
        });

        let pruned = before - hosts.len();
        if pruned > 0 {
            trace!(pruned = pruned, remaining = hosts.len(), "Pruned idle hosts");
        }
        pruned
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().len()
    }
}

impl std::fmt::Debug for HostRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRateLimiter")
            .field("hosts", &self.host_count())
            .field("default_spacing", &self.default_spacing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_request_waits_for_spacing() {
        let limiter = HostRateLimiter::new(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(limiter.acquire("api.example.org", None, &cancel).await);
        assert!(limiter.acquire("api.example.org", None, &cancel).await);

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_are_independent() {
        let limiter = HostRateLimiter::new(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(limiter.acquire("a.example", None, &cancel).await);
        assert!(limiter.acquire("b.example", None, &cancel).await);

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_hosts_are_pruned() {
        let limiter = HostRateLimiter::new(Duration::from_secs(2));
        let cancel = CancellationToken::new();

        assert!(limiter.acquire("old.example", None, &cancel).await);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(limiter.acquire("fresh.example", None, &cancel).await);
        assert_eq!(limiter.host_count(), 2);

        assert_eq!(limiter.prune_idle(Duration::from_secs(60)), 1);
        assert_eq!(limiter.host_count(), 1);

        // A pruned host starts over without waiting
        let start = Instant::now();
        assert!(limiter.acquire("old.example", None, &cancel).await);
        assert!(start.elapsed() < Duration::from_secs(1));

        // The fresh host still enforces its spacing
        assert!(limiter.acquire("fresh.example", None, &cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_host_is_not_pruned() {
        let limiter = HostRateLimiter::new(Duration::from_secs(2));
        let cancel = CancellationToken::new();

        assert!(limiter.acquire("busy.example", None, &cancel).await);
        tokio::time::sleep(Duration::from_secs(120)).await;

        let slot = limiter.slot("busy.example");
        assert_eq!(limiter.prune_idle(Duration::from_secs(60)), 0);
        drop(slot);
        assert_eq!(limiter.prune_idle(Duration::from_secs(60)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let limiter = Arc::new(HostRateLimiter::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        assert!(limiter.acquire("slow.example", None, &cancel).await);

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("slow.example", None, &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
    }
}

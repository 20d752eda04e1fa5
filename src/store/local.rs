//! Single-process in-memory store.
//!
//! Suitable for development and single-replica deployments. Replicas do not
//! coordinate: each process enforces its own independent limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bucket::{self, BucketState, RateLimitResult};
use crate::clock::Clock;
use crate::config::RateLimitRule;
use crate::error::Result;
use crate::store::RateLimitStore;

struct LocalEntry {
    state: Option<BucketState>,
    expires_at: u64,
}

/// In-memory store keyed by rate limit key.
///
/// A background sweep evicts buckets idle for `2 x window_ms`, bounding
/// memory use under key churn (e.g. many distinct client addresses). The
/// sweep is an explicit lifecycle: [`start_sweep`](LocalStore::start_sweep)
/// / [`stop_sweep`](LocalStore::stop_sweep), so tests can create isolated
/// instances without spawning tasks.
pub struct LocalStore {
    entries: Arc<DashMap<String, LocalEntry>>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStore {
    /// Create a store without starting the sweep.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the idle-bucket sweep. A second call is a no-op.
    pub fn start_sweep(&self, interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = clock.now_ms();
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let evicted = before.saturating_sub(entries.len());
                if evicted > 0 {
                    debug!(evicted = evicted, "Swept idle rate limit buckets");
                }
            }
        }));
    }

    /// Stop the sweep task, if running.
    pub fn stop_sweep(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}

#[async_trait]
impl RateLimitStore for LocalStore {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult {
        let now = self.clock.now_ms();

        // The entry guard holds its shard lock across the read-modify-write,
        // so two concurrent checks on one key cannot both observe the same
        // token count.
        let mut entry = self.entries.entry(key.to_string()).or_insert(LocalEntry {
            state: None,
            expires_at: 0,
        });
        let (next, result) = bucket::attempt(entry.state.as_ref(), rule.limit, rule.window_ms, now);
        entry.state = Some(next);
        entry.expires_at = now + 2 * rule.window_ms;

        trace!(
            key = %key,
            allowed = result.allowed,
            remaining = result.remaining,
            "Checked rate limit"
        );
        result
    }

    async fn get(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult {
        let now = self.clock.now_ms();
        let state = self.entries.get(key).and_then(|entry| entry.state);
        bucket::peek(state.as_ref(), rule.limit, rule.window_ms, now)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (LocalStore, ManualClock) {
        let clock = ManualClock::starting_at(0);
        (LocalStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_check_consumes_and_get_peeks() {
        let (store, _clock) = store_with_clock();
        let rule = RateLimitRule::new(5, 60_000).unwrap();

        let result = store.check("k", &rule).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);

        // get reports the decision check would make, but never persists it.
        assert_eq!(store.get("k", &rule).await.remaining, 3);
        assert_eq!(store.get("k", &rule).await.remaining, 3);
        assert_eq!(store.check("k", &rule).await.remaining, 3);
    }

    #[tokio::test]
    async fn test_denies_when_empty_and_refills_over_time() {
        let (store, clock) = store_with_clock();
        let rule = RateLimitRule::new(2, 1_000).unwrap();

        assert!(store.check("k", &rule).await.allowed);
        assert!(store.check("k", &rule).await.allowed);
        assert!(!store.check("k", &rule).await.allowed);

        // Half the window replenishes one of the two tokens.
        clock.advance(500);
        assert!(store.check("k", &rule).await.allowed);
        assert!(!store.check("k", &rule).await.allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (store, _clock) = store_with_clock();
        let rule = RateLimitRule::new(1, 60_000).unwrap();

        assert!(store.check("a", &rule).await.allowed);
        assert!(!store.check("a", &rule).await.allowed);
        assert!(store.check("b", &rule).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_forgets_key() {
        let (store, _clock) = store_with_clock();
        let rule = RateLimitRule::new(1, 60_000).unwrap();

        assert!(store.check("k", &rule).await.allowed);
        assert!(!store.check("k", &rule).await.allowed);

        store.reset("k").await.unwrap();
        assert!(store.check("k", &rule).await.allowed);
    }

    #[tokio::test]
    async fn test_no_double_consume_under_contention() {
        let (store, _clock) = store_with_clock();
        let store = Arc::new(store);
        let rule = RateLimitRule::new(10, 60_000).unwrap();

        let mut handles = Vec::new();
        for _ in 0..30 {
            let store = Arc::clone(&store);
            let rule = rule.clone();
            handles.push(tokio::spawn(
                async move { store.check("k", &rule).await.allowed },
            ));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_buckets() {
        let (store, clock) = store_with_clock();
        let rule = RateLimitRule::new(5, 1_000).unwrap();

        store.check("k", &rule).await;
        assert_eq!(store.bucket_count(), 1);

        // Idle past 2x the window, then let the sweep run.
        clock.advance(2_001);
        store.start_sweep(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.bucket_count(), 0);
        store.stop_sweep();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_active_buckets() {
        let (store, _clock) = store_with_clock();
        let rule = RateLimitRule::new(5, 60_000).unwrap();

        store.check("k", &rule).await;
        store.start_sweep(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.bucket_count(), 1);
        store.stop_sweep();
    }
}

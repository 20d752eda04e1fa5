//! Storage backends for bucket state.
//!
//! Both backends run the same token bucket math; they differ in where
//! [`BucketState`](crate::bucket::BucketState) lives and how concurrent
//! access to it is serialized. [`LocalStore`] keeps buckets in process
//! memory; [`PartitionedStore`] routes every key to its own single-writer
//! actor backed by durable storage.

mod local;
pub mod partitioned;

pub use local::LocalStore;
pub use partitioned::{BucketStorage, MemoryStorage, PartitionedStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bucket::RateLimitResult;
use crate::clock::Clock;
use crate::config::{RateLimitRule, StoreConfig};
use crate::error::{FloodgateError, Result};

/// Trait for rate limit store implementations.
///
/// This trait abstracts over the local and partitioned backends to allow the
/// middleware to work with either. `check` and `get` never fail: backends
/// with fallible internals resolve faults to a fail-open decision.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Consume one token for `key` under `rule` and report the decision.
    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult;

    /// Report the decision `check` would make, without consuming.
    async fn get(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult;

    /// Forget all state for `key`. Test harness support; not every backend
    /// implements it.
    async fn reset(&self, _key: &str) -> Result<()> {
        Err(FloodgateError::Unsupported("reset"))
    }
}

/// Backend selection for [`create_store`]. Exhaustive over the two
/// supported backends, so an unknown store type is unrepresentable.
pub enum StoreOptions {
    /// Single-process in-memory store with a background idle-bucket sweep.
    Memory {
        /// How often the sweep runs.
        sweep_interval: Duration,
    },
    /// Partitioned actor store bound to a durable storage handle.
    Partitioned {
        /// Durable per-key bucket storage.
        storage: Arc<dyn BucketStorage>,
    },
}

impl StoreOptions {
    /// Memory store with the default 60 second sweep interval.
    pub fn memory() -> Self {
        StoreOptions::Memory {
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Resolve a declared [`StoreConfig`] into buildable options. The
    /// partitioned backend needs a storage handle, which configuration files
    /// cannot express; omitting it is a configuration error.
    pub fn from_config(
        config: &StoreConfig,
        storage: Option<Arc<dyn BucketStorage>>,
    ) -> Result<Self> {
        match config {
            StoreConfig::Memory {
                sweep_interval_secs,
            } => Ok(StoreOptions::Memory {
                sweep_interval: Duration::from_secs(*sweep_interval_secs),
            }),
            StoreConfig::Partitioned => {
                let storage = storage.ok_or_else(|| {
                    FloodgateError::Config(
                        "partitioned store requires a storage backend".to_string(),
                    )
                })?;
                Ok(StoreOptions::Partitioned { storage })
            }
        }
    }
}

/// Build the configured store. Must be called from within a tokio runtime;
/// the memory store starts its sweep task immediately.
pub fn create_store(options: StoreOptions, clock: Arc<dyn Clock>) -> Arc<dyn RateLimitStore> {
    match options {
        StoreOptions::Memory { sweep_interval } => {
            let store = LocalStore::new(clock);
            store.start_sweep(sweep_interval);
            Arc::new(store)
        }
        StoreOptions::Partitioned { storage } => Arc::new(PartitionedStore::new(storage, clock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FloodgateConfig;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_factory_builds_each_backend() {
        let clock = Arc::new(ManualClock::default());
        let rule = RateLimitRule::new(5, 60_000).unwrap();

        let memory = create_store(StoreOptions::memory(), clock.clone());
        assert!(memory.check("k", &rule).await.allowed);
        tokio_test::assert_ok!(memory.reset("k").await);

        let partitioned = create_store(
            StoreOptions::Partitioned {
                storage: Arc::new(MemoryStorage::new()),
            },
            clock,
        );
        assert!(partitioned.check("k", &rule).await.allowed);
        assert!(matches!(
            partitioned.reset("k").await,
            Err(FloodgateError::Unsupported("reset"))
        ));
    }

    #[tokio::test]
    async fn test_options_from_declared_config() {
        let config = FloodgateConfig::from_yaml(
            "store:\n  type: memory\n  sweep_interval_secs: 30\n",
        )
        .unwrap();
        let options = StoreOptions::from_config(&config.store, None).unwrap();
        assert!(matches!(
            options,
            StoreOptions::Memory { sweep_interval } if sweep_interval == Duration::from_secs(30)
        ));

        // The partitioned backend cannot be realized from the file alone.
        assert!(matches!(
            StoreOptions::from_config(&StoreConfig::Partitioned, None),
            Err(FloodgateError::Config(_))
        ));

        let options = StoreOptions::from_config(
            &StoreConfig::Partitioned,
            Some(Arc::new(MemoryStorage::new()) as Arc<dyn BucketStorage>),
        )
        .unwrap();
        let store = create_store(options, Arc::new(ManualClock::default()));
        let rule = RateLimitRule::new(5, 60_000).unwrap();
        assert!(store.check("k", &rule).await.allowed);
    }
}

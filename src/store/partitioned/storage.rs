//! Durable per-key bucket storage.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::bucket::BucketState;
use crate::error::Result;

/// Durable storage a bucket actor loads from and persists to.
///
/// Implementations must be safe to share across actors; each actor only
/// ever touches its own key. Faults surface as errors here and are
/// resolved to fail-open decisions by the actor.
#[async_trait]
pub trait BucketStorage: Send + Sync {
    /// Load the persisted state for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<BucketState>>;

    /// Persist the state for `key`.
    async fn save(&self, key: &str, state: &BucketState) -> Result<()>;
}

/// In-memory [`BucketStorage`] for development and tests. Durable only for
/// the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: DashMap<String, BucketState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<BucketState>> {
        Ok(self.buckets.get(key).map(|state| *state))
    }

    async fn save(&self, key: &str, state: &BucketState) -> Result<()> {
        self.buckets.insert(key.to_string(), *state);
        Ok(())
    }
}

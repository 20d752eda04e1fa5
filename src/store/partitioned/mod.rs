//! Partitioned actor store.
//!
//! Provides a linearizable per-key limiter across process boundaries by
//! routing every request for a key to the same logical single-writer actor.
//! The calling side only holds a location-transparent request/response
//! handle; it does not know or care where the actor runs.

mod actor;
mod protocol;
mod storage;

pub use protocol::{BucketAction, BucketRequest, BucketResponse};
pub use storage::{BucketStorage, MemoryStorage};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::bucket::RateLimitResult;
use crate::clock::Clock;
use crate::config::RateLimitRule;
use crate::store::RateLimitStore;

use actor::{ActorRegistry, BucketActor, Envelope};

/// Bound on each actor's inbox; per-key requests queue here in receipt
/// order.
const INBOX_CAPACITY: usize = 64;

/// Store that owns one [`BucketActor`] per rate limit key.
///
/// Actors are spawned lazily, hydrate their state from the supplied
/// [`BucketStorage`], and are logically infinite-lived; an actor idle past
/// twice its window retires, and the next request for its key respawns it
/// with state rehydrated from storage. This store does not implement
/// `reset`.
pub struct PartitionedStore {
    actors: ActorRegistry,
    storage: Arc<dyn BucketStorage>,
    clock: Arc<dyn Clock>,
}

impl PartitionedStore {
    pub fn new(storage: Arc<dyn BucketStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            storage,
            clock,
        }
    }

    fn handle_for(&self, key: &str) -> mpsc::Sender<Envelope> {
        self.actors
            .entry(key.to_string())
            .or_insert_with(|| {
                BucketActor::spawn(
                    key.to_string(),
                    Arc::downgrade(&self.actors),
                    Arc::clone(&self.storage),
                    Arc::clone(&self.clock),
                    INBOX_CAPACITY,
                )
            })
            .clone()
    }

    /// Route a request to the actor owning `key` and await its reply.
    async fn call(&self, key: &str, request: BucketRequest) -> BucketResponse {
        // One respawn attempt if the cached handle points at a dead actor.
        for _ in 0..2 {
            let tx = self.handle_for(key);
            let (reply, rx) = oneshot::channel();
            if tx.send(Envelope { request, reply }).await.is_err() {
                // Evict only the handle we found dead; a retiring actor may
                // already have replaced it with a fresh one.
                self.actors.remove_if(key, |_, cached| cached.same_channel(&tx));
                continue;
            }
            match rx.await {
                Ok(response) => return response,
                Err(_) => break,
            }
        }

        warn!(key = %key, "Bucket actor unreachable, failing open");
        BucketResponse::fail_open()
    }

    /// Number of live actor handles.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }
}

#[async_trait]
impl RateLimitStore for PartitionedStore {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult {
        self.call(
            key,
            BucketRequest {
                action: BucketAction::Check,
                limit: rule.limit,
                window_ms: rule.window_ms,
            },
        )
        .await
        .into()
    }

    async fn get(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult {
        self.call(
            key,
            BucketRequest {
                action: BucketAction::Get,
                limit: rule.limit,
                window_ms: rule.window_ms,
            },
        )
        .await
        .into()
    }
}

//! Floodgate - Token-Bucket Admission Control
//!
//! This crate implements a rate-limiting subsystem shared across many
//! process instances: a pure token bucket core, a single-process in-memory
//! store, a partitioned actor store that serializes all access to a key
//! through one single-writer actor with durable state and a self-scheduling
//! refill alarm, and a tower middleware that translates decisions into
//! `X-RateLimit-*` headers and 429 responses.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod store;

pub use bucket::{BucketState, RateLimitResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{presets, FloodgateConfig, RateLimitContext, RateLimitRule, StoreConfig};
pub use error::{FloodgateError, Result};
pub use middleware::{AuthenticatedUser, RateLimitLayer};
pub use store::{
    create_store, BucketStorage, LocalStore, MemoryStorage, PartitionedStore, RateLimitStore,
    StoreOptions,
};

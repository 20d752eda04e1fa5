//! Wire protocol between the store handle and a bucket actor.
//!
//! The request/response shapes are serde-serializable so any RPC-style
//! transport can carry them; field names follow the original JSON wire
//! format (`windowMs`, `resetInSeconds`). There is no authentication at
//! this layer: an actor trusts its routing layer to deliver only requests
//! addressed to its own key.

use serde::{Deserialize, Serialize};

use crate::bucket::RateLimitResult;

/// What the caller wants from the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketAction {
    /// Consume one token.
    Check,
    /// Peek without consuming.
    Get,
}

/// Request addressed to the actor owning one rate limit key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRequest {
    pub action: BucketAction,
    pub limit: u32,
    pub window_ms: u64,
}

/// Actor reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketResponse {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_seconds: u64,
    pub limit: u32,
}

impl BucketResponse {
    /// The reply sent when the actor hits an internal fault: the request is
    /// admitted, and `remaining: 0, limit: 0` signals that the figures are
    /// not trustworthy.
    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: 0,
            reset_in_seconds: 0,
            limit: 0,
        }
    }
}

impl From<RateLimitResult> for BucketResponse {
    fn from(result: RateLimitResult) -> Self {
        Self {
            allowed: result.allowed,
            remaining: result.remaining,
            reset_in_seconds: result.reset_in_seconds,
            limit: result.limit,
        }
    }
}

impl From<BucketResponse> for RateLimitResult {
    fn from(response: BucketResponse) -> Self {
        Self {
            allowed: response.allowed,
            remaining: response.remaining,
            reset_in_seconds: response.reset_in_seconds,
            limit: response.limit,
        }
    }
}

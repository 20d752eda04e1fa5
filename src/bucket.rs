//! Token bucket core.
//!
//! Pure, deterministic replenishment and consumption math, shared by every
//! storage backend. Backends differ only in where [`BucketState`] lives and
//! how concurrent access to it is serialized; the arithmetic here must be
//! identical across all of them, which is why every function takes an
//! explicit `now_ms` instead of reading a clock.

use serde::{Deserialize, Serialize};

/// Persisted per-key bucket state.
///
/// `tokens` may hold a fractional value between observations; the
/// `0 <= tokens <= limit` invariant is enforced at read/write boundaries.
/// The rule parameters are stored alongside the token count so that a
/// reconfigured rule can be detected and the bucket reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Current token count, possibly fractional.
    pub tokens: f64,
    /// Timestamp of the last refill, in milliseconds since the epoch.
    pub last_refill_at: u64,
    /// The limit this state was written under.
    pub limit: u32,
    /// The window this state was written under, in milliseconds.
    pub window_ms: u64,
}

impl BucketState {
    /// A full bucket as of `now_ms`.
    pub fn full(limit: u32, window_ms: u64, now_ms: u64) -> Self {
        Self {
            tokens: limit as f64,
            last_refill_at: now_ms,
            limit,
            window_ms,
        }
    }

    /// Whether the bucket holds its maximum token count.
    pub fn is_full(&self) -> bool {
        self.tokens >= self.limit as f64
    }
}

/// Outcome of a rate limit check. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Whole tokens left after the decision.
    pub remaining: u32,
    /// On denial, seconds until one token is available. On approval this is
    /// the time until the bucket is *full* (`ceil(window_ms / 1000)`), not
    /// the time until the next token accrues; the figure is kept for
    /// compatibility with the original wire behavior.
    pub reset_in_seconds: u64,
    /// The limit the decision was made under.
    pub limit: u32,
}

/// Replenish a bucket as of `now_ms`.
///
/// A missing state, or a state written under different rule parameters,
/// yields a fresh full bucket — a reconfigured rule resets its buckets
/// rather than interpolating. `last_refill_at` only advances when tokens
/// were actually added, so fractional progress is not lost on rapid
/// repeated calls within the same millisecond.
pub fn refill(state: Option<&BucketState>, limit: u32, window_ms: u64, now_ms: u64) -> BucketState {
    let state = match state {
        Some(s) if s.limit == limit && s.window_ms == window_ms => s,
        _ => return BucketState::full(limit, window_ms, now_ms),
    };

    let elapsed = now_ms.saturating_sub(state.last_refill_at);
    // Multiply before dividing: 12000ms at 5/60000 must yield exactly 1.0.
    let tokens_to_add = elapsed as f64 * limit as f64 / window_ms as f64;

    if tokens_to_add > 0.0 {
        BucketState {
            tokens: (state.tokens + tokens_to_add).min(limit as f64),
            last_refill_at: now_ms,
            limit,
            window_ms,
        }
    } else {
        *state
    }
}

/// Replenish and attempt to consume one token.
///
/// Returns the state to persist and the decision. A denied request leaves
/// the refilled token count untouched.
pub fn attempt(
    state: Option<&BucketState>,
    limit: u32,
    window_ms: u64,
    now_ms: u64,
) -> (BucketState, RateLimitResult) {
    let refilled = refill(state, limit, window_ms, now_ms);

    if refilled.tokens >= 1.0 {
        let next = BucketState {
            tokens: refilled.tokens - 1.0,
            ..refilled
        };
        let result = RateLimitResult {
            allowed: true,
            remaining: next.tokens as u32,
            reset_in_seconds: window_ms.div_ceil(1000),
            limit,
        };
        (next, result)
    } else {
        // Milliseconds until a whole token has accrued, rounded up to seconds.
        let ms_to_token = (1.0 - refilled.tokens) * window_ms as f64 / limit as f64;
        let result = RateLimitResult {
            allowed: false,
            remaining: refilled.tokens as u32,
            reset_in_seconds: (ms_to_token / 1000.0).ceil() as u64,
            limit,
        };
        (refilled, result)
    }
}

/// The decision [`attempt`] would make, without the state to persist.
/// Backends use this for non-mutating `get` peeks.
pub fn peek(
    state: Option<&BucketState>,
    limit: u32,
    window_ms: u64,
    now_ms: u64,
) -> RateLimitResult {
    attempt(state, limit, window_ms, now_ms).1
}

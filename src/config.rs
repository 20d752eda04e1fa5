//! Rule and service configuration.
//!
//! A [`RateLimitRule`] is the immutable per-rule configuration consumed by
//! every store: the bucket parameters plus the key-generator and skip hooks.
//! [`FloodgateConfig`] is the YAML-loadable service-level configuration for
//! deployments that declare their rules in a file.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Request attributes a rule can key or skip on.
///
/// Derived by the middleware from the incoming request; the core never
/// inspects the request itself.
#[derive(Debug, Clone)]
pub struct RateLimitContext {
    /// Resolved client address.
    pub ip: String,
    /// Request path.
    pub path: String,
    /// Request method.
    pub method: String,
    /// Authenticated user, when the caller's auth layer provided one.
    pub user_id: Option<String>,
}

/// Produces the bucket key for a request context.
pub type KeyGenerator = Arc<dyn Fn(&RateLimitContext) -> String + Send + Sync>;

/// Decides whether a request bypasses the rule without consuming a token.
pub type SkipPredicate = Arc<dyn Fn(&RateLimitContext) -> bool + Send + Sync>;

/// Default bucket key: per-user when authenticated, per-address otherwise.
fn default_key(ctx: &RateLimitContext) -> String {
    match &ctx.user_id {
        Some(user) => format!("user:{}", user),
        None => format!("ip:{}", ctx.ip),
    }
}

/// A single rate limit rule.
///
/// Immutable once built; multiple rules may be active simultaneously, each
/// independently keyed.
#[derive(Clone)]
pub struct RateLimitRule {
    /// Maximum tokens in the bucket.
    pub limit: u32,
    /// Replenishment window in milliseconds.
    pub window_ms: u64,
    /// Message returned in the denial body.
    pub message: String,
    key_generator: KeyGenerator,
    skip: SkipPredicate,
}

impl RateLimitRule {
    /// Create a rule. Zero `limit` or `window_ms` is a configuration error,
    /// reported at setup time rather than defaulted.
    pub fn new(limit: u32, window_ms: u64) -> Result<Self> {
        if limit == 0 {
            return Err(FloodgateError::Config(
                "limit must be greater than zero".to_string(),
            ));
        }
        if window_ms == 0 {
            return Err(FloodgateError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            limit,
            window_ms,
            message: "Too many requests, please try again later.".to_string(),
            key_generator: Arc::new(default_key),
            skip: Arc::new(|_| false),
        })
    }

    /// Replace the denial message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Replace the key generator.
    pub fn with_key_generator(
        mut self,
        generator: impl Fn(&RateLimitContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    /// Keep the default key generator but prepend a rule prefix, so rules
    /// sharing an identity still track independent buckets
    /// (e.g. `auth:user:42` vs `api:user:42`).
    pub fn with_key_prefix(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.with_key_generator(move |ctx| format!("{}{}", prefix, default_key(ctx)))
    }

    /// Replace the skip predicate.
    pub fn with_skip(
        mut self,
        skip: impl Fn(&RateLimitContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    /// The bucket key for a request context.
    pub fn key_for(&self, ctx: &RateLimitContext) -> String {
        (self.key_generator)(ctx)
    }

    /// Whether the request bypasses this rule.
    pub fn should_skip(&self, ctx: &RateLimitContext) -> bool {
        (self.skip)(ctx)
    }
}

impl fmt::Debug for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRule")
            .field("limit", &self.limit)
            .field("window_ms", &self.window_ms)
            .field("message", &self.message)
            .finish()
    }
}

/// Named rule presets.
pub mod presets {
    use super::RateLimitRule;

    const MINUTE_MS: u64 = 60_000;

    /// Strict limit for authentication endpoints: 5 requests per minute.
    pub fn auth() -> RateLimitRule {
        RateLimitRule::new(5, MINUTE_MS)
            .expect("preset parameters are valid")
            .with_key_prefix("auth:")
            .with_message("Too many authentication attempts, please try again later.")
    }

    /// Moderate limit for AI endpoints: 20 requests per minute.
    pub fn ai() -> RateLimitRule {
        RateLimitRule::new(20, MINUTE_MS)
            .expect("preset parameters are valid")
            .with_key_prefix("ai:")
            .with_message("Too many AI requests, please slow down.")
    }

    /// Lenient limit for general API traffic: 100 requests per minute.
    pub fn api() -> RateLimitRule {
        RateLimitRule::new(100, MINUTE_MS)
            .expect("preset parameters are valid")
            .with_key_prefix("api:")
    }
}

/// Service-level configuration, loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Which store backend to use.
    #[serde(default)]
    pub store: StoreConfig,

    /// Declared rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Single-process in-memory store.
    Memory {
        /// Idle-bucket sweep interval in seconds.
        #[serde(default = "default_sweep_interval_secs")]
        sweep_interval_secs: u64,
    },
    /// Partitioned actor store; the storage handle is supplied in code.
    Partitioned,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// A declared rule, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, used for logging and as the default key prefix.
    pub name: String,
    /// Maximum requests per window.
    pub limit: u32,
    /// Window duration in milliseconds.
    pub window_ms: u64,
    /// Key prefix; defaults to `{name}:`.
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Denial message override.
    #[serde(default)]
    pub message: Option<String>,
}

impl RuleConfig {
    /// Validate and build the runtime rule.
    pub fn build(&self) -> Result<RateLimitRule> {
        let prefix = self
            .key_prefix
            .clone()
            .unwrap_or_else(|| format!("{}:", self.name));

        let mut rule = RateLimitRule::new(self.limit, self.window_ms)
            .map_err(|e| FloodgateError::Config(format!("rule '{}': {}", self.name, e)))?
            .with_key_prefix(prefix);
        if let Some(message) = &self.message {
            rule = rule.with_message(message.clone());
        }
        Ok(rule)
    }
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading rate limit configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate and build all declared rules.
    pub fn build_rules(&self) -> Result<Vec<(String, RateLimitRule)>> {
        self.rules
            .iter()
            .map(|r| Ok((r.name.clone(), r.build()?)))
            .collect()
    }
}

//! Coordinator configuration
//!
//! Defaults match a production backend node; tests override the key
//! prefix so independent elections never collide.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{LeaderError, Result};

/// Default key prefix for campaign state
pub const DEFAULT_KEY_PREFIX: &str = "/leader/";

/// Default prefix for generated node names
pub const DEFAULT_NODE_PREFIX: &str = "backend";

/// Retry policy applied when a campaign attempt fails
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CampaignRetry {
    /// Stay out of the election until the process restarts
    Never,
    /// Exponential backoff between attempts
    Backoff {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound for any single delay
        max: Duration,
        /// Growth factor between attempts
        multiplier: f64,
        /// Give up after this many failed attempts
        max_attempts: Option<u32>,
    },
}

impl Default for CampaignRetry {
    fn default() -> Self {
        CampaignRetry::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl CampaignRetry {
    /// Delay before retry number `attempt` (1-based), or `None` to give up
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            CampaignRetry::Never => None,
            CampaignRetry::Backoff {
                initial,
                max,
                multiplier,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|limit| attempt > limit) {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    return Some(*max);
                }
                Some(Duration::from_secs_f64(secs))
            }
        }
    }
}

/// Configuration for a leader coordinator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Key prefix the election lives under
    pub key_prefix: String,
    /// Prefix for generated node names
    pub node_prefix: String,
    /// Lease TTL of the election session
    pub session_ttl: Duration,
    /// Status log interval, zero disables the reporter
    pub log_interval: Duration,
    /// Capacity of the work submission channel
    pub work_queue_depth: usize,
    /// What to do when a campaign fails
    pub campaign_retry: CampaignRetry,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            node_prefix: DEFAULT_NODE_PREFIX.into(),
            session_ttl: Duration::from_secs(15),
            log_interval: Duration::from_secs(10),
            work_queue_depth: 1,
            campaign_retry: CampaignRetry::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_node_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.node_prefix = prefix.into();
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn with_work_queue_depth(mut self, depth: usize) -> Self {
        self.work_queue_depth = depth;
        self
    }

    pub fn with_campaign_retry(mut self, retry: CampaignRetry) -> Self {
        self.campaign_retry = retry;
        self
    }

    /// Load overrides from `LEADER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("LEADER_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(prefix) = lookup("LEADER_NODE_PREFIX") {
            config.node_prefix = prefix;
        }
        if let Some(secs) = lookup("LEADER_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(parse_number("LEADER_SESSION_TTL_SECS", &secs)?);
        }
        if let Some(secs) = lookup("LEADER_LOG_INTERVAL_SECS") {
            config.log_interval = Duration::from_secs(parse_number("LEADER_LOG_INTERVAL_SECS", &secs)?);
        }
        if let Some(depth) = lookup("LEADER_WORK_QUEUE_DEPTH") {
            config.work_queue_depth = parse_number("LEADER_WORK_QUEUE_DEPTH", &depth)? as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the supervisor relies on
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() || !self.key_prefix.ends_with('/') {
            return Err(LeaderError::InvalidConfig {
                reason: format!("key prefix {:?} must be non-empty and end with '/'", self.key_prefix),
            });
        }
        if self.node_prefix.is_empty() {
            return Err(LeaderError::InvalidConfig {
                reason: "node prefix must not be empty".into(),
            });
        }
        if self.session_ttl.is_zero() {
            return Err(LeaderError::InvalidConfig {
                reason: "session TTL must be greater than zero".into(),
            });
        }
        if self.work_queue_depth == 0 {
            return Err(LeaderError::InvalidConfig {
                reason: "work queue depth must be at least 1".into(),
            });
        }
        if let CampaignRetry::Backoff { multiplier, .. } = self.campaign_retry {
            if !(multiplier >= 1.0) {
                return Err(LeaderError::InvalidConfig {
                    reason: format!("backoff multiplier {} must be >= 1.0", multiplier),
                });
            }
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|e| LeaderError::InvalidConfig {
        reason: format!("{}={:?}: {}", key, value, e),
    })
}

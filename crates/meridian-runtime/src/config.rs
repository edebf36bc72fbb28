//! Runtime configuration
//!
//! Defaults can be overlaid from environment variables or parsed from JSON:
//!
//! ```rust
//! use meridian_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "rendezvous": { "terminate_after_ms": 500 } }"#).unwrap();
//! assert_eq!(config.rendezvous.terminate_after_ms, 500);
//! assert_eq!(config.rendezvous.warn_after_ms, 10_000);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Timeouts applied to every rendezvous and clique-id exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Log the stragglers once waiting exceeds this
    pub warn_after_ms: u64,

    /// Abort the rendezvous for every waiter after this
    pub terminate_after_ms: u64,
}

impl RendezvousConfig {
    pub fn warn_after(&self) -> Duration {
        Duration::from_millis(self.warn_after_ms)
    }

    pub fn terminate_after(&self) -> Duration {
        Duration::from_millis(self.terminate_after_ms)
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            warn_after_ms: 10_000,
            terminate_after_ms: 30_000,
        }
    }
}

/// Flags that switch error-vs-noop behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    /// Reject steps that are not bit-reproducible
    pub deterministic_ops: bool,

    /// Treat unregistered custom calls as no-ops
    pub mock_unimplemented_custom_calls: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub rendezvous: RendezvousConfig,
    pub debug: DebugOptions,
}

impl RuntimeConfig {
    /// Defaults overlaid with environment variables
    ///
    /// - `MERIDIAN_RENDEZVOUS_WARN_MS`
    /// - `MERIDIAN_RENDEZVOUS_TERMINATE_MS`
    /// - `MERIDIAN_DETERMINISTIC_OPS` - `true`/`1`/`yes`
    /// - `MERIDIAN_MOCK_CUSTOM_CALLS` - `true`/`1`/`yes`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("MERIDIAN_RENDEZVOUS_WARN_MS") {
            config.rendezvous.warn_after_ms = ms;
        }
        if let Some(ms) = env_u64("MERIDIAN_RENDEZVOUS_TERMINATE_MS") {
            config.rendezvous.terminate_after_ms = ms;
        }
        if let Some(flag) = env_flag("MERIDIAN_DETERMINISTIC_OPS") {
            config.debug.deterministic_ops = flag;
        }
        if let Some(flag) = env_flag("MERIDIAN_MOCK_CUSTOM_CALLS") {
            config.debug.mock_unimplemented_custom_calls = flag;
        }

        config
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid_argument(format!("invalid runtime config: {e}")))
    }

    pub fn with_rendezvous_timeouts(mut self, warn_after: Duration, terminate_after: Duration) -> Self {
        self.rendezvous.warn_after_ms = warn_after.as_millis() as u64;
        self.rendezvous.terminate_after_ms = terminate_after.as_millis() as u64;
        self
    }

    pub fn with_debug(mut self, debug: DebugOptions) -> Self {
        self.debug = debug;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|value| {
        let value = value.trim();
        value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes")
    })
}

//! Shared tracing configuration for the meridian workspace.
//!
//! Executables, integration tests and benches install their `tracing`
//! subscriber through this crate so that every binary reports dispatch,
//! clique and rendezvous events in the same shape.
//!
//! ```no_run
//! use meridian_tracing::{init_global_tracing, TracingConfig};
//!
//! init_global_tracing(&TracingConfig::from_env()).unwrap();
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;
use std::sync::Once;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

const PROFILE_VAR: &str = "MERIDIAN_TRACING_PROFILE";
const DIRECTIVES_VAR: &str = "MERIDIAN_TRACING_DIRECTIVES";
const FORMAT_VAR: &str = "MERIDIAN_TRACING_FORMAT";
const PERF_VAR: &str = "MERIDIAN_PERF_TRACING";
const PERF_THRESHOLD_VAR: &str = "MERIDIAN_PERF_THRESHOLD_US";

/// Failure to install the shared subscriber
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] TryInitError),
}

/// Preset a configuration starts from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    /// Pretty, coloured output for a terminal
    #[default]
    Local,
    /// JSON without colour codes for log collectors
    Ci,
    /// JSON with span close events and debug-level dispatch logging
    Performance,
}

impl FromStr for Profile {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "ci" => Ok(Self::Ci),
            "performance" | "perf" => Ok(Self::Performance),
            _ => Err(()),
        }
    }
}

/// Output format of the formatter layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl FromStr for TracingOutput {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// How the shared subscriber filters and formats events
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `meridian_runtime=debug`. `RUST_LOG` is
    /// consulted when unset, then `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub include_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Performance spans are always created; this controls whether they log.
    pub enable_performance_tracing: bool,
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(Profile::Local)
    }
}

impl TracingConfig {
    pub fn for_profile(profile: Profile) -> Self {
        let local = Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        };
        match profile {
            Profile::Local => local,
            Profile::Ci => Self {
                ansi: false,
                output: TracingOutput::Json,
                enable_performance_tracing: false,
                ..local
            },
            Profile::Performance => Self {
                directives: Some("meridian_runtime=debug,meridian_device=debug".to_string()),
                ansi: false,
                span_events: FmtSpan::CLOSE,
                output: TracingOutput::Json,
                enable_performance_tracing: true,
                ..local
            },
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(Profile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(Profile::Ci)
    }

    pub fn for_performance() -> Self {
        Self::for_profile(Profile::Performance)
    }

    /// Start from the profile named by `MERIDIAN_TRACING_PROFILE` and apply
    /// overrides.
    ///
    /// | Variable | Effect |
    /// |----------|--------|
    /// | `MERIDIAN_TRACING_DIRECTIVES` | replaces the filter directives |
    /// | `MERIDIAN_TRACING_FORMAT` | `pretty`, `compact` or `json` (json disables colour) |
    /// | `MERIDIAN_PERF_TRACING` | `true`, `1` or `yes` enables performance spans |
    /// | `MERIDIAN_PERF_THRESHOLD_US` | minimum span duration to log |
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let profile = env_value(PROFILE_VAR)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Some(directives) = env_value(DIRECTIVES_VAR) {
            config.directives = Some(directives);
        }
        if let Some(output) = env_value(FORMAT_VAR).and_then(|value| value.parse().ok()) {
            config.output = output;
            if output == TracingOutput::Json {
                config.ansi = false;
            }
        }
        if let Some(flag) = env_value(PERF_VAR) {
            config.enable_performance_tracing = matches!(flag.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(threshold) = env_value(PERF_THRESHOLD_VAR).and_then(|value| value.parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }
        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Non-empty, trimmed value of `key`
fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Filter and formatting layers, for callers composing their own registry
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.filter()?;
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    };
    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::set_enabled(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Install a compact test-writer subscriber once per process.
///
/// Later calls are no-ops.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_fmt::fmt()
            .compact()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

//! Performance-focused tracing utilities
//!
//! Timed spans with threshold filtering plus the standard events the
//! dispatcher emits for step execution, buffer allocation and rendezvous.
//!
//! ```rust
//! use meridian_tracing::performance::{record_allocation, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("initialize", Some(100));
//! // ... do work ...
//! drop(span); // Logged only if it took at least 100us
//!
//! record_allocation(3, 1024, "temp", 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX means "no threshold".
static THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Globally enable or disable span logging and set the default threshold.
pub fn set_enabled(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans are currently logged.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn default_threshold() -> Option<u64> {
    match THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        threshold => Some(threshold),
    }
}

/// RAII guard that measures a span and logs its duration on drop.
///
/// The duration is only logged when performance tracing is enabled and the
/// elapsed time reaches the threshold (the explicit one, or the global one
/// installed by [`set_enabled`]).
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a debug-level span.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a span at the given level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us: threshold_us.or_else(default_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Nanoseconds since the span was created.
    pub fn elapsed_ns(&self) -> u64 {
        self.start_time.elapsed().as_nanos() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = elapsed_us, "performance_span_complete");
        }
    }
}

/// Record one step dispatched by the execution engine.
pub fn record_step(annotation: &str, phase: &str, duration_ns: u64) {
    tracing::debug!(
        event = "step",
        annotation = annotation,
        phase = phase,
        duration_ns = duration_ns,
        "step_dispatched"
    );
}

/// Record a buffer allocation made while binding an allocation slot.
pub fn record_allocation(slot: usize, size_bytes: usize, slot_kind: &str, memory_space: u32) {
    tracing::debug!(
        event = "allocation",
        slot = slot,
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        slot_kind = slot_kind,
        memory_space = memory_space,
        "buffer_allocation"
    );
}

/// Record how long a participant waited at a rendezvous point.
pub fn record_rendezvous(key: &str, participants: usize, wait_us: u64) {
    tracing::debug!(
        event = "rendezvous",
        key = key,
        participants = participants,
        wait_us = wait_us,
        "rendezvous_complete"
    );
}

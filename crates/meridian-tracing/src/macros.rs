//! Convenience macros for performance tracing

/// Create a [`PerformanceSpan`](crate::performance::PerformanceSpan) with
/// optional structured fields.
///
/// ```rust
/// use meridian_tracing::perf_span;
///
/// {
///     let _span = perf_span!("execute_steps", steps = 12);
///     // ... dispatch ...
/// } // Logs the duration with the captured fields
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = ::tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug-level performance event.
///
/// ```rust
/// use meridian_tracing::perf_event;
///
/// perf_event!("streams_borrowed", count = 2, priority = "highest");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        ::tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

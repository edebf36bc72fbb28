//! Execution profiling
//!
//! An [`ExecutionProfile`] passed in the run options accumulates timings
//! across executions:
//!
//! - **Executions**: count and wall-clock compute time
//! - **Phases**: prepare, acquire, initialize and execute durations
//! - **Steps**: per-annotation count and total execute time
//!
//! Snapshots serialize with serde for export.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregated timings of one step annotation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepStats {
    pub count: u64,
    pub total: Duration,
}

impl StepStats {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Point-in-time copy of an [`ExecutionProfile`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    pub executions: u64,
    pub compute_time: Duration,
    pub phases: BTreeMap<String, Duration>,
    pub steps: BTreeMap<String, StepStats>,
}

impl ProfileSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::internal(format!("profile serialization failed: {e}")))
    }
}

#[derive(Debug, Default)]
pub struct ExecutionProfile {
    data: Mutex<ProfileSnapshot>,
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self, duration: Duration) {
        let mut data = self.data.lock();
        data.executions += 1;
        data.compute_time += duration;
    }

    pub fn record_phase(&self, phase: &str, duration: Duration) {
        *self.data.lock().phases.entry(phase.to_string()).or_default() += duration;
    }

    pub fn record_step(&self, annotation: &str, duration: Duration) {
        let mut data = self.data.lock();
        let stats = data.steps.entry(annotation.to_string()).or_default();
        stats.count += 1;
        stats.total += duration;
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        self.data.lock().clone()
    }

    /// Log the accumulated profile via tracing
    pub fn log(&self) {
        let data = self.data.lock();
        tracing::info!(
            executions = data.executions,
            compute_time_us = data.compute_time.as_micros() as u64,
            steps = data.steps.len(),
            "execution_profile"
        );
        for (annotation, stats) in &data.steps {
            tracing::debug!(
                step = %annotation,
                count = stats.count,
                mean_ns = stats.mean().as_nanos() as u64,
                "execution_profile_step"
            );
        }
    }
}

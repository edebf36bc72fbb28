//! Phase driver for step sequences
//!
//! ```text
//! prepare ──► acquire cliques ──► [barrier] ──► initialize ──► execute
//! ```
//!
//! Each phase runs over the whole sequence and stops at the first error.
//! The barrier only runs when the sequence acquired at least one clique: it
//! keeps a participant from starting device setup while a peer is still
//! blocked inside communicator construction.

use crate::clique::{AcquiredCliques, CliqueRequests, CollectiveParams};
use crate::error::Result;
use crate::step::{PrepareParams, Step, StepContext};
use meridian_tracing::perf_span;
use std::time::Instant;

/// Run `steps` through every phase. `barrier_key` must be identical across
/// the participants of one run.
pub(crate) fn run_steps(steps: &[Step], ctx: &StepContext<'_>, barrier_key: &str) -> Result<()> {
    let params = ctx.prepare_params();
    let mut requests = CliqueRequests::new();
    timed(ctx, "prepare", || prepare_steps(steps, &params, &mut requests))?;

    let cliques = timed(ctx, "acquire", || acquire_cliques(&requests, ctx))?;
    let ctx = ctx.with_cliques(&cliques);
    if !cliques.is_empty() {
        timed(&ctx, "barrier", || startup_barrier(&ctx, barrier_key))?;
    }

    timed(&ctx, "initialize", || initialize_steps(steps, &ctx))?;
    timed(&ctx, "execute", || execute_steps(steps, &ctx))
}

pub(crate) fn prepare_steps(steps: &[Step], params: &PrepareParams<'_>, requests: &mut CliqueRequests) -> Result<()> {
    for step in steps {
        step.prepare(params, requests)?;
    }
    Ok(())
}

/// Prepare nested sequences and acquire what they declare.
pub(crate) fn acquire_nested(sequences: &[&[Step]], ctx: &StepContext<'_>) -> Result<AcquiredCliques> {
    let params = ctx.prepare_params();
    let mut requests = CliqueRequests::new();
    for steps in sequences {
        prepare_steps(steps, &params, &mut requests)?;
    }
    acquire_cliques(&requests, ctx)
}

pub(crate) fn initialize_steps(steps: &[Step], ctx: &StepContext<'_>) -> Result<()> {
    for step in steps {
        step.initialize(ctx)?;
    }
    Ok(())
}

pub(crate) fn execute_steps(steps: &[Step], ctx: &StepContext<'_>) -> Result<()> {
    for step in steps {
        let start = Instant::now();
        step.execute(ctx)?;
        let elapsed = start.elapsed();

        tracing::debug!(step = step.annotation(), kind = step.kind.name(), elapsed_us = elapsed.as_micros() as u64, "step dispatched");
        meridian_tracing::performance::record_step(
            step.annotation(),
            "execute",
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
        );
        if let Some(profile) = ctx.profile {
            profile.record_step(step.annotation(), elapsed);
        }
    }
    Ok(())
}

fn acquire_cliques(requests: &CliqueRequests, ctx: &StepContext<'_>) -> Result<AcquiredCliques> {
    requests.acquire(ctx.services.cliques(), ctx.collective, &ctx.services.config().rendezvous)
}

fn startup_barrier(ctx: &StepContext<'_>, key: &str) -> Result<()> {
    let participants = ctx.collective.map_or(1, CollectiveParams::num_local_participants);
    ctx.services
        .rendezvous()
        .barrier(key, participants, &ctx.services.config().rendezvous)
}

fn timed<T>(ctx: &StepContext<'_>, phase: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _span = perf_span!(phase);
    let start = Instant::now();
    let result = f();
    if let Some(profile) = ctx.profile {
        profile.record_phase(phase, start.elapsed());
    }
    result
}

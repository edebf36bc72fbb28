//! Keyed rendezvous between concurrently executing participants
//!
//! Every participant calls [`RendezvousHub::rendezvous`] with the same key
//! and participant count. The last arrival reduces all contributed values
//! and wakes everyone with the shared result. Stragglers are logged after
//! the warn interval; after the terminate interval the rendezvous fails
//! for every participant still waiting.

use crate::config::RendezvousConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct Round<V, R> {
    values: Vec<V>,
    outcome: Option<Result<Arc<R>>>,
}

struct RendezvousState<V, R> {
    num_participants: usize,
    round: Mutex<Round<V, R>>,
    completed: Condvar,
}

impl<V, R> RendezvousState<V, R> {
    fn is_complete(&self) -> bool {
        self.round.lock().outcome.is_some()
    }
}

type AnyState = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct RendezvousHub {
    states: Mutex<HashMap<String, AnyState>>,
}

impl RendezvousHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribute `value` and wait for `num_participants` contributions.
    ///
    /// The last arrival runs `reduce` over the values in arrival order.
    pub fn rendezvous<V, R, F>(
        &self,
        key: &str,
        num_participants: usize,
        value: V,
        reduce: F,
        config: &RendezvousConfig,
    ) -> Result<Arc<R>>
    where
        V: Send + 'static,
        R: Send + Sync + 'static,
        F: FnOnce(Vec<V>) -> Result<R>,
    {
        if num_participants == 0 {
            return Err(Error::invalid_argument(format!("rendezvous {key} needs at least one participant")));
        }

        let state = self.state::<V, R>(key, num_participants)?;
        let start = Instant::now();
        let mut round = state.round.lock();
        round.values.push(value);

        if round.values.len() == num_participants {
            let values = std::mem::take(&mut round.values);
            round.outcome = Some(reduce(values).map(Arc::new));
            state.completed.notify_all();
        } else {
            let warn_after = config.warn_after();
            let terminate_after = config.terminate_after();
            let mut warned = false;
            while round.outcome.is_none() {
                let elapsed = start.elapsed();
                if elapsed >= terminate_after {
                    tracing::error!(
                        key,
                        arrived = round.values.len(),
                        expected = num_participants,
                        "rendezvous terminated; participants may be deadlocked"
                    );
                    round.outcome = Some(Err(Error::DeadlineExceeded {
                        what: format!(
                            "rendezvous {key} ({} of {num_participants} participants arrived)",
                            round.values.len()
                        ),
                        timeout: terminate_after,
                    }));
                    state.completed.notify_all();
                    break;
                }
                if !warned && elapsed >= warn_after {
                    warned = true;
                    tracing::warn!(
                        key,
                        arrived = round.values.len(),
                        expected = num_participants,
                        waited_ms = elapsed.as_millis() as u64,
                        "rendezvous still waiting for participants"
                    );
                }
                let next = if warned { terminate_after } else { warn_after.min(terminate_after) };
                state.completed.wait_for(&mut round, next.saturating_sub(elapsed));
            }
        }

        let outcome = match round.outcome.as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(Error::internal(format!("rendezvous {key} woke without an outcome"))),
        };
        drop(round);
        self.retire(key, &state);

        meridian_tracing::performance::record_rendezvous(key, num_participants, start.elapsed().as_micros() as u64);
        outcome
    }

    /// Wait until `num_participants` callers reach `key`.
    pub fn barrier(&self, key: &str, num_participants: usize, config: &RendezvousConfig) -> Result<()> {
        self.rendezvous::<(), (), _>(key, num_participants, (), |_| Ok(()), config)
            .map(|_| ())
    }

    /// Rendezvous currently waiting for participants
    pub fn pending(&self) -> usize {
        self.states.lock().len()
    }

    fn state<V, R>(&self, key: &str, num_participants: usize) -> Result<Arc<RendezvousState<V, R>>>
    where
        V: Send + 'static,
        R: Send + Sync + 'static,
    {
        let mut states = self.states.lock();
        if let Some(existing) = states.get(key) {
            let existing = Arc::clone(existing)
                .downcast::<RendezvousState<V, R>>()
                .map_err(|_| Error::internal(format!("rendezvous {key} joined with mismatched value types")))?;
            if existing.num_participants != num_participants {
                return Err(Error::internal(format!(
                    "rendezvous {key} expects {} participants, joined with {num_participants}",
                    existing.num_participants
                )));
            }
            if !existing.is_complete() {
                return Ok(existing);
            }
        }

        let state = Arc::new(RendezvousState::<V, R> {
            num_participants,
            round: Mutex::new(Round {
                values: Vec::with_capacity(num_participants),
                outcome: None,
            }),
            completed: Condvar::new(),
        });
        states.insert(key.to_string(), Arc::clone(&state) as AnyState);
        Ok(state)
    }

    fn retire<V, R>(&self, key: &str, state: &Arc<RendezvousState<V, R>>)
    where
        V: Send + 'static,
        R: Send + Sync + 'static,
    {
        let mut states = self.states.lock();
        let current = states
            .get(key)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s) as *const (), Arc::as_ptr(state) as *const ()));
        if current {
            states.remove(key);
        }
    }
}

//! Bounded, reusable rendezvous
//!
//! Workers block in [`Rendezvous::wait`] until all parties have arrived, then
//! they are released together and the rendezvous resets for the next round.
//! A wait that exceeds the configured timeout fails with a timeout error and
//! breaks the rendezvous, so the parties still waiting fail immediately
//! instead of sitting out their own timeout.

use crate::error::{ExecutionError, ExecutionResult, UsageError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default bound on how long a party waits for the others
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct State {
    arrived: usize,
    generation: u64,
    broken: Option<String>,
    /// When the most recent round tripped
    released_at: Instant,
}

/// Outcome of a successful [`Rendezvous::wait`]
#[derive(Debug, Clone, Copy)]
pub struct Release {
    /// Round that was completed
    pub generation: u64,
    /// True for the party whose arrival tripped the rendezvous
    pub last_to_arrive: bool,
    /// Instant the round tripped, identical for every party of the round
    pub released_at: Instant,
}

/// Cyclic rendezvous for a fixed number of parties
#[derive(Debug)]
pub struct Rendezvous {
    parties: usize,
    timeout: Duration,
    state: Mutex<State>,
    released: Condvar,
}

impl Rendezvous {
    /// Create a rendezvous for `parties` participants
    ///
    /// # Errors
    ///
    /// Returns a usage error if `parties` is zero or `timeout` is zero.
    pub fn new(parties: usize, timeout: Duration) -> Result<Self, UsageError> {
        if parties == 0 {
            return Err(UsageError::invalid("parties", "rendezvous needs at least one party"));
        }
        if timeout.is_zero() {
            return Err(UsageError::invalid("timeout", "rendezvous timeout must be positive"));
        }
        Ok(Self {
            parties,
            timeout,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                broken: None,
                released_at: Instant::now(),
            }),
            released: Condvar::new(),
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of parties currently blocked in `wait`
    pub fn waiting(&self) -> usize {
        self.lock().arrived
    }

    pub fn is_broken(&self) -> bool {
        self.lock().broken.is_some()
    }

    /// Block until all parties arrive or the timeout expires
    ///
    /// # Errors
    ///
    /// - `Timeout` if this party waited longer than the configured timeout
    /// - `BarrierBroken` if another party timed out (or the rendezvous was
    ///   broken explicitly) before this round completed
    pub fn wait(&self) -> ExecutionResult<Release> {
        let mut state = self.lock();
        if let Some(reason) = &state.broken {
            return Err(ExecutionError::BarrierBroken {
                reason: reason.clone(),
            });
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            state.released_at = Instant::now();
            self.released.notify_all();
            return Ok(Release {
                generation,
                last_to_arrive: true,
                released_at: state.released_at,
            });
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                let reason = format!(
                    "{} of {} parties arrived before the timeout",
                    state.arrived, self.parties
                );
                state.broken = Some(reason);
                self.released.notify_all();
                return Err(ExecutionError::Timeout {
                    what: format!("rendezvous of {} parties", self.parties),
                    after: self.timeout,
                });
            }

            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if state.generation != generation {
                return Ok(Release {
                    generation,
                    last_to_arrive: false,
                    released_at: state.released_at,
                });
            }
            if let Some(reason) = &state.broken {
                return Err(ExecutionError::BarrierBroken {
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Break the rendezvous, failing current and future waiters
    pub fn break_with(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        state.broken = Some(reason.into());
        self.released.notify_all();
    }

    /// Clear a broken state so the rendezvous can be used again
    ///
    /// Returns false (and breaks the rendezvous instead) if parties are still
    /// waiting in the current round.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        if state.arrived > 0 && state.broken.is_none() {
            state.broken = Some("rendezvous reset while parties were waiting".to_string());
            self.released.notify_all();
            return false;
        }
        state.arrived = 0;
        state.broken = None;
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

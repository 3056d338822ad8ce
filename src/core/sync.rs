// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use crate::macros::log_debug;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// Work units never run while the mutex is held, so poisoning can only come
/// from a bug in this crate; the inner value is recovered in that case.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes up all the threads waiting on this status. The caller should
    /// have updated the status beforehand.
    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }

    /// Wakes up one thread waiting on this status.
    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    /// Waits with the given guard until the predicate is false on this
    /// status.
    pub fn wait_while<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        self.condvar
            .wait_while(guard, predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether workers rendezvous after a stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BarrierMode {
    /// No worker starts the next stage until all workers have finished this
    /// one.
    #[default]
    Wait,
    /// Each worker moves on to the next stage as soon as it is done with this
    /// one. Only safe if the next stage doesn't read anything written by
    /// another worker in this stage.
    NoWait,
}

/// State of a [`StageBarrier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BarrierState {
    /// Workers are arriving; this many have arrived so far.
    Waiting(usize),
    /// All workers have arrived. This state is terminal.
    Released,
}

/// A single-use rendezvous point for all the workers of a team.
///
/// A fresh barrier is created for each synchronization point of a region.
/// Once released, it stays released and [`arrive()`](Self::arrive) returns
/// immediately.
pub struct StageBarrier {
    /// Number of workers that must arrive before the barrier is released.
    team_size: usize,
    /// Current state, guarded by the mutex.
    state: Status<BarrierState>,
}

impl StageBarrier {
    /// Creates a barrier for a team of the given size.
    pub fn new(team_size: usize) -> Self {
        Self {
            team_size,
            state: Status::new(BarrierState::Waiting(0)),
        }
    }

    /// Blocks until all the workers of the team have arrived. `worker` is the
    /// caller's index in the team, which only appears in log messages.
    ///
    /// Returns `true` for the worker whose arrival released the barrier.
    pub fn arrive(&self, _worker: usize) -> bool {
        let mut guard = self.state.lock();
        match *guard {
            BarrierState::Released => false,
            BarrierState::Waiting(arrived) => {
                let arrived = arrived + 1;
                if arrived >= self.team_size {
                    log_debug!(
                        "[thread {_worker}] Last to arrive, releasing {} workers",
                        self.team_size
                    );
                    *guard = BarrierState::Released;
                    drop(guard);
                    self.state.notify_all();
                    true
                } else {
                    *guard = BarrierState::Waiting(arrived);
                    log_debug!(
                        "[thread {_worker}] Waiting at barrier ({arrived}/{})",
                        self.team_size
                    );
                    let guard = self
                        .state
                        .wait_while(guard, |state| *state != BarrierState::Released);
                    drop(guard);
                    false
                }
            }
        }
    }

    /// Whether all the workers have arrived.
    pub fn is_released(&self) -> bool {
        *self.state.lock() == BarrierState::Released
    }
}

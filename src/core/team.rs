// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A team of worker threads, brought up for one parallel region.

use crate::error::ConfigError;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::thread::{Scope, ScopedJoinHandle};

/// Number of threads in a team.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Interprets a requested thread count, where 0 means "use the available
    /// parallelism".
    pub fn from_requested(thread_count: usize) -> Self {
        match NonZeroUsize::new(thread_count) {
            Some(count) => ThreadCount::Count(count),
            None => ThreadCount::AvailableParallelism,
        }
    }

    /// Resolves the number of threads to spawn. Falls back to a single thread
    /// if the available parallelism cannot be queried.
    pub fn resolve(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed, using 1 thread: {_e}");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = ConfigError;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::new(thread_count).ok_or(ConfigError::InvalidTeamSize)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If pinning fails, the panic is raised
    /// on the calling thread once the team has exited.
    Always,
}

/// Lifecycle of a [`ThreadTeam`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamState {
    /// No worker thread is running.
    Idle,
    /// The workers are running the region.
    Active,
    /// The workers are being joined.
    Draining,
}

/// A fixed-size team of worker threads tied to a [`std::thread::scope`].
///
/// The team is brought up by [`enter()`](Self::enter), which runs the given
/// function once on each worker with the worker's index, and torn down by
/// [`exit()`](Self::exit), which joins every worker. Dropping an active team
/// exits it.
pub struct ThreadTeam<'scope, R> {
    /// Handles to the worker threads, in index order.
    handles: Vec<ScopedJoinHandle<'scope, R>>,
    /// Number of workers.
    size: usize,
    /// Current lifecycle state.
    state: TeamState,
    /// Workers that failed to pin themselves under [`CpuPinningPolicy::Always`].
    pinning_failures: &'scope Mutex<Vec<String>>,
}

impl<'scope, R: Send + 'scope> ThreadTeam<'scope, R> {
    /// Spawns `size` workers in the given scope, worker `k` running
    /// `worker_main(k)`.
    ///
    /// Fails without spawning anything if `size` is 0.
    pub fn enter<'env, F>(
        scope: &'scope Scope<'scope, 'env>,
        size: usize,
        cpu_pinning: CpuPinningPolicy,
        pinning_failures: &'scope Mutex<Vec<String>>,
        worker_main: &'scope F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(usize) -> R + Sync,
    {
        if size == 0 {
            log_error!("[main thread] Refusing to start a team without workers");
            return Err(ConfigError::InvalidTeamSize);
        }

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let handles = (0..size)
            .map(|id| {
                scope.spawn(move || {
                    pin_current_thread(id, cpu_pinning, pinning_failures);
                    worker_main(id)
                })
            })
            .collect();
        log_debug!("[main thread] Spawned {size} workers");

        Ok(Self {
            handles,
            size,
            state: TeamState::Active,
            pinning_failures,
        })
    }

    /// Number of workers in the team.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TeamState {
        self.state
    }

    /// Joins all the workers and returns their outcomes in index order. Once
    /// this returns, everything the workers ran has completed.
    ///
    /// # Panics
    ///
    /// Panics if a worker couldn't be pinned under
    /// [`CpuPinningPolicy::Always`].
    pub fn exit(&mut self) -> Vec<std::thread::Result<R>> {
        self.state = TeamState::Draining;
        log_debug!("[main thread] Joining {} workers...", self.handles.len());
        let outcomes = self
            .handles
            .drain(..)
            .enumerate()
            .map(|(_i, handle)| {
                let outcome = handle.join();
                if outcome.is_err() {
                    log_error!("[main thread] Worker {_i} terminated with a panic");
                }
                outcome
            })
            .collect();
        self.state = TeamState::Idle;
        log_debug!("[main thread] Joined workers.");

        let failures = std::mem::take(
            &mut *self
                .pinning_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(failure) = failures.first() {
            panic!("{failure}");
        }
        outcomes
    }
}

impl<R> Drop for ThreadTeam<'_, R> {
    fn drop(&mut self) {
        if self.state == TeamState::Active {
            log_debug!("[main thread] Dropping an active team, joining workers");
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
            self.state = TeamState::Idle;
        }
    }
}

/// Pins the calling worker thread to the CPU of the same index, following the
/// given policy.
#[allow(unused_variables)]
fn pin_current_thread(
    id: usize,
    cpu_pinning: CpuPinningPolicy,
    pinning_failures: &Mutex<Vec<String>>,
) {
    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    {
        if cpu_pinning == CpuPinningPolicy::No {
            return;
        }
        let mut cpu_set = CpuSet::new();
        let result = cpu_set
            .set(id)
            .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set));
        match (result, cpu_pinning) {
            (Ok(()), _) => log_debug!("Pinned thread #{id} to CPU #{id}"),
            (Err(_e), CpuPinningPolicy::IfSupported) => {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}")
            }
            (Err(e), _) => {
                log_error!("Failed to set CPU affinity for thread #{id}: {e}");
                // Keep running so that the other workers don't wait forever at
                // a barrier; the panic is raised by `exit()`.
                pinning_failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("Failed to set CPU affinity for thread #{id}: {e}"));
            }
        }
    }
}

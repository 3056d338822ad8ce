// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Combining per-worker partial results into shared values.

use crossbeam_utils::CachePadded;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// An associative and commutative operator with its identity element.
///
/// Each worker of a reduction stage seeds a private accumulator with the
/// identity and folds its chunks into it; the partials are then merged one by
/// one on the thread that runs the region, so the merge never races.
pub struct Reduction<'a, T> {
    /// Identity element of the operator.
    identity: T,
    /// The operator itself.
    combine: Box<dyn Fn(T, T) -> T + Send + Sync + 'a>,
}

impl<'a, T: Clone> Reduction<'a, T> {
    /// Creates a reduction from an identity element and an operator, assumed
    /// associative and commutative.
    pub fn new(identity: T, combine: impl Fn(T, T) -> T + Send + Sync + 'a) -> Self {
        Self {
            identity,
            combine: Box::new(combine),
        }
    }

    /// Returns a fresh copy of the identity element.
    pub fn identity(&self) -> T {
        self.identity.clone()
    }

    /// Applies the operator.
    pub fn combine(&self, a: T, b: T) -> T {
        (self.combine)(a, b)
    }

    /// Merges the given partials, in order, starting from the identity.
    pub fn merge(&self, partials: impl IntoIterator<Item = T>) -> T {
        partials
            .into_iter()
            .fold(self.identity(), |acc, partial| self.combine(acc, partial))
    }
}

impl<T: Clone + Default + Add<Output = T>> Reduction<'_, T> {
    /// Summation, with `T::default()` as the identity.
    pub fn sum() -> Self {
        Self::new(T::default(), |a, b| a + b)
    }
}

/// One slot per worker, where each worker deposits its partial result.
pub(crate) struct PartialSlots<T> {
    slots: Box<[CachePadded<Mutex<Option<T>>>]>,
}

impl<T> PartialSlots<T> {
    pub(crate) fn new(team_size: usize) -> Self {
        Self {
            slots: (0..team_size)
                .map(|_| CachePadded::new(Mutex::new(None)))
                .collect(),
        }
    }

    /// Stores the partial result of the given worker. Each worker only ever
    /// touches its own slot, so the lock is never contended.
    pub(crate) fn deposit(&self, worker: usize, partial: T) {
        *self.slots[worker]
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(partial);
    }

    /// Takes the partial results, in worker order. Workers that didn't
    /// deposit anything yield [`None`].
    pub(crate) fn take_all(&self) -> Vec<Option<T>> {
        self.slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect()
    }
}

/// A value that is only ever updated inside a critical section.
///
/// This is the serialized alternative to a reduction, for values written once
/// per worker (or per section) rather than once per item.
pub struct Critical<T> {
    value: Mutex<T>,
}

impl<T> Critical<T> {
    /// Wraps the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Runs `f` on the value, with mutual exclusion against every other
    /// update.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the final value.
    pub fn into_inner(self) -> T {
        self.value
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Critical<T> {
    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A shared `f64` maximum, updated with a compare-and-set loop.
///
/// The check and the write form one atomic step: concurrent calls to
/// [`fetch_max()`](Self::fetch_max) can never overwrite a larger value with a
/// smaller one, so the final value is the true maximum of everything
/// submitted. NaN inputs are ignored.
pub struct AtomicMax {
    bits: CachePadded<AtomicU64>,
}

impl AtomicMax {
    /// Creates a maximum starting at the given value.
    pub fn new(initial: f64) -> Self {
        Self {
            bits: CachePadded::new(AtomicU64::new(initial.to_bits())),
        }
    }

    /// Current value.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Raises the maximum to `value` if it is larger, returning the previous
    /// maximum.
    pub fn fetch_max(&self, value: f64) -> f64 {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let previous = f64::from_bits(current);
            // Written so that a NaN `value` never wins.
            if !(value > previous) {
                return previous;
            }
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return previous,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicMax {
    fn default() -> Self {
        Self::new(f64::NEG_INFINITY)
    }
}

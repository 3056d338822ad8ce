// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared arrays to observe, and optionally detect, unsynchronized accesses
//! between stages.

use crate::region::Worker;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Two different workers accessed the same element without a barrier in
/// between, and at least one of the accesses was a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RaceWarning {
    /// Index of the element.
    pub index: usize,
    /// Worker that wrote the element first.
    pub first_writer: usize,
    /// Worker that accessed the element next.
    pub second_writer: usize,
    /// Number of barriers both workers had crossed at the time.
    pub epoch: usize,
}

impl fmt::Display for RaceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsynchronized access to index {}: written by worker {} then accessed by worker {} in epoch {}",
            self.index, self.first_writer, self.second_writer, self.epoch
        )
    }
}

const REGION_BITS: u32 = 24;
const WRITER_BITS: u32 = 20;
const EPOCH_BITS: u32 = 20;

/// Last write to an element, packed into a `u64` so that it can be swapped
/// atomically. All zeros means "never written".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WriteStamp {
    region: u64,
    writer: usize,
    epoch: usize,
}

impl WriteStamp {
    fn of(worker: &Worker) -> Self {
        Self {
            region: worker.region_tag(),
            writer: worker.id(),
            epoch: worker.epoch(),
        }
    }

    fn pack(self) -> u64 {
        let region = self.region & ((1 << REGION_BITS) - 1);
        // The writer is shifted by one so that a packed stamp is never zero.
        let writer = (self.writer as u64 + 1) & ((1 << WRITER_BITS) - 1);
        let epoch = self.epoch as u64 & ((1 << EPOCH_BITS) - 1);
        (region << (WRITER_BITS + EPOCH_BITS)) | (writer << EPOCH_BITS) | epoch
    }

    fn unpack(packed: u64) -> Option<Self> {
        if packed == 0 {
            return None;
        }
        let writer = (packed >> EPOCH_BITS) & ((1 << WRITER_BITS) - 1);
        Some(Self {
            region: packed >> (WRITER_BITS + EPOCH_BITS),
            writer: (writer as usize).wrapping_sub(1),
            epoch: (packed & ((1 << EPOCH_BITS) - 1)) as usize,
        })
    }

    /// Whether `self` and `other` conflict: same region and same epoch, but
    /// different workers.
    fn conflicts_with(&self, other: &Self) -> bool {
        let mask = (1 << REGION_BITS) - 1;
        (self.region & mask) == (other.region & mask)
            && self.epoch == other.epoch
            && self.writer != other.writer
    }
}

/// An array of `f64` shared by all the workers of a region.
///
/// Elements are stored as atomic bit patterns, so every individual load and
/// store is well-defined. [`add_racy()`](Self::add_racy) is a plain load
/// followed by a plain store: two workers adding to the same element at the
/// same time can lose one of the updates, which is the observable symptom of
/// a missing barrier. [`add_atomic()`](Self::add_atomic) never loses updates.
///
/// An array built with [`instrumented()`](Self::instrumented) also remembers
/// the last writer of each element, and reports a [`RaceWarning`] when
/// another worker accesses the element without a barrier in between.
pub struct SharedArray {
    values: Box<[AtomicU64]>,
    stamps: Option<Box<[AtomicU64]>>,
}

impl SharedArray {
    /// Creates an array of `len` elements set to `value`.
    pub fn new(len: usize, value: f64) -> Self {
        Self {
            values: (0..len).map(|_| AtomicU64::new(value.to_bits())).collect(),
            stamps: None,
        }
    }

    /// Creates an array of `len` elements set to `value`, with race
    /// detection.
    pub fn instrumented(len: usize, value: f64) -> Self {
        Self {
            stamps: Some((0..len).map(|_| AtomicU64::new(0)).collect()),
            ..Self::new(len, value)
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether race detection is enabled.
    pub fn is_instrumented(&self) -> bool {
        self.stamps.is_some()
    }

    /// Reads an element from within a region.
    pub fn load(&self, worker: &Worker, index: usize) -> f64 {
        self.record_read(worker, index);
        self.get(index)
    }

    /// Writes an element from within a region.
    pub fn store(&self, worker: &Worker, index: usize, value: f64) {
        self.record_write(worker, index);
        self.values[index].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Adds to an element with a separate load and store. Concurrent updates
    /// of the same element can be lost.
    pub fn add_racy(&self, worker: &Worker, index: usize, value: f64) {
        self.record_write(worker, index);
        let current = f64::from_bits(self.values[index].load(Ordering::Relaxed));
        self.values[index].store((current + value).to_bits(), Ordering::Relaxed);
    }

    /// Adds to an element atomically.
    pub fn add_atomic(&self, worker: &Worker, index: usize, value: f64) {
        self.record_write(worker, index);
        let mut current = self.values[index].load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.values[index].compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reads an element outside of any region.
    pub fn get(&self, index: usize) -> f64 {
        f64::from_bits(self.values[index].load(Ordering::Relaxed))
    }

    /// Sets all the elements to `value` and forgets the recorded writers.
    pub fn reset(&mut self, value: f64) {
        for v in self.values.iter_mut() {
            *v.get_mut() = value.to_bits();
        }
        if let Some(stamps) = &mut self.stamps {
            for stamp in stamps.iter_mut() {
                *stamp.get_mut() = 0;
            }
        }
    }

    /// Copies the elements into a vector.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    fn record_write(&self, worker: &Worker, index: usize) {
        let Some(stamps) = &self.stamps else {
            return;
        };
        let stamp = WriteStamp::of(worker);
        let previous = stamps[index].swap(stamp.pack(), Ordering::AcqRel);
        self.check(worker, index, previous, stamp);
    }

    fn record_read(&self, worker: &Worker, index: usize) {
        let Some(stamps) = &self.stamps else {
            return;
        };
        let previous = stamps[index].load(Ordering::Acquire);
        self.check(worker, index, previous, WriteStamp::of(worker));
    }

    fn check(&self, worker: &Worker, index: usize, previous: u64, stamp: WriteStamp) {
        if let Some(previous) = WriteStamp::unpack(previous) {
            if previous.conflicts_with(&stamp) {
                worker.report_race(RaceWarning {
                    index,
                    first_writer: previous.writer,
                    second_writer: stamp.writer,
                    epoch: stamp.epoch,
                });
            }
        }
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("values", &self.to_vec())
            .field("instrumented", &self.is_instrumented())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stamp_packing() {
        let stamp = WriteStamp {
            region: 5,
            writer: 3,
            epoch: 7,
        };
        assert_eq!(WriteStamp::unpack(stamp.pack()), Some(stamp));
        assert_eq!(WriteStamp::unpack(0), None);

        let first = WriteStamp {
            region: 1,
            writer: 0,
            epoch: 0,
        };
        assert_ne!(first.pack(), 0);
        assert_eq!(WriteStamp::unpack(first.pack()), Some(first));
    }

    #[test]
    fn test_stamp_conflicts() {
        let stamp = |region, writer, epoch| WriteStamp {
            region,
            writer,
            epoch,
        };
        assert!(stamp(1, 0, 2).conflicts_with(&stamp(1, 1, 2)));
        // Same worker.
        assert!(!stamp(1, 0, 2).conflicts_with(&stamp(1, 0, 2)));
        // Separated by a barrier.
        assert!(!stamp(1, 0, 2).conflicts_with(&stamp(1, 1, 3)));
        // Different regions.
        assert!(!stamp(1, 0, 2).conflicts_with(&stamp(2, 1, 2)));
    }

    #[test]
    fn test_array_outside_region() {
        let mut array = SharedArray::new(4, 1.5);
        assert_eq!(array.len(), 4);
        assert!(!array.is_empty());
        assert!(!array.is_instrumented());
        assert_eq!(array.to_vec(), vec![1.5; 4]);
        array.reset(0.0);
        assert_eq!(array.get(3), 0.0);
        assert!(SharedArray::instrumented(2, 0.0).is_instrumented());
    }
}

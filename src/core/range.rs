// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Iteration spaces and the schedules that split them into chunks.

use crate::error::ConfigError;
use crate::macros::log_debug;
use crossbeam_utils::CachePadded;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Environment variable read by [`Schedule::Runtime`].
///
/// Accepted values are `static`, `static,N`, `dynamic`, `dynamic,N`, `guided`
/// and `guided,N` (case-insensitive).
pub const SCHEDULE_ENV_VAR: &str = "WORKSHARE_SCHEDULE";

/// A range of indices `[lo, hi)` visited with a fixed stride.
///
/// Schedules work on logical positions `0..len()`; position `p` corresponds
/// to the index `lo + p * stride`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationSpace {
    lo: usize,
    hi: usize,
    stride: usize,
}

impl IterationSpace {
    /// Creates a space visiting every index of the given range.
    pub fn new(range: std::ops::Range<usize>) -> Self {
        Self::with_stride(range, 1)
    }

    /// Creates a space visiting every `stride`-th index of the given range,
    /// starting at `range.start`.
    pub fn with_stride(range: std::ops::Range<usize>, stride: usize) -> Self {
        Self {
            lo: range.start,
            hi: range.end,
            stride,
        }
    }

    /// First index of the space (inclusive).
    pub fn lo(&self) -> usize {
        self.lo
    }

    /// Upper bound of the space (exclusive).
    pub fn hi(&self) -> usize {
        self.hi
    }

    /// Distance between two consecutive indices.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of indices in the space.
    pub fn len(&self) -> usize {
        if self.stride == 0 || self.hi <= self.lo {
            0
        } else {
            (self.hi - self.lo).div_ceil(self.stride)
        }
    }

    /// Whether the space contains no index.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a logical position in `0..len()` to its index.
    #[inline(always)]
    pub fn index(&self, position: usize) -> usize {
        self.lo + position * self.stride
    }

    pub(crate) fn validate(&self, stage: usize) -> Result<(), ConfigError> {
        if self.stride == 0 {
            Err(ConfigError::ZeroStride { stage })
        } else if self.is_empty() {
            Err(ConfigError::EmptyIterationSpace { stage })
        } else {
            Ok(())
        }
    }
}

impl From<std::ops::Range<usize>> for IterationSpace {
    fn from(range: std::ops::Range<usize>) -> Self {
        Self::new(range)
    }
}

/// A contiguous run of logical positions handed to one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// First logical position.
    pub start: usize,
    /// Number of positions.
    pub count: usize,
    /// Worker that executes this chunk.
    pub owner: usize,
}

impl Chunk {
    /// Logical positions covered by this chunk.
    pub fn positions(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.count
    }

    /// Indices of the given space covered by this chunk.
    pub fn indices(self, space: IterationSpace) -> impl Iterator<Item = usize> {
        self.positions().map(move |p| space.index(p))
    }
}

/// Policy to distribute the positions of an [`IterationSpace`] among the
/// workers of a team.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Each worker owns one contiguous block of near-equal length. Worker `k`
    /// owns the same block in every stage over the same space.
    Static,
    /// Chunks of the given size are dealt round-robin: chunk `j` goes to
    /// worker `j % team_size`. Like [`Static`](Self::Static), the mapping is
    /// the same in every stage.
    StaticCyclic(usize),
    /// Workers pull chunks of the given size from a shared cursor on demand.
    /// Which worker gets which chunk varies from run to run.
    Dynamic(usize),
    /// Like [`Dynamic`](Self::Dynamic), but chunks start large and shrink as
    /// the space drains, down to the given minimum.
    Guided(usize),
    /// Resolved when the region starts, from the [`SCHEDULE_ENV_VAR`]
    /// environment variable. Falls back to [`Static`](Self::Static) if the
    /// variable is unset.
    Runtime,
}

impl Schedule {
    /// Whether a position is guaranteed to be owned by the same worker in
    /// every stage of a region. Only stable schedules allow dropping the
    /// barrier between stages that read each other's outputs.
    pub fn is_stable(&self) -> bool {
        matches!(self, Schedule::Static | Schedule::StaticCyclic(_))
    }

    /// Resolves [`Runtime`](Self::Runtime) into a concrete schedule. Other
    /// schedules are returned unchanged.
    pub fn resolve(self) -> Result<Schedule, ConfigError> {
        match self {
            Schedule::Runtime => match std::env::var(SCHEDULE_ENV_VAR) {
                Ok(value) => {
                    let schedule: Schedule = value.parse()?;
                    log_debug!("Resolved runtime schedule {value:?} to {schedule:?}");
                    Ok(schedule)
                }
                Err(_) => Ok(Schedule::Static),
            },
            schedule => Ok(schedule),
        }
    }

    pub(crate) fn validate(&self, stage: usize) -> Result<(), ConfigError> {
        match self {
            Schedule::StaticCyclic(0) | Schedule::Dynamic(0) | Schedule::Guided(0) => {
                Err(ConfigError::ZeroChunkSize { stage })
            }
            _ => Ok(()),
        }
    }

    /// Returns, for each worker, the ordered list of chunks it will execute,
    /// or [`None`] if the assignment is only decided at run time (dynamic,
    /// guided and unresolved runtime schedules).
    pub fn plan(&self, space: IterationSpace, team_size: usize) -> Option<Vec<Vec<Chunk>>> {
        if !self.is_stable() || team_size == 0 {
            return None;
        }
        let source = ChunkSource::new(*self, space.len(), team_size);
        Some(
            (0..team_size)
                .map(|worker| source.iter(worker).collect())
                .collect(),
        )
    }
}

impl FromStr for Schedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSchedule(s.to_owned());
        let lower = s.trim().to_ascii_lowercase();
        let (kind, chunk) = match lower.split_once(',') {
            Some((kind, chunk)) => {
                let chunk = chunk.trim().parse::<usize>().map_err(|_| invalid())?;
                (kind.trim(), Some(chunk))
            }
            None => (lower.as_str(), None),
        };
        match (kind, chunk) {
            ("static", None) => Ok(Schedule::Static),
            ("static", Some(chunk)) => Ok(Schedule::StaticCyclic(chunk)),
            ("dynamic", chunk) => Ok(Schedule::Dynamic(chunk.unwrap_or(1))),
            ("guided", chunk) => Ok(Schedule::Guided(chunk.unwrap_or(1))),
            _ => Err(invalid()),
        }
    }
}

/// Hands out the chunks of one stage to the workers of the team.
///
/// Whatever the schedule, the chunks obtained via
/// `(0..team_size).map(|k| source.iter(k))` never overlap and cover
/// `0..len` exactly once.
pub(crate) enum ChunkSource {
    Static {
        len: usize,
        team_size: usize,
    },
    StaticCyclic {
        len: usize,
        team_size: usize,
        chunk: usize,
    },
    Dynamic {
        len: usize,
        chunk: usize,
        cursor: CachePadded<AtomicUsize>,
    },
    Guided {
        len: usize,
        team_size: usize,
        min_chunk: usize,
        cursor: CachePadded<AtomicUsize>,
    },
}

impl ChunkSource {
    /// Creates a source for a resolved, validated schedule.
    pub(crate) fn new(schedule: Schedule, len: usize, team_size: usize) -> Self {
        match schedule {
            Schedule::Static | Schedule::Runtime => ChunkSource::Static { len, team_size },
            Schedule::StaticCyclic(chunk) => ChunkSource::StaticCyclic {
                len,
                team_size,
                chunk,
            },
            Schedule::Dynamic(chunk) => ChunkSource::Dynamic {
                len,
                chunk,
                cursor: CachePadded::new(AtomicUsize::new(0)),
            },
            Schedule::Guided(min_chunk) => ChunkSource::Guided {
                len,
                team_size,
                min_chunk,
                cursor: CachePadded::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Returns the chunks executed by the given worker, in order.
    pub(crate) fn iter(&self, worker: usize) -> ChunkIter<'_> {
        ChunkIter {
            source: self,
            worker,
            round: 0,
        }
    }
}

/// Bounds of the `worker`-th of `team_size` near-equal blocks of `0..len`.
fn block(worker: usize, len: usize, team_size: usize) -> std::ops::Range<usize> {
    // Computed in u128 so that `worker * len` cannot overflow.
    let start = (worker as u128 * len as u128) / team_size as u128;
    let end = ((worker as u128 + 1) * len as u128) / team_size as u128;
    start as usize..end as usize
}

/// Iterator over the chunks of one worker.
pub(crate) struct ChunkIter<'a> {
    source: &'a ChunkSource,
    worker: usize,
    /// Number of chunks already returned.
    round: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let owner = self.worker;
        let chunk = match self.source {
            ChunkSource::Static { len, team_size } => {
                if self.round != 0 {
                    return None;
                }
                let range = block(owner, *len, *team_size);
                if range.is_empty() {
                    return None;
                }
                Chunk {
                    start: range.start,
                    count: range.len(),
                    owner,
                }
            }
            ChunkSource::StaticCyclic {
                len,
                team_size,
                chunk,
            } => {
                let start = (self.round * team_size + owner)
                    .checked_mul(*chunk)
                    .filter(|start| start < len)?;
                Chunk {
                    start,
                    count: (*chunk).min(len - start),
                    owner,
                }
            }
            ChunkSource::Dynamic { len, chunk, cursor } => {
                // The cursor never moves past `len`, so it can't wrap around
                // whatever the chunk size.
                let start = cursor
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |start| {
                        (start < *len).then(|| start + (*chunk).min(len - start))
                    })
                    .ok()?;
                Chunk {
                    start,
                    count: (*chunk).min(len - start),
                    owner,
                }
            }
            ChunkSource::Guided {
                len,
                team_size,
                min_chunk,
                cursor,
            } => {
                let mut start = cursor.load(Ordering::Relaxed);
                loop {
                    if start >= *len {
                        return None;
                    }
                    let remaining = len - start;
                    let count = remaining
                        .div_ceil(*team_size)
                        .max(*min_chunk)
                        .min(remaining);
                    match cursor.compare_exchange_weak(
                        start,
                        start + count,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break Chunk { start, count, owner },
                        Err(current) => start = current,
                    }
                }
            }
        };
        self.round += 1;
        Some(chunk)
    }
}

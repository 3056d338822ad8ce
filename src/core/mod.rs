// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread team, work distribution, reductions and
//! synchronization primitives.

mod range;
mod reduce;
mod sync;
mod tasks;
mod team;

pub use range::{Chunk, IterationSpace, Schedule, SCHEDULE_ENV_VAR};
pub(crate) use range::ChunkSource;
pub use reduce::{AtomicMax, Critical, Reduction};
pub(crate) use reduce::PartialSlots;
pub use sync::{BarrierMode, StageBarrier};
pub use tasks::{TaskRecord, TaskScope};
pub(crate) use tasks::TaskQueue;
pub use team::{CpuPinningPolicy, TeamState, ThreadCount, ThreadTeam};

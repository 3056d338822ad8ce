// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parallel regions: a sequence of stages run by one team of workers.

use crate::core::{
    BarrierMode, Chunk, ChunkSource, CpuPinningPolicy, IterationSpace, PartialSlots, Reduction,
    Schedule, StageBarrier, TaskQueue, TaskRecord, TaskScope, ThreadCount, ThreadTeam,
};
use crate::diagnostics::RaceWarning;
use crate::error::{ConfigError, Error, WorkerFailure};
#[cfg(feature = "log_stats")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::CachePadded;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of the tags that tell regions apart in race instrumentation.
static REGION_TAGS: AtomicU64 = AtomicU64::new(0);

/// Context of the worker running a work unit.
///
/// A worker belongs to exactly one region, and is only ever accessed from its
/// own thread.
pub struct Worker {
    id: usize,
    team_size: usize,
    region: u64,
    /// Number of barriers crossed so far in the region.
    epoch: Cell<usize>,
    /// Index of the stage being run.
    stage: Cell<usize>,
    races: RefCell<Vec<RaceWarning>>,
}

impl Worker {
    fn new(id: usize, team_size: usize, region: u64) -> Self {
        Self {
            id,
            team_size,
            region,
            epoch: Cell::new(0),
            stage: Cell::new(0),
            races: RefCell::new(Vec::new()),
        }
    }

    /// Index of this worker in its team, in `0..team_size()`.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of workers in the team.
    pub fn team_size(&self) -> usize {
        self.team_size
    }

    /// Number of barriers this worker has crossed since the region started.
    pub fn epoch(&self) -> usize {
        self.epoch.get()
    }

    /// Index of the stage this worker is running.
    pub fn stage(&self) -> usize {
        self.stage.get()
    }

    pub(crate) fn region_tag(&self) -> u64 {
        self.region
    }

    pub(crate) fn report_race(&self, warning: RaceWarning) {
        log_warn!("[thread {}] Race detected: {warning}", self.id);
        self.races.borrow_mut().push(warning);
    }
}

/// A section of a [`Stage::sections()`] stage.
pub type Section<'a> = Box<dyn Fn(&Worker) + Sync + 'a>;

type LoopBody<'a> = Box<dyn Fn(&Worker, usize) + Sync + 'a>;
type ReduceBody<'a, T> = Box<dyn Fn(&mut T, &Worker, usize) + Sync + 'a>;
type Producer<'a> = Box<dyn for<'q> Fn(&TaskScope<'q, 'a>) + Sync + 'a>;

enum StageKind<'a, T> {
    Loop {
        space: IterationSpace,
        schedule: Schedule,
        body: LoopBody<'a>,
    },
    Reduce {
        space: IterationSpace,
        schedule: Schedule,
        reduction: Reduction<'a, T>,
        body: ReduceBody<'a, T>,
    },
    Single(Section<'a>),
    Master(Section<'a>),
    Sections(Vec<Section<'a>>),
    Tasks(Producer<'a>),
}

/// One step of a [`Region`], run by every worker of the team.
///
/// By default, a barrier follows each stage. Use [`no_wait()`](Self::no_wait)
/// to let each worker start the next stage as soon as it is done with this
/// one.
pub struct Stage<'a, T = ()> {
    kind: StageKind<'a, T>,
    barrier: BarrierMode,
}

impl<'a, T> Stage<'a, T> {
    /// Runs `body(worker, index)` once for each index of the space, with the
    /// indices distributed among the workers by the schedule.
    pub fn parallel_for(
        space: impl Into<IterationSpace>,
        schedule: Schedule,
        body: impl Fn(&Worker, usize) + Sync + 'a,
    ) -> Self {
        Self::from_kind(StageKind::Loop {
            space: space.into(),
            schedule,
            body: Box::new(body),
        })
    }

    /// Like [`parallel_for()`](Self::parallel_for), but each worker folds its
    /// indices into a private accumulator seeded with the reduction's
    /// identity. The accumulators are merged once the region is over, and the
    /// result is reported in [`StageReport::reduction`].
    pub fn reduce(
        space: impl Into<IterationSpace>,
        schedule: Schedule,
        reduction: Reduction<'a, T>,
        body: impl Fn(&mut T, &Worker, usize) + Sync + 'a,
    ) -> Self {
        Self::from_kind(StageKind::Reduce {
            space: space.into(),
            schedule,
            reduction,
            body: Box::new(body),
        })
    }

    /// Runs `body` once, on the first worker to reach the stage.
    pub fn single(body: impl Fn(&Worker) + Sync + 'a) -> Self {
        Self::from_kind(StageKind::Single(Box::new(body)))
    }

    /// Runs `body` once, on worker 0.
    pub fn master(body: impl Fn(&Worker) + Sync + 'a) -> Self {
        Self::from_kind(StageKind::Master(Box::new(body)))
    }

    /// Runs each section once, on whichever worker claims it.
    pub fn sections(sections: Vec<Section<'a>>) -> Self {
        Self::from_kind(StageKind::Sections(sections))
    }

    /// Runs `producer` once, on the first worker to reach the stage. The
    /// tasks it submits are run by all the workers (the producer's included,
    /// once it returns), highest priority first.
    pub fn tasks(producer: impl for<'q> Fn(&TaskScope<'q, 'a>) + Sync + 'a) -> Self {
        Self::from_kind(StageKind::Tasks(Box::new(producer)))
    }

    /// Removes the barrier after this stage.
    pub fn no_wait(self) -> Self {
        self.with_barrier(BarrierMode::NoWait)
    }

    /// Sets whether a barrier follows this stage.
    pub fn with_barrier(mut self, barrier: BarrierMode) -> Self {
        self.barrier = barrier;
        self
    }

    /// The requested barrier mode.
    pub fn barrier(&self) -> BarrierMode {
        self.barrier
    }

    fn from_kind(kind: StageKind<'a, T>) -> Self {
        Self {
            kind,
            barrier: BarrierMode::Wait,
        }
    }

    fn is_loop(&self) -> bool {
        matches!(self.kind, StageKind::Loop { .. } | StageKind::Reduce { .. })
    }

    /// Checks the stage and resolves its runtime schedule, if any.
    fn prepare(&mut self, index: usize) -> Result<(), ConfigError> {
        match &mut self.kind {
            StageKind::Loop {
                space, schedule, ..
            }
            | StageKind::Reduce {
                space, schedule, ..
            } => {
                space.validate(index)?;
                schedule.validate(index)?;
                *schedule = schedule.resolve()?;
                schedule.validate(index)
            }
            _ => Ok(()),
        }
    }
}

/// A sequence of stages, run in order by every worker of a team.
pub struct Region<'a, T = ()> {
    stages: Vec<Stage<'a, T>>,
}

impl<'a> Region<'a> {
    /// Creates an empty region without reduction stages.
    pub fn new() -> Self {
        Self::with_reductions()
    }
}

impl Default for Region<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Region<'a, T> {
    /// Creates an empty region whose reduction stages produce values of type
    /// `T`.
    pub fn with_reductions() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage.
    pub fn stage(mut self, stage: Stage<'a, T>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the region has no stage.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Outcome of a region.
#[derive(Debug)]
pub struct RegionReport<T = ()> {
    /// Wall-clock time between team entry and team exit.
    pub elapsed: Duration,
    /// Number of workers in the team.
    pub team_size: usize,
    /// One report per stage, in order.
    pub stages: Vec<StageReport<T>>,
    /// Unsynchronized accesses reported by instrumented
    /// [`SharedArray`](crate::SharedArray)s.
    pub race_warnings: Vec<RaceWarning>,
}

impl<T> RegionReport<T> {
    /// Merged result of the given reduction stage.
    pub fn reduction(&self, stage: usize) -> Option<&T> {
        self.stages.get(stage)?.reduction.as_ref()
    }
}

/// Outcome of one stage.
#[derive(Debug)]
pub struct StageReport<T = ()> {
    /// Merged result, for reduction stages.
    pub reduction: Option<T>,
    /// For loop stages, the chunks run by each worker in order, if
    /// [`TeamBuilder::trace_chunks`] was set.
    pub chunks: Option<Vec<Vec<Chunk>>>,
    /// For tasks stages, the tasks in the order they started.
    pub tasks: Vec<TaskRecord>,
}

/// Configuration of the team that runs a region.
#[derive(Clone, Copy, Debug)]
pub struct TeamBuilder {
    /// Number of worker threads.
    pub num_threads: ThreadCount,
    /// Whether to pin the workers to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Whether to record the chunks run by each worker in loop stages.
    pub trace_chunks: bool,
}

impl Default for TeamBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            trace_chunks: false,
        }
    }
}

impl TeamBuilder {
    /// Runs the region on a new team, and returns once all the workers have
    /// exited.
    ///
    /// The region is validated before any worker is spawned. If a work unit
    /// panics, its worker skips the rest of its work but keeps arriving at
    /// barriers, so that the other workers run the region to completion; the
    /// panics are then reported as [`Error::WorkerFailure`].
    pub fn run_region<'a, T: Clone + Send + Sync>(
        &self,
        region: Region<'a, T>,
    ) -> Result<RegionReport<T>, Error> {
        let mut stages = region.stages;
        if stages.is_empty() {
            log_error!("[main thread] Refusing to run an empty region");
            return Err(ConfigError::EmptyRegion.into());
        }
        for (index, stage) in stages.iter_mut().enumerate() {
            stage.prepare(index)?;
        }

        let team_size = self.num_threads.resolve().get();
        let barriers = effective_barriers(&stages);
        let region_tag = REGION_TAGS.fetch_add(1, Ordering::Relaxed) + 1;
        let num_stages = stages.len();
        let prepared = stages
            .into_iter()
            .zip(barriers)
            .map(|(stage, barrier)| {
                PreparedStage::new(stage, barrier, team_size, self.trace_chunks)
            })
            .collect::<Vec<_>>();
        log_debug!("[main thread] Running a region of {num_stages} stages on {team_size} workers");

        let start = Instant::now();
        let pinning_failures = Mutex::new(Vec::new());
        let worker_main = |id: usize| run_worker(&prepared, id, team_size, region_tag);
        let outcomes = std::thread::scope(|scope| {
            let mut team = ThreadTeam::enter(
                scope,
                team_size,
                self.cpu_pinning,
                &pinning_failures,
                &worker_main,
            )?;
            Ok::<_, ConfigError>(team.exit())
        })?;
        let elapsed = start.elapsed();

        let mut failures = Vec::new();
        let mut race_warnings = Vec::new();
        for (id, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(outcome) => {
                    failures.extend(outcome.failure);
                    race_warnings.extend(outcome.races);
                }
                // A panic outside of any work unit.
                Err(payload) => failures.push(WorkerFailure::from_panic(id, num_stages, payload)),
            }
        }
        if !failures.is_empty() {
            log_error!(
                "[main thread] {} worker(s) failed, discarding the region's results",
                failures.len()
            );
            return Err(Error::WorkerFailure(failures));
        }

        #[cfg(feature = "log_stats")]
        for (index, stage) in prepared.iter().enumerate() {
            stage.log_stats(index);
        }

        Ok(RegionReport {
            elapsed,
            team_size,
            stages: prepared.into_iter().map(PreparedStage::into_report).collect(),
            race_warnings,
        })
    }
}

/// Runs the given stages on a team of `thread_count` workers, or of the
/// available parallelism if `thread_count` is 0.
pub fn run_region<'a, T: Clone + Send + Sync>(
    thread_count: usize,
    stages: impl IntoIterator<Item = Stage<'a, T>>,
) -> Result<RegionReport<T>, Error> {
    let builder = TeamBuilder {
        num_threads: ThreadCount::from_requested(thread_count),
        ..TeamBuilder::default()
    };
    builder.run_region(Region {
        stages: stages.into_iter().collect(),
    })
}

/// Decides which stages are followed by a barrier.
///
/// A single or master stage is always followed by a barrier, except between
/// two master stages (which run on the same worker).
fn effective_barriers<T>(stages: &[Stage<'_, T>]) -> Vec<BarrierMode> {
    stages
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            let next = stages.get(index + 1);
            match &stage.kind {
                StageKind::Single(_) | StageKind::Master(_) => {
                    let master_pair = matches!(stage.kind, StageKind::Master(_))
                        && matches!(next.map(|s| &s.kind), Some(StageKind::Master(_)));
                    if master_pair || stage.barrier == BarrierMode::Wait {
                        stage.barrier
                    } else {
                        log_warn!(
                            "Stage {index} runs on a single worker and must be followed by a barrier, ignoring no-wait"
                        );
                        BarrierMode::Wait
                    }
                }
                StageKind::Loop { schedule, .. } | StageKind::Reduce { schedule, .. } => {
                    if stage.barrier == BarrierMode::NoWait
                        && !schedule.is_stable()
                        && next.is_some_and(Stage::is_loop)
                    {
                        log_warn!(
                            "Stage {index} uses schedule {schedule:?} without a barrier: the next loop stage may see partially updated data"
                        );
                    }
                    stage.barrier
                }
                StageKind::Sections(_) | StageKind::Tasks(_) => stage.barrier,
            }
        })
        .collect()
}

/// Run-time state of a stage, shared by all the workers.
enum StageRun<'a, T> {
    Loop {
        space: IterationSpace,
        source: ChunkSource,
        body: LoopBody<'a>,
    },
    Reduce {
        space: IterationSpace,
        source: ChunkSource,
        reduction: Reduction<'a, T>,
        body: ReduceBody<'a, T>,
        partials: PartialSlots<T>,
    },
    Single {
        body: Section<'a>,
        claimed: AtomicBool,
    },
    Master(Section<'a>),
    Sections {
        sections: Vec<Section<'a>>,
        next: CachePadded<AtomicUsize>,
    },
    Tasks {
        producer: Producer<'a>,
        queue: TaskQueue<'a>,
    },
}

/// Work done by one worker in one stage.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(not(feature = "log_stats"), allow(dead_code))]
struct WorkerStats {
    chunks: usize,
    positions: usize,
    units: usize,
}

struct PreparedStage<'a, T> {
    run: StageRun<'a, T>,
    barrier: Option<StageBarrier>,
    trace: Option<PartialSlots<Vec<Chunk>>>,
    #[cfg(feature = "log_stats")]
    stats: PartialSlots<WorkerStats>,
}

impl<'a, T: Clone + Send + Sync> PreparedStage<'a, T> {
    fn new(stage: Stage<'a, T>, barrier: BarrierMode, team_size: usize, trace: bool) -> Self {
        let is_loop = stage.is_loop();
        let run = match stage.kind {
            StageKind::Loop {
                space,
                schedule,
                body,
            } => StageRun::Loop {
                space,
                source: ChunkSource::new(schedule, space.len(), team_size),
                body,
            },
            StageKind::Reduce {
                space,
                schedule,
                reduction,
                body,
            } => StageRun::Reduce {
                space,
                source: ChunkSource::new(schedule, space.len(), team_size),
                reduction,
                body,
                partials: PartialSlots::new(team_size),
            },
            StageKind::Single(body) => StageRun::Single {
                body,
                claimed: AtomicBool::new(false),
            },
            StageKind::Master(body) => StageRun::Master(body),
            StageKind::Sections(sections) => StageRun::Sections {
                sections,
                next: CachePadded::new(AtomicUsize::new(0)),
            },
            StageKind::Tasks(producer) => StageRun::Tasks {
                producer,
                queue: TaskQueue::new(),
            },
        };
        Self {
            run,
            barrier: match barrier {
                BarrierMode::Wait => Some(StageBarrier::new(team_size)),
                BarrierMode::NoWait => None,
            },
            trace: (trace && is_loop).then(|| PartialSlots::new(team_size)),
            #[cfg(feature = "log_stats")]
            stats: PartialSlots::new(team_size),
        }
    }

    /// Runs this worker's share of the stage.
    fn run(&self, worker: &Worker) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut trace = self.trace.as_ref().map(|_| Vec::new());
        let mut record = |chunk: Chunk| {
            stats.chunks += 1;
            stats.positions += chunk.count;
            if let Some(trace) = &mut trace {
                trace.push(chunk);
            }
        };

        match &self.run {
            StageRun::Loop {
                space,
                source,
                body,
            } => {
                for chunk in source.iter(worker.id) {
                    record(chunk);
                    for index in chunk.indices(*space) {
                        body(worker, index);
                    }
                }
            }
            StageRun::Reduce {
                space,
                source,
                reduction,
                body,
                partials,
            } => {
                let mut accumulator = reduction.identity();
                for chunk in source.iter(worker.id) {
                    record(chunk);
                    for index in chunk.indices(*space) {
                        body(&mut accumulator, worker, index);
                    }
                }
                partials.deposit(worker.id, accumulator);
            }
            StageRun::Single { body, claimed } => {
                if !claimed.swap(true, Ordering::AcqRel) {
                    log_debug!("[thread {}] Running single stage", worker.id);
                    body(worker);
                    stats.units += 1;
                }
            }
            StageRun::Master(body) => {
                if worker.id == 0 {
                    body(worker);
                    stats.units += 1;
                }
            }
            StageRun::Sections { sections, next } => loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(section) = sections.get(i) else {
                    break;
                };
                log_debug!("[thread {}] Running section #{i}", worker.id);
                section(worker);
                stats.units += 1;
            },
            StageRun::Tasks { producer, queue } => {
                if queue.claim_producer() {
                    log_debug!("[thread {}] Running the task producer", worker.id);
                    let produced =
                        catch_unwind(AssertUnwindSafe(|| producer(&TaskScope::new(queue, worker))));
                    // Consumers must be released even if the producer panicked.
                    queue.finish_producing();
                    if let Err(payload) = produced {
                        resume_unwind(payload);
                    }
                }
                while let Some(task) = queue.pop(worker.id) {
                    (task.body)(worker);
                    stats.units += 1;
                }
            }
        }

        if let (Some(slots), Some(trace)) = (&self.trace, trace) {
            slots.deposit(worker.id, trace);
        }
        stats
    }

    fn into_report(self) -> StageReport<T> {
        let chunks = self.trace.map(|slots| {
            slots
                .take_all()
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect()
        });
        let (reduction, tasks) = match self.run {
            StageRun::Reduce {
                reduction,
                partials,
                ..
            } => (
                Some(reduction.merge(partials.take_all().into_iter().flatten())),
                Vec::new(),
            ),
            StageRun::Tasks { queue, .. } => (None, queue.into_records()),
            _ => (None, Vec::new()),
        };
        StageReport {
            reduction,
            chunks,
            tasks,
        }
    }

    #[cfg(feature = "log_stats")]
    fn log_stats(&self, index: usize) {
        let stats = self
            .stats
            .take_all()
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect::<Vec<_>>();
        let kind = match &self.run {
            StageRun::Loop { .. } => "loop",
            StageRun::Reduce { .. } => "reduce",
            StageRun::Single { .. } => "single",
            StageRun::Master(_) => "master",
            StageRun::Sections { .. } => "sections",
            StageRun::Tasks { .. } => "tasks",
        };
        log_info!("Stage {index} ({kind}) statistics:");
        for (id, s) in stats.iter().enumerate() {
            log_info!(
                "- worker {id}: {} chunks, {} positions, {} units",
                s.chunks,
                s.positions,
                s.units
            );
        }
        let positions = stats.iter().map(|s| s.positions).collect::<Vec<_>>();
        if let (Some(min), Some(max)) = (positions.iter().min(), positions.iter().max()) {
            log_info!("- positions per worker: min {min}, max {max}");
        }
    }
}

/// What a worker brings back when the team exits.
struct WorkerOutcome {
    failure: Option<WorkerFailure>,
    races: Vec<RaceWarning>,
}

/// Main function of a worker: walks all the stages of the region.
fn run_worker<T: Clone + Send + Sync>(
    stages: &[PreparedStage<'_, T>],
    id: usize,
    team_size: usize,
    region_tag: u64,
) -> WorkerOutcome {
    let worker = Worker::new(id, team_size, region_tag);
    let mut failure = None;
    for (index, stage) in stages.iter().enumerate() {
        worker.stage.set(index);
        // A failed worker runs no more work units, but still arrives at the
        // barriers.
        if failure.is_none() {
            match catch_unwind(AssertUnwindSafe(|| stage.run(&worker))) {
                Ok(_stats) => {
                    #[cfg(feature = "log_stats")]
                    stage.stats.deposit(id, _stats);
                }
                Err(payload) => {
                    let f = WorkerFailure::from_panic(id, index, payload);
                    log_error!("[thread {id}] {f}");
                    failure = Some(f);
                }
            }
        }
        if let Some(barrier) = &stage.barrier {
            barrier.arrive(id);
            worker.epoch.set(worker.epoch.get() + 1);
        }
    }
    log_debug!("[thread {id}] Finished the region");
    WorkerOutcome {
        failure,
        races: worker.races.into_inner(),
    }
}

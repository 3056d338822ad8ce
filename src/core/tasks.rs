// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Priority task queue shared by the workers of a tasks stage.

use super::sync::Status;
use crate::macros::log_debug;
use crate::region::Worker;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Mutex, PoisonError};

/// Body of a task, run once by whichever worker dequeues it.
pub(crate) type TaskBody<'a> = Box<dyn FnOnce(&Worker) + Send + 'a>;

/// Record of a task that was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    /// Submission index of the task within its stage.
    pub id: usize,
    /// Priority given at submission.
    pub priority: i32,
    /// Worker that ran the task.
    pub worker: usize,
}

/// A task waiting in the queue.
pub(crate) struct QueuedTask<'a> {
    pub(crate) id: usize,
    pub(crate) priority: i32,
    pub(crate) body: TaskBody<'a>,
}

// Max-heap order: higher priority first, then lower id (i.e. FIFO) first.
impl Ord for QueuedTask<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedTask<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask<'_> {}

struct QueueState<'a> {
    heap: BinaryHeap<QueuedTask<'a>>,
    /// Number of tasks submitted so far.
    submitted: usize,
    /// Whether the producer has returned.
    producer_done: bool,
}

/// Queue of the tasks of one stage.
///
/// One worker claims the producer and submits tasks while the other workers
/// already consume them. A consumer blocks while the queue is empty and the
/// producer hasn't returned.
pub(crate) struct TaskQueue<'a> {
    state: Status<QueueState<'a>>,
    producer_claimed: AtomicBool,
    /// Tasks in the order they were dequeued.
    started: Mutex<Vec<TaskRecord>>,
}

impl<'a> TaskQueue<'a> {
    pub(crate) fn new() -> Self {
        Self {
            state: Status::new(QueueState {
                heap: BinaryHeap::new(),
                submitted: 0,
                producer_done: false,
            }),
            producer_claimed: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Returns true for exactly one caller, which must run the producer and
    /// then call [`finish_producing()`](Self::finish_producing).
    pub(crate) fn claim_producer(&self) -> bool {
        !self.producer_claimed.swap(true, atomic::Ordering::AcqRel)
    }

    pub(crate) fn push(&self, priority: i32, body: TaskBody<'a>) -> usize {
        let mut state = self.state.lock();
        let id = state.submitted;
        state.submitted += 1;
        state.heap.push(QueuedTask { id, priority, body });
        drop(state);
        self.state.notify_one();
        id
    }

    /// Wakes up the consumers, which return once the queue is drained.
    pub(crate) fn finish_producing(&self) {
        self.state.lock().producer_done = true;
        self.state.notify_all();
    }

    /// Dequeues the highest-priority task, blocking while the queue is empty
    /// and more tasks may come. Returns [`None`] once everything has been
    /// dequeued.
    pub(crate) fn pop(&self, worker: usize) -> Option<QueuedTask<'a>> {
        let guard = self.state.lock();
        let mut state = self
            .state
            .wait_while(guard, |state| state.heap.is_empty() && !state.producer_done);
        let task = state.heap.pop()?;
        // Recorded under the queue lock, so that the records follow the
        // dequeue order.
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TaskRecord {
                id: task.id,
                priority: task.priority,
                worker,
            });
        log_debug!(
            "[thread {worker}] Starting task #{} (priority {})",
            task.id,
            task.priority
        );
        Some(task)
    }

    pub(crate) fn into_records(self) -> Vec<TaskRecord> {
        self.started
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle given to the producer of a tasks stage, to submit tasks.
pub struct TaskScope<'q, 'a> {
    queue: &'q TaskQueue<'a>,
    worker: &'q Worker,
}

impl<'q, 'a> TaskScope<'q, 'a> {
    pub(crate) fn new(queue: &'q TaskQueue<'a>, worker: &'q Worker) -> Self {
        Self { queue, worker }
    }

    /// Submits a task. Pending tasks start in decreasing priority order, and
    /// in submission order among equal priorities. Returns the task's id.
    pub fn submit(&self, priority: i32, body: impl FnOnce(&Worker) + Send + 'a) -> usize {
        self.queue.push(priority, Box::new(body))
    }

    /// Worker running the producer.
    pub fn worker(&self) -> &Worker {
        self.worker
    }
}

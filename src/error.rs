// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors reported by a parallel region.

use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Error returned when running a parallel region.
#[derive(Error, Debug)]
pub enum Error {
    /// The region was misconfigured and never started.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// One or more work units panicked. The region ran to completion on the
    /// other workers before this was reported.
    #[error("{} worker failure(s) in the region", .0.len())]
    WorkerFailure(Vec<WorkerFailure>),
}

/// Invalid region configuration, detected before any worker is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A team must have at least one worker.
    #[error("invalid team size: a team needs at least one worker")]
    InvalidTeamSize,

    /// A region without stages has nothing to run.
    #[error("region has no stages")]
    EmptyRegion,

    /// A loop stage was given an empty iteration space.
    #[error("stage {stage}: empty iteration space")]
    EmptyIterationSpace {
        /// Index of the offending stage.
        stage: usize,
    },

    /// A loop stage was given an iteration space with a zero stride.
    #[error("stage {stage}: iteration space stride must be at least 1")]
    ZeroStride {
        /// Index of the offending stage.
        stage: usize,
    },

    /// A chunked schedule was given a chunk size of zero.
    #[error("stage {stage}: chunk size must be at least 1")]
    ZeroChunkSize {
        /// Index of the offending stage.
        stage: usize,
    },

    /// A schedule string could not be parsed.
    #[error("invalid schedule {0:?}")]
    InvalidSchedule(String),
}

/// A panic captured inside a work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// Worker on which the panic happened.
    pub worker: usize,
    /// Stage during which the panic happened.
    pub stage: usize,
    /// Panic payload, if it was a string.
    pub message: String,
}

impl WorkerFailure {
    pub(crate) fn from_panic(worker: usize, stage: usize, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self {
            worker,
            stage,
            message,
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} panicked in stage {}: {}",
            self.worker, self.stage, self.message
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_worker_failure_from_panic_payload() {
        let failure = WorkerFailure::from_panic(2, 1, Box::new("boom"));
        assert_eq!(failure.message, "boom");
        let failure = WorkerFailure::from_panic(2, 1, Box::new(format!("boom {}", 42)));
        assert_eq!(failure.message, "boom 42");
        let failure = WorkerFailure::from_panic(2, 1, Box::new(42));
        assert_eq!(failure.message, "<non-string panic payload>");
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(ConfigError::ZeroChunkSize { stage: 3 });
        assert_eq!(
            err.to_string(),
            "configuration error: stage 3: chunk size must be at least 1"
        );

        let err = Error::WorkerFailure(vec![WorkerFailure {
            worker: 1,
            stage: 0,
            message: "arithmetic panic".to_owned(),
        }]);
        assert_eq!(
            err.to_string(),
            "1 worker failure(s) in the region"
        );
        if let Error::WorkerFailure(failures) = err {
            assert_eq!(
                failures[0].to_string(),
                "worker 1 panicked in stage 0: arithmetic panic"
            );
        }
    }
}

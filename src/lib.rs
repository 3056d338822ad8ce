// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod diagnostics;
mod error;
mod macros;
mod region;

pub use crate::core::{
    AtomicMax, BarrierMode, Chunk, CpuPinningPolicy, Critical, IterationSpace, Reduction,
    Schedule, StageBarrier, TaskRecord, TaskScope, TeamState, ThreadCount, ThreadTeam,
    SCHEDULE_ENV_VAR,
};
pub use diagnostics::{RaceWarning, SharedArray};
pub use error::{ConfigError, Error, WorkerFailure};
pub use region::{
    run_region, Region, RegionReport, Section, Stage, StageReport, TeamBuilder, Worker,
};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    macro_rules! expand_tests {
        ( $schedule:expr, ) => {};
        ( $schedule:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($schedule);
            }

            expand_tests!($schedule, $($others)*);
        };
    }

    macro_rules! schedule_tests {
        ( $mod:ident, $schedule:expr, $( $tests:tt )* ) => {
            mod $mod {
                use super::*;

                expand_tests!($schedule, $($tests)*);
            }
        };
    }

    macro_rules! all_schedule_tests {
        ( $mod:ident, $schedule:expr ) => {
            schedule_tests!(
                $mod,
                $schedule,
                test_each_index_once,
                test_strided_space,
                test_sum_of_ones,
                test_reduction_matches_sequential,
                test_float_reduction,
                test_many_regions,
                test_one_panic,
                test_many_panics,
                test_atomic_updates_with_no_wait,
            );
        };
    }

    all_schedule_tests!(static_blocks, Schedule::Static);
    all_schedule_tests!(static_cyclic, Schedule::StaticCyclic(3));
    all_schedule_tests!(dynamic_1, Schedule::Dynamic(1));
    all_schedule_tests!(dynamic_7, Schedule::Dynamic(7));
    all_schedule_tests!(guided, Schedule::Guided(1));
    all_schedule_tests!(guided_5, Schedule::Guided(5));

    fn builder(num_threads: usize) -> TeamBuilder {
        TeamBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            ..TeamBuilder::default()
        }
    }

    fn test_each_index_once(schedule: Schedule) {
        const LEN: usize = 1000;
        for num_threads in 1..=8 {
            let counts = (0..LEN).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
            let region = Region::new().stage(Stage::parallel_for(0..LEN, schedule, |_, i| {
                counts[i].fetch_add(1, Ordering::Relaxed);
            }));
            builder(num_threads).run_region(region).unwrap();
            assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        }
    }

    fn test_strided_space(schedule: Schedule) {
        let visited = Mutex::new(Vec::new());
        let region = Region::new().stage(Stage::parallel_for(
            IterationSpace::with_stride(5..50, 4),
            schedule,
            |_, i| visited.lock().unwrap().push(i),
        ));
        builder(3).run_region(region).unwrap();
        let mut visited = visited.into_inner().unwrap();
        visited.sort_unstable();
        assert_eq!(visited, (5..50).step_by(4).collect::<Vec<_>>());
    }

    fn test_sum_of_ones(schedule: Schedule) {
        for num_threads in [1, 2, 4, 8, 16] {
            let report = run_region(
                num_threads,
                [Stage::reduce(
                    0..1000,
                    schedule,
                    Reduction::sum(),
                    |acc: &mut u64, _, _| *acc += 1,
                )],
            )
            .unwrap();
            assert_eq!(report.team_size, num_threads);
            assert_eq!(report.reduction(0), Some(&1000));
        }
    }

    fn test_reduction_matches_sequential(schedule: Schedule) {
        let input = (0..=10_000).map(|x| x * 7 % 1013).collect::<Vec<u64>>();
        let expected = input.iter().sum::<u64>();
        for num_threads in 1..=8 {
            let region = Region::with_reductions().stage(Stage::reduce(
                0..input.len(),
                schedule,
                Reduction::sum(),
                |acc: &mut u64, _, i| *acc += input[i],
            ));
            let report = builder(num_threads).run_region(region).unwrap();
            assert_eq!(report.reduction(0), Some(&expected));
        }
    }

    fn test_float_reduction(schedule: Schedule) {
        // Riemann sum of 4 / (1 + x^2) over [0, 1].
        const STEPS: usize = 100_000;
        let step = 1.0 / STEPS as f64;
        let report = run_region(
            4,
            [Stage::reduce(
                0..STEPS,
                schedule,
                Reduction::sum(),
                |acc: &mut f64, _, i| {
                    let x = (i as f64 + 0.5) * step;
                    *acc += 4.0 / (1.0 + x * x);
                },
            )],
        )
        .unwrap();
        let pi = report.reduction(0).unwrap() * step;
        assert!((pi - std::f64::consts::PI).abs() < 1e-9, "{pi}");
    }

    fn test_many_regions(schedule: Schedule) {
        for i in 0..50 {
            let report = run_region(
                4,
                [
                    Stage::reduce(0..100 + i, schedule, Reduction::sum(), |acc: &mut usize, _, j| {
                        *acc += j
                    }),
                    Stage::reduce(0..10, schedule, Reduction::new(1usize, |a, b| a * b), |acc, _, _| {
                        *acc *= 2
                    }),
                ],
            )
            .unwrap();
            let n = 100 + i;
            assert_eq!(report.reduction(0), Some(&(n * (n - 1) / 2)));
            assert_eq!(report.reduction(1), Some(&1024));
        }
    }

    fn test_one_panic(schedule: Schedule) {
        let region = Region::with_reductions()
            .stage(Stage::reduce(
                0..10_000,
                schedule,
                Reduction::sum(),
                |acc: &mut u64, _, i| {
                    if i == 1234 {
                        panic!("arithmetic panic");
                    }
                    *acc += i as u64;
                },
            ))
            .stage(Stage::reduce(
                0..10_000,
                schedule,
                Reduction::sum(),
                |acc: &mut u64, _, _| *acc += 1,
            ));
        match builder(4).run_region(region) {
            Err(Error::WorkerFailure(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].stage, 0);
                assert_eq!(failures[0].message, "arithmetic panic");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn test_many_panics(schedule: Schedule) {
        let region = Region::new()
            .stage(Stage::parallel_for(0..10_000, schedule, |_, i| {
                if i % 123 == 0 {
                    panic!("arithmetic panic");
                }
            }))
            .stage(Stage::single(|_| ()))
            .stage(Stage::parallel_for(0..10_000, schedule, |_, _| ()));
        // Every worker that panicked still reached the barriers, so the call
        // returns instead of deadlocking.
        match builder(4).run_region(region) {
            Err(Error::WorkerFailure(failures)) => {
                assert!(!failures.is_empty());
                assert!(failures.len() <= 4);
                assert!(failures.iter().all(|f| f.stage == 0));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn test_atomic_updates_with_no_wait(schedule: Schedule) {
        // Atomic additions never lose updates, with or without barriers.
        let array = SharedArray::new(100, 0.0);
        let region = Region::new()
            .stage(
                Stage::parallel_for(0..100, schedule, |w, i| array.add_atomic(w, i, 1.0))
                    .no_wait(),
            )
            .stage(Stage::parallel_for(0..100, schedule, |w, i| {
                array.add_atomic(w, 99 - i, 1.0)
            }));
        builder(4).run_region(region).unwrap();
        assert_eq!(array.to_vec(), vec![2.0; 100]);
    }

    #[test]
    fn test_static_mapping_is_stable() {
        for schedule in [Schedule::Static, Schedule::StaticCyclic(4)] {
            let first = (0..1000).map(|_| AtomicUsize::new(usize::MAX)).collect::<Vec<_>>();
            let second = (0..1000).map(|_| AtomicUsize::new(usize::MAX)).collect::<Vec<_>>();
            let region = Region::new()
                .stage(Stage::parallel_for(0..1000, schedule, |w, i| {
                    first[i].store(w.id(), Ordering::Relaxed)
                }))
                .stage(Stage::parallel_for(0..1000, schedule, |w, i| {
                    second[i].store(w.id(), Ordering::Relaxed)
                }));
            builder(6).run_region(region).unwrap();
            for i in 0..1000 {
                assert_eq!(
                    first[i].load(Ordering::Relaxed),
                    second[i].load(Ordering::Relaxed)
                );
            }
        }
    }

    #[test]
    fn test_static_blocks_split_evenly() {
        let owners = (0..100).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
        let region = Region::new().stage(Stage::parallel_for(0..100, Schedule::Static, |w, i| {
            owners[i].store(w.id(), Ordering::Relaxed)
        }));
        builder(7).run_region(region).unwrap();
        let owners = owners
            .iter()
            .map(|o| o.load(Ordering::Relaxed))
            .collect::<Vec<_>>();
        let bounds = [0, 14, 28, 42, 57, 71, 85, 100];
        for (worker, range) in bounds.windows(2).enumerate() {
            assert!(owners[range[0]..range[1]].iter().all(|&o| o == worker));
        }
    }

    /// Two dependent stages without a barrier in between: the first one
    /// writes `a[i] = 1`, the second one doubles `a[i]`.
    fn run_dependent_stages(
        schedule: Schedule,
        num_threads: usize,
        array: &SharedArray,
    ) -> RegionReport {
        let region = Region::new()
            .stage(
                Stage::parallel_for(0..64, schedule, |w, i| {
                    // Uneven work, so that workers drift apart.
                    if (i + w.id()) % 3 == 0 {
                        std::thread::sleep(std::time::Duration::from_micros(50));
                    }
                    array.store(w, i, 1.0);
                })
                .no_wait(),
            )
            .stage(Stage::parallel_for(0..64, schedule, |w, i| {
                if (i * 7 + w.id()) % 5 == 0 {
                    std::thread::yield_now();
                }
                let value = array.load(w, i);
                array.store(w, i, value * 2.0);
            }));
        builder(num_threads).run_region(region).unwrap()
    }

    #[test]
    fn test_dynamic_no_wait_race_is_reported() {
        let mut array = SharedArray::instrumented(64, 0.0);

        // A single worker is the sequential baseline: always correct.
        let baseline = (0..20)
            .map(|_| {
                array.reset(0.0);
                let report = run_dependent_stages(Schedule::Dynamic(1), 1, &array);
                assert!(report.race_warnings.is_empty());
                array.to_vec()
            })
            .collect::<Vec<_>>();
        assert!(baseline.iter().all(|values| *values == vec![2.0; 64]));

        let mut warnings = 0;
        let mut mismatches = 0;
        for num_threads in [2, 4, 8] {
            for _ in 0..50 {
                array.reset(0.0);
                let report = run_dependent_stages(Schedule::Dynamic(1), num_threads, &array);
                warnings += report.race_warnings.len();
                if array.to_vec() != baseline[0] {
                    mismatches += 1;
                }
                // Each warning points to two different workers in the same
                // epoch.
                for warning in &report.race_warnings {
                    assert_ne!(warning.first_writer, warning.second_writer);
                    assert_eq!(warning.epoch, 0);
                }
            }
        }
        assert!(warnings > 0);
        assert!(mismatches > 0);
    }

    #[test]
    fn test_static_no_wait_is_safe() {
        for schedule in [Schedule::Static, Schedule::StaticCyclic(2)] {
            for num_threads in [1, 2, 4, 8] {
                let mut array = SharedArray::instrumented(64, 0.0);
                for _ in 0..20 {
                    array.reset(0.0);
                    let report = run_dependent_stages(schedule, num_threads, &array);
                    assert!(report.race_warnings.is_empty());
                    assert_eq!(array.to_vec(), vec![2.0; 64]);
                }
            }
        }
    }

    #[test]
    fn test_single_runs_once() {
        for num_threads in [1, 4, 8] {
            let count = AtomicUsize::new(0);
            let region = Region::new()
                .stage(Stage::single(|_| {
                    count.fetch_add(1, Ordering::Relaxed);
                }))
                .stage(Stage::single(|_| {
                    // The barrier after the first stage makes its effect
                    // visible here.
                    assert_eq!(count.load(Ordering::Relaxed), 1);
                }));
            builder(num_threads).run_region(region).unwrap();
            assert_eq!(count.into_inner(), 1);
        }
    }

    #[test]
    fn test_master_runs_on_worker_zero() {
        let ids = Mutex::new(Vec::new());
        let region = Region::new()
            .stage(Stage::master(|w| ids.lock().unwrap().push(w.id())).no_wait())
            .stage(Stage::master(|w| ids.lock().unwrap().push(w.id())));
        builder(4).run_region(region).unwrap();
        assert_eq!(ids.into_inner().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_sections_run_once() {
        let counts = (0..5).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
        let sections = (0..5)
            .map(|k| {
                let counts = &counts;
                Box::new(move |_: &Worker| {
                    counts[k].fetch_add(1, Ordering::Relaxed);
                }) as Section<'_>
            })
            .collect();
        let region = Region::new().stage(Stage::sections(sections));
        builder(3).run_region(region).unwrap();
        assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_sections_with_critical_and_max() {
        let total = Critical::new(0.0f64);
        let max = AtomicMax::default();
        let sections: Vec<Section<'_>> = vec![
            Box::new(|_: &Worker| {
                let partial = (0..100).map(|i| i as f64).sum::<f64>();
                total.update(|t| *t += partial);
                max.fetch_max(99.0);
            }),
            Box::new(|_: &Worker| {
                let partial = (0..100).map(|i| -(i as f64)).sum::<f64>();
                total.update(|t| *t += partial);
                max.fetch_max(-1.0);
            }),
        ];
        run_region(2, [Stage::<()>::sections(sections)]).unwrap();
        assert_eq!(total.into_inner(), 0.0);
        assert_eq!(max.load(), 99.0);
    }

    #[test]
    fn test_task_priority_order() {
        let started = Mutex::new(Vec::new());
        let started = &started;
        let report = run_region(
            1,
            [Stage::<()>::tasks(|scope| {
                for priority in [10, 50, 100] {
                    scope.submit(priority, move |_| started.lock().unwrap().push(priority));
                }
            })],
        )
        .unwrap();
        assert_eq!(started.lock().unwrap().clone(), vec![100, 50, 10]);
        assert_eq!(
            report.stages[0]
                .tasks
                .iter()
                .map(|t| (t.id, t.priority))
                .collect::<Vec<_>>(),
            vec![(2, 100), (1, 50), (0, 10)]
        );
    }

    #[test]
    fn test_task_priority_order_with_busy_workers() {
        const NUM_THREADS: usize = 3;
        let busy = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let started = Mutex::new(Vec::new());
        let (busy, done, started) = (&busy, &done, &started);
        let report = run_region(
            NUM_THREADS,
            [Stage::<()>::tasks(|scope| {
                // Keep every other worker busy until the prioritized tasks are
                // over, so that the producer is the only available worker.
                for _ in 1..NUM_THREADS {
                    scope.submit(1000, move |_| {
                        busy.fetch_add(1, Ordering::AcqRel);
                        while done.load(Ordering::Acquire) < 3 {
                            std::thread::yield_now();
                        }
                    });
                }
                while busy.load(Ordering::Acquire) < NUM_THREADS - 1 {
                    std::thread::yield_now();
                }
                for priority in [10, 50, 100] {
                    scope.submit(priority, move |_| {
                        started.lock().unwrap().push(priority);
                        done.fetch_add(1, Ordering::AcqRel);
                    });
                }
            })],
        )
        .unwrap();
        assert_eq!(started.lock().unwrap().clone(), vec![100, 50, 10]);

        let records = &report.stages[0].tasks;
        assert_eq!(
            records
                .iter()
                .map(|t| (t.id, t.priority))
                .collect::<Vec<_>>(),
            vec![(0, 1000), (1, 1000), (4, 100), (3, 50), (2, 10)]
        );
        // The prioritized tasks all ran on the producer.
        let producer = records[2].worker;
        assert!(records[2..].iter().all(|t| t.worker == producer));
        assert!(records[..2].iter().all(|t| t.worker != producer));
    }

    #[test]
    fn test_tasks_run_once_on_many_workers() {
        const NUM_TASKS: usize = 200;
        let counts = (0..NUM_TASKS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
        let counts = &counts;
        let report = run_region(
            4,
            [Stage::<()>::tasks(|scope| {
                for k in 0..NUM_TASKS {
                    scope.submit((k % 7) as i32, move |_| {
                        counts[k].fetch_add(1, Ordering::Relaxed);
                    });
                }
            })],
        )
        .unwrap();
        assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        assert_eq!(report.stages[0].tasks.len(), NUM_TASKS);
    }

    #[test]
    fn test_task_panic_releases_workers() {
        let result = run_region(
            3,
            [Stage::<()>::tasks(|scope| {
                scope.submit(0, |_| ());
                panic!("producer panic");
            })],
        );
        match result {
            Err(Error::WorkerFailure(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].message, "producer panic");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_configuration_errors() {
        let err = |region: Region<'_>| match builder(2).run_region(region) {
            Err(Error::Config(e)) => e,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(err(Region::new()), ConfigError::EmptyRegion);
        assert_eq!(
            err(Region::new()
                .stage(Stage::single(|_| ()))
                .stage(Stage::parallel_for(5..5, Schedule::Static, |_, _| ()))),
            ConfigError::EmptyIterationSpace { stage: 1 }
        );
        assert_eq!(
            err(Region::new().stage(Stage::parallel_for(0..10, Schedule::Dynamic(0), |_, _| ()))),
            ConfigError::ZeroChunkSize { stage: 0 }
        );
        assert_eq!(
            err(Region::new().stage(Stage::parallel_for(
                IterationSpace::with_stride(0..10, 0),
                Schedule::Static,
                |_, _| ()
            ))),
            ConfigError::ZeroStride { stage: 0 }
        );
        assert_eq!(ThreadCount::try_from(0), Err(ConfigError::InvalidTeamSize));
    }

    #[test]
    fn test_config_error_spawns_nothing() {
        let ran = AtomicUsize::new(0);
        let region = Region::new()
            .stage(Stage::single(|_| {
                ran.fetch_add(1, Ordering::Relaxed);
            }))
            .stage(Stage::parallel_for(0..10, Schedule::Guided(0), |_, _| ()));
        assert!(builder(2).run_region(region).is_err());
        assert_eq!(ran.into_inner(), 0);
    }

    #[test]
    fn test_zero_threads_means_available_parallelism() {
        let report = run_region(0, [Stage::<()>::single(|_| ())]).unwrap();
        assert_eq!(
            report.team_size,
            std::thread::available_parallelism().unwrap().get()
        );
    }

    #[test]
    fn test_runtime_schedule_defaults_to_static() {
        // Only meaningful if the variable isn't set in the test environment.
        if std::env::var_os(SCHEDULE_ENV_VAR).is_some() {
            return;
        }
        let region = Region::new().stage(Stage::parallel_for(0..100, Schedule::Runtime, |_, _| ()));
        let report = TeamBuilder {
            trace_chunks: true,
            ..builder(4)
        }
        .run_region(region)
        .unwrap();
        assert_eq!(
            report.stages[0].chunks,
            Schedule::Static.plan(IterationSpace::new(0..100), 4)
        );
    }
}

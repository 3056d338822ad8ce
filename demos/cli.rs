// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of parallel regions.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::time::Instant;
use workshare::{
    AtomicMax, BarrierMode, CpuPinningPolicy, Critical, Error, Reduction, Region, RegionReport,
    Schedule, Section, SharedArray, Stage, TeamBuilder, ThreadCount, Worker,
};

fn main() -> Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let builder = TeamBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_cpus {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
        trace_chunks: false,
    };
    let schedule = cli.schedule.unwrap_or(Schedule::Runtime);

    match cli.scenario {
        Scenario::Hello => hello(&builder)?,
        Scenario::PiCyclic => pi_cyclic(&builder, cli.input_size)?,
        Scenario::Pi => pi(&builder, schedule, cli.input_size)?,
        Scenario::Matmul => matmul(&builder, schedule, cli.input_size as usize)?,
        Scenario::Stats => stats(&builder, cli.input_size as usize)?,
        Scenario::MasterSingle => master_single(&builder, cli.input_size as usize)?,
        Scenario::LoadBalance => load_balance(&builder, cli.input_size as usize)?,
        Scenario::Dmvm => dmvm(&builder, cli.input_size as usize)?,
        Scenario::Tasks => tasks(&builder, cli.input_size as usize)?,
    }
    Ok(())
}

/// Every worker says hello, then worker 0 reports the team size.
fn hello(builder: &TeamBuilder) -> Result<(), Error> {
    // One index per worker.
    let num_threads = builder.num_threads.resolve().get();
    let region = Region::new()
        .stage(Stage::parallel_for(0..num_threads, Schedule::Static, |w, _| {
            println!("Hello from the rank {} thread", w.id())
        }))
        .stage(Stage::master(|w| {
            println!("Parallel execution of hello_world with {} threads", w.team_size())
        }));
    builder.run_region(region)?;
    Ok(())
}

/// Midpoint rule for pi, each worker taking every `team_size`-th step.
fn pi_cyclic(builder: &TeamBuilder, num_steps: u64) -> Result<(), Error> {
    let step = 1.0 / num_steps as f64;
    let region = Region::with_reductions().stage(Stage::reduce(
        0..num_steps as usize,
        Schedule::StaticCyclic(1),
        Reduction::sum(),
        |acc: &mut f64, _, i| {
            let x = (i as f64 + 0.5) * step;
            *acc += 4.0 / (1.0 + x * x);
        },
    ));
    let report = builder.run_region(region)?;
    print_pi(&report, step, num_steps);
    Ok(())
}

/// Midpoint rule for pi, with the given schedule.
fn pi(builder: &TeamBuilder, schedule: Schedule, num_steps: u64) -> Result<(), Error> {
    let step = 1.0 / num_steps as f64;
    let region = Region::with_reductions().stage(Stage::reduce(
        0..num_steps as usize,
        schedule,
        Reduction::sum(),
        |acc: &mut f64, _, i| {
            let x = (i as f64 + 0.5) * step;
            *acc += 4.0 / (1.0 + x * x);
        },
    ));
    let report = builder.run_region(region)?;
    print_pi(&report, step, num_steps);
    Ok(())
}

fn print_pi(report: &RegionReport<f64>, step: f64, num_steps: u64) {
    let pi = report.reduction(0).copied().unwrap_or_default() * step;
    println!("pi with {num_steps} steps is {pi:.12}");
    println!("Execution time: {:?}", report.elapsed);
}

/// Square matrix product, one work unit per output element.
fn matmul(builder: &TeamBuilder, schedule: Schedule, n: usize) -> Result<(), Error> {
    let n = n.clamp(1, 1000);
    let a = (0..n * n)
        .map(|k| ((k / n + 1) + (k % n + 1)) as f64)
        .collect::<Vec<_>>();
    let b = (0..n * n)
        .map(|k| (k / n) as f64 - (k % n) as f64)
        .collect::<Vec<_>>();
    let c = SharedArray::new(n * n, 0.0);

    let region = Region::new().stage(Stage::parallel_for(0..n * n, schedule, |w, ij| {
        let (i, j) = (ij / n, ij % n);
        let dot = (0..n).map(|k| a[i * n + k] * b[k * n + j]).sum::<f64>();
        c.store(w, ij, dot);
    }));
    let report = builder.run_region(region)?;
    println!("c[0][0] = {}, c[n-1][n-1] = {}", c.get(0), c.get(n * n - 1));
    println!("Execution time: {:?}", report.elapsed);
    Ok(())
}

/// Sum, max and standard deviation of random values, one section each.
fn stats(builder: &TeamBuilder, len: usize) -> Result<(), Error> {
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let values = (0..len).map(|_| rng.random::<f64>()).collect::<Vec<_>>();
    let values = black_box(values.as_slice());

    let sum = Critical::new(0.0);
    let sum_sq = Critical::new(0.0);
    let max = AtomicMax::new(-1.0);
    let sections: Vec<Section<'_>> = vec![
        Box::new(|_: &Worker| {
            let local = values.iter().sum::<f64>();
            sum.update(|s| *s = local);
        }),
        Box::new(|_: &Worker| {
            let local = values.iter().copied().fold(-1.0, f64::max);
            max.fetch_max(local);
        }),
        Box::new(|_: &Worker| {
            let local = values.iter().map(|x| x * x).sum::<f64>();
            sum_sq.update(|s| *s = local);
        }),
    ];
    let start = Instant::now();
    builder.run_region(Region::new().stage(Stage::sections(sections)))?;

    let (sum, sum_sq) = (sum.into_inner(), sum_sq.into_inner());
    let mean = sum / len as f64;
    let stddev = (sum_sq / len as f64 - mean * mean).sqrt();
    println!("Sum      = {sum}");
    println!("Max      = {}", max.load());
    println!("Std Dev  = {stddev}");
    println!("Time     = {:?}", start.elapsed());
    Ok(())
}

/// Worker 0 initializes a matrix, one worker prints it, all workers sum it.
fn master_single(builder: &TeamBuilder, n: usize) -> Result<(), Error> {
    let n = n.clamp(1, 2000);
    let matrix = SharedArray::new(n * n, 0.0);
    let region = Region::with_reductions()
        .stage(Stage::master(|w| {
            for i in 0..n {
                for j in 0..n {
                    matrix.store(w, i * n + j, (i + j) as f64);
                }
            }
        }))
        .stage(Stage::single(|_| {
            if n > 20 {
                println!("[Matrix too large to print]");
                return;
            }
            for i in 0..n {
                let row = (0..n)
                    .map(|j| format!("{:6.1}", matrix.get(i * n + j)))
                    .collect::<Vec<_>>();
                println!("{}", row.join(" "));
            }
        }))
        .stage(Stage::reduce(
            0..n * n,
            Schedule::Static,
            Reduction::sum(),
            |acc: &mut f64, w, k| *acc += matrix.load(w, k),
        ));
    let report = builder.run_region(region)?;
    println!("Sum = {}", report.reduction(2).copied().unwrap_or_default());
    println!("Execution time = {:?}", report.elapsed);
    Ok(())
}

fn task_light(n: usize) -> f64 {
    (0..n).map(|i| (i as f64 * 0.001).sin()).sum()
}

fn task_moderate(n: usize) -> f64 {
    (0..5 * n)
        .map(|i| (i as f64 * 0.5).sqrt() * (i as f64 * 0.001).cos())
        .sum()
}

fn task_heavy(n: usize) -> f64 {
    (0..20 * n)
        .map(|i| (i as f64 * 0.5).sqrt() * (i as f64 * 0.001).cos() * (i as f64 * 0.0001).sin())
        .sum()
}

/// Three unequal tasks, as unbalanced sections and then as balanced ones.
fn load_balance(builder: &TeamBuilder, n: usize) -> Result<(), Error> {
    let start = Instant::now();
    black_box((task_light(n), task_moderate(n), task_heavy(n)));
    let sequential = start.elapsed();
    println!("Sequential: {sequential:?}");

    let unbalanced: Vec<Section<'_>> = vec![
        Box::new(|w: &Worker| {
            println!("Thread {}: Task A (light)", w.id());
            black_box(task_light(n));
        }),
        Box::new(|w: &Worker| {
            println!("Thread {}: Task B (moderate)", w.id());
            black_box(task_moderate(n));
        }),
        Box::new(|w: &Worker| {
            println!("Thread {}: Task C (heavy)", w.id());
            black_box(task_heavy(n));
        }),
    ];
    let report = builder.run_region(Region::new().stage(Stage::sections(unbalanced)))?;
    println!(
        "Unbalanced sections: {:?}, speedup {:.2}x",
        report.elapsed,
        sequential.as_secs_f64() / report.elapsed.as_secs_f64()
    );

    let balanced: Vec<Section<'_>> = vec![
        Box::new(|w: &Worker| {
            println!("Thread {}: Task A + B (light + moderate)", w.id());
            black_box(task_light(n));
            black_box(task_moderate(n));
        }),
        Box::new(|w: &Worker| {
            println!("Thread {}: Task C (heavy)", w.id());
            black_box(task_heavy(n));
        }),
    ];
    let report = builder.run_region(Region::new().stage(Stage::sections(balanced)))?;
    println!(
        "Balanced sections: {:?}, speedup {:.2}x",
        report.elapsed,
        sequential.as_secs_f64() / report.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Dense matrix-vector product with one stage per column, in three variants:
/// static with barriers, dynamic without barriers (racy), static without
/// barriers.
fn dmvm(builder: &TeamBuilder, columns: usize) -> Result<(), Error> {
    const ROWS: usize = 600;
    let columns = columns.clamp(1, 40_000);
    let matrix = vec![1.0; ROWS * columns];
    let rhs = vec![1.0; columns];
    let flops = 2.0 * (ROWS * columns) as f64;

    for (name, schedule, barrier) in [
        ("v1 static + barrier", Schedule::Static, BarrierMode::Wait),
        ("v2 dynamic + nowait", Schedule::Dynamic(1), BarrierMode::NoWait),
        ("v3 static + nowait", Schedule::Static, BarrierMode::NoWait),
    ] {
        let lhs = SharedArray::instrumented(ROWS, 0.0);
        let region = (0..columns).fold(Region::new(), |region, c| {
            let (matrix, rhs, lhs) = (&matrix, &rhs, &lhs);
            region.stage(
                Stage::parallel_for(0..ROWS, schedule, move |w, r| {
                    lhs.add_racy(w, r, matrix[r + ROWS * c] * rhs[c])
                })
                .with_barrier(barrier),
            )
        });
        let report = builder.run_region(region)?;
        let wrong = lhs
            .to_vec()
            .iter()
            .filter(|&&x| x != columns as f64)
            .count();
        println!(
            "{name}: {:?}, {:.2} MFLOP/s, {wrong} wrong rows, {} race warnings",
            report.elapsed,
            flops / report.elapsed.as_secs_f64() / 1e6,
            report.race_warnings.len()
        );
    }
    Ok(())
}

/// Tasks of random cost and priority.
fn tasks(builder: &TeamBuilder, num_tasks: usize) -> Result<(), Error> {
    let num_tasks = num_tasks.clamp(1, 10_000);
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let costs = (0..num_tasks)
        .map(|_| (rng.random_range(1..=100), rng.random_range(1_000..100_000)))
        .collect::<Vec<(i32, usize)>>();
    let costs = costs.as_slice();

    let region = Region::new().stage(Stage::tasks(|scope| {
        for &(priority, cost) in costs {
            scope.submit(priority, move |_| {
                black_box(task_light(cost));
            });
        }
    }));
    let report = builder.run_region(region)?;
    let records = &report.stages[0].tasks;
    let mut per_worker = vec![0; report.team_size];
    for record in records {
        per_worker[record.worker] += 1;
    }
    println!("Ran {} tasks in {:?}", records.len(), report.elapsed);
    println!("Tasks per worker: {per_worker:?}");
    if let Some(first) = records.first() {
        println!("First task started: #{} (priority {})", first.id, first.priority);
    }
    Ok(())
}

/// CLI tool to run examples of parallel regions.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Schedule of the loops, e.g. `static`, `dynamic,4` or `guided,16`.
    /// Defaults to the `WORKSHARE_SCHEDULE` environment variable, or static.
    #[arg(long)]
    schedule: Option<Schedule>,

    /// Whether to pin the worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_cpus: bool,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Size of the input, whose meaning depends on the scenario.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Print the rank of each worker.
    Hello,
    /// Compute pi, each worker taking every n-th step.
    PiCyclic,
    /// Compute pi with a reduction.
    Pi,
    /// Multiply two square matrices.
    Matmul,
    /// Compute statistics of random values, one section per statistic.
    Stats,
    /// Initialize a matrix on worker 0, print it on one worker, then sum it.
    MasterSingle,
    /// Run unequal work as unbalanced and balanced sections.
    LoadBalance,
    /// Dense matrix-vector product with and without barriers.
    Dmvm,
    /// Run prioritized tasks.
    Tasks,
}

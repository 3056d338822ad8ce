// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Simple program that computes the sum of a slice using Workshare with the
//! static schedule.

use std::hint::black_box;
use workshare::{
    CpuPinningPolicy, Error, Reduction, Region, Schedule, Stage, TeamBuilder, ThreadCount,
};

fn main() -> Result<(), Error> {
    let builder = TeamBuilder {
        num_threads: ThreadCount::AvailableParallelism,
        cpu_pinning: CpuPinningPolicy::IfSupported,
        trace_chunks: false,
    };

    let input_size = 1_000_000;

    let input = (0..input_size).collect::<Vec<u64>>();
    let input = black_box(input.as_slice());
    let region = Region::with_reductions().stage(Stage::reduce(
        0..input.len(),
        Schedule::Static,
        Reduction::sum(),
        |acc: &mut u64, _, i| *acc += input[i],
    ));
    let report = builder.run_region(region)?;
    let sum = report.reduction(0).copied().unwrap_or_default();
    println!("sum = {sum}");
    Ok(())
}

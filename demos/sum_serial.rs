// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sequential baseline for `sum_static`: the same reduction, forced onto a
//! team of one worker.

use std::hint::black_box;
use workshare::{run_region, Error, Reduction, Schedule, Stage};

fn main() -> Result<(), Error> {
    let input_size = 1_000_000;

    let input = (0..input_size).collect::<Vec<u64>>();
    let input = black_box(input.as_slice());
    let report = run_region(
        1,
        [Stage::reduce(
            0..input.len(),
            Schedule::Static,
            Reduction::sum(),
            |acc: &mut u64, _, i| *acc += input[i],
        )],
    )?;
    let sum = report.reduction(0).copied().unwrap_or_default();
    println!("sum = {sum} in {:?}", report.elapsed);
    Ok(())
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeline_scheduler::{simulate, FillDrain, OneForwardOneBackward, ScheduleStrategy, TaskCosts};

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_all");
    for &(stages, micro) in &[(4usize, 16usize), (8, 64), (16, 256)] {
        group.bench_with_input(
            BenchmarkId::new("1f1b", format!("{stages}x{micro}")),
            &(stages, micro),
            |b, &(s, m)| b.iter(|| OneForwardOneBackward::new().schedule_all(black_box(s), black_box(m))),
        );
    }
    group.finish();
}

fn bench_simulation(c: &mut Criterion) {
    let costs = TaskCosts::default();
    let one_f_one_b = OneForwardOneBackward::new().schedule_all(8, 64).unwrap();
    let fill_drain = FillDrain::new().schedule_all(8, 64).unwrap();

    let mut group = c.benchmark_group("simulate_8x64");
    group.bench_function("1f1b", |b| b.iter(|| simulate(black_box(&one_f_one_b), &costs)));
    group.bench_function("fill-drain", |b| b.iter(|| simulate(black_box(&fill_drain), &costs)));
    group.finish();
}

criterion_group!(benches, bench_generation, bench_simulation);
criterion_main!(benches);

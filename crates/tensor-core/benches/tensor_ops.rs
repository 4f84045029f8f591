// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for batch splitting and gradient accumulation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tensor_core::{ops, Shape, Tensor};

fn bench_split_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_batch");
    let input = Tensor::ones(Shape::new(vec![64, 128, 256]));
    for chunk in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| input.split_batch(black_box(chunk)))
        });
    }
    group.finish();
}

fn bench_add_assign(c: &mut Criterion) {
    let grad = Tensor::ones(Shape::matrix(1024, 1024));
    c.bench_function("add_assign_1m", |b| {
        let mut acc = Tensor::zeros(Shape::matrix(1024, 1024));
        b.iter(|| ops::add_assign(&mut acc, black_box(&grad)))
    });
}

criterion_group!(benches, bench_split_batch, bench_add_assign);
criterion_main!(benches);

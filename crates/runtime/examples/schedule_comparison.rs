// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Example: Compare 1F1B and fill-drain on a four-stage synthetic chain.
//!
//! Both schedules produce the same gradients; they differ in how long
//! each stage waits on its neighbours and how many forwards it keeps
//! in flight.
//!
//! ```bash
//! cargo run -p runtime --example schedule_comparison
//! ```

use runtime::synthetic::ChainSpec;
use runtime::{LocalFabric, PipelineConfig, PipelineEngine, ProcessContext, StageModel, StepMetrics};
use std::sync::Arc;

const STAGES: usize = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing.
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let spec = ChainSpec::new(8, 64).with_noise(0.05);
    let batch = spec.make_batch(32);

    for schedule in ["1f1b", "fill-drain"] {
        let config = PipelineConfig {
            batch_size: 32,
            micro_batch_size: 4,
            schedule: schedule.into(),
            stages: (0..STAGES).map(|s| vec![s]).collect(),
            ..Default::default()
        };
        let metrics = run(&config, &spec, &batch)?;

        println!("── {schedule} ──");
        for m in &metrics {
            println!("  {}", m.summary());
        }
        println!();
    }
    Ok(())
}

/// Runs one step on every stage, each on its own thread.
fn run(
    config: &PipelineConfig,
    spec: &ChainSpec,
    batch: &model_ir::Batch,
) -> Result<Vec<StepMetrics>, Box<dyn std::error::Error>> {
    let fabric = LocalFabric::new(STAGES);
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..STAGES)
            .map(|rank| {
                let process = ProcessContext::new(fabric.endpoint(rank));
                scope.spawn(move || -> Result<StepMetrics, runtime::RuntimeError> {
                    let (graph, program) = spec.build()?;
                    let make = spec.clone();
                    let model = StageModel::new(
                        graph,
                        Arc::new(program),
                        Arc::new(move |n| make.make_batch(n)),
                    );
                    let mut engine = PipelineEngine::new(config.clone(), model, process)?
                        .partition()?
                        .prepare()?;
                    Ok(engine.train_step(batch)?.metrics)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| "stage thread panicked"))
            .collect::<Vec<_>>()
    });

    let mut metrics = Vec::with_capacity(STAGES);
    for result in results {
        metrics.push(result??);
    }
    Ok(metrics)
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `stagepipe inspect` command: trace a synthetic model and show how it
//! is cut into stages.

use partition_planner::{DryRunner, ModelPartitioner, OwnershipResolver};
use runtime::synthetic::ChainSpec;
use runtime::{PipelineConfig, StageBoundaryFactory, StageLinks};

pub async fn execute(
    blocks: usize,
    hidden: usize,
    stages: usize,
    assignment: String,
) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║            stagepipe · Partition Inspector           ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let spec = ChainSpec::new(blocks, hidden);
    let (graph, program) = spec.build()?;
    println!("  {}", graph.summary());
    println!();

    // ── Dry run ────────────────────────────────────────────────
    let make_batch = |rows| spec.make_batch(rows);
    let trace = DryRunner::new(&graph).trace(&program, &make_batch)?;
    let ownership =
        OwnershipResolver::new(&graph, &[]).resolve(&program, &spec.make_batch(1), &trace)?;

    println!("  Boundary markers:");
    println!("  {:<4} {:<16} {}", "Idx", "Module", "Tensors (per row)");
    println!("  {}", "-".repeat(48));
    for marker in &trace.markers {
        let shapes: Vec<String> = marker
            .signature
            .shapes_for(1)
            .iter()
            .map(|s| format!("{:?}", s.dims()))
            .collect();
        println!("  {:<4} {:<16} {}", marker.index, marker.module, shapes.join(", "));
    }
    println!();

    // ── Assignment ─────────────────────────────────────────────
    let config = PipelineConfig {
        assignment,
        stages: (0..stages).map(|s| vec![s]).collect(),
        ..PipelineConfig::default()
    };
    let strategy = config.create_assignment_strategy()?;
    let cuts = strategy.assign(stages, &trace, &ownership, &graph)?;
    println!("  Assignment '{}': stage starts {:?}", strategy.name(), cuts.cuts());
    println!();

    println!(
        "  {:<6} {:<10} {:>8} {:>8} {:>10} {:<12} {:<12}",
        "Stage", "Intervals", "Modules", "Params", "Elements", "Receives", "Sends",
    );
    println!("  {}", "-".repeat(74));
    let factory = StageBoundaryFactory::new(StageLinks::new());
    for stage in 0..stages {
        let part = ModelPartitioner::new(&trace, &ownership, &cuts).partition(
            graph.clone(),
            stage,
            &factory,
        )?;
        let marker = |m: &Option<partition_planner::MarkerTrace>| {
            m.as_ref().map_or_else(|| "-".to_string(), |m| m.module.clone())
        };
        println!(
            "  {:<6} {:<10} {:>8} {:>8} {:>10} {:<12} {:<12}",
            stage,
            format!("{:?}", part.intervals),
            part.report.local_modules,
            part.report.resident_parameters,
            part.report.resident_elements,
            marker(&part.receive_marker),
            marker(&part.send_marker),
        );
    }
    println!();
    Ok(())
}

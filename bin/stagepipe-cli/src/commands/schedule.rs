// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `stagepipe schedule` command: print and simulate per-stage task lists.

use pipeline_scheduler::{simulate, TaskCosts};

pub async fn execute(
    stages: usize,
    microbatches: usize,
    strategy: String,
    timeline: bool,
    backward_cost: f64,
) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║             stagepipe · Schedule Viewer              ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let strategy = pipeline_scheduler::strategy_by_name(&strategy.to_lowercase())?;
    let schedules = strategy.schedule_all(stages, microbatches)?;

    println!(
        "  Strategy: {}  ({stages} stage(s), {microbatches} microbatch(es))",
        strategy.name()
    );
    println!();
    println!(
        "  {:<6} {:>4} {:>4} {:>4} {:>9}  {}",
        "Stage", "F", "R", "B", "In-flight", "Tasks",
    );
    println!("  {}", "-".repeat(72));
    for schedule in &schedules {
        println!(
            "  {:<6} {:>4} {:>4} {:>4} {:>9}  {schedule}",
            schedule.stage,
            schedule.num_forwards(),
            schedule.num_recomputes(),
            schedule.num_backwards(),
            schedule.max_in_flight(),
        );
    }
    println!();

    println!("  Wire format:");
    for schedule in &schedules {
        println!("   stage {}: {}", schedule.stage, schedule.to_text());
    }
    println!();

    if timeline {
        let costs = TaskCosts {
            backward: backward_cost,
            ..TaskCosts::default()
        };
        let report = simulate(&schedules, &costs)?;
        println!("  Simulation (forward 1.0, backward {backward_cost:.1}):");
        for line in report.summary().lines() {
            println!("   {line}");
        }
        println!();
    }
    Ok(())
}

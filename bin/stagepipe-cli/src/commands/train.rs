// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `stagepipe train` command: run every rank of a job in this process.
//!
//! Each rank gets a blocking task and an endpoint on one in-process
//! fabric, then walks the engine's type-state pipeline:
//! ```text
//! PipelineEngine<Idle> → partition → <Partitioned> → prepare → <Ready> → train_step × N
//! ```

use runtime::synthetic::ChainSpec;
use runtime::{
    LocalFabric, PipelineConfig, PipelineEngine, ProcessContext, RuntimeError, StageModel,
    StepMetrics,
};
use std::path::PathBuf;
use std::sync::{Arc, Barrier};

/// Arguments of `stagepipe train`.
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub blocks: usize,
    pub hidden: usize,
    pub noise: f32,
    pub stages: usize,
    pub replicas: usize,
    pub batch_size: usize,
    pub micro_batch_size: usize,
    pub schedule: String,
    pub steps: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub json: bool,
}

impl TrainArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            micro_batch_size: self.micro_batch_size,
            schedule: self.schedule.clone(),
            stages: (0..self.stages)
                .map(|s| (0..self.replicas).map(|r| s * self.replicas + r).collect())
                .collect(),
            ..PipelineConfig::default()
        }
    }
}

/// What one rank reports back.
struct RankReport {
    rank: usize,
    stage: usize,
    replica: usize,
    steps: Vec<StepMetrics>,
}

pub async fn execute(args: TrainArgs, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => args.config(),
    };
    config.validate()?;
    let topology = config.topology()?;

    if !args.json {
        println!("╔══════════════════════════════════════════════════════╗");
        println!("║              stagepipe · Pipeline Trainer            ║");
        println!("╚══════════════════════════════════════════════════════╝");
        println!();
        println!("  Config:");
        if let Some(path) = &config_path {
            println!("   File:         {}", path.display());
        }
        println!("   Model:        {} block(s), hidden {}", args.blocks, args.hidden);
        println!(
            "   Topology:     {} stage(s) x {} replica(s)",
            topology.num_stages(),
            topology.data_parallel_depth()
        );
        println!(
            "   Batch:        {} global, {} per replica, {} microbatch(es)",
            config.batch_size,
            config.replica_batch_size(),
            config.num_microbatches()
        );
        println!("   Schedule:     {}", config.schedule);
        println!();
    }

    let spec = ChainSpec::new(args.blocks, args.hidden).with_noise(args.noise);
    let shares = spec
        .make_batch(config.batch_size)
        .scatter(config.replica_batch_size())?;
    let fabric = LocalFabric::new(topology.world_size());
    let barrier = Arc::new(Barrier::new(topology.world_size()));

    let mut tasks = Vec::new();
    for rank in topology.ranks() {
        let placement = topology.locate(rank)?;
        let batch = shares
            .get(placement.replica)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no batch share for replica {}", placement.replica))?;
        let (config, spec, steps) = (config.clone(), spec.clone(), args.steps);
        let checkpoint_dir = args.checkpoint_dir.clone();
        let process = ProcessContext::new(fabric.endpoint(rank)).with_local(rank, barrier.clone());

        tasks.push(tokio::task::spawn_blocking(move || -> Result<RankReport, RuntimeError> {
            let (graph, program) = spec.build()?;
            let make = spec.clone();
            let model = StageModel::new(graph, Arc::new(program), Arc::new(move |n| make.make_batch(n)));
            let mut engine = PipelineEngine::new(config, model, process)?
                .partition()?
                .prepare()?;

            let mut reports = Vec::with_capacity(steps);
            for _ in 0..steps {
                reports.push(engine.train_step(&batch)?.metrics);
            }
            if let (Some(dir), 0) = (&checkpoint_dir, placement.replica) {
                engine.save_checkpoint(dir)?;
            }
            Ok(RankReport {
                rank,
                stage: placement.stage,
                replica: placement.replica,
                steps: reports,
            })
        }));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    let mut failures = Vec::new();
    for task in tasks {
        match task.await? {
            Ok(report) => reports.push(report),
            Err(e) => failures.push(e),
        }
    }
    if let Some(first) = failures.into_iter().next() {
        return Err(anyhow::anyhow!("training failed: {first}"));
    }
    reports.sort_by_key(|r| (r.stage, r.replica));

    if args.json {
        let last: Vec<&StepMetrics> = reports.iter().filter_map(|r| r.steps.last()).collect();
        println!("{}", serde_json::to_string_pretty(&last)?);
        return Ok(());
    }

    // ── Loss curve ─────────────────────────────────────────────
    if let Some(last_stage) = reports
        .iter()
        .find(|r| r.stage + 1 == topology.num_stages() && r.replica == 0)
    {
        println!("  Loss:");
        for m in &last_stage.steps {
            let loss = m.loss.map_or_else(|| "-".to_string(), |l| format!("{l:.6}"));
            println!("   step {:<4} {loss}", m.step);
        }
        println!();
    }

    // ── Per-rank metrics ───────────────────────────────────────
    println!(
        "  {:<5} {:<6} {:<8} {:>10} {:>10} {:>8} {:>10}",
        "Rank", "Stage", "Replica", "Step ms", "Wait ms", "Wait %", "Sent B",
    );
    println!("  {}", "-".repeat(64));
    for report in &reports {
        if let Some(m) = report.steps.last() {
            println!(
                "  {:<5} {:<6} {:<8} {:>10.2} {:>10.2} {:>7.0}% {:>10}",
                report.rank,
                report.stage,
                report.replica,
                m.total_duration.as_secs_f64() * 1000.0,
                m.total_wait_duration.as_secs_f64() * 1000.0,
                m.wait_fraction() * 100.0,
                m.transfer.bytes_sent,
            );
        }
    }
    println!();
    if let Some(dir) = &args.checkpoint_dir {
        println!("  Checkpoints written to {}", dir.display());
        println!();
    }
    Ok(())
}

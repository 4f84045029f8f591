// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # stagepipe
//!
//! Command-line interface for the pipeline-parallel training runtime.
//!
//! ## Usage
//! ```bash
//! # Print the per-stage task lists of a schedule and simulate them
//! stagepipe schedule --stages 4 --microbatches 8 --simulate
//!
//! # Show how a synthetic model is cut into stages
//! stagepipe inspect --blocks 8 --hidden 32 --stages 4
//!
//! # Train a synthetic model with every rank in this process
//! stagepipe train --stages 3 --replicas 2 --steps 5
//! stagepipe train --config pipeline.toml
//! ```

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stagepipe",
    about = "Pipeline-parallel training with boundary-marker partitioning",
    version,
    author
)]
struct Cli {
    /// Path to a TOML pipeline configuration (overrides CLI arguments).
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the task list of every stage for a schedule.
    Schedule {
        /// Number of pipeline stages.
        #[arg(short, long, default_value_t = 4)]
        stages: usize,

        /// Microbatches per step.
        #[arg(short, long, default_value_t = 8)]
        microbatches: usize,

        /// Schedule: 1f1b or fill-drain.
        #[arg(long, default_value = "1f1b")]
        strategy: String,

        /// Also simulate the schedules and print the timeline.
        #[arg(long)]
        simulate: bool,

        /// Cost of a backward relative to a forward of 1.0.
        #[arg(long, default_value_t = 2.0)]
        backward_cost: f64,
    },

    /// Trace a synthetic model and show its stage partition.
    Inspect {
        /// Number of affine blocks.
        #[arg(short, long, default_value_t = 8)]
        blocks: usize,

        /// Hidden width of every block.
        #[arg(long, default_value_t = 16)]
        hidden: usize,

        /// Number of pipeline stages.
        #[arg(short, long, default_value_t = 4)]
        stages: usize,

        /// Assignment: even or balanced.
        #[arg(long, default_value = "even")]
        assignment: String,
    },

    /// Train a synthetic model with all ranks in this process.
    Train {
        /// Number of affine blocks.
        #[arg(short, long, default_value_t = 6)]
        blocks: usize,

        /// Hidden width of every block.
        #[arg(long, default_value_t = 16)]
        hidden: usize,

        /// Noise amplitude after every block (0 disables it).
        #[arg(long, default_value_t = 0.0)]
        noise: f32,

        /// Number of pipeline stages.
        #[arg(short, long, default_value_t = 3)]
        stages: usize,

        /// Data-parallel replicas per stage.
        #[arg(short, long, default_value_t = 1)]
        replicas: usize,

        /// Global batch size.
        #[arg(long, default_value_t = 16)]
        batch_size: usize,

        /// Rows per microbatch.
        #[arg(long, default_value_t = 2)]
        micro_batch_size: usize,

        /// Schedule: 1f1b or fill-drain.
        #[arg(long, default_value = "1f1b")]
        schedule: String,

        /// Training steps to run.
        #[arg(long, default_value_t = 3)]
        steps: usize,

        /// Write stage checkpoints here after the last step.
        #[arg(long)]
        checkpoint_dir: Option<std::path::PathBuf>,

        /// Print the final step metrics as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging based on verbosity.
    commands::init_tracing(cli.verbose);

    match cli.command {
        Commands::Schedule {
            stages,
            microbatches,
            strategy,
            simulate,
            backward_cost,
        } => commands::schedule::execute(stages, microbatches, strategy, simulate, backward_cost).await,
        Commands::Inspect {
            blocks,
            hidden,
            stages,
            assignment,
        } => commands::inspect::execute(blocks, hidden, stages, assignment).await,
        Commands::Train {
            blocks,
            hidden,
            noise,
            stages,
            replicas,
            batch_size,
            micro_batch_size,
            schedule,
            steps,
            checkpoint_dir,
            json,
        } => {
            let args = commands::train::TrainArgs {
                blocks,
                hidden,
                noise,
                stages,
                replicas,
                batch_size,
                micro_batch_size,
                schedule,
                steps,
                checkpoint_dir,
                json,
            };
            commands::train::execute(args, cli.config).await
        }
    }
}

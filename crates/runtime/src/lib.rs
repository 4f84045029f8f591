// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # runtime
//!
//! The per-stage engine of a pipeline-parallel training job.
//!
//! Every process runs one [`PipelineEngine`] for one (stage, replica)
//! slot of the [`StageTopology`]. The engine takes:
//! - The full, validated `ModelGraph` and its `ModelProgram` from `model-ir`.
//! - A stage assignment from `partition-planner`.
//! - A per-stage task list from `pipeline-scheduler`.
//!
//! And trains its stage microbatch by microbatch, moving activations and
//! gradients through background transfer workers.
//!
//! # Type-State Pipeline
//! The runtime enforces a type-safe setup sequence:
//! ```text
//! PipelineEngine<Idle> → PipelineEngine<Partitioned> → PipelineEngine<Ready>
//! ```
//! Transitions are compile-time checked.
//!
//! # Threads
//! The compute thread only touches local queues ([`StageLinks`]). One
//! worker thread per direction and queue talks to the neighbouring
//! stages through a [`Transport`]. A failure anywhere is raised on the
//! stage's [`FaultChannel`], which wakes every blocked party.

mod boundary;
pub mod checkpoint;
mod config;
mod engine;
mod error;
mod executor;
mod fault;
mod metrics;
mod shared;
mod sync;
pub mod synthetic;
mod topology;
pub mod transport;
mod workers;

pub use boundary::{BoundaryRole, StageBoundary, StageBoundaryFactory, StageLinks, TransferQueue};
pub use checkpoint::{checkpoint_path, load_stage, save_stage};
pub use config::PipelineConfig;
pub use engine::{
    BatchFactory, EngineState, Idle, Partitioned, PipelineEngine, ProcessContext, Ready,
    StageModel, StepOutput,
};
pub use error::{RuntimeError, TransferError};
pub use fault::FaultChannel;
pub use metrics::{StepMetrics, TaskMetrics};
pub use shared::SharedMirror;
pub use sync::{GradientSync, NoGradientSync, TransportAllReduce};
pub use topology::{RankPlacement, StageTopology};
pub use transport::{Channel, LocalFabric, LocalTransport, Transport};
pub use workers::{TransferStats, TransferWorkers, WorkerPlan};

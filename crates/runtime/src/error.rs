// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the pipeline runtime.

use tensor_core::Shape;

/// Failures of the point-to-point transport and the transfer workers.
///
/// These travel through the [`crate::FaultChannel`], so they are `Clone`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    /// The transport could not move a payload to or from a peer.
    #[error("transport failure with rank {peer}: {detail}")]
    Transport { peer: usize, detail: String },

    /// A received payload did not have the expected tensor shapes.
    #[error("payload from rank {peer} has shapes {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        peer: usize,
        expected: Vec<Shape>,
        actual: Vec<Shape>,
    },

    /// A local queue lost its other end.
    #[error("queue disconnected: {0}")]
    Disconnected(String),

    /// The job was aborted, locally or by another rank.
    #[error("pipeline aborted: {0}")]
    Aborted(String),
}

/// Errors that can occur while setting up or running a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration or topology error, detected before any step runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transfer worker failed; fatal for the whole run.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// The stage's own forward or backward failed.
    #[error("compute error on stage {stage}: {source}")]
    Compute {
        stage: usize,
        #[source]
        source: model_ir::ModelError,
    },

    /// Tracing, ownership or partitioning failed.
    #[error("planner error: {0}")]
    Planner(#[from] partition_planner::PlannerError),

    /// The schedule could not be built or is malformed.
    #[error("schedule error: {0}")]
    Schedule(#[from] pipeline_scheduler::ScheduleError),

    /// Model error outside a scheduled task.
    #[error("model error: {0}")]
    Model(#[from] model_ir::ModelError),

    /// A previous step failed; the run cannot continue.
    #[error("stage {0} is unusable after a failed step")]
    Poisoned(usize),

    /// Reading or writing a stage checkpoint failed.
    #[error("checkpoint error at '{path}': {detail}")]
    Checkpoint { path: String, detail: String },
}

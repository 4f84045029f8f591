// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the partition planner.

use model_ir::ModelError;

/// Errors that can occur while tracing, resolving or partitioning a model.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The stage-to-cut mapping is malformed or does not fit the model.
    #[error("invalid stage assignment: {0}")]
    InvalidAssignment(String),

    /// The two calibration traces disagree at a boundary marker.
    #[error("trace mismatch at boundary marker {marker} ('{module}'): {detail}")]
    TraceMismatch {
        marker: usize,
        module: String,
        detail: String,
    },

    /// The program's marker usage cannot be traced (e.g. a marker is
    /// called twice in one forward).
    #[error("tracing failed: {0}")]
    Trace(String),

    /// A parameter is read in two intervals without being declared shared.
    #[error(
        "parameter '{parameter}' is read in intervals {first} and {second}; \
         declare it as a shared parameter or move the boundary marker"
    )]
    OwnershipConflict {
        parameter: String,
        first: usize,
        second: usize,
    },

    /// A shared-parameter group cannot be resolved to stages.
    #[error("shared parameter group {members:?}: {detail}")]
    SharedParameter { members: Vec<String>, detail: String },

    /// The chosen assignment strategy cannot satisfy the given constraints.
    #[error("strategy '{strategy}' failed: {detail}")]
    StrategyFailed { strategy: String, detail: String },

    /// Reading or writing the dry-run cache failed.
    #[error("dry-run cache error: {0}")]
    Cache(String),

    /// The model program or graph rejected an operation.
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for model construction and execution.

use crate::BoundaryError;
use tensor_core::TensorError;

/// Errors that can occur when building, validating or running a model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// The module arena is malformed.
    #[error("invalid model graph: {0}")]
    InvalidGraph(String),

    /// A single module definition is invalid.
    #[error("invalid module '{module}': {detail}")]
    InvalidModule { module: String, detail: String },

    /// A module handle or name does not exist in this graph.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A container was invoked; only layers and boundary markers are callable.
    #[error("module '{module}' is a {kind} and cannot be called")]
    NotCallable { module: String, kind: &'static str },

    /// A parameter was read after being pruned from this stage.
    #[error("parameter '{parameter}' is not resident on this stage")]
    MissingParameter { parameter: String },

    /// A named input tensor is absent from the batch.
    #[error("batch has no input named '{name}'")]
    MissingInput { name: String },

    /// Named inputs of one batch disagree on their leading dimension.
    #[error("inconsistent batch: {0}")]
    InconsistentBatch(String),

    /// A layer's forward or backward computation failed.
    #[error("compute error in '{module}': {source}")]
    Compute {
        module: String,
        #[source]
        source: TensorError,
    },

    /// A boundary node failed to move activations or gradients.
    #[error("boundary '{module}' failed: {source}")]
    Boundary {
        module: String,
        #[source]
        source: BoundaryError,
    },

    /// A tensor operation outside any single module failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

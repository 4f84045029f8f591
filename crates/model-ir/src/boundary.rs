// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Boundary markers: user-placed cut points between pipeline stages.
//!
//! A boundary marker owns no computation. Every marker carries a
//! [`BoundaryNode`] that decides what happens when activations flow
//! forward through it and gradients flow backward through it:
//!
//! ```text
//!            forward ──▶                          ◀── backward
//!  stage s  ─────────▶ [ send-capable marker ] ═══▶ stage s+1
//!           ◀───────── [ receive-capable marker ] ◀═══
//! ```
//!
//! Markers start as [`PassThrough`] (identity both ways). The partitioner
//! swaps in a communicating node for exactly the two markers that bound
//! the local stage; all other markers stay pass-through.

use std::fmt;
use tensor_core::Tensor;

/// Per-call information handed to a boundary node.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    /// Microbatch index being processed.
    pub microbatch: usize,
    /// `true` while re-running a forward whose activations were already sent.
    pub recompute: bool,
    /// Boundary inputs saved by an earlier no-grad forward, replayed on recompute.
    pub replay: Option<Vec<Tensor>>,
}

impl PassContext {
    /// Context for a first-time forward or a directly paired backward.
    pub fn new(microbatch: usize) -> Self {
        Self {
            microbatch,
            recompute: false,
            replay: None,
        }
    }

    /// Context for recomputing a forward from saved boundary inputs.
    pub fn recompute(microbatch: usize, replay: Vec<Tensor>) -> Self {
        Self {
            microbatch,
            recompute: true,
            replay: Some(replay),
        }
    }
}

/// Failures raised by a boundary node while exchanging tensors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoundaryError {
    /// The transfer machinery behind the node has failed or shut down.
    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    /// A payload did not match the traced signature.
    #[error("unexpected payload: {0}")]
    Payload(String),
}

/// Forward/backward behaviour of a boundary marker.
///
/// Implementations must preserve gradient flow: whatever the forward
/// returns is what downstream modules consume, and whatever the backward
/// returns is treated as the gradient of the forward's inputs.
pub trait BoundaryNode: Send + Sync + fmt::Debug {
    /// Short label for logs (`"pass-through"`, `"receive"`, `"send"`).
    fn describe(&self) -> &'static str;

    /// Moves activations forward through the marker.
    fn forward(&self, cx: &PassContext, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError>;

    /// Moves gradients backward through the marker.
    ///
    /// An empty return means "no gradient for the inputs", which is what
    /// a stage's first marker produces after handing gradients upstream.
    fn backward(&self, cx: &PassContext, grads: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError>;
}

/// Identity boundary used for every marker that is not a live stage edge.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl BoundaryNode for PassThrough {
    fn describe(&self) -> &'static str {
        "pass-through"
    }

    fn forward(&self, _cx: &PassContext, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
        Ok(inputs)
    }

    fn backward(&self, _cx: &PassContext, grads: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
        Ok(grads)
    }
}

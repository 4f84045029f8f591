// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Differentiable leaf computations.
//!
//! A [`Layer`] is the unit the executor evaluates: it maps input tensors
//! and its parameters to outputs, and given output gradients produces
//! input and parameter gradients. Layers are stateless; anything the
//! backward needs beyond the inputs is returned as `saved` tensors by the
//! forward and handed back verbatim.

use crate::StageRng;
use std::fmt;
use tensor_core::{Tensor, TensorError};

/// Result of a layer forward.
#[derive(Debug, Clone, Default)]
pub struct LayerOutput {
    pub outputs: Vec<Tensor>,
    /// Extra tensors the backward needs (masks, normalisers, ...).
    pub saved: Vec<Tensor>,
}

impl LayerOutput {
    /// Output with nothing saved for the backward.
    pub fn new(outputs: Vec<Tensor>) -> Self {
        Self {
            outputs,
            saved: Vec::new(),
        }
    }
}

/// Result of a layer backward.
#[derive(Debug, Clone, Default)]
pub struct LayerGrads {
    /// One gradient per forward input, in order.
    pub inputs: Vec<Tensor>,
    /// One gradient per parameter, in the module's parameter order.
    pub params: Vec<Tensor>,
}

/// A differentiable computation attached to a layer module.
pub trait Layer: Send + Sync + fmt::Debug {
    /// Short type label used in summaries.
    fn kind(&self) -> &'static str;

    /// Number of parameters the module must provide.
    fn num_params(&self) -> usize;

    /// Computes outputs from `inputs` and `params`.
    fn forward(
        &self,
        params: &[&Tensor],
        inputs: &[Tensor],
        rng: &mut StageRng,
    ) -> Result<LayerOutput, TensorError>;

    /// Computes gradients given the forward's inputs, its saved tensors and
    /// the gradients of its outputs.
    fn backward(
        &self,
        params: &[&Tensor],
        inputs: &[Tensor],
        saved: &[Tensor],
        grad_outputs: &[Tensor],
    ) -> Result<LayerGrads, TensorError>;
}

/// Checks operand counts; shared by the reference layers.
pub(crate) fn expect_arity(
    op: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), TensorError> {
    if expected != actual {
        return Err(TensorError::Arity {
            op,
            expected,
            actual,
        });
    }
    Ok(())
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-feature affine transform.

use crate::layer::expect_arity;
use crate::{Layer, LayerGrads, LayerOutput, StageRng};
use tensor_core::{ops, Tensor, TensorError};

/// `y = x * weight + bias`, broadcast over every position of `x: [.., H]`.
#[derive(Debug, Clone)]
pub struct Affine {
    features: usize,
}

impl Affine {
    pub fn new(features: usize) -> Self {
        Self { features }
    }

    pub fn features(&self) -> usize {
        self.features
    }
}

impl Layer for Affine {
    fn kind(&self) -> &'static str {
        "affine"
    }

    fn num_params(&self) -> usize {
        2
    }

    fn forward(
        &self,
        params: &[&Tensor],
        inputs: &[Tensor],
        _rng: &mut StageRng,
    ) -> Result<LayerOutput, TensorError> {
        expect_arity("affine", 1, inputs.len())?;
        expect_arity("affine params", 2, params.len())?;
        let scaled = ops::mul_last_dim(&inputs[0], params[0])?;
        let y = ops::add_last_dim(&scaled, params[1])?;
        Ok(LayerOutput::new(vec![y]))
    }

    fn backward(
        &self,
        params: &[&Tensor],
        inputs: &[Tensor],
        _saved: &[Tensor],
        grad_outputs: &[Tensor],
    ) -> Result<LayerGrads, TensorError> {
        expect_arity("affine backward", 1, grad_outputs.len())?;
        let g = &grad_outputs[0];
        let x = &inputs[0];
        let dx = ops::mul_last_dim(g, params[0])?;
        let dw = ops::sum_to_last_dim(&ops::mul(g, x)?)?;
        let db = ops::sum_to_last_dim(g)?;
        Ok(LayerGrads {
            inputs: vec![dx],
            params: vec![dw, db],
        })
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Mean-squared-error loss.

use crate::layer::expect_arity;
use crate::{Layer, LayerGrads, LayerOutput, StageRng};
use tensor_core::{ops, Tensor, TensorError};

/// `loss = mean((pred - target)^2)`, a rank-0 output.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Layer for MseLoss {
    fn kind(&self) -> &'static str {
        "mse_loss"
    }

    fn num_params(&self) -> usize {
        0
    }

    fn forward(
        &self,
        _params: &[&Tensor],
        inputs: &[Tensor],
        _rng: &mut StageRng,
    ) -> Result<LayerOutput, TensorError> {
        expect_arity("mse_loss", 2, inputs.len())?;
        let diff = ops::sub(&inputs[0], &inputs[1])?;
        let sq = ops::mul(&diff, &diff)?;
        Ok(LayerOutput::new(vec![Tensor::scalar(ops::mean(&sq))]))
    }

    fn backward(
        &self,
        _params: &[&Tensor],
        inputs: &[Tensor],
        _saved: &[Tensor],
        grad_outputs: &[Tensor],
    ) -> Result<LayerGrads, TensorError> {
        expect_arity("mse_loss backward", 1, grad_outputs.len())?;
        let upstream = grad_outputs[0].item()?;
        let n = inputs[0].num_elements().max(1) as f32;
        let diff = ops::sub(&inputs[0], &inputs[1])?;
        let d_pred = ops::scale(&diff, 2.0 * upstream / n);
        let d_target = ops::scale(&d_pred, -1.0);
        Ok(LayerGrads {
            inputs: vec![d_pred, d_target],
            params: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_core::Shape;

    #[test]
    fn test_loss_and_gradient() {
        let pred = Tensor::from_vec(Shape::matrix(1, 2), vec![1.0, 3.0]).unwrap();
        let target = Tensor::from_vec(Shape::matrix(1, 2), vec![0.0, 1.0]).unwrap();
        let mut rng = StageRng::seeded(0);
        let out = MseLoss
            .forward(&[], &[pred.clone(), target.clone()], &mut rng)
            .unwrap();
        assert_eq!(out.outputs[0].item().unwrap(), 2.5);

        let grads = MseLoss
            .backward(&[], &[pred, target], &[], &[Tensor::scalar(1.0)])
            .unwrap();
        assert_eq!(grads.inputs[0].as_slice(), &[1.0, 2.0]);
        assert_eq!(grads.inputs[1].as_slice(), &[-1.0, -2.0]);
    }
}

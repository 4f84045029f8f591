// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Multiplicative noise, the stochastic layer used to exercise RNG replay.

use crate::layer::expect_arity;
use crate::{Layer, LayerGrads, LayerOutput, StageRng};
use tensor_core::{ops, Tensor, TensorError};

/// `y = x * mask` with `mask = 1 + amplitude * (u - 0.5)` drawn per element.
#[derive(Debug, Clone)]
pub struct Noise {
    amplitude: f32,
}

impl Noise {
    pub fn new(amplitude: f32) -> Self {
        Self { amplitude }
    }
}

impl Layer for Noise {
    fn kind(&self) -> &'static str {
        "noise"
    }

    fn num_params(&self) -> usize {
        0
    }

    fn forward(
        &self,
        _params: &[&Tensor],
        inputs: &[Tensor],
        rng: &mut StageRng,
    ) -> Result<LayerOutput, TensorError> {
        expect_arity("noise", 1, inputs.len())?;
        let x = &inputs[0];
        let draws = (0..x.num_elements())
            .map(|_| 1.0 + self.amplitude * (rng.uniform() - 0.5))
            .collect();
        let mask = Tensor::from_vec(x.shape().clone(), draws)?;
        let y = ops::mul(x, &mask)?;
        Ok(LayerOutput {
            outputs: vec![y],
            saved: vec![mask],
        })
    }

    fn backward(
        &self,
        _params: &[&Tensor],
        _inputs: &[Tensor],
        saved: &[Tensor],
        grad_outputs: &[Tensor],
    ) -> Result<LayerGrads, TensorError> {
        expect_arity("noise backward", 1, grad_outputs.len())?;
        expect_arity("noise saved", 1, saved.len())?;
        Ok(LayerGrads {
            inputs: vec![ops::mul(&grad_outputs[0], &saved[0])?],
            params: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_core::Shape;

    #[test]
    fn test_same_state_same_mask() {
        let layer = Noise::new(0.5);
        let x = Tensor::ones(Shape::matrix(2, 3));
        let mut rng = StageRng::seeded(11);
        let snap = rng.snapshot();
        let a = layer.forward(&[], &[x.clone()], &mut rng).unwrap();
        rng.restore(snap);
        let b = layer.forward(&[], &[x], &mut rng).unwrap();
        assert_eq!(a.outputs, b.outputs);
        assert!(a.saved[0].as_slice().iter().all(|m| (0.75..1.25).contains(m)));
    }

    #[test]
    fn test_backward_uses_saved_mask() {
        let layer = Noise::new(0.5);
        let mask = Tensor::full(Shape::vector(2), 1.2);
        let g = Tensor::ones(Shape::vector(2));
        let grads = layer.backward(&[], &[], &[mask], &[g]).unwrap();
        assert_eq!(grads.inputs[0].as_slice(), &[1.2, 1.2]);
    }
}

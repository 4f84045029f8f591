// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Synthetic marker-cut models for demos, benches and tests.
//!
//! A chain of affine blocks (optionally each followed by a noise layer)
//! with boundary markers after chosen blocks and an MSE loss at the end.

use model_ir::layers::{Affine, MseLoss, Noise};
use model_ir::{
    Batch, Invoke, ModelError, ModelGraph, ModelProgram, ModuleId, Validated, Value,
};
use std::sync::Arc;
use tensor_core::{Shape, Tensor};

/// Shape of a synthetic chain model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub blocks: usize,
    pub hidden: usize,
    /// Blocks followed by a boundary marker.
    pub cuts_after: Vec<usize>,
    /// Noise amplitude after every block; `0.0` disables noise.
    pub noise: f32,
}

impl ChainSpec {
    /// `blocks` blocks with a marker after each but the last.
    pub fn new(blocks: usize, hidden: usize) -> Self {
        Self {
            blocks,
            hidden,
            cuts_after: (0..blocks.saturating_sub(1)).collect(),
            noise: 0.0,
        }
    }

    pub fn with_cuts(mut self, cuts_after: Vec<usize>) -> Self {
        self.cuts_after = cuts_after;
        self
    }

    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise = amplitude;
        self
    }

    /// Builds the graph and its program.
    pub fn build(&self) -> Result<(ModelGraph<Validated>, ChainProgram), ModelError> {
        let mut g = ModelGraph::new("chain");
        let root = g.add_container("net", None);
        let mut steps = Vec::new();
        for i in 0..self.blocks {
            let block = g.add_container(&format!("block{i}"), Some(root));
            let fc = g.add_layer("fc", Some(block), Arc::new(Affine::new(self.hidden)));
            let weight = (0..self.hidden)
                .map(|j| 0.9 + 0.05 * ((i + j) % 5) as f32)
                .collect();
            g.add_parameter(fc, "weight", Tensor::from_vec(Shape::vector(self.hidden), weight)?)?;
            g.add_parameter(fc, "bias", Tensor::full(Shape::vector(self.hidden), 0.01 * i as f32))?;
            steps.push(fc);
            if self.noise > 0.0 {
                steps.push(g.add_layer("noise", Some(block), Arc::new(Noise::new(self.noise))));
            }
            if self.cuts_after.contains(&i) {
                steps.push(g.add_boundary(&format!("cut{i}"), Some(root)));
            }
        }
        let loss = g.add_layer("loss", None, Arc::new(MseLoss));
        Ok((g.validate()?, ChainProgram { steps, loss }))
    }

    /// Deterministic batch of `rows` examples.
    pub fn make_batch(&self, rows: usize) -> Batch {
        make_batch(rows, self.hidden)
    }
}

/// Forward of a chain: every step in order, then the loss on `(h, y)`.
#[derive(Debug, Clone)]
pub struct ChainProgram {
    steps: Vec<ModuleId>,
    loss: ModuleId,
}

impl ModelProgram for ChainProgram {
    fn forward(&self, cx: &mut dyn Invoke, batch: &Batch) -> Result<Vec<Value>, ModelError> {
        let mut h = vec![Value::constant(batch.input("x")?.clone())];
        for &id in &self.steps {
            h = cx.call(id, h)?;
        }
        h.push(Value::constant(batch.input("y")?.clone()));
        cx.call(self.loss, h)
    }
}

/// Inputs `x` and targets `y` of width `hidden`, varying by row.
pub fn make_batch(rows: usize, hidden: usize) -> Batch {
    let shape = Shape::matrix(rows, hidden);
    let mut x = Tensor::zeros(shape.clone());
    for (i, v) in x.as_mut_slice().iter_mut().enumerate() {
        *v = ((i % 7) as f32 - 3.0) * 0.25;
    }
    let mut y = Tensor::zeros(shape);
    for (i, v) in y.as_mut_slice().iter_mut().enumerate() {
        *v = (i % 3) as f32 * 0.5;
    }
    Batch::new().with("x", x).with("y", y)
}

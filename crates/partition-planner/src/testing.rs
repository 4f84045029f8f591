// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Small marker-cut models shared by the unit tests.

use model_ir::layers::{Affine, MseLoss};
use model_ir::{
    Batch, Invoke, ModelError, ModelGraph, ModelProgram, ModuleId, Validated, Value,
};
use std::sync::Arc;
use tensor_core::{Shape, Tensor};

/// Runs `steps` in order, then the loss on `(h, y)`.
pub(crate) struct Chain {
    pub steps: Vec<ModuleId>,
    pub loss: ModuleId,
}

impl ModelProgram for Chain {
    fn forward(&self, cx: &mut dyn Invoke, batch: &Batch) -> Result<Vec<Value>, ModelError> {
        let mut h = vec![Value::constant(batch.input("x")?.clone())];
        for &id in &self.steps {
            h = cx.call(id, h)?;
        }
        h.push(Value::constant(batch.input("y")?.clone()));
        cx.call(self.loss, h)
    }
}

/// `blocks` affine layers of width `hidden` under `net`, with a boundary
/// marker after each block index listed in `cuts_after`.
pub(crate) fn chain(
    blocks: usize,
    hidden: usize,
    cuts_after: &[usize],
) -> (ModelGraph<Validated>, Chain) {
    let mut g = ModelGraph::new("chain");
    let root = g.add_container("net", None);
    let mut steps = Vec::new();
    for i in 0..blocks {
        let l = g.add_layer(&format!("block{i}"), Some(root), Arc::new(Affine::new(hidden)));
        g.add_parameter(l, "weight", Tensor::full(Shape::vector(hidden), 1.0 + i as f32))
            .unwrap();
        g.add_parameter(l, "bias", Tensor::zeros(Shape::vector(hidden)))
            .unwrap();
        steps.push(l);
        if cuts_after.contains(&i) {
            steps.push(g.add_boundary(&format!("cut{i}"), Some(root)));
        }
    }
    let loss = g.add_layer("loss", None, Arc::new(MseLoss));
    (g.validate().unwrap(), Chain { steps, loss })
}

/// Batch of `rows` examples for a chain of width `hidden`.
pub(crate) fn batch(rows: usize, hidden: usize) -> Batch {
    Batch::new()
        .with("x", Tensor::ones(Shape::matrix(rows, hidden)))
        .with("y", Tensor::zeros(Shape::matrix(rows, hidden)))
}

/// `head` and `tail` either side of one marker, with `tail` reading the
/// weight declared on `head`.
pub(crate) fn tied() -> (ModelGraph<Validated>, Chain) {
    let mut g = ModelGraph::new("tied");
    let head = g.add_layer("head", None, Arc::new(Affine::new(2)));
    let w = g.add_parameter(head, "weight", Tensor::ones(Shape::vector(2))).unwrap();
    g.add_parameter(head, "bias", Tensor::zeros(Shape::vector(2))).unwrap();
    let cut = g.add_boundary("cut", None);
    let tail = g.add_layer("tail", None, Arc::new(Affine::new(2)));
    g.tie_parameter(tail, w).unwrap();
    g.add_parameter(tail, "bias", Tensor::zeros(Shape::vector(2))).unwrap();
    let loss = g.add_layer("loss", None, Arc::new(MseLoss));
    (
        g.validate().unwrap(),
        Chain {
            steps: vec![head, cut, tail],
            loss,
        },
    )
}

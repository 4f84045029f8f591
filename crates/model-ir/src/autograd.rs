// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Minimal reverse-mode tape over module calls.
//!
//! When a stage runs a forward with gradient tracking, every layer and
//! boundary call is appended to a [`Tape`] together with its inputs and
//! saved tensors. [`Tape::backward`] then walks the calls in reverse,
//! routing output gradients to inputs and accumulating parameter
//! gradients into the graph.
//!
//! Boundary entries are always replayed, even when no gradient reached
//! them: a receive-capable marker must hand a gradient upstream for every
//! microbatch or the neighbouring stage would wait forever.

use crate::{ModelError, ModelGraph, ModuleId, ModuleKind, PassContext, Validated};
use std::collections::HashMap;
use tensor_core::{ops, Shape, Tensor};

/// Identifier of a tape-tracked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

/// A tensor flowing through the model program.
///
/// Values produced under gradient tracking carry a [`ValueId`]; constants
/// (batch inputs, no-grad outputs) do not.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    tensor: Tensor,
    id: Option<ValueId>,
}

impl Value {
    /// Wraps a tensor that does not participate in differentiation.
    pub fn constant(tensor: Tensor) -> Self {
        Self { tensor, id: None }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// Tape identity, if the value is tracked.
    pub fn id(&self) -> Option<ValueId> {
        self.id
    }
}

#[derive(Debug)]
struct TapeEntry {
    module: ModuleId,
    inputs: Vec<Option<ValueId>>,
    input_tensors: Vec<Tensor>,
    outputs: Vec<ValueId>,
    output_shapes: Vec<Shape>,
    saved: Vec<Tensor>,
}

/// Record of the calls made during one gradient-tracking forward.
#[derive(Debug, Default)]
pub struct Tape {
    entries: Vec<TapeEntry>,
    next_id: usize,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a call and returns its outputs as tracked values.
    pub fn record(
        &mut self,
        module: ModuleId,
        inputs: &[Value],
        outputs: Vec<Tensor>,
        saved: Vec<Tensor>,
    ) -> Vec<Value> {
        let values: Vec<Value> = outputs
            .into_iter()
            .map(|t| {
                let id = ValueId(self.next_id);
                self.next_id += 1;
                Value {
                    tensor: t.with_requires_grad(true),
                    id: Some(id),
                }
            })
            .collect();
        self.entries.push(TapeEntry {
            module,
            inputs: inputs.iter().map(|v| v.id).collect(),
            input_tensors: inputs.iter().map(|v| v.tensor.clone()).collect(),
            outputs: values.iter().filter_map(|v| v.id).collect(),
            output_shapes: values.iter().map(|v| v.tensor.shape().clone()).collect(),
            saved,
        });
        values
    }

    /// Back-propagates `seeds` through the recorded calls.
    ///
    /// Parameter gradients are accumulated into `graph`; boundary nodes
    /// receive `cx` so they can exchange gradients with neighbours.
    pub fn backward(
        self,
        graph: &mut ModelGraph<Validated>,
        seeds: Vec<(ValueId, Tensor)>,
        cx: &PassContext,
    ) -> Result<(), ModelError> {
        let mut grads: HashMap<ValueId, Tensor> = HashMap::new();
        for (id, g) in seeds {
            accumulate(&mut grads, id, g)?;
        }

        for entry in self.entries.into_iter().rev() {
            let node = graph.module(entry.module)?;
            let name = node.name().to_string();
            let kind = node.kind().clone();

            let incoming: Vec<Option<Tensor>> =
                entry.outputs.iter().map(|id| grads.remove(id)).collect();
            let is_boundary = matches!(kind, ModuleKind::Boundary(_));
            if !is_boundary && incoming.iter().all(Option::is_none) {
                continue;
            }
            let grad_outputs: Vec<Tensor> = incoming
                .into_iter()
                .zip(&entry.output_shapes)
                .map(|(g, shape)| g.unwrap_or_else(|| Tensor::zeros(shape.clone())))
                .collect();

            let input_grads = match kind {
                ModuleKind::Layer(layer) => {
                    let node = graph.module(entry.module)?;
                    let param_ids = node.params().to_vec();
                    let layer_grads = {
                        let params = graph.param_values(node)?;
                        layer
                            .backward(&params, &entry.input_tensors, &entry.saved, &grad_outputs)
                            .map_err(|source| ModelError::Compute {
                                module: name.clone(),
                                source,
                            })?
                    };
                    if layer_grads.params.len() != param_ids.len() {
                        return Err(ModelError::InvalidModule {
                            module: name,
                            detail: format!(
                                "backward produced {} parameter gradient(s) for {} parameter(s)",
                                layer_grads.params.len(),
                                param_ids.len()
                            ),
                        });
                    }
                    for (pid, g) in param_ids.into_iter().zip(&layer_grads.params) {
                        graph.accumulate_grad(pid, g)?;
                    }
                    layer_grads.inputs
                }
                ModuleKind::Boundary(boundary) => boundary
                    .backward(cx, grad_outputs)
                    .map_err(|source| ModelError::Boundary {
                        module: name.clone(),
                        source,
                    })?,
                ModuleKind::Container => {
                    return Err(ModelError::NotCallable {
                        module: name,
                        kind: "container",
                    })
                }
            };

            if input_grads.is_empty() {
                continue;
            }
            if input_grads.len() != entry.inputs.len() {
                return Err(ModelError::InvalidModule {
                    module: name,
                    detail: format!(
                        "backward produced {} input gradient(s) for {} input(s)",
                        input_grads.len(),
                        entry.inputs.len()
                    ),
                });
            }
            for (slot, g) in entry.inputs.iter().zip(input_grads) {
                if let Some(id) = slot {
                    accumulate(&mut grads, *id, g)?;
                }
            }
        }
        Ok(())
    }
}

fn accumulate(
    grads: &mut HashMap<ValueId, Tensor>,
    id: ValueId,
    g: Tensor,
) -> Result<(), ModelError> {
    match grads.get_mut(&id) {
        Some(acc) => ops::add_assign(acc, &g)?,
        None => {
            grads.insert(id, g);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Affine;
    use crate::{ModelGraph, StageRng};
    use std::sync::Arc;

    fn two_layer_graph() -> (ModelGraph<Validated>, ModuleId, ModuleId) {
        let mut g = ModelGraph::new("tape");
        let a = g.add_layer("a", None, Arc::new(Affine::new(2)));
        g.add_parameter(a, "weight", Tensor::full(Shape::vector(2), 2.0))
            .unwrap();
        g.add_parameter(a, "bias", Tensor::zeros(Shape::vector(2)))
            .unwrap();
        let b = g.add_layer("b", None, Arc::new(Affine::new(2)));
        g.add_parameter(b, "weight", Tensor::full(Shape::vector(2), 3.0))
            .unwrap();
        g.add_parameter(b, "bias", Tensor::zeros(Shape::vector(2)))
            .unwrap();
        (g.validate().unwrap(), a, b)
    }

    fn call(
        graph: &ModelGraph<Validated>,
        tape: &mut Tape,
        id: ModuleId,
        inputs: Vec<Value>,
    ) -> Vec<Value> {
        let tensors: Vec<Tensor> = inputs.iter().map(|v| v.tensor().clone()).collect();
        let out = graph
            .run_layer(id, &tensors, &mut StageRng::seeded(0))
            .unwrap();
        tape.record(id, &inputs, out.outputs, out.saved)
    }

    #[test]
    fn test_chain_rule_through_two_layers() {
        let (mut graph, a, b) = two_layer_graph();
        let x = Value::constant(Tensor::from_vec(Shape::matrix(1, 2), vec![1.0, -1.0]).unwrap());
        let mut tape = Tape::new();
        let h = call(&graph, &mut tape, a, vec![x]);
        let y = call(&graph, &mut tape, b, h);
        assert_eq!(y[0].tensor().as_slice(), &[6.0, -6.0]);
        assert!(y[0].tensor().requires_grad());

        let seed = (y[0].id().unwrap(), Tensor::ones(Shape::matrix(1, 2)));
        tape.backward(&mut graph, vec![seed], &PassContext::new(0))
            .unwrap();

        // dy/dwb = h = [2, -2]; dy/dwa = wb * x = [3, -3].
        let wb = graph.find_parameter("b.weight").unwrap();
        let wa = graph.find_parameter("a.weight").unwrap();
        assert_eq!(graph.parameter(wb).unwrap().grad().unwrap().as_slice(), &[2.0, -2.0]);
        assert_eq!(graph.parameter(wa).unwrap().grad().unwrap().as_slice(), &[3.0, -3.0]);
    }

    #[test]
    fn test_untouched_layers_are_skipped() {
        let (mut graph, a, b) = two_layer_graph();
        let x = Value::constant(Tensor::ones(Shape::matrix(1, 2)));
        let mut tape = Tape::new();
        let h = call(&graph, &mut tape, a, vec![x.clone()]);
        let _unused = call(&graph, &mut tape, b, vec![x]);
        let seed = (h[0].id().unwrap(), Tensor::ones(Shape::matrix(1, 2)));
        tape.backward(&mut graph, vec![seed], &PassContext::new(0))
            .unwrap();
        let wb = graph.find_parameter("b.weight").unwrap();
        assert!(graph.parameter(wb).unwrap().grad().is_none());
    }

    #[test]
    fn test_fan_out_accumulates() {
        let (mut graph, a, _) = two_layer_graph();
        let x = Value::constant(Tensor::ones(Shape::matrix(1, 2)));
        let mut tape = Tape::new();
        let h1 = call(&graph, &mut tape, a, vec![x.clone()]);
        let h2 = call(&graph, &mut tape, a, vec![x]);
        let seeds = vec![
            (h1[0].id().unwrap(), Tensor::ones(Shape::matrix(1, 2))),
            (h2[0].id().unwrap(), Tensor::ones(Shape::matrix(1, 2))),
        ];
        tape.backward(&mut graph, seeds, &PassContext::new(0))
            .unwrap();
        let wa = graph.find_parameter("a.weight").unwrap();
        assert_eq!(graph.parameter(wa).unwrap().grad().unwrap().as_slice(), &[2.0, 2.0]);
    }
}

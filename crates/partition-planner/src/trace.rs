// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Graph tracer / dry-runner.
//!
//! Runs the model program twice without gradient tracking, once with a
//! batch of one example and once with a batch of two, while a
//! [`ShapeRecorder`] observes every module call. From the pair of runs
//! it derives:
//!
//! - the **visitation order** of modules (first call wins),
//! - the 1-based **index** of each boundary marker, in order of first
//!   appearance,
//! - each marker's **shape signature** and per-tensor gradient flags,
//! - each marker's **batch dimensions**: the dims that read 1 in the
//!   first run and 2 in the second.
//!
//! The two runs must agree on which markers fire, on how many tensors
//! cross each marker and on their ranks. Anything else is reported as
//! [`PlannerError::TraceMismatch`] naming the marker.

use crate::PlannerError;
use model_ir::{
    outputs_require_grad, Batch, Invoke, ModelError, ModelGraph, ModelProgram, ModuleId,
    ModuleKind, StageRng, Validated, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tensor_core::Shape;
use tracing::{debug, info};

/// Shape and gradient flag of one tensor crossing a boundary marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSignature {
    /// Shape observed with a batch of one.
    pub shape: Shape,
    pub requires_grad: bool,
}

/// Everything the runtime needs to size transfers at one marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundarySignature {
    pub tensors: Vec<TensorSignature>,
    /// Per tensor, the dimension indices that scale with the batch.
    pub batch_dims: Vec<Vec<usize>>,
}

impl BoundarySignature {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Shapes of the tensors for a microbatch of `rows` examples.
    pub fn shapes_for(&self, rows: usize) -> Vec<Shape> {
        self.tensors
            .iter()
            .zip(&self.batch_dims)
            .map(|(t, dims)| t.shape.with_dims(dims, rows))
            .collect()
    }

    /// Per-tensor gradient flags.
    pub fn requires_grad(&self) -> Vec<bool> {
        self.tensors.iter().map(|t| t.requires_grad).collect()
    }

    /// Whether any tensor carries a gradient back across the marker.
    pub fn carries_grad(&self) -> bool {
        self.tensors.iter().any(|t| t.requires_grad)
    }
}

/// Traced facts about one boundary marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerTrace {
    /// 1-based position in order of first appearance.
    pub index: usize,
    /// Fully qualified module name.
    pub module: String,
    pub signature: BoundarySignature,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceReport {
    /// Module names in order of first call.
    pub visitation_order: Vec<String>,
    /// Every interval each module was called in.
    pub call_intervals: BTreeMap<String, BTreeSet<usize>>,
    /// Markers ordered by index.
    pub markers: Vec<MarkerTrace>,
}

impl TraceReport {
    /// Number of boundary markers, `K`.
    pub fn num_markers(&self) -> usize {
        self.markers.len()
    }

    /// Number of intervals, `K + 1`.
    pub fn num_intervals(&self) -> usize {
        self.markers.len() + 1
    }

    /// Looks a marker up by its 1-based index.
    pub fn marker(&self, index: usize) -> Option<&MarkerTrace> {
        index.checked_sub(1).and_then(|i| self.markers.get(i))
    }

    pub fn marker_by_module(&self, module: &str) -> Option<&MarkerTrace> {
        self.markers.iter().find(|m| m.module == module)
    }

    /// Interval of a module's first call; markers map to their own index.
    pub fn structural_interval(&self, module: &str) -> Option<usize> {
        self.call_intervals
            .get(module)
            .and_then(|set| set.iter().next().copied())
    }

    /// Whether `module` was called at all during the trace.
    pub fn visited(&self, module: &str) -> bool {
        self.call_intervals.contains_key(module)
    }
}

// ── Recording invoker ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct RunRecord {
    order: Vec<ModuleId>,
    intervals: BTreeMap<ModuleId, BTreeSet<usize>>,
    markers: Vec<(ModuleId, Vec<TensorSignature>)>,
}

/// No-grad invoker that records calls and marker payloads.
struct ShapeRecorder<'g> {
    graph: &'g ModelGraph<Validated>,
    rng: StageRng,
    seen: HashSet<ModuleId>,
    record: RunRecord,
}

impl<'g> ShapeRecorder<'g> {
    fn new(graph: &'g ModelGraph<Validated>, seed: u64) -> Self {
        Self {
            graph,
            rng: StageRng::seeded(seed),
            seen: HashSet::new(),
            record: RunRecord::default(),
        }
    }

    fn current_interval(&self) -> usize {
        self.record.markers.len()
    }
}

impl Invoke for ShapeRecorder<'_> {
    fn call(&mut self, module: ModuleId, inputs: Vec<Value>) -> Result<Vec<Value>, ModelError> {
        let node = self.graph.module(module)?;
        if self.seen.insert(module) {
            self.record.order.push(module);
        }
        match node.kind() {
            ModuleKind::Layer(_) => {
                let interval = self.current_interval();
                self.record.intervals.entry(module).or_default().insert(interval);
                let requires_grad = outputs_require_grad(&inputs, !node.params().is_empty());
                let tensors: Vec<_> = inputs.into_iter().map(Value::into_tensor).collect();
                let out = self.graph.run_layer(module, &tensors, &mut self.rng)?;
                Ok(out
                    .outputs
                    .into_iter()
                    .map(|t| Value::constant(t.with_requires_grad(requires_grad)))
                    .collect())
            }
            ModuleKind::Boundary(_) => {
                if self.record.markers.iter().any(|(id, _)| *id == module) {
                    return Err(ModelError::InvalidModule {
                        module: node.name().to_string(),
                        detail: "boundary marker called more than once in one forward".into(),
                    });
                }
                let signature = inputs
                    .iter()
                    .map(|v| TensorSignature {
                        shape: v.tensor().shape().clone(),
                        requires_grad: v.tensor().requires_grad(),
                    })
                    .collect();
                self.record.markers.push((module, signature));
                let index = self.current_interval();
                self.record.intervals.entry(module).or_default().insert(index);
                Ok(inputs)
            }
            ModuleKind::Container => Err(ModelError::NotCallable {
                module: node.name().to_string(),
                kind: "container",
            }),
        }
    }
}

// ── Dry runner ─────────────────────────────────────────────────────

/// Runs the calibration traces over a validated graph.
pub struct DryRunner<'g> {
    graph: &'g ModelGraph<Validated>,
    seed: u64,
}

impl<'g> DryRunner<'g> {
    pub fn new(graph: &'g ModelGraph<Validated>) -> Self {
        Self { graph, seed: 0 }
    }

    /// Seed for layers that draw random numbers during the trace.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Traces `program` with `make_batch(1)` and `make_batch(2)`.
    pub fn trace(
        &self,
        program: &dyn ModelProgram,
        make_batch: &dyn Fn(usize) -> Batch,
    ) -> Result<TraceReport, PlannerError> {
        let one = self.run_once(program, &make_batch(1))?;
        let two = self.run_once(program, &make_batch(2))?;
        let report = self.reconcile(one, two)?;
        info!(
            "dry run complete: {} modules visited, {} boundary markers",
            report.visitation_order.len(),
            report.num_markers()
        );
        Ok(report)
    }

    fn run_once(&self, program: &dyn ModelProgram, batch: &Batch) -> Result<RunRecord, PlannerError> {
        let mut recorder = ShapeRecorder::new(self.graph, self.seed);
        program.forward(&mut recorder, batch)?;
        debug!(
            "trace pass: {} calls recorded, {} markers",
            recorder.record.order.len(),
            recorder.record.markers.len()
        );
        Ok(recorder.record)
    }

    fn name_of(&self, id: ModuleId) -> Result<String, PlannerError> {
        Ok(self.graph.module(id)?.name().to_string())
    }

    fn reconcile(&self, one: RunRecord, two: RunRecord) -> Result<TraceReport, PlannerError> {
        let mut markers = Vec::with_capacity(one.markers.len());
        for (i, (id, sig_one)) in one.markers.iter().enumerate() {
            let index = i + 1;
            let module = self.name_of(*id)?;
            let mismatch = |detail: String| PlannerError::TraceMismatch {
                marker: index,
                module: module.clone(),
                detail,
            };
            let (id_two, sig_two) = two
                .markers
                .get(i)
                .ok_or_else(|| mismatch("marker not reached with a batch of two".into()))?;
            if id_two != id {
                return Err(mismatch(format!(
                    "batch of two reached '{}' at this position instead",
                    self.name_of(*id_two)?
                )));
            }
            if sig_one.len() != sig_two.len() {
                return Err(mismatch(format!(
                    "{} tensor(s) with a batch of one but {} with a batch of two",
                    sig_one.len(),
                    sig_two.len()
                )));
            }
            let mut batch_dims = Vec::with_capacity(sig_one.len());
            for (t, (a, b)) in sig_one.iter().zip(sig_two).enumerate() {
                if a.shape.rank() != b.shape.rank() {
                    return Err(mismatch(format!(
                        "tensor {t} has rank {} with a batch of one but {} with a batch of two",
                        a.shape.rank(),
                        b.shape.rank()
                    )));
                }
                let dims: Vec<usize> = a
                    .shape
                    .dims()
                    .iter()
                    .zip(b.shape.dims())
                    .enumerate()
                    .filter(|(_, (d1, d2))| **d1 == 1 && **d2 == 2)
                    .map(|(d, _)| d)
                    .collect();
                batch_dims.push(dims);
            }
            markers.push(MarkerTrace {
                index,
                module,
                signature: BoundarySignature {
                    tensors: sig_one.clone(),
                    batch_dims,
                },
            });
        }
        if let Some((extra, _)) = two.markers.get(one.markers.len()) {
            return Err(PlannerError::TraceMismatch {
                marker: one.markers.len() + 1,
                module: self.name_of(*extra)?,
                detail: "marker only reached with a batch of two".into(),
            });
        }

        let visitation_order = one
            .order
            .iter()
            .map(|id| self.name_of(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut call_intervals = BTreeMap::new();
        for (id, set) in one.intervals {
            call_intervals.insert(self.name_of(id)?, set);
        }

        Ok(TraceReport {
            visitation_order,
            call_intervals,
            markers,
        })
    }
}

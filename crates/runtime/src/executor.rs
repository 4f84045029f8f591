// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Runs one stage's schedule for one step.
//!
//! | Task | What happens |
//! |---|---|
//! | `F`, paired with the next `B` | tracked forward, tape kept for the backward |
//! | `F`, otherwise | untracked forward; the RNG snapshot and the received boundary inputs are queued |
//! | `R` | dequeue, restore the RNG, tracked forward from the saved inputs, backward |
//! | `B` | backward on the kept tape |
//!
//! The compute thread only blocks inside boundary nodes, on the stage's
//! own queues. Data-parallel gradients are averaged once, after the
//! backward-class task of the last microbatch.

use crate::{GradientSync, RuntimeError, StageLinks, StepMetrics};
use model_ir::{
    Batch, Invoke, ModelError, ModelGraph, ModelProgram, ModuleId, ModuleKind, PassContext,
    RngSnapshot, StageRng, Tape, Validated, Value,
};
use pipeline_scheduler::{ScheduleError, StageSchedule, TaskKind};
use std::collections::VecDeque;
use std::time::Instant;
use tensor_core::Tensor;
use tracing::{debug, warn};

// ── Invoker ────────────────────────────────────────────────────

/// [`Invoke`] for a partitioned stage.
///
/// External modules return no values. With a tape every call is
/// recorded; without one outputs are plain constants.
struct StageInvoker<'a> {
    graph: &'a ModelGraph<Validated>,
    rng: &'a mut StageRng,
    cx: &'a PassContext,
    tape: Option<&'a mut Tape>,
    receive: Option<ModuleId>,
    send: Option<ModuleId>,
    received: Option<Vec<Tensor>>,
    sent: bool,
}

impl StageInvoker<'_> {
    fn track(
        &mut self,
        module: ModuleId,
        inputs: &[Value],
        outputs: Vec<Tensor>,
        saved: Vec<Tensor>,
    ) -> Vec<Value> {
        match self.tape.as_deref_mut() {
            Some(tape) => tape.record(module, inputs, outputs, saved),
            None => outputs.into_iter().map(Value::constant).collect(),
        }
    }
}

impl Invoke for StageInvoker<'_> {
    fn call(&mut self, module: ModuleId, inputs: Vec<Value>) -> Result<Vec<Value>, ModelError> {
        let graph = self.graph;
        let node = graph.module(module)?;
        if node.is_external() {
            return Ok(Vec::new());
        }
        let tensors: Vec<Tensor> = inputs.iter().map(|v| v.tensor().clone()).collect();
        match node.kind() {
            ModuleKind::Layer(_) => {
                let out = graph.run_layer(module, &tensors, self.rng)?;
                Ok(self.track(module, &inputs, out.outputs, out.saved))
            }
            ModuleKind::Boundary(boundary) => {
                let out = boundary
                    .forward(self.cx, tensors)
                    .map_err(|source| ModelError::Boundary {
                        module: node.name().to_string(),
                        source,
                    })?;
                if Some(module) == self.receive {
                    self.received = Some(out.clone());
                }
                if Some(module) == self.send {
                    self.sent = true;
                }
                Ok(self.track(module, &inputs, out, Vec::new()))
            }
            ModuleKind::Container => Err(ModelError::NotCallable {
                module: node.name().to_string(),
                kind: "container",
            }),
        }
    }
}

// ── Executor ───────────────────────────────────────────────────

/// Forward kept for a directly paired backward.
struct Pending {
    microbatch: usize,
    tape: Tape,
    outputs: Vec<Value>,
}

/// Untracked forward waiting for its recomputation.
struct Deferred {
    microbatch: usize,
    snapshot: RngSnapshot,
    inputs: Vec<Tensor>,
}

/// Everything one step of one stage needs, borrowed from the engine.
pub(crate) struct StageExecutor<'a> {
    pub stage: usize,
    pub is_last: bool,
    pub graph: &'a mut ModelGraph<Validated>,
    pub program: &'a dyn ModelProgram,
    pub rng: &'a mut StageRng,
    pub links: &'a StageLinks,
    pub sync: &'a dyn GradientSync,
    pub receive: Option<ModuleId>,
    pub send: Option<ModuleId>,
    pub loss_scale: f32,
    pub profiling: bool,
}

impl StageExecutor<'_> {
    /// Runs `schedule` over `micro` and returns the averaged loss on the
    /// last stage.
    pub fn run(
        &mut self,
        schedule: &StageSchedule,
        micro: &[Batch],
        metrics: &mut StepMetrics,
    ) -> Result<Option<f32>, RuntimeError> {
        let num_microbatches = micro.len();
        let sync_after = schedule.last_backward_microbatch();
        let mut pending: Option<Pending> = None;
        let mut deferred: VecDeque<Deferred> = VecDeque::new();
        let mut loss = 0.0f32;

        for (i, entry) in schedule.iter().enumerate() {
            let mb = entry.microbatch;
            let start = Instant::now();
            let batch = micro
                .get(mb)
                .ok_or_else(|| self.malformed(format!("no microbatch {mb}")))?;

            match entry.kind {
                TaskKind::Forward if schedule.forward_grad_mode(i) => {
                    let mut tape = Tape::new();
                    let (outputs, _) = self
                        .forward(batch, &PassContext::new(mb), Some(&mut tape))
                        .map_err(|e| self.failure(e))?;
                    pending = Some(Pending {
                        microbatch: mb,
                        tape,
                        outputs,
                    });
                }
                TaskKind::Forward => {
                    let snapshot = self.rng.snapshot();
                    let (_, received) = self
                        .forward(batch, &PassContext::new(mb), None)
                        .map_err(|e| self.failure(e))?;
                    deferred.push_back(Deferred {
                        microbatch: mb,
                        snapshot,
                        inputs: received.unwrap_or_default(),
                    });
                }
                TaskKind::RecomputeAndBackward => {
                    let saved = match deferred.pop_front() {
                        Some(d) if d.microbatch == mb => d,
                        _ => return Err(self.malformed(format!("nothing to recompute for microbatch {mb}"))),
                    };
                    let live = self.rng.snapshot();
                    self.rng.restore(saved.snapshot);
                    let cx = PassContext::recompute(mb, saved.inputs);
                    let mut tape = Tape::new();
                    let (outputs, _) = self
                        .forward(batch, &cx, Some(&mut tape))
                        .map_err(|e| self.failure(e))?;
                    self.rng.restore(live);
                    loss += self
                        .backward(tape, &outputs, &cx, num_microbatches)
                        .map_err(|e| self.failure(e))?;
                }
                TaskKind::Backward => {
                    let kept = match pending.take() {
                        Some(p) if p.microbatch == mb => p,
                        _ => return Err(self.malformed(format!("no tracked forward for microbatch {mb}"))),
                    };
                    loss += self
                        .backward(kept.tape, &kept.outputs, &PassContext::new(mb), num_microbatches)
                        .map_err(|e| self.failure(e))?;
                }
            }

            let wait = self.links.take_wait();
            metrics.record_task(entry.kind.letter(), mb, start.elapsed(), wait, self.profiling);
            debug!(
                "stage {}: {}{mb} done in {:?} ({:?} waiting)",
                self.stage,
                entry.kind.letter(),
                start.elapsed(),
                wait
            );

            if entry.kind.is_backward() && sync_after == Some(mb) {
                self.sync_gradients(metrics)?;
            }
        }

        if !deferred.is_empty() || pending.is_some() {
            return Err(self.malformed("forwards left without a backward".into()));
        }
        Ok(self.is_last.then_some(loss))
    }

    /// Runs the program once. A failure after this stage already sent
    /// its activations is logged and masked on non-final stages.
    fn forward(
        &mut self,
        batch: &Batch,
        cx: &PassContext,
        tape: Option<&mut Tape>,
    ) -> Result<(Vec<Value>, Option<Vec<Tensor>>), ModelError> {
        let mut invoker = StageInvoker {
            graph: self.graph,
            rng: self.rng,
            cx,
            tape,
            receive: self.receive,
            send: self.send,
            received: None,
            sent: false,
        };
        let outputs = match self.program.forward(&mut invoker, batch) {
            Ok(outputs) => outputs,
            Err(e) if invoker.sent && !self.is_last && !matches!(e, ModelError::Boundary { .. }) => {
                warn!(
                    "stage {}: ignoring error after activations were sent for microbatch {}: {e}",
                    self.stage, cx.microbatch
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok((outputs, invoker.received.take()))
    }

    /// Back-propagates one microbatch. Returns its share of the loss.
    fn backward(
        &mut self,
        tape: Tape,
        outputs: &[Value],
        cx: &PassContext,
        num_microbatches: usize,
    ) -> Result<f32, ModelError> {
        if !self.is_last {
            tape.backward(self.graph, Vec::new(), cx)?;
            return Ok(0.0);
        }
        let loss = outputs
            .first()
            .ok_or_else(|| ModelError::InvalidGraph("final stage produced no loss".into()))?;
        let id = loss
            .id()
            .ok_or_else(|| ModelError::InvalidGraph("final stage loss is not tracked".into()))?;
        let chunks = num_microbatches as f32;
        let value = loss.tensor().item()?;
        let seed = loss.tensor().full_like(self.loss_scale / chunks);
        tape.backward(self.graph, vec![(id, seed)], cx)?;
        Ok(value / chunks)
    }

    fn sync_gradients(&mut self, metrics: &mut StepMetrics) -> Result<(), RuntimeError> {
        if self.sync.group_size() < 2 {
            return Ok(());
        }
        let start = Instant::now();
        let resident: Vec<_> = self
            .graph
            .resident_parameters()
            .map(|(pid, p)| {
                let grad = p
                    .grad()
                    .cloned()
                    .unwrap_or_else(|| Tensor::zeros(p.shape().clone()));
                (pid, grad)
            })
            .collect();
        let (ids, mut grads): (Vec<_>, Vec<_>) = resident.into_iter().unzip();
        self.sync.all_reduce_mean(&mut grads)?;
        for (pid, grad) in ids.into_iter().zip(grads) {
            self.graph.set_grad(pid, grad)?;
        }
        metrics.record_sync(start.elapsed());
        debug!("stage {}: gradients averaged via {}", self.stage, self.sync.name());
        Ok(())
    }

    /// Attributes a failure to the transport if a worker already failed.
    fn failure(&self, source: ModelError) -> RuntimeError {
        match self.links.fault.error() {
            Some(e) => RuntimeError::Transfer(e.clone()),
            None => RuntimeError::Compute {
                stage: self.stage,
                source,
            },
        }
    }

    fn malformed(&self, detail: String) -> RuntimeError {
        RuntimeError::Schedule(ScheduleError::Malformed {
            stage: self.stage,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoGradientSync, TransferError};
    use model_ir::layers::Affine;
    use model_ir::{BoundaryError, BoundaryNode, PassThrough};
    use std::sync::Arc;
    use tensor_core::Shape;

    /// Boundary whose transfers always fail.
    #[derive(Debug)]
    struct Severed;

    impl BoundaryNode for Severed {
        fn describe(&self) -> &'static str {
            "severed"
        }

        fn forward(&self, _cx: &PassContext, _inputs: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
            Err(BoundaryError::Interrupted("link down".into()))
        }

        fn backward(&self, _cx: &PassContext, _grads: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
            Err(BoundaryError::Interrupted("link down".into()))
        }
    }

    /// `fc`, then `cut`, then `tail`; fails once `tail` has run.
    struct FailsAfterTail {
        fc: ModuleId,
        cut: ModuleId,
        tail: ModuleId,
    }

    impl ModelProgram for FailsAfterTail {
        fn forward(&self, cx: &mut dyn Invoke, batch: &Batch) -> Result<Vec<Value>, ModelError> {
            let h = cx.call(self.fc, vec![Value::constant(batch.input("x")?.clone())])?;
            let h = cx.call(self.cut, h)?;
            cx.call(self.tail, h)?;
            Err(ModelError::InvalidGraph("nothing consumes the tail".into()))
        }
    }

    fn model(tail: Arc<dyn BoundaryNode>) -> (ModelGraph<Validated>, FailsAfterTail) {
        let mut g = ModelGraph::new("fails-after-tail");
        let fc = g.add_layer("fc", None, Arc::new(Affine::new(2)));
        g.add_parameter(fc, "weight", Tensor::ones(Shape::vector(2))).unwrap();
        g.add_parameter(fc, "bias", Tensor::zeros(Shape::vector(2))).unwrap();
        let cut = g.add_boundary("cut", None);
        let tail_id = g.add_boundary("tail", None);
        let mut g = g.validate().unwrap();
        g.install_boundary(tail_id, tail).unwrap();
        (g, FailsAfterTail { fc, cut, tail: tail_id })
    }

    /// Runs one untracked forward of `program` as stage 0.
    fn forward_once(
        graph: &mut ModelGraph<Validated>,
        program: &FailsAfterTail,
        links: &StageLinks,
        is_last: bool,
        send: Option<ModuleId>,
    ) -> Result<(Vec<Value>, Option<Vec<Tensor>>), ModelError> {
        let mut rng = StageRng::seeded(0);
        let mut executor = StageExecutor {
            stage: 0,
            is_last,
            graph,
            program,
            rng: &mut rng,
            links,
            sync: &NoGradientSync,
            receive: None,
            send,
            loss_scale: 1.0,
            profiling: false,
        };
        let batch = Batch::new().with("x", Tensor::ones(Shape::matrix(1, 2)));
        executor.forward(&batch, &PassContext::new(0), None)
    }

    #[test]
    fn test_error_after_send_is_masked() {
        let (mut graph, program) = model(Arc::new(PassThrough));
        let links = StageLinks::new();
        let (outputs, received) =
            forward_once(&mut graph, &program, &links, false, Some(program.cut)).unwrap();
        assert!(outputs.is_empty());
        assert!(received.is_none());
    }

    #[test]
    fn test_error_before_send_propagates() {
        let (mut graph, program) = model(Arc::new(PassThrough));
        let links = StageLinks::new();
        let err = forward_once(&mut graph, &program, &links, false, None).unwrap_err();
        assert!(matches!(err, ModelError::InvalidGraph(_)), "{err}");
    }

    #[test]
    fn test_error_on_last_stage_propagates() {
        let (mut graph, program) = model(Arc::new(PassThrough));
        let links = StageLinks::new();
        let err = forward_once(&mut graph, &program, &links, true, Some(program.cut)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidGraph(_)), "{err}");
    }

    #[test]
    fn test_boundary_error_never_masked() {
        let (mut graph, program) = model(Arc::new(Severed));
        let links = StageLinks::new();
        let err = forward_once(&mut graph, &program, &links, false, Some(program.cut)).unwrap_err();
        match err {
            ModelError::Boundary { module, source } => {
                assert_eq!(module, "tail");
                assert_eq!(source, BoundaryError::Interrupted("link down".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failure_attributed_to_transport_once_faulted() {
        let (mut graph, program) = model(Arc::new(PassThrough));
        let links = StageLinks::new();
        let mut rng = StageRng::seeded(0);
        let executor = StageExecutor {
            stage: 3,
            is_last: true,
            graph: &mut graph,
            program: &program,
            rng: &mut rng,
            links: &links,
            sync: &NoGradientSync,
            receive: None,
            send: None,
            loss_scale: 1.0,
            profiling: false,
        };
        let compute = executor.failure(ModelError::InvalidGraph("bad".into()));
        assert!(matches!(compute, RuntimeError::Compute { stage: 3, .. }));

        links.fault.raise(TransferError::Aborted("peer gone".into()));
        let transfer = executor.failure(ModelError::InvalidGraph("bad".into()));
        assert!(matches!(transfer, RuntimeError::Transfer(TransferError::Aborted(_))));
    }
}

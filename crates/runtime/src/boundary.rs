// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Live boundary nodes and the queues behind them.
//!
//! ```text
//!            compute thread                       transfer workers
//!  receive marker.forward  ◀── acts_in  ◀──── acts receiver  ◀── prev rank
//!  receive marker.backward ──▶ grads_out ───▶ grads sender   ──▶ prev rank
//!  send marker.forward     ──▶ acts_out  ───▶ acts sender    ──▶ next rank
//!  send marker.backward    ◀── grads_in  ◀──── grads receiver ◀── next rank
//! ```
//!
//! The compute thread only ever blocks on its own queues, and every
//! blocking get also watches the stage's [`FaultChannel`].

use crate::{FaultChannel, TransferError};
use crossbeam::channel::{self, Receiver, Sender};
use model_ir::{BoundaryError, BoundaryNode, PassContext};
use partition_planner::{BoundaryFactory, MarkerTrace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensor_core::Tensor;

/// Unbounded FIFO of tensor payloads between two threads of one stage.
#[derive(Debug, Clone)]
pub struct TransferQueue {
    tx: Sender<Vec<Tensor>>,
    rx: Receiver<Vec<Tensor>>,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, payload: Vec<Tensor>) -> Result<(), TransferError> {
        self.tx
            .send(payload)
            .map_err(|_| TransferError::Disconnected("transfer queue closed".into()))
    }

    pub fn receiver(&self) -> &Receiver<Vec<Tensor>> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The four queues of one stage and its fault channel.
#[derive(Debug, Default)]
pub struct StageLinks {
    pub acts_in: TransferQueue,
    pub acts_out: TransferQueue,
    pub grads_in: TransferQueue,
    pub grads_out: TransferQueue,
    pub fault: Arc<FaultChannel>,
    wait_nanos: AtomicU64,
}

impl StageLinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pops from `queue`, blocking until a payload or a fault arrives.
    pub fn wait(&self, queue: &TransferQueue) -> Result<Vec<Tensor>, TransferError> {
        let start = Instant::now();
        let result = self.fault.wait_on(queue.receiver());
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
        result
    }

    /// Time the compute thread spent blocked since the last call.
    pub fn take_wait(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.swap(0, Ordering::Relaxed))
    }

    /// Whether all four queues are drained.
    pub fn is_idle(&self) -> bool {
        [&self.acts_in, &self.acts_out, &self.grads_in, &self.grads_out]
            .iter()
            .all(|q| q.is_empty())
    }
}

/// Which side of the stage a live marker sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryRole {
    /// First marker of the stage: activations in, gradients out.
    Receive,
    /// Last marker of the stage: activations out, gradients in.
    Send,
}

/// A boundary marker wired to the stage's transfer queues.
#[derive(Debug)]
pub struct StageBoundary {
    role: BoundaryRole,
    marker: MarkerTrace,
    links: Arc<StageLinks>,
}

impl StageBoundary {
    pub fn new(role: BoundaryRole, marker: MarkerTrace, links: Arc<StageLinks>) -> Self {
        Self {
            role,
            marker,
            links,
        }
    }

    pub fn role(&self) -> BoundaryRole {
        self.role
    }

    fn interrupted(&self, e: TransferError) -> BoundaryError {
        BoundaryError::Interrupted(format!("marker {}: {e}", self.marker.index))
    }

    fn check_len(&self, what: &str, got: usize) -> Result<(), BoundaryError> {
        let expected = self.marker.signature.len();
        if got != expected {
            return Err(BoundaryError::Payload(format!(
                "marker {} expected {expected} {what} tensor(s), got {got}",
                self.marker.index
            )));
        }
        Ok(())
    }
}

impl BoundaryNode for StageBoundary {
    fn describe(&self) -> &'static str {
        match self.role {
            BoundaryRole::Receive => "receive",
            BoundaryRole::Send => "send",
        }
    }

    fn forward(&self, cx: &PassContext, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
        match self.role {
            BoundaryRole::Receive => {
                if let Some(replay) = &cx.replay {
                    return Ok(replay.clone());
                }
                let payload = self
                    .links
                    .wait(&self.links.acts_in)
                    .map_err(|e| self.interrupted(e))?;
                self.check_len("activation", payload.len())?;
                Ok(payload
                    .into_iter()
                    .zip(self.marker.signature.requires_grad())
                    .map(|(t, rg)| t.with_requires_grad(rg))
                    .collect())
            }
            BoundaryRole::Send => {
                if !cx.recompute {
                    self.links
                        .acts_out
                        .push(inputs.clone())
                        .map_err(|e| self.interrupted(e))?;
                }
                Ok(inputs)
            }
        }
    }

    fn backward(&self, _cx: &PassContext, grads: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
        let carries = self.marker.signature.carries_grad();
        match self.role {
            BoundaryRole::Receive => {
                if carries {
                    self.check_len("gradient", grads.len())?;
                    self.links
                        .grads_out
                        .push(grads)
                        .map_err(|e| self.interrupted(e))?;
                }
                Ok(Vec::new())
            }
            BoundaryRole::Send => {
                if !carries {
                    return Ok(grads);
                }
                let received = self
                    .links
                    .wait(&self.links.grads_in)
                    .map_err(|e| self.interrupted(e))?;
                self.check_len("gradient", received.len())?;
                Ok(received)
            }
        }
    }
}

/// Builds [`StageBoundary`] nodes sharing one [`StageLinks`].
#[derive(Debug, Clone)]
pub struct StageBoundaryFactory {
    links: Arc<StageLinks>,
}

impl StageBoundaryFactory {
    pub fn new(links: Arc<StageLinks>) -> Self {
        Self { links }
    }
}

impl BoundaryFactory for StageBoundaryFactory {
    fn receiver(&self, marker: &MarkerTrace) -> Arc<dyn BoundaryNode> {
        Arc::new(StageBoundary::new(
            BoundaryRole::Receive,
            marker.clone(),
            Arc::clone(&self.links),
        ))
    }

    fn sender(&self, marker: &MarkerTrace) -> Arc<dyn BoundaryNode> {
        Arc::new(StageBoundary::new(
            BoundaryRole::Send,
            marker.clone(),
            Arc::clone(&self.links),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partition_planner::{BoundarySignature, TensorSignature};
    use tensor_core::Shape;

    fn marker(requires_grad: bool) -> MarkerTrace {
        MarkerTrace {
            index: 1,
            module: "net.cut0".into(),
            signature: BoundarySignature {
                tensors: vec![TensorSignature {
                    shape: Shape::matrix(1, 2),
                    requires_grad,
                }],
                batch_dims: vec![vec![0]],
            },
        }
    }

    fn pair(requires_grad: bool) -> (StageBoundary, StageBoundary, Arc<StageLinks>) {
        let links = StageLinks::new();
        let m = marker(requires_grad);
        (
            StageBoundary::new(BoundaryRole::Receive, m.clone(), Arc::clone(&links)),
            StageBoundary::new(BoundaryRole::Send, m, Arc::clone(&links)),
            links,
        )
    }

    #[test]
    fn test_send_enqueues_unless_recomputing() {
        let (_, send, links) = pair(true);
        let x = vec![Tensor::ones(Shape::matrix(2, 2))];
        assert_eq!(send.forward(&PassContext::new(0), x.clone()).unwrap(), x);
        assert_eq!(links.acts_out.len(), 1);
        send.forward(&PassContext::recompute(0, vec![]), x).unwrap();
        assert_eq!(links.acts_out.len(), 1);
    }

    #[test]
    fn test_receive_takes_queue_or_replay() {
        let (recv, _, links) = pair(true);
        links.acts_in.push(vec![Tensor::ones(Shape::matrix(2, 2))]).unwrap();
        let out = recv.forward(&PassContext::new(0), vec![]).unwrap();
        assert!(out[0].requires_grad());
        assert!(links.acts_in.is_empty());

        let replay = vec![Tensor::full(Shape::matrix(2, 2), 4.0)];
        let out = recv
            .forward(&PassContext::recompute(0, replay.clone()), vec![])
            .unwrap();
        assert_eq!(out, replay);
    }

    #[test]
    fn test_receive_backward_hands_gradient_upstream() {
        let (recv, _, links) = pair(true);
        let g = vec![Tensor::ones(Shape::matrix(2, 2))];
        assert!(recv.backward(&PassContext::new(0), g).unwrap().is_empty());
        assert_eq!(links.grads_out.len(), 1);
    }

    #[test]
    fn test_send_backward_blocks_for_gradient() {
        let (_, send, links) = pair(true);
        links.grads_in.push(vec![Tensor::full(Shape::matrix(2, 2), 0.5)]).unwrap();
        let zeros = vec![Tensor::zeros(Shape::matrix(2, 2))];
        let g = send.backward(&PassContext::new(0), zeros).unwrap();
        assert_eq!(g[0].as_slice(), &[0.5; 4]);
    }

    #[test]
    fn test_no_grad_marker_skips_gradient_exchange() {
        let (recv, send, links) = pair(false);
        recv.backward(&PassContext::new(0), vec![Tensor::scalar(1.0)])
            .unwrap();
        assert!(links.grads_out.is_empty());
        let g = send
            .backward(&PassContext::new(0), vec![Tensor::scalar(0.0)])
            .unwrap();
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_fault_interrupts_wait() {
        let (recv, _, links) = pair(true);
        links.fault.raise(TransferError::Aborted("peer died".into()));
        let err = recv.forward(&PassContext::new(0), vec![]).unwrap_err();
        assert!(matches!(err, BoundaryError::Interrupted(_)));
    }

    #[test]
    fn test_payload_count_checked() {
        let (recv, _, links) = pair(true);
        links.acts_in.push(vec![]).unwrap();
        assert!(matches!(
            recv.forward(&PassContext::new(0), vec![]),
            Err(BoundaryError::Payload(_))
        ));
    }
}

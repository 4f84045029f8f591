// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Point-to-point transport between ranks.
//!
//! [`Transport`] is the seam to the communication library: tagged send
//! and blocking receive of tensor lists, plus a job-wide abort. Sends are
//! buffered and return once the payload is handed off. The
//! receiver always names the shapes it expects, so a payload is checked
//! against the traced signature before it reaches a stage.
//!
//! [`LocalFabric`] connects ranks that live in one process (threads)
//! through crossbeam channels, one FIFO per `(src, dst, channel)`.
//! Payloads cross the fabric as little-endian bytes, as they would on a
//! wire.

use crate::{FaultChannel, TransferError};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tensor_core::{Shape, Tensor};

/// Logical stream a payload travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Boundary activations, upstream to downstream.
    Activations,
    /// Boundary gradients, downstream to upstream.
    Gradients,
    /// Shared-parameter mirroring.
    Parameters,
    /// Data-parallel gradient averaging.
    GradientSync,
}

/// Point-to-point communication between ranks.
pub trait Transport: Send + Sync + fmt::Debug {
    /// This endpoint's global rank.
    fn rank(&self) -> usize;

    /// Sends `payload` to `dst` and returns the number of bytes moved.
    fn send(&self, dst: usize, channel: Channel, payload: &[Tensor]) -> Result<usize, TransferError>;

    /// Receives one payload from `src` whose tensors have exactly `shapes`.
    fn recv(
        &self,
        src: usize,
        channel: Channel,
        shapes: &[Shape],
    ) -> Result<Vec<Tensor>, TransferError>;

    /// Fails every pending and future operation on every rank.
    fn abort(&self, reason: &str);
}

/// Total bytes of a tensor list on the wire.
pub fn payload_bytes(payload: &[Tensor]) -> usize {
    payload.iter().map(Tensor::size_bytes).sum()
}

// ── In-process fabric ──────────────────────────────────────────

type Frame = Vec<(Shape, Vec<u8>)>;
type Link = (Sender<Frame>, Receiver<Frame>);

#[derive(Debug)]
struct FabricInner {
    world_size: usize,
    links: Mutex<HashMap<(usize, usize, Channel), Link>>,
    aborted: FaultChannel,
}

impl FabricInner {
    fn link(&self, src: usize, dst: usize, ch: Channel) -> Result<Link, TransferError> {
        for r in [src, dst] {
            if r >= self.world_size {
                return Err(TransferError::Transport {
                    peer: r,
                    detail: format!("rank {r} is outside a world of {}", self.world_size),
                });
            }
        }
        let mut links = self.links.lock().map_err(|_| TransferError::Transport {
            peer: dst,
            detail: "fabric lock poisoned".into(),
        })?;
        let (tx, rx) = links
            .entry((src, dst, ch))
            .or_insert_with(channel::unbounded);
        Ok((tx.clone(), rx.clone()))
    }
}

/// Channels connecting `world_size` in-process ranks.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    pub fn new(world_size: usize) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                world_size,
                links: Mutex::new(HashMap::new()),
                aborted: FaultChannel::new(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.inner.world_size
    }

    /// Endpoint for `rank`.
    pub fn endpoint(&self, rank: usize) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            rank,
            fabric: Arc::clone(&self.inner),
        })
    }

    /// Whether any endpoint has aborted the fabric.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.is_raised()
    }
}

/// One rank's view of a [`LocalFabric`].
#[derive(Debug)]
pub struct LocalTransport {
    rank: usize,
    fabric: Arc<FabricInner>,
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&self, dst: usize, channel: Channel, payload: &[Tensor]) -> Result<usize, TransferError> {
        if let Some(e) = self.fabric.aborted.error() {
            return Err(e.clone());
        }
        let (tx, _) = self.fabric.link(self.rank, dst, channel)?;
        let frame: Frame = payload
            .iter()
            .map(|t| (t.shape().clone(), t.to_le_bytes()))
            .collect();
        tx.send(frame).map_err(|_| TransferError::Transport {
            peer: dst,
            detail: "link closed".into(),
        })?;
        Ok(payload_bytes(payload))
    }

    fn recv(
        &self,
        src: usize,
        channel: Channel,
        shapes: &[Shape],
    ) -> Result<Vec<Tensor>, TransferError> {
        let (_, rx) = self.fabric.link(src, self.rank, channel)?;
        let frame = self.fabric.aborted.wait_on(&rx)?;
        let actual: Vec<Shape> = frame.iter().map(|(s, _)| s.clone()).collect();
        if actual != shapes {
            return Err(TransferError::ShapeMismatch {
                peer: src,
                expected: shapes.to_vec(),
                actual,
            });
        }
        frame
            .into_iter()
            .map(|(shape, bytes)| {
                Tensor::from_le_bytes(shape, &bytes).map_err(|e| TransferError::Transport {
                    peer: src,
                    detail: e.to_string(),
                })
            })
            .collect()
    }

    fn abort(&self, reason: &str) {
        if self
            .fabric
            .aborted
            .raise(TransferError::Aborted(format!("rank {}: {reason}", self.rank)))
        {
            tracing::warn!("rank {} aborted the fabric: {reason}", self.rank);
        }
    }
}

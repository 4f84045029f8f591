// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Data-parallel gradient synchronisation.
//!
//! Replicas of a stage accumulate gradients locally over every
//! microbatch and synchronise once, after the backward-class task of the
//! last microbatch.

use crate::{Channel, TransferError, Transport};
use std::fmt;
use std::sync::Arc;
use tensor_core::{ops, Tensor};

/// Averages gradients across the replicas of one stage.
pub trait GradientSync: Send + Sync + fmt::Debug {
    /// Human-readable name of this implementation.
    fn name(&self) -> &str;

    /// Number of replicas taking part.
    fn group_size(&self) -> usize;

    /// Replaces every tensor with its mean over the group.
    ///
    /// All replicas must pass tensors of the same shapes in the same order.
    fn all_reduce_mean(&self, grads: &mut [Tensor]) -> Result<(), TransferError>;
}

/// Single replica: nothing to synchronise.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGradientSync;

impl GradientSync for NoGradientSync {
    fn name(&self) -> &str {
        "none"
    }

    fn group_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _grads: &mut [Tensor]) -> Result<(), TransferError> {
        Ok(())
    }
}

/// All-to-all mean over a [`Transport`].
///
/// Every replica sends its gradients to every peer, then sums all
/// contributions in group order, so every replica ends up with identical
/// values.
#[derive(Debug)]
pub struct TransportAllReduce {
    transport: Arc<dyn Transport>,
    group: Vec<usize>,
}

impl TransportAllReduce {
    /// `group` lists the ranks of every replica, this rank included.
    pub fn new(transport: Arc<dyn Transport>, group: Vec<usize>) -> Result<Self, TransferError> {
        let rank = transport.rank();
        if !group.contains(&rank) {
            return Err(TransferError::Transport {
                peer: rank,
                detail: format!("rank {rank} is not in its replica group {group:?}"),
            });
        }
        Ok(Self { transport, group })
    }
}

impl GradientSync for TransportAllReduce {
    fn name(&self) -> &str {
        "transport-all-reduce"
    }

    fn group_size(&self) -> usize {
        self.group.len()
    }

    fn all_reduce_mean(&self, grads: &mut [Tensor]) -> Result<(), TransferError> {
        let me = self.transport.rank();
        if self.group.len() < 2 {
            return Ok(());
        }
        for &peer in &self.group {
            if peer != me {
                self.transport.send(peer, Channel::GradientSync, grads)?;
            }
        }
        let shapes: Vec<_> = grads.iter().map(|g| g.shape().clone()).collect();
        let mut total: Option<Vec<Tensor>> = None;
        for &peer in &self.group {
            let part = if peer == me {
                grads.to_vec()
            } else {
                self.transport.recv(peer, Channel::GradientSync, &shapes)?
            };
            match &mut total {
                None => total = Some(part),
                Some(acc) => {
                    for (a, p) in acc.iter_mut().zip(&part) {
                        ops::add_assign(a, p).map_err(|e| TransferError::Transport {
                            peer,
                            detail: e.to_string(),
                        })?;
                    }
                }
            }
        }
        let scale = 1.0 / self.group.len() as f32;
        for (g, sum) in grads.iter_mut().zip(total.unwrap_or_default()) {
            *g = ops::scale(&sum, scale);
        }
        Ok(())
    }
}

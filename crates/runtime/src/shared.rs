// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Mirroring of shared parameters that ended up on different stages.
//!
//! For every cross-stage pair the stage holding the later member sends
//! its current value to the stage holding the earlier member, which
//! overwrites its own copy. Both ends walk the pairs in declaration
//! order, so the parameter channel stays FIFO-consistent.

use crate::{Channel, RankPlacement, RuntimeError, StageTopology, Transport};
use model_ir::{ModelGraph, ModelError, Validated};
use partition_planner::SharedPlacement;
use tracing::debug;

/// One direction of one mirrored pair, seen from a single rank.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mirror {
    Send { parameter: String, to: usize },
    Receive { parameter: String, from: usize },
}

/// The mirroring duties of one rank.
#[derive(Debug, Clone, Default)]
pub struct SharedMirror {
    duties: Vec<Mirror>,
}

impl SharedMirror {
    /// Works out what `placement` sends and receives for `pairs`.
    pub fn new(
        pairs: &[SharedPlacement],
        topology: &StageTopology,
        placement: &RankPlacement,
    ) -> Result<Self, RuntimeError> {
        let mut duties = Vec::new();
        for pair in pairs.iter().filter(|p| p.is_cross_stage()) {
            let (first, last) = (pair.first_stage(), pair.last_stage());
            let member = pair.member_on(placement.stage);
            if placement.stage == last {
                let to = peer(topology, placement, first)?;
                if let Some(parameter) = member {
                    duties.push(Mirror::Send {
                        parameter: parameter.to_string(),
                        to,
                    });
                }
            } else if placement.stage == first {
                let from = peer(topology, placement, last)?;
                if let Some(parameter) = member {
                    duties.push(Mirror::Receive {
                        parameter: parameter.to_string(),
                        from,
                    });
                }
            }
        }
        Ok(Self { duties })
    }

    pub fn is_empty(&self) -> bool {
        self.duties.is_empty()
    }

    /// Number of parameters this rank sends.
    pub fn num_sends(&self) -> usize {
        self.duties
            .iter()
            .filter(|d| matches!(d, Mirror::Send { .. }))
            .count()
    }

    /// Number of parameters this rank overwrites.
    pub fn num_receives(&self) -> usize {
        self.duties.len() - self.num_sends()
    }

    /// Sends, then receives, every mirrored value. Returns the bytes sent.
    pub fn sync(
        &self,
        graph: &mut ModelGraph<Validated>,
        transport: &dyn Transport,
    ) -> Result<usize, RuntimeError> {
        let mut sent = 0;
        for duty in &self.duties {
            if let Mirror::Send { parameter, to } = duty {
                let value = resident_value(graph, parameter)?;
                sent += transport.send(*to, Channel::Parameters, &[value])?;
                debug!("mirrored '{parameter}' to rank {to}");
            }
        }
        for duty in &self.duties {
            if let Mirror::Receive { parameter, from } = duty {
                let pid = graph
                    .find_parameter(parameter)
                    .ok_or_else(|| missing(parameter))?;
                let shape = resident_value(graph, parameter)?.shape().clone();
                let mut payload = transport.recv(*from, Channel::Parameters, &[shape])?;
                let value = payload.pop().ok_or_else(|| missing(parameter))?;
                graph.set_parameter_value(pid, value)?;
                debug!("overwrote '{parameter}' with the copy from rank {from}");
            }
        }
        Ok(sent)
    }
}

fn peer(
    topology: &StageTopology,
    placement: &RankPlacement,
    stage: usize,
) -> Result<usize, RuntimeError> {
    topology.wraparound(placement, stage).ok_or_else(|| {
        RuntimeError::Config(format!(
            "no rank hosts replica {} of stage {stage}",
            placement.replica
        ))
    })
}

fn missing(parameter: &str) -> ModelError {
    ModelError::MissingParameter {
        parameter: parameter.to_string(),
    }
}

fn resident_value(
    graph: &ModelGraph<Validated>,
    parameter: &str,
) -> Result<tensor_core::Tensor, ModelError> {
    graph
        .find_parameter(parameter)
        .and_then(|pid| graph.parameter(pid))
        .and_then(|p| p.value())
        .cloned()
        .ok_or_else(|| missing(parameter))
}

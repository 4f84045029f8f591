// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Mapping from stages to the ranks that host them.
//!
//! ```text
//!            replica 0   replica 1
//! stage 0 ─▶  rank 0      rank 3
//! stage 1 ─▶  rank 1      rank 4
//! stage 2 ─▶  rank 2      rank 5
//! ```
//!
//! Activations and gradients flow along a replica's column; gradient
//! averaging runs along a stage's row.

use crate::RuntimeError;
use serde::Serialize;
use std::collections::HashSet;

/// Validated stage-to-rank mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTopology {
    stages: Vec<Vec<usize>>,
}

/// Where one rank sits in a [`StageTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankPlacement {
    pub rank: usize,
    pub stage: usize,
    pub replica: usize,
    pub num_stages: usize,
    pub data_parallel_depth: usize,
    /// Same replica, previous stage.
    pub prev_rank: Option<usize>,
    /// Same replica, next stage.
    pub next_rank: Option<usize>,
}

impl RankPlacement {
    pub fn is_first(&self) -> bool {
        self.stage == 0
    }

    pub fn is_last(&self) -> bool {
        self.stage + 1 == self.num_stages
    }
}

impl StageTopology {
    /// Checks that every stage has the same, non-zero number of ranks and
    /// that no rank appears twice.
    pub fn new(stages: Vec<Vec<usize>>) -> Result<Self, RuntimeError> {
        let Some(first) = stages.first() else {
            return Err(RuntimeError::Config("topology has no stages".into()));
        };
        let depth = first.len();
        if depth == 0 {
            return Err(RuntimeError::Config("stage 0 has no ranks".into()));
        }
        let mut seen = HashSet::new();
        for (s, ranks) in stages.iter().enumerate() {
            if ranks.len() != depth {
                return Err(RuntimeError::Config(format!(
                    "stage {s} has {} rank(s), stage 0 has {depth}",
                    ranks.len()
                )));
            }
            for &r in ranks {
                if !seen.insert(r) {
                    return Err(RuntimeError::Config(format!(
                        "rank {r} appears more than once in the topology"
                    )));
                }
            }
        }
        Ok(Self { stages })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn data_parallel_depth(&self) -> usize {
        self.stages[0].len()
    }

    pub fn world_size(&self) -> usize {
        self.stages.len() * self.data_parallel_depth()
    }

    /// All ranks, stage by stage.
    pub fn ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.stages.iter().flatten().copied()
    }

    /// Rank hosting `replica` of `stage`.
    pub fn rank_of(&self, stage: usize, replica: usize) -> Option<usize> {
        self.stages.get(stage).and_then(|r| r.get(replica)).copied()
    }

    /// Ranks hosting `stage`, in replica order.
    pub fn stage_ranks(&self, stage: usize) -> &[usize] {
        self.stages.get(stage).map_or(&[], Vec::as_slice)
    }

    /// Locates `rank`, failing if the topology omits it.
    pub fn locate(&self, rank: usize) -> Result<RankPlacement, RuntimeError> {
        for (stage, ranks) in self.stages.iter().enumerate() {
            if let Some(replica) = ranks.iter().position(|&r| r == rank) {
                return Ok(RankPlacement {
                    rank,
                    stage,
                    replica,
                    num_stages: self.num_stages(),
                    data_parallel_depth: self.data_parallel_depth(),
                    prev_rank: stage
                        .checked_sub(1)
                        .and_then(|s| self.rank_of(s, replica)),
                    next_rank: self.rank_of(stage + 1, replica),
                });
            }
        }
        Err(RuntimeError::Config(format!("rank {rank} is not in the stage topology")))
    }

    /// Peer on `other_stage` in the same replica, used to mirror shared
    /// parameters between non-adjacent stages (first and last, typically).
    pub fn wraparound(&self, placement: &RankPlacement, other_stage: usize) -> Option<usize> {
        self.rank_of(other_stage, placement.replica)
    }
}

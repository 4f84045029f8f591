// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The [`AssignmentStrategy`] trait and strategy implementations.

pub mod balanced;
pub mod even;

use crate::{ParameterOwnership, PlannerError, StageAssignment, TraceReport};
use model_ir::{ModelGraph, Validated};

/// Trait for stage assignment strategies.
///
/// Each strategy takes the dry-run facts about a model and decides where
/// each of `num_stages` stages starts. Strategies are pure, so every
/// process computes the same assignment without coordination.
pub trait AssignmentStrategy: Send + Sync {
    /// Human-readable name of this strategy.
    fn name(&self) -> &str;

    /// Produces an assignment for `num_stages` stages.
    fn assign(
        &self,
        num_stages: usize,
        trace: &TraceReport,
        ownership: &ParameterOwnership,
        graph: &ModelGraph<Validated>,
    ) -> Result<StageAssignment, PlannerError>;
}

/// A fixed, user-provided list of stage starts.
#[derive(Debug, Clone)]
pub struct ExplicitCuts {
    cuts: Vec<usize>,
}

impl ExplicitCuts {
    pub fn new(cuts: Vec<usize>) -> Self {
        Self { cuts }
    }
}

impl AssignmentStrategy for ExplicitCuts {
    fn name(&self) -> &str {
        "explicit"
    }

    fn assign(
        &self,
        num_stages: usize,
        trace: &TraceReport,
        _ownership: &ParameterOwnership,
        _graph: &ModelGraph<Validated>,
    ) -> Result<StageAssignment, PlannerError> {
        if self.cuts.len() != num_stages {
            return Err(PlannerError::InvalidAssignment(format!(
                "stage_to_cut lists {} stage(s), topology has {num_stages}",
                self.cuts.len()
            )));
        }
        StageAssignment::new(self.cuts.clone(), trace.num_markers())
    }
}

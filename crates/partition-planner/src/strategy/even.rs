// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Even cuts: the same number of marker intervals per stage.
//!
//! Ignores compute and parameter sizes entirely. Works well when the
//! user placed markers between identical blocks, which is the common
//! case for transformer-style models.

use crate::strategy::AssignmentStrategy;
use crate::{ParameterOwnership, PlannerError, StageAssignment, TraceReport};
use model_ir::{ModelGraph, Validated};

/// `(K + 1) / S` intervals per stage, remainder on the last stage.
#[derive(Debug, Clone, Default)]
pub struct EvenCuts;

impl EvenCuts {
    pub fn new() -> Self {
        Self
    }
}

impl AssignmentStrategy for EvenCuts {
    fn name(&self) -> &str {
        "even"
    }

    fn assign(
        &self,
        num_stages: usize,
        trace: &TraceReport,
        _ownership: &ParameterOwnership,
        _graph: &ModelGraph<Validated>,
    ) -> Result<StageAssignment, PlannerError> {
        StageAssignment::even(num_stages, trace.num_markers()).map_err(|e| {
            PlannerError::StrategyFailed {
                strategy: self.name().to_string(),
                detail: e.to_string(),
            }
        })
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Balanced-parameters strategy.
//!
//! Packs consecutive intervals into the same stage while the stage's
//! owned parameter elements stay under an even share of the total:
//!
//! ```text
//! target = total_elements / num_stages
//! ```
//!
//! A stage is closed as soon as it reaches the target, or earlier when
//! the remaining intervals are only just enough to give every remaining
//! stage one interval each.
//!
//! # When to use
//! - Models whose markers sit between blocks of very different sizes
//!   (embedding tables, heads).

use crate::strategy::AssignmentStrategy;
use crate::{ParameterOwnership, PlannerError, StageAssignment, TraceReport};
use model_ir::{ModelGraph, Validated};
use tracing::debug;

/// Greedy contiguous packing of intervals by owned parameter elements.
#[derive(Debug, Clone, Default)]
pub struct BalancedParameters;

impl BalancedParameters {
    pub fn new() -> Self {
        Self
    }

    /// Stage starts for `weights` (one entry per interval).
    fn pack(&self, num_stages: usize, weights: &[usize]) -> Result<Vec<usize>, PlannerError> {
        let fail = |detail: String| PlannerError::StrategyFailed {
            strategy: self.name().to_string(),
            detail,
        };
        if num_stages == 0 {
            return Err(fail("no stages".into()));
        }
        if weights.len() < num_stages {
            return Err(fail(format!(
                "{num_stages} stages but only {} interval(s)",
                weights.len()
            )));
        }

        let total: usize = weights.iter().sum();
        let target = total as f64 / num_stages as f64;
        let mut cuts = vec![0];
        let mut acc = 0usize;

        for (i, &w) in weights.iter().enumerate() {
            let stages_left = num_stages - cuts.len();
            if stages_left == 0 {
                break;
            }
            let current_start = cuts[cuts.len() - 1];
            let intervals_left = weights.len() - i;
            let stage_non_empty = i > current_start;
            if stage_non_empty && (acc as f64 >= target || intervals_left == stages_left) {
                cuts.push(i);
                acc = 0;
            }
            acc += w;
        }

        if cuts.len() != num_stages {
            return Err(fail(format!(
                "could only form {} of {num_stages} stages",
                cuts.len()
            )));
        }
        Ok(cuts)
    }
}

impl AssignmentStrategy for BalancedParameters {
    fn name(&self) -> &str {
        "balanced"
    }

    fn assign(
        &self,
        num_stages: usize,
        trace: &TraceReport,
        ownership: &ParameterOwnership,
        graph: &ModelGraph<Validated>,
    ) -> Result<StageAssignment, PlannerError> {
        let weights = ownership.elements_per_interval(graph, trace.num_intervals());
        debug!("interval weights: {:?}", weights);
        let cuts = self.pack(num_stages, &weights)?;
        StageAssignment::new(cuts, trace.num_markers())
    }
}

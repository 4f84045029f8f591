// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stage assignment: which boundary-marker intervals each stage runs.
//!
//! With `K` markers the model has `K + 1` intervals, numbered `0..=K`;
//! interval `i > 0` starts right after marker `i`. A [`StageAssignment`]
//! holds one start interval per stage:
//!
//! ```text
//! cuts = [0, 2, 4], K = 5
//!
//! interval:  0  1 | 2  3 | 4  5
//! stage:     0  0 | 1  1 | 2  2
//!                 ^      ^
//!             marker 2  marker 4
//! ```
//!
//! Stage `s` receives through marker `cuts[s]` and sends through marker
//! `cuts[s + 1]`.

use crate::PlannerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Start interval of every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAssignment {
    cuts: Vec<usize>,
    num_markers: usize,
}

impl StageAssignment {
    /// Validates `cuts` against a model with `num_markers` boundary markers.
    ///
    /// Checks:
    /// - At least one stage.
    /// - The first stage starts at interval 0.
    /// - Starts are strictly increasing.
    /// - The last start is at most `num_markers`.
    pub fn new(cuts: Vec<usize>, num_markers: usize) -> Result<Self, PlannerError> {
        let first = *cuts
            .first()
            .ok_or_else(|| PlannerError::InvalidAssignment("no stages".into()))?;
        if first != 0 {
            return Err(PlannerError::InvalidAssignment(format!(
                "stage 0 must start at interval 0, got {first}"
            )));
        }
        if let Some(w) = cuts.windows(2).find(|w| w[0] >= w[1]) {
            return Err(PlannerError::InvalidAssignment(format!(
                "stage starts must be strictly increasing, found {} then {}",
                w[0], w[1]
            )));
        }
        let last = cuts[cuts.len() - 1];
        if last > num_markers {
            return Err(PlannerError::InvalidAssignment(format!(
                "stage start {last} exceeds the {num_markers} boundary marker(s) in the model"
            )));
        }
        Ok(Self { cuts, num_markers })
    }

    /// Spreads `num_markers + 1` intervals over `num_stages` stages,
    /// `(K + 1) / S` intervals per stage with the remainder on the last.
    pub fn even(num_stages: usize, num_markers: usize) -> Result<Self, PlannerError> {
        if num_stages == 0 {
            return Err(PlannerError::InvalidAssignment("no stages".into()));
        }
        let per_stage = (num_markers + 1) / num_stages;
        if per_stage == 0 {
            return Err(PlannerError::InvalidAssignment(format!(
                "{num_stages} stages need at least {} boundary markers, model has {num_markers}",
                num_stages - 1
            )));
        }
        Self::new((0..num_stages).map(|s| s * per_stage).collect(), num_markers)
    }

    pub fn num_stages(&self) -> usize {
        self.cuts.len()
    }

    pub fn num_markers(&self) -> usize {
        self.num_markers
    }

    pub fn cuts(&self) -> &[usize] {
        &self.cuts
    }

    /// Intervals run by `stage`, or `None` when out of range.
    pub fn interval_range(&self, stage: usize) -> Option<Range<usize>> {
        let start = *self.cuts.get(stage)?;
        let end = self
            .cuts
            .get(stage + 1)
            .copied()
            .unwrap_or(self.num_markers + 1);
        Some(start..end)
    }

    /// Stage whose range contains `interval`.
    pub fn stage_of_interval(&self, interval: usize) -> Option<usize> {
        if interval > self.num_markers {
            return None;
        }
        Some(self.cuts.partition_point(|&c| c <= interval) - 1)
    }

    /// Marker through which `stage` receives activations (none for stage 0).
    pub fn receive_marker(&self, stage: usize) -> Option<usize> {
        match stage {
            0 => None,
            s => self.cuts.get(s).copied(),
        }
    }

    /// Marker through which `stage` sends activations (none for the last stage).
    pub fn send_marker(&self, stage: usize) -> Option<usize> {
        self.cuts.get(stage + 1).copied()
    }

    pub fn is_last(&self, stage: usize) -> bool {
        stage + 1 == self.cuts.len()
    }
}

impl fmt::Display for StageAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = (0..self.num_stages())
            .filter_map(|s| self.interval_range(s))
            .map(|r| format!("{}..{}", r.start, r.end))
            .collect();
        write!(
            f,
            "{} stage(s) over {} marker(s): [{}]",
            self.num_stages(),
            self.num_markers,
            ranges.join(", ")
        )
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! One-forward-one-backward (1F1B) schedule.
//!
//! ```text
//! S = 3, M = 4
//!
//! stage 0: F0 F1 F2 R0 F3 R1 R2 R3
//! stage 1:    F0 F1 R0 F2 R1 F3 R2 R3
//! stage 2:       F0 B0 F1 B1 F2 B2 F3 B3
//! ```
//!
//! - Warm-up: stage `s` runs `min(S - s - 1, M)` forwards up front.
//! - Steady state: alternate one forward and one backward.
//! - Cool-down: the remaining backwards.
//!
//! At most `S - s` microbatches are in flight on stage `s`. Only the last
//! stage pairs each forward with its own backward; elsewhere forwards run
//! untracked and are recomputed just before their backward.

use crate::strategy::{check_inputs, classify, ScheduleStrategy};
use crate::{ScheduleError, StageSchedule};
use tracing::debug;

/// 1F1B with warm-up and cool-down.
#[derive(Debug, Clone, Default)]
pub struct OneForwardOneBackward;

impl OneForwardOneBackward {
    pub fn new() -> Self {
        Self
    }

    /// Number of warm-up forwards on `stage`. A stage at or past the end
    /// of the pipeline has none.
    pub fn warmup(num_stages: usize, num_microbatches: usize, stage: usize) -> usize {
        num_stages.saturating_sub(stage).saturating_sub(1).min(num_microbatches)
    }
}

impl ScheduleStrategy for OneForwardOneBackward {
    fn name(&self) -> &str {
        "1f1b"
    }

    fn schedule(
        &self,
        num_stages: usize,
        num_microbatches: usize,
        stage: usize,
    ) -> Result<StageSchedule, ScheduleError> {
        check_inputs(num_stages, num_microbatches, stage)?;
        let m = num_microbatches;
        let warmup = Self::warmup(num_stages, m, stage);

        let mut order = Vec::with_capacity(2 * m);
        let mut fwd = 0usize;
        let mut bwd = 0usize;
        for _ in 0..warmup {
            order.push((false, fwd));
            fwd += 1;
        }
        for _ in 0..(m - warmup) {
            order.push((false, fwd));
            fwd += 1;
            order.push((true, bwd));
            bwd += 1;
        }
        while bwd < m {
            order.push((true, bwd));
            bwd += 1;
        }

        let schedule = StageSchedule {
            stage,
            num_stages,
            num_microbatches: m,
            entries: classify(&order),
        };
        debug!("{} schedule: {}", self.name(), schedule);
        Ok(schedule)
    }
}

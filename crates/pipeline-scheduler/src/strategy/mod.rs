// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The [`ScheduleStrategy`] trait and strategy implementations.

pub mod fill_drain;
pub mod one_f_one_b;

use crate::{ScheduleEntry, ScheduleError, StageSchedule, TaskKind};

/// Trait for pipeline schedule strategies.
///
/// A strategy is a pure function of `(num_stages, num_microbatches,
/// stage)`, so every process of a stage computes the same schedule and
/// stages never negotiate ordering at runtime.
pub trait ScheduleStrategy: Send + Sync {
    /// Human-readable name of this strategy.
    fn name(&self) -> &str;

    /// Produces the schedule of `stage`.
    fn schedule(
        &self,
        num_stages: usize,
        num_microbatches: usize,
        stage: usize,
    ) -> Result<StageSchedule, ScheduleError>;

    /// Produces the schedules of every stage, in stage order.
    fn schedule_all(
        &self,
        num_stages: usize,
        num_microbatches: usize,
    ) -> Result<Vec<StageSchedule>, ScheduleError> {
        (0..num_stages)
            .map(|s| self.schedule(num_stages, num_microbatches, s))
            .collect()
    }
}

/// Rejects inputs no schedule can be built for.
pub(crate) fn check_inputs(
    num_stages: usize,
    num_microbatches: usize,
    stage: usize,
) -> Result<(), ScheduleError> {
    if num_stages == 0 {
        return Err(ScheduleError::InvalidInput("num_stages must be at least 1".into()));
    }
    if num_microbatches == 0 {
        return Err(ScheduleError::InvalidInput(
            "num_microbatches must be at least 1".into(),
        ));
    }
    if stage >= num_stages {
        return Err(ScheduleError::InvalidInput(format!(
            "stage {stage} out of range for {num_stages} stage(s)"
        )));
    }
    Ok(())
}

/// Turns a logical forward/backward order into schedule entries.
///
/// `order` holds `(is_backward, microbatch)` pairs. A backward directly
/// after the forward of its own microbatch stays a plain backward; every
/// other backward recomputes its forward first.
pub(crate) fn classify(order: &[(bool, usize)]) -> Vec<ScheduleEntry> {
    order
        .iter()
        .enumerate()
        .map(|(i, &(is_backward, mb))| {
            if !is_backward {
                return ScheduleEntry::forward(mb);
            }
            let paired = i > 0 && order[i - 1] == (false, mb);
            ScheduleEntry {
                kind: if paired {
                    TaskKind::Backward
                } else {
                    TaskKind::RecomputeAndBackward
                },
                microbatch: mb,
            }
        })
        .collect()
}

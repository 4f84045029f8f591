// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Fill-drain (GPipe-style) schedule: every forward, then every backward.
//!
//! Simple and deadlock-free, but every stage idles while the pipe fills
//! and drains, and all `M` microbatches are in flight at once.

use crate::strategy::{check_inputs, classify, ScheduleStrategy};
use crate::{ScheduleError, StageSchedule};

/// All forwards in order, then all backwards in order.
#[derive(Debug, Clone, Default)]
pub struct FillDrain;

impl FillDrain {
    pub fn new() -> Self {
        Self
    }
}

impl ScheduleStrategy for FillDrain {
    fn name(&self) -> &str {
        "fill-drain"
    }

    fn schedule(
        &self,
        num_stages: usize,
        num_microbatches: usize,
        stage: usize,
    ) -> Result<StageSchedule, ScheduleError> {
        check_inputs(num_stages, num_microbatches, stage)?;
        let order: Vec<(bool, usize)> = (0..num_microbatches)
            .map(|mb| (false, mb))
            .chain((0..num_microbatches).map(|mb| (true, mb)))
            .collect();
        Ok(StageSchedule {
            stage,
            num_stages,
            num_microbatches,
            entries: classify(&order),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_then_drain() {
        let s = FillDrain::new().schedule(2, 3, 1).unwrap();
        assert_eq!(s.to_string(), "stage 1: F0 F1 F2 R0 R1 R2");
        s.validate().unwrap();
        assert_eq!(s.max_in_flight(), 3);
    }

    #[test]
    fn test_single_microbatch_is_paired() {
        let s = FillDrain::new().schedule(2, 1, 0).unwrap();
        assert_eq!(s.to_string(), "stage 0: F0 B0");
        assert!(s.forward_grad_mode(0));
    }
}

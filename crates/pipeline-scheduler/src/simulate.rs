// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Discrete-event simulation of a full set of stage schedules.
//!
//! Each stage executes its entries strictly in order. A task starts when
//! the stage is free and its cross-stage input has arrived:
//!
//! - a forward of microbatch `m` on stage `s > 0` waits for the forward
//!   of `m` on stage `s - 1`, plus the transfer latency;
//! - a backward-class task of `m` on stage `s < S - 1` waits for the
//!   backward-class task of `m` on stage `s + 1`, plus the latency.
//!
//! If no stage can make progress before all are done, the schedules
//! deadlock and the blocked stages are reported.

use crate::{ScheduleError, StageSchedule, TaskKind};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Costs, in arbitrary time units, of each task kind and of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskCosts {
    pub forward: f64,
    pub backward: f64,
    pub transfer: f64,
}

impl Default for TaskCosts {
    fn default() -> Self {
        Self {
            forward: 1.0,
            backward: 2.0,
            transfer: 0.0,
        }
    }
}

impl TaskCosts {
    /// Duration of one task of `kind`.
    pub fn duration(&self, kind: TaskKind) -> f64 {
        match kind {
            TaskKind::Forward => self.forward,
            TaskKind::Backward => self.backward,
            TaskKind::RecomputeAndBackward => self.forward + self.backward,
        }
    }
}

/// One executed task on a stage timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskSpan {
    pub kind: TaskKind,
    pub microbatch: usize,
    pub start: f64,
    pub end: f64,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub timelines: Vec<Vec<TaskSpan>>,
    pub makespan: f64,
    /// Fraction of stage-time spent idle, `0.0..=1.0`.
    pub bubble_fraction: f64,
}

impl SimulationReport {
    /// Busy time of each stage.
    pub fn busy(&self) -> Vec<f64> {
        self.timelines
            .iter()
            .map(|t| t.iter().map(|s| s.end - s.start).sum())
            .collect()
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} stage(s), makespan {:.2}, bubble {:.1}%",
            self.timelines.len(),
            self.makespan,
            self.bubble_fraction * 100.0
        );
        for (s, line) in self.timelines.iter().enumerate() {
            let _ = write!(out, "\n  stage {s}:");
            for span in line {
                let _ = write!(
                    out,
                    " {}{}@{:.1}",
                    span.kind.letter(),
                    span.microbatch,
                    span.start
                );
            }
        }
        out
    }
}

/// Simulates `schedules` (one per stage, in stage order).
pub fn simulate(
    schedules: &[StageSchedule],
    costs: &TaskCosts,
) -> Result<SimulationReport, ScheduleError> {
    let num_stages = schedules.len();
    if num_stages == 0 {
        return Err(ScheduleError::InvalidInput("no schedules to simulate".into()));
    }
    let m = schedules[0].num_microbatches;
    for (s, sched) in schedules.iter().enumerate() {
        if sched.stage != s || sched.num_microbatches != m {
            return Err(ScheduleError::InvalidInput(format!(
                "schedule {s} is for stage {} with {} microbatch(es); expected stage {s} with {m}",
                sched.stage, sched.num_microbatches
            )));
        }
        sched.validate()?;
    }

    // Finish times, indexed [stage][microbatch].
    let mut fwd_done: Vec<Vec<Option<f64>>> = vec![vec![None; m]; num_stages];
    let mut bwd_done: Vec<Vec<Option<f64>>> = vec![vec![None; m]; num_stages];
    let mut cursor = vec![0usize; num_stages];
    let mut free_at = vec![0.0f64; num_stages];
    let mut timelines: Vec<Vec<TaskSpan>> = vec![Vec::new(); num_stages];

    loop {
        let mut progressed = false;
        for s in 0..num_stages {
            while let Some(entry) = schedules[s].entries.get(cursor[s]) {
                let mb = entry.microbatch;
                let upstream = match entry.kind {
                    TaskKind::Forward if s > 0 => Some(fwd_done[s - 1][mb]),
                    TaskKind::Forward => None,
                    _ if s + 1 < num_stages => Some(bwd_done[s + 1][mb]),
                    _ => None,
                };
                let arrival = match upstream {
                    Some(Some(done)) => done + costs.transfer,
                    Some(None) => break,
                    None => 0.0,
                };
                let start = free_at[s].max(arrival);
                let end = start + costs.duration(entry.kind);
                match entry.kind {
                    TaskKind::Forward => fwd_done[s][mb] = Some(end),
                    _ => bwd_done[s][mb] = Some(end),
                }
                timelines[s].push(TaskSpan {
                    kind: entry.kind,
                    microbatch: mb,
                    start,
                    end,
                });
                free_at[s] = end;
                cursor[s] += 1;
                progressed = true;
            }
        }
        let blocked: Vec<usize> = (0..num_stages)
            .filter(|&s| cursor[s] < schedules[s].len())
            .collect();
        if blocked.is_empty() {
            break;
        }
        if !progressed {
            return Err(ScheduleError::Deadlock { blocked });
        }
    }

    let makespan = free_at.iter().copied().fold(0.0, f64::max);
    let busy: f64 = timelines
        .iter()
        .flat_map(|t| t.iter().map(|s| s.end - s.start))
        .sum();
    let bubble_fraction = if makespan > 0.0 {
        1.0 - busy / (makespan * num_stages as f64)
    } else {
        0.0
    };
    Ok(SimulationReport {
        timelines,
        makespan,
        bubble_fraction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FillDrain, OneForwardOneBackward, ScheduleEntry, ScheduleStrategy};

    fn unit_costs() -> TaskCosts {
        TaskCosts {
            forward: 1.0,
            backward: 1.0,
            transfer: 0.0,
        }
    }

    #[test]
    fn test_single_stage_has_no_bubble() {
        let all = OneForwardOneBackward::new().schedule_all(1, 4).unwrap();
        let report = simulate(&all, &unit_costs()).unwrap();
        assert_eq!(report.makespan, 8.0);
        assert_eq!(report.bubble_fraction, 0.0);
    }

    #[test]
    fn test_cross_stage_ordering_holds() {
        let all = OneForwardOneBackward::new().schedule_all(3, 5).unwrap();
        let report = simulate(&all, &TaskCosts::default()).unwrap();
        for s in 0..2 {
            for mb in 0..5 {
                let find = |stage: usize, backward: bool| {
                    report.timelines[stage]
                        .iter()
                        .find(|t| t.microbatch == mb && t.kind.is_backward() == backward)
                        .copied()
                        .unwrap()
                };
                assert!(find(s, false).end <= find(s + 1, false).start);
                assert!(find(s + 1, true).end <= find(s, true).start);
            }
        }
    }

    #[test]
    fn test_one_f_one_b_not_slower_than_fill_drain() {
        let costs = unit_costs();
        let a = simulate(&OneForwardOneBackward::new().schedule_all(4, 8).unwrap(), &costs).unwrap();
        let b = simulate(&FillDrain::new().schedule_all(4, 8).unwrap(), &costs).unwrap();
        assert!(a.makespan <= b.makespan + 1e-9);
        assert!(a.bubble_fraction > 0.0);
    }

    #[test]
    fn test_deadlock_detected() {
        // Stage 0 insists on back-propagating microbatch 0 before sending
        // the forward of microbatch 1 that stage 1 needs first.
        let s0 = StageSchedule {
            stage: 0,
            num_stages: 2,
            num_microbatches: 2,
            entries: vec![
                ScheduleEntry::forward(0),
                ScheduleEntry::recompute_and_backward(0),
                ScheduleEntry::forward(1),
                ScheduleEntry::recompute_and_backward(1),
            ],
        };
        let s1 = StageSchedule {
            stage: 1,
            num_stages: 2,
            num_microbatches: 2,
            entries: vec![
                ScheduleEntry::forward(0),
                ScheduleEntry::forward(1),
                ScheduleEntry::recompute_and_backward(0),
                ScheduleEntry::recompute_and_backward(1),
            ],
        };
        let err = simulate(&[s0, s1], &unit_costs()).unwrap_err();
        assert_eq!(err, ScheduleError::Deadlock { blocked: vec![0, 1] });
    }

    #[test]
    fn test_mismatched_stage_rejected() {
        let mut all = OneForwardOneBackward::new().schedule_all(2, 2).unwrap();
        all.swap(0, 1);
        assert!(simulate(&all, &unit_costs()).is_err());
    }

    #[test]
    fn test_summary_lists_stages() {
        let all = OneForwardOneBackward::new().schedule_all(2, 2).unwrap();
        let s = simulate(&all, &unit_costs()).unwrap().summary();
        assert!(s.contains("2 stage(s)"));
        assert!(s.contains("stage 1: F0@1.0"));
    }
}

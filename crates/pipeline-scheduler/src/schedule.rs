// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Schedule entries and per-stage schedules.
//!
//! # Text format
//!
//! A schedule serialises as `kind,microbatch;` records:
//!
//! ```text
//! 0,0;0,1;1,0;0,2;1,1;1,2;
//! ```
//!
//! | Code | Task |
//! |---|---|
//! | `0` | forward |
//! | `1` | recompute-and-backward |
//! | `2` | backward |

use crate::ScheduleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the executor does for one schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Forward pass; tracked only when the next entry is its backward.
    Forward,
    /// Re-run the forward from saved inputs, then back-propagate.
    RecomputeAndBackward,
    /// Back-propagate through the forward that ran just before.
    Backward,
}

impl TaskKind {
    /// Wire code used by the text format.
    pub fn code(self) -> u8 {
        match self {
            TaskKind::Forward => 0,
            TaskKind::RecomputeAndBackward => 1,
            TaskKind::Backward => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TaskKind::Forward),
            1 => Some(TaskKind::RecomputeAndBackward),
            2 => Some(TaskKind::Backward),
            _ => None,
        }
    }

    /// `true` for the two kinds that back-propagate.
    pub fn is_backward(self) -> bool {
        !matches!(self, TaskKind::Forward)
    }

    /// Single-letter label used in timelines.
    pub fn letter(self) -> &'static str {
        match self {
            TaskKind::Forward => "F",
            TaskKind::RecomputeAndBackward => "R",
            TaskKind::Backward => "B",
        }
    }
}

/// One task: a kind and the microbatch it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub kind: TaskKind,
    pub microbatch: usize,
}

impl ScheduleEntry {
    pub fn forward(microbatch: usize) -> Self {
        Self {
            kind: TaskKind::Forward,
            microbatch,
        }
    }

    pub fn backward(microbatch: usize) -> Self {
        Self {
            kind: TaskKind::Backward,
            microbatch,
        }
    }

    pub fn recompute_and_backward(microbatch: usize) -> Self {
        Self {
            kind: TaskKind::RecomputeAndBackward,
            microbatch,
        }
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.letter(), self.microbatch)
    }
}

/// The ordered tasks one stage executes for one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSchedule {
    pub stage: usize,
    pub num_stages: usize,
    pub num_microbatches: usize,
    pub entries: Vec<ScheduleEntry>,
}

impl StageSchedule {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter()
    }

    /// Whether the forward at `index` runs with gradient tracking.
    ///
    /// True exactly when the next entry is the plain backward of the same
    /// microbatch; every other forward runs untracked and is recomputed.
    pub fn forward_grad_mode(&self, index: usize) -> bool {
        match (self.entries.get(index), self.entries.get(index + 1)) {
            (Some(cur), Some(next)) => {
                cur.kind == TaskKind::Forward
                    && next.kind == TaskKind::Backward
                    && next.microbatch == cur.microbatch
            }
            _ => false,
        }
    }

    /// Number of forward entries.
    pub fn num_forwards(&self) -> usize {
        self.entries.iter().filter(|e| e.kind == TaskKind::Forward).count()
    }

    /// Number of backward-class entries.
    pub fn num_backwards(&self) -> usize {
        self.entries.iter().filter(|e| e.kind.is_backward()).count()
    }

    /// Number of untracked forwards whose activations get recomputed.
    pub fn num_recomputes(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == TaskKind::RecomputeAndBackward)
            .count()
    }

    /// Largest number of forwards awaiting their backward at any point.
    pub fn max_in_flight(&self) -> usize {
        let mut live = 0usize;
        let mut peak = 0usize;
        for e in &self.entries {
            if e.kind == TaskKind::Forward {
                live += 1;
                peak = peak.max(live);
            } else {
                live = live.saturating_sub(1);
            }
        }
        peak
    }

    /// Microbatch of the last backward-class entry, where gradient sync runs.
    pub fn last_backward_microbatch(&self) -> Option<usize> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.kind.is_backward())
            .map(|e| e.microbatch)
    }

    /// Checks the schedule can be executed as-is.
    ///
    /// # Checks
    /// - Every microbatch `0..M` has exactly one forward and exactly one
    ///   backward-class entry, and nothing else appears.
    /// - Each backward-class entry comes after the forward of its microbatch.
    /// - A plain backward directly follows the forward of its microbatch.
    /// - Forwards run in ascending microbatch order, as do backwards.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        let fail = |detail: String| ScheduleError::Malformed {
            stage: self.stage,
            detail,
        };
        let m = self.num_microbatches;
        let mut forwarded = vec![false; m];
        let mut backwarded = vec![false; m];
        let mut next_forward = 0usize;
        let mut next_backward = 0usize;

        for (i, e) in self.entries.iter().enumerate() {
            if e.microbatch >= m {
                return Err(fail(format!(
                    "entry {i} ({e}) names microbatch {} of {m}",
                    e.microbatch
                )));
            }
            match e.kind {
                TaskKind::Forward => {
                    if forwarded[e.microbatch] {
                        return Err(fail(format!("microbatch {} forwarded twice", e.microbatch)));
                    }
                    if e.microbatch != next_forward {
                        return Err(fail(format!(
                            "entry {i} forwards microbatch {} before {next_forward}",
                            e.microbatch
                        )));
                    }
                    forwarded[e.microbatch] = true;
                    next_forward += 1;
                }
                kind => {
                    if !forwarded[e.microbatch] {
                        return Err(fail(format!(
                            "entry {i} ({e}) runs before its forward",
                        )));
                    }
                    if backwarded[e.microbatch] {
                        return Err(fail(format!("microbatch {} back-propagated twice", e.microbatch)));
                    }
                    if e.microbatch != next_backward {
                        return Err(fail(format!(
                            "entry {i} back-propagates microbatch {} before {next_backward}",
                            e.microbatch
                        )));
                    }
                    if kind == TaskKind::Backward
                        && (i == 0 || !self.forward_grad_mode(i - 1))
                    {
                        return Err(fail(format!(
                            "entry {i} ({e}) is a plain backward not directly after its forward"
                        )));
                    }
                    backwarded[e.microbatch] = true;
                    next_backward += 1;
                }
            }
        }
        if next_forward != m || next_backward != m {
            return Err(fail(format!(
                "{next_forward} forward(s) and {next_backward} backward(s) for {m} microbatch(es)"
            )));
        }
        Ok(())
    }

    /// Serialises to the `kind,microbatch;` text format.
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{},{};", e.kind.code(), e.microbatch))
            .collect()
    }

    /// Parses the text format produced by [`StageSchedule::to_text`] or an
    /// external generator, then validates it.
    pub fn parse(
        text: &str,
        stage: usize,
        num_stages: usize,
        num_microbatches: usize,
    ) -> Result<Self, ScheduleError> {
        let mut entries = Vec::new();
        for (record, raw) in text.split(';').enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let fail = |detail: &str| ScheduleError::Parse {
                record,
                text: raw.to_string(),
                detail: detail.to_string(),
            };
            let (kind, mb) = raw.split_once(',').ok_or_else(|| fail("expected 'kind,microbatch'"))?;
            let code: u8 = kind.trim().parse().map_err(|_| fail("task kind is not a number"))?;
            let kind = TaskKind::from_code(code).ok_or_else(|| fail("task kind must be 0, 1 or 2"))?;
            let microbatch: usize = mb
                .trim()
                .parse()
                .map_err(|_| fail("microbatch is not a number"))?;
            entries.push(ScheduleEntry { kind, microbatch });
        }
        let schedule = Self {
            stage,
            num_stages,
            num_microbatches,
            entries,
        };
        schedule.validate()?;
        Ok(schedule)
    }
}

impl fmt::Display for StageSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}:", self.stage)?;
        for e in &self.entries {
            write!(f, " {e}")?;
        }
        Ok(())
    }
}

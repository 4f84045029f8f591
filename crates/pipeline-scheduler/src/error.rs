// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for schedule generation, parsing and simulation.

/// Errors that can occur while building or checking a schedule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    /// Stage count, microbatch count or stage index is unusable.
    #[error("invalid schedule input: {0}")]
    InvalidInput(String),

    /// A schedule does not run every microbatch exactly once per task class.
    #[error("malformed schedule for stage {stage}: {detail}")]
    Malformed { stage: usize, detail: String },

    /// A schedule text record could not be parsed.
    #[error("cannot parse schedule record {record} ('{text}'): {detail}")]
    Parse {
        record: usize,
        text: String,
        detail: String,
    },

    /// The strategy name is not known.
    #[error("unknown schedule strategy '{0}'")]
    UnknownStrategy(String),

    /// The stage schedules wait on each other and can never finish.
    #[error("schedules deadlock: stages {blocked:?} are blocked")]
    Deadlock { blocked: Vec<usize> },
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # pipeline-scheduler
//!
//! Per-stage task orders for pipeline-parallel training.
//!
//! A [`StageSchedule`] is the ordered list of [`ScheduleEntry`]s one
//! stage executes per training step. Schedules are pure functions of
//! `(num_stages, num_microbatches, stage)`, produced by a
//! [`ScheduleStrategy`]:
//!
//! | Strategy | In flight per stage | Bubble |
//! |---|---|---|
//! | [`OneForwardOneBackward`] | `S - s` | small |
//! | [`FillDrain`] | `M` | large |
//!
//! [`simulate`] replays a full set of schedules against task costs to
//! check cross-stage ordering and to estimate makespan and bubble time.
//!
//! # Example
//! ```
//! use pipeline_scheduler::{OneForwardOneBackward, ScheduleStrategy};
//!
//! let s = OneForwardOneBackward::new().schedule(3, 3, 0).unwrap();
//! assert_eq!(s.to_text(), "0,0;0,1;0,2;1,0;1,1;1,2;");
//! ```

mod error;
mod schedule;
mod simulate;
pub mod strategy;

pub use error::ScheduleError;
pub use schedule::{ScheduleEntry, StageSchedule, TaskKind};
pub use simulate::{simulate, SimulationReport, TaskCosts, TaskSpan};
pub use strategy::fill_drain::FillDrain;
pub use strategy::one_f_one_b::OneForwardOneBackward;
pub use strategy::ScheduleStrategy;

/// Maps a strategy name onto its implementation.
pub fn strategy_by_name(name: &str) -> Result<Box<dyn ScheduleStrategy>, ScheduleError> {
    match name {
        "1f1b" => Ok(Box::new(OneForwardOneBackward::new())),
        "fill-drain" | "gpipe" => Ok(Box::new(FillDrain::new())),
        other => Err(ScheduleError::UnknownStrategy(other.to_string())),
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # partition-planner
//!
//! Cuts a validated `ModelGraph` into pipeline stages at its boundary
//! markers.
//!
//! # Pipeline
//!
//! ```text
//! DryRunner ──▶ TraceReport ──┬──▶ AssignmentStrategy ──▶ StageAssignment
//!                             │                                 │
//! OwnershipResolver ──▶ ParameterOwnership ─────────────────────┤
//!                                                               ▼
//!                                        ModelPartitioner ──▶ PartitionedStage
//! ```
//!
//! [`dry_run`] runs the first two steps once per host and shares them
//! through a [`DryRunCache`].
//!
//! # Strategies
//!
//! | Strategy | Cuts by |
//! |---|---|
//! | [`EvenCuts`] | equal number of marker intervals per stage |
//! | [`BalancedParameters`] | owned parameter elements per stage |
//! | [`ExplicitCuts`] | a user-provided list of stage starts |
//!
//! All strategies implement [`AssignmentStrategy`], so new strategies can
//! be added without modifying the runtime.

mod assignment;
mod cache;
mod error;
mod ownership;
mod partition;
pub mod strategy;
mod trace;

#[cfg(test)]
mod testing;

pub use assignment::StageAssignment;
pub use cache::{
    dry_run, graph_fingerprint, DryRunCache, DryRunOutcome, DryRunRequest, LocalBarrier,
    NoBarrier,
};
pub use error::PlannerError;
pub use ownership::{
    resolve_shared, OwnershipResolver, ParameterOwnership, SharedParameterGroup, SharedPlacement,
};
pub use partition::{BoundaryFactory, ModelPartitioner, PartitionReport, PartitionedStage};
pub use strategy::balanced::BalancedParameters;
pub use strategy::even::EvenCuts;
pub use strategy::{AssignmentStrategy, ExplicitCuts};
pub use trace::{BoundarySignature, DryRunner, MarkerTrace, TensorSignature, TraceReport};

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Model partitioner: turns a full graph into one stage's graph.
//!
//! For stage `s` the partitioner
//!
//! 1. installs a receive-capable node on marker `cuts[s]` and a
//!    send-capable node on marker `cuts[s + 1]` (whichever exist),
//! 2. marks every leaf module that was never called inside the stage's
//!    interval range as [`Residency::External`], and every container
//!    with no local descendant likewise,
//! 3. drops the values of parameters owned by intervals outside the
//!    range.
//!
//! Modules are never removed; handles stay valid on every stage.

use crate::{MarkerTrace, ParameterOwnership, PlannerError, StageAssignment, TraceReport};
use model_ir::{BoundaryNode, ModelGraph, ModuleId, Residency, Validated};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the communicating nodes installed at a stage's two markers.
pub trait BoundaryFactory {
    /// Node for the marker this stage receives activations through.
    fn receiver(&self, marker: &MarkerTrace) -> Arc<dyn BoundaryNode>;

    /// Node for the marker this stage sends activations through.
    fn sender(&self, marker: &MarkerTrace) -> Arc<dyn BoundaryNode>;
}

/// Counts from one partitioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub local_modules: usize,
    pub external_modules: usize,
    pub unvisited_modules: usize,
    pub resident_parameters: usize,
    pub pruned_parameters: usize,
    pub resident_elements: usize,
}

/// One stage's view of the model.
#[derive(Debug)]
pub struct PartitionedStage {
    pub graph: ModelGraph<Validated>,
    pub stage: usize,
    pub num_stages: usize,
    pub intervals: Range<usize>,
    pub receive_marker: Option<MarkerTrace>,
    pub send_marker: Option<MarkerTrace>,
    pub report: PartitionReport,
}

impl PartitionedStage {
    pub fn is_first(&self) -> bool {
        self.stage == 0
    }

    pub fn is_last(&self) -> bool {
        self.stage + 1 == self.num_stages
    }
}

/// Partitions graphs against a fixed trace, ownership and assignment.
pub struct ModelPartitioner<'a> {
    trace: &'a TraceReport,
    ownership: &'a ParameterOwnership,
    assignment: &'a StageAssignment,
}

impl<'a> ModelPartitioner<'a> {
    pub fn new(
        trace: &'a TraceReport,
        ownership: &'a ParameterOwnership,
        assignment: &'a StageAssignment,
    ) -> Self {
        Self {
            trace,
            ownership,
            assignment,
        }
    }

    fn install(
        &self,
        graph: &mut ModelGraph<Validated>,
        marker: Option<usize>,
        make: impl Fn(&MarkerTrace) -> Arc<dyn BoundaryNode>,
    ) -> Result<Option<MarkerTrace>, PlannerError> {
        let Some(index) = marker else {
            return Ok(None);
        };
        let trace = self.trace.marker(index).ok_or_else(|| {
            PlannerError::InvalidAssignment(format!("no traced boundary marker with index {index}"))
        })?;
        let id = graph.find_module(&trace.module).ok_or_else(|| {
            PlannerError::Trace(format!("traced marker '{}' is not in the graph", trace.module))
        })?;
        graph.install_boundary(id, make(trace))?;
        Ok(Some(trace.clone()))
    }

    /// Turns `graph` into the graph of `stage`.
    pub fn partition(
        &self,
        mut graph: ModelGraph<Validated>,
        stage: usize,
        factory: &dyn BoundaryFactory,
    ) -> Result<PartitionedStage, PlannerError> {
        if self.assignment.num_markers() != self.trace.num_markers() {
            return Err(PlannerError::InvalidAssignment(format!(
                "assignment covers {} boundary marker(s), trace recorded {}",
                self.assignment.num_markers(),
                self.trace.num_markers()
            )));
        }
        let range = self.assignment.interval_range(stage).ok_or_else(|| {
            PlannerError::InvalidAssignment(format!(
                "stage {stage} out of range for {} stage(s)",
                self.assignment.num_stages()
            ))
        })?;

        let receive_marker = self.install(&mut graph, self.assignment.receive_marker(stage), |m| {
            factory.receiver(m)
        })?;
        let send_marker = self.install(&mut graph, self.assignment.send_marker(stage), |m| {
            factory.sender(m)
        })?;

        let mut report = PartitionReport::default();

        // Leaves first; containers are local iff a descendant is.
        let mut keep: HashSet<ModuleId> = HashSet::new();
        for (id, node) in graph.modules() {
            if node.is_container() {
                continue;
            }
            let local = if node.is_boundary() {
                true
            } else {
                match self.trace.call_intervals.get(node.name()) {
                    Some(set) => set.iter().any(|i| range.contains(i)),
                    None => {
                        report.unvisited_modules += 1;
                        warn!("module '{}' was never called during the trace; keeping it", node.name());
                        true
                    }
                }
            };
            if local {
                keep.insert(id);
                keep.extend(graph.ancestors(id));
            }
        }
        let all: Vec<ModuleId> = graph.modules().map(|(id, _)| id).collect();
        for id in all {
            let residency = if keep.contains(&id) {
                report.local_modules += 1;
                Residency::Local
            } else {
                report.external_modules += 1;
                Residency::External
            };
            graph.set_residency(id, residency)?;
        }

        // Prune parameters owned elsewhere.
        let mut prune = Vec::new();
        for (pid, p) in graph.parameters() {
            let outside = match self.ownership.interval(p.name()) {
                Some(i) => !range.contains(&i),
                None => graph.module(p.owner())?.is_external(),
            };
            if outside {
                prune.push(pid);
            }
        }
        for pid in &prune {
            graph.prune_parameter(*pid);
        }
        report.pruned_parameters = prune.len();
        report.resident_parameters = graph.resident_parameters().count();
        report.resident_elements = graph.resident_elements();

        info!(
            "stage {stage}: intervals {}..{}, {} local / {} external modules, {} parameters resident ({} pruned)",
            range.start,
            range.end,
            report.local_modules,
            report.external_modules,
            report.resident_parameters,
            report.pruned_parameters
        );

        Ok(PartitionedStage {
            graph,
            stage,
            num_stages: self.assignment.num_stages(),
            intervals: range,
            receive_marker,
            send_marker,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, chain};
    use crate::{DryRunner, OwnershipResolver};
    use model_ir::{BoundaryError, ModuleKind, PassContext};
    use tensor_core::Tensor;

    /// Labels markers so tests can see which node went where.
    #[derive(Debug)]
    struct Tagged(&'static str);

    impl BoundaryNode for Tagged {
        fn describe(&self) -> &'static str {
            self.0
        }
        fn forward(&self, _: &PassContext, i: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
            Ok(i)
        }
        fn backward(&self, _: &PassContext, g: Vec<Tensor>) -> Result<Vec<Tensor>, BoundaryError> {
            Ok(g)
        }
    }

    struct TagFactory;

    impl BoundaryFactory for TagFactory {
        fn receiver(&self, _: &MarkerTrace) -> Arc<dyn BoundaryNode> {
            Arc::new(Tagged("receive"))
        }
        fn sender(&self, _: &MarkerTrace) -> Arc<dyn BoundaryNode> {
            Arc::new(Tagged("send"))
        }
    }

    fn label(graph: &ModelGraph<Validated>, name: &str) -> &'static str {
        let id = graph.find_module(name).unwrap();
        match graph.module(id).unwrap().kind() {
            ModuleKind::Boundary(b) => b.describe(),
            other => other.as_str(),
        }
    }

    fn setup() -> (ModelGraph<Validated>, TraceReport, ParameterOwnership) {
        let (graph, program) = chain(6, 2, &[0, 1, 2, 3, 4]);
        let trace = DryRunner::new(&graph)
            .trace(&program, &|rows| batch(rows, 2))
            .unwrap();
        let own = OwnershipResolver::new(&graph, &[])
            .resolve(&program, &batch(1, 2), &trace)
            .unwrap();
        (graph, trace, own)
    }

    #[test]
    fn test_middle_stage() {
        let (graph, trace, own) = setup();
        let assignment = StageAssignment::new(vec![0, 2, 4], 5).unwrap();
        let stage = ModelPartitioner::new(&trace, &own, &assignment)
            .partition(graph, 1, &TagFactory)
            .unwrap();
        let g = &stage.graph;
        assert_eq!(label(g, "net.cut1"), "receive");
        assert_eq!(label(g, "net.cut3"), "send");
        assert_eq!(label(g, "net.cut0"), "pass-through");
        assert_eq!(label(g, "net.cut4"), "pass-through");

        let external = |n: &str| g.module(g.find_module(n).unwrap()).unwrap().is_external();
        assert!(external("net.block0"));
        assert!(external("net.block1"));
        assert!(!external("net.block2"));
        assert!(!external("net.block3"));
        assert!(external("net.block4"));
        assert!(external("loss"));
        assert!(!external("net"));

        let resident: Vec<&str> = g.resident_parameters().map(|(_, p)| p.name()).collect();
        assert_eq!(
            resident,
            vec![
                "net.block2.weight",
                "net.block2.bias",
                "net.block3.weight",
                "net.block3.bias"
            ]
        );
        assert_eq!(stage.report.pruned_parameters, 8);
        assert_eq!(stage.receive_marker.as_ref().unwrap().index, 2);
        assert_eq!(stage.send_marker.as_ref().unwrap().index, 4);
        assert!(!stage.is_first());
        assert!(!stage.is_last());
    }

    #[test]
    fn test_endpoint_stages_have_one_live_marker() {
        let (graph, trace, own) = setup();
        let assignment = StageAssignment::new(vec![0, 3], 5).unwrap();
        let partitioner = ModelPartitioner::new(&trace, &own, &assignment);

        let first = partitioner.partition(graph.clone(), 0, &TagFactory).unwrap();
        assert!(first.receive_marker.is_none());
        assert_eq!(label(&first.graph, "net.cut2"), "send");
        assert!(first.is_first());

        let last = partitioner.partition(graph, 1, &TagFactory).unwrap();
        assert!(last.send_marker.is_none());
        assert_eq!(label(&last.graph, "net.cut2"), "receive");
        assert!(last.is_last());
        assert!(!last
            .graph
            .module(last.graph.find_module("loss").unwrap())
            .unwrap()
            .is_external());
    }

    #[test]
    fn test_single_stage_keeps_everything() {
        let (graph, trace, own) = setup();
        let total = graph.num_parameters();
        let assignment = StageAssignment::even(1, 5).unwrap();
        let stage = ModelPartitioner::new(&trace, &own, &assignment)
            .partition(graph, 0, &TagFactory)
            .unwrap();
        assert_eq!(stage.report.resident_parameters, total);
        assert_eq!(stage.report.external_modules, 0);
    }

    #[test]
    fn test_stage_out_of_range() {
        let (graph, trace, own) = setup();
        let assignment = StageAssignment::even(2, 5).unwrap();
        let err = ModelPartitioner::new(&trace, &own, &assignment)
            .partition(graph, 2, &TagFactory)
            .unwrap_err();
        assert!(matches!(err, PlannerError::InvalidAssignment(_)));
    }

    #[test]
    fn test_assignment_for_other_model_rejected() {
        let (graph, trace, own) = setup();
        let assignment = StageAssignment::even(2, 3).unwrap();
        assert!(ModelPartitioner::new(&trace, &own, &assignment)
            .partition(graph, 0, &TagFactory)
            .is_err());
    }
}

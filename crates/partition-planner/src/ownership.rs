// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Parameter-ownership resolution.
//!
//! A no-grad forward is run with an [`AccessRecorder`] that counts
//! boundary-marker calls. Every parameter a layer reads is tagged with
//! the current interval; the interval in which a parameter is read
//! decides which stage keeps it.
//!
//! # Rules
//!
//! - A parameter read in one interval is owned by that interval.
//! - A parameter read in several intervals is an
//!   [`PlannerError::OwnershipConflict`], unless it is a member of a
//!   declared [`SharedParameterGroup`], in which case it falls back to
//!   its structural interval.
//! - A parameter never read falls back to the interval of the module it
//!   is declared on. If that module was never visited either, the
//!   parameter has no owner and every stage keeps it.
//!
//! Shared groups are resolved separately by [`resolve_shared`]: each
//! member is mapped to its structural interval and then projected onto a
//! stage. Only pairs are supported.

use crate::{PlannerError, StageAssignment, TraceReport};
use model_ir::{
    Batch, Invoke, ModelError, ModelGraph, ModelProgram, ModuleId, ModuleKind, StageRng,
    Validated, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Parameters the user declared as copies of one logical weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedParameterGroup {
    /// Fully qualified parameter names.
    pub members: Vec<String>,
}

impl SharedParameterGroup {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, parameter: &str) -> bool {
        self.members.iter().any(|m| m == parameter)
    }
}

/// Mapping from parameter name to owning interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterOwnership {
    intervals: BTreeMap<String, usize>,
}

impl ParameterOwnership {
    /// Owning interval of a parameter, if it has one.
    pub fn interval(&self, parameter: &str) -> Option<usize> {
        self.intervals.get(parameter).copied()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.intervals.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Parameter elements owned by each of `num_intervals` intervals.
    pub fn elements_per_interval(
        &self,
        graph: &ModelGraph<Validated>,
        num_intervals: usize,
    ) -> Vec<usize> {
        let mut weights = vec![0; num_intervals];
        for (_, p) in graph.parameters() {
            if let Some(i) = self.interval(p.name()) {
                if let Some(w) = weights.get_mut(i) {
                    *w += p.num_elements();
                }
            }
        }
        weights
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, usize)]) -> Self {
        Self {
            intervals: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

// ── Recording invoker ──────────────────────────────────────────────

/// No-grad invoker tagging parameter reads with the current interval.
struct AccessRecorder<'g> {
    graph: &'g ModelGraph<Validated>,
    rng: StageRng,
    interval: usize,
    access: BTreeMap<usize, BTreeSet<usize>>,
}

impl Invoke for AccessRecorder<'_> {
    fn call(&mut self, module: ModuleId, inputs: Vec<Value>) -> Result<Vec<Value>, ModelError> {
        let node = self.graph.module(module)?;
        match node.kind() {
            ModuleKind::Layer(_) => {
                for pid in node.params() {
                    self.access
                        .entry(pid.index())
                        .or_default()
                        .insert(self.interval);
                }
                let tensors: Vec<_> = inputs.into_iter().map(Value::into_tensor).collect();
                let out = self.graph.run_layer(module, &tensors, &mut self.rng)?;
                Ok(out.outputs.into_iter().map(Value::constant).collect())
            }
            ModuleKind::Boundary(_) => {
                self.interval += 1;
                Ok(inputs)
            }
            ModuleKind::Container => Err(ModelError::NotCallable {
                module: node.name().to_string(),
                kind: "container",
            }),
        }
    }
}

/// Resolves which interval owns each parameter.
pub struct OwnershipResolver<'g> {
    graph: &'g ModelGraph<Validated>,
    shared: &'g [SharedParameterGroup],
    seed: u64,
}

impl<'g> OwnershipResolver<'g> {
    pub fn new(graph: &'g ModelGraph<Validated>, shared: &'g [SharedParameterGroup]) -> Self {
        Self {
            graph,
            shared,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn is_shared(&self, parameter: &str) -> bool {
        self.shared.iter().any(|g| g.contains(parameter))
    }

    /// Runs `program` once on `batch` and resolves ownership against `trace`.
    pub fn resolve(
        &self,
        program: &dyn ModelProgram,
        batch: &Batch,
        trace: &TraceReport,
    ) -> Result<ParameterOwnership, PlannerError> {
        let mut recorder = AccessRecorder {
            graph: self.graph,
            rng: StageRng::seeded(self.seed),
            interval: 0,
            access: BTreeMap::new(),
        };
        program.forward(&mut recorder, batch)?;
        if recorder.interval != trace.num_markers() {
            return Err(PlannerError::Trace(format!(
                "ownership pass crossed {} boundary marker(s), trace recorded {}",
                recorder.interval,
                trace.num_markers()
            )));
        }

        let mut ownership = ParameterOwnership::default();
        let mut unowned = 0usize;
        for (pid, p) in self.graph.parameters() {
            let structural = || {
                self.graph
                    .module(p.owner())
                    .ok()
                    .and_then(|m| trace.structural_interval(m.name()))
            };
            let resolved = match recorder.access.get(&pid.index()) {
                Some(set) if set.len() > 1 => {
                    if self.is_shared(p.name()) {
                        structural()
                    } else {
                        let seen: Vec<usize> = set.iter().copied().take(2).collect();
                        return Err(PlannerError::OwnershipConflict {
                            parameter: p.name().to_string(),
                            first: seen[0],
                            second: seen[1],
                        });
                    }
                }
                Some(set) => set.iter().next().copied(),
                None => structural(),
            };
            match resolved {
                Some(interval) => {
                    ownership.intervals.insert(p.name().to_string(), interval);
                }
                None => {
                    unowned += 1;
                    debug!("parameter '{}' has no owning interval; kept on every stage", p.name());
                }
            }
        }
        info!(
            "parameter ownership resolved: {} owned, {} unowned",
            ownership.len(),
            unowned
        );
        Ok(ownership)
    }
}

// ── Shared groups ──────────────────────────────────────────────────

/// Where the members of a shared pair live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPlacement {
    pub members: Vec<String>,
    pub intervals: Vec<usize>,
    pub stages: Vec<usize>,
}

impl SharedPlacement {
    /// `true` when the members sit on different stages.
    pub fn is_cross_stage(&self) -> bool {
        self.stages.windows(2).any(|w| w[0] != w[1])
    }

    /// Member held by `stage`, if any.
    pub fn member_on(&self, stage: usize) -> Option<&str> {
        self.stages
            .iter()
            .position(|s| *s == stage)
            .map(|i| self.members[i].as_str())
    }

    /// Earliest stage holding a member.
    pub fn first_stage(&self) -> usize {
        self.stages.iter().copied().min().unwrap_or(0)
    }

    /// Latest stage holding a member.
    pub fn last_stage(&self) -> usize {
        self.stages.iter().copied().max().unwrap_or(0)
    }
}

/// Maps every shared group onto stages.
///
/// Each member resolves to the interval of the module it is declared on
/// and then to the stage whose cut range contains that interval.
pub fn resolve_shared(
    groups: &[SharedParameterGroup],
    graph: &ModelGraph<Validated>,
    trace: &TraceReport,
    assignment: &StageAssignment,
) -> Result<Vec<SharedPlacement>, PlannerError> {
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let fail = |detail: String| PlannerError::SharedParameter {
            members: group.members.clone(),
            detail,
        };
        if group.members.len() != 2 {
            return Err(fail(format!(
                "only pairwise sharing is supported, group has {} member(s)",
                group.members.len()
            )));
        }
        let mut intervals = Vec::with_capacity(2);
        let mut stages = Vec::with_capacity(2);
        for member in &group.members {
            let pid = graph
                .find_parameter(member)
                .ok_or_else(|| fail(format!("unknown parameter '{member}'")))?;
            let owner = graph
                .parameter(pid)
                .map(|p| p.owner())
                .ok_or_else(|| fail(format!("unknown parameter '{member}'")))?;
            let module = graph.module(owner)?.name().to_string();
            let interval = trace.structural_interval(&module).ok_or_else(|| {
                fail(format!("'{member}' is declared on '{module}', which the trace never visited"))
            })?;
            let stage = assignment.stage_of_interval(interval).ok_or_else(|| {
                fail(format!("'{member}' resolves to interval {interval}, outside every stage"))
            })?;
            intervals.push(interval);
            stages.push(stage);
        }
        debug!("shared group {:?} -> stages {:?}", group.members, stages);
        out.push(SharedPlacement {
            members: group.members.clone(),
            intervals,
            stages,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, chain, tied, Chain};
    use crate::DryRunner;
    use model_ir::layers::{Affine, MseLoss};
    use std::sync::Arc;
    use tensor_core::{Shape, Tensor};

    fn traced(blocks: usize, cuts: &[usize]) -> (ModelGraph<Validated>, Chain, TraceReport) {
        let (graph, program) = chain(blocks, 2, cuts);
        let trace = DryRunner::new(&graph)
            .trace(&program, &|rows| batch(rows, 2))
            .unwrap();
        (graph, program, trace)
    }

    #[test]
    fn test_read_interval_owns_parameter() {
        let (graph, program, trace) = traced(4, &[0, 2]);
        let own = OwnershipResolver::new(&graph, &[])
            .resolve(&program, &batch(1, 2), &trace)
            .unwrap();
        assert_eq!(own.interval("net.block0.weight"), Some(0));
        assert_eq!(own.interval("net.block1.bias"), Some(1));
        assert_eq!(own.interval("net.block2.weight"), Some(1));
        assert_eq!(own.interval("net.block3.weight"), Some(2));
        assert_eq!(own.len(), 8);
    }

    #[test]
    fn test_cross_interval_read_is_conflict() {
        let (graph, program) = tied();
        let trace = DryRunner::new(&graph)
            .trace(&program, &|rows| batch(rows, 2))
            .unwrap();
        let err = OwnershipResolver::new(&graph, &[])
            .resolve(&program, &batch(1, 2), &trace)
            .unwrap_err();
        match err {
            PlannerError::OwnershipConflict {
                parameter,
                first,
                second,
            } => {
                assert_eq!(parameter, "head.weight");
                assert_eq!((first, second), (0, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_declared_shared_falls_back_to_structural() {
        let (graph, program) = tied();
        let trace = DryRunner::new(&graph)
            .trace(&program, &|rows| batch(rows, 2))
            .unwrap();
        let groups = vec![SharedParameterGroup::new(["head.weight", "tail.bias"])];
        let own = OwnershipResolver::new(&graph, &groups)
            .resolve(&program, &batch(1, 2), &trace)
            .unwrap();
        assert_eq!(own.interval("head.weight"), Some(0));
        assert_eq!(own.interval("tail.bias"), Some(1));
    }

    #[test]
    fn test_unvisited_owner_leaves_parameter_unowned() {
        let mut g = ModelGraph::new("dead");
        let fc = g.add_layer("fc", None, Arc::new(Affine::new(2)));
        g.add_parameter(fc, "weight", Tensor::ones(Shape::vector(2))).unwrap();
        g.add_parameter(fc, "bias", Tensor::zeros(Shape::vector(2))).unwrap();
        let unused = g.add_layer("unused", None, Arc::new(Affine::new(2)));
        g.add_parameter(unused, "weight", Tensor::ones(Shape::vector(2))).unwrap();
        g.add_parameter(unused, "bias", Tensor::zeros(Shape::vector(2))).unwrap();
        let loss = g.add_layer("loss", None, Arc::new(MseLoss));
        let graph = g.validate().unwrap();
        let program = Chain {
            steps: vec![fc],
            loss,
        };
        let trace = DryRunner::new(&graph)
            .trace(&program, &|rows| batch(rows, 2))
            .unwrap();
        let own = OwnershipResolver::new(&graph, &[])
            .resolve(&program, &batch(1, 2), &trace)
            .unwrap();
        assert_eq!(own.interval("fc.weight"), Some(0));
        assert_eq!(own.interval("unused.weight"), None);
    }

    #[test]
    fn test_elements_per_interval() {
        let (graph, _, _) = traced(3, &[0]);
        let own = ParameterOwnership::from_pairs(&[
            ("net.block0.weight", 0),
            ("net.block0.bias", 0),
            ("net.block1.weight", 1),
        ]);
        assert_eq!(own.elements_per_interval(&graph, 2), vec![4, 2]);
    }

    #[test]
    fn test_resolve_shared_pair_across_stages() {
        let (graph, _, trace) = traced(4, &[0, 2]);
        let assignment = StageAssignment::new(vec![0, 2], 2).unwrap();
        let groups = vec![SharedParameterGroup::new([
            "net.block0.weight",
            "net.block3.weight",
        ])];
        let placed = resolve_shared(&groups, &graph, &trace, &assignment).unwrap();
        assert_eq!(placed[0].intervals, vec![0, 2]);
        assert_eq!(placed[0].stages, vec![0, 1]);
        assert!(placed[0].is_cross_stage());
        assert_eq!(placed[0].member_on(1), Some("net.block3.weight"));
        assert_eq!(placed[0].first_stage(), 0);
        assert_eq!(placed[0].last_stage(), 1);
    }

    #[test]
    fn test_resolve_shared_rejects_chains() {
        let (graph, _, trace) = traced(4, &[0, 2]);
        let assignment = StageAssignment::new(vec![0, 1, 2], 2).unwrap();
        let groups = vec![SharedParameterGroup::new([
            "net.block0.weight",
            "net.block1.weight",
            "net.block3.weight",
        ])];
        let err = resolve_shared(&groups, &graph, &trace, &assignment).unwrap_err();
        assert!(matches!(err, PlannerError::SharedParameter { .. }));
    }

    #[test]
    fn test_resolve_shared_rejects_unknown_member() {
        let (graph, _, trace) = traced(2, &[0]);
        let assignment = StageAssignment::even(2, 1).unwrap();
        let groups = vec![SharedParameterGroup::new(["net.block0.weight", "nope"])];
        assert!(resolve_shared(&groups, &graph, &trace, &assignment).is_err());
    }
}

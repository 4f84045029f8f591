// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! On-disk cache of dry-run results.
//!
//! One process per host traces the model; the others wait on a
//! [`LocalBarrier`] and read what it wrote. The cache directory holds:
//!
//! | File | Contents |
//! |---|---|
//! | `visitation_order.json` | graph fingerprint, module order, call intervals |
//! | `boundary_shapes.json` | per marker: index, module, batch-of-one shapes |
//! | `batch_dims.json` | per marker: batch-dimension indices per tensor |
//! | `boundary_grads.json` | per marker: gradient flag per tensor |
//! | `param_ownership.json` | parameter name → owning interval |
//!
//! The fingerprint covers module names and kinds, parameter names and
//! shapes, the declared shared groups and the trace seed. A cache written
//! for a different model or a different sharing declaration is re-traced.

use crate::{
    BoundarySignature, DryRunner, MarkerTrace, OwnershipResolver, ParameterOwnership,
    PlannerError, SharedParameterGroup, TensorSignature, TraceReport,
};
use model_ir::{Batch, ModelGraph, ModelProgram, Validated};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tensor_core::Shape;
use tracing::{debug, info, warn};

const VISITATION_ORDER: &str = "visitation_order.json";
const BOUNDARY_SHAPES: &str = "boundary_shapes.json";
const BATCH_DIMS: &str = "batch_dims.json";
const BOUNDARY_GRADS: &str = "boundary_grads.json";
const PARAM_OWNERSHIP: &str = "param_ownership.json";

/// Host-local synchronisation point between processes sharing a cache.
pub trait LocalBarrier: Send + Sync {
    fn wait(&self);
}

impl LocalBarrier for std::sync::Barrier {
    fn wait(&self) {
        std::sync::Barrier::wait(self);
    }
}

/// Barrier for a host running a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBarrier;

impl LocalBarrier for NoBarrier {
    fn wait(&self) {}
}

// ── File records ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct VisitationFile {
    fingerprint: String,
    order: Vec<String>,
    call_intervals: BTreeMap<String, BTreeSet<usize>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerShapes {
    index: usize,
    module: String,
    shapes: Vec<Shape>,
}

/// Stable hash of a graph's structure.
pub fn graph_fingerprint(graph: &ModelGraph<Validated>) -> String {
    let mut h = DefaultHasher::new();
    graph.name.hash(&mut h);
    for (_, node) in graph.modules() {
        node.name().hash(&mut h);
        node.kind().as_str().hash(&mut h);
    }
    for (_, p) in graph.parameters() {
        p.name().hash(&mut h);
        p.shape().hash(&mut h);
    }
    format!("{:016x}", h.finish())
}

/// Dry-run artifacts rooted at one directory.
#[derive(Debug, Clone)]
pub struct DryRunCache {
    dir: PathBuf,
}

impl DryRunCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), PlannerError> {
        let path = self.dir.join(file);
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| PlannerError::Cache(format!("{}: {e}", path.display())))?;
        std::fs::write(&path, text)
            .map_err(|e| PlannerError::Cache(format!("{}: {e}", path.display())))
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<T, PlannerError> {
        let path = self.dir.join(file);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| PlannerError::Cache(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| PlannerError::Cache(format!("{}: {e}", path.display())))
    }

    /// Writes every artifact, creating the directory if needed.
    pub fn store(
        &self,
        fingerprint: &str,
        trace: &TraceReport,
        ownership: &ParameterOwnership,
    ) -> Result<(), PlannerError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| PlannerError::Cache(format!("{}: {e}", self.dir.display())))?;

        self.write_json(
            VISITATION_ORDER,
            &VisitationFile {
                fingerprint: fingerprint.to_string(),
                order: trace.visitation_order.clone(),
                call_intervals: trace.call_intervals.clone(),
            },
        )?;
        let shapes: Vec<MarkerShapes> = trace
            .markers
            .iter()
            .map(|m| MarkerShapes {
                index: m.index,
                module: m.module.clone(),
                shapes: m.signature.tensors.iter().map(|t| t.shape.clone()).collect(),
            })
            .collect();
        self.write_json(BOUNDARY_SHAPES, &shapes)?;
        let dims: Vec<&Vec<Vec<usize>>> =
            trace.markers.iter().map(|m| &m.signature.batch_dims).collect();
        self.write_json(BATCH_DIMS, &dims)?;
        let grads: Vec<Vec<bool>> = trace
            .markers
            .iter()
            .map(|m| m.signature.requires_grad())
            .collect();
        self.write_json(BOUNDARY_GRADS, &grads)?;
        self.write_json(PARAM_OWNERSHIP, ownership)?;

        info!("dry-run cache written to {}", self.dir.display());
        Ok(())
    }

    /// Reads the artifacts back.
    ///
    /// Returns `Ok(None)` when the cache is absent or was written for a
    /// graph with a different fingerprint.
    pub fn load(
        &self,
        fingerprint: &str,
    ) -> Result<Option<(TraceReport, ParameterOwnership)>, PlannerError> {
        if !self.dir.join(VISITATION_ORDER).exists() {
            debug!("no dry-run cache at {}", self.dir.display());
            return Ok(None);
        }
        let visit: VisitationFile = self.read_json(VISITATION_ORDER)?;
        if visit.fingerprint != fingerprint {
            warn!(
                "dry-run cache at {} belongs to another model ({} != {}); ignoring it",
                self.dir.display(),
                visit.fingerprint,
                fingerprint
            );
            return Ok(None);
        }
        let shapes: Vec<MarkerShapes> = self.read_json(BOUNDARY_SHAPES)?;
        let dims: Vec<Vec<Vec<usize>>> = self.read_json(BATCH_DIMS)?;
        let grads: Vec<Vec<bool>> = self.read_json(BOUNDARY_GRADS)?;
        let ownership: ParameterOwnership = self.read_json(PARAM_OWNERSHIP)?;

        if dims.len() != shapes.len() || grads.len() != shapes.len() {
            return Err(PlannerError::Cache(format!(
                "inconsistent marker counts: {} shapes, {} batch-dim sets, {} grad sets",
                shapes.len(),
                dims.len(),
                grads.len()
            )));
        }
        let mut markers = Vec::with_capacity(shapes.len());
        for ((s, d), g) in shapes.into_iter().zip(dims).zip(grads) {
            if d.len() != s.shapes.len() || g.len() != s.shapes.len() {
                return Err(PlannerError::Cache(format!(
                    "marker {} ('{}') has inconsistent tensor counts",
                    s.index, s.module
                )));
            }
            markers.push(MarkerTrace {
                index: s.index,
                module: s.module,
                signature: BoundarySignature {
                    tensors: s
                        .shapes
                        .into_iter()
                        .zip(g)
                        .map(|(shape, requires_grad)| TensorSignature {
                            shape,
                            requires_grad,
                        })
                        .collect(),
                    batch_dims: d,
                },
            });
        }
        let trace = TraceReport {
            visitation_order: visit.order,
            call_intervals: visit.call_intervals,
            markers,
        };
        info!(
            "dry-run cache loaded from {} ({} markers)",
            self.dir.display(),
            trace.num_markers()
        );
        Ok(Some((trace, ownership)))
    }

    /// Removes every artifact; missing files are ignored.
    pub fn clear(&self) -> Result<(), PlannerError> {
        for file in [
            VISITATION_ORDER,
            BOUNDARY_SHAPES,
            BATCH_DIMS,
            BOUNDARY_GRADS,
            PARAM_OWNERSHIP,
        ] {
            let path = self.dir.join(file);
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| PlannerError::Cache(format!("{}: {e}", path.display())))?;
            }
        }
        Ok(())
    }
}

// ── Coordinated dry run ────────────────────────────────────────────

/// Inputs to [`dry_run`].
pub struct DryRunRequest<'a> {
    pub graph: &'a ModelGraph<Validated>,
    pub program: &'a dyn ModelProgram,
    /// Builds a dummy batch with the given number of examples.
    pub make_batch: &'a dyn Fn(usize) -> Batch,
    pub shared: &'a [SharedParameterGroup],
    pub seed: u64,
}

impl DryRunRequest<'_> {
    /// Fingerprint of everything the cached artifacts depend on.
    ///
    /// Shared groups are compared as sets of sets, so member and group
    /// order do not matter.
    pub fn fingerprint(&self) -> String {
        let groups: BTreeSet<BTreeSet<&str>> = self
            .shared
            .iter()
            .map(|g| g.members.iter().map(String::as_str).collect())
            .collect();
        let mut h = DefaultHasher::new();
        graph_fingerprint(self.graph).hash(&mut h);
        groups.hash(&mut h);
        self.seed.hash(&mut h);
        format!("{:016x}", h.finish())
    }
}

/// Dry-run facts plus where they came from.
#[derive(Debug, Clone)]
pub struct DryRunOutcome {
    pub trace: TraceReport,
    pub ownership: ParameterOwnership,
    pub from_cache: bool,
}

/// Traces on local rank 0 and shares the result through `cache`.
///
/// Rank 0 reuses a valid cache when `reuse` is set, otherwise traces and
/// writes it. Every rank then waits on `barrier`; ranks other than 0
/// read the cache afterwards. Rank 0 always reaches the barrier, even
/// on failure, so its peers never wait forever.
pub fn dry_run(
    request: &DryRunRequest<'_>,
    cache: &DryRunCache,
    local_rank: usize,
    barrier: &dyn LocalBarrier,
    reuse: bool,
) -> Result<DryRunOutcome, PlannerError> {
    let fingerprint = request.fingerprint();
    if local_rank != 0 {
        barrier.wait();
        let (trace, ownership) = cache.load(&fingerprint)?.ok_or_else(|| {
            PlannerError::Cache(format!(
                "local rank {local_rank} found no usable cache at {} after the barrier",
                cache.dir().display()
            ))
        })?;
        return Ok(DryRunOutcome {
            trace,
            ownership,
            from_cache: true,
        });
    }

    let result = trace_or_reuse(request, cache, &fingerprint, reuse);
    barrier.wait();
    result
}

fn trace_or_reuse(
    request: &DryRunRequest<'_>,
    cache: &DryRunCache,
    fingerprint: &str,
    reuse: bool,
) -> Result<DryRunOutcome, PlannerError> {
    if reuse {
        if let Some((trace, ownership)) = cache.load(fingerprint)? {
            return Ok(DryRunOutcome {
                trace,
                ownership,
                from_cache: true,
            });
        }
    }
    let trace = DryRunner::new(request.graph)
        .with_seed(request.seed)
        .trace(request.program, request.make_batch)?;
    let ownership = OwnershipResolver::new(request.graph, request.shared)
        .with_seed(request.seed)
        .resolve(request.program, &(request.make_batch)(1), &trace)?;
    cache.store(fingerprint, &trace, &ownership)?;
    Ok(DryRunOutcome {
        trace,
        ownership,
        from_cache: false,
    })
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-stage pipeline engine with a type-state setup sequence.
//!
//! ```text
//! PipelineEngine<Idle>
//!     │  .partition()      dry run, ownership, assignment, stage graph
//!     ▼
//! PipelineEngine<Partitioned>
//!     │  .prepare()        schedule, gradient sync, shared mirroring
//!     ▼
//! PipelineEngine<Ready>
//!     │  .train_step()     one full schedule per batch
//!     ▼
//!   StepOutput
//! ```
//!
//! Each state transition consumes the old value and returns a new one,
//! making invalid state sequences a compile error. Every setup check
//! runs before the first step; a failed step leaves the engine unusable.

use crate::executor::StageExecutor;
use crate::{
    checkpoint, GradientSync, NoGradientSync, PipelineConfig, RankPlacement, RuntimeError,
    SharedMirror, StageBoundaryFactory, StageLinks, StageTopology, StepMetrics, TransferError,
    TransferStats, TransferWorkers, Transport, TransportAllReduce, WorkerPlan,
};
use model_ir::{Batch, ModelGraph, ModelProgram, ModuleId, StageRng, Validated};
use partition_planner::{
    dry_run, resolve_shared, BoundarySignature, DryRunCache, DryRunRequest, DryRunner,
    LocalBarrier, MarkerTrace, ModelPartitioner, NoBarrier, OwnershipResolver, PartitionedStage,
    SharedPlacement, StageAssignment, TraceReport,
};
use pipeline_scheduler::StageSchedule;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tensor_core::Tensor;
use tracing::{debug, info, warn};

// ── Inputs ─────────────────────────────────────────────────────

/// Builds a dummy batch with the given number of rows.
pub type BatchFactory = Arc<dyn Fn(usize) -> Batch + Send + Sync>;

/// The full, unpartitioned model as every process sees it.
#[derive(Clone)]
pub struct StageModel {
    pub graph: ModelGraph<Validated>,
    pub program: Arc<dyn ModelProgram>,
    pub make_batch: BatchFactory,
}

impl StageModel {
    pub fn new(
        graph: ModelGraph<Validated>,
        program: Arc<dyn ModelProgram>,
        make_batch: BatchFactory,
    ) -> Self {
        Self {
            graph,
            program,
            make_batch,
        }
    }
}

impl fmt::Debug for StageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageModel")
            .field("graph", &self.graph.summary())
            .finish_non_exhaustive()
    }
}

/// How this process reaches its peers.
#[derive(Clone)]
pub struct ProcessContext {
    pub transport: Arc<dyn Transport>,
    /// Index of this process among those sharing a host.
    pub local_rank: usize,
    /// Synchronises the processes of one host around the dry-run cache.
    pub barrier: Arc<dyn LocalBarrier>,
}

impl ProcessContext {
    /// A process alone on its host.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            local_rank: 0,
            barrier: Arc::new(NoBarrier),
        }
    }

    pub fn with_local(mut self, local_rank: usize, barrier: Arc<dyn LocalBarrier>) -> Self {
        self.local_rank = local_rank;
        self.barrier = barrier;
        self
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("rank", &self.rank())
            .field("local_rank", &self.local_rank)
            .finish()
    }
}

// ── Type-state markers ─────────────────────────────────────────

/// Engine is created; the model is not partitioned yet.
pub struct Idle {
    model: StageModel,
}

/// The local stage graph is built and its boundaries are wired.
pub struct Partitioned {
    program: Arc<dyn ModelProgram>,
    stage: PartitionedStage,
    links: Arc<StageLinks>,
    trace: TraceReport,
    assignment: StageAssignment,
    shared: Vec<SharedPlacement>,
    from_cache: bool,
}

/// Engine is ready to train.
pub struct Ready {
    program: Arc<dyn ModelProgram>,
    stage: PartitionedStage,
    links: Arc<StageLinks>,
    schedule: StageSchedule,
    mirror: SharedMirror,
    sync: Box<dyn GradientSync>,
    receive: Option<ModuleId>,
    send: Option<ModuleId>,
    rng: StageRng,
    step: u64,
    poisoned: bool,
}

/// Sealed trait for engine states.
pub trait EngineState {}
impl EngineState for Idle {}
impl EngineState for Partitioned {}
impl EngineState for Ready {}

// ── Step output ────────────────────────────────────────────────

/// The result of one training step on one stage.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Averaged loss over the microbatches; `None` except on the last stage.
    pub loss: Option<f32>,
    pub metrics: StepMetrics,
}

// ── Engine ─────────────────────────────────────────────────────

/// One process's share of a pipeline-parallel training job.
///
/// `S` is a type-state marker that enforces the setup ordering at
/// compile time.
///
/// # Example
/// ```no_run
/// use runtime::synthetic::ChainSpec;
/// use runtime::{LocalFabric, PipelineConfig, PipelineEngine, ProcessContext, StageModel};
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let spec = ChainSpec::new(2, 4);
/// let (graph, program) = spec.build()?;
/// let make = spec.clone();
/// let model = StageModel::new(graph, Arc::new(program), Arc::new(move |n| make.make_batch(n)));
/// let fabric = LocalFabric::new(1);
/// let mut engine = PipelineEngine::new(
///     PipelineConfig::default(),
///     model,
///     ProcessContext::new(fabric.endpoint(0)),
/// )?
/// .partition()?
/// .prepare()?;
/// let out = engine.train_step(&spec.make_batch(8))?;
/// println!("{}", out.metrics.summary());
/// # Ok(())
/// # }
/// ```
pub struct PipelineEngine<S: EngineState = Idle> {
    config: PipelineConfig,
    process: ProcessContext,
    topology: StageTopology,
    placement: RankPlacement,
    state: S,
}

// ── Idle → Partitioned ─────────────────────────────────────────

impl PipelineEngine<Idle> {
    /// Validates `config` and locates this process in the topology.
    pub fn new(
        config: PipelineConfig,
        model: StageModel,
        process: ProcessContext,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let topology = config.topology()?;
        let placement = topology.locate(process.rank())?;
        info!(
            "rank {}: stage {} of {}, replica {} of {}",
            placement.rank,
            placement.stage,
            placement.num_stages,
            placement.replica,
            placement.data_parallel_depth
        );
        Ok(Self {
            config,
            process,
            topology,
            placement,
            state: Idle { model },
        })
    }

    /// Traces the model, resolves ownership, assigns stages and builds
    /// the local stage graph.
    pub fn partition(self) -> Result<PipelineEngine<Partitioned>, RuntimeError> {
        let model = self.state.model;
        let shared_groups = self.config.shared_groups();
        let seed = self.config.rng_seed;
        let make_batch: &dyn Fn(usize) -> Batch = model.make_batch.as_ref();

        let (trace, ownership, from_cache) = match &self.config.cache_dir {
            Some(dir) => {
                let request = DryRunRequest {
                    graph: &model.graph,
                    program: model.program.as_ref(),
                    make_batch,
                    shared: &shared_groups,
                    seed,
                };
                let outcome = dry_run(
                    &request,
                    &DryRunCache::new(dir),
                    self.process.local_rank,
                    self.process.barrier.as_ref(),
                    self.config.from_cache,
                )?;
                (outcome.trace, outcome.ownership, outcome.from_cache)
            }
            None => {
                let trace = DryRunner::new(&model.graph)
                    .with_seed(seed)
                    .trace(model.program.as_ref(), make_batch)?;
                let ownership = OwnershipResolver::new(&model.graph, &shared_groups)
                    .with_seed(seed)
                    .resolve(model.program.as_ref(), &make_batch(1), &trace)?;
                (trace, ownership, false)
            }
        };

        let strategy = self.config.create_assignment_strategy()?;
        let assignment =
            strategy.assign(self.placement.num_stages, &trace, &ownership, &model.graph)?;
        info!(
            "assignment '{}': stage starts {:?} over {} marker(s)",
            strategy.name(),
            assignment.cuts(),
            trace.num_markers()
        );
        let shared = resolve_shared(&shared_groups, &model.graph, &trace, &assignment)?;

        let links = StageLinks::new();
        let factory = StageBoundaryFactory::new(Arc::clone(&links));
        let stage = ModelPartitioner::new(&trace, &ownership, &assignment).partition(
            model.graph,
            self.placement.stage,
            &factory,
        )?;
        info!(
            "stage {}: {} local module(s), {} resident parameter(s) ({} elements)",
            stage.stage,
            stage.report.local_modules,
            stage.report.resident_parameters,
            stage.report.resident_elements
        );

        Ok(PipelineEngine {
            config: self.config,
            process: self.process,
            topology: self.topology,
            placement: self.placement,
            state: Partitioned {
                program: model.program,
                stage,
                links,
                trace,
                assignment,
                shared,
                from_cache,
            },
        })
    }
}

// ── Partitioned → Ready ────────────────────────────────────────

impl PipelineEngine<Partitioned> {
    pub fn trace(&self) -> &TraceReport {
        &self.state.trace
    }

    pub fn assignment(&self) -> &StageAssignment {
        &self.state.assignment
    }

    pub fn stage(&self) -> &PartitionedStage {
        &self.state.stage
    }

    /// Shared pairs and the stages their members landed on.
    pub fn shared_placements(&self) -> &[SharedPlacement] {
        &self.state.shared
    }

    /// Whether the dry-run facts were read from the cache.
    pub fn from_cache(&self) -> bool {
        self.state.from_cache
    }

    /// Builds the configured schedule and transitions to `Ready`.
    pub fn prepare(self) -> Result<PipelineEngine<Ready>, RuntimeError> {
        let strategy = self.config.create_schedule_strategy()?;
        let schedule = strategy.schedule(
            self.placement.num_stages,
            self.config.num_microbatches(),
            self.placement.stage,
        )?;
        info!("schedule '{}' for stage {}: {schedule}", strategy.name(), self.placement.stage);
        self.prepare_with(schedule)
    }

    /// Transitions to `Ready` with an externally produced schedule.
    pub fn prepare_with(self, schedule: StageSchedule) -> Result<PipelineEngine<Ready>, RuntimeError> {
        let expected = (
            self.placement.stage,
            self.placement.num_stages,
            self.config.num_microbatches(),
        );
        let actual = (schedule.stage, schedule.num_stages, schedule.num_microbatches);
        if actual != expected {
            return Err(RuntimeError::Config(format!(
                "schedule is for (stage, stages, microbatches) = {actual:?}, expected {expected:?}"
            )));
        }
        schedule.validate()?;

        let Partitioned {
            program,
            stage,
            links,
            shared,
            ..
        } = self.state;
        let mirror = SharedMirror::new(&shared, &self.topology, &self.placement)?;
        let group = self.topology.stage_ranks(self.placement.stage).to_vec();
        let sync: Box<dyn GradientSync> = if group.len() > 1 {
            Box::new(TransportAllReduce::new(Arc::clone(&self.process.transport), group)?)
        } else {
            Box::new(NoGradientSync)
        };
        let find = |marker: &Option<MarkerTrace>| {
            marker
                .as_ref()
                .and_then(|m| stage.graph.find_module(&m.module))
        };
        let receive = find(&stage.receive_marker);
        let send = find(&stage.send_marker);
        let rng = StageRng::seeded(self.config.rng_seed.wrapping_add(self.placement.stage as u64));
        debug!(
            "stage {}: gradient sync '{}', {} mirrored parameter(s)",
            self.placement.stage,
            sync.name(),
            mirror.num_sends() + mirror.num_receives()
        );

        Ok(PipelineEngine {
            config: self.config,
            process: self.process,
            topology: self.topology,
            placement: self.placement,
            state: Ready {
                program,
                stage,
                links,
                schedule,
                mirror,
                sync,
                receive,
                send,
                rng,
                step: 0,
                poisoned: false,
            },
        })
    }
}

// ── Ready: train ───────────────────────────────────────────────

impl PipelineEngine<Ready> {
    pub fn schedule(&self) -> &StageSchedule {
        &self.state.schedule
    }

    pub fn stage(&self) -> &PartitionedStage {
        &self.state.stage
    }

    /// The local stage graph, with accumulated gradients after a step.
    pub fn graph(&self) -> &ModelGraph<Validated> {
        &self.state.stage.graph
    }

    /// Steps completed so far.
    pub fn steps(&self) -> u64 {
        self.state.step
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.poisoned
    }

    /// Current value of a resident parameter.
    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        let graph = self.graph();
        graph
            .find_parameter(name)
            .and_then(|pid| graph.parameter(pid))
            .and_then(|p| p.value())
    }

    /// Accumulated gradients of the resident parameters, by name.
    pub fn gradients(&self) -> Vec<(String, Tensor)> {
        self.graph()
            .resident_parameters()
            .filter_map(|(_, p)| p.grad().map(|g| (p.name().to_string(), g.clone())))
            .collect()
    }

    /// Runs one full schedule over `batch`, this replica's share of the
    /// global batch.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput, RuntimeError> {
        let stage_index = self.placement.stage;
        if self.state.poisoned {
            return Err(RuntimeError::Poisoned(stage_index));
        }
        let rows = batch.batch_size()?;
        if rows != self.config.replica_batch_size() {
            return Err(RuntimeError::Config(format!(
                "batch has {rows} row(s), each replica expects {}",
                self.config.replica_batch_size()
            )));
        }
        let micro = batch.scatter(self.config.micro_batch_size)?;
        let started = Instant::now();
        let mut metrics = StepMetrics::new(stage_index, self.state.step, micro.len());

        self.state.stage.graph.zero_grad();
        let mirrored = match self
            .state
            .mirror
            .sync(&mut self.state.stage.graph, self.process.transport.as_ref())
        {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.abort(e, None)),
        };

        let plan = WorkerPlan::new(
            &self.state.schedule,
            micro.iter().map(Batch::batch_size).collect::<Result<Vec<_>, _>>()?,
            self.neighbour(self.placement.prev_rank, &self.state.stage.receive_marker),
            self.neighbour(self.placement.next_rank, &self.state.stage.send_marker),
        );
        let workers = match TransferWorkers::spawn(&plan, &self.state.links, &self.process.transport) {
            Ok(workers) => workers,
            Err(e) => return Err(self.abort(e, None)),
        };

        let result = {
            let state = &mut self.state;
            let mut executor = StageExecutor {
                stage: stage_index,
                is_last: self.placement.is_last(),
                graph: &mut state.stage.graph,
                program: state.program.as_ref(),
                rng: &mut state.rng,
                links: state.links.as_ref(),
                sync: state.sync.as_ref(),
                receive: state.receive,
                send: state.send,
                loss_scale: self.config.loss_scale,
                profiling: self.config.enable_profiling,
            };
            executor.run(&state.schedule, &micro, &mut metrics)
        };

        let loss = match result {
            Ok(loss) => loss,
            Err(e) => return Err(self.abort(e, Some(workers))),
        };
        let mut transfer = workers.join();
        if let Some(e) = self.state.links.fault.error().cloned() {
            return Err(self.abort(RuntimeError::Transfer(e), None));
        }
        transfer.bytes_sent += mirrored;

        metrics.finalise(started.elapsed(), loss, transfer);
        self.state.step += 1;
        info!("{}", metrics.summary());
        Ok(StepOutput { loss, metrics })
    }

    /// Writes the stage's resident parameters into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf, RuntimeError> {
        checkpoint::save_stage(self.graph(), self.placement.stage, dir)
    }

    /// Restores the stage's resident parameters from `dir`.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<usize, RuntimeError> {
        checkpoint::load_stage(&mut self.state.stage.graph, self.placement.stage, dir)
    }

    // ── Private helpers ────────────────────────────────────────

    fn neighbour(
        &self,
        rank: Option<usize>,
        marker: &Option<MarkerTrace>,
    ) -> Option<(usize, BoundarySignature)> {
        rank.zip(marker.as_ref().map(|m| m.signature.clone()))
    }

    /// Tears the step down: wakes local waiters, aborts every other rank
    /// and joins the workers. The engine cannot be used afterwards.
    fn abort(&mut self, error: RuntimeError, workers: Option<TransferWorkers>) -> RuntimeError {
        let reason = format!("stage {}: {error}", self.placement.stage);
        self.state
            .links
            .fault
            .raise(TransferError::Aborted(reason.clone()));
        self.process.transport.abort(&reason);
        if let Some(workers) = workers {
            let _ = workers.join();
        }
        self.state.poisoned = true;
        warn!("{reason}");
        error
    }
}

// ── Shared accessors ───────────────────────────────────────────

impl<S: EngineState> PipelineEngine<S> {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn placement(&self) -> &RankPlacement {
        &self.placement
    }

    pub fn topology(&self) -> &StageTopology {
        &self.topology
    }
}

impl<S: EngineState> fmt::Debug for PipelineEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("state", &std::any::type_name::<S>())
            .field("rank", &self.placement.rank)
            .field("stage", &self.placement.stage)
            .field("schedule", &self.config.schedule)
            .finish()
    }
}

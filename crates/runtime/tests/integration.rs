// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: end-to-end pipeline training.
//!
//! These tests run every rank of a job as a thread over an in-process
//! fabric, proving that tracing, partitioning, scheduling and execution
//! compose into the same gradients as unpartitioned training.

use model_ir::layers::{Affine, MseLoss};
use model_ir::{
    Batch, Invoke, Layer, LayerGrads, LayerOutput, ModelError, ModelGraph, ModelProgram, ModuleId,
    StageRng, Value,
};
use runtime::synthetic::{make_batch, ChainSpec};
use runtime::{
    Channel, LocalFabric, LocalTransport, PipelineConfig, PipelineEngine, ProcessContext, Ready,
    RuntimeError, StageModel, StepOutput, TransferError, Transport,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tensor_core::{Shape, Tensor, TensorError};

// ── Helpers ────────────────────────────────────────────────────

fn model(spec: &ChainSpec) -> StageModel {
    let (graph, program) = spec.build().unwrap();
    let make = spec.clone();
    StageModel::new(graph, Arc::new(program), Arc::new(move |n| make.make_batch(n)))
}

fn config(stages: Vec<Vec<usize>>, batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        micro_batch_size: 2,
        stages,
        rng_seed: 5,
        ..Default::default()
    }
}

fn engine(
    config: &PipelineConfig,
    spec: &ChainSpec,
    transport: Arc<dyn Transport>,
) -> Result<PipelineEngine<Ready>, RuntimeError> {
    PipelineEngine::new(config.clone(), model(spec), ProcessContext::new(transport))?
        .partition()?
        .prepare()
}

/// What one rank observed after its last step.
struct RankRun {
    stage: usize,
    outputs: Vec<StepOutput>,
    gradients: Vec<(String, Tensor)>,
    parameters: BTreeMap<String, Tensor>,
    engine: PipelineEngine<Ready>,
}

/// Runs `steps` steps on every rank; `batch(rank)` is that rank's share.
fn run_job(
    config: &PipelineConfig,
    spec: &ChainSpec,
    steps: usize,
    batch: impl Fn(usize) -> Batch + Sync,
) -> Vec<RankRun> {
    let world = config.topology().unwrap().world_size();
    let fabric = LocalFabric::new(world);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let transport: Arc<dyn Transport> = fabric.endpoint(rank);
                let batch = &batch;
                scope.spawn(move || {
                    let mut engine = engine(config, spec, transport).unwrap();
                    let outputs = (0..steps)
                        .map(|_| engine.train_step(&batch(rank)).unwrap())
                        .collect();
                    let parameters = engine
                        .graph()
                        .resident_parameters()
                        .filter_map(|(_, p)| p.value().map(|v| (p.name().to_string(), v.clone())))
                        .collect();
                    RankRun {
                        stage: engine.placement().stage,
                        outputs,
                        gradients: engine.gradients(),
                        parameters,
                        engine,
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn gradients_by_name(runs: &[RankRun]) -> BTreeMap<String, Tensor> {
    runs.iter()
        .flat_map(|r| r.gradients.iter().cloned())
        .collect()
}

fn final_loss(runs: &[RankRun]) -> f32 {
    let last = runs.iter().max_by_key(|r| r.stage).unwrap();
    last.outputs.last().unwrap().loss.unwrap()
}

fn assert_close(name: &str, a: &Tensor, b: &Tensor) {
    assert_eq!(a.shape(), b.shape(), "{name}: shape");
    for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
        assert!((x - y).abs() < 1e-5, "{name}: {x} vs {y}");
    }
}

fn assert_same_gradients(a: &BTreeMap<String, Tensor>, b: &BTreeMap<String, Tensor>) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (name, grad) in a {
        assert_close(name, grad, &b[name]);
    }
}

/// Fails every send on one channel.
#[derive(Debug)]
struct FailingSends {
    inner: Arc<LocalTransport>,
    channel: Channel,
}

impl Transport for FailingSends {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn send(&self, dst: usize, channel: Channel, payload: &[Tensor]) -> Result<usize, TransferError> {
        if channel == self.channel {
            return Err(TransferError::Transport {
                peer: dst,
                detail: "injected send failure".into(),
            });
        }
        self.inner.send(dst, channel, payload)
    }

    fn recv(
        &self,
        src: usize,
        channel: Channel,
        shapes: &[Shape],
    ) -> Result<Vec<Tensor>, TransferError> {
        self.inner.recv(src, channel, shapes)
    }

    fn abort(&self, reason: &str) {
        self.inner.abort(reason)
    }
}

/// Identity layer that fails on inputs of exactly `rows` rows.
#[derive(Debug)]
struct FailsAtRows {
    rows: usize,
}

impl Layer for FailsAtRows {
    fn kind(&self) -> &'static str {
        "fails-at-rows"
    }

    fn num_params(&self) -> usize {
        0
    }

    fn forward(
        &self,
        _params: &[&Tensor],
        inputs: &[Tensor],
        _rng: &mut StageRng,
    ) -> Result<LayerOutput, TensorError> {
        if inputs.iter().any(|t| t.shape().dim(0) == Some(self.rows)) {
            return Err(TensorError::BatchDim {
                op: "fails-at-rows",
                detail: format!("refusing {} rows", self.rows),
            });
        }
        Ok(LayerOutput::new(inputs.to_vec()))
    }

    fn backward(
        &self,
        _params: &[&Tensor],
        _inputs: &[Tensor],
        _saved: &[Tensor],
        grad_outputs: &[Tensor],
    ) -> Result<LayerGrads, TensorError> {
        Ok(LayerGrads {
            inputs: grad_outputs.to_vec(),
            params: Vec::new(),
        })
    }
}

/// Runs `steps` in order, then the loss. With `require_flow`, every step
/// after `cut` must leave a value behind.
struct Scripted {
    steps: Vec<ModuleId>,
    cut: ModuleId,
    loss: ModuleId,
    require_flow: bool,
}

impl ModelProgram for Scripted {
    fn forward(&self, cx: &mut dyn Invoke, batch: &Batch) -> Result<Vec<Value>, ModelError> {
        let mut h = vec![Value::constant(batch.input("x")?.clone())];
        let mut past_cut = false;
        for &id in &self.steps {
            h = cx.call(id, h)?;
            if past_cut && self.require_flow && h.is_empty() {
                return Err(ModelError::InvalidGraph("no activation after the cut".into()));
            }
            past_cut |= id == self.cut;
        }
        h.push(Value::constant(batch.input("y")?.clone()));
        cx.call(self.loss, h)
    }
}

/// Two affine blocks of width 3 split by one marker. `fail_rows` places a
/// [`FailsAtRows`] on stage `.0`, tripping on `.1` rows.
fn scripted_model(fail_rows: Option<(usize, usize)>, require_flow: bool) -> StageModel {
    let mut g = ModelGraph::new("scripted");
    let root = g.add_container("net", None);
    let mut steps = Vec::new();
    let mut cut = None;
    for stage in 0..2 {
        let fc = g.add_layer(&format!("fc{stage}"), Some(root), Arc::new(Affine::new(3)));
        g.add_parameter(fc, "weight", Tensor::full(Shape::vector(3), 0.5 + stage as f32))
            .unwrap();
        g.add_parameter(fc, "bias", Tensor::full(Shape::vector(3), 0.1)).unwrap();
        steps.push(fc);
        if let Some((s, rows)) = fail_rows {
            if s == stage {
                steps.push(g.add_layer("trip", Some(root), Arc::new(FailsAtRows { rows })));
            }
        }
        if stage == 0 {
            let id = g.add_boundary("cut", Some(root));
            steps.push(id);
            cut = Some(id);
        }
    }
    let loss = g.add_layer("loss", None, Arc::new(MseLoss));
    let program = Scripted {
        steps,
        cut: cut.unwrap(),
        loss,
        require_flow,
    };
    StageModel::new(
        g.validate().unwrap(),
        Arc::new(program),
        Arc::new(|n| make_batch(n, 3)),
    )
}

/// One step on every rank of `config` with a freshly built model each.
fn run_scripted(
    config: &PipelineConfig,
    build: impl Fn() -> StageModel + Sync,
    fabric: &LocalFabric,
) -> Vec<(Result<StepOutput, RuntimeError>, Vec<(String, Tensor)>, bool)> {
    let world = config.topology().unwrap().world_size();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let build = &build;
                let process = ProcessContext::new(fabric.endpoint(rank));
                scope.spawn(move || {
                    let mut engine = PipelineEngine::new(config.clone(), build(), process)
                        .unwrap()
                        .partition()
                        .unwrap()
                        .prepare()
                        .unwrap();
                    let out = engine.train_step(&make_batch(config.batch_size, 3));
                    (out, engine.gradients(), engine.is_poisoned())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

// ── Pipeline equivalence ───────────────────────────────────────

#[test]
fn test_three_stages_match_single_stage() {
    let spec = ChainSpec::new(3, 4);
    let batch = |_| make_batch(8, 4);

    let single = run_job(&config(vec![vec![0]], 8), &spec, 1, batch);
    let piped = run_job(&config(vec![vec![0], vec![1], vec![2]], 8), &spec, 1, batch);

    assert!((final_loss(&single) - final_loss(&piped)).abs() < 1e-6);
    assert_same_gradients(&gradients_by_name(&single), &gradients_by_name(&piped));

    // Every parameter lives on exactly one stage.
    for run in &piped {
        assert_eq!(run.gradients.len(), 2, "stage {}", run.stage);
        let loss = run.outputs[0].loss;
        assert_eq!(loss.is_some(), run.stage == 2);
    }
}

#[test]
fn test_remainder_microbatch() {
    let spec = ChainSpec::new(2, 3);
    let batch = |_| make_batch(7, 3);

    let single = run_job(&config(vec![vec![0]], 7), &spec, 1, batch);
    let piped = run_job(&config(vec![vec![0], vec![1]], 7), &spec, 1, batch);

    for run in &piped {
        assert_eq!(run.outputs[0].metrics.num_microbatches, 4);
    }
    assert!((final_loss(&single) - final_loss(&piped)).abs() < 1e-6);
    assert_same_gradients(&gradients_by_name(&single), &gradients_by_name(&piped));
}

#[test]
fn test_fill_drain_matches_one_forward_one_backward() {
    let spec = ChainSpec::new(3, 4);
    let stages = vec![vec![0], vec![1], vec![2]];
    let one_f_one_b = run_job(&config(stages.clone(), 8), &spec, 1, |_| make_batch(8, 4));
    let fill_drain = PipelineConfig {
        schedule: "fill-drain".into(),
        ..config(stages, 8)
    };
    let fill_drain = run_job(&fill_drain, &spec, 1, |_| make_batch(8, 4));

    assert_same_gradients(
        &gradients_by_name(&one_f_one_b),
        &gradients_by_name(&fill_drain),
    );
}

#[test]
fn test_noise_model_is_reproducible() {
    let spec = ChainSpec::new(2, 4).with_noise(0.3);
    let cfg = config(vec![vec![0], vec![1]], 8);
    let a = run_job(&cfg, &spec, 2, |_| make_batch(8, 4));
    let b = run_job(&cfg, &spec, 2, |_| make_batch(8, 4));

    assert_eq!(final_loss(&a), final_loss(&b));
    assert_same_gradients(&gradients_by_name(&a), &gradients_by_name(&b));
}

// ── Data parallelism ───────────────────────────────────────────

#[test]
fn test_replicas_average_gradients() {
    let spec = ChainSpec::new(2, 4);
    let halves = make_batch(16, 4).scatter(8).unwrap();

    let replicated = run_job(&config(vec![vec![0, 1]], 16), &spec, 1, |rank| {
        halves[rank].clone()
    });
    let alone: Vec<_> = halves
        .iter()
        .map(|half| gradients_by_name(&run_job(&config(vec![vec![0]], 8), &spec, 1, |_| half.clone())))
        .collect();

    let [r0, r1] = [&replicated[0], &replicated[1]];
    assert_eq!(r0.gradients, r1.gradients);
    for (name, grad) in &r0.gradients {
        let mut expected = alone[0][name].clone();
        for (e, o) in expected.as_mut_slice().iter_mut().zip(alone[1][name].as_slice()) {
            *e = (*e + o) / 2.0;
        }
        assert_close(name, grad, &expected);
    }
    assert!(r0.outputs[0].metrics.sync_duration > Duration::ZERO);
}

#[test]
fn test_pipeline_with_replicas() {
    let spec = ChainSpec::new(2, 3);
    let cfg = config(vec![vec![0, 1], vec![2, 3]], 8);
    let runs = run_job(&cfg, &spec, 1, |_| make_batch(4, 3));

    let by_rank: Vec<_> = runs.iter().map(|r| r.stage).collect();
    assert_eq!(by_rank, vec![0, 0, 1, 1]);
    assert_eq!(runs[0].gradients, runs[1].gradients);
    assert_eq!(runs[2].gradients, runs[3].gradients);
}

// ── Shared parameters ──────────────────────────────────────────

#[test]
fn test_shared_parameter_mirrored_from_last_stage() {
    let spec = ChainSpec::new(2, 3);
    let cfg = PipelineConfig {
        shared_parameters: vec![vec![
            "net.block0.fc.bias".into(),
            "net.block1.fc.bias".into(),
        ]],
        ..config(vec![vec![0], vec![1]], 4)
    };
    let runs = run_job(&cfg, &spec, 1, |_| make_batch(4, 3));

    let first = &runs[0].parameters["net.block0.fc.bias"];
    let last = &runs[1].parameters["net.block1.fc.bias"];
    assert_eq!(first.as_slice(), last.as_slice());
    assert_eq!(last.as_slice(), &[0.01; 3]);
}

// ── Failures ───────────────────────────────────────────────────

#[test]
fn test_transfer_failure_aborts_every_rank() {
    let spec = ChainSpec::new(2, 3);
    let cfg = config(vec![vec![0], vec![1]], 8);
    let fabric = LocalFabric::new(2);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let transport: Arc<dyn Transport> = if rank == 0 {
                    Arc::new(FailingSends {
                        inner: fabric.endpoint(0),
                        channel: Channel::Activations,
                    })
                } else {
                    fabric.endpoint(rank)
                };
                let (cfg, spec) = (&cfg, &spec);
                scope.spawn(move || {
                    let mut engine = engine(cfg, spec, transport).unwrap();
                    let first = engine.train_step(&make_batch(8, 3));
                    let second = engine.train_step(&make_batch(8, 3));
                    (first, second, engine.is_poisoned())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(fabric.is_aborted());
    for (rank, (first, second, poisoned)) in results.into_iter().enumerate() {
        assert!(
            matches!(first, Err(RuntimeError::Transfer(_))),
            "rank {rank}: {first:?}"
        );
        assert!(matches!(second, Err(RuntimeError::Poisoned(_))));
        assert!(poisoned);
    }
}

#[test]
fn test_compute_failure_on_last_stage_aborts_every_rank() {
    let cfg = PipelineConfig {
        micro_batch_size: 3,
        ..config(vec![vec![0], vec![1]], 6)
    };
    let fabric = LocalFabric::new(2);
    let results = run_scripted(&cfg, || scripted_model(Some((1, 3)), false), &fabric);

    assert!(fabric.is_aborted());
    let (first, _, first_poisoned) = &results[0];
    assert!(first.is_err(), "stage 0: {first:?}");
    assert!(first_poisoned);
    let (last, _, last_poisoned) = &results[1];
    assert!(
        matches!(last, Err(RuntimeError::Compute { stage: 1, .. })),
        "stage 1: {last:?}"
    );
    assert!(last_poisoned);
}

#[test]
fn test_compute_failure_before_send_surfaces_on_first_stage() {
    let cfg = PipelineConfig {
        micro_batch_size: 3,
        ..config(vec![vec![0], vec![1]], 6)
    };
    let fabric = LocalFabric::new(2);
    let results = run_scripted(&cfg, || scripted_model(Some((0, 3)), false), &fabric);

    assert!(matches!(
        results[0].0,
        Err(RuntimeError::Compute { stage: 0, .. })
    ));
    assert!(results.iter().all(|(out, _, poisoned)| out.is_err() && *poisoned));
}

#[test]
fn test_error_after_send_masked_on_first_stage() {
    let cfg = config(vec![vec![0], vec![1]], 8);
    let fabric = LocalFabric::new(2);
    let piped = run_scripted(&cfg, || scripted_model(None, true), &fabric);
    let single = run_scripted(
        &config(vec![vec![0]], 8),
        || scripted_model(None, true),
        &LocalFabric::new(1),
    );

    assert!(!fabric.is_aborted());
    let mut piped_grads = BTreeMap::new();
    for (out, grads, poisoned) in &piped {
        assert!(out.is_ok(), "{out:?}");
        assert!(!poisoned);
        piped_grads.extend(grads.iter().cloned());
    }
    let (single_out, single_grads, _) = &single[0];
    let single_grads: BTreeMap<_, _> = single_grads.iter().cloned().collect();
    assert_same_gradients(&single_grads, &piped_grads);

    let piped_loss = piped[1].0.as_ref().unwrap().loss.unwrap();
    let single_loss = single_out.as_ref().unwrap().loss.unwrap();
    assert!((piped_loss - single_loss).abs() < 1e-6);
}

// ── Checkpoints and caching ────────────────────────────────────

#[test]
fn test_checkpoint_round_trip() {
    let spec = ChainSpec::new(2, 3);
    let cfg = PipelineConfig {
        shared_parameters: vec![vec![
            "net.block0.fc.bias".into(),
            "net.block1.fc.bias".into(),
        ]],
        ..config(vec![vec![0], vec![1]], 4)
    };
    let dir = tempfile::tempdir().unwrap();
    let runs = run_job(&cfg, &spec, 1, |_| make_batch(4, 3));
    for run in &runs {
        let path = run.engine.save_checkpoint(dir.path()).unwrap();
        assert!(path.ends_with(format!("stage-{}.safetensors", run.stage)));
    }

    // A fresh stage 0 still has its own initial bias until it loads.
    let fabric = LocalFabric::new(2);
    let mut fresh = engine(&cfg, &spec, fabric.endpoint(0)).unwrap();
    assert_eq!(fresh.parameter("net.block0.fc.bias").unwrap().as_slice(), &[0.0; 3]);
    assert_eq!(fresh.load_checkpoint(dir.path()).unwrap(), 2);
    for (name, value) in &runs[0].parameters {
        assert_eq!(fresh.parameter(name).unwrap().as_slice(), value.as_slice());
    }
}

#[test]
fn test_checkpoint_from_other_stage_rejected() {
    let spec = ChainSpec::new(2, 3);
    let cfg = config(vec![vec![0], vec![1]], 4);
    let dir = tempfile::tempdir().unwrap();
    let fabric = LocalFabric::new(2);

    let mut stage0 = engine(&cfg, &spec, fabric.endpoint(0)).unwrap();
    assert!(stage0.load_checkpoint(dir.path()).is_err());
    let stage1 = engine(&cfg, &spec, fabric.endpoint(1)).unwrap();
    let written = stage1.save_checkpoint(dir.path()).unwrap();
    std::fs::rename(written, runtime::checkpoint_path(dir.path(), 0)).unwrap();
    assert!(matches!(
        stage0.load_checkpoint(dir.path()),
        Err(RuntimeError::Checkpoint { .. })
    ));
}

#[test]
fn test_dry_run_cache_shared_by_local_ranks() {
    let spec = ChainSpec::new(2, 3);
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        ..config(vec![vec![0], vec![1]], 4)
    };
    let fabric = LocalFabric::new(2);
    let barrier = Arc::new(Barrier::new(2));

    let cached: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let process = ProcessContext::new(fabric.endpoint(rank))
                    .with_local(rank, barrier.clone());
                let (cfg, spec) = (&cfg, &spec);
                scope.spawn(move || {
                    PipelineEngine::new(cfg.clone(), model(spec), process)
                        .unwrap()
                        .partition()
                        .unwrap()
                        .from_cache()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(cached, vec![false, true]);
}

// ── Async driver ───────────────────────────────────────────────

#[tokio::test]
async fn test_ranks_on_blocking_tasks() {
    let spec = ChainSpec::new(2, 4);
    let cfg = config(vec![vec![0], vec![1]], 8);
    let fabric = LocalFabric::new(2);

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let (cfg, spec) = (cfg.clone(), spec.clone());
            let transport: Arc<dyn Transport> = fabric.endpoint(rank);
            tokio::task::spawn_blocking(move || {
                let mut engine = engine(&cfg, &spec, transport)?;
                engine.train_step(&make_batch(8, 4))
            })
        })
        .collect();

    let mut losses = Vec::new();
    for handle in handles {
        let out = handle.await.unwrap().unwrap();
        losses.push(out.loss);
        assert!(out.metrics.total_duration.as_nanos() > 0);
    }
    assert!(losses[0].is_none());
    assert!(losses[1].unwrap() > 0.0);
}

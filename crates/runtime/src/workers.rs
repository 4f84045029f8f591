// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Background transfer workers.
//!
//! Each step spawns up to four threads per stage: an activation receiver
//! and a gradient sender towards the previous rank, an activation sender
//! and a gradient receiver towards the next rank. Every worker knows from
//! the schedule exactly how many payloads it moves, so all of them exit
//! on their own once the step's schedule is done.
//!
//! Receivers post one receive per matching schedule entry, sized from the
//! traced signature for that microbatch's row count. A failing worker
//! raises the stage's fault and aborts the transport, which unblocks
//! every other worker and every other rank.

use crate::{Channel, RuntimeError, StageLinks, TransferError, TransferQueue, Transport};
use partition_planner::BoundarySignature;
use pipeline_scheduler::StageSchedule;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Traffic moved by one step's workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub payloads: usize,
}

impl TransferStats {
    fn merge(&mut self, other: TransferStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.payloads += other.payloads;
    }
}

/// What the workers of one stage need to know about a step.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub stage: usize,
    /// Microbatch of every forward entry, in schedule order.
    pub activations: Vec<usize>,
    /// Microbatch of every backward-class entry, in schedule order.
    pub gradients: Vec<usize>,
    /// Rows of each microbatch.
    pub rows: Vec<usize>,
    pub prev: Option<(usize, BoundarySignature)>,
    pub next: Option<(usize, BoundarySignature)>,
}

impl WorkerPlan {
    /// Derives the plan from the stage's schedule.
    pub fn new(
        schedule: &StageSchedule,
        rows: Vec<usize>,
        prev: Option<(usize, BoundarySignature)>,
        next: Option<(usize, BoundarySignature)>,
    ) -> Self {
        let of = |backward: bool| {
            schedule
                .iter()
                .filter(|e| e.kind.is_backward() == backward)
                .map(|e| e.microbatch)
                .collect::<Vec<_>>()
        };
        Self {
            stage: schedule.stage,
            activations: of(false),
            gradients: of(true),
            rows,
            prev,
            next,
        }
    }
}

/// Handles of the running workers of one step.
#[derive(Debug)]
pub struct TransferWorkers {
    handles: Vec<(String, JoinHandle<TransferStats>)>,
    links: Arc<StageLinks>,
}

/// Starts one named worker thread.
type Launch<'a> = &'a dyn Fn(String, WorkerBody) -> std::io::Result<JoinHandle<TransferStats>>;
type WorkerBody = Box<dyn FnOnce() -> TransferStats + Send>;

fn launch_thread(name: String, body: WorkerBody) -> std::io::Result<JoinHandle<TransferStats>> {
    thread::Builder::new().name(name).spawn(body)
}

impl TransferWorkers {
    /// Starts the workers `plan` calls for.
    ///
    /// If a worker cannot be started, the ones already running are
    /// stopped through the fault channel and joined before the error is
    /// returned.
    pub fn spawn(
        plan: &WorkerPlan,
        links: &Arc<StageLinks>,
        transport: &Arc<dyn Transport>,
    ) -> Result<Self, RuntimeError> {
        Self::spawn_with(plan, links, transport, &launch_thread)
    }

    fn spawn_with(
        plan: &WorkerPlan,
        links: &Arc<StageLinks>,
        transport: &Arc<dyn Transport>,
        launch: Launch<'_>,
    ) -> Result<Self, RuntimeError> {
        let mut workers = Self {
            handles: Vec::new(),
            links: Arc::clone(links),
        };
        if let Err(e) = workers.start_all(plan, links, transport, launch) {
            fail(links, transport.as_ref(), TransferError::Aborted(e.to_string()));
            workers.join();
            return Err(e);
        }
        debug!("stage {}: {} transfer worker(s) started", plan.stage, workers.handles.len());
        Ok(workers)
    }

    fn start_all(
        &mut self,
        plan: &WorkerPlan,
        links: &Arc<StageLinks>,
        transport: &Arc<dyn Transport>,
        launch: Launch<'_>,
    ) -> Result<(), RuntimeError> {
        let s = plan.stage;
        if let Some((prev, sig)) = &plan.prev {
            let job = ReceiveJob {
                peer: *prev,
                channel: Channel::Activations,
                shapes_for: sig.clone(),
                microbatches: plan.activations.clone(),
                rows: plan.rows.clone(),
                into: links.acts_in.clone(),
            };
            self.start(format!("stage{s}-acts-recv"), transport, launch, move |l, t| job.run(l, t))?;
            if sig.carries_grad() {
                let job = SendJob {
                    peer: *prev,
                    channel: Channel::Gradients,
                    count: plan.gradients.len(),
                    from: links.grads_out.clone(),
                };
                self.start(format!("stage{s}-grads-send"), transport, launch, move |l, t| job.run(l, t))?;
            }
        }
        if let Some((next, sig)) = &plan.next {
            let job = SendJob {
                peer: *next,
                channel: Channel::Activations,
                count: plan.activations.len(),
                from: links.acts_out.clone(),
            };
            self.start(format!("stage{s}-acts-send"), transport, launch, move |l, t| job.run(l, t))?;
            if sig.carries_grad() {
                let job = ReceiveJob {
                    peer: *next,
                    channel: Channel::Gradients,
                    shapes_for: sig.clone(),
                    microbatches: plan.gradients.clone(),
                    rows: plan.rows.clone(),
                    into: links.grads_in.clone(),
                };
                self.start(format!("stage{s}-grads-recv"), transport, launch, move |l, t| job.run(l, t))?;
            }
        }
        Ok(())
    }

    fn start<F>(
        &mut self,
        name: String,
        transport: &Arc<dyn Transport>,
        launch: Launch<'_>,
        body: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnOnce(&StageLinks, &dyn Transport) -> TransferStats + Send + 'static,
    {
        let links = Arc::clone(&self.links);
        let transport = Arc::clone(transport);
        let handle = launch(name.clone(), Box::new(move || body(&links, transport.as_ref())))
            .map_err(|e| TransferError::Aborted(format!("cannot spawn '{name}': {e}")))?;
        self.handles.push((name, handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker and sums their traffic.
    pub fn join(self) -> TransferStats {
        let mut total = TransferStats::default();
        for (name, handle) in self.handles {
            match handle.join() {
                Ok(stats) => total.merge(stats),
                Err(_) => {
                    self.links
                        .fault
                        .raise(TransferError::Aborted(format!("worker '{name}' panicked")));
                }
            }
        }
        total
    }
}

fn fail(links: &StageLinks, transport: &dyn Transport, error: TransferError) {
    if links.fault.raise(error.clone()) {
        warn!("rank {}: transfer worker failed: {error}", transport.rank());
    }
    transport.abort(&error.to_string());
}

// ── Worker bodies ──────────────────────────────────────────────

struct ReceiveJob {
    peer: usize,
    channel: Channel,
    shapes_for: BoundarySignature,
    microbatches: Vec<usize>,
    rows: Vec<usize>,
    into: TransferQueue,
}

impl ReceiveJob {
    fn run(self, links: &StageLinks, transport: &dyn Transport) -> TransferStats {
        let mut stats = TransferStats::default();
        for mb in self.microbatches {
            if links.fault.is_raised() {
                break;
            }
            let Some(&rows) = self.rows.get(mb) else {
                fail(
                    links,
                    transport,
                    TransferError::Aborted(format!("no row count for microbatch {mb}")),
                );
                break;
            };
            let shapes = self.shapes_for.shapes_for(rows);
            let payload = match transport.recv(self.peer, self.channel, &shapes) {
                Ok(p) => p,
                Err(e) => {
                    fail(links, transport, e);
                    break;
                }
            };
            stats.bytes_received += crate::transport::payload_bytes(&payload);
            stats.payloads += 1;
            debug!(
                "rank {}: received {:?} for microbatch {mb} from {}",
                transport.rank(),
                self.channel,
                self.peer
            );
            if let Err(e) = self.into.push(payload) {
                fail(links, transport, e);
                break;
            }
        }
        stats
    }
}

struct SendJob {
    peer: usize,
    channel: Channel,
    count: usize,
    from: TransferQueue,
}

impl SendJob {
    fn run(self, links: &StageLinks, transport: &dyn Transport) -> TransferStats {
        let mut stats = TransferStats::default();
        for _ in 0..self.count {
            let Ok(payload) = links.fault.wait_on(self.from.receiver()) else {
                break;
            };
            match transport.send(self.peer, self.channel, &payload) {
                Ok(bytes) => {
                    stats.bytes_sent += bytes;
                    stats.payloads += 1;
                    debug!(
                        "rank {}: sent {:?} ({bytes} bytes) to {}",
                        transport.rank(),
                        self.channel,
                        self.peer
                    );
                }
                Err(e) => {
                    fail(links, transport, e);
                    break;
                }
            }
        }
        stats
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Training-step profiling metrics.
//!
//! [`StepMetrics`] collects per-task compute and queue-wait time plus the
//! traffic moved by the transfer workers. Wait time is the share of a
//! task the compute thread spent blocked on its own queues, which is the
//! pipeline bubble as seen from one stage.

use crate::TransferStats;
use std::time::Duration;

/// Metrics for one scheduled task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskMetrics {
    /// Task letter: `F`, `R` or `B`.
    pub kind: &'static str,
    pub microbatch: usize,
    /// Time not spent waiting on queues.
    pub compute_duration: Duration,
    /// Time blocked on activation or gradient queues.
    pub wait_duration: Duration,
}

/// Aggregate metrics for one training step on one stage.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepMetrics {
    pub stage: usize,
    pub step: u64,
    pub num_microbatches: usize,
    /// Wall-clock time of the whole step.
    pub total_duration: Duration,
    pub total_compute_duration: Duration,
    pub total_wait_duration: Duration,
    /// Time spent in data-parallel gradient synchronisation.
    pub sync_duration: Duration,
    /// Averaged loss; only the last stage computes one.
    pub loss: Option<f32>,
    pub transfer: TransferStats,
    /// Per-task records, empty when profiling is disabled.
    pub tasks: Vec<TaskMetrics>,
}

impl StepMetrics {
    /// Creates an empty metrics container.
    pub fn new(stage: usize, step: u64, num_microbatches: usize) -> Self {
        Self {
            stage,
            step,
            num_microbatches,
            total_duration: Duration::ZERO,
            total_compute_duration: Duration::ZERO,
            total_wait_duration: Duration::ZERO,
            sync_duration: Duration::ZERO,
            loss: None,
            transfer: TransferStats::default(),
            tasks: Vec::new(),
        }
    }

    /// Records one task. `elapsed` includes the wait.
    pub fn record_task(
        &mut self,
        kind: &'static str,
        microbatch: usize,
        elapsed: Duration,
        wait: Duration,
        keep: bool,
    ) {
        let compute = elapsed.saturating_sub(wait);
        self.total_compute_duration += compute;
        self.total_wait_duration += wait;
        if keep {
            self.tasks.push(TaskMetrics {
                kind,
                microbatch,
                compute_duration: compute,
                wait_duration: wait,
            });
        }
    }

    pub fn record_sync(&mut self, elapsed: Duration) {
        self.sync_duration += elapsed;
    }

    /// Finalises metrics with the wall-clock time, loss and traffic.
    pub fn finalise(&mut self, total: Duration, loss: Option<f32>, transfer: TransferStats) {
        self.total_duration = total;
        self.loss = loss;
        self.transfer = transfer;
    }

    /// Fraction of the step the compute thread spent waiting.
    pub fn wait_fraction(&self) -> f64 {
        let secs = self.total_duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.total_wait_duration.as_secs_f64() / secs).min(1.0)
    }

    /// Returns a human-readable summary suitable for CLI output.
    pub fn summary(&self) -> String {
        let loss = self
            .loss
            .map_or_else(|| "-".to_string(), |l| format!("{l:.6}"));
        format!(
            "Stage {} step {}: {:.2}ms total, {} microbatches, \
             {:.2}ms compute, {:.2}ms waiting ({:.0}%), {:.2}ms sync, \
             {} B sent, {} B received, loss {}",
            self.stage,
            self.step,
            self.total_duration.as_secs_f64() * 1000.0,
            self.num_microbatches,
            self.total_compute_duration.as_secs_f64() * 1000.0,
            self.total_wait_duration.as_secs_f64() * 1000.0,
            self.wait_fraction() * 100.0,
            self.sync_duration.as_secs_f64() * 1000.0,
            self.transfer.bytes_sent,
            self.transfer.bytes_received,
            loss,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_metrics() {
        let m = StepMetrics::new(1, 0, 4);
        assert_eq!(m.wait_fraction(), 0.0);
        assert_eq!(m.num_microbatches, 4);
        assert!(m.tasks.is_empty());
    }

    #[test]
    fn test_record_and_finalise() {
        let mut m = StepMetrics::new(0, 3, 2);
        m.record_task("F", 0, Duration::from_millis(10), Duration::from_millis(4), true);
        m.record_task("R", 0, Duration::from_millis(8), Duration::from_millis(6), true);
        m.record_task("F", 1, Duration::from_millis(5), Duration::ZERO, false);
        m.finalise(
            Duration::from_millis(40),
            Some(0.5),
            TransferStats {
                bytes_sent: 64,
                bytes_received: 32,
                payloads: 3,
            },
        );

        assert_eq!(m.tasks.len(), 2);
        assert_eq!(m.total_compute_duration, Duration::from_millis(13));
        assert_eq!(m.total_wait_duration, Duration::from_millis(10));
        assert!((m.wait_fraction() - 0.25).abs() < 1e-9);
        assert_eq!(m.transfer.bytes_sent, 64);
    }

    #[test]
    fn test_wait_longer_than_elapsed_is_clamped() {
        let mut m = StepMetrics::new(0, 0, 1);
        m.record_task("B", 0, Duration::from_millis(1), Duration::from_millis(2), true);
        assert_eq!(m.tasks[0].compute_duration, Duration::ZERO);
    }

    #[test]
    fn test_summary_format() {
        let mut m = StepMetrics::new(2, 7, 3);
        m.finalise(Duration::from_millis(10), Some(1.25), TransferStats::default());
        let s = m.summary();
        assert!(s.contains("Stage 2 step 7"));
        assert!(s.contains("3 microbatches"));
        assert!(s.contains("loss 1.250000"));

        let mut first = StepMetrics::new(0, 7, 3);
        first.finalise(Duration::from_millis(10), None, TransferStats::default());
        assert!(first.summary().ends_with("loss -"));
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stage-local random number generation with explicit snapshots.
//!
//! A no-grad forward that will be recomputed later captures an
//! [`RngSnapshot`] first. Restoring the snapshot before the recompute makes
//! every stochastic layer draw exactly the same values as the first pass.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The random engine owned by one stage's compute thread.
#[derive(Debug, Clone)]
pub struct StageRng {
    inner: StdRng,
}

/// Opaque, restorable copy of a [`StageRng`] state.
#[derive(Debug, Clone)]
pub struct RngSnapshot(StdRng);

impl StageRng {
    /// Creates a deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot(self.inner.clone())
    }

    /// Rewinds to a previously captured state.
    pub fn restore(&mut self, snapshot: RngSnapshot) {
        self.inner = snapshot.0;
    }

    /// Draws a value uniformly from `[0, 1)`.
    pub fn uniform(&mut self) -> f32 {
        self.inner.random::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_replays_draws() {
        let mut rng = StageRng::seeded(7);
        rng.uniform();
        let snap = rng.snapshot();
        let first: Vec<f32> = (0..5).map(|_| rng.uniform()).collect();
        rng.restore(snap);
        let replay: Vec<f32> = (0..5).map(|_| rng.uniform()).collect();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_draws_in_unit_interval() {
        let mut rng = StageRng::seeded(1);
        assert!((0..100).map(|_| rng.uniform()).all(|v| (0.0..1.0).contains(&v)));
    }
}

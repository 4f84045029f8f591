// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pipeline configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! batch_size = 8
//! micro_batch_size = 2
//! schedule = "1f1b"
//! assignment = "even"
//! stages = [[0, 3], [1, 4], [2, 5]]
//! shared_parameters = [["net.block0.fc.weight", "net.block5.fc.weight"]]
//! cache_dir = "/tmp/stagepipe-cache"
//! from_cache = true
//! loss_scale = 1.0
//! rng_seed = 42
//! enable_profiling = true
//! ```
//!
//! `stages[s]` lists the global ranks hosting replicas of stage `s`; the
//! i-th entry of every stage forms data-parallel replica `i`.

use crate::{RuntimeError, StageTopology};
use partition_planner::{
    AssignmentStrategy, BalancedParameters, EvenCuts, ExplicitCuts, SharedParameterGroup,
};
use pipeline_scheduler::ScheduleStrategy;
use std::path::{Path, PathBuf};

/// Configuration for one pipeline-parallel training job.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Global batch size, summed over data-parallel replicas.
    pub batch_size: usize,
    /// Rows per microbatch; the last microbatch may be smaller.
    pub micro_batch_size: usize,
    /// Schedule strategy name: `"1f1b"` or `"fill-drain"`.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Assignment strategy name: `"even"` or `"balanced"`.
    #[serde(default = "default_assignment")]
    pub assignment: String,
    /// Explicit first marker interval of every stage; overrides `assignment`.
    #[serde(default)]
    pub stage_to_cut: Option<Vec<usize>>,
    /// Ranks hosting each stage.
    pub stages: Vec<Vec<usize>>,
    /// Groups of parameter names that hold the same logical weight.
    #[serde(default)]
    pub shared_parameters: Vec<Vec<String>>,
    /// Directory for the dry-run cache; in-memory tracing when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Reuse a valid dry-run cache instead of re-tracing.
    #[serde(default = "default_true")]
    pub from_cache: bool,
    /// Multiplier applied to the loss gradient on the final stage.
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f32,
    /// Seed of every stage's random engine.
    #[serde(default)]
    pub rng_seed: u64,
    /// Whether to record per-task timings.
    #[serde(default = "default_true")]
    pub enable_profiling: bool,
}

fn default_true() -> bool {
    true
}

fn default_schedule() -> String {
    "1f1b".to_string()
}

fn default_assignment() -> String {
    "even".to_string()
}

fn default_loss_scale() -> f32 {
    1.0
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, RuntimeError> {
        toml::from_str(toml_str)
            .map_err(|e| RuntimeError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, RuntimeError> {
        toml::to_string_pretty(self)
            .map_err(|e| RuntimeError::Config(format!("TOML serialise error: {e}")))
    }

    /// Number of pipeline stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Replicas per stage.
    pub fn data_parallel_depth(&self) -> usize {
        self.stages.first().map_or(0, Vec::len)
    }

    /// Rows each replica trains on per step.
    pub fn replica_batch_size(&self) -> usize {
        match self.data_parallel_depth() {
            0 => 0,
            dp => self.batch_size / dp,
        }
    }

    /// Microbatches per step, counting a smaller remainder microbatch.
    pub fn num_microbatches(&self) -> usize {
        if self.micro_batch_size == 0 {
            return 0;
        }
        self.replica_batch_size().div_ceil(self.micro_batch_size)
    }

    /// Builds the stage topology.
    pub fn topology(&self) -> Result<StageTopology, RuntimeError> {
        StageTopology::new(self.stages.clone())
    }

    /// Declared shared-parameter groups.
    pub fn shared_groups(&self) -> Vec<SharedParameterGroup> {
        self.shared_parameters
            .iter()
            .map(|g| SharedParameterGroup::new(g.iter().cloned()))
            .collect()
    }

    /// Checks everything that can be checked before tracing.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.topology()?;
        if self.micro_batch_size == 0 {
            return Err(RuntimeError::Config("micro_batch_size must be positive".into()));
        }
        let dp = self.data_parallel_depth();
        if self.batch_size == 0 || self.batch_size % dp != 0 {
            return Err(RuntimeError::Config(format!(
                "batch_size {} is not a positive multiple of the data-parallel depth {dp}",
                self.batch_size
            )));
        }
        if let Some(cuts) = &self.stage_to_cut {
            if cuts.len() != self.num_stages() {
                return Err(RuntimeError::Config(format!(
                    "stage_to_cut has {} entries for {} stage(s)",
                    cuts.len(),
                    self.num_stages()
                )));
            }
        }
        if !self.loss_scale.is_finite() || self.loss_scale <= 0.0 {
            return Err(RuntimeError::Config(format!(
                "loss_scale must be positive and finite, got {}",
                self.loss_scale
            )));
        }
        self.create_schedule_strategy()?;
        self.create_assignment_strategy()?;
        Ok(())
    }

    /// Creates the schedule strategy specified by this config.
    pub fn create_schedule_strategy(&self) -> Result<Box<dyn ScheduleStrategy>, RuntimeError> {
        pipeline_scheduler::strategy_by_name(&self.schedule.to_lowercase()).map_err(|_| {
            RuntimeError::Config(format!(
                "unknown schedule '{}'; expected '1f1b' or 'fill-drain'",
                self.schedule
            ))
        })
    }

    /// Creates the assignment strategy specified by this config.
    pub fn create_assignment_strategy(
        &self,
    ) -> Result<Box<dyn AssignmentStrategy>, RuntimeError> {
        if let Some(cuts) = &self.stage_to_cut {
            return Ok(Box::new(ExplicitCuts::new(cuts.clone())));
        }
        match self.assignment.to_lowercase().as_str() {
            "even" => Ok(Box::new(EvenCuts::new())),
            "balanced" => Ok(Box::new(BalancedParameters::new())),
            other => Err(RuntimeError::Config(format!(
                "unknown assignment '{other}'; expected 'even' or 'balanced'"
            ))),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            micro_batch_size: 2,
            schedule: default_schedule(),
            assignment: default_assignment(),
            stage_to_cut: None,
            stages: vec![vec![0]],
            shared_parameters: Vec::new(),
            cache_dir: None,
            from_cache: true,
            loss_scale: default_loss_scale(),
            rng_seed: 0,
            enable_profiling: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = PipelineConfig::default();
        assert_eq!(c.schedule, "1f1b");
        assert_eq!(c.num_stages(), 1);
        assert_eq!(c.num_microbatches(), 4);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
batch_size = 14
micro_batch_size = 2
schedule = "fill-drain"
stages = [[0, 3], [1, 4], [2, 5]]
shared_parameters = [["a.weight", "b.weight"]]
cache_dir = "/tmp/cache"
enable_profiling = false
"#;
        let c = PipelineConfig::from_toml(toml).unwrap();
        assert_eq!(c.num_stages(), 3);
        assert_eq!(c.data_parallel_depth(), 2);
        assert_eq!(c.replica_batch_size(), 7);
        assert_eq!(c.num_microbatches(), 4);
        assert_eq!(c.assignment, "even");
        assert_eq!(c.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert!(c.from_cache);
        assert!(!c.enable_profiling);
        assert_eq!(c.shared_groups()[0].members, vec!["a.weight", "b.weight"]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let c = PipelineConfig {
            stages: vec![vec![0], vec![1]],
            stage_to_cut: Some(vec![0, 2]),
            ..Default::default()
        };
        let back = PipelineConfig::from_toml(&c.to_toml().unwrap()).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_create_strategies() {
        let c = PipelineConfig {
            schedule: "fill-drain".into(),
            assignment: "balanced".into(),
            ..Default::default()
        };
        assert_eq!(c.create_schedule_strategy().unwrap().name(), "fill-drain");
        assert_eq!(c.create_assignment_strategy().unwrap().name(), "balanced");

        let explicit = PipelineConfig {
            stage_to_cut: Some(vec![0]),
            ..Default::default()
        };
        assert_eq!(explicit.create_assignment_strategy().unwrap().name(), "explicit");
    }

    #[test]
    fn test_unknown_strategies_rejected() {
        let c = PipelineConfig {
            schedule: "zero-bubble".into(),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(RuntimeError::Config(_))));
        let c = PipelineConfig {
            assignment: "random".into(),
            ..Default::default()
        };
        assert!(c.create_assignment_strategy().is_err());
    }

    #[test]
    fn test_batch_not_divisible_by_replicas() {
        let c = PipelineConfig {
            batch_size: 7,
            stages: vec![vec![0, 1]],
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_zero_micro_batch_rejected() {
        let c = PipelineConfig {
            micro_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(c.num_microbatches(), 0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_stage_to_cut_length_checked() {
        let c = PipelineConfig {
            stages: vec![vec![0], vec![1]],
            stage_to_cut: Some(vec![0]),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}

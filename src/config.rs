//! Hyperparameters and run options.
//!
//! Every struct here is serde-(de)serializable with defaults, so a full agent can be
//! described by a partial JSON document:
//!
//! ```rust,no_run
//! use hdqn::config::HrlConfig;
//!
//! let config = HrlConfig::from_json_file("hrl.json").unwrap();
//! assert_eq!(config.layout.base_width, 56);
//! ```

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Serialize, Deserialize};
use serde_json::{json, Value};

use crate::activations::Activation;
use crate::agent::targets::TargetModelUpdate;
use crate::environment::InitStateConfig;
use crate::error::{HrlError, Result};
use crate::policy::PolicyConfig;
use crate::routing::ObservationLayout;
use crate::types::ManeuverSet;

/// DQN hyperparameters shared by the upper agent and the sub-agents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DqnConfig {
    pub gamma: f32,
    pub batch_size: usize,
    pub nb_steps_warmup: u64,
    pub train_interval: u64,
    pub memory_interval: u64,
    /// `>= 1`: hard copy every that many steps. `[0, 1)`: soft blend coefficient.
    pub target_model_update: f64,
    /// Huber clip. `None` means unclipped (squared loss).
    pub delta_clip: Option<f32>,
    /// Deprecated: only `delta_range[1]` is used, as `delta_clip`.
    pub delta_range: Option<[f32; 2]>,
    pub enable_double_dqn: bool,
    pub enable_dueling_network: bool,
    pub dueling_type: String,
    pub learning_rate: f32,
}

impl Default for DqnConfig {
    fn default() -> Self {
        DqnConfig {
            gamma: 0.99,
            batch_size: 32,
            nb_steps_warmup: 1000,
            train_interval: 1,
            memory_interval: 1,
            target_model_update: 10000.0,
            delta_clip: None,
            delta_range: None,
            enable_double_dqn: false,
            enable_dueling_network: false,
            dueling_type: "avg".to_string(),
            learning_rate: 1e-3,
        }
    }
}

impl DqnConfig {
    /// Validate and normalise: rejects bad intervals and negative `target_model_update`,
    /// folds the deprecated `delta_range` into `delta_clip`.
    pub fn validated(mut self) -> Result<Self> {
        TargetModelUpdate::from_raw(self.target_model_update)?;
        if self.batch_size == 0 {
            return Err(HrlError::invalid_parameter("batch_size", "must be at least 1"));
        }
        if self.train_interval == 0 || self.memory_interval == 0 {
            return Err(HrlError::invalid_parameter(
                "train_interval/memory_interval",
                "intervals must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(HrlError::invalid_parameter(
                "gamma".to_string(),
                format!("must lie in [0, 1], got {}", self.gamma),
            ));
        }
        if let Some(range) = self.delta_range.take() {
            warn!(
                "`delta_range` is deprecated. Please use `delta_clip` instead, which takes a single scalar. \
                 For now we're falling back to `delta_range[1] = {}`",
                range[1]
            );
            self.delta_clip = Some(range[1]);
        }
        Ok(self)
    }

    pub fn target_update(&self) -> Result<TargetModelUpdate> {
        TargetModelUpdate::from_raw(self.target_model_update)
    }

    pub fn delta_clip_value(&self) -> f32 {
        self.delta_clip.unwrap_or(f32::INFINITY)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "gamma": self.gamma,
            "batch_size": self.batch_size,
            "nb_steps_warmup": self.nb_steps_warmup,
            "train_interval": self.train_interval,
            "memory_interval": self.memory_interval,
            "target_model_update": self.target_model_update,
            "delta_clip": self.delta_clip,
            "enable_double_dqn": self.enable_double_dqn,
            "enable_dueling_network": self.enable_dueling_network,
            "dueling_type": self.dueling_type,
            "learning_rate": self.learning_rate,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub limit: usize,
    pub window_length: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig { limit: 50_000, window_length: 1 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub hidden_sizes: Vec<usize>,
    /// Applied after every hidden layer; the Q-value head stays linear.
    pub hidden_activation: Activation,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { hidden_sizes: vec![64, 64], hidden_activation: Activation::Relu }
    }
}

/// Configuration of one low-level agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SubAgentConfig {
    pub dqn: DqnConfig,
    pub network: NetworkConfig,
    pub memory: MemoryConfig,
    pub policy: PolicyConfig,
    pub test_policy: PolicyConfig,
    /// Candidate values per control dimension; the action grid is their cartesian product.
    pub control_axes: Vec<Vec<f32>>,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        SubAgentConfig {
            dqn: DqnConfig::default(),
            network: NetworkConfig::default(),
            memory: MemoryConfig::default(),
            policy: PolicyConfig::default(),
            test_policy: PolicyConfig::Greedy,
            control_axes: vec![
                vec![-1.0, 0.0, 1.0],
                vec![-1.0, -0.5, 0.0, 0.5, 1.0],
            ],
        }
    }
}

/// Everything needed to build a coordinator and its three sub-agents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HrlConfig {
    pub upper: DqnConfig,
    pub upper_network: NetworkConfig,
    pub upper_memory: MemoryConfig,
    pub policy: PolicyConfig,
    pub test_policy: PolicyConfig,
    pub sub_agents: ManeuverSet<SubAgentConfig>,
    pub layout: ObservationLayout,
    /// Physical `[low, high]` range of each control dimension; sub-agents act in `[-1, 1]`.
    pub control_ranges: Vec<[f32; 2]>,
    pub normalize_observations: bool,
    pub init_state: InitStateConfig,
}

impl Default for HrlConfig {
    fn default() -> Self {
        HrlConfig {
            upper: DqnConfig::default(),
            upper_network: NetworkConfig::default(),
            upper_memory: MemoryConfig::default(),
            policy: PolicyConfig::default(),
            test_policy: PolicyConfig::Greedy,
            sub_agents: ManeuverSet::from_fn(|_| SubAgentConfig::default()),
            layout: ObservationLayout::default(),
            control_ranges: vec![[-3.75, 3.75], [-3.0, 3.0]],
            normalize_observations: true,
            init_state: InitStateConfig::default(),
        }
    }
}

impl HrlConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: HrlConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Periodic weight checkpoint. `path` may contain `{step}`, replaced by the current step.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    pub interval: u64,
}

impl CheckpointConfig {
    pub fn path_for(&self, step: u64) -> PathBuf {
        PathBuf::from(self.path.to_string_lossy().replace("{step}", &step.to_string()))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FitOptions {
    pub nb_steps: u64,
    pub pre_warm_steps: usize,
    pub verbose: u8,
    pub log_interval: u64,
    pub nb_max_episode_steps: Option<u64>,
    pub checkpoint: Option<CheckpointConfig>,
    pub log_file: Option<PathBuf>,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            nb_steps: 10_000,
            pre_warm_steps: 0,
            verbose: 1,
            log_interval: 100,
            nb_max_episode_steps: None,
            checkpoint: None,
            log_file: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TestOptions {
    pub nb_episodes: usize,
    pub nb_max_episode_steps: Option<u64>,
    pub verbose: u8,
    pub model_path: Option<PathBuf>,
}

impl Default for TestOptions {
    fn default() -> Self {
        TestOptions {
            nb_episodes: 1,
            nb_max_episode_steps: None,
            verbose: 2,
            model_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dqn_defaults() {
        let config = DqnConfig::default();
        assert_eq!(config.gamma, 0.99);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.nb_steps_warmup, 1000);
        assert_eq!(config.target_model_update, 10000.0);
        assert_eq!(config.delta_clip_value(), f32::INFINITY);
        assert_eq!(config.dueling_type, "avg");
    }

    #[test]
    fn test_negative_target_update_rejected() {
        let config = DqnConfig { target_model_update: -1.0, ..DqnConfig::default() };
        assert!(matches!(config.validated(), Err(HrlError::InvalidParameter { .. })));
    }

    #[test]
    fn test_delta_range_folds_into_delta_clip() {
        let config = DqnConfig { delta_range: Some([-2.0, 2.0]), ..DqnConfig::default() };
        let config = config.validated().unwrap();
        assert_eq!(config.delta_clip, Some(2.0));
        assert!(config.delta_range.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HrlConfig = serde_json::from_str(r#"{ "upper": { "batch_size": 8 } }"#).unwrap();
        assert_eq!(config.upper.batch_size, 8);
        assert_eq!(config.upper.gamma, 0.99);
        assert_eq!(config.layout.timesteps, 10);
    }

    #[test]
    fn test_checkpoint_path_template() {
        let checkpoint = CheckpointConfig { path: PathBuf::from("ckpt/model_step{step}.bin"), interval: 10 };
        assert_eq!(checkpoint.path_for(40), PathBuf::from("ckpt/model_step40.bin"));
    }
}

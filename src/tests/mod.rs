// Test modules for the hierarchy
pub mod test_edge_cases;

use ndarray::Array2;

use crate::agent::{ControlAgent, HierarchicalAgent};
use crate::builders::HierarchyBuilder;
use crate::config::HrlConfig;
use crate::environment::{EnvStep, Environment, FixedStart};
use crate::error::Result;
use crate::optimizer::{OptimizerWrapper, SGD};
use crate::policy::PolicyConfig;
use crate::types::HierarchicalAction;

pub(crate) const TIMESTEPS: usize = 2;

/// Tiny hierarchy: two-row observations, one hidden layer, upper agent trains from step 1
/// with single-transition batches, sub-agents never leave warmup.
pub(crate) fn small_config() -> HrlConfig {
    let mut config = HrlConfig::default();
    config.layout.timesteps = TIMESTEPS;
    config.normalize_observations = false;
    config.upper.batch_size = 1;
    config.upper.nb_steps_warmup = 0;
    config.upper_network.hidden_sizes = vec![8];
    for (_, sub) in config.sub_agents.iter_mut() {
        sub.network.hidden_sizes = vec![8];
        sub.dqn.nb_steps_warmup = 1_000_000;
        sub.control_axes = vec![vec![-1.0, 0.0, 1.0], vec![-1.0, 1.0]];
        sub.policy = PolicyConfig::Greedy;
    }
    config
}

pub(crate) fn compiled_agent(config: HrlConfig) -> HierarchicalAgent<ControlAgent> {
    HierarchyBuilder::new(config)
        .optimizer(OptimizerWrapper::SGD(SGD::new()))
        .build()
        .unwrap()
        .with_sampler(Box::new(FixedStart(vec![0.0, -157.5, 10.0, 0.0])))
}

pub(crate) fn observation(value: f32) -> Array2<f32> {
    Array2::from_shape_fn((TIMESTEPS, 56), |(t, c)| value + 0.01 * (t * 56 + c) as f32)
}

/// Reward 1 per step, episode over after `episode_length` steps.
pub(crate) struct CountingRoad {
    pub episode_length: u64,
    pub episode_step: u64,
    pub resets: usize,
    pub actions: Vec<HierarchicalAction>,
}

impl CountingRoad {
    pub(crate) fn new(episode_length: u64) -> Self {
        CountingRoad { episode_length, episode_step: 0, resets: 0, actions: Vec::new() }
    }
}

impl Environment for CountingRoad {
    fn reset(&mut self, init_state: &[f32]) -> Result<Array2<f32>> {
        assert_eq!(init_state.len(), 4);
        self.episode_step = 0;
        self.resets += 1;
        Ok(observation(0.0))
    }

    fn step(&mut self, action: &HierarchicalAction) -> Result<EnvStep> {
        self.actions.push(action.clone());
        self.episode_step += 1;
        let done = self.episode_step >= self.episode_length;
        Ok(EnvStep::new(observation(self.episode_step as f32 * 0.1), 1.0, done))
    }

    fn encoded_observation(&self) -> Array2<f32> {
        observation(self.episode_step as f32 * 0.1)
    }
}

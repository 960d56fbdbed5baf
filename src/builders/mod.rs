//! Fluent construction of a complete hierarchy from an [`HrlConfig`].

use log::info;

use crate::agent::{ControlAgent, ControlGrid, DqnCore, HierarchicalAgent};
use crate::config::{DqnConfig, HrlConfig, NetworkConfig, SubAgentConfig};
use crate::environment::LaneStartSampler;
use crate::error::Result;
use crate::memory::SequentialMemory;
use crate::model::{DuelingType, QNetwork};
use crate::optimizer::OptimizerWrapper;
use crate::processor::DrivingProcessor;
use crate::routing::ManeuverRouter;
use crate::types::{Maneuver, ManeuverSet};

/// Builder for a [`HierarchicalAgent`] and its three [`ControlAgent`]s.
pub struct HierarchyBuilder {
    config: HrlConfig,
    optimizer: Option<OptimizerWrapper>,
    seed: Option<u64>,
}

impl HierarchyBuilder {
    pub fn new(config: HrlConfig) -> Self {
        HierarchyBuilder { config, optimizer: None, seed: None }
    }

    /// Compile every agent with (a copy of) this optimizer once built.
    pub fn optimizer(mut self, optimizer: OptimizerWrapper) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Seed the episode start sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn config(&self) -> &HrlConfig {
        &self.config
    }

    pub fn build(self) -> Result<HierarchicalAgent<ControlAgent>> {
        let config = &self.config;
        let router = ManeuverRouter::new(config.layout.clone())?;
        let timesteps = config.layout.timesteps;

        let upper_model = build_model(
            &config.upper,
            &config.upper_network,
            config.upper_memory.window_length * timesteps * config.layout.base_width,
            Maneuver::COUNT,
        )?;
        let core = DqnCore::new(upper_model, config.upper.clone())?;
        let memory = SequentialMemory::from_config(&config.upper_memory)?;

        let sub_agents = ManeuverSet::new(
            build_sub_agent(config, &router, Maneuver::Left)?,
            build_sub_agent(config, &router, Maneuver::Straight)?,
            build_sub_agent(config, &router, Maneuver::Right)?,
        );

        let mut processor = DrivingProcessor::new(config.control_ranges.clone());
        if config.normalize_observations {
            processor = processor.with_normalizer((timesteps, config.layout.base_width));
        }
        let sampler = match self.seed {
            Some(seed) => LaneStartSampler::seeded(&config.init_state, seed)?,
            None => LaneStartSampler::new(&config.init_state)?,
        };

        let mut agent = HierarchicalAgent::new(
            core,
            memory,
            config.policy.build(),
            config.test_policy.build(),
            sub_agents,
            router,
        )?
        .with_processor(Box::new(processor))
        .with_sampler(Box::new(sampler));

        if let Some(optimizer) = self.optimizer {
            agent.compile(optimizer);
        }
        info!(
            "Built hierarchy: upper input {}, sub-agent inputs {:?}",
            agent.core().model().input_size(),
            agent.sub_agents().map(|_, s| s.core().model().input_size())
        );
        Ok(agent)
    }
}

fn build_model(dqn: &DqnConfig, network: &NetworkConfig, input_size: usize, nb_actions: usize) -> Result<QNetwork> {
    let dueling = if dqn.enable_dueling_network {
        Some(dqn.dueling_type.parse::<DuelingType>()?)
    } else {
        None
    };
    QNetwork::with_activation(
        input_size,
        &network.hidden_sizes,
        network.hidden_activation,
        nb_actions,
        dueling,
    )
}

fn build_sub_agent(config: &HrlConfig, router: &ManeuverRouter, maneuver: Maneuver) -> Result<ControlAgent> {
    let sub: &SubAgentConfig = &config.sub_agents[maneuver];
    let width = router.width(maneuver);
    let timesteps = config.layout.timesteps;

    let grid = ControlGrid::new(sub.control_axes.clone())?;
    let model = build_model(&sub.dqn, &sub.network, sub.memory.window_length * timesteps * width, grid.len())?;
    let core = DqnCore::new(model, sub.dqn.clone())?;
    let memory = SequentialMemory::from_config(&sub.memory)?;

    let agent = ControlAgent::new(
        core,
        grid,
        memory,
        sub.policy.build(),
        sub.test_policy.build(),
        (timesteps, width),
    )?;
    if config.normalize_observations {
        Ok(agent.with_processor(Box::new(DrivingProcessor::new(Vec::new()).with_normalizer((timesteps, width)))))
    } else {
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;
    use crate::agent::SubAgent;
    use crate::optimizer::SGD;

    fn small_config() -> HrlConfig {
        let mut config = HrlConfig::default();
        config.layout.timesteps = 2;
        config.upper_network.hidden_sizes = vec![8];
        for (_, sub) in config.sub_agents.iter_mut() {
            sub.network.hidden_sizes = vec![8];
        }
        config
    }

    #[test]
    fn test_build_wires_projection_widths() {
        let agent = HierarchyBuilder::new(small_config()).seed(7).build().unwrap();
        assert_eq!(agent.core().model().input_size(), 2 * 56);
        assert_eq!(agent.sub_agent(Maneuver::Left).input_width(), 41);
        assert_eq!(agent.sub_agent(Maneuver::Straight).input_width(), 59);
        assert_eq!(agent.sub_agent(Maneuver::Right).input_width(), 41);
        assert_eq!(agent.sub_agent(Maneuver::Right).core().model().input_size(), 2 * 41);
        assert!(!agent.is_compiled());
    }

    #[test]
    fn test_build_with_optimizer_compiles_everything() {
        let agent = HierarchyBuilder::new(small_config())
            .optimizer(OptimizerWrapper::SGD(SGD::new()))
            .build()
            .unwrap();
        assert!(agent.is_compiled());
        assert!(agent.sub_agents().iter().all(|(_, s)| s.is_compiled()));
    }

    #[test]
    fn test_dueling_sub_agents() {
        let mut config = small_config();
        config.sub_agents.left.dqn.enable_dueling_network = true;
        config.upper.enable_dueling_network = true;
        let agent = HierarchyBuilder::new(config).build().unwrap();
        assert!(agent.core().model().dueling_type().is_some());
        assert!(agent.sub_agent(Maneuver::Left).core().model().dueling_type().is_some());
        assert!(agent.sub_agent(Maneuver::Right).core().model().dueling_type().is_none());
    }

    #[test]
    fn test_hidden_activation_from_config() {
        let mut config = small_config();
        config.upper_network.hidden_activation = Activation::Tanh;
        config.sub_agents.right.network.hidden_activation = Activation::LeakyRelu { alpha: 0.01 };
        let agent = HierarchyBuilder::new(config).build().unwrap();

        let upper = &agent.core().model().network().layers;
        assert_eq!(upper[0].activation, Activation::Tanh);
        assert_eq!(upper[1].activation, Activation::Linear);
        let right = &agent.sub_agent(Maneuver::Right).core().model().network().layers;
        assert_eq!(right[0].activation, Activation::LeakyRelu { alpha: 0.01 });
        let left = &agent.sub_agent(Maneuver::Left).core().model().network().layers;
        assert_eq!(left[0].activation, Activation::Relu);
    }

    #[test]
    fn test_empty_control_axis_rejected() {
        let mut config = small_config();
        config.sub_agents.straight.control_axes = vec![vec![]];
        assert!(HierarchyBuilder::new(config).build().is_err());
    }
}

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde_json::Value;

use crate::agent::targets::{bootstrap_values, masked_targets, TargetModelUpdate};
use crate::config::DqnConfig;
use crate::error::{HrlError, Result};
use crate::loss::HuberLoss;
use crate::memory::SequentialMemory;
use crate::model::QNetwork;
use crate::optimizer::OptimizerWrapper;
use crate::processor::Processor;

/// Loss and mean max-Q of one gradient step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchMetrics {
    pub loss: f32,
    pub mean_q: f32,
}

impl BatchMetrics {
    pub const NAMES: [&'static str; 2] = ["loss", "mean_q"];

    pub fn to_vec(self) -> Vec<f32> {
        vec![self.loss, self.mean_q]
    }
}

/// Flatten each state into one row of a batch. All states must hold the same number of values.
pub fn flatten_states<'a, I>(states: I) -> Result<Array2<f32>>
where
    I: IntoIterator<Item = &'a Array2<f32>>,
{
    let mut width = None;
    let mut rows = 0;
    let mut values = Vec::new();
    for state in states {
        match width {
            None => width = Some(state.len()),
            Some(w) if w != state.len() => {
                return Err(HrlError::dimension_mismatch(
                    format!("{} state values", w),
                    format!("{} state values", state.len()),
                ));
            }
            Some(_) => {}
        }
        values.extend(state.iter().copied());
        rows += 1;
    }
    Array2::from_shape_vec((rows, width.unwrap_or(0)), values)
        .map_err(|e| HrlError::Training(format!("cannot build state batch: {}", e)))
}

struct Compiled {
    target_model: QNetwork,
    optimizer: OptimizerWrapper,
}

/// Online/target model pair with the masked Q-learning update.
///
/// Shared by the coordinator and the sub-agents: everything that is plain DQN lives here,
/// everything hierarchical lives in the agents.
pub struct DqnCore {
    config: DqnConfig,
    target_update: TargetModelUpdate,
    loss: HuberLoss,
    model: QNetwork,
    compiled: Option<Compiled>,
}

impl DqnCore {
    pub fn new(model: QNetwork, config: DqnConfig) -> Result<Self> {
        let config = config.validated()?;
        let target_update = config.target_update()?;
        let loss = HuberLoss::new(config.delta_clip_value());
        Ok(DqnCore { config, target_update, loss, model, compiled: None })
    }

    /// Build the target model and attach the optimizer. Recompiling resets both.
    pub fn compile(&mut self, optimizer: OptimizerWrapper) {
        let mut target_model = self.model.clone();
        target_model.reset_states();
        self.compiled = Some(Compiled { target_model, optimizer });
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn dqn_config(&self) -> &DqnConfig {
        &self.config
    }

    pub fn target_update(&self) -> TargetModelUpdate {
        self.target_update
    }

    pub fn nb_actions(&self) -> usize {
        self.model.nb_actions()
    }

    pub fn model(&self) -> &QNetwork {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut QNetwork {
        &mut self.model
    }

    pub fn target_model(&self) -> Option<&QNetwork> {
        self.compiled.as_ref().map(|c| &c.target_model)
    }

    fn require_compiled(&self, operation: &str) -> Result<()> {
        if self.compiled.is_none() {
            return Err(HrlError::NotCompiled(format!(
                "call compile() before {}",
                operation
            )));
        }
        Ok(())
    }

    /// Q-values of the online model for a batch of flattened, processed states.
    pub fn compute_batch_q_values(&self, states: ArrayView2<f32>) -> Result<Array2<f32>> {
        let q_values = self.model.predict_batch(states)?;
        assert_eq!(q_values.dim(), (states.nrows(), self.nb_actions()));
        Ok(q_values)
    }

    pub fn should_store(&self, step: u64) -> bool {
        step % self.config.memory_interval == 0
    }

    pub fn should_train(&self, step: u64) -> bool {
        step > self.config.nb_steps_warmup && step % self.config.train_interval == 0
    }

    /// Sample exactly `batch_size` transitions from `memory` and train on them.
    ///
    /// A memory that cannot supply a full batch is an error, never a smaller batch.
    pub fn train_from_memory<A, F>(
        &mut self,
        memory: &SequentialMemory<A>,
        processor: Option<&dyn Processor>,
        action_index: F,
    ) -> Result<BatchMetrics>
    where
        A: Clone,
        F: Fn(&A) -> Result<usize>,
    {
        self.require_compiled("training")?;

        let batch_size = self.config.batch_size;
        let experiences = memory.sample(batch_size);
        if experiences.len() != batch_size {
            return Err(HrlError::dimension_mismatch(
                format!("{} sampled experiences", batch_size),
                format!("{} sampled experiences", experiences.len()),
            ));
        }

        let mut state0 = flatten_states(experiences.iter().map(|e| &e.state0))?;
        let mut state1 = flatten_states(experiences.iter().map(|e| &e.state1))?;
        let mut rewards: Array1<f32> = experiences.iter().map(|e| e.reward).collect();
        let terminal1: Array1<f32> = experiences.iter().map(|e| if e.terminal1 { 1.0 } else { 0.0 }).collect();
        let actions = experiences
            .iter()
            .map(|e| action_index(&e.action))
            .collect::<Result<Vec<usize>>>()?;

        if let Some(processor) = processor {
            state0 = processor.process_state_batch(state0)?;
            state1 = processor.process_state_batch(state1)?;
            rewards = processor.process_reward_batch(rewards);
        }
        assert_eq!(rewards.len(), batch_size);
        assert_eq!(terminal1.len(), rewards.len());

        self.train_on_batch(state0.view(), &actions, rewards.view(), terminal1.view(), state1.view())
    }

    /// One masked gradient step. `terminal1[i]` is 1 when the transition ended the episode.
    pub fn train_on_batch(
        &mut self,
        state0: ArrayView2<f32>,
        actions: &[usize],
        rewards: ndarray::ArrayView1<f32>,
        terminal1: ndarray::ArrayView1<f32>,
        state1: ArrayView2<f32>,
    ) -> Result<BatchMetrics> {
        let nb_actions = self.nb_actions();
        let batch_size = actions.len();
        let Some(compiled) = self.compiled.as_mut() else {
            return Err(HrlError::NotCompiled("call compile() before training".to_string()));
        };

        let target_q = compiled.target_model.predict_batch(state1)?;
        assert_eq!(target_q.dim(), (batch_size, nb_actions));
        let q_next = if self.config.enable_double_dqn {
            let online_q = self.model.predict_batch(state1)?;
            assert_eq!(online_q.dim(), (batch_size, nb_actions));
            bootstrap_values(Some(online_q.view()), target_q.view())
        } else {
            bootstrap_values(None, target_q.view())
        };
        assert_eq!(q_next.len(), batch_size);

        let (targets, masks) = masked_targets(actions, rewards, terminal1, q_next.view(), self.config.gamma, nb_actions)?;

        let q_values = self.model.forward_batch(state0)?;
        let loss = self.loss.compute_masked(q_values.view(), targets.view(), masks.view()).mean().unwrap_or(0.0);
        let mean_q = q_values
            .map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &v| m.max(v)))
            .mean()
            .unwrap_or(0.0);

        let gradients = self.loss.gradient_masked(q_values.view(), targets.view(), masks.view());
        self.model.apply_output_gradients(gradients.view(), &mut compiled.optimizer, self.config.learning_rate)?;

        if let TargetModelUpdate::Soft(tau) = self.target_update {
            compiled.target_model.blend_from(&self.model, tau);
        }

        Ok(BatchMetrics { loss, mean_q })
    }

    /// Hard-copy the online weights into the target model when the schedule says so.
    pub fn maybe_update_target(&mut self, step: u64) -> Result<bool> {
        if self.compiled.is_some() && self.target_update.hard_update_due(step) {
            self.update_target_model_hard()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn update_target_model_hard(&mut self) -> Result<()> {
        self.require_compiled("updating the target model")?;
        let weights = self.model.get_weights();
        if let Some(compiled) = self.compiled.as_mut() {
            compiled.target_model.set_weights(&weights)?;
        }
        Ok(())
    }

    pub fn reset_states(&mut self) {
        self.model.reset_states();
        if let Some(compiled) = self.compiled.as_mut() {
            compiled.target_model.reset_states();
        }
    }

    pub fn config(&self) -> Value {
        let mut config = self.config.to_json();
        config["model"] = self.model.config();
        if let Some(compiled) = self.compiled.as_ref() {
            config["target_model"] = compiled.target_model.config();
            config["optimizer"] = compiled.optimizer.config();
        }
        config
    }
}

//! Low-level agents that turn a maneuver-specific observation into a continuous control.

use std::path::Path;

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use serde_json::{json, Value};

use crate::agent::core::{flatten_states, BatchMetrics, DqnCore};
use crate::error::{HrlError, Result};
use crate::memory::SequentialMemory;
use crate::optimizer::OptimizerWrapper;
use crate::policy::Policy;
use crate::processor::Processor;
use crate::types::StepClock;

/// What the coordinator needs from each of its three sub-agents.
///
/// Sub-agents never own a step counter: the coordinator's [`StepClock`] is passed in on
/// every call.
pub trait SubAgent {
    /// Columns of the projected observation this agent accepts.
    fn input_width(&self) -> usize;

    fn forward(&mut self, observation: Array2<f32>, clock: &StepClock) -> Result<Array1<f32>>;

    /// Run a training tick on the agent's own memory. `reward` and `terminal` are unused:
    /// transitions are stored by the coordinator.
    fn backward(&mut self, clock: &StepClock, reward: f32, terminal: bool) -> Result<Vec<f32>>;

    fn memory(&self) -> &SequentialMemory<Array1<f32>>;
    fn memory_mut(&mut self) -> &mut SequentialMemory<Array1<f32>>;

    fn recent_observation(&self) -> Option<&Array2<f32>>;
    fn recent_action(&self) -> Option<&Array1<f32>>;

    fn training(&self) -> bool;
    fn set_training(&mut self, training: bool);

    fn compile(&mut self, optimizer: OptimizerWrapper);
    fn is_compiled(&self) -> bool;

    fn reset_states(&mut self);
    fn metrics_names(&self) -> Vec<String>;

    /// Q-values of the online model for one state.
    fn compute_q_values(&self, state: &Array2<f32>) -> Result<Array1<f32>>;

    fn save_weights(&self, path: &Path) -> Result<()>;
    fn load_weights(&mut self, path: &Path) -> Result<()>;

    fn processor(&self) -> Option<&dyn Processor>;
    fn processor_mut(&mut self) -> Option<&mut (dyn Processor + 'static)>;

    fn get_config(&self) -> Value;
}

/// Finite set of continuous control vectors: the cartesian product of per-dimension values.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlGrid {
    axes: Vec<Vec<f32>>,
    points: Vec<Array1<f32>>,
}

impl ControlGrid {
    pub fn new(axes: Vec<Vec<f32>>) -> Result<Self> {
        if axes.is_empty() || axes.iter().any(|axis| axis.is_empty()) {
            return Err(HrlError::invalid_parameter(
                "control_axes",
                "every control dimension needs at least one value",
            ));
        }
        let mut points: Vec<Vec<f32>> = vec![Vec::new()];
        for axis in &axes {
            points = points
                .into_iter()
                .flat_map(|prefix| {
                    axis.iter().map(move |&v| {
                        let mut point = prefix.clone();
                        point.push(v);
                        point
                    })
                })
                .collect();
        }
        Ok(ControlGrid { axes, points: points.into_iter().map(Array1::from).collect() })
    }

    pub fn axes(&self) -> &[Vec<f32>] {
        &self.axes
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    pub fn point(&self, index: usize) -> Result<&Array1<f32>> {
        self.points
            .get(index)
            .ok_or(HrlError::InvalidAction { action: index, max_actions: self.points.len() })
    }

    /// Index of the grid point closest (Euclidean) to `control`.
    pub fn nearest(&self, control: ArrayView1<f32>) -> Result<usize> {
        if control.len() != self.dim() {
            return Err(HrlError::dimension_mismatch(
                format!("{} control dimensions", self.dim()),
                format!("{} control dimensions", control.len()),
            ));
        }
        let distance = |p: &Array1<f32>| p.iter().zip(control.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>();
        Ok(self
            .points
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| distance(a).partial_cmp(&distance(b)).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(index, _)| index)
            .unwrap_or(0))
    }
}

/// DQN sub-agent acting on a [`ControlGrid`].
///
/// Stored actions are continuous vectors, so transitions written by someone else (the
/// coordinator's pre-warm phase) are usable: they are snapped to the nearest grid point
/// when a batch is built.
pub struct ControlAgent {
    core: DqnCore,
    grid: ControlGrid,
    policy: Box<dyn Policy>,
    test_policy: Box<dyn Policy>,
    memory: SequentialMemory<Array1<f32>>,
    processor: Option<Box<dyn Processor>>,
    /// `(timesteps, width)` of one projected observation.
    observation_shape: (usize, usize),
    training: bool,
    recent_observation: Option<Array2<f32>>,
    recent_action: Option<Array1<f32>>,
}

impl ControlAgent {
    pub fn new(
        core: DqnCore,
        grid: ControlGrid,
        memory: SequentialMemory<Array1<f32>>,
        mut policy: Box<dyn Policy>,
        mut test_policy: Box<dyn Policy>,
        observation_shape: (usize, usize),
    ) -> Result<Self> {
        if core.nb_actions() != grid.len() {
            return Err(HrlError::dimension_mismatch(
                format!("{} Q outputs (one per grid point)", grid.len()),
                format!("{} Q outputs", core.nb_actions()),
            ));
        }
        let state_size = memory.window_length() * observation_shape.0 * observation_shape.1;
        if core.model().input_size() != state_size {
            return Err(HrlError::dimension_mismatch(
                format!("{} model inputs", state_size),
                format!("{} model inputs", core.model().input_size()),
            ));
        }
        policy.bind(grid.len())?;
        test_policy.bind(grid.len())?;

        Ok(ControlAgent {
            core,
            grid,
            policy,
            test_policy,
            memory,
            processor: None,
            observation_shape,
            training: false,
            recent_observation: None,
            recent_action: None,
        })
    }

    pub fn with_processor(mut self, processor: Box<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn core(&self) -> &DqnCore {
        &self.core
    }

    pub fn grid(&self) -> &ControlGrid {
        &self.grid
    }

    pub fn observation_shape(&self) -> (usize, usize) {
        self.observation_shape
    }

    fn nan_metrics(&self) -> Vec<f32> {
        vec![f32::NAN; self.metrics_names().len()]
    }
}

impl SubAgent for ControlAgent {
    fn input_width(&self) -> usize {
        self.observation_shape.1
    }

    fn forward(&mut self, observation: Array2<f32>, clock: &StepClock) -> Result<Array1<f32>> {
        if observation.ncols() != self.observation_shape.1 {
            return Err(HrlError::dimension_mismatch(
                format!("{} observation columns", self.observation_shape.1),
                format!("{} observation columns", observation.ncols()),
            ));
        }
        let observation = match self.processor.as_mut() {
            Some(processor) => processor.process_observation(observation)?,
            None => observation,
        };

        let state = self.memory.get_recent_state(observation.view());
        let q_values = self.compute_q_values(&state)?;
        let index = if self.training {
            self.policy.select_action(q_values.view(), clock)?
        } else {
            self.test_policy.select_action(q_values.view(), clock)?
        };
        let control = self.grid.point(index)?.clone();

        self.recent_observation = Some(observation);
        self.recent_action = Some(control.clone());
        Ok(control)
    }

    fn backward(&mut self, clock: &StepClock, _reward: f32, _terminal: bool) -> Result<Vec<f32>> {
        let step = clock.step();
        let mut metrics = self.nan_metrics();
        if !self.training {
            return Ok(metrics);
        }

        if self.core.should_train(step) {
            if self.memory.nb_entries() <= self.core.dqn_config().batch_size {
                debug!(
                    "step {}: sub-agent memory holds {} entries, skipping training tick",
                    step,
                    self.memory.nb_entries()
                );
            } else {
                let grid = &self.grid;
                let batch: BatchMetrics = self.core.train_from_memory(
                    &self.memory,
                    self.processor.as_deref(),
                    |control: &Array1<f32>| grid.nearest(control.view()),
                )?;
                metrics = batch.to_vec();
                metrics.extend(self.policy.metrics());
                if let Some(processor) = self.processor.as_ref() {
                    metrics.extend(processor.metrics());
                }
            }
        }

        self.core.maybe_update_target(step)?;
        Ok(metrics)
    }

    fn memory(&self) -> &SequentialMemory<Array1<f32>> {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut SequentialMemory<Array1<f32>> {
        &mut self.memory
    }

    fn recent_observation(&self) -> Option<&Array2<f32>> {
        self.recent_observation.as_ref()
    }

    fn recent_action(&self) -> Option<&Array1<f32>> {
        self.recent_action.as_ref()
    }

    fn training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if let Some(processor) = self.processor.as_mut() {
            processor.set_training(training);
        }
    }

    fn compile(&mut self, optimizer: OptimizerWrapper) {
        self.core.compile(optimizer);
    }

    fn is_compiled(&self) -> bool {
        self.core.is_compiled()
    }

    fn reset_states(&mut self) {
        self.recent_observation = None;
        self.recent_action = None;
        self.memory.reset_recent();
        self.core.reset_states();
    }

    fn metrics_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BatchMetrics::NAMES.iter().map(|n| n.to_string()).collect();
        names.extend(self.policy.metrics_names());
        if let Some(processor) = self.processor.as_ref() {
            names.extend(processor.metrics_names());
        }
        names
    }

    fn compute_q_values(&self, state: &Array2<f32>) -> Result<Array1<f32>> {
        let mut batch = flatten_states([state])?;
        if let Some(processor) = self.processor.as_ref() {
            batch = processor.process_state_batch(batch)?;
        }
        let q_values = self.core.compute_batch_q_values(batch.view())?;
        Ok(q_values.row(0).to_owned())
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        self.core.model().save_weights(path)
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.core.model_mut().load_weights(path)?;
        if self.core.is_compiled() {
            self.core.update_target_model_hard()?;
        }
        Ok(())
    }

    fn processor(&self) -> Option<&dyn Processor> {
        self.processor.as_deref()
    }

    fn processor_mut(&mut self) -> Option<&mut (dyn Processor + 'static)> {
        self.processor.as_deref_mut()
    }

    fn get_config(&self) -> Value {
        json!({
            "class_name": "ControlAgent",
            "agent": self.core.config(),
            "memory": self.memory.config(),
            "policy": self.policy.config(),
            "test_policy": self.test_policy.config(),
            "control_axes": self.grid.axes(),
            "observation_shape": [self.observation_shape.0, self.observation_shape.1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DqnConfig;
    use crate::model::QNetwork;
    use crate::optimizer::SGD;
    use crate::policy::GreedyQPolicy;
    use ndarray::array;

    fn agent(config: DqnConfig) -> ControlAgent {
        let grid = ControlGrid::new(vec![vec![-1.0, 1.0], vec![-1.0, 0.0, 1.0]]).unwrap();
        let core = DqnCore::new(QNetwork::new(2 * 4, &[8], grid.len()).unwrap(), config).unwrap();
        let memory = SequentialMemory::new(100, 1).unwrap();
        let mut agent = ControlAgent::new(
            core,
            grid,
            memory,
            Box::new(GreedyQPolicy::new()),
            Box::new(GreedyQPolicy::new()),
            (2, 4),
        )
        .unwrap();
        agent.compile(OptimizerWrapper::SGD(SGD::new()));
        agent
    }

    #[test]
    fn test_grid_cartesian_product() {
        let grid = ControlGrid::new(vec![vec![-1.0, 1.0], vec![0.0, 0.5, 1.0]]).unwrap();
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.point(0).unwrap(), &array![-1.0, 0.0]);
        assert_eq!(grid.point(5).unwrap(), &array![1.0, 1.0]);
        assert_eq!(grid.nearest(array![0.9, 0.4].view()).unwrap(), 4);
        assert!(grid.nearest(array![0.9].view()).is_err());
        assert!(ControlGrid::new(vec![vec![]]).is_err());
    }

    #[test]
    fn test_forward_returns_grid_point_and_records_recent() {
        let mut agent = agent(DqnConfig::default());
        agent.set_training(true);
        let control = agent.forward(Array2::ones((2, 4)), &StepClock::new()).unwrap();
        assert_eq!(control.len(), 2);
        assert!(agent.grid().nearest(control.view()).is_ok());
        assert_eq!(agent.recent_action(), Some(&control));
        assert_eq!(agent.recent_observation().unwrap().dim(), (2, 4));
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut agent = agent(DqnConfig::default());
        let err = agent.forward(Array2::ones((2, 5)), &StepClock::new()).unwrap_err();
        assert!(matches!(err, HrlError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_backward_trains_on_stored_continuous_controls() {
        let config = DqnConfig { batch_size: 4, nb_steps_warmup: 0, ..DqnConfig::default() };
        let mut agent = agent(config);
        agent.set_training(true);
        for i in 0..8 {
            let control = array![0.8, -0.3 + i as f32 * 0.1];
            agent.memory_mut().append(Array2::from_elem((2, 4), i as f32), control, 1.0, false, true);
        }
        let mut clock = StepClock::new();
        clock.tick();
        let metrics = agent.backward(&clock, 0.0, false).unwrap();
        assert_eq!(metrics.len(), agent.metrics_names().len());
        assert!(metrics[0].is_finite());
    }

    #[test]
    fn test_backward_outside_training_reports_nan() {
        let mut agent = agent(DqnConfig { nb_steps_warmup: 0, ..DqnConfig::default() });
        agent.set_training(false);
        let mut clock = StepClock::new();
        clock.tick();
        let metrics = agent.backward(&clock, 0.0, false).unwrap();
        assert!(metrics.iter().all(|m| m.is_nan()));
    }
}

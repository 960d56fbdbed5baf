//! The hierarchical coordinator: an upper DQN choosing a maneuver and three sub-agents
//! producing the continuous control for it.
//!
//! Each cycle is `forward -> env.step -> backward`, strictly alternating:
//!
//! 1. `forward` picks a maneuver from the upper Q-values, projects the observation for that
//!    maneuver and asks the matching sub-agent for a control.
//! 2. `backward` stores the upper transition, stores the same reward for the active
//!    sub-agent with its terminal flag forced to non-terminal, and on training ticks updates
//!    the upper network and then lets every sub-agent train on its own memory.
//!
//! All four agents read the same [`StepClock`], advanced once per cycle by `fit`/`test`.

use std::path::Path;

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use serde_json::{json, Value};

use crate::agent::control::{ControlAgent, SubAgent};
use crate::agent::core::{flatten_states, BatchMetrics, DqnCore};
use crate::agent::persistence::{maneuver_path, normalizer_path};
use crate::callbacks::{
    Callback, CallbackList, EpisodeLogs, FileLogger, History, RunParams, StepLogs, TestLogger,
    TrainEpisodeLogger, TrainIntervalLogger,
};
use crate::config::{FitOptions, TestOptions};
use crate::environment::{
    EnvStep, Environment, InitStateConfig, InitialStateSampler, LaneStartSampler,
};
use crate::error::{HrlError, Result};
use crate::memory::SequentialMemory;
use crate::optimizer::OptimizerWrapper;
use crate::policy::Policy;
use crate::processor::Processor;
use crate::routing::ManeuverRouter;
use crate::types::{CancellationToken, HierarchicalAction, Maneuver, ManeuverSet, StepClock};

/// Caller-supplied extras for [`HierarchicalAgent::fit`].
#[derive(Default)]
pub struct FitHooks<'a> {
    pub callbacks: Vec<&'a mut dyn Callback>,
    /// Produces `[-1, 1]`-normalised actions for the pre-warm phase.
    pub random_policy: Option<&'a mut dyn FnMut() -> HierarchicalAction>,
    /// Checked before every step; once cancelled, training stops cleanly.
    pub cancellation: Option<CancellationToken>,
}

pub struct HierarchicalAgent<S: SubAgent = ControlAgent> {
    core: DqnCore,
    policy: Box<dyn Policy>,
    test_policy: Box<dyn Policy>,
    memory: SequentialMemory<usize>,
    processor: Option<Box<dyn Processor>>,
    sub_agents: ManeuverSet<S>,
    router: ManeuverRouter,
    sampler: Box<dyn InitialStateSampler>,
    clock: StepClock,
    training: bool,
    recent_observation: Option<Array2<f32>>,
    recent_action: Option<Maneuver>,
}

impl<S: SubAgent> HierarchicalAgent<S> {
    /// Assemble a coordinator. Policies are bound here; the upper model and every sub-agent
    /// must accept the widths the router produces.
    pub fn new(
        core: DqnCore,
        memory: SequentialMemory<usize>,
        mut policy: Box<dyn Policy>,
        mut test_policy: Box<dyn Policy>,
        sub_agents: ManeuverSet<S>,
        router: ManeuverRouter,
    ) -> Result<Self> {
        if core.nb_actions() != Maneuver::COUNT {
            return Err(HrlError::dimension_mismatch(
                format!("{} upper Q outputs", Maneuver::COUNT),
                format!("{} upper Q outputs", core.nb_actions()),
            ));
        }
        let layout = router.layout();
        let state_size = memory.window_length() * layout.timesteps * layout.base_width;
        if core.model().input_size() != state_size {
            return Err(HrlError::dimension_mismatch(
                format!("{} upper model inputs", state_size),
                format!("{} upper model inputs", core.model().input_size()),
            ));
        }
        for (maneuver, sub_agent) in sub_agents.iter() {
            if sub_agent.input_width() != router.width(maneuver) {
                return Err(HrlError::dimension_mismatch(
                    format!(
                        "{} input columns for the {} sub-agent",
                        router.width(maneuver),
                        maneuver
                    ),
                    format!(
                        "{} input columns for the {} sub-agent",
                        sub_agent.input_width(),
                        maneuver
                    ),
                ));
            }
        }
        policy.bind(Maneuver::COUNT)?;
        test_policy.bind(Maneuver::COUNT)?;

        Ok(HierarchicalAgent {
            core,
            policy,
            test_policy,
            memory,
            processor: None,
            sub_agents,
            router,
            sampler: Box::new(LaneStartSampler::new(&InitStateConfig::default())?),
            clock: StepClock::new(),
            training: false,
            recent_observation: None,
            recent_action: None,
        })
    }

    pub fn with_processor(mut self, processor: Box<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_sampler(mut self, sampler: Box<dyn InitialStateSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn core(&self) -> &DqnCore {
        &self.core
    }

    pub fn memory(&self) -> &SequentialMemory<usize> {
        &self.memory
    }

    pub fn sub_agent(&self, maneuver: Maneuver) -> &S {
        &self.sub_agents[maneuver]
    }

    pub fn sub_agent_mut(&mut self, maneuver: Maneuver) -> &mut S {
        &mut self.sub_agents[maneuver]
    }

    pub fn sub_agents(&self) -> &ManeuverSet<S> {
        &self.sub_agents
    }

    pub fn router(&self) -> &ManeuverRouter {
        &self.router
    }

    pub fn clock(&self) -> &StepClock {
        &self.clock
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn processor(&self) -> Option<&dyn Processor> {
        self.processor.as_deref()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if let Some(processor) = self.processor.as_mut() {
            processor.set_training(training);
        }
        for (_, sub_agent) in self.sub_agents.iter_mut() {
            sub_agent.set_training(training);
        }
    }

    /// Compile the upper agent and every sub-agent, each with its own copy of `optimizer`.
    pub fn compile(&mut self, optimizer: OptimizerWrapper) {
        self.core.compile(optimizer.clone());
        for (_, sub_agent) in self.sub_agents.iter_mut() {
            sub_agent.compile(optimizer.clone());
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.core.is_compiled() && self.sub_agents.iter().all(|(_, s)| s.is_compiled())
    }

    /// Forget the recent observation/action and any model-internal state, for all four agents.
    pub fn reset_states(&mut self) {
        self.recent_observation = None;
        self.recent_action = None;
        self.memory.reset_recent();
        self.core.reset_states();
        for (_, sub_agent) in self.sub_agents.iter_mut() {
            sub_agent.reset_states();
        }
    }

    /// Upper Q-values for a batch of states.
    pub fn compute_batch_q_values(&self, states: &[Array2<f32>]) -> Result<Array2<f32>> {
        let mut batch = flatten_states(states)?;
        if let Some(processor) = self.processor.as_ref() {
            batch = processor.process_state_batch(batch)?;
        }
        self.core.compute_batch_q_values(batch.view())
    }

    /// Upper Q-values for one state, one per maneuver.
    pub fn compute_q_values(&self, state: &Array2<f32>) -> Result<Array1<f32>> {
        let q_values = self.compute_batch_q_values(std::slice::from_ref(state))?;
        let q_values = q_values.row(0).to_owned();
        assert_eq!(q_values.len(), Maneuver::COUNT);
        Ok(q_values)
    }

    pub fn forward(&mut self, observation: Array2<f32>) -> Result<HierarchicalAction> {
        if self.recent_observation.is_some() {
            return Err(HrlError::ProtocolViolation(
                "forward() called twice without an intervening backward()".to_string(),
            ));
        }

        let state = self.memory.get_recent_state(observation.view());
        let q_values = self.compute_q_values(&state)?;
        let index = if self.training {
            self.policy.select_action(q_values.view(), &self.clock)?
        } else {
            self.test_policy.select_action(q_values.view(), &self.clock)?
        };
        let maneuver = Maneuver::from_index(index)?;

        let projected = self.router.project(maneuver, observation.view())?;
        let control = self.sub_agents[maneuver].forward(projected, &self.clock)?;

        self.recent_observation = Some(observation);
        self.recent_action = Some(maneuver);
        Ok(HierarchicalAction::new(maneuver, control))
    }

    pub fn backward(&mut self, reward: f32, terminal: bool) -> Result<Vec<f32>> {
        let maneuver = match (self.recent_observation.as_ref(), self.recent_action) {
            (Some(_), Some(maneuver)) => maneuver,
            _ => {
                return Err(HrlError::ProtocolViolation(
                    "backward() called without a preceding forward()".to_string(),
                ))
            }
        };
        let step = self.clock.step();

        let sub_transition = if self.core.should_store(step) {
            let sub_agent = &self.sub_agents[maneuver];
            match (sub_agent.recent_observation(), sub_agent.recent_action()) {
                (Some(o), Some(a)) => Some((o.clone(), a.clone())),
                _ => {
                    return Err(HrlError::ProtocolViolation(format!(
                        "the {} sub-agent has no recent observation/action",
                        maneuver
                    )))
                }
            }
        } else {
            None
        };

        self.recent_action = None;
        if let (Some(observation), Some((sub_observation, sub_action))) =
            (self.recent_observation.take(), sub_transition)
        {
            self.memory.append(observation, maneuver.index(), reward, terminal, self.training);
            // Sub-problems continue even when the top-level episode ends.
            self.sub_agents[maneuver]
                .memory_mut()
                .append(sub_observation, sub_action, reward, false, self.training);
        }

        let mut metrics = vec![f32::NAN; self.metrics_names().len()];
        if !self.training {
            return Ok(metrics);
        }

        if self.core.should_train(step) {
            let upper: BatchMetrics = self.core.train_from_memory(
                &self.memory,
                self.processor.as_deref(),
                |&index| Ok(index),
            )?;
            let mut values = upper.to_vec();
            values.extend(self.policy.metrics());
            if let Some(processor) = self.processor.as_ref() {
                values.extend(processor.metrics());
            }
            for maneuver in Maneuver::ALL {
                values.extend(self.sub_agents[maneuver].backward(&self.clock, 0.0, false)?);
            }
            assert_eq!(values.len(), metrics.len());
            metrics = values;
        }

        self.core.maybe_update_target(step)?;
        Ok(metrics)
    }

    /// `loss`, `mean_q`, policy and processor metrics, then every sub-agent's metrics
    /// prefixed with its maneuver name.
    pub fn metrics_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BatchMetrics::NAMES.iter().map(|n| n.to_string()).collect();
        names.extend(self.policy.metrics_names());
        if let Some(processor) = self.processor.as_ref() {
            names.extend(processor.metrics_names());
        }
        for (maneuver, sub_agent) in self.sub_agents.iter() {
            names.extend(
                sub_agent
                    .metrics_names()
                    .into_iter()
                    .map(|n| format!("{}_{}", maneuver, n)),
            );
        }
        names
    }

    fn process_observation(&mut self, observation: Array2<f32>) -> Result<Array2<f32>> {
        match self.processor.as_mut() {
            Some(processor) => processor.process_observation(observation),
            None => Ok(observation),
        }
    }

    fn process_action(&self, action: HierarchicalAction) -> Result<HierarchicalAction> {
        match self.processor.as_ref() {
            Some(processor) => processor.process_action(action),
            None => Ok(action),
        }
    }

    fn process_step(&mut self, step: EnvStep) -> Result<EnvStep> {
        match self.processor.as_mut() {
            Some(processor) => processor.process_step(step),
            None => Ok(step),
        }
    }

    fn reset_environment<E: Environment>(&mut self, env: &mut E) -> Result<Array2<f32>> {
        let init_state = self.sampler.sample();
        let observation = env.reset(&init_state)?;
        self.process_observation(observation)
    }

    fn memory_lengths(&self) -> ManeuverSet<usize> {
        self.sub_agents.map(|_, sub_agent| sub_agent.memory().nb_entries())
    }

    /// Train for `options.nb_steps` steps.
    ///
    /// Cancellation through `hooks.cancellation` is not an error: the loop exits, callbacks
    /// see `on_train_end(true)` and the history is returned with `did_abort` set.
    pub fn fit<E: Environment>(
        &mut self,
        env: &mut E,
        options: &FitOptions,
        hooks: FitHooks<'_>,
    ) -> Result<History> {
        if !self.is_compiled() {
            return Err(HrlError::NotCompiled(
                "you tried to fit the agent but it hasn't been compiled yet; \
                 call compile() before fit()"
                    .to_string(),
            ));
        }
        let FitHooks { mut callbacks, random_policy, cancellation } = hooks;

        self.set_training(true);
        self.clock.reset();

        let mut interval_logger =
            (options.verbose == 1).then(|| TrainIntervalLogger::new(options.log_interval));
        let mut episode_logger = (options.verbose > 1).then(TrainEpisodeLogger::new);
        let mut file_logger = options.log_file.as_ref().map(FileLogger::new);
        let mut history = History::default();

        let mut list = CallbackList::new();
        for callback in callbacks.iter_mut() {
            list.push(&mut **callback);
        }
        if let Some(logger) = interval_logger.as_mut() {
            list.push(logger);
        }
        if let Some(logger) = episode_logger.as_mut() {
            list.push(logger);
        }
        if let Some(logger) = file_logger.as_mut() {
            list.push(logger);
        }
        list.push(&mut history);

        let params = RunParams {
            nb_steps: Some(options.nb_steps),
            nb_episodes: None,
            metrics_names: self.metrics_names(),
        };
        list.on_train_begin(&params);

        let did_abort =
            self.run_fit(env, options, &mut list, random_policy, cancellation.as_ref())?;
        list.on_train_end(did_abort);
        Ok(history)
    }

    fn run_fit<E: Environment>(
        &mut self,
        env: &mut E,
        options: &FitOptions,
        callbacks: &mut CallbackList<'_>,
        random_policy: Option<&mut dyn FnMut() -> HierarchicalAction>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<bool> {
        let cancelled = || cancellation.map_or(false, |token| token.is_cancelled());

        match random_policy {
            Some(random_policy) => {
                info!("Pre-warming memories for {} steps", options.pre_warm_steps);
                let mut observation = self.process_observation(env.encoded_observation())?;
                for _ in 0..options.pre_warm_steps {
                    if cancelled() {
                        warn!("Training cancelled during pre-warm");
                        return Ok(true);
                    }
                    observation = self.pre_warm_step(env, callbacks, random_policy(), observation)?;
                }
            }
            None if options.pre_warm_steps > 0 => {
                warn!(
                    "pre_warm_steps = {} but no random policy was given; skipping pre-warm",
                    options.pre_warm_steps
                );
            }
            None => {}
        }

        let mut episode = 0usize;
        let mut episode_step = 0u64;
        let mut episode_reward = 0.0f32;
        let mut next_observation: Option<Array2<f32>> = None;

        while self.clock.step() < options.nb_steps {
            if cancelled() {
                warn!("Training cancelled at step {}", self.clock.step());
                return Ok(true);
            }

            let observation = match next_observation.take() {
                Some(observation) => observation,
                None => {
                    callbacks.on_episode_begin(episode);
                    episode_step = 0;
                    episode_reward = 0.0;
                    self.reset_states();
                    self.reset_environment(env)?
                }
            };

            callbacks.on_step_begin(episode_step);
            let action = self.forward(observation)?;
            let action = self.process_action(action)?;

            callbacks.on_action_begin(&action);
            let mut outcome = self.process_step(env.step(&action)?)?;
            callbacks.on_action_end(&action);

            if let Some(limit) = options.nb_max_episode_steps.filter(|&limit| limit > 0) {
                if episode_step + 1 >= limit {
                    outcome.done = true;
                }
            }

            let metrics = self.backward(outcome.reward, outcome.done)?;
            episode_reward += outcome.reward;
            callbacks.on_step_end(&StepLogs {
                episode,
                episode_step,
                step: self.clock.step(),
                action,
                reward: outcome.reward,
                metrics,
            });
            episode_step += 1;
            self.clock.tick();

            if let Some(checkpoint) = options.checkpoint.as_ref() {
                let step = self.clock.step();
                if checkpoint.interval > 0 && step % checkpoint.interval == 0 {
                    let path = checkpoint.path_for(step);
                    info!("Step {}: saving model to {}", step, path.display());
                    self.save_weights(&path)?;
                }
            }

            if outcome.done {
                callbacks.on_episode_end(&EpisodeLogs {
                    episode,
                    episode_reward,
                    nb_episode_steps: episode_step,
                    nb_steps: self.clock.step(),
                    memory_len: Some(self.memory_lengths()),
                });
                episode += 1;
            } else {
                next_observation = Some(outcome.observation);
            }
        }

        Ok(false)
    }

    /// Act with a caller-supplied normalised action and store it for the upper agent and the
    /// chosen sub-agent. Returns the observation to act on next.
    fn pre_warm_step<E: Environment>(
        &mut self,
        env: &mut E,
        callbacks: &mut CallbackList<'_>,
        normalized: HierarchicalAction,
        observation: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let action = self.process_action(normalized.clone())?;
        callbacks.on_action_begin(&action);
        let outcome = self.process_step(env.step(&action)?)?;
        callbacks.on_action_end(&action);

        let maneuver = normalized.maneuver;
        let projected = self.router.project(maneuver, observation.view())?;
        self.memory
            .append(observation, maneuver.index(), outcome.reward, outcome.done, self.training);
        self.sub_agents[maneuver]
            .memory_mut()
            .append(projected, normalized.control, outcome.reward, false, self.training);

        let lengths = self.memory_lengths();
        debug!(
            "upper memory: {}, left: {}, straight: {}, right: {}",
            self.memory.nb_entries(),
            lengths.left,
            lengths.straight,
            lengths.right
        );

        if outcome.done {
            self.reset_environment(env)
        } else {
            Ok(outcome.observation)
        }
    }

    /// Run `options.nb_episodes` greedy episodes without storing experience.
    pub fn test<E: Environment>(
        &mut self,
        env: &mut E,
        options: &TestOptions,
        callbacks: &mut [&mut dyn Callback],
    ) -> Result<History> {
        if !self.is_compiled() {
            return Err(HrlError::NotCompiled(
                "you tried to test the agent but it hasn't been compiled yet; \
                 call compile() before test()"
                    .to_string(),
            ));
        }
        if let Some(path) = options.model_path.as_ref() {
            self.load_weights(path)?;
        }

        self.set_training(false);
        self.clock.reset();

        let mut test_logger = (options.verbose >= 1).then_some(TestLogger);
        let mut history = History::default();
        let mut list = CallbackList::new();
        for callback in callbacks.iter_mut() {
            list.push(&mut **callback);
        }
        if let Some(logger) = test_logger.as_mut() {
            list.push(logger);
        }
        list.push(&mut history);

        list.on_train_begin(&RunParams {
            nb_steps: None,
            nb_episodes: Some(options.nb_episodes),
            metrics_names: self.metrics_names(),
        });

        for episode in 0..options.nb_episodes {
            list.on_episode_begin(episode);
            let mut episode_reward = 0.0f32;
            let mut episode_step = 0u64;

            self.reset_states();
            let mut observation = self.reset_environment(env)?;

            let mut done = false;
            while !done {
                list.on_step_begin(episode_step);
                let action = self.forward(observation)?;
                let action = self.process_action(action)?;

                list.on_action_begin(&action);
                let mut outcome = self.process_step(env.step(&action)?)?;
                list.on_action_end(&action);

                if let Some(limit) = options.nb_max_episode_steps.filter(|&limit| limit > 0) {
                    if episode_step + 1 >= limit {
                        outcome.done = true;
                    }
                }

                let metrics = self.backward(outcome.reward, outcome.done)?;
                episode_reward += outcome.reward;
                list.on_step_end(&StepLogs {
                    episode,
                    episode_step,
                    step: self.clock.step(),
                    action,
                    reward: outcome.reward,
                    metrics,
                });
                episode_step += 1;
                self.clock.tick();

                done = outcome.done;
                observation = outcome.observation;
            }

            // The agent has not seen the terminal observation yet. One more forward/backward
            // pair does that; the next state is the freshly reset environment, so it is stored
            // as non-terminal.
            self.forward(observation)?;
            self.backward(0.0, false)?;

            list.on_episode_end(&EpisodeLogs {
                episode,
                episode_reward,
                nb_episode_steps: episode_step,
                nb_steps: episode_step,
                memory_len: None,
            });
        }

        list.on_train_end(false);
        Ok(history)
    }

    /// Save the upper model to `path`, each sub-agent next to it, and every normaliser that
    /// exists.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.core.model().save_weights(path)?;
        for (maneuver, sub_agent) in self.sub_agents.iter() {
            sub_agent.save_weights(&maneuver_path(path, maneuver))?;
        }

        if let Some(normalizer) = self.processor.as_ref().and_then(|p| p.normalizer()) {
            normalizer.save_param(normalizer_path(path))?;
        }
        for (maneuver, sub_agent) in self.sub_agents.iter() {
            if let Some(normalizer) = sub_agent.processor().and_then(|p| p.normalizer()) {
                normalizer.save_param(normalizer_path(&maneuver_path(path, maneuver)))?;
            }
        }
        Ok(())
    }

    /// Inverse of [`HierarchicalAgent::save_weights`]. The target models are synced to the
    /// loaded weights. A normaliser file that exists is loaded, creating the normaliser with
    /// shape `(timesteps, width)` if the processor has none yet.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.core.model_mut().load_weights(path)?;
        if self.core.is_compiled() {
            self.core.update_target_model_hard()?;
        }
        for (maneuver, sub_agent) in self.sub_agents.iter_mut() {
            sub_agent.load_weights(&maneuver_path(path, maneuver))?;
        }

        let timesteps = self.router.layout().timesteps;
        let upper_normalizer = normalizer_path(path);
        if upper_normalizer.exists() {
            let shape = (timesteps, self.router.base_width());
            let normalizer = self.processor.as_mut().and_then(|p| p.ensure_normalizer(shape));
            if let Some(normalizer) = normalizer {
                normalizer.load_param(&upper_normalizer)?;
            }
        }
        for (maneuver, sub_agent) in self.sub_agents.iter_mut() {
            let sub_normalizer = normalizer_path(&maneuver_path(path, maneuver));
            if !sub_normalizer.exists() {
                continue;
            }
            let shape = (timesteps, self.router.width(maneuver));
            let normalizer = sub_agent.processor_mut().and_then(|p| p.ensure_normalizer(shape));
            if let Some(normalizer) = normalizer {
                normalizer.load_param(&sub_normalizer)?;
            }
        }
        Ok(())
    }

    /// Nested description of every hyperparameter and component, without learned weights.
    pub fn get_config(&self) -> Value {
        let mut config = self.core.config();
        config["class_name"] = json!("HierarchicalAgent");
        config["memory"] = self.memory.config();
        config["policy"] = self.policy.config();
        config["test_policy"] = self.test_policy.config();
        config["layout"] = serde_json::to_value(self.router.layout()).unwrap_or(Value::Null);
        config["sub_agents"] = json!({
            "left": self.sub_agents.left.get_config(),
            "straight": self.sub_agents.straight.get_config(),
            "right": self.sub_agents.right.get_config(),
        });
        config
    }
}

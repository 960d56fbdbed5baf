use hdqn::{
    agent::FitHooks,
    builders::HierarchyBuilder,
    callbacks::{Callback, EpisodeLogs, RunParams, StepLogs},
    config::{FitOptions, HrlConfig, TestOptions},
    environment::{EnvStep, Environment},
    optimizer::{Adam, OptimizerWrapper, SGD},
    policy::PolicyConfig,
    types::CancellationToken,
    HierarchicalAction, HierarchicalAgent, HrlError, Maneuver, SubAgent,
};
use ndarray::Array2;
use tempfile::tempdir;

const TIMESTEPS: usize = 3;

/// Straight road: reward is the negative lateral offset of the last control, the episode
/// ends after `length` steps.
struct StraightRoad {
    length: u64,
    step: u64,
    offset: f32,
}

impl StraightRoad {
    fn new(length: u64) -> Self {
        StraightRoad { length, step: 0, offset: 0.0 }
    }

    fn observe(&self) -> Array2<f32> {
        Array2::from_shape_fn((TIMESTEPS, 56), |(t, c)| self.offset * 0.1 + (t + c) as f32 * 0.001)
    }
}

impl Environment for StraightRoad {
    fn reset(&mut self, init_state: &[f32]) -> hdqn::Result<Array2<f32>> {
        if init_state.len() != 4 {
            return Err(HrlError::Environment(format!("bad init state {:?}", init_state)));
        }
        self.step = 0;
        self.offset = 0.0;
        Ok(self.observe())
    }

    fn step(&mut self, action: &HierarchicalAction) -> hdqn::Result<EnvStep> {
        self.step += 1;
        self.offset += action.control[0] * 0.1;
        let reward = -self.offset.abs();
        Ok(EnvStep::new(self.observe(), reward, self.step >= self.length))
    }

    fn encoded_observation(&self) -> Array2<f32> {
        self.observe()
    }
}

#[derive(Default)]
struct Recorder {
    train_begin: Option<RunParams>,
    episodes_begun: usize,
    steps: Vec<u64>,
    episode_ends: Vec<EpisodeLogs>,
    train_end: Option<bool>,
}

impl Callback for Recorder {
    fn on_train_begin(&mut self, params: &RunParams) {
        self.train_begin = Some(params.clone());
    }

    fn on_episode_begin(&mut self, _episode: usize) {
        self.episodes_begun += 1;
    }

    fn on_step_end(&mut self, logs: &StepLogs) {
        assert_eq!(logs.metrics.len(), self.train_begin.as_ref().map_or(0, |p| p.metrics_names.len()));
        self.steps.push(logs.step);
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        self.episode_ends.push(logs.clone());
    }

    fn on_train_end(&mut self, did_abort: bool) {
        self.train_end = Some(did_abort);
    }
}

fn config() -> HrlConfig {
    let mut config = HrlConfig::default();
    config.layout.timesteps = TIMESTEPS;
    config.upper.batch_size = 4;
    config.upper.nb_steps_warmup = 8;
    config.upper.target_model_update = 5.0;
    config.upper.enable_double_dqn = true;
    config.upper_network.hidden_sizes = vec![16];
    for (_, sub) in config.sub_agents.iter_mut() {
        sub.dqn.batch_size = 2;
        sub.dqn.nb_steps_warmup = 8;
        sub.dqn.target_model_update = 0.01;
        sub.network.hidden_sizes = vec![16];
    }
    config
}

fn agent(config: HrlConfig) -> HierarchicalAgent {
    HierarchyBuilder::new(config)
        .seed(42)
        .optimizer(OptimizerWrapper::Adam(Adam::default()))
        .build()
        .unwrap()
}

fn quiet(nb_steps: u64) -> FitOptions {
    FitOptions { nb_steps, verbose: 0, ..FitOptions::default() }
}

#[test]
fn test_end_to_end_training() {
    let mut agent = agent(config());
    let mut env = StraightRoad::new(10);
    let mut recorder = Recorder::default();
    let hooks = FitHooks { callbacks: vec![&mut recorder as &mut dyn Callback], ..FitHooks::default() };
    let history = agent.fit(&mut env, &quiet(40), hooks).unwrap();

    assert_eq!(history.episodes(), 4);
    assert_eq!(history.nb_steps, vec![10, 20, 30, 40]);
    assert_eq!(recorder.episodes_begun, 4);
    assert_eq!(recorder.steps.len(), 40);
    assert_eq!(recorder.train_end, Some(false));

    let params = recorder.train_begin.unwrap();
    assert_eq!(params.nb_steps, Some(40));
    assert_eq!(params.metrics_names.len(), agent.metrics_names().len());

    for logs in &recorder.episode_ends {
        let lengths = logs.memory_len.as_ref().unwrap();
        assert_eq!(lengths.left + lengths.straight + lengths.right, logs.nb_steps as usize);
    }
    assert_eq!(agent.memory().nb_entries(), 40);
}

#[test]
fn test_verbose_loggers_and_log_file() {
    let dir = tempdir().unwrap();
    let log_file = dir.path().join("log.json");
    let mut agent = agent(config());
    let mut env = StraightRoad::new(6);
    let options = FitOptions { verbose: 2, log_interval: 5, log_file: Some(log_file.clone()), ..quiet(12) };
    agent.fit(&mut env, &options, FitHooks::default()).unwrap();

    let data: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&log_file).unwrap()).unwrap();
    assert_eq!(data["episode"].as_array().unwrap().len(), 2);
    assert_eq!(data["nb_steps"][1], 12);
    assert!(data.get("left_loss").is_some());
}

#[test]
fn test_weights_survive_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hdqn.bin");
    let mut trained = agent(config());
    let mut env = StraightRoad::new(10);
    trained.fit(&mut env, &quiet(20), FitHooks::default()).unwrap();
    trained.save_weights(&path).unwrap();

    let mut restored = agent(config());
    restored.load_weights(&path).unwrap();
    let state = env.observe();
    assert_eq!(trained.compute_q_values(&state).unwrap(), restored.compute_q_values(&state).unwrap());

    // test() can load the weights itself
    let mut fresh = agent(config());
    let options = TestOptions { nb_episodes: 1, verbose: 0, model_path: Some(path), ..TestOptions::default() };
    let history = fresh.test(&mut env, &options, &mut []).unwrap();
    assert_eq!(history.episodes(), 1);
    assert_eq!(fresh.compute_q_values(&state).unwrap(), trained.compute_q_values(&state).unwrap());
}

#[test]
fn test_greedy_test_episode_is_deterministic() {
    let mut agent = agent(config());
    let mut first = StraightRoad::new(5);
    let mut second = StraightRoad::new(5);
    let options = TestOptions { nb_episodes: 1, verbose: 0, ..TestOptions::default() };
    let a = agent.test(&mut first, &options, &mut []).unwrap();
    let b = agent.test(&mut second, &options, &mut []).unwrap();
    assert_eq!(a.episode_reward, b.episode_reward);
}

#[test]
fn test_cancellation_from_callback() {
    struct StopAfter {
        token: CancellationToken,
        remaining: usize,
        ended: Option<bool>,
    }
    impl Callback for StopAfter {
        fn on_step_end(&mut self, _logs: &StepLogs) {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.token.cancel();
            }
        }
        fn on_train_end(&mut self, did_abort: bool) {
            self.ended = Some(did_abort);
        }
    }

    let token = CancellationToken::new();
    let mut stopper = StopAfter { token: token.clone(), remaining: 7, ended: None };
    let mut agent = agent(config());
    let mut env = StraightRoad::new(100);
    let hooks = FitHooks { callbacks: vec![&mut stopper as &mut dyn Callback], cancellation: Some(token), ..FitHooks::default() };
    let history = agent.fit(&mut env, &quiet(1000), hooks).unwrap();

    assert!(history.did_abort);
    assert_eq!(stopper.ended, Some(true));
    assert_eq!(agent.clock().step(), 7);
    assert_eq!(agent.memory().nb_entries(), 7);
}

#[test]
fn test_config_json_round_trip_builds_same_shapes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hrl.json");
    let mut original = config();
    original.policy = PolicyConfig::LinearAnnealed {
        value_max: 1.0,
        value_min: 0.1,
        nb_steps: 100,
    };
    original.to_json_file(&path).unwrap();
    let loaded = HrlConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded, original);

    let agent = HierarchyBuilder::new(loaded)
        .optimizer(OptimizerWrapper::SGD(SGD::new()))
        .build()
        .unwrap();
    assert!(agent.metrics_names().contains(&"mean_eps".to_string()));
    assert_eq!(agent.sub_agent(Maneuver::Left).input_width(), 41);
}

#[test]
fn test_untrained_agent_cannot_run() {
    let mut agent = HierarchyBuilder::new(config()).build().unwrap();
    let mut env = StraightRoad::new(3);
    assert!(matches!(
        agent.fit(&mut env, &quiet(3), FitHooks::default()),
        Err(HrlError::NotCompiled(_))
    ));
}

//! Hooks invoked by the `fit`/`test` loops, and the loggers built on them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use log::{info, warn};
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::types::{HierarchicalAction, ManeuverSet};

/// Static information about the run, given once at the start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunParams {
    pub nb_steps: Option<u64>,
    pub nb_episodes: Option<usize>,
    pub metrics_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepLogs {
    pub episode: usize,
    pub episode_step: u64,
    /// Global step, shared by every agent of the hierarchy.
    pub step: u64,
    /// Environment action, after processing.
    pub action: HierarchicalAction,
    pub reward: f32,
    pub metrics: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeLogs {
    pub episode: usize,
    pub episode_reward: f32,
    pub nb_episode_steps: u64,
    pub nb_steps: u64,
    /// Sub-agent memory sizes at episode end (training only).
    pub memory_len: Option<ManeuverSet<usize>>,
}

/// Every hook defaults to a no-op.
pub trait Callback {
    fn on_train_begin(&mut self, _params: &RunParams) {}
    fn on_episode_begin(&mut self, _episode: usize) {}
    fn on_step_begin(&mut self, _episode_step: u64) {}
    fn on_action_begin(&mut self, _action: &HierarchicalAction) {}
    fn on_action_end(&mut self, _action: &HierarchicalAction) {}
    fn on_step_end(&mut self, _logs: &StepLogs) {}
    fn on_episode_end(&mut self, _logs: &EpisodeLogs) {}
    fn on_train_end(&mut self, _did_abort: bool) {}
}

/// Fans every hook out to a list of borrowed callbacks, in order.
#[derive(Default)]
pub struct CallbackList<'a> {
    callbacks: Vec<&'a mut dyn Callback>,
}

impl<'a> CallbackList<'a> {
    pub fn new() -> Self {
        CallbackList { callbacks: Vec::new() }
    }

    pub fn push(&mut self, callback: &'a mut dyn Callback) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl Callback for CallbackList<'_> {
    fn on_train_begin(&mut self, params: &RunParams) {
        self.callbacks.iter_mut().for_each(|c| c.on_train_begin(params));
    }

    fn on_episode_begin(&mut self, episode: usize) {
        self.callbacks.iter_mut().for_each(|c| c.on_episode_begin(episode));
    }

    fn on_step_begin(&mut self, episode_step: u64) {
        self.callbacks.iter_mut().for_each(|c| c.on_step_begin(episode_step));
    }

    fn on_action_begin(&mut self, action: &HierarchicalAction) {
        self.callbacks.iter_mut().for_each(|c| c.on_action_begin(action));
    }

    fn on_action_end(&mut self, action: &HierarchicalAction) {
        self.callbacks.iter_mut().for_each(|c| c.on_action_end(action));
    }

    fn on_step_end(&mut self, logs: &StepLogs) {
        self.callbacks.iter_mut().for_each(|c| c.on_step_end(logs));
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        self.callbacks.iter_mut().for_each(|c| c.on_episode_end(logs));
    }

    fn on_train_end(&mut self, did_abort: bool) {
        self.callbacks.iter_mut().for_each(|c| c.on_train_end(did_abort));
    }
}

/// Per-episode record returned by `fit` and `test`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub episode_reward: Vec<f32>,
    pub nb_episode_steps: Vec<u64>,
    pub nb_steps: Vec<u64>,
    pub did_abort: bool,
}

impl History {
    pub fn episodes(&self) -> usize {
        self.episode_reward.len()
    }
}

impl Callback for History {
    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        self.episode_reward.push(logs.episode_reward);
        self.nb_episode_steps.push(logs.nb_episode_steps);
        self.nb_steps.push(logs.nb_steps);
    }

    fn on_train_end(&mut self, did_abort: bool) {
        self.did_abort = did_abort;
    }
}

/// Mean over the non-NaN entries, NaN if there are none.
fn nan_mean<'a, I: IntoIterator<Item = &'a f32>>(values: I) -> f32 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
    if count == 0 { f32::NAN } else { sum / count as f32 }
}

fn column_means(rows: &[Vec<f32>], width: usize) -> Vec<f32> {
    (0..width)
        .map(|j| nan_mean(rows.iter().filter_map(|r| r.get(j))))
        .collect()
}

fn format_metrics(names: &[String], values: &[f32]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}: {:.6}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Logs reward and metric summaries every `interval` steps.
#[derive(Clone, Debug)]
pub struct TrainIntervalLogger {
    interval: u64,
    metrics_names: Vec<String>,
    rewards: Vec<f32>,
    metrics: Vec<Vec<f32>>,
    episode_rewards: Vec<f32>,
}

impl TrainIntervalLogger {
    pub fn new(interval: u64) -> Self {
        TrainIntervalLogger {
            interval: interval.max(1),
            metrics_names: Vec::new(),
            rewards: Vec::new(),
            metrics: Vec::new(),
            episode_rewards: Vec::new(),
        }
    }
}

impl Callback for TrainIntervalLogger {
    fn on_train_begin(&mut self, params: &RunParams) {
        self.metrics_names = params.metrics_names.clone();
        info!("Training for {} steps ...", params.nb_steps.unwrap_or_default());
    }

    fn on_step_end(&mut self, logs: &StepLogs) {
        self.rewards.push(logs.reward);
        self.metrics.push(logs.metrics.clone());

        let step = logs.step + 1;
        if step % self.interval == 0 {
            let means = column_means(&self.metrics, self.metrics_names.len());
            info!(
                "Interval {} ({} steps performed): {} episodes, mean step reward {:.3}, {}",
                step / self.interval,
                step,
                self.episode_rewards.len(),
                nan_mean(&self.rewards),
                format_metrics(&self.metrics_names, &means),
            );
            self.rewards.clear();
            self.metrics.clear();
            self.episode_rewards.clear();
        }
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        self.episode_rewards.push(logs.episode_reward);
    }
}

/// Logs one summary line per training episode.
#[derive(Clone, Debug, Default)]
pub struct TrainEpisodeLogger {
    metrics_names: Vec<String>,
    nb_steps: u64,
    rewards: Vec<f32>,
    metrics: Vec<Vec<f32>>,
}

impl TrainEpisodeLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Callback for TrainEpisodeLogger {
    fn on_train_begin(&mut self, params: &RunParams) {
        self.metrics_names = params.metrics_names.clone();
        self.nb_steps = params.nb_steps.unwrap_or_default();
        info!("Training for {} steps ...", self.nb_steps);
    }

    fn on_episode_begin(&mut self, _episode: usize) {
        self.rewards.clear();
        self.metrics.clear();
    }

    fn on_step_end(&mut self, logs: &StepLogs) {
        self.rewards.push(logs.reward);
        self.metrics.push(logs.metrics.clone());
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        let means = column_means(&self.metrics, self.metrics_names.len());
        let (min, max) = self
            .rewards
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &r| (lo.min(r), hi.max(r)));
        info!(
            "{}/{}: episode: {}, episode steps: {}, episode reward: {:.3}, mean reward: {:.3} [{:.3}, {:.3}], memory: {:?}, {}",
            logs.nb_steps,
            self.nb_steps,
            logs.episode + 1,
            logs.nb_episode_steps,
            logs.episode_reward,
            nan_mean(&self.rewards),
            min,
            max,
            logs.memory_len.as_ref().map(|m| [m.left, m.straight, m.right]),
            format_metrics(&self.metrics_names, &means),
        );
    }

    fn on_train_end(&mut self, did_abort: bool) {
        if did_abort {
            warn!("Training aborted before reaching {} steps", self.nb_steps);
        } else {
            info!("Training done");
        }
    }
}

/// Logs the reward of every test episode.
#[derive(Clone, Debug, Default)]
pub struct TestLogger;

impl Callback for TestLogger {
    fn on_train_begin(&mut self, params: &RunParams) {
        info!("Testing for {} episodes ...", params.nb_episodes.unwrap_or_default());
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        info!(
            "Episode {}: reward: {:.3}, steps: {}",
            logs.episode + 1,
            logs.episode_reward,
            logs.nb_episode_steps
        );
    }
}

/// Rewrites a JSON file with per-episode statistics after every episode.
#[derive(Clone, Debug)]
pub struct FileLogger {
    path: PathBuf,
    metrics_names: Vec<String>,
    episode_metrics: Vec<Vec<f32>>,
    data: BTreeMap<String, Vec<Value>>,
}

impl FileLogger {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileLogger {
            path: path.into(),
            metrics_names: Vec::new(),
            episode_metrics: Vec::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn data(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.data
    }

    fn record(&mut self, key: &str, value: Value) {
        self.data.entry(key.to_string()).or_default().push(value);
    }

    fn save(&self) -> crate::error::Result<()> {
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &self.data)?;
        Ok(())
    }
}

impl Callback for FileLogger {
    fn on_train_begin(&mut self, params: &RunParams) {
        self.metrics_names = params.metrics_names.clone();
    }

    fn on_episode_begin(&mut self, _episode: usize) {
        self.episode_metrics.clear();
    }

    fn on_step_end(&mut self, logs: &StepLogs) {
        self.episode_metrics.push(logs.metrics.clone());
    }

    fn on_episode_end(&mut self, logs: &EpisodeLogs) {
        self.record("episode", logs.episode.into());
        self.record("episode_reward", logs.episode_reward.into());
        self.record("nb_episode_steps", logs.nb_episode_steps.into());
        self.record("nb_steps", logs.nb_steps.into());

        let means = column_means(&self.episode_metrics, self.metrics_names.len());
        for (name, mean) in self.metrics_names.clone().iter().zip(means) {
            // NaN is not representable in JSON.
            let value = if mean.is_nan() { Value::Null } else { mean.into() };
            self.record(name, value);
        }

        if let Err(e) = self.save() {
            warn!("Failed to write log file {}: {}", self.path.display(), e);
        }
    }

    fn on_train_end(&mut self, _did_abort: bool) {
        if let Err(e) = self.save() {
            warn!("Failed to write log file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Maneuver;
    use ndarray::array;
    use tempfile::tempdir;

    fn step_logs(step: u64, metrics: Vec<f32>) -> StepLogs {
        StepLogs {
            episode: 0,
            episode_step: step,
            step,
            action: HierarchicalAction::new(Maneuver::Straight, array![0.0, 0.0]),
            reward: 1.0,
            metrics,
        }
    }

    fn episode_logs() -> EpisodeLogs {
        EpisodeLogs { episode: 0, episode_reward: 2.0, nb_episode_steps: 2, nb_steps: 2, memory_len: None }
    }

    #[test]
    fn test_nan_mean_skips_untrained_steps() {
        assert_eq!(nan_mean(&[f32::NAN, 1.0, 3.0]), 2.0);
        assert!(nan_mean(&[f32::NAN]).is_nan());
    }

    #[test]
    fn test_callback_list_fans_out() {
        let mut first = History::default();
        let mut second = History::default();
        {
            let mut list = CallbackList::new();
            list.push(&mut first);
            list.push(&mut second);
            list.on_episode_end(&episode_logs());
            list.on_train_end(true);
        }
        assert_eq!(first.episodes(), 1);
        assert_eq!(second.episode_reward, vec![2.0]);
        assert!(first.did_abort);
    }

    #[test]
    fn test_file_logger_writes_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut logger = FileLogger::new(&path);
        logger.on_train_begin(&RunParams { metrics_names: vec!["loss".to_string()], ..RunParams::default() });
        logger.on_episode_begin(0);
        logger.on_step_end(&step_logs(0, vec![f32::NAN]));
        logger.on_step_end(&step_logs(1, vec![0.5]));
        logger.on_episode_end(&episode_logs());

        let written: BTreeMap<String, Vec<Value>> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["episode_reward"], vec![Value::from(2.0)]);
        assert_eq!(written["loss"], vec![Value::from(0.5)]);
    }
}

//! Hooks between the agent and the environment, plus the running feature normaliser.

use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use serde::{Serialize, Deserialize};

use crate::environment::EnvStep;
use crate::error::{HrlError, Result};
use crate::types::HierarchicalAction;

/// Transforms applied around the agent. Every hook defaults to the identity.
pub trait Processor {
    /// Raw observation from `reset`/`step`, before it reaches the agent.
    fn process_observation(&mut self, observation: Array2<f32>) -> Result<Array2<f32>> {
        Ok(observation)
    }

    fn process_reward(&mut self, reward: f32) -> f32 {
        reward
    }

    fn process_step(&mut self, step: EnvStep) -> Result<EnvStep> {
        let EnvStep { observation, reward, done, info } = step;
        Ok(EnvStep {
            observation: self.process_observation(observation)?,
            reward: self.process_reward(reward),
            done,
            info,
        })
    }

    /// Agent action to environment action.
    fn process_action(&self, action: HierarchicalAction) -> Result<HierarchicalAction> {
        Ok(action)
    }

    /// Batch of flattened states, one per row, right before it is fed to a model.
    fn process_state_batch(&self, batch: Array2<f32>) -> Result<Array2<f32>> {
        Ok(batch)
    }

    fn process_reward_batch(&self, rewards: Array1<f32>) -> Array1<f32> {
        rewards
    }

    fn set_training(&mut self, _training: bool) {}

    fn metrics_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn metrics(&self) -> Vec<f32> {
        Vec::new()
    }

    fn normalizer(&self) -> Option<&WhiteningNormalizer> {
        None
    }

    /// Normaliser of this processor, created with `shape` if it has none yet.
    /// Processors that cannot carry one return `None`.
    fn ensure_normalizer(&mut self, _shape: (usize, usize)) -> Option<&mut WhiteningNormalizer> {
        None
    }
}

/// Running mean/std whitening over observations of a fixed `(timesteps, features)` shape.
///
/// Inputs may hold several stacked observations (`k * timesteps` rows); each is whitened with
/// the same statistics.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WhiteningNormalizer {
    shape: (usize, usize),
    eps: f32,
    clip_range: (f32, f32),
    sum: Array1<f64>,
    sumsq: Array1<f64>,
    count: u64,
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl WhiteningNormalizer {
    pub fn new(shape: (usize, usize)) -> Self {
        Self::with_options(shape, 1e-2, (f32::NEG_INFINITY, f32::INFINITY))
    }

    pub fn with_options(shape: (usize, usize), eps: f32, clip_range: (f32, f32)) -> Self {
        let size = shape.0 * shape.1;
        WhiteningNormalizer {
            shape,
            eps,
            clip_range,
            sum: Array1::zeros(size),
            sumsq: Array1::zeros(size),
            count: 0,
            mean: Array1::zeros(size),
            std: Array1::ones(size),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn std(&self) -> &Array1<f32> {
        &self.std
    }

    fn chunks(&self, values: usize) -> Result<usize> {
        let size = self.shape.0 * self.shape.1;
        if size == 0 || values % size != 0 {
            return Err(HrlError::dimension_mismatch(
                format!("a multiple of {} values (shape {:?})", size, self.shape),
                format!("{} values", values),
            ));
        }
        Ok(values / size)
    }

    /// Fold one or more observations into the running statistics.
    pub fn update(&mut self, x: &Array2<f32>) -> Result<()> {
        let chunks = self.chunks(x.len())?;
        let size = self.sum.len();
        let flat = x.iter().copied().collect::<Vec<f32>>();
        for chunk in flat.chunks(size) {
            for (j, &v) in chunk.iter().enumerate() {
                self.sum[j] += v as f64;
                self.sumsq[j] += (v as f64) * (v as f64);
            }
        }
        self.count += chunks as u64;

        let count = self.count as f64;
        let eps_sq = (self.eps as f64) * (self.eps as f64);
        for j in 0..size {
            let mean = self.sum[j] / count;
            self.mean[j] = mean as f32;
            self.std[j] = (self.sumsq[j] / count - mean * mean).max(eps_sq).sqrt() as f32;
        }
        Ok(())
    }

    /// `clip((x - mean) / std)`, keeping the shape of `x`.
    pub fn normalize(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.chunks(x.len())?;
        let size = self.mean.len();
        let (lo, hi) = self.clip_range;
        let mut out = x.to_owned();
        for (i, v) in out.iter_mut().enumerate() {
            let j = i % size;
            *v = ((*v - self.mean[j]) / self.std[j]).clamp(lo, hi);
        }
        Ok(out)
    }

    pub fn save_param<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serialized = bincode::serialize(self)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    /// Replace the statistics with those stored at `path`; the stored shape must match.
    pub fn load_param<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let data = std::fs::read(path)?;
        let stored: WhiteningNormalizer = bincode::deserialize(&data)?;
        if stored.shape != self.shape {
            return Err(HrlError::dimension_mismatch(
                format!("normalizer shape {:?}", self.shape),
                format!("normalizer shape {:?}", stored.shape),
            ));
        }
        *self = stored;
        Ok(())
    }
}

/// Processor for the driving task: optional observation whitening and scaling of the
/// `[-1, 1]` sub-agent controls to physical ranges.
#[derive(Clone, Debug)]
pub struct DrivingProcessor {
    normalizer: Option<WhiteningNormalizer>,
    control_ranges: Vec<[f32; 2]>,
    training: bool,
}

impl DrivingProcessor {
    pub fn new(control_ranges: Vec<[f32; 2]>) -> Self {
        DrivingProcessor { normalizer: None, control_ranges, training: true }
    }

    pub fn with_normalizer(mut self, shape: (usize, usize)) -> Self {
        self.normalizer = Some(WhiteningNormalizer::new(shape));
        self
    }

    pub fn control_ranges(&self) -> &[[f32; 2]] {
        &self.control_ranges
    }
}

impl Processor for DrivingProcessor {
    fn process_observation(&mut self, observation: Array2<f32>) -> Result<Array2<f32>> {
        if self.training {
            if let Some(normalizer) = self.normalizer.as_mut() {
                normalizer.update(&observation)?;
            }
        }
        Ok(observation)
    }

    fn process_action(&self, action: HierarchicalAction) -> Result<HierarchicalAction> {
        if self.control_ranges.is_empty() {
            return Ok(action);
        }
        if action.control.len() != self.control_ranges.len() {
            return Err(HrlError::dimension_mismatch(
                format!("{} control dimensions", self.control_ranges.len()),
                format!("{} control dimensions", action.control.len()),
            ));
        }
        let control = action
            .control
            .iter()
            .zip(self.control_ranges.iter())
            .map(|(&c, &[low, high])| low + (c.clamp(-1.0, 1.0) + 1.0) * 0.5 * (high - low))
            .collect::<Array1<f32>>();
        Ok(HierarchicalAction::new(action.maneuver, control))
    }

    fn process_state_batch(&self, batch: Array2<f32>) -> Result<Array2<f32>> {
        let Some(normalizer) = self.normalizer.as_ref() else {
            return Ok(batch);
        };
        let mut out = batch;
        for mut row in out.axis_iter_mut(Axis(0)) {
            let as_matrix = row.to_owned().insert_axis(Axis(0));
            let normalized = normalizer.normalize(&as_matrix)?;
            row.assign(&normalized.index_axis(Axis(0), 0));
        }
        Ok(out)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn normalizer(&self) -> Option<&WhiteningNormalizer> {
        self.normalizer.as_ref()
    }

    fn ensure_normalizer(&mut self, shape: (usize, usize)) -> Option<&mut WhiteningNormalizer> {
        Some(self.normalizer.get_or_insert_with(|| WhiteningNormalizer::new(shape)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Maneuver;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_normalizer_statistics() {
        let mut normalizer = WhiteningNormalizer::new((1, 2));
        normalizer.update(&array![[1.0, 10.0]]).unwrap();
        normalizer.update(&array![[3.0, 10.0]]).unwrap();
        assert_eq!(normalizer.count(), 2);
        assert_eq!(normalizer.mean(), &array![2.0, 10.0]);
        assert!((normalizer.std()[0] - 1.0).abs() < 1e-6);
        // Constant feature: std floors at eps.
        assert!((normalizer.std()[1] - 1e-2).abs() < 1e-6);

        let out = normalizer.normalize(&array![[4.0, 10.0]]).unwrap();
        assert!((out[[0, 0]] - 2.0).abs() < 1e-6);
        assert_eq!(out[[0, 1]], 0.0);
    }

    #[test]
    fn test_normalizer_rejects_wrong_size() {
        let normalizer = WhiteningNormalizer::new((2, 3));
        assert!(normalizer.normalize(&Array2::zeros((1, 5))).is_err());
        assert!(normalizer.normalize(&Array2::zeros((4, 3))).is_ok());
    }

    #[test]
    fn test_normalizer_param_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("norm.pickle");
        let mut normalizer = WhiteningNormalizer::new((2, 2));
        normalizer.update(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        normalizer.save_param(&path).unwrap();

        let mut restored = WhiteningNormalizer::new((2, 2));
        restored.load_param(&path).unwrap();
        assert_eq!(restored, normalizer);

        let mut wrong = WhiteningNormalizer::new((1, 4));
        assert!(wrong.load_param(&path).is_err());
    }

    #[test]
    fn test_action_scaling() {
        let processor = DrivingProcessor::new(vec![[-3.75, 3.75], [-3.0, 3.0]]);
        let action = HierarchicalAction::new(Maneuver::Left, array![1.0, -1.0]);
        let scaled = processor.process_action(action).unwrap();
        assert_eq!(scaled.control, array![3.75, -3.0]);

        let bad = HierarchicalAction::new(Maneuver::Left, array![0.0]);
        assert!(processor.process_action(bad).is_err());
    }

    #[test]
    fn test_statistics_frozen_outside_training() {
        let mut processor = DrivingProcessor::new(Vec::new()).with_normalizer((1, 2));
        processor.process_observation(array![[1.0, 1.0]]).unwrap();
        processor.set_training(false);
        processor.process_observation(array![[5.0, 5.0]]).unwrap();
        assert_eq!(processor.normalizer().unwrap().count(), 1);
    }

    #[test]
    fn test_observation_of_foreign_shape_is_an_error() {
        let mut processor = DrivingProcessor::new(Vec::new()).with_normalizer((1, 2));
        let err = processor.process_observation(array![[1.0, 1.0, 1.0]]).unwrap_err();
        assert!(matches!(err, HrlError::DimensionMismatch { .. }));
        assert_eq!(processor.normalizer().unwrap().count(), 0);
    }
}

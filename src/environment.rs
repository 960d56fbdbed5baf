//! Environment contract and initial-state sampling for episode resets.

use std::collections::HashMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use serde::{Serialize, Deserialize};

use crate::error::{HrlError, Result};
use crate::types::HierarchicalAction;

/// Outcome of one environment step.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvStep {
    pub observation: Array2<f32>,
    pub reward: f32,
    pub done: bool,
    pub info: HashMap<String, f32>,
}

impl EnvStep {
    pub fn new(observation: Array2<f32>, reward: f32, done: bool) -> Self {
        EnvStep { observation, reward, done, info: HashMap::new() }
    }
}

/// A simulator driven by hierarchical actions. Observations are `(timesteps, features)`.
pub trait Environment {
    fn reset(&mut self, init_state: &[f32]) -> Result<Array2<f32>>;

    fn step(&mut self, action: &HierarchicalAction) -> Result<EnvStep>;

    /// Current encoded observation, without stepping.
    fn encoded_observation(&self) -> Array2<f32>;
}

/// Source of the initial condition passed to [`Environment::reset`].
pub trait InitialStateSampler {
    fn sample(&mut self) -> Vec<f32>;
}

/// Always starts from the same state.
#[derive(Clone, Debug, PartialEq)]
pub struct FixedStart(pub Vec<f32>);

impl InitialStateSampler for FixedStart {
    fn sample(&mut self) -> Vec<f32> {
        self.0.clone()
    }
}

/// Ranges of the random `[x, y, v, heading]` start used on every episode reset.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct InitStateConfig {
    /// Longitudinal position, sampled uniformly in `[low, high)`.
    pub x_range: [f32; 2],
    /// Lateral position, one of these lane centres chosen uniformly.
    pub lane_centers: Vec<f32>,
    /// Speed, sampled uniformly in `[low, high)`.
    pub speed_range: [f32; 2],
    pub heading: f32,
}

impl Default for InitStateConfig {
    fn default() -> Self {
        let lane_width = 3.75;
        InitStateConfig {
            x_range: [-800.0, 200.0],
            lane_centers: vec![
                -150.0 - lane_width * 7.0 / 2.0,
                -150.0 - lane_width * 5.0 / 2.0,
                -150.0 - lane_width * 3.0 / 2.0,
                -150.0 - lane_width * 1.0 / 2.0,
            ],
            speed_range: [0.0, 25.0],
            heading: 0.0,
        }
    }
}

/// Random lane start: uniform `x`, uniform lane, uniform speed, fixed heading.
#[derive(Clone, Debug)]
pub struct LaneStartSampler {
    x: Uniform<f32>,
    speed: Uniform<f32>,
    lane_centers: Vec<f32>,
    heading: f32,
    rng: StdRng,
}

impl LaneStartSampler {
    pub fn new(config: &InitStateConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn seeded(config: &InitStateConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &InitStateConfig, rng: StdRng) -> Result<Self> {
        let check = |name: &str, [low, high]: [f32; 2]| {
            if low < high {
                Ok(())
            } else {
                Err(HrlError::invalid_parameter(
                    name.to_string(),
                    format!("empty range [{}, {})", low, high),
                ))
            }
        };
        check("x_range", config.x_range)?;
        check("speed_range", config.speed_range)?;
        if config.lane_centers.is_empty() {
            return Err(HrlError::invalid_parameter("lane_centers", "at least one lane is required"));
        }

        Ok(LaneStartSampler {
            x: Uniform::new(config.x_range[0], config.x_range[1]),
            speed: Uniform::new(config.speed_range[0], config.speed_range[1]),
            lane_centers: config.lane_centers.clone(),
            heading: config.heading,
            rng,
        })
    }
}

impl InitialStateSampler for LaneStartSampler {
    fn sample(&mut self) -> Vec<f32> {
        let x = self.x.sample(&mut self.rng);
        let y = self.lane_centers.choose(&mut self.rng).copied().unwrap_or_default();
        let v = self.speed.sample(&mut self.rng);
        vec![x, y, v, self.heading]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_start_within_ranges() {
        let config = InitStateConfig::default();
        let mut sampler = LaneStartSampler::seeded(&config, 7).unwrap();
        for _ in 0..100 {
            let state = sampler.sample();
            assert_eq!(state.len(), 4);
            assert!(state[0] >= -800.0 && state[0] < 200.0);
            assert!(config.lane_centers.contains(&state[1]));
            assert!(state[2] >= 0.0 && state[2] < 25.0);
            assert_eq!(state[3], 0.0);
        }
    }

    #[test]
    fn test_default_lane_centres() {
        let config = InitStateConfig::default();
        assert_eq!(config.lane_centers, vec![-163.125, -159.375, -155.625, -151.875]);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let config = InitStateConfig { speed_range: [5.0, 5.0], ..InitStateConfig::default() };
        assert!(LaneStartSampler::new(&config).is_err());
        let config = InitStateConfig { lane_centers: Vec::new(), ..InitStateConfig::default() };
        assert!(LaneStartSampler::new(&config).is_err());
    }
}

//! Action-selection policies over a Q-value vector.
//!
//! A policy is configured at construction and bound to an action count with
//! [`Policy::bind`] before first use; the owning agent does this in its constructor.

use ndarray::ArrayView1;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::{thread_rng, Rng};
use serde::{Serialize, Deserialize};
use serde_json::{json, Value};

use crate::error::{HrlError, Result};
use crate::types::StepClock;

pub trait Policy {
    /// Attach the policy to an agent with `nb_actions` discrete actions.
    fn bind(&mut self, nb_actions: usize) -> Result<()>;

    fn select_action(&mut self, q_values: ArrayView1<f32>, clock: &StepClock) -> Result<usize>;

    fn metrics_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn metrics(&self) -> Vec<f32> {
        Vec::new()
    }

    fn config(&self) -> Value;
}

fn checked_len(bound: Option<usize>, q_values: &ArrayView1<f32>) -> Result<usize> {
    let nb_actions = bound.ok_or_else(|| {
        HrlError::ProtocolViolation("policy used before bind()".to_string())
    })?;
    if q_values.len() != nb_actions {
        return Err(HrlError::dimension_mismatch(
            format!("{} Q-values", nb_actions),
            format!("{} Q-values", q_values.len()),
        ));
    }
    Ok(nb_actions)
}

fn bind_checked(nb_actions: usize) -> Result<Option<usize>> {
    if nb_actions == 0 {
        return Err(HrlError::invalid_parameter("nb_actions", "must be at least 1"));
    }
    Ok(Some(nb_actions))
}

pub(crate) fn argmax(q_values: ArrayView1<f32>) -> usize {
    q_values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Default)]
pub struct GreedyQPolicy {
    nb_actions: Option<usize>,
}

impl GreedyQPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for GreedyQPolicy {
    fn bind(&mut self, nb_actions: usize) -> Result<()> {
        self.nb_actions = bind_checked(nb_actions)?;
        Ok(())
    }

    fn select_action(&mut self, q_values: ArrayView1<f32>, _clock: &StepClock) -> Result<usize> {
        checked_len(self.nb_actions, &q_values)?;
        Ok(argmax(q_values))
    }

    fn config(&self) -> Value {
        json!({ "class_name": "GreedyQPolicy" })
    }
}

/// Random action with probability `eps`, greedy otherwise.
#[derive(Clone, Debug)]
pub struct EpsGreedyQPolicy {
    pub eps: f32,
    nb_actions: Option<usize>,
}

impl EpsGreedyQPolicy {
    pub fn new(eps: f32) -> Self {
        EpsGreedyQPolicy { eps, nb_actions: None }
    }
}

impl Default for EpsGreedyQPolicy {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl Policy for EpsGreedyQPolicy {
    fn bind(&mut self, nb_actions: usize) -> Result<()> {
        self.nb_actions = bind_checked(nb_actions)?;
        Ok(())
    }

    fn select_action(&mut self, q_values: ArrayView1<f32>, _clock: &StepClock) -> Result<usize> {
        let nb_actions = checked_len(self.nb_actions, &q_values)?;
        let mut rng = thread_rng();
        if rng.gen::<f32>() < self.eps {
            Ok(rng.gen_range(0..nb_actions))
        } else {
            Ok(argmax(q_values))
        }
    }

    fn config(&self) -> Value {
        json!({ "class_name": "EpsGreedyQPolicy", "eps": self.eps })
    }
}

/// Samples actions from `softmax(Q / tau)`, with the exponent clipped to `clip`.
#[derive(Clone, Debug)]
pub struct BoltzmannQPolicy {
    pub tau: f32,
    pub clip: [f32; 2],
    nb_actions: Option<usize>,
}

impl BoltzmannQPolicy {
    pub fn new(tau: f32, clip: [f32; 2]) -> Self {
        BoltzmannQPolicy { tau, clip, nb_actions: None }
    }
}

impl Default for BoltzmannQPolicy {
    fn default() -> Self {
        Self::new(1.0, [-500.0, 500.0])
    }
}

impl Policy for BoltzmannQPolicy {
    fn bind(&mut self, nb_actions: usize) -> Result<()> {
        if self.tau <= 0.0 {
            return Err(HrlError::invalid_parameter(
                "tau".to_string(),
                format!("must be positive, got {}", self.tau),
            ));
        }
        self.nb_actions = bind_checked(nb_actions)?;
        Ok(())
    }

    fn select_action(&mut self, q_values: ArrayView1<f32>, _clock: &StepClock) -> Result<usize> {
        checked_len(self.nb_actions, &q_values)?;
        let exp_values: Vec<f64> = q_values
            .iter()
            .map(|&q| ((q / self.tau).clamp(self.clip[0], self.clip[1]) as f64).exp())
            .collect();
        match WeightedIndex::new(&exp_values) {
            Ok(dist) => Ok(dist.sample(&mut thread_rng())),
            // All weights overflowed or vanished: fall back to the greedy choice.
            Err(_) => Ok(argmax(q_values)),
        }
    }

    fn config(&self) -> Value {
        json!({ "class_name": "BoltzmannQPolicy", "tau": self.tau, "clip": self.clip })
    }
}

/// Epsilon-greedy with `eps` annealed linearly from `value_max` to `value_min` over
/// `nb_steps` steps of the shared clock.
#[derive(Clone, Debug)]
pub struct LinearAnnealedPolicy {
    pub value_max: f32,
    pub value_min: f32,
    pub nb_steps: u64,
    inner: EpsGreedyQPolicy,
}

impl LinearAnnealedPolicy {
    pub fn new(value_max: f32, value_min: f32, nb_steps: u64) -> Self {
        LinearAnnealedPolicy { value_max, value_min, nb_steps, inner: EpsGreedyQPolicy::new(value_max) }
    }

    pub fn current_value(&self, step: u64) -> f32 {
        if self.nb_steps == 0 {
            return self.value_min;
        }
        let slope = -(self.value_max - self.value_min) / self.nb_steps as f32;
        (slope * step as f32 + self.value_max).max(self.value_min)
    }
}

impl Policy for LinearAnnealedPolicy {
    fn bind(&mut self, nb_actions: usize) -> Result<()> {
        self.inner.bind(nb_actions)
    }

    fn select_action(&mut self, q_values: ArrayView1<f32>, clock: &StepClock) -> Result<usize> {
        self.inner.eps = self.current_value(clock.step());
        self.inner.select_action(q_values, clock)
    }

    fn metrics_names(&self) -> Vec<String> {
        vec!["mean_eps".to_string()]
    }

    fn metrics(&self) -> Vec<f32> {
        vec![self.inner.eps]
    }

    fn config(&self) -> Value {
        json!({
            "class_name": "LinearAnnealedPolicy",
            "attr": "eps",
            "value_max": self.value_max,
            "value_min": self.value_min,
            "nb_steps": self.nb_steps,
            "inner_policy": self.inner.config(),
        })
    }
}

/// Serializable description of a policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    EpsGreedy { eps: f32 },
    Greedy,
    Boltzmann { tau: f32, clip: [f32; 2] },
    LinearAnnealed { value_max: f32, value_min: f32, nb_steps: u64 },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::EpsGreedy { eps: 0.1 }
    }
}

impl PolicyConfig {
    pub fn build(&self) -> Box<dyn Policy> {
        match *self {
            PolicyConfig::EpsGreedy { eps } => Box::new(EpsGreedyQPolicy::new(eps)),
            PolicyConfig::Greedy => Box::new(GreedyQPolicy::new()),
            PolicyConfig::Boltzmann { tau, clip } => Box::new(BoltzmannQPolicy::new(tau, clip)),
            PolicyConfig::LinearAnnealed { value_max, value_min, nb_steps } => {
                Box::new(LinearAnnealedPolicy::new(value_max, value_min, nb_steps))
            }
        }
    }
}

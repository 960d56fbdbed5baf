//! Bootstrapped Q-learning targets and the target-network update schedule.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Serialize, Deserialize};

use crate::error::{HrlError, Result};

/// How the target network follows the online network. Exactly one mode is active per agent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum TargetModelUpdate {
    /// Copy the online weights wholesale every `n` steps.
    Hard(u64),
    /// Blend `target <- (1 - tau) * target + tau * online` after every gradient step.
    Soft(f32),
}

impl TargetModelUpdate {
    /// Interpret the raw hyperparameter: values `>= 1` are a step count (truncated to an
    /// integer), values in `[0, 1)` a blend coefficient. Negative values are rejected.
    pub fn from_raw(value: f64) -> Result<Self> {
        if value.is_nan() || value < 0.0 {
            return Err(HrlError::invalid_parameter(
                "target_model_update".to_string(),
                format!("must be >= 0, got {}", value),
            ));
        }
        if value >= 1.0 {
            Ok(TargetModelUpdate::Hard(value as u64))
        } else {
            Ok(TargetModelUpdate::Soft(value as f32))
        }
    }

    /// Whether a hard copy is due at `step`.
    pub fn hard_update_due(&self, step: u64) -> bool {
        match *self {
            TargetModelUpdate::Hard(n) => step % n == 0,
            TargetModelUpdate::Soft(_) => false,
        }
    }

    pub fn raw(&self) -> f64 {
        match *self {
            TargetModelUpdate::Hard(n) => n as f64,
            TargetModelUpdate::Soft(tau) => tau as f64,
        }
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Value of the next state used for bootstrapping.
///
/// With `online_next` (Double DQN) the online network picks `argmax_a Q(s', a)` and the
/// target network evaluates it; otherwise the target network supplies `max_a Q'(s', a)`.
pub fn bootstrap_values(online_next: Option<ArrayView2<f32>>, target_next: ArrayView2<f32>) -> Array1<f32> {
    match online_next {
        Some(online) => {
            assert_eq!(online.dim(), target_next.dim());
            Array1::from_iter(
                online
                    .outer_iter()
                    .zip(target_next.outer_iter())
                    .map(|(selector, evaluator)| evaluator[argmax(selector)]),
            )
        }
        None => target_next.map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &v| m.max(v))),
    }
}

/// Per-action targets and masks for a batch.
///
/// Only the taken action of each row gets `reward + gamma * q_next * (1 - terminal)` and a
/// mask of one; every other slot has target and mask zero.
pub fn masked_targets(
    actions: &[usize],
    rewards: ArrayView1<f32>,
    terminal1: ArrayView1<f32>,
    q_next: ArrayView1<f32>,
    gamma: f32,
    nb_actions: usize,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let batch = actions.len();
    assert_eq!(rewards.len(), batch);
    assert_eq!(terminal1.len(), batch);
    assert_eq!(q_next.len(), batch);

    let mut targets = Array2::zeros((batch, nb_actions));
    let mut masks = Array2::zeros((batch, nb_actions));
    for (i, &action) in actions.iter().enumerate() {
        if action >= nb_actions {
            return Err(HrlError::InvalidAction { action, max_actions: nb_actions });
        }
        let discounted = gamma * q_next[i] * (1.0 - terminal1[i]);
        targets[[i, action]] = rewards[i] + discounted;
        masks[[i, action]] = 1.0;
    }
    Ok((targets, masks))
}

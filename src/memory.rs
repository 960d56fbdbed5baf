use std::collections::VecDeque;

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde_json::{json, Value};

use crate::config::MemoryConfig;
use crate::error::{HrlError, Result};

/// A sampled transition. `state0`/`state1` are `window_length` observations stacked
/// along the row axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Experience<A> {
    pub state0: Array2<f32>,
    pub action: A,
    pub reward: f32,
    pub terminal1: bool,
    pub state1: Array2<f32>,
}

/// One appended step: the observation the agent acted on, the action taken, and the
/// reward/terminal flag that followed it.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryEntry<A> {
    pub observation: Array2<f32>,
    pub action: A,
    pub reward: f32,
    pub terminal: bool,
}

/// Bounded, append-only experience store.
///
/// Entry `i` together with the observation of entry `i + 1` forms a transition, so the
/// newest entry only becomes sampleable once its successor has been appended.
#[derive(Clone, Debug)]
pub struct SequentialMemory<A> {
    limit: usize,
    window_length: usize,
    entries: VecDeque<MemoryEntry<A>>,
    recent_observations: VecDeque<Array2<f32>>,
    recent_terminals: VecDeque<bool>,
}

impl<A: Clone> SequentialMemory<A> {
    pub fn new(limit: usize, window_length: usize) -> Result<Self> {
        if limit == 0 {
            return Err(HrlError::invalid_parameter("limit", "must be at least 1"));
        }
        if window_length == 0 {
            return Err(HrlError::invalid_parameter("window_length", "must be at least 1"));
        }
        Ok(SequentialMemory {
            limit,
            window_length,
            entries: VecDeque::with_capacity(limit.min(4096)),
            recent_observations: VecDeque::with_capacity(window_length),
            recent_terminals: VecDeque::with_capacity(window_length),
        })
    }

    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        Self::new(config.limit, config.window_length)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn nb_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry<A>> {
        self.entries.iter()
    }

    /// Record a step. Outside training only the recent window used by
    /// [`SequentialMemory::get_recent_state`] is updated.
    pub fn append(&mut self, observation: Array2<f32>, action: A, reward: f32, terminal: bool, training: bool) {
        if self.recent_observations.len() == self.window_length {
            self.recent_observations.pop_front();
            self.recent_terminals.pop_front();
        }
        self.recent_observations.push_back(observation.clone());
        self.recent_terminals.push_back(terminal);

        if training {
            if self.entries.len() == self.limit {
                self.entries.pop_front();
            }
            self.entries.push_back(MemoryEntry { observation, action, reward, terminal });
        }
    }

    /// Forget the recent window, e.g. at the start of an episode.
    pub fn reset_recent(&mut self) {
        self.recent_observations.clear();
        self.recent_terminals.clear();
    }

    /// State for acting on `current`: the current observation preceded by up to
    /// `window_length - 1` recent observations of the same episode, zero-padded in front.
    pub fn get_recent_state<'a>(&'a self, current: ArrayView2<'a, f32>) -> Array2<f32> {
        let mut frames: Vec<ArrayView2<'a, f32>> = vec![current];
        for (observation, &terminal) in self.recent_observations.iter().zip(self.recent_terminals.iter()).rev() {
            if frames.len() == self.window_length || terminal {
                break;
            }
            frames.push(observation.view());
        }
        stack_frames(frames, current.dim(), self.window_length)
    }

    fn stacked_state(&self, last: usize) -> Array2<f32> {
        let current = self.entries[last].observation.view();
        let mut frames = vec![current];
        let mut index = last;
        while frames.len() < self.window_length && index > 0 {
            index -= 1;
            if self.entries[index].terminal {
                break;
            }
            frames.push(self.entries[index].observation.view());
        }
        stack_frames(frames, current.dim(), self.window_length)
    }

    /// Sample up to `batch_size` distinct transitions uniformly.
    ///
    /// Returns fewer than `batch_size` experiences when the memory is too small; callers that
    /// need an exact batch must check the length.
    pub fn sample(&self, batch_size: usize) -> Vec<Experience<A>> {
        let available = self.entries.len().saturating_sub(1);
        let mut indices: Vec<usize> = (0..available).collect();
        indices.shuffle(&mut thread_rng());
        indices.truncate(batch_size);

        indices
            .into_iter()
            .map(|i| {
                let entry = &self.entries[i];
                Experience {
                    state0: self.stacked_state(i),
                    action: entry.action.clone(),
                    reward: entry.reward,
                    terminal1: entry.terminal,
                    state1: self.stacked_state(i + 1),
                }
            })
            .collect()
    }

    pub fn config(&self) -> Value {
        json!({
            "class_name": "SequentialMemory",
            "limit": self.limit,
            "window_length": self.window_length,
        })
    }
}

/// `frames` is newest first; the result is oldest first with zero frames in front.
fn stack_frames<'a>(frames: Vec<ArrayView2<'a, f32>>, dim: (usize, usize), window_length: usize) -> Array2<f32> {
    if window_length == 1 {
        return frames[0].to_owned();
    }
    let padding = Array2::<f32>::zeros(dim);
    let mut ordered: Vec<ArrayView2<'_, f32>> = Vec::with_capacity(window_length);
    for _ in frames.len()..window_length {
        ordered.push(padding.view());
    }
    ordered.extend(frames.into_iter().rev().map(|f| f.reborrow()));
    concatenate(Axis(0), &ordered).unwrap_or_else(|_| Array2::zeros((dim.0 * window_length, dim.1)))
}

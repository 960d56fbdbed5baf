//! Q-value model: maps a batch of flattened states to one Q-value per discrete action.
//!
//! With a dueling head the underlying network emits `nb_actions + 1` columns, column 0 being
//! the state value `V(s)` and the rest the advantages `A(s, a)`, which are recombined:
//!
//! - `avg`:   `Q(s,a) = V(s) + (A(s,a) - mean_a A(s,a))`
//! - `max`:   `Q(s,a) = V(s) + (A(s,a) - max_a A(s,a))`
//! - `naive`: `Q(s,a) = V(s) + A(s,a)`

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Serialize, Deserialize};
use serde_json::{json, Value};

use crate::activations::Activation;
use crate::error::{HrlError, Result};
use crate::network::NeuralNetwork;
use crate::optimizer::Optimizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuelingType {
    Avg,
    Max,
    Naive,
}

impl DuelingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuelingType::Avg => "avg",
            DuelingType::Max => "max",
            DuelingType::Naive => "naive",
        }
    }
}

impl fmt::Display for DuelingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuelingType {
    type Err = HrlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "avg" => Ok(DuelingType::Avg),
            "max" => Ok(DuelingType::Max),
            "naive" => Ok(DuelingType::Naive),
            other => Err(HrlError::invalid_parameter(
                "dueling_type".to_string(),
                format!("must be one of {{'avg','max','naive'}}, got '{}'", other),
            )),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QNetwork {
    network: NeuralNetwork,
    nb_actions: usize,
    dueling: Option<DuelingType>,
    #[serde(skip)]
    last_raw: Option<Array2<f32>>,
}

impl QNetwork {
    /// ReLU hidden layers and a linear output of `nb_actions` units.
    pub fn new(input_size: usize, hidden_sizes: &[usize], nb_actions: usize) -> Result<Self> {
        Self::with_activation(input_size, hidden_sizes, Activation::Relu, nb_actions, None)
    }

    /// Same body as [`QNetwork::new`] with the last layer widened to `nb_actions + 1`
    /// and recombined according to `dueling_type`.
    pub fn dueling(input_size: usize, hidden_sizes: &[usize], nb_actions: usize, dueling_type: &str) -> Result<Self> {
        let dueling = dueling_type.parse::<DuelingType>()?;
        Self::with_activation(input_size, hidden_sizes, Activation::Relu, nb_actions, Some(dueling))
    }

    /// Hidden layers use `hidden_activation`; the output layer is always linear.
    pub fn with_activation(
        input_size: usize,
        hidden_sizes: &[usize],
        hidden_activation: Activation,
        nb_actions: usize,
        dueling: Option<DuelingType>,
    ) -> Result<Self> {
        if nb_actions == 0 {
            return Err(HrlError::invalid_parameter("nb_actions", "must be at least 1"));
        }
        let head = if dueling.is_some() { nb_actions + 1 } else { nb_actions };

        let mut sizes = Vec::with_capacity(hidden_sizes.len() + 2);
        sizes.push(input_size);
        sizes.extend_from_slice(hidden_sizes);
        sizes.push(head);

        let mut activations = vec![hidden_activation; hidden_sizes.len()];
        activations.push(Activation::Linear);

        let network = NeuralNetwork::new(&sizes, &activations)?;
        Ok(QNetwork { network, nb_actions, dueling, last_raw: None })
    }

    pub fn nb_actions(&self) -> usize {
        self.nb_actions
    }

    pub fn input_size(&self) -> usize {
        self.network.input_size()
    }

    pub fn dueling_type(&self) -> Option<DuelingType> {
        self.dueling
    }

    pub fn network(&self) -> &NeuralNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut NeuralNetwork {
        &mut self.network
    }

    fn combine(&self, raw: &Array2<f32>) -> Array2<f32> {
        let Some(dueling) = self.dueling else {
            return raw.clone();
        };
        let value = raw.slice(s![.., 0..1]);
        let advantage = raw.slice(s![.., 1..]);
        let q = &advantage + &value;
        match dueling {
            DuelingType::Naive => q,
            DuelingType::Avg => {
                let mean = advantage.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(raw.nrows()));
                q - &mean.insert_axis(Axis(1))
            }
            DuelingType::Max => {
                let max = advantage.map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &v| m.max(v)));
                q - &max.insert_axis(Axis(1))
            }
        }
    }

    /// Q-values for a batch of states.
    pub fn predict_batch(&self, states: ArrayView2<f32>) -> Result<Array2<f32>> {
        let raw = self.network.predict_batch(states)?;
        Ok(self.combine(&raw))
    }

    /// Q-values for a batch, caching activations for [`QNetwork::apply_output_gradients`].
    pub fn forward_batch(&mut self, states: ArrayView2<f32>) -> Result<Array2<f32>> {
        let raw = self.network.forward_batch(states)?;
        let q = self.combine(&raw);
        self.last_raw = Some(raw);
        Ok(q)
    }

    /// Backpropagate dLoss/dQ through the head and update the body.
    pub fn apply_output_gradients<O: Optimizer>(
        &mut self,
        q_gradients: ArrayView2<f32>,
        optimizer: &mut O,
        learning_rate: f32,
    ) -> Result<()> {
        let raw_gradients = match self.dueling {
            None => q_gradients.to_owned(),
            Some(dueling) => {
                let raw = self.last_raw.as_ref().ok_or_else(|| {
                    HrlError::Training("forward_batch() must be called before applying gradients".to_string())
                })?;
                let (rows, n) = q_gradients.dim();
                let mut raw_grad = Array2::zeros((rows, n + 1));
                for (i, g) in q_gradients.outer_iter().enumerate() {
                    let total = g.sum();
                    raw_grad[[i, 0]] = total;
                    let argmax = raw.row(i).slice(s![1..])
                        .iter()
                        .enumerate()
                        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                        .map(|(idx, _)| idx)
                        .unwrap_or(0);
                    for k in 0..n {
                        raw_grad[[i, k + 1]] = match dueling {
                            DuelingType::Naive => g[k],
                            DuelingType::Avg => g[k] - total / n as f32,
                            DuelingType::Max => if k == argmax { g[k] - total } else { g[k] },
                        };
                    }
                }
                raw_grad
            }
        };
        self.network.apply_gradients(raw_gradients.view(), optimizer, learning_rate);
        Ok(())
    }

    pub fn get_weights(&self) -> Vec<(Array2<f32>, Array1<f32>)> {
        self.network.get_weights()
    }

    pub fn set_weights(&mut self, weights: &[(Array2<f32>, Array1<f32>)]) -> Result<()> {
        self.network.set_weights(weights)
    }

    /// `self <- (1 - tau) * self + tau * source`
    pub fn blend_from(&mut self, source: &QNetwork, tau: f32) {
        self.network.blend_from(&source.network, tau);
    }

    pub fn reset_states(&mut self) {
        self.network.reset_states();
        self.last_raw = None;
    }

    /// Save the model (architecture and weights) with bincode.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serialized = bincode::serialize(self)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    /// Load weights saved by [`QNetwork::save_weights`] into this model.
    /// The stored architecture must match.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let data = std::fs::read(path)?;
        let stored: QNetwork = bincode::deserialize(&data)?;
        if stored.nb_actions != self.nb_actions || stored.dueling != self.dueling {
            return Err(HrlError::dimension_mismatch(
                format!("{} actions ({:?} head)", self.nb_actions, self.dueling),
                format!("{} actions ({:?} head)", stored.nb_actions, stored.dueling),
            ));
        }
        self.set_weights(&stored.get_weights())
    }

    pub fn config(&self) -> Value {
        let layers: Vec<Value> = self.network.layers
            .iter()
            .map(|l| json!({
                "input_size": l.input_size(),
                "output_size": l.output_size(),
                "activation": l.activation.name(),
            }))
            .collect();
        json!({
            "class_name": "QNetwork",
            "config": {
                "nb_actions": self.nb_actions,
                "dueling_type": self.dueling.map(|d| d.as_str()),
                "layers": layers,
            }
        })
    }
}

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Serialize, Deserialize};

use crate::activations::Activation;
use crate::error::{HrlError, Result};
use crate::layers::DenseLayer;
use crate::optimizer::Optimizer;

/// A feed-forward stack of dense layers.
///
/// The optimizer is not part of the network: it is owned by whichever trainer updates the
/// weights, so that a frozen copy (a target network) can be cloned without optimizer state.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NeuralNetwork {
    pub layers: Vec<DenseLayer>,
}

impl NeuralNetwork {
    /// Create a new neural network with the given layer sizes and activations.
    pub fn new(layer_sizes: &[usize], activations: &[Activation]) -> Result<Self> {
        if layer_sizes.len() < 2 {
            return Err(HrlError::invalid_parameter(
                "layer_sizes",
                "Network must have at least input and output layers",
            ));
        }
        if layer_sizes.len() - 1 != activations.len() {
            return Err(HrlError::invalid_parameter(
                "activations",
                "Number of activations must match number of layers - 1",
            ));
        }

        let layers = layer_sizes
            .windows(2)
            .zip(activations.iter())
            .map(|(window, &activation)| DenseLayer::new(window[0], window[1], activation))
            .collect::<Vec<_>>();

        Ok(NeuralNetwork { layers })
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.input_size()).unwrap_or(0)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.output_size()).unwrap_or(0)
    }

    fn check_input(&self, inputs: &ArrayView2<f32>) -> Result<()> {
        if inputs.ncols() != self.input_size() {
            return Err(HrlError::dimension_mismatch(
                format!("{} input features", self.input_size()),
                format!("{} input features", inputs.ncols()),
            ));
        }
        Ok(())
    }

    /// Inference pass for a batch of inputs.
    pub fn predict_batch(&self, inputs: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(&inputs)?;
        let mut current = inputs.to_owned();
        for layer in &self.layers {
            current = layer.predict_batch(current.view());
        }
        Ok(current)
    }

    /// Forward pass that caches activations for a subsequent `apply_gradients`.
    pub fn forward_batch(&mut self, inputs: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(&inputs)?;
        let mut current = inputs.to_owned();
        for layer in &mut self.layers {
            current = layer.forward_batch(current.view());
        }
        Ok(current)
    }

    /// Backpropagate `output_gradients` (dLoss/dOutput of the last `forward_batch`) and
    /// apply one optimizer update to every layer.
    pub fn apply_gradients<O: Optimizer>(
        &mut self,
        output_gradients: ArrayView2<f32>,
        optimizer: &mut O,
        learning_rate: f32,
    ) {
        let mut gradients: Vec<(Array2<f32>, Array1<f32>)> = Vec::with_capacity(self.layers.len());
        let mut current_error = output_gradients.to_owned();

        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            let (adjusted_error, weight_gradients, bias_gradients) = layer.backward_batch(current_error.view());
            gradients.push((weight_gradients, bias_gradients));
            if i != 0 {
                current_error = adjusted_error.dot(&layer.weights.t());
            }
        }
        gradients.reverse();

        for (index, (layer, (weight_gradients, bias_gradients))) in self.layers.iter_mut().zip(gradients).enumerate() {
            optimizer.update_weights(index, &mut layer.weights, &weight_gradients, learning_rate);
            optimizer.update_biases(index, &mut layer.biases, &bias_gradients, learning_rate);
        }
        optimizer.step();
    }

    /// Weights and biases of every layer, in order.
    pub fn get_weights(&self) -> Vec<(Array2<f32>, Array1<f32>)> {
        self.layers
            .iter()
            .map(|l| (l.weights.clone(), l.biases.clone()))
            .collect()
    }

    /// Replace all parameters. Shapes must match the current architecture.
    pub fn set_weights(&mut self, weights: &[(Array2<f32>, Array1<f32>)]) -> Result<()> {
        if weights.len() != self.layers.len() {
            return Err(HrlError::dimension_mismatch(
                format!("{} layers", self.layers.len()),
                format!("{} layers", weights.len()),
            ));
        }
        for (index, (layer, (w, b))) in self.layers.iter().zip(weights).enumerate() {
            if layer.weights.dim() != w.dim() || layer.biases.dim() != b.dim() {
                return Err(HrlError::dimension_mismatch(
                    format!("layer {} of shape {:?}", index, layer.weights.dim()),
                    format!("layer {} of shape {:?}", index, w.dim()),
                ));
            }
        }
        for (layer, (w, b)) in self.layers.iter_mut().zip(weights) {
            layer.weights.assign(w);
            layer.biases.assign(b);
        }
        Ok(())
    }

    /// Polyak blend: `self <- (1 - tau) * self + tau * source`.
    pub fn blend_from(&mut self, source: &NeuralNetwork, tau: f32) {
        for (target, source) in self.layers.iter_mut().zip(source.layers.iter()) {
            target.weights.zip_mut_with(&source.weights, |t, &s| *t = (1.0 - tau) * *t + tau * s);
            target.biases.zip_mut_with(&source.biases, |t, &s| *t = (1.0 - tau) * *t + tau * s);
        }
    }

    /// Drop cached activations. Dense stacks carry no recurrent state beyond that.
    pub fn reset_states(&mut self) {
        for layer in &mut self.layers {
            layer.clear_cache();
        }
    }
}

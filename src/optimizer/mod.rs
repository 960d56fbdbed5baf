use ndarray::{Array1, Array2};
use serde::{Serialize, Deserialize};
use serde_json::{json, Value};

/// Gradient-descent update rule applied layer by layer.
///
/// `layer` identifies the parameter slot so stateful optimizers can keep per-layer moments.
pub trait Optimizer {
    fn update_weights(&mut self, layer: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32);
    fn update_biases(&mut self, layer: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32);

    /// Called once after every parameter of a batch update has been applied.
    fn step(&mut self) {}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum OptimizerWrapper {
    SGD(SGD),
    Adam(Adam),
}

impl OptimizerWrapper {
    pub fn config(&self) -> Value {
        match self {
            OptimizerWrapper::SGD(_) => json!({ "class_name": "SGD" }),
            OptimizerWrapper::Adam(adam) => json!({
                "class_name": "Adam",
                "beta1": adam.beta1,
                "beta2": adam.beta2,
                "epsilon": adam.epsilon,
            }),
        }
    }
}

impl Optimizer for OptimizerWrapper {
    fn update_weights(&mut self, layer: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_weights(layer, weights, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_weights(layer, weights, gradients, learning_rate),
        }
    }

    fn update_biases(&mut self, layer: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_biases(layer, biases, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_biases(layer, biases, gradients, learning_rate),
        }
    }

    fn step(&mut self) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.step(),
            OptimizerWrapper::Adam(optimizer) => optimizer.step(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SGD;

impl SGD {
    pub fn new() -> SGD {
        SGD
    }
}

impl Optimizer for SGD {
    fn update_weights(&mut self, _layer: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        weights.zip_mut_with(gradients, |w, &g| *w -= learning_rate * g);
    }

    fn update_biases(&mut self, _layer: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        biases.zip_mut_with(gradients, |b, &g| *b -= learning_rate * g);
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Moments<D> {
    m: D,
    v: D,
}

/// Adam with per-layer first and second moments, allocated on first use.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    weights: Vec<Option<Moments<Array2<f32>>>>,
    biases: Vec<Option<Moments<Array1<f32>>>>,
    pub t: i32,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Adam {
            beta1,
            beta2,
            epsilon,
            weights: Vec::new(),
            biases: Vec::new(),
            t: 1,
        }
    }

    fn bias_corrections(&self) -> (f32, f32) {
        (1.0 - self.beta1.powi(self.t), 1.0 - self.beta2.powi(self.t))
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

fn slot<T>(slots: &mut Vec<Option<T>>, index: usize) -> &mut Option<T> {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    &mut slots[index]
}

impl Optimizer for Adam {
    fn update_weights(&mut self, layer: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let (c1, c2) = self.bias_corrections();
        let moments = slot(&mut self.weights, layer).get_or_insert_with(|| Moments {
            m: Array2::zeros(weights.dim()),
            v: Array2::zeros(weights.dim()),
        });

        moments.m.zip_mut_with(gradients, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        moments.v.zip_mut_with(gradients, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        ndarray::Zip::from(weights)
            .and(&moments.m)
            .and(&moments.v)
            .for_each(|w, &m, &v| {
                let m_hat = m / c1;
                let v_hat = v / c2;
                *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
    }

    fn update_biases(&mut self, layer: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let (c1, c2) = self.bias_corrections();
        let moments = slot(&mut self.biases, layer).get_or_insert_with(|| Moments {
            m: Array1::zeros(biases.dim()),
            v: Array1::zeros(biases.dim()),
        });

        moments.m.zip_mut_with(gradients, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        moments.v.zip_mut_with(gradients, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        ndarray::Zip::from(biases)
            .and(&moments.m)
            .and(&moments.v)
            .for_each(|b, &m, &v| {
                let m_hat = m / c1;
                let v_hat = v / c2;
                *b -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
    }

    fn step(&mut self) {
        self.t += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sgd_update() {
        let mut sgd = SGD::new();
        let mut w = array![[1.0, 2.0]];
        sgd.update_weights(0, &mut w, &array![[0.5, -0.5]], 0.1);
        assert!((w[[0, 0]] - 0.95).abs() < 1e-6);
        assert!((w[[0, 1]] - 2.05).abs() < 1e-6);
    }

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut adam = Adam::default();
        let mut b = array![0.0, 0.0];
        adam.update_biases(3, &mut b, &array![1.0, -1.0], 0.01);
        adam.step();
        assert!(b[0] < 0.0);
        assert!(b[1] > 0.0);
        assert_eq!(adam.t, 2);
    }
}

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Huber loss (smooth L1) clipped at `delta`.
///
/// `delta = f32::INFINITY` degenerates to the plain squared loss `0.5 * x^2`.
#[derive(Clone, Copy, Debug)]
pub struct HuberLoss {
    pub delta: f32,
}

impl HuberLoss {
    pub fn new(delta: f32) -> Self {
        HuberLoss { delta }
    }

    fn value(&self, x: f32) -> f32 {
        let abs_x = x.abs();
        if self.delta.is_infinite() || abs_x <= self.delta {
            0.5 * x * x
        } else {
            self.delta * abs_x - 0.5 * self.delta * self.delta
        }
    }

    fn derivative(&self, x: f32) -> f32 {
        if self.delta.is_infinite() {
            x
        } else {
            x.clamp(-self.delta, self.delta)
        }
    }

    /// Per-sample loss where only columns with a non-zero mask contribute.
    pub fn compute_masked(
        &self,
        predictions: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        masks: ArrayView2<f32>,
    ) -> Array1<f32> {
        let diff = &predictions - &targets;
        (diff.mapv(|x| self.value(x)) * &masks).sum_axis(Axis(1))
    }

    /// Gradient of the batch-mean masked loss with respect to the predictions.
    pub fn gradient_masked(
        &self,
        predictions: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        masks: ArrayView2<f32>,
    ) -> Array2<f32> {
        let batch_size = predictions.nrows().max(1) as f32;
        let diff = &predictions - &targets;
        diff.mapv(|x| self.derivative(x)) * &masks / batch_size
    }
}

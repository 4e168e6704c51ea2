//! Adaptive gradient descent for the model parameters.

use itertools::izip;
use ndarray::{Array, ArrayView, ArrayViewMut, Axis, Dimension, Zip};

use crate::models::toppush::{BatchGradients, Parameters};
use crate::PlaylistId;

/// Adam with bias correction.
///
/// First and second moment estimates are kept per parameter entry and
/// persist across batches and epochs; they are never reset mid-run. The
/// song feature matrix and bias vector receive a dense update on every
/// step, while playlist feature rows are updated only when a batch
/// touches them. A single step counter is shared by all parameters.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    song_features: Moments<ndarray::Ix2>,
    song_biases: Moments<ndarray::Ix1>,
    playlist_features: Moments<ndarray::Ix2>,
}

#[derive(Clone, Debug)]
struct Moments<D: Dimension> {
    first: Array<f32, D>,
    second: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    fn zeros_like(param: &Array<f32, D>) -> Self {
        Moments {
            first: Array::zeros(param.raw_dim()),
            second: Array::zeros(param.raw_dim()),
        }
    }
}

fn update_view<D: Dimension>(
    param: ArrayViewMut<f32, D>,
    first: ArrayViewMut<f32, D>,
    second: ArrayViewMut<f32, D>,
    grad: ArrayView<f32, D>,
    corrected_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
) {
    Zip::from(param)
        .and(first)
        .and(second)
        .and(grad)
        .for_each(|value, first, second, &grad| {
            *first = beta1 * *first + (1.0 - beta1) * grad;
            *second = beta2 * *second + (1.0 - beta2) * grad * grad;
            *value -= corrected_rate * *first / (second.sqrt() + epsilon);
        });
}

impl Adam {
    /// Create an optimizer with zeroed moment buffers shaped like
    /// `params`, using the standard decay rates.
    pub fn new(learning_rate: f32, params: &Parameters) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            song_features: Moments::zeros_like(&params.song_features),
            song_biases: Moments::zeros_like(&params.song_biases),
            playlist_features: Moments::zeros_like(&params.playlist_features),
        }
    }

    /// Number of steps taken so far.
    pub fn num_steps(&self) -> usize {
        self.step as usize
    }

    /// Apply one update to the song features, the song biases, and the
    /// playlist rows referenced by `batch`.
    ///
    /// A playlist appearing more than once in the batch (wrap-around
    /// padding) has its row updated once per occurrence, in batch order.
    pub fn apply(&mut self, params: &mut Parameters, grads: &BatchGradients, batch: &[PlaylistId]) {
        self.step += 1;

        let corrected_rate = self.learning_rate * (1.0 - self.beta2.powi(self.step)).sqrt()
            / (1.0 - self.beta1.powi(self.step));

        update_view(
            params.song_features.view_mut(),
            self.song_features.first.view_mut(),
            self.song_features.second.view_mut(),
            grads.song_features.view(),
            corrected_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
        );
        update_view(
            params.song_biases.view_mut(),
            self.song_biases.first.view_mut(),
            self.song_biases.second.view_mut(),
            grads.song_biases.view(),
            corrected_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
        );

        for (&playlist, grad_row) in izip!(batch, grads.playlist_rows.axis_iter(Axis(0))) {
            update_view(
                params.playlist_features.row_mut(playlist),
                self.playlist_features.first.row_mut(playlist),
                self.playlist_features.second.row_mut(playlist),
                grad_row,
                corrected_rate,
                self.beta1,
                self.beta2,
                self.epsilon,
            );
        }
    }
}

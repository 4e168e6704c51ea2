//! The Top-Push embedding model.
//!
//! Scores are bilinear: `f(m, n) = S[:, m] . P[n, :] + b[m]` for song
//! feature matrix `S`, playlist feature matrix `P`, and song bias vector
//! `b`. Training pushes, for every playlist, the scores of member songs
//! above the score of the single hardest non-member song, via a
//! squared-hinge surrogate of the Top-Push ranking loss.

use std::path::Path;

use ndarray::{s, Array1, Array2};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{BatchPositives, EpochBatches, Membership, ParameterBlob};
use crate::optim::Adam;
use crate::{FittingError, SongId};

fn embedding_init<R: Rng>(rows: usize, cols: usize, dim: usize, rng: &mut R) -> Array2<f32> {
    let scale = 1.0 / dim as f32;

    Array2::from_shape_fn((rows, cols), |_| {
        let sample: f64 = rng.sample(StandardNormal);
        sample as f32 * scale
    })
}

/// Hyperparameters for the Top-Push model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    embedding_dim: usize,
    num_epochs: usize,
    minibatch_size: usize,
    learning_rate: f32,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters with the given embedding dimension.
    pub fn new(embedding_dim: usize) -> Self {
        Hyperparameters {
            embedding_dim,
            num_epochs: 10,
            minibatch_size: 256,
            learning_rate: 0.001,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Set the number of training epochs.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the number of playlists per mini-batch.
    pub fn minibatch_size(mut self, minibatch_size: usize) -> Self {
        assert!(minibatch_size > 0, "minibatch size must be positive");
        self.minibatch_size = minibatch_size;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Seed the random number generator governing parameter
    /// initialization and epoch shuffling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = XorShiftRng::seed_from_u64(seed);
        self
    }

    /// Build a model for a `num_playlists` by `num_songs` membership
    /// matrix, initializing its parameters from the seeded generator.
    pub fn build(mut self, num_playlists: usize, num_songs: usize) -> TopPushModel {
        let params = Parameters::new(num_playlists, num_songs, self.embedding_dim, &mut self.rng);
        let optimizer = Adam::new(self.learning_rate, &params);

        TopPushModel {
            hyper: self,
            params,
            optimizer,
        }
    }
}

/// The learnable parameter aggregate.
///
/// All three members share the embedding dimension and are updated
/// jointly: one optimizer step per batch is the only mutation path.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub(crate) song_features: Array2<f32>,
    pub(crate) song_biases: Array1<f32>,
    pub(crate) playlist_features: Array2<f32>,
}

impl Parameters {
    /// Initialize parameters for the given shapes. Feature entries are
    /// drawn from `Normal(0, 1 / embedding_dim)`; biases start at zero.
    pub fn new<R: Rng>(
        num_playlists: usize,
        num_songs: usize,
        embedding_dim: usize,
        rng: &mut R,
    ) -> Self {
        Parameters {
            song_features: embedding_init(embedding_dim, num_songs, embedding_dim, rng),
            song_biases: Array1::zeros(num_songs),
            playlist_features: embedding_init(num_playlists, embedding_dim, embedding_dim, rng),
        }
    }

    /// The embedding dimension.
    pub fn embedding_dim(&self) -> usize {
        self.song_features.nrows()
    }

    /// Number of song columns.
    pub fn num_songs(&self) -> usize {
        self.song_features.ncols()
    }

    /// Number of playlist rows.
    pub fn num_playlists(&self) -> usize {
        self.playlist_features.nrows()
    }
}

/// Reusable gradient buffers for one batch.
#[derive(Clone, Debug)]
pub struct BatchGradients {
    pub(crate) song_features: Array2<f32>,
    pub(crate) song_biases: Array1<f32>,
    pub(crate) playlist_rows: Array2<f32>,
}

impl BatchGradients {
    /// Allocate zeroed buffers for the given shapes.
    pub fn zeros(embedding_dim: usize, num_songs: usize, minibatch_size: usize) -> Self {
        BatchGradients {
            song_features: Array2::zeros((embedding_dim, num_songs)),
            song_biases: Array1::zeros(num_songs),
            playlist_rows: Array2::zeros((minibatch_size, embedding_dim)),
        }
    }

    fn zero(&mut self) {
        self.song_features.fill(0.0);
        self.song_biases.fill(0.0);
        self.playlist_rows.fill(0.0);
    }
}

/// For every batch row, find the column index and score of the
/// highest-scoring song _not_ in that row's positive set.
///
/// The dense score row is walked against the row's sorted positive
/// columns, so no dense mask is materialized. Ties are broken by the
/// first column attaining the maximum; gradient is routed to that column
/// alone.
pub(crate) fn hardest_negatives(
    scores: &Array2<f32>,
    positives: &BatchPositives,
) -> Vec<(SongId, f32)> {
    (0..scores.nrows())
        .into_par_iter()
        .map(|row| {
            let row_scores = scores.row(row);
            let mut members = positives.songs(row).peekable();

            let mut best_column = 0;
            let mut best_score = std::f32::NEG_INFINITY;

            for (column, &score) in row_scores.iter().enumerate() {
                if members.peek() == Some(&column) {
                    members.next();
                    continue;
                }

                if score > best_score {
                    best_score = score;
                    best_column = column;
                }
            }

            (best_column, best_score)
        })
        .collect()
}

/// Compute the Top-Push loss for one batch and write its gradients.
///
/// For every positive pair `(r, m)` the margin violation is
/// `v = 1 - T[r, m] + max_neg[r]`, normalized by the row's positive
/// count and squared-hinged: `u = relu(v / M+[r])`. The loss is
/// `sum(u^2) / B` for batch size `B` — averaged by batch size, not by
/// positive count. Where `v > 0`, the positive song's score receives
/// subgradient `-2u / (B * M+[r])` and the row's hardest negative the
/// opposite sign; rows with no positives contribute nothing.
///
/// `grads` is zeroed before accumulation; its playlist rows correspond
/// to the batch's local rows.
pub fn compute_loss_and_grads(
    playlist_rows: &Array2<f32>,
    song_features: &Array2<f32>,
    song_biases: &Array1<f32>,
    positives: &BatchPositives,
    grads: &mut BatchGradients,
) -> f32 {
    let minibatch_size = playlist_rows.nrows();
    let inverse_batch_size = 1.0 / minibatch_size as f32;

    let mut scores = playlist_rows.dot(song_features);
    scores += song_biases;

    let hardest = hardest_negatives(&scores, positives);

    grads.zero();

    let mut loss = 0.0;

    for row in 0..minibatch_size {
        let num_positives = positives.count(row);

        if num_positives == 0 {
            continue;
        }

        let normalizer = num_positives as f32;
        let (negative_column, negative_score) = hardest[row];
        let playlist_row = playlist_rows.row(row);

        for song in positives.songs(row) {
            let violation = 1.0 - scores[[row, song]] + negative_score;

            if violation <= 0.0 {
                continue;
            }

            let hinge = violation / normalizer;
            loss += hinge * hinge;

            let subgradient = 2.0 * hinge * inverse_batch_size / normalizer;

            grads
                .song_features
                .column_mut(song)
                .scaled_add(-subgradient, &playlist_row);
            grads
                .song_features
                .column_mut(negative_column)
                .scaled_add(subgradient, &playlist_row);

            grads.song_biases[song] -= subgradient;
            grads.song_biases[negative_column] += subgradient;

            let mut grad_row = grads.playlist_rows.row_mut(row);
            grad_row.scaled_add(subgradient, &song_features.column(negative_column));
            grad_row.scaled_add(-subgradient, &song_features.column(song));
        }
    }

    loss * inverse_batch_size
}

/// A Top-Push playlist/song embedding model.
#[derive(Clone, Debug)]
pub struct TopPushModel {
    hyper: Hyperparameters,
    params: Parameters,
    optimizer: Adam,
}

impl TopPushModel {
    /// The model's parameter aggregate.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    fn validate(&self, membership: &Membership) -> Result<(), FittingError> {
        let (num_playlists, num_songs) = membership.shape();

        if num_playlists == 0 {
            return Err(FittingError::NoPlaylists);
        }

        if num_playlists != self.params.num_playlists() || num_songs != self.params.num_songs() {
            return Err(FittingError::ShapeMismatch {
                expected_playlists: self.params.num_playlists(),
                expected_songs: self.params.num_songs(),
                actual_playlists: num_playlists,
                actual_songs: num_songs,
            });
        }

        for playlist in 0..num_playlists {
            let num_positives = membership.row(playlist).len();

            if num_positives == 0 {
                return Err(FittingError::EmptyPlaylist(playlist));
            }
            if num_positives == num_songs {
                return Err(FittingError::SaturatedPlaylist(playlist));
            }
        }

        Ok(())
    }

    /// Fit the model to a membership matrix.
    ///
    /// Runs the configured number of epochs, drawing a fresh random
    /// playlist order per epoch and taking one optimizer step per batch.
    /// Returns the final epoch's mean batch loss. Calling `fit` again
    /// continues training with the same parameters and optimizer state.
    ///
    /// Degenerate inputs (shape mismatch, playlists with no members or
    /// with every song) and non-finite losses are fatal: the run aborts
    /// with no partial progress persisted.
    pub fn fit(&mut self, membership: &Membership) -> Result<f32, FittingError> {
        self.validate(membership)?;

        let num_playlists = membership.num_playlists();
        let embedding_dim = self.hyper.embedding_dim;
        let minibatch_size = self.hyper.minibatch_size;

        let mut order: Vec<usize> = (0..num_playlists).collect();
        let mut grads = BatchGradients::zeros(
            embedding_dim,
            membership.num_songs(),
            minibatch_size,
        );
        let mut playlist_rows = Array2::zeros((minibatch_size, embedding_dim));

        let mut epoch_loss = 0.0;

        for epoch in 0..self.hyper.num_epochs {
            order.shuffle(&mut self.hyper.rng);

            let num_batches = EpochBatches::new(&order, minibatch_size).len();
            epoch_loss = 0.0;

            for (batch_idx, batch) in EpochBatches::new(&order, minibatch_size).enumerate() {
                let positives = BatchPositives::extract(membership, &batch);

                for (local_row, &playlist) in batch.iter().enumerate() {
                    playlist_rows
                        .row_mut(local_row)
                        .assign(&self.params.playlist_features.row(playlist));
                }

                let loss = compute_loss_and_grads(
                    &playlist_rows,
                    &self.params.song_features,
                    &self.params.song_biases,
                    &positives,
                    &mut grads,
                );

                if !loss.is_finite() {
                    return Err(FittingError::LossNotFinite {
                        epoch,
                        batch: batch_idx,
                        loss,
                    });
                }

                self.optimizer.apply(&mut self.params, &grads, &batch);
                epoch_loss += loss;

                log::info!(
                    "Epoch {}: batch {}/{}: loss {}",
                    epoch,
                    batch_idx + 1,
                    num_batches,
                    loss
                );
            }

            epoch_loss /= num_batches as f32;
        }

        Ok(epoch_loss)
    }

    /// Stack the parameters into a single dense array.
    ///
    /// For embedding dimension D, M songs, and N playlists the result
    /// has `D + 1 + N` rows and `max(M, D)` columns: rows `0..D` are the
    /// song feature matrix, row `D` is the song bias vector, and rows
    /// `D + 1..` are the playlist feature matrix. Rows narrower than the
    /// widest block are zero-padded on the right.
    pub fn stacked_parameters(&self) -> Array2<f32> {
        let embedding_dim = self.params.embedding_dim();
        let num_songs = self.params.num_songs();
        let num_playlists = self.params.num_playlists();

        let width = num_songs.max(embedding_dim);
        let mut stacked = Array2::zeros((embedding_dim + 1 + num_playlists, width));

        stacked
            .slice_mut(s![..embedding_dim, ..num_songs])
            .assign(&self.params.song_features);
        stacked
            .slice_mut(s![embedding_dim, ..num_songs])
            .assign(&self.params.song_biases);
        stacked
            .slice_mut(s![embedding_dim + 1.., ..embedding_dim])
            .assign(&self.params.playlist_features);

        stacked
    }

    /// Persist the stacked parameters as a [`ParameterBlob`].
    ///
    /// The blob is written via a temporary sibling file and renamed into
    /// place; an interrupted run leaves no truncated output.
    pub fn save_parameters(&self, path: &Path) -> Result<(), failure::Error> {
        let stacked = self.stacked_parameters();
        let (rows, cols) = (stacked.nrows(), stacked.ncols());

        let blob = ParameterBlob {
            rows,
            cols,
            data: stacked.into_raw_vec(),
        };

        crate::data::save_parameter_blob(path, &blob)
    }
}

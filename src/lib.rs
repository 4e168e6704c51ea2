#![deny(missing_docs)]
//! # hoist
//!
//! `hoist` learns latent vector representations for songs and playlists
//! from a binary playlist-song membership matrix. Training minimizes the
//! Top-Push bipartite ranking loss: for every playlist, member songs are
//! pushed above the single highest-scoring non-member song, using a
//! squared-hinge surrogate optimized by mini-batch Adam.
//!
//! The input is a sparse boolean playlist-by-song matrix built elsewhere;
//! the output is a single flat parameter blob stacking the song feature
//! matrix, the song bias vector, and the playlist feature matrix.
//!
//! ## Example
//!
//! ```rust
//! use hoist::data::Membership;
//! use hoist::models::toppush::Hyperparameters;
//!
//! // Three playlists over four songs.
//! let pairs = vec![(0, 0), (0, 1), (1, 1), (1, 2), (2, 0), (2, 2)];
//! let y = Membership::from_pairs(3, 4, &pairs);
//!
//! let mut model = Hyperparameters::new(8)
//!     .num_epochs(5)
//!     .minibatch_size(2)
//!     .learning_rate(0.05)
//!     .seed(42)
//!     .build(y.num_playlists(), y.num_songs());
//!
//! let loss = model.fit(&y).unwrap();
//! assert!(loss >= 0.0);
//!
//! let stacked = model.stacked_parameters();
//! assert_eq!(stacked.nrows(), 8 + 1 + 3);
//! ```

use failure::Fail;

pub mod data;
pub mod models;
pub mod optim;

/// Alias for playlist (row) indices.
pub type PlaylistId = usize;
/// Alias for song (column) indices.
pub type SongId = usize;

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// The membership matrix does not match the model's dimensions.
    #[fail(
        display = "membership matrix is {} by {}, but the model was built for {} by {}",
        actual_playlists, actual_songs, expected_playlists, expected_songs
    )]
    ShapeMismatch {
        /// Number of playlist rows the model was built for.
        expected_playlists: usize,
        /// Number of song columns the model was built for.
        expected_songs: usize,
        /// Number of playlist rows in the supplied matrix.
        actual_playlists: usize,
        /// Number of song columns in the supplied matrix.
        actual_songs: usize,
    },
    /// The membership matrix has no playlist rows at all, so there is
    /// nothing to fit.
    #[fail(display = "membership matrix has no playlist rows")]
    NoPlaylists,
    /// A playlist row has no member songs, making the per-playlist
    /// normalizer undefined.
    #[fail(display = "playlist {} has no member songs", _0)]
    EmptyPlaylist(PlaylistId),
    /// A playlist row contains every song, leaving no negatives to rank
    /// against.
    #[fail(display = "playlist {} contains every song", _0)]
    SaturatedPlaylist(PlaylistId),
    /// The loss became NaN or infinite. Fatal; the run is aborted.
    #[fail(
        display = "non-finite loss {} at epoch {}, batch {}",
        loss, epoch, batch
    )]
    LossNotFinite {
        /// Epoch index at which the loss degenerated.
        epoch: usize,
        /// Batch index within the epoch.
        batch: usize,
        /// The offending loss value.
        loss: f32,
    },
}

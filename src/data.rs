//! The playlist-song membership matrix, batch sampling, and the on-disk
//! artifacts surrounding training.
//!
//! The matrix itself is built by an external ingestion stage; this module
//! only defines the compressed representation the trainer consumes, plus
//! the serialized forms of the two run artifacts: the `(membership,
//! song index)` input pair and the flat parameter blob output.

use std::collections::HashMap;
use std::fs::{rename, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{PlaylistId, SongId};

/// A sparse boolean playlist-by-song membership matrix in compressed
/// row form.
///
/// `Y[n, m] = 1` iff song `m` appears in playlist `n`. Rows are stored as
/// sorted, deduplicated song column indices. The matrix is immutable once
/// built and is only ever read during training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    num_playlists: usize,
    num_songs: usize,
    row_pointers: Vec<usize>,
    song_columns: Vec<SongId>,
}

impl Membership {
    /// Build a membership matrix from `(playlist, song)` pairs.
    ///
    /// Duplicate pairs collapse to a single entry. Pairs referencing rows
    /// or columns outside the given shape are a programmer error and
    /// will panic.
    pub fn from_pairs(
        num_playlists: usize,
        num_songs: usize,
        pairs: &[(PlaylistId, SongId)],
    ) -> Self {
        let mut rows: Vec<Vec<SongId>> = vec![Vec::new(); num_playlists];

        for &(playlist, song) in pairs {
            assert!(
                playlist < num_playlists && song < num_songs,
                "entry ({}, {}) outside matrix shape ({}, {})",
                playlist,
                song,
                num_playlists,
                num_songs
            );
            rows[playlist].push(song);
        }

        let mut row_pointers = Vec::with_capacity(num_playlists + 1);
        let mut song_columns = Vec::with_capacity(pairs.len());

        row_pointers.push(0);

        for mut row in rows {
            row.sort_unstable();
            row.dedup();
            song_columns.extend_from_slice(&row);
            row_pointers.push(song_columns.len());
        }

        Membership {
            num_playlists,
            num_songs,
            row_pointers,
            song_columns,
        }
    }

    /// Number of playlist rows.
    pub fn num_playlists(&self) -> usize {
        self.num_playlists
    }

    /// Number of song columns.
    pub fn num_songs(&self) -> usize {
        self.num_songs
    }

    /// Number of nonzero entries.
    pub fn num_entries(&self) -> usize {
        self.song_columns.len()
    }

    /// The sorted song columns of playlist `n`.
    pub fn row(&self, playlist: PlaylistId) -> &[SongId] {
        let start = self.row_pointers[playlist];
        let stop = self.row_pointers[playlist + 1];

        &self.song_columns[start..stop]
    }

    /// Whether song `m` is a member of playlist `n`.
    pub fn contains(&self, playlist: PlaylistId, song: SongId) -> bool {
        self.row(playlist).binary_search(&song).is_ok()
    }

    /// Shape as a `(num_playlists, num_songs)` tuple.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_playlists, self.num_songs)
    }
}

/// A bidirectional mapping between song identifiers (track URIs) and
/// matrix column indices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SongIndex {
    uris: Vec<String>,
    columns: HashMap<String, SongId>,
}

impl SongIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        SongIndex {
            uris: Vec::new(),
            columns: HashMap::new(),
        }
    }

    /// Return the column for `uri`, assigning the next free column if the
    /// song has not been seen before.
    pub fn get_or_insert(&mut self, uri: &str) -> SongId {
        if let Some(&column) = self.columns.get(uri) {
            return column;
        }

        let column = self.uris.len();
        self.uris.push(uri.to_owned());
        self.columns.insert(uri.to_owned(), column);

        column
    }

    /// Return the column for `uri`, if known.
    pub fn get(&self, uri: &str) -> Option<SongId> {
        self.columns.get(uri).cloned()
    }

    /// Return the URI stored at `column`, if any.
    pub fn uri(&self, column: SongId) -> Option<&str> {
        self.uris.get(column).map(|x| x.as_str())
    }

    /// Number of indexed songs.
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// An iterator over one epoch's mini-batches of playlist indices.
///
/// The supplied order (normally a fresh random permutation) is sliced
/// into consecutive chunks of `minibatch_size`. A short final chunk is
/// padded with indices wrapped around from the start of the same order,
/// so every batch has exactly `minibatch_size` rows: the downstream loss
/// is defined for a fixed batch shape.
#[derive(Clone, Debug)]
pub struct EpochBatches<'a> {
    order: &'a [PlaylistId],
    minibatch_size: usize,
    idx: usize,
}

impl<'a> EpochBatches<'a> {
    /// Create a batch iterator over `order`.
    pub fn new(order: &'a [PlaylistId], minibatch_size: usize) -> Self {
        assert!(minibatch_size > 0, "minibatch size must be positive");

        EpochBatches {
            order,
            minibatch_size,
            idx: 0,
        }
    }

    /// Number of batches the iterator will yield.
    pub fn len(&self) -> usize {
        (self.order.len() + self.minibatch_size - 1) / self.minibatch_size
    }

    /// Whether the iterator will yield no batches.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<'a> Iterator for EpochBatches<'a> {
    type Item = Vec<PlaylistId>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.order.len() {
            return None;
        }

        let batch = self
            .order
            .iter()
            .cycle()
            .skip(self.idx)
            .take(self.minibatch_size)
            .cloned()
            .collect();

        self.idx += self.minibatch_size;

        Some(batch)
    }
}

/// The positive entries of a batch of playlist rows, in the layout the
/// loss consumes.
///
/// Stores row-major `(local row, song column)` pairs together with
/// per-row offsets, giving both the positive set of each batch row and
/// the per-row positive counts used as loss normalizers.
#[derive(Clone, Debug)]
pub struct BatchPositives {
    pairs: Vec<(usize, SongId)>,
    offsets: Vec<usize>,
}

impl BatchPositives {
    /// Gather the positives of `batch`'s rows from the membership matrix.
    pub fn extract(membership: &Membership, batch: &[PlaylistId]) -> Self {
        let mut pairs = Vec::new();
        let mut offsets = Vec::with_capacity(batch.len() + 1);

        offsets.push(0);

        for (local_row, &playlist) in batch.iter().enumerate() {
            for &song in membership.row(playlist) {
                pairs.push((local_row, song));
            }
            offsets.push(pairs.len());
        }

        BatchPositives { pairs, offsets }
    }

    /// Number of rows in the batch.
    pub fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of positives in row `local_row`.
    pub fn count(&self, local_row: usize) -> usize {
        self.offsets[local_row + 1] - self.offsets[local_row]
    }

    /// The sorted song columns of row `local_row`.
    pub fn songs(&self, local_row: usize) -> impl Iterator<Item = SongId> + '_ {
        self.pairs[self.offsets[local_row]..self.offsets[local_row + 1]]
            .iter()
            .map(|&(_, song)| song)
    }

    /// All `(local row, song column)` pairs, in row-major order.
    pub fn pairs(&self) -> &[(usize, SongId)] {
        &self.pairs
    }

    /// Total number of positives in the batch.
    pub fn total(&self) -> usize {
        self.pairs.len()
    }
}

/// The learned parameters as a flat row-major array.
///
/// Layout of the `rows * cols` array, for embedding dimension D,
/// M songs, and N playlists: rows `0..D` hold the song feature matrix,
/// row `D` holds the song bias vector, and rows `D + 1..D + 1 + N` hold
/// the playlist feature matrix. `cols` is `max(M, D)`; short rows are
/// zero-padded on the right.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlob {
    /// Number of rows, `D + 1 + N`.
    pub rows: usize,
    /// Number of columns, `max(M, D)`.
    pub cols: usize,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl ParameterBlob {
    /// View the blob as a dense two-dimensional array.
    pub fn to_array(&self) -> Result<Array2<f32>, failure::Error> {
        let array = Array2::from_shape_vec((self.rows, self.cols), self.data.clone())?;

        Ok(array)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");

    PathBuf::from(name)
}

/// Persist the `(membership, song index)` pair as gzipped JSON.
///
/// The data is written to a sibling temporary file and renamed into
/// place, so an interrupted run never leaves a truncated artifact.
pub fn save_membership(
    path: &Path,
    membership: &Membership,
    songs: &SongIndex,
) -> Result<(), failure::Error> {
    let temp_path = temp_sibling(path);

    {
        let file = File::create(&temp_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        serde_json::to_writer(&mut encoder, &(membership, songs))?;

        let mut writer = encoder.finish()?;
        writer.flush()?;
    }

    rename(temp_path, path)?;

    Ok(())
}

/// Load a `(membership, song index)` pair written by [`save_membership`].
pub fn load_membership(path: &Path) -> Result<(Membership, SongIndex), failure::Error> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));

    let pair = serde_json::from_reader(decoder)?;

    Ok(pair)
}

/// Persist a parameter blob with bincode, via a temporary sibling file.
pub fn save_parameter_blob(path: &Path, blob: &ParameterBlob) -> Result<(), failure::Error> {
    let temp_path = temp_sibling(path);

    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        bincode::serialize_into(&mut writer, blob)?;
        writer.flush()?;
    }

    rename(temp_path, path)?;

    Ok(())
}

/// Load a parameter blob written by [`save_parameter_blob`].
pub fn load_parameter_blob(path: &Path) -> Result<ParameterBlob, failure::Error> {
    let file = File::open(path)?;
    let blob = bincode::deserialize_from(BufReader::new(file))?;

    Ok(blob)
}

#[derive(Debug, Deserialize)]
struct MembershipRecord {
    playlist_id: PlaylistId,
    track_uri: String,
}

/// Read `(playlist_id, track_uri)` records from a CSV file and assemble
/// them into a membership matrix and a song index.
///
/// This is a convenience boundary for the external matrix-building
/// stage; playlist ids are expected to be dense indices starting at 0.
pub fn membership_from_csv(path: &Path) -> Result<(Membership, SongIndex), failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;

    let mut songs = SongIndex::new();
    let mut pairs = Vec::new();
    let mut num_playlists = 0;

    for record in reader.deserialize() {
        let record: MembershipRecord = record?;
        let song = songs.get_or_insert(&record.track_uri);

        num_playlists = num_playlists.max(record.playlist_id + 1);
        pairs.push((record.playlist_id, song));
    }

    let membership = Membership::from_pairs(num_playlists, songs.len(), &pairs);

    Ok((membership, songs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::env;

    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("hoist-{}-{}", std::process::id(), name))
    }

    #[test]
    fn membership_rows_are_sorted_and_deduplicated() {
        let pairs = vec![(0, 3), (0, 1), (0, 3), (1, 0), (1, 2)];
        let membership = Membership::from_pairs(2, 4, &pairs);

        assert_eq!(membership.row(0), &[1, 3]);
        assert_eq!(membership.row(1), &[0, 2]);
        assert_eq!(membership.num_entries(), 4);

        assert!(membership.contains(0, 3));
        assert!(!membership.contains(0, 2));
        assert!(!membership.contains(1, 3));
    }

    #[test]
    fn batches_are_padded_by_wrapping_around() {
        let order: Vec<usize> = (0..10).collect();
        let batches: Vec<_> = EpochBatches::new(&order, 4).collect();

        assert_eq!(batches.len(), 3);
        assert_eq!(EpochBatches::new(&order, 4).len(), 3);

        assert_eq!(batches[0], vec![0, 1, 2, 3]);
        assert_eq!(batches[1], vec![4, 5, 6, 7]);
        assert_eq!(batches[2], vec![8, 9, 0, 1]);

        let covered: HashSet<usize> = batches.iter().flatten().cloned().collect();
        assert_eq!(covered.len(), 10);
    }

    #[test]
    fn shuffled_orders_are_deterministic_for_a_fixed_seed() {
        let mut first: Vec<usize> = (0..100).collect();
        let mut second: Vec<usize> = (0..100).collect();

        let mut rng = XorShiftRng::seed_from_u64(7);
        first.shuffle(&mut rng);

        let mut rng = XorShiftRng::seed_from_u64(7);
        second.shuffle(&mut rng);

        assert_eq!(first, second);
        assert_ne!(first, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn batch_positives_follow_row_major_order() {
        let pairs = vec![(0, 0), (0, 2), (1, 1), (2, 0), (2, 1), (2, 3)];
        let membership = Membership::from_pairs(3, 4, &pairs);

        let positives = BatchPositives::extract(&membership, &[2, 0]);

        assert_eq!(positives.num_rows(), 2);
        assert_eq!(positives.count(0), 3);
        assert_eq!(positives.count(1), 2);
        assert_eq!(positives.total(), 5);
        assert_eq!(
            positives.pairs(),
            &[(0, 0), (0, 1), (0, 3), (1, 0), (1, 2)]
        );
        assert_eq!(positives.songs(1).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn membership_artifact_round_trips() {
        let pairs = vec![(0, 0), (0, 1), (1, 2)];
        let membership = Membership::from_pairs(2, 3, &pairs);

        let mut songs = SongIndex::new();
        for uri in &["spotify:track:a", "spotify:track:b", "spotify:track:c"] {
            songs.get_or_insert(uri);
        }

        let path = temp_path("membership.json.gz");
        save_membership(&path, &membership, &songs).unwrap();

        let (loaded_membership, loaded_songs) = load_membership(&path).unwrap();

        assert_eq!(loaded_membership, membership);
        assert_eq!(loaded_songs, songs);
        assert_eq!(loaded_songs.get("spotify:track:b"), Some(1));
        assert_eq!(loaded_songs.uri(2), Some("spotify:track:c"));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn parameter_blob_round_trips() {
        let blob = ParameterBlob {
            rows: 2,
            cols: 3,
            data: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };

        let path = temp_path("params.bin");
        save_parameter_blob(&path, &blob).unwrap();

        let loaded = load_parameter_blob(&path).unwrap();
        assert_eq!(loaded, blob);

        let array = loaded.to_array().unwrap();
        assert_eq!(array[[1, 2]], 5.0);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn csv_records_build_a_membership_matrix() {
        let path = temp_path("pairs.csv");

        {
            let mut file = File::create(&path).unwrap();
            writeln!(file, "playlist_id,track_uri").unwrap();
            writeln!(file, "0,spotify:track:a").unwrap();
            writeln!(file, "0,spotify:track:b").unwrap();
            writeln!(file, "1,spotify:track:b").unwrap();
            writeln!(file, "1,spotify:track:c").unwrap();
        }

        let (membership, songs) = membership_from_csv(&path).unwrap();

        assert_eq!(membership.shape(), (2, 3));
        assert!(membership.contains(0, songs.get("spotify:track:a").unwrap()));
        assert!(membership.contains(1, songs.get("spotify:track:c").unwrap()));
        assert!(!membership.contains(1, songs.get("spotify:track:a").unwrap()));

        std::fs::remove_file(path).unwrap();
    }
}

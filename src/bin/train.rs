//! Train a Top-Push embedding model on a prebuilt membership artifact.
//!
//! Usage: `train <membership.json.gz> <parameters.bin>`
//!
//! The run configuration is fixed at start; there are no flags beyond
//! the two paths. Per-batch progress is reported through `log` (set
//! `RUST_LOG=info` to see it).

use std::env;
use std::path::PathBuf;
use std::process;

use hoist::data::load_membership;
use hoist::models::toppush::Hyperparameters;

const EMBEDDING_DIM: usize = 200;
const NUM_EPOCHS: usize = 10;
const MINIBATCH_SIZE: usize = 256;
const LEARNING_RATE: f32 = 0.001;
const SEED: u64 = 42;

fn run(input: &PathBuf, output: &PathBuf) -> Result<(), failure::Error> {
    let (membership, songs) = load_membership(input)?;

    log::info!(
        "Loaded membership matrix: {} playlists, {} songs, {} entries",
        membership.num_playlists(),
        membership.num_songs(),
        membership.num_entries()
    );
    if songs.len() != membership.num_songs() {
        failure::bail!(
            "corrupt artifact: song index has {} entries, membership matrix has {} columns",
            songs.len(),
            membership.num_songs()
        );
    }

    let mut model = Hyperparameters::new(EMBEDDING_DIM)
        .num_epochs(NUM_EPOCHS)
        .minibatch_size(MINIBATCH_SIZE)
        .learning_rate(LEARNING_RATE)
        .seed(SEED)
        .build(membership.num_playlists(), membership.num_songs());

    let loss = model.fit(&membership)?;
    log::info!("Training complete at loss {}", loss);

    model.save_parameters(output)?;
    log::info!("Parameters written to {}", output.display());

    Ok(())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        eprintln!("Usage: {} <membership.json.gz> <parameters.bin>", args[0]);
        process::exit(2);
    }

    let input = PathBuf::from(&args[1]);
    let output = PathBuf::from(&args[2]);

    if let Err(error) = run(&input, &output) {
        eprintln!("Training failed: {}", error);
        process::exit(1);
    }
}

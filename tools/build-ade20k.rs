extern crate ade20k_tfrecord;
extern crate clap;
extern crate tracing;
extern crate tracing_subscriber;

use ade20k_tfrecord::{Ade20kConfig, ConvertError, run};
use ade20k_tfrecord::config::{INPUTS_DIR_VAR, OUTPUTS_DIR_VAR};

use clap::{Parser};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter};

use std::path::{PathBuf};
use std::process;

/// Converts ADE20K to sharded TFRecord files and zips them for upload.
#[derive(Debug, Parser)]
struct Cli {
  /// Input root; the dataset archive lives under `<inputs>/ADE20K`.
  #[arg(long, env = "VH_INPUTS_DIR")]
  inputs_dir: Option<PathBuf>,

  /// Output root; `tfrecords.zip` is written here.
  #[arg(long, env = "VH_OUTPUTS_DIR")]
  outputs_dir: Option<PathBuf>,

  /// Dataset archive (.zip or .tar), overriding the default location.
  #[arg(long)]
  archive: Option<PathBuf>,

  /// Where shard files are written before archiving.
  #[arg(long, default_value = ".")]
  shard_dir: PathBuf,

  #[arg(long, default_value_t = 4)]
  num_shards: usize,

  /// Fixes the shuffle order.
  #[arg(long)]
  seed: Option<u64>,

  #[arg(long, short = 'j', default_value_t = 1)]
  num_decoders: usize,

  /// Also write `<split>-manifest.csv` and add it to the archive.
  #[arg(long)]
  manifest: bool,

  /// Re-read every shard after writing it.
  #[arg(long)]
  verify: bool,
}

impl Cli {
  fn into_config(self) -> Result<Ade20kConfig, ConvertError> {
    let inputs_dir = self.inputs_dir
      .ok_or(ConvertError::MissingEnvironment{var: INPUTS_DIR_VAR, flag: "inputs-dir"})?;
    let outputs_dir = self.outputs_dir
      .ok_or(ConvertError::MissingEnvironment{var: OUTPUTS_DIR_VAR, flag: "outputs-dir"})?;

    let mut config = Ade20kConfig::new(inputs_dir, outputs_dir);
    if let Some(archive) = self.archive {
      config.archive_path = archive;
    }
    config.shard_dir = self.shard_dir;
    config.num_shards = self.num_shards;
    config.seed = self.seed;
    config.num_decoders = self.num_decoders;
    config.write_manifest = self.manifest;
    config.verify_shards = self.verify;
    Ok(config)
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = match Cli::parse().into_config() {
    Err(e) => {
      error!("{}", e);
      process::exit(1);
    }
    Ok(config) => config,
  };
  info!("config: {:?}", config);

  match run(&config) {
    Err(e) => {
      error!("{}", e);
      process::exit(1);
    }
    Ok(summary) => {
      for split in summary.splits.iter() {
        let counts: Vec<_> = split.shards.iter().map(|s| s.records).collect();
        info!("{}: {} images, shard sizes {:?}", split.split, split.total, counts);
      }
    }
  }
}

use crate::error::{ConvertError, Result};

use std::path::{Path, PathBuf};

pub const INPUTS_DIR_VAR:   &str = "VH_INPUTS_DIR";
pub const OUTPUTS_DIR_VAR:  &str = "VH_OUTPUTS_DIR";

pub const DEFAULT_NUM_SHARDS: usize = 4;
pub const DATASET_DIR_NAME:   &str = "ADEChallengeData2016";
pub const OUTPUT_ARCHIVE_NAME: &str = "tfrecords.zip";

#[derive(Clone, Debug)]
pub struct Ade20kConfig {
  pub inputs_dir:     PathBuf,
  pub outputs_dir:    PathBuf,

  pub archive_path:   PathBuf,
  pub extract_dir:    PathBuf,
  pub shard_dir:      PathBuf,
  pub output_archive_path:  PathBuf,

  pub num_shards:     usize,
  pub seed:           Option<u64>,
  pub num_decoders:   usize,
  pub write_manifest: bool,
  pub verify_shards:  bool,
}

/// One dataset split and where its images and label masks live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitSpec {
  pub name:       String,
  pub image_dir:  PathBuf,
  pub mask_dir:   PathBuf,
}

impl Ade20kConfig {
  /// Default layout under the two roots:
  /// `<inputs>/ADE20K/ADEChallengeData2016.zip` is extracted into
  /// `<inputs>/ADE20K`, and shards are bundled into `<outputs>/tfrecords.zip`.
  pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(inputs_dir: P, outputs_dir: Q) -> Ade20kConfig {
    let inputs_dir = inputs_dir.into();
    let outputs_dir = outputs_dir.into();
    let extract_dir = inputs_dir.join("ADE20K");
    Ade20kConfig{
      archive_path:   extract_dir.join(format!("{}.zip", DATASET_DIR_NAME)),
      extract_dir:    extract_dir,
      shard_dir:      PathBuf::from("."),
      output_archive_path:  outputs_dir.join(OUTPUT_ARCHIVE_NAME),
      inputs_dir:     inputs_dir,
      outputs_dir:    outputs_dir,

      num_shards:     DEFAULT_NUM_SHARDS,
      seed:           None,
      num_decoders:   1,
      write_manifest: false,
      verify_shards:  false,
    }
  }

  pub fn validate(&self) -> Result<()> {
    self.validate_options()?;
    if !self.archive_path.is_file() {
      return Err(ConvertError::MissingArchive(self.archive_path.clone()));
    }
    Ok(())
  }

  pub fn validate_options(&self) -> Result<()> {
    if self.num_shards == 0 {
      return Err(ConvertError::InvalidConfig("num_shards must be at least 1".to_string()));
    }
    if self.num_decoders == 0 {
      return Err(ConvertError::InvalidConfig("num_decoders must be at least 1".to_string()));
    }
    Ok(())
  }

  pub fn dataset_root(&self) -> PathBuf {
    self.extract_dir.join(DATASET_DIR_NAME)
  }

  pub fn splits(&self) -> Vec<SplitSpec> {
    let root = self.dataset_root();
    vec![
      SplitSpec::new("train", &root, "training"),
      SplitSpec::new("val", &root, "validation"),
    ]
  }

  pub fn shard_path(&self, split: &str, shard_idx: usize) -> PathBuf {
    self.shard_dir.join(shard_filename(split, shard_idx, self.num_shards))
  }

  pub fn manifest_path(&self, split: &str) -> PathBuf {
    self.shard_dir.join(format!("{}-manifest.csv", split))
  }
}

impl SplitSpec {
  fn new(name: &str, root: &Path, subdir: &str) -> SplitSpec {
    SplitSpec{
      name:       name.to_string(),
      image_dir:  root.join("images").join(subdir),
      mask_dir:   root.join("annotations").join(subdir),
    }
  }
}

pub fn shard_filename(split: &str, shard_idx: usize, num_shards: usize) -> String {
  format!("{}-{:05}-of-{:05}.tfrecord", split, shard_idx, num_shards)
}

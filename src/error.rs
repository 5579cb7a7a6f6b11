use crate::dims::{ImageCodec, ImageDims};

use std::io;
use std::path::{PathBuf};
use thiserror::{Error};

#[derive(Debug, Error)]
pub enum ConvertError {
  #[error("neither --{flag} nor ${var} is set")]
  MissingEnvironment { var: &'static str, flag: &'static str },

  #[error("input archive not found: {0:?}")]
  MissingArchive(PathBuf),

  #[error("unsupported archive format: {0:?} (expected .zip or .tar)")]
  UnsupportedArchive(PathBuf),

  #[error("failed to extract {path:?}: {reason}")]
  ArchiveExtraction { path: PathBuf, reason: String },

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("failed to read {path:?}: {source}")]
  ReadSample { path: PathBuf, #[source] source: io::Error },

  #[error("failed to decode {path:?} as {codec}: {reason}")]
  Decode { path: PathBuf, codec: ImageCodec, reason: String },

  #[error("shape mismatched between image {image:?} ({image_dims}) and label {mask:?} ({mask_dims})")]
  ShapeMismatch {
    image:      PathBuf,
    mask:       PathBuf,
    image_dims: ImageDims,
    mask_dims:  ImageDims,
  },

  #[error("corrupt record in {path:?}: {reason}")]
  CorruptRecord { path: PathBuf, reason: String },

  #[error("shard {path:?} holds {found} records, expected {expected}")]
  VerifyMismatch { path: PathBuf, expected: usize, found: usize },

  #[error("decoder pool failed: {0}")]
  DecoderPool(String),

  #[error("bad glob pattern: {0}")]
  Pattern(#[from] glob::PatternError),

  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  #[error("zip error: {0}")]
  Zip(#[from] zip::result::ZipError),

  #[error("csv error: {0}")]
  Csv(#[from] csv::Error),
}

impl ConvertError {
  pub fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
    ConvertError::ArchiveExtraction{path: path.into(), reason: reason.to_string()}
  }

  pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
    ConvertError::CorruptRecord{path: path.into(), reason: reason.into()}
  }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

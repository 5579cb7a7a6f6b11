use crate::error::{Result};

use csv::{Writer as CsvWriter};
use serde::{Serialize};
use std::path::{Path};

/// One converted sample and the shard slot it landed in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManifestRow {
  pub split:    String,
  pub shard:    usize,
  pub position: usize,
  pub image:    String,
  pub mask:     String,
  pub height:   u32,
  pub width:    u32,
}

pub fn write_manifest(path: &Path, rows: &[ManifestRow]) -> Result<()> {
  let mut writer = CsvWriter::from_path(path)?;
  for row in rows {
    writer.serialize(row)?;
  }
  writer.flush()?;
  Ok(())
}

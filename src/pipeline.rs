use crate::archive::{OutputArchive, extract_archive};
use crate::config::{Ade20kConfig};
use crate::convert::{SampleLoader, SplitReport, convert_split, shuffle_rng};
use crate::error::{Result};
use crate::manifest::{write_manifest};

use time::{OffsetDateTime};
use tracing::{info};

use std::path::{PathBuf};

#[derive(Clone, Debug)]
pub struct RunSummary {
  pub splits:         Vec<SplitReport>,
  pub output_archive: PathBuf,
}

impl RunSummary {
  pub fn total_records(&self) -> usize {
    self.splits.iter()
      .flat_map(|s| s.shards.iter())
      .map(|shard| shard.records)
      .sum()
  }
}

/// Extracts the input archive, converts the train and val splits, and
/// bundles every shard into the output archive.
pub fn run(config: &Ade20kConfig) -> Result<RunSummary> {
  config.validate()?;
  extract_archive(&config.archive_path, &config.extract_dir)?;
  convert_extracted(config)
}

/// Conversion half of [`run`], for a dataset that is already on disk under
/// `config.dataset_root()`.
pub fn convert_extracted(config: &Ade20kConfig) -> Result<RunSummary> {
  config.validate_options()?;
  let start_time = OffsetDateTime::now_utc();
  let mut archive = OutputArchive::create(&config.output_archive_path)?;
  let loader = SampleLoader::new(config.num_decoders);
  let mut rng = shuffle_rng(config.seed);

  let mut splits = vec![];
  for split in config.splits() {
    let report = convert_split(config, &split, &loader, &mut rng, &mut archive)?;
    if config.write_manifest {
      let manifest_path = config.manifest_path(&split.name);
      write_manifest(&manifest_path, &report.manifest)?;
      archive.add_file(&manifest_path)?;
    }
    splits.push(report);
  }

  let output_archive = archive.finish()?;
  let summary = RunSummary{
    splits:         splits,
    output_archive: output_archive,
  };
  let elapsed = (OffsetDateTime::now_utc() - start_time).as_seconds_f32();
  info!("converted {} records into {:?} elapsed: {:.3}", summary.total_records(), summary.output_archive, elapsed);
  Ok(summary)
}

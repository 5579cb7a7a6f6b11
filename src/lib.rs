//! Converts the ADE20K scene-parsing dataset into sharded TFRecord files of
//! `tf.train.Example` records, bundled into one zip archive.

extern crate byteorder;
extern crate crc32c;
extern crate csv;
extern crate glob;
extern crate image;
extern crate memmap;
extern crate prost;
extern crate serde;
extern crate tar;
extern crate thiserror;
extern crate threadpool;
extern crate tracing;
extern crate zip;

extern crate rand;
extern crate time;

#[cfg(test)]
extern crate tempfile;

pub mod archive;
pub mod config;
pub mod convert;
pub mod dims;
pub mod error;
pub mod example;
pub mod manifest;
pub mod pipeline;
pub mod tfrecord;

pub use crate::archive::{ArchiveFormat, OutputArchive, ShardSink, extract_archive};
pub use crate::config::{Ade20kConfig, SplitSpec};
pub use crate::convert::{SampleLoader, SamplePair, ShardOutput, SplitReport, convert_split, shard_ranges};
pub use crate::dims::{ImageCodec, ImageDims, read_dims};
pub use crate::error::{ConvertError, Result};
pub use crate::pipeline::{RunSummary, convert_extracted, run};
pub use crate::tfrecord::{TfRecordReader, TfRecordWriter};

use crate::error::{ConvertError, Result};

use memmap::{Mmap};
use tar::{Archive as TarArchive};
use tracing::{debug, info};
use zip::{CompressionMethod, ZipArchive, ZipWriter};
use zip::write::{SimpleFileOptions};

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

/// Destination for finished shard files.
pub trait ShardSink {
  fn add_shard(&mut self, path: &Path) -> Result<()>;
}

impl ShardSink for Vec<PathBuf> {
  fn add_shard(&mut self, path: &Path) -> Result<()> {
    self.push(path.to_path_buf());
    Ok(())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
  Zip,
  Tar,
}

impl ArchiveFormat {
  pub fn from_path(path: &Path) -> Result<ArchiveFormat> {
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
    match ext.as_ref().map(|e| e.as_str()) {
      Some("zip") => Ok(ArchiveFormat::Zip),
      Some("tar") => Ok(ArchiveFormat::Tar),
      _ => Err(ConvertError::UnsupportedArchive(path.to_path_buf())),
    }
  }
}

/// Extracts every entry of `archive_path` under `dest`. The archive is
/// mapped for the duration of the call and released on return.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
  let format = ArchiveFormat::from_path(archive_path)?;
  let archive_file = File::open(archive_path).map_err(|e| match e.kind() {
    io::ErrorKind::NotFound => ConvertError::MissingArchive(archive_path.to_path_buf()),
    _ => ConvertError::extraction(archive_path, e),
  })?;
  let archive_map = unsafe { Mmap::map(&archive_file) }
    .map_err(|e| ConvertError::extraction(archive_path, e))?;
  fs::create_dir_all(dest)?;

  info!("extracting {:?} ({} bytes) into {:?}", archive_path, archive_map.len(), dest);
  let reader = Cursor::new(&archive_map[..]);
  match format {
    ArchiveFormat::Zip => {
      let mut archive = ZipArchive::new(reader)
        .map_err(|e| ConvertError::extraction(archive_path, e))?;
      debug!("zip entries: {}", archive.len());
      archive.extract(dest)
        .map_err(|e| ConvertError::extraction(archive_path, e))?;
    }
    ArchiveFormat::Tar => {
      let mut archive = TarArchive::new(reader);
      archive.unpack(dest)
        .map_err(|e| ConvertError::extraction(archive_path, e))?;
    }
  }
  Ok(())
}

/// Zip archive collecting every shard of the run. Entries are stored
/// uncompressed under their file names. The archive is built at a `.partial`
/// sibling path and only renamed into place by `finish`; dropping it
/// unfinished removes the partial file, so an aborted run leaves no archive.
pub struct OutputArchive {
  path:         PathBuf,
  partial_path: PathBuf,
  writer:       Option<ZipWriter<File>>,
  entries:      Vec<String>,
}

impl OutputArchive {
  pub fn create<P: AsRef<Path>>(path: P) -> Result<OutputArchive> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }
    if path.exists() {
      fs::remove_file(path)?;
    }
    let mut partial_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    partial_name.push(".partial");
    let partial_path = path.with_file_name(partial_name);
    let file = File::create(&partial_path)?;
    Ok(OutputArchive{
      path:         path.to_path_buf(),
      partial_path: partial_path,
      writer:       Some(ZipWriter::new(file)),
      entries:      vec![],
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn partial_path(&self) -> &Path {
    &self.partial_path
  }

  pub fn entries(&self) -> &[String] {
    &self.entries
  }

  pub fn add_file(&mut self, path: &Path) -> Result<()> {
    let name = match path.file_name() {
      None => return Err(ConvertError::InvalidConfig(format!("not a file path: {:?}", path))),
      Some(name) => name.to_string_lossy().into_owned(),
    };
    let writer = match self.writer {
      None => return Err(io::Error::new(io::ErrorKind::Other, "output archive already finished").into()),
      Some(ref mut writer) => writer,
    };
    let mut src = File::open(path)?;
    let size = src.metadata()?.len();
    let options = SimpleFileOptions::default()
      .compression_method(CompressionMethod::Stored)
      .large_file(size >= u32::max_value() as u64);
    writer.start_file(name.clone(), options)?;
    io::copy(&mut src, writer)?;
    debug!("archived {:?} ({} bytes) as {}", path, size, name);
    self.entries.push(name);
    Ok(())
  }

  pub fn finish(mut self) -> Result<PathBuf> {
    if let Some(writer) = self.writer.take() {
      let res = writer.finish()
        .map_err(ConvertError::from)
        .and_then(|_| fs::rename(&self.partial_path, &self.path).map_err(ConvertError::from));
      if let Err(e) = res {
        let _ = fs::remove_file(&self.partial_path);
        return Err(e);
      }
    }
    info!("wrote {:?} with {} entries", self.path, self.entries.len());
    Ok(self.path.clone())
  }
}

impl Drop for OutputArchive {
  fn drop(&mut self) {
    if let Some(writer) = self.writer.take() {
      drop(writer);
      let _ = fs::remove_file(&self.partial_path);
    }
  }
}

impl ShardSink for OutputArchive {
  fn add_shard(&mut self, path: &Path) -> Result<()> {
    self.add_file(path)
  }
}

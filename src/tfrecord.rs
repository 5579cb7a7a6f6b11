//! TFRecord container framing.
//!
//! Each record on disk is
//!
//! ```text
//! u64 length | u32 masked_crc32c(length) | data[length] | u32 masked_crc32c(data)
//! ```
//!
//! with all integers little endian.

use crate::error::{ConvertError, Result};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MASK_DELTA: u32 = 0xa282_ead8;

pub fn masked_crc32c(data: &[u8]) -> u32 {
  let crc = crc32c::crc32c(data);
  ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub struct TfRecordWriter<W: Write> {
  inner:    W,
  records:  usize,
}

impl TfRecordWriter<BufWriter<File>> {
  pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
    let file = File::create(path)?;
    Ok(TfRecordWriter::new(BufWriter::new(file)))
  }
}

impl<W: Write> TfRecordWriter<W> {
  pub fn new(inner: W) -> Self {
    TfRecordWriter{
      inner:    inner,
      records:  0,
    }
  }

  pub fn write(&mut self, record: &[u8]) -> io::Result<()> {
    let mut len_buf = [0; 8];
    LittleEndian::write_u64(&mut len_buf, record.len() as u64);
    self.inner.write_all(&len_buf)?;
    self.inner.write_u32::<LittleEndian>(masked_crc32c(&len_buf))?;
    self.inner.write_all(record)?;
    self.inner.write_u32::<LittleEndian>(masked_crc32c(record))?;
    self.records += 1;
    Ok(())
  }

  pub fn records(&self) -> usize {
    self.records
  }

  /// Flushes buffered records and hands back the underlying stream.
  pub fn finish(mut self) -> io::Result<W> {
    self.inner.flush()?;
    Ok(self.inner)
  }
}

pub struct TfRecordReader<R: Read> {
  inner:  R,
  path:   PathBuf,
  offset: u64,
  done:   bool,
}

impl TfRecordReader<BufReader<File>> {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = File::open(path)?;
    Ok(TfRecordReader::new(BufReader::new(file), path))
  }
}

impl<R: Read> TfRecordReader<R> {
  pub fn new<P: Into<PathBuf>>(inner: R, path: P) -> Self {
    TfRecordReader{
      inner:  inner,
      path:   path.into(),
      offset: 0,
      done:   false,
    }
  }

  /// Reads the next record, or `None` at a clean end of stream.
  pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0; 8];
    let mut filled = 0;
    while filled < len_buf.len() {
      match self.inner.read(&mut len_buf[filled .. ])? {
        0 => break,
        n => filled += n,
      }
    }
    if filled == 0 {
      return Ok(None);
    }
    if filled < len_buf.len() {
      return Err(self.corrupt("truncated length header"));
    }

    let len_crc = self.read_u32("truncated length checksum")?;
    if len_crc != masked_crc32c(&len_buf) {
      return Err(self.corrupt("length checksum mismatch"));
    }
    let len = LittleEndian::read_u64(&len_buf);

    let mut data = vec![];
    (&mut self.inner).take(len).read_to_end(&mut data)?;
    if (data.len() as u64) < len {
      return Err(self.corrupt("truncated record data"));
    }
    let data_crc = self.read_u32("truncated data checksum")?;
    if data_crc != masked_crc32c(&data) {
      return Err(self.corrupt("data checksum mismatch"));
    }

    self.offset += 8 + 4 + len + 4;
    Ok(Some(data))
  }

  fn read_u32(&mut self, what: &str) -> Result<u32> {
    match self.inner.read_u32::<LittleEndian>() {
      Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(self.corrupt(what)),
      Err(e) => Err(e.into()),
      Ok(v) => Ok(v),
    }
  }

  fn corrupt(&self, what: &str) -> ConvertError {
    ConvertError::corrupt(&self.path, format!("{} at offset {}", what, self.offset))
  }
}

impl<R: Read> Iterator for TfRecordReader<R> {
  type Item = Result<Vec<u8>>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match self.read_record() {
      Ok(Some(rec)) => Some(Ok(rec)),
      Ok(None) => {
        self.done = true;
        None
      }
      Err(e) => {
        self.done = true;
        Some(Err(e))
      }
    }
  }
}

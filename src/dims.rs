use image::{ImageDecoder, ImageError};
use image::codecs::jpeg::{JpegDecoder};
use image::codecs::png::{PngDecoder};
use thiserror::{Error};

use std::fmt;
use std::io::{Cursor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageCodec {
  Jpeg,
  Png,
}

impl ImageCodec {
  pub fn format_name(self) -> &'static str {
    match self {
      ImageCodec::Jpeg => "jpeg",
      ImageCodec::Png  => "png",
    }
  }

  /// Channel count the codec is declared with: color JPEG images, single
  /// channel PNG label masks.
  pub fn channels(self) -> u32 {
    match self {
      ImageCodec::Jpeg => 3,
      ImageCodec::Png  => 1,
    }
  }
}

impl fmt::Display for ImageCodec {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(self.format_name())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDims {
  pub height: u32,
  pub width:  u32,
}

impl fmt::Display for ImageDims {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}x{}", self.height, self.width)
  }
}

#[derive(Debug, Error)]
#[error("invalid {codec} stream: {source}")]
pub struct DecodeError {
  pub codec:  ImageCodec,
  #[source]
  pub source: ImageError,
}

/// Reads (height, width) from the stream header without decoding pixels.
pub fn read_dims(raw: &[u8], codec: ImageCodec) -> Result<ImageDims, DecodeError> {
  let reader = Cursor::new(raw);
  let dims = match codec {
    ImageCodec::Jpeg => JpegDecoder::new(reader).map(|dec| dec.dimensions()),
    ImageCodec::Png  => PngDecoder::new(reader).map(|dec| dec.dimensions()),
  };
  match dims {
    Err(e) => Err(DecodeError{codec: codec, source: e}),
    Ok((width, height)) => Ok(ImageDims{height: height, width: width}),
  }
}

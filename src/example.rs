//! `tf.train.Example` records for image/segmentation pairs.
//!
//! The message types mirror `tensorflow/core/example/{example,feature}.proto`
//! field for field, so records written here are readable by any TensorFlow
//! input pipeline. The feature map is a `BTreeMap`, which keeps serialized
//! bytes stable for identical inputs.

use crate::dims::{ImageCodec, ImageDims};

use prost::{Message};
use thiserror::{Error};
use std::collections::{BTreeMap};
use std::path::{Path};

pub const KEY_IMAGE_ENCODED:  &str = "image/encoded";
pub const KEY_IMAGE_FILENAME: &str = "image/filename";
pub const KEY_IMAGE_FORMAT:   &str = "image/format";
pub const KEY_IMAGE_HEIGHT:   &str = "image/height";
pub const KEY_IMAGE_WIDTH:    &str = "image/width";
pub const KEY_IMAGE_CHANNELS: &str = "image/channels";
pub const KEY_SEG_ENCODED:    &str = "image/segmentation/class/encoded";
pub const KEY_SEG_FORMAT:     &str = "image/segmentation/class/format";

#[derive(Clone, PartialEq, Message)]
pub struct BytesList {
  #[prost(bytes = "vec", repeated, tag = "1")]
  pub value: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatList {
  #[prost(float, repeated, tag = "1")]
  pub value: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Int64List {
  #[prost(int64, repeated, tag = "1")]
  pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
  #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
  pub kind: Option<feature::Kind>,
}

pub mod feature {
  #[derive(Clone, PartialEq, prost::Oneof)]
  pub enum Kind {
    #[prost(message, tag = "1")]
    BytesList(super::BytesList),
    #[prost(message, tag = "2")]
    FloatList(super::FloatList),
    #[prost(message, tag = "3")]
    Int64List(super::Int64List),
  }
}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
  #[prost(btree_map = "string, message", tag = "1")]
  pub feature: BTreeMap<String, Feature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Example {
  #[prost(message, optional, tag = "1")]
  pub features: Option<Features>,
}

impl Feature {
  pub fn bytes(value: Vec<u8>) -> Feature {
    Feature{kind: Some(feature::Kind::BytesList(BytesList{value: vec![value]}))}
  }

  pub fn int64(value: i64) -> Feature {
    Feature{kind: Some(feature::Kind::Int64List(Int64List{value: vec![value]}))}
  }

  fn as_single_bytes(&self) -> Option<&[u8]> {
    match self.kind {
      Some(feature::Kind::BytesList(ref list)) if list.value.len() == 1 => Some(&list.value[0]),
      _ => None,
    }
  }

  fn as_single_int64(&self) -> Option<i64> {
    match self.kind {
      Some(feature::Kind::Int64List(ref list)) if list.value.len() == 1 => Some(list.value[0]),
      _ => None,
    }
  }
}

/// Decoded form of one image/segmentation record.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSegRecord {
  pub image:        Vec<u8>,
  pub filename:     String,
  pub format:       String,
  pub dims:         ImageDims,
  pub channels:     u32,
  pub mask:         Vec<u8>,
  pub mask_format:  String,
}

#[derive(Debug, Error)]
pub enum RecordDecodeError {
  #[error("malformed Example: {0}")]
  Proto(#[from] prost::DecodeError),
  #[error("missing or mistyped feature {0:?}")]
  MissingFeature(&'static str),
  #[error("feature {0:?} out of range: {1}")]
  OutOfRange(&'static str, i64),
}

pub fn image_seg_to_example(image: &[u8], image_path: &Path, dims: ImageDims, mask: &[u8]) -> Example {
  let mut feature = BTreeMap::new();
  feature.insert(KEY_IMAGE_ENCODED.to_string(), Feature::bytes(image.to_vec()));
  feature.insert(KEY_IMAGE_FILENAME.to_string(), Feature::bytes(image_path.to_string_lossy().into_owned().into_bytes()));
  feature.insert(KEY_IMAGE_FORMAT.to_string(), Feature::bytes(ImageCodec::Jpeg.format_name().as_bytes().to_vec()));
  feature.insert(KEY_IMAGE_HEIGHT.to_string(), Feature::int64(dims.height as i64));
  feature.insert(KEY_IMAGE_WIDTH.to_string(), Feature::int64(dims.width as i64));
  feature.insert(KEY_IMAGE_CHANNELS.to_string(), Feature::int64(ImageCodec::Jpeg.channels() as i64));
  feature.insert(KEY_SEG_ENCODED.to_string(), Feature::bytes(mask.to_vec()));
  feature.insert(KEY_SEG_FORMAT.to_string(), Feature::bytes(ImageCodec::Png.format_name().as_bytes().to_vec()));
  Example{features: Some(Features{feature: feature})}
}

/// Serializes one image/mask pair. No validation happens here; callers are
/// expected to have checked that `dims` matches both streams.
pub fn encode(image: &[u8], image_path: &Path, height: u32, width: u32, mask: &[u8]) -> Vec<u8> {
  let dims = ImageDims{height: height, width: width};
  image_seg_to_example(image, image_path, dims, mask).encode_to_vec()
}

pub fn decode(record: &[u8]) -> Result<ImageSegRecord, RecordDecodeError> {
  let example = Example::decode(record)?;
  let features = example.features.unwrap_or_default().feature;

  let bytes = |key: &'static str| -> Result<Vec<u8>, RecordDecodeError> {
    features.get(key)
      .and_then(|f| f.as_single_bytes())
      .map(|b| b.to_vec())
      .ok_or(RecordDecodeError::MissingFeature(key))
  };
  let int = |key: &'static str| -> Result<u32, RecordDecodeError> {
    let v = features.get(key)
      .and_then(|f| f.as_single_int64())
      .ok_or(RecordDecodeError::MissingFeature(key))?;
    if v < 0 || v > u32::max_value() as i64 {
      return Err(RecordDecodeError::OutOfRange(key, v));
    }
    Ok(v as u32)
  };
  let text = |key: &'static str| -> Result<String, RecordDecodeError> {
    bytes(key).map(|b| String::from_utf8_lossy(&b).into_owned())
  };

  Ok(ImageSegRecord{
    image:        bytes(KEY_IMAGE_ENCODED)?,
    filename:     text(KEY_IMAGE_FILENAME)?,
    format:       text(KEY_IMAGE_FORMAT)?,
    dims:         ImageDims{height: int(KEY_IMAGE_HEIGHT)?, width: int(KEY_IMAGE_WIDTH)?},
    channels:     int(KEY_IMAGE_CHANNELS)?,
    mask:         bytes(KEY_SEG_ENCODED)?,
    mask_format:  text(KEY_SEG_FORMAT)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_carries_verbatim_payloads() {
    let image = vec![0xff, 0xd8, 0x00, 0x01, 0xff, 0xd9];
    let mask = vec![0x89, b'P', b'N', b'G', 7, 7];
    let raw = encode(&image, Path::new("images/training/ADE_train_00000001.jpg"), 480, 640, &mask);
    let rec = decode(&raw).unwrap();
    assert_eq!(rec.image, image);
    assert_eq!(rec.mask, mask);
    assert_eq!(rec.dims, ImageDims{height: 480, width: 640});
    assert_eq!(rec.filename, "images/training/ADE_train_00000001.jpg");
    assert_eq!(rec.format, "jpeg");
    assert_eq!(rec.mask_format, "png");
    assert_eq!(rec.channels, 3);
  }

  #[test]
  fn encoding_is_deterministic() {
    let a = encode(b"img", Path::new("x.jpg"), 2, 3, b"seg");
    let b = encode(b"img", Path::new("x.jpg"), 2, 3, b"seg");
    assert_eq!(a, b);
  }

  #[test]
  fn example_has_all_eight_features() {
    let ex = image_seg_to_example(b"i", Path::new("p.jpg"), ImageDims{height: 1, width: 1}, b"m");
    let keys: Vec<_> = ex.features.unwrap().feature.keys().cloned().collect();
    assert_eq!(keys.len(), 8);
    assert!(keys.iter().any(|k| k == KEY_SEG_ENCODED));
  }

  #[test]
  fn missing_feature_is_reported() {
    let mut ex = image_seg_to_example(b"i", Path::new("p.jpg"), ImageDims{height: 1, width: 1}, b"m");
    ex.features.as_mut().unwrap().feature.remove(KEY_IMAGE_WIDTH);
    match decode(&ex.encode_to_vec()) {
      Err(RecordDecodeError::MissingFeature(key)) => assert_eq!(key, KEY_IMAGE_WIDTH),
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn garbage_is_a_proto_error() {
    use std::error::Error as _;
    let err = decode(&[0xff, 0xff, 0xff]).unwrap_err();
    assert!(matches!(err, RecordDecodeError::Proto(_)));
    assert!(err.to_string().starts_with("malformed Example: "), "{}", err);
    assert!(err.source().is_some());
  }

  #[test]
  fn out_of_range_message_names_the_key() {
    let err = RecordDecodeError::OutOfRange(KEY_IMAGE_HEIGHT, -1);
    assert_eq!(err.to_string(), "feature \"image/height\" out of range: -1");
  }
}

use crate::archive::{ShardSink};
use crate::config::{Ade20kConfig, SplitSpec};
use crate::dims::{DecodeError, ImageCodec, ImageDims, read_dims};
use crate::error::{ConvertError, Result};
use crate::example;
use crate::manifest::{ManifestRow};
use crate::tfrecord::{TfRecordReader, TfRecordWriter};

use rand::{Rng, SeedableRng};
use rand::rngs::{StdRng};
use rand::seq::{SliceRandom};
use threadpool::{ThreadPool};
use time::{OffsetDateTime};
use tracing::{debug, info};

use std::cmp::{min};
use std::collections::{BTreeMap};
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ops::{Range};
use std::path::{Path, PathBuf};
use std::sync::{Arc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SamplePair {
  pub image:  PathBuf,
  pub mask:   PathBuf,
}

/// Raw image and mask bytes of one pair, already checked to agree on shape.
#[derive(Debug)]
pub struct LoadedSample {
  pub dims:   ImageDims,
  pub image:  Vec<u8>,
  pub mask:   Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardOutput {
  pub split:    String,
  pub index:    usize,
  pub path:     PathBuf,
  pub records:  usize,
}

#[derive(Clone, Debug)]
pub struct SplitReport {
  pub split:    String,
  pub total:    usize,
  pub shards:   Vec<ShardOutput>,
  pub manifest: Vec<ManifestRow>,
}

/// Label mask for an image: the image file name up to its first `.`, with a
/// `.png` extension, under `mask_dir`.
pub fn mask_path_for(image: &Path, mask_dir: &Path) -> PathBuf {
  let name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
  let stem = name.split('.').next().unwrap_or("");
  mask_dir.join(format!("{}.png", stem))
}

/// Lists `*.jpg` under the split's image directory and pairs each with its
/// mask path. Masks are not checked for existence here.
pub fn list_pairs(split: &SplitSpec) -> Result<Vec<SamplePair>> {
  let dir = match split.image_dir.to_str() {
    None => return Err(ConvertError::InvalidConfig(format!("non UTF-8 image dir: {:?}", split.image_dir))),
    Some(dir) => dir,
  };
  let pattern = format!("{}/*.jpg", glob::Pattern::escape(dir));
  let mut pairs = vec![];
  for entry in glob::glob(&pattern)? {
    let image = entry.map_err(io::Error::from)?;
    let mask = mask_path_for(&image, &split.mask_dir);
    pairs.push(SamplePair{image: image, mask: mask});
  }
  Ok(pairs)
}

pub fn shuffle_rng(seed: Option<u64>) -> StdRng {
  match seed {
    Some(seed) => StdRng::seed_from_u64(seed),
    None => StdRng::from_entropy(),
  }
}

/// Contiguous shard ranges: every shard but possibly the last holds
/// `ceil(total / num_shards)` samples; trailing shards may be empty.
pub fn shard_ranges(total: usize, num_shards: usize) -> Vec<Range<usize>> {
  assert!(num_shards > 0);
  let per_shard = (total + num_shards - 1) / num_shards;
  (0 .. num_shards).map(|shard_idx| {
    let end = min((shard_idx + 1) * per_shard, total);
    let start = min(shard_idx * per_shard, end);
    start .. end
  }).collect()
}

fn read_sample_file(path: &Path) -> Result<Vec<u8>> {
  fs::read(path).map_err(|e| ConvertError::ReadSample{path: path.to_path_buf(), source: e})
}

fn decode_failed(path: &Path, e: DecodeError) -> ConvertError {
  ConvertError::Decode{path: path.to_path_buf(), codec: e.codec, reason: e.source.to_string()}
}

pub fn load_sample(pair: &SamplePair) -> Result<LoadedSample> {
  let image = read_sample_file(&pair.image)?;
  let image_dims = read_dims(&image, ImageCodec::Jpeg).map_err(|e| decode_failed(&pair.image, e))?;
  let mask = read_sample_file(&pair.mask)?;
  let mask_dims = read_dims(&mask, ImageCodec::Png).map_err(|e| decode_failed(&pair.mask, e))?;
  if image_dims != mask_dims {
    return Err(ConvertError::ShapeMismatch{
      image:      pair.image.clone(),
      mask:       pair.mask.clone(),
      image_dims: image_dims,
      mask_dims:  mask_dims,
    });
  }
  Ok(LoadedSample{dims: image_dims, image: image, mask: mask})
}

/// Reads and checks samples, handing them out strictly in index order.
pub enum SampleLoader {
  Sequential,
  /// Decoder workers feeding a single in-order consumer. At most `window()`
  /// samples past the one being consumed are submitted at any time.
  Pool {
    pool:     ThreadPool,
    started:  Arc<AtomicUsize>,
  },
}

impl SampleLoader {
  pub fn new(num_decoders: usize) -> SampleLoader {
    if num_decoders <= 1 {
      SampleLoader::Sequential
    } else {
      let pool = threadpool::Builder::new()
        .num_threads(num_decoders)
        .thread_name("ade20k-decoder".to_string())
        .build();
      SampleLoader::Pool{pool: pool, started: Arc::new(AtomicUsize::new(0))}
    }
  }

  pub fn window(&self) -> usize {
    match *self {
      SampleLoader::Sequential => 1,
      SampleLoader::Pool{ref pool, ..} => 2 * pool.max_count(),
    }
  }

  /// Number of samples a decoder worker has begun loading.
  pub fn samples_started(&self) -> usize {
    match *self {
      SampleLoader::Sequential => 0,
      SampleLoader::Pool{ref started, ..} => started.load(Ordering::SeqCst),
    }
  }

  pub fn load_in_order<F>(&self, pairs: &[SamplePair], range: Range<usize>, mut f: F) -> Result<()>
  where F: FnMut(usize, LoadedSample) -> Result<()> {
    let (pool, started) = match *self {
      SampleLoader::Sequential => {
        for idx in range {
          let sample = load_sample(&pairs[idx])?;
          f(idx, sample)?;
        }
        return Ok(());
      }
      SampleLoader::Pool{ref pool, ref started} => (pool, started),
    };

    let window = self.window();
    let abort = Arc::new(AtomicBool::new(false));
    let (tx, rx) = sync_channel(window);
    let submit = |idx: usize| {
      let tx = tx.clone();
      let abort = abort.clone();
      let started = started.clone();
      let pair = pairs[idx].clone();
      pool.execute(move || {
        if abort.load(Ordering::SeqCst) {
          return;
        }
        started.fetch_add(1, Ordering::SeqCst);
        let res = panic::catch_unwind(AssertUnwindSafe(|| load_sample(&pair)))
          .unwrap_or_else(|_| Err(ConvertError::DecoderPool(format!("worker panicked on {:?}", pair.image))));
        // The receiver is gone once the consumer has failed.
        let _ = tx.send((idx, res));
      });
    };

    let mut submitted = range.start;
    while submitted < range.end && submitted - range.start < window {
      submit(submitted);
      submitted += 1;
    }

    let mut pending: BTreeMap<usize, Result<LoadedSample>> = BTreeMap::new();
    let mut next = range.start;
    let res = 'drain: loop {
      if next >= range.end {
        break Ok(());
      }
      match rx.recv() {
        Err(_) => {
          break Err(ConvertError::DecoderPool(format!("worker exited before sample {}", next)));
        }
        Ok((idx, sample)) => {
          pending.insert(idx, sample);
        }
      }
      while let Some(sample) = pending.remove(&next) {
        if let Err(e) = sample.and_then(|sample| f(next, sample)) {
          break 'drain Err(e);
        }
        next += 1;
        if submitted < range.end {
          submit(submitted);
          submitted += 1;
        }
      }
    };
    if res.is_err() {
      abort.store(true, Ordering::SeqCst);
    }
    res
  }
}

/// Re-reads a finished shard and checks every record parses.
pub fn verify_shard(path: &Path, expected: usize) -> Result<()> {
  let mut found = 0;
  for record in TfRecordReader::open(path)? {
    let record = record?;
    if let Err(e) = example::decode(&record) {
      return Err(ConvertError::corrupt(path, format!("record {}: {}", found, e)));
    }
    found += 1;
  }
  if found != expected {
    return Err(ConvertError::VerifyMismatch{path: path.to_path_buf(), expected: expected, found: found});
  }
  Ok(())
}

fn file_name_of(path: &Path) -> String {
  path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Converts one split into `config.num_shards` TFRecord files, passing each
/// finished shard to `sink`. Any unreadable sample or shape mismatch aborts
/// the conversion; shards already written stay on disk.
pub fn convert_split<R, S>(
    config: &Ade20kConfig,
    split: &SplitSpec,
    loader: &SampleLoader,
    rng: &mut R,
    sink: &mut S,
) -> Result<SplitReport>
where R: Rng, S: ShardSink {
  let mut pairs = list_pairs(split)?;
  pairs.shuffle(rng);
  let total = pairs.len();
  info!("{}: {} images in {:?}", split.name, total, split.image_dir);

  fs::create_dir_all(&config.shard_dir)?;
  let mut shards = Vec::with_capacity(config.num_shards);
  let mut manifest = vec![];
  for (shard_idx, range) in shard_ranges(total, config.num_shards).into_iter().enumerate() {
    let start_time = OffsetDateTime::now_utc();
    let path = config.shard_path(&split.name, shard_idx);
    let mut writer = TfRecordWriter::create(&path)?;
    loader.load_in_order(&pairs, range, |idx, sample| {
      debug!(">> Converting image {}/{} shard {}", idx + 1, total, shard_idx);
      let pair = &pairs[idx];
      let record = example::encode(&sample.image, &pair.image, sample.dims.height, sample.dims.width, &sample.mask);
      writer.write(&record)?;
      if config.write_manifest {
        manifest.push(ManifestRow{
          split:    split.name.clone(),
          shard:    shard_idx,
          position: idx,
          image:    file_name_of(&pair.image),
          mask:     file_name_of(&pair.mask),
          height:   sample.dims.height,
          width:    sample.dims.width,
        });
      }
      Ok(())
    })?;
    let records = writer.records();
    writer.finish()?;

    if config.verify_shards {
      verify_shard(&path, records)?;
    }
    sink.add_shard(&path)?;

    let elapsed = (OffsetDateTime::now_utc() - start_time).as_seconds_f32();
    info!("{}: wrote {:?} records: {} elapsed: {:.3}", split.name, path, records, elapsed);
    shards.push(ShardOutput{
      split:    split.name.clone(),
      index:    shard_idx,
      path:     path,
      records:  records,
    });
  }

  Ok(SplitReport{
    split:    split.name.clone(),
    total:    total,
    shards:   shards,
    manifest: manifest,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dims::testing::{jpeg_bytes, png_mask_bytes};
  use std::cmp::{max};
  use std::collections::{HashSet};
  use std::thread;
  use std::time::{Duration};

  fn lens(ranges: &[Range<usize>]) -> Vec<usize> {
    ranges.iter().map(|r| r.len()).collect()
  }

  #[test]
  fn ten_samples_over_four_shards() {
    let ranges = shard_ranges(10, 4);
    assert_eq!(lens(&ranges), vec![3, 3, 3, 1]);
    assert_eq!(ranges[3], 9 .. 10);
  }

  #[test]
  fn zero_samples_gives_empty_shards() {
    assert_eq!(lens(&shard_ranges(0, 4)), vec![0, 0, 0, 0]);
  }

  #[test]
  fn short_splits_leave_trailing_shards_empty() {
    assert_eq!(lens(&shard_ranges(5, 4)), vec![2, 2, 1, 0]);
    assert_eq!(lens(&shard_ranges(1, 4)), vec![1, 0, 0, 0]);
  }

  #[test]
  fn shard_ranges_cover_every_index_once() {
    for total in 0 .. 40 {
      for num_shards in 1 .. 7 {
        let ranges = shard_ranges(total, num_shards);
        assert_eq!(ranges.len(), num_shards);
        let per_shard = (total + num_shards - 1) / num_shards;
        let mut next = 0;
        for (i, r) in ranges.iter().enumerate() {
          assert_eq!(r.start, next);
          if r.end < total {
            assert_eq!(r.len(), per_shard, "total {} shards {} shard {}", total, num_shards, i);
          }
          next = r.end;
        }
        assert_eq!(next, total);
      }
    }
  }

  #[test]
  fn mask_path_uses_stem_before_first_dot() {
    let mask_dir = Path::new("/data/annotations/training");
    assert_eq!(
        mask_path_for(Path::new("/data/images/training/ADE_train_00000001.jpg"), mask_dir),
        PathBuf::from("/data/annotations/training/ADE_train_00000001.png"));
    assert_eq!(
        mask_path_for(Path::new("/data/images/training/scene.v2.jpg"), mask_dir),
        PathBuf::from("/data/annotations/training/scene.png"));
  }

  fn write_split(root: &Path, names: &[&str], dims: (u32, u32)) -> SplitSpec {
    let split = SplitSpec{
      name:       "train".to_string(),
      image_dir:  root.join("images"),
      mask_dir:   root.join("annotations"),
    };
    fs::create_dir_all(&split.image_dir).unwrap();
    fs::create_dir_all(&split.mask_dir).unwrap();
    for name in names {
      fs::write(split.image_dir.join(format!("{}.jpg", name)), jpeg_bytes(dims.0, dims.1)).unwrap();
      fs::write(split.mask_dir.join(format!("{}.png", name)), png_mask_bytes(dims.0, dims.1)).unwrap();
    }
    split
  }

  #[test]
  fn list_pairs_ignores_non_jpeg_files() {
    let dir = tempfile::tempdir().unwrap();
    let split = write_split(dir.path(), &["a", "b"], (4, 3));
    fs::write(split.image_dir.join("notes.txt"), b"x").unwrap();
    let pairs = list_pairs(&split).unwrap();
    let images: HashSet<_> = pairs.iter().map(|p| file_name_of(&p.image)).collect();
    assert_eq!(images, ["a.jpg", "b.jpg"].iter().map(|s| s.to_string()).collect::<HashSet<_>>());
    for p in &pairs {
      assert_eq!(p.mask.parent().unwrap(), split.mask_dir.as_path());
    }
  }

  #[test]
  fn load_sample_rejects_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let split = write_split(dir.path(), &["a"], (8, 6));
    fs::write(split.mask_dir.join("a.png"), png_mask_bytes(8, 5)).unwrap();
    let pairs = list_pairs(&split).unwrap();
    match load_sample(&pairs[0]) {
      Err(ConvertError::ShapeMismatch{image_dims, mask_dims, ..}) => {
        assert_eq!(image_dims, ImageDims{height: 6, width: 8});
        assert_eq!(mask_dims, ImageDims{height: 5, width: 8});
      }
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn load_sample_reports_missing_mask() {
    let dir = tempfile::tempdir().unwrap();
    let split = write_split(dir.path(), &["a"], (4, 4));
    fs::remove_file(split.mask_dir.join("a.png")).unwrap();
    let pairs = list_pairs(&split).unwrap();
    assert!(matches!(load_sample(&pairs[0]), Err(ConvertError::ReadSample{..})));
  }

  #[test]
  fn pool_delivers_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0 .. 12).map(|i| format!("s{:02}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let split = write_split(dir.path(), &name_refs, (5, 5));
    let pairs = list_pairs(&split).unwrap();

    let loader = SampleLoader::new(4);
    let mut seen = vec![];
    loader.load_in_order(&pairs, 2 .. 11, |idx, sample| {
      assert_eq!(sample.dims, ImageDims{height: 5, width: 5});
      seen.push(idx);
      Ok(())
    }).unwrap();
    assert_eq!(seen, (2 .. 11).collect::<Vec<_>>());
  }

  #[test]
  fn pool_reports_first_failure_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let split = write_split(dir.path(), &["a", "b", "c", "d"], (5, 5));
    let mut pairs = list_pairs(&split).unwrap();
    pairs.sort_by(|x, y| x.image.cmp(&y.image));
    fs::remove_file(&pairs[2].mask).unwrap();

    let loader = SampleLoader::new(3);
    let mut seen = vec![];
    let res = loader.load_in_order(&pairs, 0 .. 4, |idx, _| {
      seen.push(idx);
      Ok(())
    });
    assert!(matches!(res, Err(ConvertError::ReadSample{..})));
    assert_eq!(seen, vec![0, 1]);
  }

  #[test]
  fn pool_keeps_a_bounded_window_ahead_of_a_slow_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0 .. 24).map(|i| format!("s{:02}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let split = write_split(dir.path(), &name_refs, (3, 3));
    let pairs = list_pairs(&split).unwrap();

    let loader = SampleLoader::new(4);
    assert_eq!(loader.window(), 8);
    let mut max_ahead = 0;
    loader.load_in_order(&pairs, 0 .. pairs.len(), |idx, _| {
      if idx == 0 {
        thread::sleep(Duration::from_millis(200));
      }
      let started = loader.samples_started();
      assert!(started <= idx + loader.window(), "{} samples started at {}", started, idx);
      max_ahead = max(max_ahead, started - idx);
      Ok(())
    }).unwrap();
    assert!(max_ahead >= 1);
    assert_eq!(loader.samples_started(), 24);
  }

  #[test]
  fn verify_shard_counts_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train-00000-of-00001.tfrecord");
    let mut writer = TfRecordWriter::create(&path).unwrap();
    for i in 0 .. 2 {
      let image = jpeg_bytes(4, 2);
      let mask = png_mask_bytes(4, 2);
      let record = example::encode(&image, Path::new(&format!("x{}.jpg", i)), 2, 4, &mask);
      writer.write(&record).unwrap();
    }
    writer.finish().unwrap();

    verify_shard(&path, 2).unwrap();
    match verify_shard(&path, 3) {
      Err(ConvertError::VerifyMismatch{expected, found, ..}) => {
        assert_eq!((expected, found), (3, 2));
      }
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn verify_shard_rejects_non_example_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.tfrecord");
    let mut writer = TfRecordWriter::create(&path).unwrap();
    writer.write(&[0xff, 0xff, 0xff]).unwrap();
    writer.finish().unwrap();
    assert!(matches!(verify_shard(&path, 1), Err(ConvertError::CorruptRecord{..})));
  }

  #[test]
  fn convert_split_writes_every_shard() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0 .. 10).map(|i| format!("ADE_train_{:08}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let split = write_split(&dir.path().join("data"), &name_refs, (6, 4));

    let mut config = Ade20kConfig::new(dir.path().join("in"), dir.path().join("out"));
    config.shard_dir = dir.path().join("shards");
    config.write_manifest = true;
    config.verify_shards = true;

    let mut sink: Vec<PathBuf> = vec![];
    let mut rng = shuffle_rng(Some(7));
    let report = convert_split(&config, &split, &SampleLoader::Sequential, &mut rng, &mut sink).unwrap();

    assert_eq!(report.total, 10);
    let counts: Vec<_> = report.shards.iter().map(|s| s.records).collect();
    assert_eq!(counts, vec![3, 3, 3, 1]);
    assert_eq!(sink.len(), 4);
    assert_eq!(sink[0], config.shard_dir.join("train-00000-of-00004.tfrecord"));

    let mut seen = HashSet::new();
    for shard in &report.shards {
      for record in TfRecordReader::open(&shard.path).unwrap() {
        let rec = example::decode(&record.unwrap()).unwrap();
        assert_eq!(rec.dims, ImageDims{height: 4, width: 6});
        assert!(seen.insert(rec.filename));
      }
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(report.manifest.len(), 10);
    assert_eq!(report.manifest[9].shard, 3);
  }

  #[test]
  fn empty_split_still_writes_all_shards() {
    let dir = tempfile::tempdir().unwrap();
    let split = write_split(&dir.path().join("data"), &[], (1, 1));
    let mut config = Ade20kConfig::new(dir.path().join("in"), dir.path().join("out"));
    config.shard_dir = dir.path().join("shards");

    let mut sink: Vec<PathBuf> = vec![];
    let report = convert_split(&config, &split, &SampleLoader::Sequential, &mut shuffle_rng(None), &mut sink).unwrap();
    assert_eq!(report.shards.len(), 4);
    for shard in &report.shards {
      assert_eq!(shard.records, 0);
      assert_eq!(fs::metadata(&shard.path).unwrap().len(), 0);
    }
  }
}

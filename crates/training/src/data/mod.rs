use std::path::{Path, PathBuf};

use candle_core::{safetensors, DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// File looked up inside `data_path` when it names a directory.
pub const TRAIN_FILENAME: &str = "train.safetensors";
pub const IMAGES_KEY: &str = "images";
pub const LABELS_KEY: &str = "labels";

/// Batch of images `[N, H, W, C]` (f32 in [0, 1]) and class ids `[N]` (u32).
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub images: Tensor,
    pub labels: Tensor,
    pub epoch: usize,
}

/// Source of training batches.
pub trait BatchSource {
    /// Returns the next `batch_size` examples.
    ///
    /// With `multiple_passes` the source reshuffles and starts over whenever
    /// fewer than `batch_size` examples remain in the current pass; without
    /// it, a short final batch is returned and further calls fail.
    fn next_batch(&mut self, batch_size: usize, multiple_passes: bool) -> Result<DataBatch>;

    /// Advances past `batches` batches without materializing them.
    fn skip(&mut self, batches: usize, batch_size: usize, multiple_passes: bool) -> Result<()> {
        for _ in 0..batches {
            self.next_batch(batch_size, multiple_passes)?;
        }
        Ok(())
    }
}

/// In-memory labelled image set with seeded shuffling.
pub struct ImageDataset {
    images: Tensor,
    labels: Tensor,
    order: Vec<u32>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl ImageDataset {
    pub fn from_tensors(images: Tensor, labels: Tensor, seed: u64) -> Result<Self> {
        let dims = images.dims().to_vec();
        if dims.len() != 4 {
            return Err(TrainingError::shape(format!(
                "dataset images must be [N, H, W, C], got {:?}",
                dims
            )));
        }
        let images = match images.dtype() {
            DType::U8 => images.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?,
            DType::F32 => images,
            other => images.to_dtype(DType::F32).map_err(|err| {
                TrainingError::initialization(format!(
                    "unsupported image dtype {:?}: {err}",
                    other
                ))
            })?,
        };

        let labels = labels.flatten_all()?;
        let labels = match labels.dtype() {
            DType::U32 => labels,
            DType::U8 | DType::I64 => labels.to_dtype(DType::U32)?,
            other => {
                return Err(TrainingError::initialization(format!(
                    "unsupported label dtype {:?}",
                    other
                )))
            }
        };

        let count = dims[0];
        if labels.dims()[0] != count {
            return Err(TrainingError::shape(format!(
                "dataset has {} images but {} labels",
                count,
                labels.dims()[0]
            )));
        }
        if count == 0 {
            return Err(TrainingError::initialization("dataset is empty"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<u32> = (0..count as u32).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            images,
            labels,
            order,
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    /// Loads `images` and `labels` tensors from a safetensors file; a
    /// directory resolves to its `train.safetensors`.
    pub fn load(path: &Path, seed: u64) -> Result<Self> {
        let file = resolve_data_file(path);
        if !file.is_file() {
            return Err(TrainingError::initialization(format!(
                "training data not found at {}",
                file.display()
            )));
        }
        let mut tensors = safetensors::load(&file, &Device::Cpu).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read training data {}: {err}",
                file.display()
            ))
        })?;
        let images = tensors.remove(IMAGES_KEY).ok_or_else(|| {
            TrainingError::initialization(format!(
                "{} has no '{}' tensor",
                file.display(),
                IMAGES_KEY
            ))
        })?;
        let labels = tensors.remove(LABELS_KEY).ok_or_else(|| {
            TrainingError::initialization(format!(
                "{} has no '{}' tensor",
                file.display(),
                LABELS_KEY
            ))
        })?;
        log::info!(
            "loaded {} training examples from {}",
            images.dims().first().copied().unwrap_or(0),
            file.display()
        );
        Self::from_tensors(images, labels, seed)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        self.epoch += 1;
    }

    fn gather(&self, start: usize, end: usize) -> Result<DataBatch> {
        let indices = &self.order[start..end];
        let index = Tensor::from_slice(indices, indices.len(), self.images.device())?;
        Ok(DataBatch {
            images: self.images.index_select(&index, 0)?,
            labels: self.labels.index_select(&index, 0)?,
            epoch: self.epoch,
        })
    }

    /// Moves the cursor over the next batch and returns its index range.
    fn advance(&mut self, batch_size: usize, multiple_passes: bool) -> Result<(usize, usize)> {
        let total = self.order.len();
        if batch_size == 0 {
            return Err(TrainingError::runtime("batch size must be greater than 0"));
        }
        if batch_size > total {
            return Err(TrainingError::shape(format!(
                "batch size {} exceeds dataset size {}",
                batch_size, total
            )));
        }

        if !multiple_passes {
            let available = total - self.cursor;
            if available == 0 {
                return Err(TrainingError::runtime(
                    "pass through the dataset is complete",
                ));
            }
            let start = self.cursor;
            self.cursor += batch_size.min(available);
            return Ok((start, self.cursor));
        }

        if total - self.cursor < batch_size {
            self.reshuffle();
        }
        let start = self.cursor;
        self.cursor += batch_size;
        Ok((start, self.cursor))
    }
}

impl BatchSource for ImageDataset {
    fn next_batch(&mut self, batch_size: usize, multiple_passes: bool) -> Result<DataBatch> {
        let (start, end) = self.advance(batch_size, multiple_passes)?;
        self.gather(start, end)
    }

    fn skip(&mut self, batches: usize, batch_size: usize, multiple_passes: bool) -> Result<()> {
        for _ in 0..batches {
            self.advance(batch_size, multiple_passes)?;
        }
        Ok(())
    }
}

fn resolve_data_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(TRAIN_FILENAME)
    } else {
        path.to_path_buf()
    }
}

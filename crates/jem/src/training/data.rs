//! In-memory labelled image data for JEM training.
//!
//! Images are stored flattened (`C*H*W`, row-major) with values in `[-1, 1]`.
//! Datasets load from a JSON array of `{ "pixels": [..], "label": n }`
//! records and are split into shuffled [`ImageBatch`]es once per epoch.

use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::bridge::images_to_tensor;

/// One labelled image as stored on disk.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LabeledImage {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// A batch of flattened images with one class id each.
#[derive(Clone, Debug, Default)]
pub struct ImageBatch {
    pub images: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Convert to an image tensor `(batch, C, H, W)` and a label tensor `(batch,)`.
    pub fn to_tensors<B: Backend>(
        &self,
        shape: [usize; 3],
        device: &B::Device,
    ) -> anyhow::Result<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
        anyhow::ensure!(
            self.images.len() == self.labels.len(),
            "batch has {} images but {} labels",
            self.images.len(),
            self.labels.len()
        );
        let images = images_to_tensor::<B>(&self.images, shape, device)?;
        let ids: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();
        let labels = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [self.labels.len()]), device);
        Ok((images, labels))
    }
}

/// Labelled images of a single shape.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    records: Vec<LabeledImage>,
    shape: [usize; 3],
}

impl ImageDataset {
    /// Build a dataset, checking every record against `shape` and `num_classes`.
    pub fn new(records: Vec<LabeledImage>, shape: [usize; 3], num_classes: usize) -> anyhow::Result<Self> {
        let numel: usize = shape.iter().product();
        for (i, record) in records.iter().enumerate() {
            anyhow::ensure!(
                record.pixels.len() == numel,
                "record {i} has {} pixels, expected {numel} for shape {shape:?}",
                record.pixels.len()
            );
            anyhow::ensure!(
                record.label < num_classes,
                "record {i} has label {} >= num_classes {num_classes}",
                record.label
            );
        }
        Ok(Self { records, shape })
    }

    /// Load a JSON array of [`LabeledImage`] records.
    pub fn load_json(path: &Path, shape: [usize; 3], num_classes: usize) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open dataset {}: {e}", path.display()))?;
        let records: Vec<LabeledImage> = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| anyhow::anyhow!("Failed to parse dataset {}: {e}", path.display()))?;
        let dataset = Self::new(records, shape, num_classes)?;
        tracing::info!(
            path = %path.display(),
            records = dataset.len(),
            shape = ?shape,
            "Loaded image dataset"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Split into batches of `batch_size` (the last one may be shorter),
    /// shuffled when `rng` is given.
    pub fn batches(&self, batch_size: usize, rng: Option<&mut impl Rng>) -> Vec<ImageBatch> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|chunk| ImageBatch {
                images: chunk.iter().map(|&i| self.records[i].pixels.clone()).collect(),
                labels: chunk.iter().map(|&i| self.records[i].label).collect(),
            })
            .collect()
    }
}

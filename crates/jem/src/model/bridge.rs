//! Tensor bridge: conversions between host image buffers (`Vec<f32>`,
//! row-major `C×H×W`) and burn tensors.
//!
//! The CLI and tests exchange images as plain vectors; the model and the
//! sampler need `Tensor<B, 4>` batches.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Convert a batch of flattened images to a `(batch, C, H, W)` tensor.
///
/// # Errors
/// Fails if `images` is empty or any image does not hold `C*H*W` values.
pub fn images_to_tensor<B: Backend>(
    images: &[Vec<f32>],
    shape: [usize; 3],
    device: &B::Device,
) -> anyhow::Result<Tensor<B, 4>> {
    anyhow::ensure!(!images.is_empty(), "images must not be empty");
    let [c, h, w] = shape;
    let numel = c * h * w;
    for (i, image) in images.iter().enumerate() {
        anyhow::ensure!(
            image.len() == numel,
            "image {i} has {} values, expected {numel} for shape {shape:?}",
            image.len()
        );
    }

    let batch = images.len();
    let flat: Vec<f32> = images.iter().flat_map(|v| v.iter().copied()).collect();
    Ok(Tensor::from_data(TensorData::new(flat, [batch, c, h, w]), device))
}

/// Split a `(batch, C, H, W)` tensor back into flattened host images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> anyhow::Result<Vec<Vec<f32>>> {
    let [batch, c, h, w] = tensor.dims();
    let flat = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read image tensor: {e:?}"))?;
    if batch == 0 {
        return Ok(Vec::new());
    }
    Ok(flat.chunks(c * h * w).map(|chunk| chunk.to_vec()).collect())
}

/// Extract f64 values from a burn 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> anyhow::Result<Vec<f64>> {
    let data = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read score tensor: {e:?}"))?;
    Ok(data.into_iter().map(|v| v as f64).collect())
}

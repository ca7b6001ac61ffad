//! Image-space tensor helpers
//!
//! Image tensors are `[batch, channels, height, width]` with values in
//! `[0, 1]` unless a function says otherwise.

use burn::prelude::*;
use thiserror::Error;

/// Errors from image tensor helpers
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OpsError {
    #[error("cannot resize {from:?} to {to:?}")]
    EmptySize { from: [usize; 2], to: [usize; 2] },

    #[error("tensor data could not be read: {0}")]
    Data(String),
}

/// Threshold a mask to exactly 0.0 and 1.0
///
/// Values strictly above `threshold` become 1.
pub fn binarize_mask<B: Backend>(mask: Tensor<B, 4>, threshold: f32) -> Tensor<B, 4> {
    mask.greater_elem(threshold).float()
}

/// `1 - x`, for masks and control images in `[0, 1]`
pub fn invert<B: Backend>(tensor: Tensor<B, 4>) -> Tensor<B, 4> {
    tensor.neg() + 1.0
}

/// Map `[0, 1]` pixels to the `[-1, 1]` range the VAE encoder expects
pub fn normalize_image<B: Backend>(image: Tensor<B, 4>) -> Tensor<B, 4> {
    image * 2.0 - 1.0
}

/// Repeat a tensor `count` times along the batch axis
pub fn repeat_batch<B: Backend, const D: usize>(tensor: Tensor<B, D>, count: usize) -> Tensor<B, D> {
    if count <= 1 {
        return tensor;
    }
    tensor.repeat_dim(0, count)
}

/// Nearest-neighbour resize to `[height, width]`
///
/// Source pixel for output `(y, x)` is `(y * h / height, x * w / width)`,
/// so integer downscales pick the top-left pixel of each block.
pub fn resize_nearest<B: Backend>(
    tensor: Tensor<B, 4>,
    size: [usize; 2],
) -> Result<Tensor<B, 4>, OpsError> {
    let [b, c, h, w] = tensor.dims();
    let [target_h, target_w] = size;
    if target_h == 0 || target_w == 0 || h == 0 || w == 0 {
        return Err(OpsError::EmptySize {
            from: [h, w],
            to: size,
        });
    }
    if [h, w] == size {
        return Ok(tensor);
    }

    let device = tensor.device();
    let values: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| OpsError::Data(format!("{e:?}")))?;

    let rows: Vec<usize> = (0..target_h).map(|y| y * h / target_h).collect();
    let cols: Vec<usize> = (0..target_w).map(|x| x * w / target_w).collect();

    let mut result = Vec::with_capacity(b * c * target_h * target_w);
    for plane in values.chunks_exact(h * w) {
        for &src_y in &rows {
            let row = &plane[src_y * w..(src_y + 1) * w];
            result.extend(cols.iter().map(|&src_x| row[src_x]));
        }
    }

    Ok(Tensor::from_data(
        TensorData::new(result, [b, c, target_h, target_w]),
        &device,
    ))
}

//! Classifier-Free Guidance utilities
//!
//! Provides the guidance functions shared across diffusers. Batches are
//! laid out unconditional-first for two-way guidance and
//! `[text, image, uncond]` for instruction guidance.

use burn::prelude::*;

use crate::error::{Result, SchedulerError};

/// Guidance runs only when the scale is above one
pub fn should_perform_guidance(guidance_scale: f32) -> bool {
    guidance_scale > 1.0
}

/// Image guidance scale used by instruction-guided diffusion
pub fn image_guidance_scale(strength: f32) -> f32 {
    1.0 + (1.0 - strength)
}

/// Batch multiplier for backend calls
///
/// `instruct` selects the three-way layout.
pub fn guidance_multiplier(guidance: bool, instruct: bool) -> usize {
    match (guidance, instruct) {
        (false, _) => 1,
        (true, false) => 2,
        (true, true) => 3,
    }
}

fn split_batch<B: Backend>(noise_pred: Tensor<B, 4>, parts: usize) -> Result<Vec<Tensor<B, 4>>> {
    let [batch, _, _, _] = noise_pred.dims();
    if batch == 0 || batch % parts != 0 {
        return Err(SchedulerError::GuidanceBatch { batch, parts });
    }
    Ok(noise_pred.chunk(parts, 0))
}

/// Apply classifier-free guidance
///
/// Splits the batch into `[uncond, cond]` halves and returns
/// `uncond + (cond - uncond) * guidance_scale`.
pub fn perform_guidance<B: Backend>(
    noise_pred: Tensor<B, 4>,
    guidance_scale: f32,
) -> Result<Tensor<B, 4>> {
    let mut halves = split_batch(noise_pred, 2)?.into_iter();
    let (Some(uncond), Some(cond)) = (halves.next(), halves.next()) else {
        return Err(SchedulerError::GuidanceBatch { batch: 0, parts: 2 });
    };
    Ok(uncond.clone() + (cond - uncond) * guidance_scale)
}

/// Apply three-way instruction guidance
///
/// Splits the batch into `[text, image, uncond]` thirds and returns
/// `uncond + guidance_scale * (text - image) + image_scale * (image - uncond)`.
pub fn perform_instruct_guidance<B: Backend>(
    noise_pred: Tensor<B, 4>,
    guidance_scale: f32,
    image_scale: f32,
) -> Result<Tensor<B, 4>> {
    let mut thirds = split_batch(noise_pred, 3)?.into_iter();
    let (Some(text), Some(image), Some(uncond)) = (thirds.next(), thirds.next(), thirds.next())
    else {
        return Err(SchedulerError::GuidanceBatch { batch: 0, parts: 3 });
    };
    Ok(uncond.clone()
        + (text - image.clone()) * guidance_scale
        + (image - uncond) * image_scale)
}

//! Diffusion pipeline: request types, progress reporting and the orchestrator

mod runner;

pub use runner::DiffusionPipeline;

use std::time::Duration;

use burn::prelude::*;
use burn_diffuse_image::TileConfig;
use burn_diffuse_samplers::SchedulerOptions;
use serde::{Deserialize, Serialize};

use crate::diffuser::Diffuser;
use crate::error::{DiffuseError, Result};

/// Constants of the model family behind the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Multiplier applied to VAE latents after encoding
    pub scale_factor: f32,
    /// UNet latent channels
    pub latent_channels: usize,
    /// Pixels per latent pixel along each axis
    pub vae_factor: usize,
    /// Tiled VAE decode
    pub tiling: TileConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::sd1x()
    }
}

impl ModelConfig {
    /// Stable Diffusion 1.x
    pub fn sd1x() -> Self {
        Self {
            scale_factor: 0.18215,
            latent_channels: 4,
            vae_factor: 8,
            tiling: TileConfig::default(),
        }
    }

    /// SD x4 upscaler: latents live at input resolution, decode is 4x
    pub fn upscaler() -> Self {
        Self {
            scale_factor: 0.08333,
            latent_channels: 4,
            vae_factor: 4,
            tiling: TileConfig::default(),
        }
    }

    /// Enable tiled decode with default tile settings
    pub fn with_tiling(mut self, tiling: TileConfig) -> Self {
        self.tiling = tiling;
        self
    }
}

/// ControlNet input handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlNetOptions {
    /// Invert the control image (`1 - x`) before inference, for control
    /// types trained on dark-on-light inputs
    pub invert: bool,
}

/// Debug flags for run diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugConfig {
    /// Log latent statistics at every step (debug level)
    pub stats: bool,
    /// Fail the run when latents contain NaN/Inf
    pub nan: bool,
}

/// Everything one diffusion run consumes
///
/// Images are `[1, 3, H, W]` in `[0, 1]`; masks are `[1, 1, H, W]` keep
/// masks where 1 keeps the input pixel and 0 regenerates it. Prompt
/// embeddings are `[1, tokens, dim]`.
#[derive(Debug, Clone)]
pub struct DiffuseRequest<B: Backend> {
    pub diffuser: Diffuser,
    pub options: SchedulerOptions,
    /// Conditional prompt embedding
    pub prompt_embeds: Tensor<B, 3>,
    /// Unconditional (negative prompt) embedding; zeros when absent
    pub negative_embeds: Option<Tensor<B, 3>>,
    pub input_image: Option<Tensor<B, 4>>,
    pub mask: Option<Tensor<B, 4>>,
    pub control_image: Option<Tensor<B, 4>>,
    pub control_net: ControlNetOptions,
    /// Images generated side by side in one run
    pub batch_count: usize,
    /// Video frames for [`Diffuser::Animate`]
    pub frames: usize,
    pub debug: DebugConfig,
}

impl<B: Backend> DiffuseRequest<B> {
    pub fn new(diffuser: Diffuser, prompt_embeds: Tensor<B, 3>, options: SchedulerOptions) -> Self {
        Self {
            diffuser,
            options,
            prompt_embeds,
            negative_embeds: None,
            input_image: None,
            mask: None,
            control_image: None,
            control_net: ControlNetOptions::default(),
            batch_count: 1,
            frames: 16,
            debug: DebugConfig::default(),
        }
    }

    pub fn with_negative_embeds(mut self, embeds: Tensor<B, 3>) -> Self {
        self.negative_embeds = Some(embeds);
        self
    }

    pub fn with_input_image(mut self, image: Tensor<B, 4>) -> Self {
        self.input_image = Some(image);
        self
    }

    pub fn with_mask(mut self, mask: Tensor<B, 4>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_control_image(mut self, image: Tensor<B, 4>, options: ControlNetOptions) -> Self {
        self.control_image = Some(image);
        self.control_net = options;
        self
    }

    pub fn with_batch_count(mut self, count: usize) -> Self {
        self.batch_count = count;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }

    /// Latent samples per backend call before guidance multiplication
    pub fn sample_count(&self) -> usize {
        match self.diffuser {
            Diffuser::Animate => self.batch_count * self.frames,
            _ => self.batch_count,
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Emitted after every completed step
#[derive(Debug, Clone)]
pub struct DiffusionProgress<B: Backend> {
    /// Completed steps (1-indexed)
    pub step: usize,
    pub steps: usize,
    pub timestep: usize,
    /// Position within a batch run (0-indexed)
    pub batch_index: usize,
    pub batch_count: usize,
    /// Wall time of the step
    pub elapsed: Duration,
    /// Current latents, when the sink asked for them
    pub preview: Option<Tensor<B, 4>>,
}

/// Receives progress notifications
///
/// Called synchronously from the denoising loop; slow sinks delay the
/// next cancellation check.
pub trait ProgressSink<B: Backend>: Send + Sync {
    fn notify(&self, progress: DiffusionProgress<B>);

    /// Request latent previews (costs a tensor clone per step)
    fn wants_preview(&self) -> bool {
        false
    }
}

/// Discards all progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl<B: Backend> ProgressSink<B> for NullProgress {
    fn notify(&self, _progress: DiffusionProgress<B>) {}
}

impl<B: Backend, F> ProgressSink<B> for F
where
    F: Fn(DiffusionProgress<B>) + Send + Sync,
{
    fn notify(&self, progress: DiffusionProgress<B>) {
        self(progress)
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

fn read_floats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Option<Vec<f32>> {
    tensor.clone().into_data().convert::<f32>().to_vec().ok()
}

/// Summary statistics for debug logging
pub(crate) fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let Some(floats) = read_floats(tensor) else {
        return "unreadable".to_string();
    };
    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;

    let mut stats = format!(
        "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
        min,
        max,
        mean,
        var.sqrt()
    );
    if nan_count > 0 || inf_count > 0 {
        stats.push_str(&format!(" [NaN={}, Inf={}]", nan_count, inf_count));
    }
    stats
}

/// Fail with [`DiffuseError::NonFinite`] when `enabled` and the tensor has NaN/Inf
pub(crate) fn check_finite<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let floats = read_floats(tensor).unwrap_or_default();
    let nan = floats.iter().filter(|x| x.is_nan()).count();
    let inf = floats.iter().filter(|x| x.is_infinite()).count();
    if nan > 0 || inf > 0 {
        return Err(DiffuseError::NonFinite {
            name: name.to_string(),
            nan,
            inf,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::sync::Mutex;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tensor_stats() {
        let t = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![1.0f32, 3.0], [2]),
            &Default::default(),
        );
        assert_eq!(tensor_stats(&t), "min=1.0000, max=3.0000, mean=2.0000, std=1.0000");
    }

    #[test]
    fn test_check_finite() {
        let device = Default::default();
        let good = Tensor::<TestBackend, 1>::ones([3], &device);
        let bad = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![1.0f32, f32::NAN, f32::INFINITY], [3]),
            &device,
        );
        assert!(check_finite(&good, "good", true).is_ok());
        assert!(check_finite(&bad, "bad", false).is_ok());
        assert!(matches!(
            check_finite(&bad, "bad", true),
            Err(DiffuseError::NonFinite { nan: 1, inf: 1, .. })
        ));
    }

    #[test]
    fn test_closure_progress_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: DiffusionProgress<TestBackend>| seen.lock().unwrap().push(p.step);
        for step in 1..=3 {
            let progress = DiffusionProgress::<TestBackend> {
                step,
                steps: 3,
                timestep: 0,
                batch_index: 0,
                batch_count: 1,
                elapsed: Duration::ZERO,
                preview: None,
            };
            ProgressSink::<TestBackend>::notify(&sink, progress);
        }
        assert!(!ProgressSink::<TestBackend>::wants_preview(&sink));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_sample_count() {
        let embeds = Tensor::<TestBackend, 3>::zeros([1, 2, 4], &Default::default());
        let request = DiffuseRequest::new(Diffuser::Animate, embeds, SchedulerOptions::default())
            .with_frames(8)
            .with_batch_count(2);
        assert_eq!(request.sample_count(), 16);
        let request = DiffuseRequest { diffuser: Diffuser::TextToImage, ..request };
        assert_eq!(request.sample_count(), 2);
    }
}

//! Per-step UNet input assembly
//!
//! Everything a variant adds to the plain `(sample, timestep, embeds)` call
//! is resolved once into a [`StepPlan`] before the loop starts.

use burn::prelude::*;
use burn_diffuse_image::{binarize_mask, invert, normalize_image, repeat_batch, resize_nearest};
use burn_diffuse_samplers::{
    AnyScheduler, DdpmScheduler, Scheduler, SchedulerKind, SchedulerOptions,
    guidance_multiplier, image_guidance_scale, should_perform_guidance,
};
use tracing::debug;

use super::latents::check_image;
use super::{DiffuseContext, Diffuser};
use crate::backend::InferenceBackend;
use crate::error::{DiffuseError, Result};
use crate::pipeline::DiffuseRequest;

/// Threshold separating kept and regenerated mask pixels
const MASK_THRESHOLD: f32 = 0.5;

/// How noise predictions are combined
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum GuidanceMode {
    Off,
    /// Batch `[uncond, cond]`
    Classifier { scale: f32 },
    /// Batch `[text, image, uncond]`
    Instruct { scale: f32, image_scale: f32 },
}

impl GuidanceMode {
    pub fn for_request(diffuser: Diffuser, options: &SchedulerOptions) -> Self {
        if !should_perform_guidance(options.guidance_scale) {
            return GuidanceMode::Off;
        }
        if diffuser.is_instruct() {
            GuidanceMode::Instruct {
                scale: options.guidance_scale,
                image_scale: image_guidance_scale(options.strength),
            }
        } else {
            GuidanceMode::Classifier {
                scale: options.guidance_scale,
            }
        }
    }

    /// Batch multiplier for every backend call
    pub fn multiplier(&self) -> usize {
        match self {
            GuidanceMode::Off => guidance_multiplier(false, false),
            GuidanceMode::Classifier { .. } => guidance_multiplier(true, false),
            GuidanceMode::Instruct { .. } => guidance_multiplier(true, true),
        }
    }
}

/// ControlNet inputs, already at full call batch
pub(super) struct ControlInputs<B: Backend> {
    pub image: Tensor<B, 4>,
    pub scale: Tensor<B, 1>,
}

/// Low-resolution conditioning for the upscaler
///
/// The image is re-noised from the untouched original at every step with
/// the same noise tensor, so the conditioning never drifts with the latents.
pub(super) struct UpscaleInputs<B: Backend> {
    image: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    low_res: DdpmScheduler<B>,
    level: usize,
    pub noise_level: Tensor<B, 1, Int>,
}

impl<B: Backend> UpscaleInputs<B> {
    fn noised_image(&self) -> Result<Tensor<B, 4>> {
        Ok(self
            .low_res
            .add_noise(self.image.clone(), self.noise.clone(), &[self.level])?)
    }
}

/// Re-imposes the kept region after each step
pub(super) struct LegacyBlend<B: Backend> {
    original: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    /// Keep mask expanded to the latent shape
    keep: Tensor<B, 4>,
}

impl<B: Backend> LegacyBlend<B> {
    /// `noised_original * keep + stepped * (1 - keep)`
    pub fn apply(
        &self,
        scheduler: &AnyScheduler<B>,
        stepped: Tensor<B, 4>,
        timestep: usize,
    ) -> Result<Tensor<B, 4>> {
        let proper = scheduler.add_noise(self.original.clone(), self.noise.clone(), &[timestep])?;
        Ok(proper * self.keep.clone() + stepped * invert(self.keep.clone()))
    }
}

/// Inputs fixed for the whole run
pub(super) struct StepPlan<B: Backend> {
    pub guidance: GuidanceMode,
    /// Prompt embeddings at full call batch
    pub embeds: Tensor<B, 3>,
    /// Channels appended to the scaled latents
    pub extra_channels: Option<Tensor<B, 4>>,
    pub control: Option<ControlInputs<B>>,
    pub upscale: Option<UpscaleInputs<B>>,
    pub blend: Option<LegacyBlend<B>>,
}

impl<B: Backend> StepPlan<B> {
    /// UNet `sample` input from the scaled, batch-multiplied latents
    pub fn unet_sample(&self, scaled: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let mut parts = vec![scaled];
        if let Some(extra) = &self.extra_channels {
            parts.push(extra.clone());
        }
        if let Some(upscale) = &self.upscale {
            parts.push(upscale.noised_image()?);
        }
        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }

        let batch = parts[0].dims()[0];
        if let Some(bad) = parts.iter().find(|p| p.dims()[0] != batch) {
            return Err(DiffuseError::Shape {
                name: "unet sample",
                expected: vec![batch],
                actual: bad.dims().to_vec(),
            });
        }
        Ok(Tensor::cat(parts, 1))
    }
}

/// Prompt embeddings laid out for `mode`
fn prompt_batch<B: Backend>(request: &DiffuseRequest<B>, mode: GuidanceMode) -> Tensor<B, 3> {
    let count = request.sample_count();
    let cond = repeat_batch(request.prompt_embeds.clone(), count);
    let uncond = || {
        let negative = request
            .negative_embeds
            .clone()
            .unwrap_or_else(|| request.prompt_embeds.zeros_like());
        repeat_batch(negative, count)
    };
    match mode {
        GuidanceMode::Off => cond,
        GuidanceMode::Classifier { .. } => Tensor::cat(vec![uncond(), cond], 0),
        GuidanceMode::Instruct { .. } => Tensor::cat(vec![cond, uncond(), uncond()], 0),
    }
}

fn take<B: Backend>(
    diffuser: Diffuser,
    tensor: &Option<Tensor<B, 4>>,
    input: &'static str,
) -> Result<Tensor<B, 4>> {
    tensor
        .clone()
        .ok_or(DiffuseError::MissingInput { diffuser, input })
}

impl Diffuser {
    /// Resolve the per-step inputs this variant needs
    pub(super) async fn build_plan<B, E>(
        &self,
        ctx: &DiffuseContext<'_, B, E>,
        request: &DiffuseRequest<B>,
        scheduler: &mut AnyScheduler<B>,
        original: Option<Tensor<B, 4>>,
        noise: Option<Tensor<B, 4>>,
    ) -> Result<StepPlan<B>>
    where
        B: Backend,
        E: InferenceBackend<B> + ?Sized,
    {
        let options = &request.options;
        let guidance = GuidanceMode::for_request(*self, options);
        let multiplier = guidance.multiplier();
        let count = request.sample_count();
        let calls = count * multiplier;
        let latent_size = [
            options.height / ctx.model.vae_factor,
            options.width / ctx.model.vae_factor,
        ];

        let mut plan = StepPlan {
            guidance,
            embeds: prompt_batch(request, guidance),
            extra_channels: None,
            control: None,
            upscale: None,
            blend: None,
        };

        match self {
            Diffuser::TextToImage | Diffuser::ImageToImage | Diffuser::Animate => {}
            Diffuser::Inpaint => {
                let image = take(*self, &request.input_image, "image")?;
                check_image(&image, options.height, options.width)?;
                let mask = take(*self, &request.mask, "mask")?;
                let [_, _, h, w] = image.dims();

                // Masked pixels encode as mid grey (0 after normalization)
                let keep_pixels = binarize_mask(resize_nearest(mask.clone(), [h, w])?, MASK_THRESHOLD)
                    .repeat_dim(1, 3);
                let masked = image * keep_pixels.clone() + invert(keep_pixels) * 0.5;
                let masked_latents = ctx.encode(masked).await? * ctx.model.scale_factor;

                let keep = binarize_mask(resize_nearest(mask, latent_size)?, MASK_THRESHOLD);
                let repaint = invert(keep);
                plan.extra_channels = Some(repeat_batch(
                    Tensor::cat(vec![repaint, masked_latents], 1),
                    calls,
                ));
            }
            Diffuser::InpaintLegacy => {
                let mask = take(*self, &request.mask, "mask")?;
                let (Some(original), Some(noise)) = (original, noise) else {
                    return Err(DiffuseError::MissingInput {
                        diffuser: *self,
                        input: "image",
                    });
                };
                let [_, channels, _, _] = original.dims();
                let keep = binarize_mask(resize_nearest(mask, latent_size)?, MASK_THRESHOLD)
                    .repeat_dim(1, channels);
                plan.blend = Some(LegacyBlend {
                    original,
                    noise,
                    keep: repeat_batch(keep, count),
                });
            }
            Diffuser::Instruct | Diffuser::InstructControlNet => {
                let image = take(*self, &request.input_image, "image")?;
                check_image(&image, options.height, options.width)?;
                let image_latents = repeat_batch(ctx.encode(image).await?, count);
                let extra = match guidance {
                    GuidanceMode::Off => image_latents,
                    _ => {
                        let zeros = image_latents.zeros_like();
                        Tensor::cat(vec![image_latents.clone(), image_latents, zeros], 0)
                    }
                };
                plan.extra_channels = Some(extra);
            }
            Diffuser::Upscale => {
                let image = take(*self, &request.input_image, "image")?;
                let [_, _, h, w] = image.dims();
                check_image(&image, h, w)?;
                let image = normalize_image(image);
                let noise = scheduler.create_random_sample(image.dims(), 1.0);
                let low_res_options = SchedulerOptions::with_scheduler(SchedulerKind::Ddpm);
                let noise_level = Tensor::<B, 1, Int>::from_data(
                    TensorData::new(vec![options.noise_level as i64; calls], [calls]),
                    ctx.device,
                );
                plan.upscale = Some(UpscaleInputs {
                    image: repeat_batch(image, calls),
                    noise: repeat_batch(noise, calls),
                    low_res: DdpmScheduler::new(&low_res_options, ctx.device),
                    level: options.noise_level,
                    noise_level,
                });
            }
            Diffuser::ControlNet | Diffuser::ControlNetImage => {}
        }

        if self.uses_control_net() {
            let control = take(*self, &request.control_image, "control image")?;
            let control = if request.control_net.invert {
                invert(control)
            } else {
                control
            };
            plan.control = Some(ControlInputs {
                image: repeat_batch(control, calls),
                scale: Tensor::from_data(
                    TensorData::new(vec![options.conditioning_scale], [1]),
                    ctx.device,
                ),
            });
        }

        debug!(
            diffuser = %self,
            guidance = ?plan.guidance,
            embeds = ?plan.embeds.dims(),
            extra_channels = ?plan.extra_channels.as_ref().map(|t| t.dims()),
            control = plan.control.is_some(),
            "step plan ready"
        );
        Ok(plan)
    }
}

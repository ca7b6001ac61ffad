//! Diffuser variants
//!
//! A [`Diffuser`] drives one denoising run for one task. All variants share
//! the same loop; they differ in how the initial latents are prepared, which
//! slice of the schedule they traverse and what each step feeds the UNet.
//! Those differences are resolved by a `match` on the variant when the run
//! is set up, never inside the loop.

mod latents;
mod plan;

pub use latents::strength_start;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use burn::prelude::*;
use burn_diffuse_image::repeat_batch;
use burn_diffuse_samplers::{
    AnyScheduler, Scheduler, SchedulerOptions, create_scheduler, perform_guidance,
    perform_instruct_guidance,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendError, Graph, InferenceBackend, TensorMap, names};
use crate::error::{DiffuseError, Result};
use crate::pipeline::{
    DiffuseRequest, DiffusionProgress, ModelConfig, ProgressSink, check_finite, tensor_stats,
};

use latents::Prepared;
use plan::GuidanceMode;

/// Task a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diffuser {
    /// Random latents, full schedule
    #[default]
    TextToImage,
    /// Encoded input image, partial schedule
    ImageToImage,
    /// Inpainting UNet: mask and masked-image latents as extra channels
    Inpaint,
    /// Standard UNet; the kept region is re-imposed after every step
    InpaintLegacy,
    /// Text-to-image with ControlNet residuals
    ControlNet,
    /// Image-to-image with ControlNet residuals
    ControlNetImage,
    /// Instruction editing with three-way guidance
    Instruct,
    /// Instruction editing with ControlNet residuals
    InstructControlNet,
    /// Degradation-conditioned super resolution
    Upscale,
    /// Text-to-video with frames folded into the batch
    Animate,
}

impl Diffuser {
    pub const ALL: [Diffuser; 10] = [
        Diffuser::TextToImage,
        Diffuser::ImageToImage,
        Diffuser::Inpaint,
        Diffuser::InpaintLegacy,
        Diffuser::ControlNet,
        Diffuser::ControlNetImage,
        Diffuser::Instruct,
        Diffuser::InstructControlNet,
        Diffuser::Upscale,
        Diffuser::Animate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Diffuser::TextToImage => "text_to_image",
            Diffuser::ImageToImage => "image_to_image",
            Diffuser::Inpaint => "inpaint",
            Diffuser::InpaintLegacy => "inpaint_legacy",
            Diffuser::ControlNet => "control_net",
            Diffuser::ControlNetImage => "control_net_image",
            Diffuser::Instruct => "instruct",
            Diffuser::InstructControlNet => "instruct_control_net",
            Diffuser::Upscale => "upscale",
            Diffuser::Animate => "animate",
        }
    }

    /// Traverses only the tail of the schedule selected by `strength`
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Diffuser::ImageToImage
                | Diffuser::InpaintLegacy
                | Diffuser::ControlNetImage
                | Diffuser::Upscale
        )
    }

    pub fn uses_control_net(&self) -> bool {
        matches!(
            self,
            Diffuser::ControlNet | Diffuser::ControlNetImage | Diffuser::InstructControlNet
        )
    }

    pub fn is_instruct(&self) -> bool {
        matches!(self, Diffuser::Instruct | Diffuser::InstructControlNet)
    }

    pub fn needs_image(&self) -> bool {
        !matches!(
            self,
            Diffuser::TextToImage | Diffuser::ControlNet | Diffuser::Animate
        )
    }

    pub fn needs_mask(&self) -> bool {
        matches!(self, Diffuser::Inpaint | Diffuser::InpaintLegacy)
    }

    /// Timesteps this run visits
    ///
    /// Partial variants skip the first `strength_start * order` entries; an
    /// explicit override list is always used as given.
    pub fn get_timesteps<B: Backend>(
        &self,
        options: &SchedulerOptions,
        scheduler: &impl Scheduler<B>,
    ) -> Vec<usize> {
        let timesteps = scheduler.timesteps();
        if !self.is_partial() || options.timesteps.is_some() {
            return timesteps.to_vec();
        }

        let start = strength_start(options.inference_steps, options.strength);
        let skip = (start * scheduler.order()).min(timesteps.len());
        timesteps[skip..].to_vec()
    }

    /// Check the request carries every input this variant reads
    pub fn validate<B: Backend>(&self, request: &DiffuseRequest<B>) -> Result<()> {
        let missing = |input| DiffuseError::MissingInput {
            diffuser: *self,
            input,
        };
        if self.needs_image() && request.input_image.is_none() {
            return Err(missing("image"));
        }
        if self.needs_mask() && request.mask.is_none() {
            return Err(missing("mask"));
        }
        if self.uses_control_net() && request.control_image.is_none() {
            return Err(missing("control image"));
        }
        if let Some(mask) = &request.mask {
            let [batch, channels, _, _] = mask.dims();
            if (batch, channels) != (1, 1) {
                return Err(DiffuseError::Shape {
                    name: "mask",
                    expected: vec![1, 1],
                    actual: mask.dims().to_vec(),
                });
            }
        }
        if request.batch_count == 0 {
            return Err(DiffuseError::Config("batch_count must be at least 1".into()));
        }
        if *self == Diffuser::Animate && request.frames == 0 {
            return Err(DiffuseError::Config("frames must be at least 1".into()));
        }

        let [batch, _, _] = request.prompt_embeds.dims();
        if batch != 1 {
            return Err(DiffuseError::Shape {
                name: "prompt_embeds",
                expected: vec![1],
                actual: request.prompt_embeds.dims().to_vec(),
            });
        }
        if let Some(negative) = &request.negative_embeds {
            if negative.dims() != request.prompt_embeds.dims() {
                return Err(DiffuseError::Shape {
                    name: "negative_embeds",
                    expected: request.prompt_embeds.dims().to_vec(),
                    actual: negative.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Run the full denoising loop and decode the result
    pub async fn diffuse<B, E>(
        &self,
        ctx: &DiffuseContext<'_, B, E>,
        request: &DiffuseRequest<B>,
        progress: &dyn ProgressSink<B>,
        cancel: &CancellationToken,
    ) -> Result<Tensor<B, 4>>
    where
        B: Backend,
        E: InferenceBackend<B> + ?Sized,
    {
        self.validate(request)?;
        let options = &request.options;
        let mut scheduler: AnyScheduler<B> = create_scheduler(options, ctx.device)?;
        let timesteps = self.get_timesteps(options, &scheduler);

        info!(
            diffuser = %self,
            scheduler = %options.scheduler,
            steps = timesteps.len(),
            seed = options.seed,
            batch = ctx.batch_index,
            "diffusion started"
        );
        let run_start = Instant::now();

        if cancel.is_cancelled() {
            return Err(DiffuseError::Cancelled);
        }

        let Prepared {
            mut latents,
            original,
            noise,
        } = self
            .prepare_latents(ctx, request, &mut scheduler, &timesteps)
            .await?;
        let plan = self
            .build_plan(ctx, request, &mut scheduler, original, noise)
            .await?;
        if request.debug.stats {
            debug!(latents = %tensor_stats(&latents), "initial latents");
        }

        let multiplier = plan.guidance.multiplier();
        let timestep_tensors: Vec<Tensor<B, 1>> = timesteps
            .iter()
            .map(|&t| Tensor::from_data(TensorData::new(vec![t as f32], [1]), ctx.device))
            .collect();

        for (i, (&t, timestep)) in timesteps.iter().zip(timestep_tensors).enumerate() {
            if cancel.is_cancelled() {
                debug!(step = i, "cancellation observed");
                return Err(DiffuseError::Cancelled);
            }
            let step_start = Instant::now();

            let scaled = scheduler.scale_input(repeat_batch(latents.clone(), multiplier), t)?;
            let sample = plan.unet_sample(scaled.clone())?;

            let mut inputs = TensorMap::new()
                .with(names::SAMPLE, sample)
                .with(names::TIMESTEP, timestep.clone())
                .with(names::ENCODER_HIDDEN_STATES, plan.embeds.clone());

            if let Some(control) = &plan.control {
                let control_inputs = TensorMap::new()
                    .with(names::SAMPLE, scaled)
                    .with(names::TIMESTEP, timestep)
                    .with(names::ENCODER_HIDDEN_STATES, plan.embeds.clone())
                    .with(names::CONTROLNET_COND, control.image.clone())
                    .with(names::CONDITIONING_SCALE, control.scale.clone());
                let residuals = ctx.infer(Graph::ControlNet, control_inputs).await?;
                inputs.extend(residuals);
            }
            if let Some(upscale) = &plan.upscale {
                inputs.insert(names::CLASS_LABELS, upscale.noise_level.clone());
            }

            let noise_pred = ctx.infer_sample(Graph::Unet, inputs).await?;
            let noise_pred = match plan.guidance {
                GuidanceMode::Off => noise_pred,
                GuidanceMode::Classifier { scale } => perform_guidance(noise_pred, scale)?,
                GuidanceMode::Instruct { scale, image_scale } => {
                    perform_instruct_guidance(noise_pred, scale, image_scale)?
                }
            };

            latents = scheduler.step(noise_pred, t, latents)?;
            if let Some(blend) = &plan.blend {
                latents = blend.apply(&scheduler, latents, t)?;
            }
            check_finite(&latents, "latents", request.debug.nan)?;

            let elapsed = step_start.elapsed();
            debug!(
                step = i + 1,
                steps = timesteps.len(),
                timestep = t,
                elapsed_ms = elapsed.as_millis() as u64,
                "step complete"
            );
            if request.debug.stats {
                debug!(step = i + 1, latents = %tensor_stats(&latents), "latent stats");
            }

            progress.notify(DiffusionProgress {
                step: i + 1,
                steps: timesteps.len(),
                timestep: t,
                batch_index: ctx.batch_index,
                batch_count: ctx.batch_count,
                elapsed,
                preview: progress.wants_preview().then(|| latents.clone()),
            });
        }

        let image = self.decode_latents(ctx, latents).await?;
        info!(
            diffuser = %self,
            elapsed_ms = run_start.elapsed().as_millis() as u64,
            output = ?image.dims(),
            "diffusion finished"
        );
        Ok(image)
    }
}

impl fmt::Display for Diffuser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Diffuser {
    type Err = DiffuseError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Diffuser::ALL
            .into_iter()
            .find(|d| d.name() == normalized || d.name().replace('_', "") == normalized)
            .ok_or_else(|| DiffuseError::Config(format!("unknown diffuser: {s}")))
    }
}

/// Shared state of one run: backend, model constants and batch position
pub struct DiffuseContext<'a, B: Backend, E: ?Sized> {
    pub backend: &'a E,
    pub model: &'a ModelConfig,
    pub device: &'a B::Device,
    pub batch_index: usize,
    pub batch_count: usize,
}

impl<'a, B: Backend, E: InferenceBackend<B> + ?Sized> DiffuseContext<'a, B, E> {
    pub fn new(backend: &'a E, model: &'a ModelConfig, device: &'a B::Device) -> Self {
        Self {
            backend,
            model,
            device,
            batch_index: 0,
            batch_count: 1,
        }
    }

    pub(crate) async fn infer(&self, graph: Graph, inputs: TensorMap<B>) -> Result<TensorMap<B>> {
        self.backend
            .infer(graph, inputs)
            .await
            .map_err(|source| DiffuseError::Backend { graph, source })
    }

    /// Run `graph` and take its primary output
    pub(crate) async fn infer_sample(&self, graph: Graph, inputs: TensorMap<B>) -> Result<Tensor<B, 4>> {
        self.infer(graph, inputs)
            .await?
            .into_first_float4()
            .ok_or(DiffuseError::Backend {
                graph,
                source: BackendError::NoOutput,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_diffuse_samplers::SchedulerKind;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scheduler(options: &SchedulerOptions) -> AnyScheduler<TestBackend> {
        create_scheduler(options, &Default::default()).unwrap()
    }

    #[test]
    fn test_full_schedule_variants() {
        let options = SchedulerOptions {
            inference_steps: 10,
            strength: 0.3,
            ..Default::default()
        };
        let s = scheduler(&options);
        for diffuser in [Diffuser::TextToImage, Diffuser::Inpaint, Diffuser::Animate] {
            assert_eq!(diffuser.get_timesteps(&options, &s), s.timesteps());
        }
    }

    #[test]
    fn test_partial_schedule_slicing() {
        let base = SchedulerOptions {
            inference_steps: 10,
            ..Default::default()
        };
        let full = scheduler(&base).timesteps().to_vec();

        let options = SchedulerOptions { strength: 1.0, ..base.clone() };
        assert_eq!(Diffuser::ImageToImage.get_timesteps(&options, &scheduler(&options)), full);

        let options = SchedulerOptions { strength: 0.0, ..base.clone() };
        assert!(Diffuser::ImageToImage
            .get_timesteps(&options, &scheduler(&options))
            .is_empty());

        let options = SchedulerOptions { strength: 0.35, ..base };
        assert_eq!(
            Diffuser::ImageToImage.get_timesteps(&options, &scheduler(&options)),
            full[7..].to_vec()
        );
    }

    #[test]
    fn test_partial_schedule_respects_order() {
        let options = SchedulerOptions {
            inference_steps: 10,
            strength: 0.5,
            ..SchedulerOptions::with_scheduler(SchedulerKind::Kdpm2)
        };
        let s = scheduler(&options);
        let timesteps = Diffuser::ImageToImage.get_timesteps(&options, &s);
        // Five inference steps remain: 2 * 5 - 1 entries
        assert_eq!(timesteps.len(), 9);
        assert_eq!(timesteps[..], s.timesteps()[10..]);
    }

    #[test]
    fn test_override_is_not_sliced() {
        let options = SchedulerOptions {
            inference_steps: 3,
            strength: 0.2,
            timesteps: Some(vec![800, 400, 10]),
            ..Default::default()
        };
        let s = scheduler(&options);
        assert_eq!(Diffuser::ImageToImage.get_timesteps(&options, &s), vec![800, 400, 10]);
    }

    #[test]
    fn test_from_str() {
        for diffuser in Diffuser::ALL {
            assert_eq!(diffuser.name().parse::<Diffuser>().unwrap(), diffuser);
        }
        assert_eq!("ControlNet".parse::<Diffuser>().unwrap(), Diffuser::ControlNet);
        assert_eq!("inpaint-legacy".parse::<Diffuser>().unwrap(), Diffuser::InpaintLegacy);
        assert!("sketch".parse::<Diffuser>().is_err());
    }

    #[test]
    fn test_required_inputs() {
        let embeds = Tensor::<TestBackend, 3>::zeros([1, 2, 4], &Default::default());
        let request = DiffuseRequest::new(Diffuser::Inpaint, embeds, SchedulerOptions::default());
        assert!(matches!(
            Diffuser::Inpaint.validate(&request),
            Err(DiffuseError::MissingInput { input: "image", .. })
        ));
        assert!(Diffuser::TextToImage.validate(&request).is_ok());
        assert!(matches!(
            Diffuser::ControlNet.validate(&request),
            Err(DiffuseError::MissingInput { input: "control image", .. })
        ));
    }
}

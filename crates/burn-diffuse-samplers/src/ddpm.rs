//! DDPM (Denoising Diffusion Probabilistic Models) Scheduler
//!
//! Ancestral sampling from the posterior q(x_{t-1} | x_t, x0). Also used
//! with default options as the low-resolution noise scheduler of the
//! upscale pipeline.

use burn::prelude::*;

use crate::ddim::add_alpha_noise;
use crate::error::Result;
use crate::options::{SchedulerKind, SchedulerOptions, VarianceType};
use crate::scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, alpha_predicted_sample,
    timesteps_from_options,
};

/// DDPM Scheduler
#[derive(Debug, Clone)]
pub struct DdpmScheduler<B: Backend> {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    variance_type: VarianceType,
    prediction_type: PredictionType,
    clip_sample: Option<f32>,
    noise: NoiseGenerator,
    device: B::Device,
}

impl<B: Backend> DdpmScheduler<B> {
    /// Create a new DDPM scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        Self {
            schedule: NoiseSchedule::from_options(options),
            timesteps: timesteps_from_options(options),
            step_ratio: (options.train_timesteps / options.inference_steps.max(1)).max(1),
            variance_type: options.variance_type,
            prediction_type: options.prediction_type,
            clip_sample: options.clip_sample.then_some(options.clip_sample_range),
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// Standard deviation of the noise added when stepping away from `timestep`
    fn noise_std(&self, alpha_prod_t: f32, alpha_prod_prev: f32) -> f32 {
        let current_beta = 1.0 - alpha_prod_t / alpha_prod_prev;
        // posterior variance, clamped so the log variants stay finite
        let variance = ((1.0 - alpha_prod_prev) / (1.0 - alpha_prod_t) * current_beta).max(1e-20);

        match self.variance_type {
            VarianceType::FixedSmall => variance.sqrt(),
            VarianceType::FixedSmallLog => (0.5 * variance.ln()).exp(),
            VarianceType::FixedLarge => current_beta.max(0.0).sqrt(),
            VarianceType::FixedLargeLog => (0.5 * current_beta.max(1e-20).ln()).exp(),
        }
    }
}

impl<B: Backend> Scheduler<B> for DdpmScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddpm
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4> {
        self.noise.sample(shape, sigma, &self.device)
    }

    fn scale_input(&self, latents: Tensor<B, 4>, _timestep: usize) -> Result<Tensor<B, 4>> {
        Ok(latents)
    }

    /// Perform one DDPM step
    ///
    /// μ = sqrt(ᾱ_prev) βₜ / (1 - ᾱₜ) · x0 + sqrt(αₜ) (1 - ᾱ_prev) / (1 - ᾱₜ) · xₜ
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let alpha_prod_t = self.schedule.alpha_cumprod_at(timestep)?;
        let alpha_prod_prev = match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.schedule.alpha_cumprod_at(prev)?,
            None => 1.0,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (mut pred_original, _) =
            alpha_predicted_sample(model_output, latents.clone(), alpha_prod_t, self.prediction_type);

        if let Some(range) = self.clip_sample {
            pred_original = pred_original.clamp(-range, range);
        }

        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let current_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let prev_sample = pred_original * original_coeff + latents.clone() * current_coeff;

        if timestep == 0 {
            return Ok(prev_sample);
        }

        let std_dev = self.noise_std(alpha_prod_t, alpha_prod_prev);
        let noise = self.noise.sample(latents.dims(), std_dev, &self.device);
        Ok(prev_sample + noise)
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>> {
        add_alpha_noise(&self.schedule, original, noise, timesteps)
    }
}

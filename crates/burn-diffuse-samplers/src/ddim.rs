//! DDIM (Denoising Diffusion Implicit Models) Scheduler
//!
//! Implements deterministic sampling for faster inference. Setting `eta`
//! above zero re-introduces DDPM-style stochasticity.

use burn::prelude::*;

use crate::error::Result;
use crate::options::{SchedulerKind, SchedulerOptions};
use crate::scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, alpha_predicted_sample,
    timesteps_from_options,
};

/// DDIM Scheduler
///
/// Works directly on ᾱ, so latents are not pre-conditioned and the
/// initial noise sigma is 1.
#[derive(Debug, Clone)]
pub struct DdimScheduler<B: Backend> {
    /// Noise schedule
    schedule: NoiseSchedule,
    /// Timestep indices for sampling
    timesteps: Vec<usize>,
    /// Distance to the previous timestep
    step_ratio: usize,
    eta: f32,
    prediction_type: PredictionType,
    clip_sample: Option<f32>,
    noise: NoiseGenerator,
    device: B::Device,
}

impl<B: Backend> DdimScheduler<B> {
    /// Create a new DDIM scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        Self {
            schedule: NoiseSchedule::from_options(options),
            timesteps: timesteps_from_options(options),
            step_ratio: (options.train_timesteps / options.inference_steps.max(1)).max(1),
            eta: options.eta,
            prediction_type: options.prediction_type,
            clip_sample: options.clip_sample.then_some(options.clip_sample_range),
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// ᾱ of the timestep preceding `timestep`, or 1 past the end of the schedule
    fn alpha_prod_prev(&self, timestep: usize) -> Result<f32> {
        match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.schedule.alpha_cumprod_at(prev),
            None => Ok(1.0),
        }
    }
}

impl<B: Backend> Scheduler<B> for DdimScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddim
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

    /// Perform one DDIM step
    ///
    /// x_{t-1} = sqrt(ᾱ_prev) x0 + sqrt(1 - ᾱ_prev - σ²) ε + σ z
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let alpha_prod_t = self.schedule.alpha_cumprod_at(timestep)?;
        let alpha_prod_prev = self.alpha_prod_prev(timestep)?;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;

        let (mut pred_original, pred_epsilon) =
            alpha_predicted_sample(model_output, latents.clone(), alpha_prod_t, self.prediction_type);

        if let Some(range) = self.clip_sample {
            pred_original = pred_original.clamp(-range, range);
        }

        let variance = (beta_prod_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_prev);
        let std_dev = self.eta * variance.max(0.0).sqrt();

        let direction = pred_epsilon * (1.0 - alpha_prod_prev - std_dev * std_dev).max(0.0).sqrt();
        let prev_sample = pred_original * alpha_prod_prev.sqrt() + direction;

        if self.eta > 0.0 {
            let noise = self.noise.sample(latents.dims(), std_dev, &self.device);
            return Ok(prev_sample + noise);
        }
        Ok(prev_sample)
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

/// `sqrt(ᾱ) * original + sqrt(1 - ᾱ) * noise` at `timesteps[0]`
pub(crate) fn add_alpha_noise<B: Backend>(
    schedule: &NoiseSchedule,
    original: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    timesteps: &[usize],
) -> Result<Tensor<B, 4>> {
    let Some(&first) = timesteps.first() else {
        return Ok(original);
    };
    let alpha_prod = schedule.alpha_cumprod_at(first)?;
    Ok(original * alpha_prod.sqrt() + noise * (1.0 - alpha_prod).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn options(steps: usize) -> SchedulerOptions {
        SchedulerOptions {
            inference_steps: steps,
            ..SchedulerOptions::with_scheduler(SchedulerKind::Ddim)
        }
    }

    #[test]
    fn test_ddim_timesteps() {
        let device = Default::default();
        let scheduler = DdimScheduler::<TestBackend>::new(&options(50), &device);
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 999);
        assert_eq!(timesteps[49], 0);
        assert_eq!(scheduler.init_noise_sigma(), 1.0);
    }

    #[test]
    fn test_ddim_final_step_returns_prediction() {
        // At t = 0 with no previous step ᾱ_prev = 1, so the output is x0
        let device = Default::default();
        let mut scheduler = DdimScheduler::<TestBackend>::new(&options(4), &device);
        let sample = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.25, &device);
        let model_output = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.75, &device);

        let alpha = NoiseSchedule::sd1x().alphas_cumprod[0];
        let expected = (0.25 - (1.0 - alpha).sqrt() * 0.75) / alpha.sqrt();

        let out = scheduler.step(model_output, 0, sample).unwrap();
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        for v in values {
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ddim_add_noise_mixes_by_alpha() {
        let device = Default::default();
        let scheduler = DdimScheduler::<TestBackend>::new(&options(4), &device);
        let original = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let noise = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &device);

        let alpha = NoiseSchedule::sd1x().alphas_cumprod[333];
        let noised = scheduler.add_noise(original, noise, &[333]).unwrap();
        let value: Vec<f32> = noised.into_data().to_vec().unwrap();
        assert!((value[0] - alpha.sqrt()).abs() < 1e-6);
    }
}

//! Euler schedulers for diffusion models
//!
//! Implements the simple Euler method for ODE-based sampling and its
//! ancestral variant, which re-injects noise after each step.
//!
//! Uses the k-diffusion formulation: latents live at scale sigma and the
//! model input is pre-conditioned by `1 / sqrt(sigma² + 1)`.

use burn::prelude::*;

use crate::error::Result;
use crate::options::{SchedulerKind, SchedulerOptions};
use crate::scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, SigmaTables, get_ancestral_step,
    scale_by_sigma, sigma_predicted_sample,
};

/// Euler scheduler
///
/// Uses the Euler method to solve the diffusion ODE.
#[derive(Debug, Clone)]
pub struct EulerScheduler<B: Backend> {
    tables: SigmaTables,
    prediction_type: PredictionType,
    step_index: Option<usize>,
    noise: NoiseGenerator,
    device: B::Device,
}

impl<B: Backend> EulerScheduler<B> {
    /// Create a new Euler scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        let schedule = NoiseSchedule::from_options(options);

        Self {
            tables: SigmaTables::from_options(options, &schedule),
            prediction_type: options.prediction_type,
            step_index: None,
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// Get the sigma values (trailing zero included)
    pub fn sigmas(&self) -> &[f32] {
        &self.tables.sigmas
    }
}

impl<B: Backend> Scheduler<B> for EulerScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Euler
    }

    fn timesteps(&self) -> &[usize] {
        &self.tables.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.tables.init_noise_sigma
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4> {
        self.noise.sample(shape, sigma, &self.device)
    }

    fn scale_input(&self, latents: Tensor<B, 4>, timestep: usize) -> Result<Tensor<B, 4>> {
        let index = self.tables.resolve_index(self.step_index, timestep)?;
        Ok(scale_by_sigma(latents, self.tables.sigmas[index]))
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let index = self.tables.resolve_index(self.step_index, timestep)?;
        let sigma = self.tables.sigmas[index];
        let sigma_next = self.tables.sigmas[index + 1];

        // Euler step: x_next = x + (sigma_next - sigma) * dx/dsigma
        // where dx/dsigma = (x - denoised) / sigma
        let denoised =
            sigma_predicted_sample(model_output, latents.clone(), sigma, self.prediction_type);
        let derivative = (latents.clone() - denoised) / sigma;

        self.step_index = Some(index + 1);
        Ok(latents + derivative * (sigma_next - sigma))
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>> {
        add_sigma_noise(&self.tables, original, noise, timesteps)
    }
}

/// Euler Ancestral scheduler
///
/// Splits each step into a deterministic move to `sigma_down` and fresh
/// noise at `sigma_up`, drawn from the scheduler's seeded generator.
#[derive(Debug, Clone)]
pub struct EulerAncestralScheduler<B: Backend> {
    tables: SigmaTables,
    prediction_type: PredictionType,
    step_index: Option<usize>,
    noise: NoiseGenerator,
    device: B::Device,
}

impl<B: Backend> EulerAncestralScheduler<B> {
    /// Create a new Euler Ancestral scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        let schedule = NoiseSchedule::from_options(options);

        Self {
            tables: SigmaTables::from_options(options, &schedule),
            prediction_type: options.prediction_type,
            step_index: None,
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// Get the sigma values (trailing zero included)
    pub fn sigmas(&self) -> &[f32] {
        &self.tables.sigmas
    }
}

impl<B: Backend> Scheduler<B> for EulerAncestralScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::EulerAncestral
    }

    fn timesteps(&self) -> &[usize] {
        &self.tables.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.tables.init_noise_sigma
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4> {
        self.noise.sample(shape, sigma, &self.device)
    }

    fn scale_input(&self, latents: Tensor<B, 4>, timestep: usize) -> Result<Tensor<B, 4>> {
        let index = self.tables.resolve_index(self.step_index, timestep)?;
        Ok(scale_by_sigma(latents, self.tables.sigmas[index]))
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let index = self.tables.resolve_index(self.step_index, timestep)?;
        let sigma = self.tables.sigmas[index];
        let sigma_next = self.tables.sigmas[index + 1];

        let denoised =
            sigma_predicted_sample(model_output, latents.clone(), sigma, self.prediction_type);
        let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, 1.0);
        let derivative = (latents.clone() - denoised) / sigma;

        // Drawn on every step so the noise stream does not depend on where the run ends
        let noise = self.noise.sample(latents.dims(), sigma_up, &self.device);

        self.step_index = Some(index + 1);
        Ok(latents + derivative * (sigma_down - sigma) + noise)
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>> {
        add_sigma_noise(&self.tables, original, noise, timesteps)
    }
}

/// `original + noise * sigma(timesteps[0])` for sigma-parameterized schedulers
pub(crate) fn add_sigma_noise<B: Backend>(
    tables: &SigmaTables,
    original: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    timesteps: &[usize],
) -> Result<Tensor<B, 4>> {
    let Some(&first) = timesteps.first() else {
        return Ok(original);
    };
    let index = crate::scheduler::index_for_timestep(&tables.timesteps, first)?;
    Ok(original + noise * tables.sigmas[index])
}

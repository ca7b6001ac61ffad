//! LMS (Linear Multi-Step) scheduler
//!
//! Uses a history of derivatives for higher-order integration. Each
//! coefficient is the integral of a Lagrange basis polynomial over the
//! current sigma interval.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::error::Result;
use crate::euler::add_sigma_noise;
use crate::options::{SchedulerKind, SchedulerOptions};
use crate::scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, SigmaTables, integrate_simpson,
    scale_by_sigma, sigma_predicted_sample,
};

/// Maximum number of derivatives kept in the history
pub const LMS_ORDER: usize = 4;

/// LMS scheduler
#[derive(Debug, Clone)]
pub struct LmsScheduler<B: Backend> {
    tables: SigmaTables,
    prediction_type: PredictionType,
    step_index: Option<usize>,
    /// Derivative history, oldest first
    derivatives: VecDeque<Tensor<B, 4>>,
    noise: NoiseGenerator,
    device: B::Device,
}

impl<B: Backend> LmsScheduler<B> {
    /// Create a new LMS scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        let schedule = NoiseSchedule::from_options(options);

        Self {
            tables: SigmaTables::from_options(options, &schedule),
            prediction_type: options.prediction_type,
            step_index: None,
            derivatives: VecDeque::with_capacity(LMS_ORDER + 1),
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// Get the sigma values (trailing zero included)
    pub fn sigmas(&self) -> &[f32] {
        &self.tables.sigmas
    }

    /// Integrated Lagrange basis for `current` among the last `order` sigmas
    pub fn lms_coefficient(&self, order: usize, index: usize, current: usize) -> f32 {
        let sigmas = &self.tables.sigmas;
        let basis = |tau: f64| {
            (0..order)
                .filter(|&k| k != current)
                .map(|k| {
                    let s_k = sigmas[index - k] as f64;
                    (tau - s_k) / (sigmas[index - current] as f64 - s_k)
                })
                .product::<f64>()
        };

        integrate_simpson(
            basis,
            sigmas[index] as f64,
            sigmas[index + 1] as f64,
            1e-4,
        ) as f32
    }
}

impl<B: Backend> Scheduler<B> for LmsScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Lms
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

        let denoised =
            sigma_predicted_sample(model_output, latents.clone(), sigma, self.prediction_type);
        let derivative = (latents.clone() - denoised) / sigma;

        self.derivatives.push_back(derivative);
        if self.derivatives.len() > LMS_ORDER {
            self.derivatives.pop_front();
        }

        // Lower order until enough history exists
        let order = (index + 1).min(LMS_ORDER).min(self.derivatives.len());

        let mut prev_sample = latents;
        for (current, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
            let coeff = self.lms_coefficient(order, index, current);
            prev_sample = prev_sample + derivative.clone() * coeff;
        }

        self.step_index = Some(index + 1);
        Ok(prev_sample)
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

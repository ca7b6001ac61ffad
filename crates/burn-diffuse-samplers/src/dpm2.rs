//! KDPM2 scheduler
//!
//! DPM-Solver-2 in the Karras formulation. Every inference step after the
//! first is split into two passes: a first-order move to the log-midpoint
//! sigma, then a second-order correction evaluated at that midpoint. The
//! timestep list interleaves the midpoint timesteps, so a run of `n`
//! inference steps visits `2n - 1` timesteps.

use burn::prelude::*;

use crate::error::Result;
use crate::options::{SchedulerKind, SchedulerOptions};
use crate::scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, SigmaTables, index_for_timestep,
    scale_by_sigma, separate_timesteps, sigma_predicted_sample, sigma_to_timestep,
};

/// KDPM2 scheduler
#[derive(Debug, Clone)]
pub struct Kdpm2Scheduler<B: Backend> {
    /// Interleaved timesteps (first-order, midpoint, first-order, ...)
    timesteps: Vec<usize>,
    /// Interleaved sigmas, aligned with `timesteps`
    sigmas: Vec<f32>,
    /// Interleaved log-midpoint sigmas
    sigmas_interpol: Vec<f32>,
    init_noise_sigma: f32,
    prediction_type: PredictionType,
    step_index: Option<usize>,
    /// Sample saved by the first-order pass
    sample: Option<Tensor<B, 4>>,
    noise: NoiseGenerator,
    device: B::Device,
}

/// `[x0, x1, x1, x2, x2, ..., xn, xn, xn]`
fn interleave(values: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(values.len() * 2 + 1);
    if let (Some(&first), Some(&last)) = (values.first(), values.last()) {
        out.push(first);
        for &v in &values[1..] {
            out.push(v);
            out.push(v);
        }
        out.push(last);
    }
    out
}

impl<B: Backend> Kdpm2Scheduler<B> {
    /// Create a new KDPM2 scheduler
    pub fn new(options: &SchedulerOptions, device: &B::Device) -> Self {
        let schedule = NoiseSchedule::from_options(options);
        let base = SigmaTables::from_options(options, &schedule);
        let log_sigmas: Vec<f32> = schedule.sigmas().iter().map(|s| s.ln()).collect();

        // base.sigmas already ends with 0
        let sigmas = &base.sigmas;
        let interpol: Vec<f32> = (0..sigmas.len())
            .map(|i| match i {
                0 => 0.0,
                _ => (sigmas[i] * sigmas[i - 1]).sqrt(),
            })
            .collect();

        let mut timesteps = Vec::with_capacity(base.timesteps.len() * 2);
        if let Some(&first) = base.timesteps.first() {
            timesteps.push(first);
        }
        for i in 1..base.timesteps.len() {
            let midpoint = sigma_to_timestep(interpol[i], &log_sigmas).round() as usize;
            timesteps.push(midpoint);
            timesteps.push(base.timesteps[i]);
        }
        // Midpoints round onto their neighbours when steps are dense
        separate_timesteps(&mut timesteps);

        Self {
            timesteps,
            sigmas: interleave(sigmas),
            sigmas_interpol: interleave(&interpol),
            init_noise_sigma: base.init_noise_sigma,
            prediction_type: options.prediction_type,
            step_index: None,
            sample: None,
            noise: NoiseGenerator::new(options.seed),
            device: device.clone(),
        }
    }

    /// True when the next call is a first-order pass
    pub fn is_first_order(&self) -> bool {
        self.sample.is_none()
    }

    fn resolve_index(&self, timestep: usize) -> Result<usize> {
        match self.step_index {
            Some(i) => Ok(i),
            None => index_for_timestep(&self.timesteps, timestep),
        }
    }
}

impl<B: Backend> Scheduler<B> for Kdpm2Scheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Kdpm2
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    fn order(&self) -> usize {
        2
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4> {
        self.noise.sample(shape, sigma, &self.device)
    }

    fn scale_input(&self, latents: Tensor<B, 4>, timestep: usize) -> Result<Tensor<B, 4>> {
        let index = self.resolve_index(timestep)?;
        let sigma = if self.is_first_order() {
            self.sigmas[index]
        } else {
            self.sigmas_interpol[index]
        };
        Ok(scale_by_sigma(latents, sigma))
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let index = self.resolve_index(timestep)?;
        let first_order = self.is_first_order();

        let (sigma, sigma_interpol, sigma_next) = if first_order {
            (
                self.sigmas[index],
                self.sigmas_interpol[index + 1],
                self.sigmas[index + 1],
            )
        } else {
            (
                self.sigmas[index - 1],
                self.sigmas_interpol[index],
                self.sigmas[index],
            )
        };

        // gamma = 0, so sigma_hat == sigma
        let sigma_input = if first_order { sigma } else { sigma_interpol };
        let denoised = sigma_predicted_sample(
            model_output,
            latents.clone(),
            sigma_input,
            self.prediction_type,
        );
        let derivative = (latents.clone() - denoised) / sigma_input;

        let next = match self.sample.take() {
            None => {
                self.sample = Some(latents.clone());
                latents + derivative * (sigma_interpol - sigma)
            }
            Some(saved) => saved + derivative * (sigma_next - sigma),
        };

        self.step_index = Some(index + 1);
        Ok(next)
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>> {
        let Some(&first) = timesteps.first() else {
            return Ok(original);
        };
        let index = index_for_timestep(&self.timesteps, first)?;
        Ok(original + noise * self.sigmas[index])
    }
}

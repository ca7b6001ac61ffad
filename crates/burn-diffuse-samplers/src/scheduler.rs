//! Noise schedules for diffusion models
//!
//! This module provides the schedule tables, timestep spacing, sigma
//! conversions and the seeded noise source shared across all schedulers,
//! plus the [`Scheduler`] trait every integrator implements.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::options::{BetaSchedule, SchedulerKind, SchedulerOptions, TimestepSpacing};

// ============================================================================
// Scheduler Trait
// ============================================================================

/// Stateful numerical integrator over a fixed timestep schedule
///
/// Implementations own their timestep and sigma/alpha tables, which are
/// computed once at construction. `step` mutates the running state
/// (step index, derivative history) and must be called in timestep order.
pub trait Scheduler<B: Backend> {
    /// Which integrator this is
    fn kind(&self) -> SchedulerKind;

    /// Timesteps to visit, highest noise first
    fn timesteps(&self) -> &[usize];

    /// Standard deviation of the initial noise distribution
    fn init_noise_sigma(&self) -> f32;

    /// Number of `step` calls made per inference step
    fn order(&self) -> usize {
        1
    }

    /// Draw a standard normal tensor from the scheduler's seeded RNG, times `sigma`
    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4>;

    /// Pre-condition the model input for the given timestep
    fn scale_input(&self, latents: Tensor<B, 4>, timestep: usize) -> Result<Tensor<B, 4>>;

    /// Advance `latents` by one integrator step using the model prediction
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>>;

    /// Forward-diffuse `original` to the noise level of `timesteps[0]`
    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>>;
}

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
///
/// Different diffusion models are trained to predict different quantities:
/// - Epsilon (noise): SD 1.x, SDXL
/// - V-prediction (velocity): SD 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    VPrediction,
    /// Model predicts the original sample x0
    Sample,
}

/// Predicted x0 for sigma-parameterized schedulers (k-diffusion form)
pub fn sigma_predicted_sample<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    sigma: f32,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => sample - model_output * sigma,
        PredictionType::VPrediction => {
            let c = sigma * sigma + 1.0;
            model_output * (-sigma / c.sqrt()) + sample / c
        }
        PredictionType::Sample => model_output,
    }
}

/// Predicted x0 and epsilon for alpha-parameterized schedulers
///
/// Returns `(x0, epsilon)` given `alpha_prod_t` = ᾱₜ.
pub fn alpha_predicted_sample<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_prod_t: f32,
    prediction_type: PredictionType,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let sqrt_alpha = alpha_prod_t.sqrt();
    let sqrt_beta = (1.0 - alpha_prod_t).sqrt();

    match prediction_type {
        PredictionType::Epsilon => {
            let x0 = (sample - model_output.clone() * sqrt_beta) / sqrt_alpha;
            (x0, model_output)
        }
        PredictionType::VPrediction => {
            let x0 = sample.clone() * sqrt_alpha - model_output.clone() * sqrt_beta;
            let eps = model_output * sqrt_alpha + sample * sqrt_beta;
            (x0, eps)
        }
        PredictionType::Sample => {
            let eps = (sample - model_output.clone() * sqrt_alpha) / sqrt_beta.max(1e-8);
            (model_output, eps)
        }
    }
}

// ============================================================================
// Noise Schedule
// ============================================================================

/// Precomputed training noise schedule
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    /// Per-timestep betas
    pub betas: Vec<f32>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f32>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl NoiseSchedule {
    /// Build a schedule from explicit betas
    pub fn from_betas(betas: Vec<f32>) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0f64;
        for beta in &betas {
            cumprod *= 1.0 - *beta as f64;
            alphas_cumprod.push(cumprod as f32);
        }

        Self {
            num_train_steps: betas.len(),
            betas,
            alphas_cumprod,
        }
    }

    /// Betas evenly spaced between `beta_start` and `beta_end`
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas = linspace(beta_start, beta_end, num_steps)
            .into_iter()
            .map(|b| b as f32)
            .collect();
        Self::from_betas(betas)
    }

    /// Square roots evenly spaced, then squared (used by SD 1.x and 2.x)
    pub fn scaled_linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas = linspace(beta_start.sqrt(), beta_end.sqrt(), num_steps)
            .into_iter()
            .map(|b| (b * b) as f32)
            .collect();
        Self::from_betas(betas)
    }

    /// Glide cosine schedule expressed as an alpha-bar function
    pub fn squared_cos_cap_v2(num_steps: usize, max_beta: f64) -> Self {
        Self::from_alpha_bar(num_steps, max_beta, |t| {
            ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2)
        })
    }

    /// Exponential alpha-bar schedule
    pub fn exponential(num_steps: usize, max_beta: f64) -> Self {
        Self::from_alpha_bar(num_steps, max_beta, |t| (t * -12.0).exp())
    }

    fn from_alpha_bar(num_steps: usize, max_beta: f64, alpha_bar: impl Fn(f64) -> f64) -> Self {
        let betas = (0..num_steps)
            .map(|i| {
                let t1 = i as f64 / num_steps as f64;
                let t2 = (i + 1) as f64 / num_steps as f64;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta) as f32
            })
            .collect();
        Self::from_betas(betas)
    }

    /// Create the schedule described by the scheduler options
    pub fn from_options(options: &SchedulerOptions) -> Self {
        let n = options.train_timesteps;
        let start = options.beta_start as f64;
        let end = options.beta_end as f64;
        let max_beta = options.maximum_beta as f64;

        if let Some(betas) = &options.trained_betas {
            return Self::from_betas(betas.clone());
        }

        match options.beta_schedule {
            BetaSchedule::Linear => Self::linear(n, start, end),
            BetaSchedule::ScaledLinear => Self::scaled_linear(n, start, end),
            BetaSchedule::SquaredCosCapV2 => Self::squared_cos_cap_v2(n, max_beta),
            BetaSchedule::Exponential => Self::exponential(n, max_beta),
        }
    }

    /// Create the default SD 1.x schedule
    pub fn sd1x() -> Self {
        Self::scaled_linear(1000, 0.00085, 0.012)
    }

    /// Get alpha_cumprod at a specific timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> Result<f32> {
        self.alphas_cumprod
            .get(t)
            .copied()
            .ok_or(SchedulerError::UnknownTimestep(t))
    }

    /// Sigma for every training timestep: sqrt((1 - ᾱ) / ᾱ)
    pub fn sigmas(&self) -> Vec<f32> {
        self.alphas_cumprod
            .iter()
            .map(|&alpha| ((1.0 - alpha) / alpha).sqrt())
            .collect()
    }
}

/// `n` evenly spaced values over `[start, end]`
pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

// ============================================================================
// Timesteps
// ============================================================================

/// Generate the descending timestep sequence for inference
pub fn inference_timesteps(
    num_inference_steps: usize,
    num_train_steps: usize,
    spacing: TimestepSpacing,
    steps_offset: usize,
) -> Vec<usize> {
    if num_inference_steps == 0 || num_train_steps == 0 {
        return Vec::new();
    }
    let last = num_train_steps - 1;

    match spacing {
        TimestepSpacing::Linspace => linspace(0.0, last as f64, num_inference_steps)
            .into_iter()
            .rev()
            .map(|t| t.round() as usize)
            .collect(),
        TimestepSpacing::Leading => {
            let step_ratio = num_train_steps / num_inference_steps;
            (0..num_inference_steps)
                .rev()
                .map(|i| (i * step_ratio + steps_offset).min(last))
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = num_train_steps as f64 / num_inference_steps as f64;
            (0..num_inference_steps)
                .map(|i| {
                    let t = (num_train_steps as f64 - i as f64 * step_ratio).round() as usize;
                    t.saturating_sub(1)
                })
                .collect()
        }
    }
}

/// Raise colliding timesteps so the list strictly decreases
///
/// Rounding remapped sigmas to integer timesteps repeats values near the
/// noise floor. Walking up from the last entry, each timestep is kept at
/// least one above its successor. Sigmas are left as computed.
pub fn separate_timesteps(timesteps: &mut [usize]) {
    for i in (0..timesteps.len().saturating_sub(1)).rev() {
        timesteps[i] = timesteps[i].max(timesteps[i + 1] + 1);
    }
}

/// Reject a schedule that repeats a timestep or leaves the training range
pub fn check_timesteps(timesteps: &[usize], train_timesteps: usize) -> Result<()> {
    if let Some(pair) = timesteps.windows(2).find(|w| w[0] <= w[1]) {
        return Err(SchedulerError::InvalidOptions(format!(
            "timesteps must strictly decrease, found {} before {}",
            pair[0], pair[1]
        )));
    }
    if let Some(&first) = timesteps.first() {
        if first >= train_timesteps {
            return Err(SchedulerError::InvalidOptions(format!(
                "{} distinct timesteps do not fit in {} training steps",
                timesteps.len(),
                train_timesteps
            )));
        }
    }
    Ok(())
}

/// Timesteps from the override list, or computed from the spacing policy
pub fn timesteps_from_options(options: &SchedulerOptions) -> Vec<usize> {
    match &options.timesteps {
        Some(timesteps) => timesteps.clone(),
        None => inference_timesteps(
            options.inference_steps,
            options.train_timesteps,
            options.timestep_spacing,
            options.steps_offset,
        ),
    }
}

/// Position of `timestep` in the schedule
pub fn index_for_timestep(timesteps: &[usize], timestep: usize) -> Result<usize> {
    timesteps
        .iter()
        .position(|&t| t == timestep)
        .ok_or(SchedulerError::UnknownTimestep(timestep))
}

// ============================================================================
// Sigma Utilities (shared across samplers)
// ============================================================================

/// Apply Karras noise schedule transformation
///
/// Transforms sigmas using the Karras et al. schedule for improved sampling.
/// Uses rho=7.0 as recommended in the paper.
pub fn apply_karras_schedule(sigmas: &[f32], rho: f32) -> Vec<f32> {
    if sigmas.is_empty() {
        return Vec::new();
    }

    let sigma_min = *sigmas.last().unwrap_or(&0.0);
    let sigma_max = *sigmas.first().unwrap_or(&1.0);
    let n = sigmas.len();
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);

    (0..n)
        .map(|i| {
            let t = i as f32 / (n - 1).max(1) as f32;
            (max_inv_rho + t * (min_inv_rho - max_inv_rho)).powf(rho)
        })
        .collect()
}

/// Map a sigma back to a (fractional) training timestep
///
/// Interpolates linearly in log-sigma space between the two neighbouring
/// training sigmas. `log_sigmas` must be ascending.
pub fn sigma_to_timestep(sigma: f32, log_sigmas: &[f32]) -> f32 {
    if log_sigmas.len() < 2 {
        return 0.0;
    }
    let log_sigma = sigma.max(1e-10).ln();
    let low_idx = log_sigmas
        .iter()
        .rposition(|&l| log_sigma - l >= 0.0)
        .unwrap_or(0)
        .min(log_sigmas.len() - 2);
    let high_idx = low_idx + 1;

    let low = log_sigmas[low_idx];
    let high = log_sigmas[high_idx];
    let w = ((low - log_sigma) / (low - high)).clamp(0.0, 1.0);

    (1.0 - w) * low_idx as f32 + w * high_idx as f32
}

/// Initial noise sigma for a sigma schedule
///
/// Spacings that start exactly at the last training step use the raw
/// maximum; others are offset by one unit of variance.
pub fn init_noise_sigma(sigmas: &[f32], spacing: TimestepSpacing) -> f32 {
    let max = sigmas.iter().copied().fold(0.0f32, f32::max);
    match spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => max,
        TimestepSpacing::Leading => (max * max + 1.0).sqrt(),
    }
}

/// Compute ancestral sampling step parameters
///
/// Returns `(sigma_down, sigma_up)`: the deterministic step target and the
/// noise injection level. `eta` controls stochasticity (0 = ODE, 1 = SDE).
pub fn get_ancestral_step(sigma: f32, sigma_next: f32, eta: f32) -> (f32, f32) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }

    let sigma_up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
        .sqrt()
        .min(sigma_next)
        * eta;
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).sqrt();

    (sigma_down, sigma_up)
}

/// Timestep and sigma tables for the k-diffusion style schedulers
///
/// `sigmas` has one more entry than `timesteps`: a trailing zero for the
/// final denoising step.
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaTables {
    pub timesteps: Vec<usize>,
    pub sigmas: Vec<f32>,
    pub init_noise_sigma: f32,
}

impl SigmaTables {
    /// Build tables from options, applying the Karras remap if requested
    pub fn from_options(options: &SchedulerOptions, schedule: &NoiseSchedule) -> Self {
        let train_sigmas = schedule.sigmas();
        let mut timesteps = timesteps_from_options(options);
        let mut sigmas: Vec<f32> = timesteps
            .iter()
            .map(|&t| train_sigmas[t.min(train_sigmas.len() - 1)])
            .collect();

        if options.use_karras_sigmas {
            let log_sigmas: Vec<f32> = train_sigmas.iter().map(|s| s.ln()).collect();
            sigmas = apply_karras_schedule(&sigmas, 7.0);
            timesteps = sigmas
                .iter()
                .map(|&s| sigma_to_timestep(s, &log_sigmas).round() as usize)
                .collect();
            separate_timesteps(&mut timesteps);
        }

        let init_noise_sigma = init_noise_sigma(&sigmas, options.timestep_spacing);
        sigmas.push(0.0);

        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        }
    }

    /// Resolve the table index for a timestep, preferring the running index
    pub fn resolve_index(&self, step_index: Option<usize>, timestep: usize) -> Result<usize> {
        match step_index {
            Some(i) if self.timesteps.get(i) == Some(&timestep) => Ok(i),
            _ => index_for_timestep(&self.timesteps, timestep),
        }
    }
}

/// Divide by sqrt(sigma² + 1)
pub fn scale_by_sigma<B: Backend>(latents: Tensor<B, 4>, sigma: f32) -> Tensor<B, 4> {
    latents / (sigma * sigma + 1.0).sqrt()
}

// ============================================================================
// Seeded Noise
// ============================================================================

/// Deterministic standard-normal source
///
/// Uses a Box-Muller transform over a seeded `StdRng`, so identical seeds
/// reproduce identical tensors independent of the tensor backend.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: StdRng,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next standard normal value
    pub fn next_gaussian(&mut self) -> f32 {
        // u1 in (0, 1] keeps ln finite
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        ((-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()) as f32
    }

    /// Normal tensor of `shape`, scaled by `sigma`
    pub fn sample<B: Backend>(
        &mut self,
        shape: [usize; 4],
        sigma: f32,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let len = shape.iter().product();
        let values: Vec<f32> = (0..len).map(|_| self.next_gaussian() * sigma).collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }
}

// ============================================================================
// Numerical Integration
// ============================================================================

/// Adaptive Simpson quadrature of `f` over `[a, b]`
///
/// Integration runs in either direction; `b < a` yields the negated integral.
pub fn integrate_simpson(f: impl Fn(f64) -> f64, a: f64, b: f64, epsilon: f64) -> f64 {
    let fa = f(a);
    let fb = f(b);
    let m = (a + b) / 2.0;
    let fm = f(m);
    let whole = (b - a) / 6.0 * (fa + 4.0 * fm + fb);
    simpson_step(&f, a, b, fa, fm, fb, whole, epsilon, 50)
}

#[allow(clippy::too_many_arguments)]
fn simpson_step(
    f: &impl Fn(f64) -> f64,
    a: f64,
    b: f64,
    fa: f64,
    fm: f64,
    fb: f64,
    whole: f64,
    epsilon: f64,
    depth: usize,
) -> f64 {
    let m = (a + b) / 2.0;
    let lm = (a + m) / 2.0;
    let rm = (m + b) / 2.0;
    let flm = f(lm);
    let frm = f(rm);
    let left = (m - a) / 6.0 * (fa + 4.0 * flm + fm);
    let right = (b - m) / 6.0 * (fm + 4.0 * frm + fb);
    let delta = left + right - whole;

    if depth == 0 || delta.abs() <= 15.0 * epsilon {
        return left + right + delta / 15.0;
    }

    simpson_step(f, a, m, fa, flm, fm, left, epsilon / 2.0, depth - 1)
        + simpson_step(f, m, b, fm, frm, fb, right, epsilon / 2.0, depth - 1)
}

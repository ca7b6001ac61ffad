//! Per-run scheduler configuration
//!
//! [`SchedulerOptions`] is created once per generation request and is
//! read-only for the duration of the run. It deserializes from JSON with
//! every field optional, falling back to the SD 1.x defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::PredictionType;

/// Integrator used to advance latents between timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// First-order Euler over the sigma schedule
    #[default]
    Euler,
    /// Euler with ancestral noise injection
    EulerAncestral,
    /// Denoising diffusion implicit models
    Ddim,
    /// Denoising diffusion probabilistic models
    Ddpm,
    /// Linear multistep (order 4)
    Lms,
    /// Karras DPM-Solver-2 with interleaved midpoint passes
    Kdpm2,
}

impl SchedulerKind {
    /// Every scheduler kind, in declaration order
    pub const ALL: [SchedulerKind; 6] = [
        SchedulerKind::Euler,
        SchedulerKind::EulerAncestral,
        SchedulerKind::Ddim,
        SchedulerKind::Ddpm,
        SchedulerKind::Lms,
        SchedulerKind::Kdpm2,
    ];

    /// Short name used in option files and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Euler => "euler",
            SchedulerKind::EulerAncestral => "euler_ancestral",
            SchedulerKind::Ddim => "ddim",
            SchedulerKind::Ddpm => "ddpm",
            SchedulerKind::Lms => "lms",
            SchedulerKind::Kdpm2 => "kdpm2",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "euler" => Ok(SchedulerKind::Euler),
            "euler_ancestral" | "euler_a" => Ok(SchedulerKind::EulerAncestral),
            "ddim" => Ok(SchedulerKind::Ddim),
            "ddpm" => Ok(SchedulerKind::Ddpm),
            "lms" => Ok(SchedulerKind::Lms),
            "kdpm2" | "dpm2" => Ok(SchedulerKind::Kdpm2),
            _ => Err(SchedulerError::UnknownKind(s.to_string())),
        }
    }
}

/// Shape of the beta schedule used during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas evenly spaced between start and end
    Linear,
    /// Square roots evenly spaced, then squared (SD 1.x / 2.x)
    #[default]
    ScaledLinear,
    /// Glide cosine alpha-bar
    SquaredCosCapV2,
    /// Exponential alpha-bar
    Exponential,
}

/// How inference timesteps are spread over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly spaced over `[0, T-1]`, endpoints included
    #[default]
    Linspace,
    /// Multiples of `T / n` starting at zero, shifted by the steps offset
    Leading,
    /// Multiples of `T / n` counted down from `T - 1`
    Trailing,
}

/// DDPM posterior variance policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    /// Posterior variance `beta_prev / beta_t * (1 - alpha_t)`
    #[default]
    FixedSmall,
    /// Posterior variance evaluated in log space
    FixedSmallLog,
    /// Beta of the current step
    FixedLarge,
    /// Beta of the current step evaluated in log space
    FixedLargeLog,
}

/// Scheduler configuration for a single generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Integrator to use
    pub scheduler: SchedulerKind,
    /// Output width in pixels
    pub width: usize,
    /// Output height in pixels
    pub height: usize,
    /// Number of inference steps
    pub inference_steps: usize,
    /// Classifier-free guidance scale; guidance runs only above 1.0
    pub guidance_scale: f32,
    /// Fraction of the schedule traversed for image-conditioned runs
    pub strength: f32,
    /// Seed for every random tensor drawn during the run
    pub seed: u64,
    /// Number of training timesteps
    pub train_timesteps: usize,
    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: BetaSchedule,
    /// Explicit betas; overrides `beta_schedule` when present
    pub trained_betas: Option<Vec<f32>>,
    /// Upper bound for alpha-bar derived betas
    pub maximum_beta: f32,
    pub timestep_spacing: TimestepSpacing,
    pub steps_offset: usize,
    /// Remap sigmas with the Karras et al. schedule (rho = 7)
    pub use_karras_sigmas: bool,
    pub prediction_type: PredictionType,
    pub variance_type: VarianceType,
    pub clip_sample: bool,
    pub clip_sample_range: f32,
    /// DDIM stochasticity (0 = deterministic)
    pub eta: f32,
    /// Extra noise mixed into encoded image latents before forward diffusion
    pub initial_noise_level: f32,
    /// Degradation level for the upscale diffuser
    pub noise_level: usize,
    /// ControlNet residual multiplier
    pub conditioning_scale: f32,
    /// Explicit timesteps; replaces the computed schedule
    pub timesteps: Option<Vec<usize>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Euler,
            width: 512,
            height: 512,
            inference_steps: 30,
            guidance_scale: 7.5,
            strength: 0.6,
            seed: 0,
            train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            trained_betas: None,
            maximum_beta: 0.999,
            timestep_spacing: TimestepSpacing::Linspace,
            steps_offset: 0,
            use_karras_sigmas: false,
            prediction_type: PredictionType::Epsilon,
            variance_type: VarianceType::FixedSmall,
            clip_sample: false,
            clip_sample_range: 1.0,
            eta: 0.0,
            initial_noise_level: 0.0,
            noise_level: 20,
            conditioning_scale: 1.0,
            timesteps: None,
        }
    }
}

impl SchedulerOptions {
    /// Options for the given scheduler with every other field defaulted
    pub fn with_scheduler(scheduler: SchedulerKind) -> Self {
        Self {
            scheduler,
            ..Default::default()
        }
    }

    /// Reject option combinations no scheduler can run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SchedulerError::InvalidOptions(msg));

        if self.train_timesteps < 2 {
            return invalid(format!(
                "train_timesteps must be at least 2, got {}",
                self.train_timesteps
            ));
        }
        if self.inference_steps == 0 {
            return invalid("inference_steps must be at least 1".into());
        }
        if self.inference_steps > self.train_timesteps {
            return invalid(format!(
                "inference_steps ({}) exceeds train_timesteps ({})",
                self.inference_steps, self.train_timesteps
            ));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return invalid(format!("strength must be in [0, 1], got {}", self.strength));
        }
        if self.width == 0 || self.height == 0 || self.width % 8 != 0 || self.height % 8 != 0 {
            return invalid(format!(
                "width and height must be non-zero multiples of 8, got {}x{}",
                self.width, self.height
            ));
        }
        if self.timesteps.is_none() && self.timestep_spacing == TimestepSpacing::Leading {
            let step_ratio = self.train_timesteps / self.inference_steps;
            let highest = (self.inference_steps - 1) * step_ratio + self.steps_offset;
            if highest >= self.train_timesteps {
                return invalid(format!(
                    "leading spacing with steps_offset {} reaches timestep {}, outside {} training steps",
                    self.steps_offset, highest, self.train_timesteps
                ));
            }
        }
        if self.noise_level >= self.train_timesteps {
            return invalid(format!(
                "noise_level ({}) must be below train_timesteps ({})",
                self.noise_level, self.train_timesteps
            ));
        }
        if let Some(betas) = &self.trained_betas {
            if betas.len() != self.train_timesteps {
                return invalid(format!(
                    "trained_betas has {} entries, expected {}",
                    betas.len(),
                    self.train_timesteps
                ));
            }
        }
        if let Some(timesteps) = &self.timesteps {
            if timesteps.is_empty() {
                return invalid("timestep override list is empty".into());
            }
            if timesteps.windows(2).any(|w| w[0] <= w[1]) {
                return invalid("timestep override list must be strictly decreasing".into());
            }
            if timesteps[0] >= self.train_timesteps {
                return invalid(format!(
                    "timestep {} is outside the training range",
                    timesteps[0]
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_kind_parse() {
        assert_eq!("euler".parse::<SchedulerKind>(), Ok(SchedulerKind::Euler));
        assert_eq!(
            "Euler-Ancestral".parse::<SchedulerKind>(),
            Ok(SchedulerKind::EulerAncestral)
        );
        assert_eq!("KDPM2".parse::<SchedulerKind>(), Ok(SchedulerKind::Kdpm2));
        assert_eq!(
            "heun".parse::<SchedulerKind>(),
            Err(SchedulerError::UnknownKind("heun".into()))
        );
    }

    #[test]
    fn test_scheduler_kind_name_round_trips() {
        for kind in SchedulerKind::ALL {
            assert_eq!(kind.name().parse::<SchedulerKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_default_options_are_valid() {
        assert!(SchedulerOptions::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let zero_steps = SchedulerOptions {
            inference_steps: 0,
            ..Default::default()
        };
        assert!(zero_steps.validate().is_err());

        let strength = SchedulerOptions {
            strength: 1.5,
            ..Default::default()
        };
        assert!(strength.validate().is_err());

        let odd_size = SchedulerOptions {
            width: 500,
            ..Default::default()
        };
        assert!(odd_size.validate().is_err());

        let increasing = SchedulerOptions {
            timesteps: Some(vec![10, 500]),
            ..Default::default()
        };
        assert!(increasing.validate().is_err());

        let leading_overflow = SchedulerOptions {
            inference_steps: 1000,
            timestep_spacing: TimestepSpacing::Leading,
            steps_offset: 1,
            ..Default::default()
        };
        assert!(leading_overflow.validate().is_err());
        let leading_fits = SchedulerOptions {
            steps_offset: 0,
            ..leading_overflow
        };
        assert!(leading_fits.validate().is_ok());
    }

    #[test]
    fn test_options_deserialize_partial_json() {
        let json = r#"{"scheduler": "lms", "inference_steps": 12, "seed": 42}"#;
        let options: SchedulerOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.scheduler, SchedulerKind::Lms);
        assert_eq!(options.inference_steps, 12);
        assert_eq!(options.seed, 42);
        assert_eq!(options.train_timesteps, 1000);
        assert_eq!(options.beta_schedule, BetaSchedule::ScaledLinear);
    }
}

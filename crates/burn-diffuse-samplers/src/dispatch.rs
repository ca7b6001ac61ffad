//! Scheduler selection
//!
//! [`AnyScheduler`] is the closed set of integrators a run can use. Each
//! variant owns only its precomputed tables; calls forward through a single
//! `match` to the concrete scheduler.

use burn::prelude::*;
use tracing::debug;

use crate::ddim::DdimScheduler;
use crate::ddpm::DdpmScheduler;
use crate::dpm2::Kdpm2Scheduler;
use crate::error::Result;
use crate::euler::{EulerAncestralScheduler, EulerScheduler};
use crate::lms::LmsScheduler;
use crate::options::{SchedulerKind, SchedulerOptions};
use crate::scheduler::{Scheduler, check_timesteps};

/// Any of the supported schedulers
#[derive(Debug, Clone)]
pub enum AnyScheduler<B: Backend> {
    Euler(EulerScheduler<B>),
    EulerAncestral(EulerAncestralScheduler<B>),
    Ddim(DdimScheduler<B>),
    Ddpm(DdpmScheduler<B>),
    Lms(LmsScheduler<B>),
    Kdpm2(Kdpm2Scheduler<B>),
}

/// Validate options and build the scheduler they select
pub fn create_scheduler<B: Backend>(
    options: &SchedulerOptions,
    device: &B::Device,
) -> Result<AnyScheduler<B>> {
    options.validate()?;

    let scheduler = match options.scheduler {
        SchedulerKind::Euler => AnyScheduler::Euler(EulerScheduler::new(options, device)),
        SchedulerKind::EulerAncestral => {
            AnyScheduler::EulerAncestral(EulerAncestralScheduler::new(options, device))
        }
        SchedulerKind::Ddim => AnyScheduler::Ddim(DdimScheduler::new(options, device)),
        SchedulerKind::Ddpm => AnyScheduler::Ddpm(DdpmScheduler::new(options, device)),
        SchedulerKind::Lms => AnyScheduler::Lms(LmsScheduler::new(options, device)),
        SchedulerKind::Kdpm2 => AnyScheduler::Kdpm2(Kdpm2Scheduler::new(options, device)),
    };
    check_timesteps(scheduler.timesteps(), options.train_timesteps)?;

    debug!(
        scheduler = %options.scheduler,
        steps = options.inference_steps,
        timesteps = scheduler.timesteps().len(),
        init_noise_sigma = scheduler.init_noise_sigma(),
        "scheduler created"
    );
    Ok(scheduler)
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            AnyScheduler::Euler($s) => $body,
            AnyScheduler::EulerAncestral($s) => $body,
            AnyScheduler::Ddim($s) => $body,
            AnyScheduler::Ddpm($s) => $body,
            AnyScheduler::Lms($s) => $body,
            AnyScheduler::Kdpm2($s) => $body,
        }
    };
}

impl<B: Backend> Scheduler<B> for AnyScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        dispatch!(self, s => s.kind())
    }

    fn timesteps(&self) -> &[usize] {
        dispatch!(self, s => s.timesteps())
    }

    fn init_noise_sigma(&self) -> f32 {
        dispatch!(self, s => s.init_noise_sigma())
    }

    fn order(&self) -> usize {
        dispatch!(self, s => s.order())
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Tensor<B, 4> {
        dispatch!(self, s => s.create_random_sample(shape, sigma))
    }

    fn scale_input(&self, latents: Tensor<B, 4>, timestep: usize) -> Result<Tensor<B, 4>> {
        dispatch!(self, s => s.scale_input(latents, timestep))
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        dispatch!(self, s => s.step(model_output, timestep, latents))
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>> {
        dispatch!(self, s => s.add_noise(original, noise, timesteps))
    }
}

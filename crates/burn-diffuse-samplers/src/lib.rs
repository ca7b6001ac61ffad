pub mod error;
pub mod options;
pub mod scheduler;
pub mod guidance;
pub mod batch;
pub mod ddim;
pub mod ddpm;
pub mod euler;
pub mod lms;
pub mod dpm2;
pub mod dispatch;

pub use error::{Result, SchedulerError};
pub use options::{BetaSchedule, SchedulerKind, SchedulerOptions, TimestepSpacing, VarianceType};
pub use scheduler::{
    NoiseGenerator, NoiseSchedule, PredictionType, Scheduler, SigmaTables,
    apply_karras_schedule, check_timesteps, get_ancestral_step, index_for_timestep,
    inference_timesteps, init_noise_sigma, integrate_simpson, separate_timesteps,
    sigma_to_timestep, timesteps_from_options,
};
pub use guidance::{
    guidance_multiplier, image_guidance_scale, perform_guidance, perform_instruct_guidance,
    should_perform_guidance,
};
pub use batch::{BatchKind, BatchOptions, generate_batch};
pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use euler::{EulerAncestralScheduler, EulerScheduler};
pub use lms::{LmsScheduler, LMS_ORDER};
pub use dpm2::Kdpm2Scheduler;
pub use dispatch::{AnyScheduler, create_scheduler};

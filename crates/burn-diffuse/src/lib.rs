//! burn-diffuse: diffusion sampling engine
//!
//! Drives iterative denoising on top of an external inference backend. The
//! engine owns the numerical side of a run (schedules, guidance, latent
//! bookkeeping, tiling) while every network evaluation is delegated to an
//! [`InferenceBackend`].
//!
//! # Crates
//!
//! - [`samplers`]: schedulers, scheduler options, guidance math, batch sweeps
//! - [`image`]: tile split/join and mask/image tensor helpers
//!
//! # Example
//!
//! ```ignore
//! use burn_diffuse::{DiffuseRequest, DiffusionPipeline, Diffuser, ModelConfig, NullProgress};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = DiffusionPipeline::new(backend, ModelConfig::sd1x(), &device);
//! let request = DiffuseRequest::new(Diffuser::TextToImage, prompt_embeds, options)
//!     .with_negative_embeds(negative_embeds);
//! let images = pipeline.run(&request, &NullProgress, &CancellationToken::new()).await?;
//! ```

pub use burn_diffuse_image as image;
pub use burn_diffuse_samplers as samplers;

pub mod backend;
pub mod diffuser;
pub mod error;
pub mod pipeline;

pub use backend::{AnyTensor, BackendError, Graph, InferenceBackend, TensorMap};
pub use diffuser::{DiffuseContext, Diffuser, strength_start};
pub use error::{DiffuseError, Result};
pub use pipeline::{
    ControlNetOptions, DebugConfig, DiffuseRequest, DiffusionPipeline, DiffusionProgress,
    ModelConfig, NullProgress, ProgressSink,
};

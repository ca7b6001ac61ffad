//! Top-level entry point for diffusion runs

use burn::prelude::*;
use burn_diffuse_samplers::{BatchOptions, generate_batch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DiffuseRequest, ModelConfig, ProgressSink};
use crate::backend::InferenceBackend;
use crate::diffuser::DiffuseContext;
use crate::error::{DiffuseError, Result};

/// Runs diffusion requests against one backend
///
/// The pipeline holds no per-run state: every run builds its own scheduler
/// and latents, so a cancelled or failed run leaves nothing behind.
pub struct DiffusionPipeline<B: Backend, E: InferenceBackend<B>> {
    backend: E,
    config: ModelConfig,
    device: B::Device,
}

impl<B: Backend, E: InferenceBackend<B>> DiffusionPipeline<B, E> {
    pub fn new(backend: E, config: ModelConfig, device: &B::Device) -> Self {
        Self {
            backend,
            config,
            device: device.clone(),
        }
    }

    pub fn backend(&self) -> &E {
        &self.backend
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Run one request to completion
    ///
    /// Returns decoded images `[batch, 3, H, W]`, or
    /// [`DiffuseError::Cancelled`] when `cancel` fires first.
    pub async fn run(
        &self,
        request: &DiffuseRequest<B>,
        progress: &dyn ProgressSink<B>,
        cancel: &CancellationToken,
    ) -> Result<Tensor<B, 4>> {
        let ctx = DiffuseContext::<B, E>::new(&self.backend, &self.config, &self.device);
        request.diffuser.diffuse(&ctx, request, progress, cancel).await
    }

    /// Run `request` once per option set in the batch expansion
    ///
    /// Runs are sequential and in expansion order. A cancellation stops the
    /// whole batch.
    pub async fn run_batch(
        &self,
        request: &DiffuseRequest<B>,
        batch: &BatchOptions,
        progress: &dyn ProgressSink<B>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Tensor<B, 4>>> {
        let expanded = generate_batch(batch, &request.options);
        if expanded.is_empty() {
            return Err(DiffuseError::Config(format!(
                "batch {:?} expands to no runs",
                batch.kind
            )));
        }
        info!(kind = ?batch.kind, runs = expanded.len(), "batch started");

        let total = expanded.len();
        let mut results = Vec::with_capacity(total);
        for (index, options) in expanded.into_iter().enumerate() {
            let run_request = DiffuseRequest {
                options,
                ..request.clone()
            };
            let ctx = DiffuseContext {
                batch_index: index,
                batch_count: total,
                ..DiffuseContext::<B, E>::new(&self.backend, &self.config, &self.device)
            };
            results.push(
                run_request
                    .diffuser
                    .diffuse(&ctx, &run_request, progress, cancel)
                    .await?,
            );
        }
        Ok(results)
    }
}

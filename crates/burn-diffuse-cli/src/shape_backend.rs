//! Backend that returns correctly shaped zeros
//!
//! Lets a diffuser run end to end without model weights, which checks option
//! files and shows the batch layout of every call.

use async_trait::async_trait;
use burn::prelude::*;
use burn_diffuse::{AnyTensor, BackendError, Graph, InferenceBackend, ModelConfig, TensorMap};
use tracing::debug;

pub struct ShapeBackend {
    model: ModelConfig,
}

impl ShapeBackend {
    pub fn new(model: ModelConfig) -> Self {
        Self { model }
    }
}

fn float4<B: Backend>(inputs: &TensorMap<B>, name: &str) -> Result<Tensor<B, 4>, BackendError> {
    inputs
        .get(name)
        .cloned()
        .and_then(AnyTensor::into_float4)
        .ok_or_else(|| BackendError::MissingInput(name.to_string()))
}

#[async_trait]
impl<B: Backend> InferenceBackend<B> for ShapeBackend {
    async fn infer(&self, graph: Graph, inputs: TensorMap<B>) -> Result<TensorMap<B>, BackendError> {
        for (name, tensor) in inputs.iter() {
            debug!(%graph, input = name, dims = ?tensor.dims(), "shape backend input");
        }

        let factor = self.model.vae_factor;
        let channels = self.model.latent_channels;
        let outputs = match graph {
            Graph::Unet => {
                let sample = float4(&inputs, "sample")?;
                let [b, _, h, w] = sample.dims();
                TensorMap::new().with("out_sample", Tensor::<B, 4>::zeros([b, channels, h, w], &sample.device()))
            }
            // No residuals
            Graph::ControlNet => TensorMap::new(),
            Graph::VaeEncoder => {
                let image = float4(&inputs, "sample")?;
                let [b, _, h, w] = image.dims();
                let shape = [b, channels, h / factor, w / factor];
                TensorMap::new().with("latent", Tensor::<B, 4>::zeros(shape, &image.device()))
            }
            Graph::VaeDecoder => {
                let latents = float4(&inputs, "latent_sample")?;
                let [b, _, h, w] = latents.dims();
                let shape = [b, 3, h * factor, w * factor];
                TensorMap::new().with("image", Tensor::<B, 4>::zeros(shape, &latents.device()))
            }
        };
        Ok(outputs)
    }
}

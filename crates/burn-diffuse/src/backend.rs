//! Inference backend abstraction
//!
//! The engine never runs a network itself. Every UNet, ControlNet and VAE
//! evaluation goes through [`InferenceBackend::infer`] with named input
//! tensors and returns named outputs.

use std::fmt;

use async_trait::async_trait;
use burn::prelude::*;

/// Input names used when building backend calls
pub mod names {
    pub const SAMPLE: &str = "sample";
    pub const TIMESTEP: &str = "timestep";
    pub const ENCODER_HIDDEN_STATES: &str = "encoder_hidden_states";
    pub const CONTROLNET_COND: &str = "controlnet_cond";
    pub const CONDITIONING_SCALE: &str = "conditioning_scale";
    pub const CLASS_LABELS: &str = "class_labels";
    pub const LATENT_SAMPLE: &str = "latent_sample";
}

/// Network graphs the engine can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Graph {
    Unet,
    ControlNet,
    VaeEncoder,
    VaeDecoder,
}

impl Graph {
    pub fn name(&self) -> &'static str {
        match self {
            Graph::Unet => "unet",
            Graph::ControlNet => "controlnet",
            Graph::VaeEncoder => "vae_encoder",
            Graph::VaeDecoder => "vae_decoder",
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error reported by a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Graph produced no output")]
    NoOutput,
}

/// A tensor of any rank or kind the graphs exchange
#[derive(Debug, Clone)]
pub enum AnyTensor<B: Backend> {
    Float1(Tensor<B, 1>),
    Float3(Tensor<B, 3>),
    Float4(Tensor<B, 4>),
    Int1(Tensor<B, 1, Int>),
}

impl<B: Backend> AnyTensor<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            AnyTensor::Float1(t) => t.dims().to_vec(),
            AnyTensor::Float3(t) => t.dims().to_vec(),
            AnyTensor::Float4(t) => t.dims().to_vec(),
            AnyTensor::Int1(t) => t.dims().to_vec(),
        }
    }

    pub fn into_float4(self) -> Option<Tensor<B, 4>> {
        match self {
            AnyTensor::Float4(t) => Some(t),
            _ => None,
        }
    }
}

impl<B: Backend> From<Tensor<B, 1>> for AnyTensor<B> {
    fn from(t: Tensor<B, 1>) -> Self {
        AnyTensor::Float1(t)
    }
}

impl<B: Backend> From<Tensor<B, 3>> for AnyTensor<B> {
    fn from(t: Tensor<B, 3>) -> Self {
        AnyTensor::Float3(t)
    }
}

impl<B: Backend> From<Tensor<B, 4>> for AnyTensor<B> {
    fn from(t: Tensor<B, 4>) -> Self {
        AnyTensor::Float4(t)
    }
}

impl<B: Backend> From<Tensor<B, 1, Int>> for AnyTensor<B> {
    fn from(t: Tensor<B, 1, Int>) -> Self {
        AnyTensor::Int1(t)
    }
}

/// Named tensors in insertion order
///
/// Order matters: ControlNet residuals are forwarded to the UNet in the
/// order the ControlNet produced them.
#[derive(Debug, Clone)]
pub struct TensorMap<B: Backend> {
    entries: Vec<(String, AnyTensor<B>)>,
}

impl<B: Backend> Default for TensorMap<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<B: Backend> TensorMap<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, tensor: impl Into<AnyTensor<B>>) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Insert or replace a named tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<AnyTensor<B>>) {
        let name = name.into();
        let tensor = tensor.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.entries.push((name, tensor)),
        }
    }

    /// Append every entry of `other`
    pub fn extend(&mut self, other: TensorMap<B>) {
        for (name, tensor) in other.entries {
            self.insert(name, tensor);
        }
    }

    pub fn get(&self, name: &str) -> Option<&AnyTensor<B>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AnyTensor<B>)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First rank-4 float output, the primary result of every graph
    pub fn into_first_float4(self) -> Option<Tensor<B, 4>> {
        self.entries.into_iter().find_map(|(_, t)| t.into_float4())
    }
}

impl<B: Backend> IntoIterator for TensorMap<B> {
    type Item = (String, AnyTensor<B>);
    type IntoIter = std::vec::IntoIter<(String, AnyTensor<B>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Executes network graphs on named tensors
#[async_trait]
pub trait InferenceBackend<B: Backend>: Send + Sync {
    /// Run `graph` on `inputs`
    async fn infer(&self, graph: Graph, inputs: TensorMap<B>) -> Result<TensorMap<B>, BackendError>;
}

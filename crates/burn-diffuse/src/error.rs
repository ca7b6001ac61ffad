//! Error types for diffusion runs

use burn_diffuse_image::{OpsError, TileError};
use burn_diffuse_samplers::SchedulerError;
use thiserror::Error;

use crate::backend::{BackendError, Graph};
use crate::diffuser::Diffuser;

/// Errors surfaced by a diffusion run
///
/// [`DiffuseError::Cancelled`] is the expected outcome of a cancelled run;
/// every other variant is fatal for the run that raised it.
#[derive(Debug, Error)]
pub enum DiffuseError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{diffuser} requires an input {input}")]
    MissingInput {
        diffuser: Diffuser,
        input: &'static str,
    },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Image(#[from] OpsError),

    #[error("{graph} inference failed: {source}")]
    Backend {
        graph: Graph,
        #[source]
        source: BackendError,
    },

    #[error("Non-finite values in {name}: NaN={nan}, Inf={inf}")]
    NonFinite { name: String, nan: usize, inf: usize },

    #[error("Diffusion cancelled")]
    Cancelled,
}

impl DiffuseError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiffuseError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DiffuseError>;

//! Renderer error types

use thiserror::Error;

use crate::backend::traits::BackendError;
use crate::render_graph::GraphError;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Program '{0}' is not in the shader library")]
    MissingProgram(String),

    #[error("{requested} drawables exceed the indirect command buffer capacity of {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    #[error("Material references texture '{0}' which is staged but not heap resident")]
    UnresidentTexture(String),

    #[error("Drawable {drawable} references unknown material {material}")]
    InvalidMaterial { drawable: u32, material: u32 },

    #[error("Frame ring slot {slot} is still in flight (submitted generation {submitted}, completed {completed})")]
    RingSlotInFlight {
        slot: usize,
        submitted: u64,
        completed: u64,
    },

    #[error("Renderer used before initialize()")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type RendererResult<T> = Result<T, RendererError>;

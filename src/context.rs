//! Explicit graphics context passed to every component that talks to the accelerator.

use crate::backend::GraphicsBackend;
use crate::library::ShaderLibrary;

/// One device plus the programs it runs.
pub struct GraphicsContext {
    backend: Box<dyn GraphicsBackend>,
    library: ShaderLibrary,
}

impl GraphicsContext {
    pub fn new(backend: Box<dyn GraphicsBackend>, library: ShaderLibrary) -> Self {
        log::info!(
            "Graphics context on {} with {} programs",
            backend.name(),
            library.len()
        );
        Self { backend, library }
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_mut()
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut ShaderLibrary {
        &mut self.library
    }

    /// Get backend as concrete type
    pub fn backend_as<B: GraphicsBackend>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref::<B>()
    }

    pub fn backend_as_mut<B: GraphicsBackend>(&mut self) -> Option<&mut B> {
        self.backend.as_any_mut().downcast_mut::<B>()
    }
}

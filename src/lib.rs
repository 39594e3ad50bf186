//! GPU-driven renderer - a render graph engine whose draw calls are written by the GPU
//!
//! Every frame one command stream runs:
//! - **Command synthesis**: a compute kernel writes one indexed indirect draw per drawable
//!   into the indirect command buffer (ICB), suppressing culled objects with a zero
//!   instance count
//! - **ICB optimize**: a copy pass moves the synthesized range into the replay buffer
//! - **Shadow, G-buffer, lighting** (deferred) or **shadow, forward**, each replaying the ICB
//! - **Composite**: optional HDR tonemap into the presentable surface
//!
//! Material textures live in one texture heap built at load time, and per-frame
//! uniforms are written into an N-deep frame ring that the host never overwrites
//! while the accelerator still reads it.
//!
//! Two backends implement [`backend::GraphicsBackend`]:
//! - **wgpu**: real GPU rendering into a winit window
//! - **headless**: host execution with an inspectable trace, used by the tests

pub mod backend;
pub mod context;
pub mod error;
pub mod frame_ring;
pub mod gpu_driven;
pub mod library;
pub mod pipeline;
pub mod render_graph;
pub mod renderer;
pub mod resources;
pub mod scene;

pub use backend::headless::{ExecutionMode, HeadlessBackend};
#[cfg(feature = "native")]
pub use backend::wgpu_backend::WgpuBackend;
pub use context::GraphicsContext;
pub use error::{RendererError, RendererResult};
pub use library::ShaderLibrary;
pub use renderer::{FrameOutcome, FrameStats, Renderer};

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu on the platform's native graphics API
    #[default]
    Wgpu,
    /// Host execution without a GPU
    Headless,
}

/// Shading path for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// G-buffer, then full-screen and light-volume lighting
    #[default]
    Deferred,
    /// Single pass shading every object directly
    Forward,
}

/// Configuration for creating a [`Renderer`]
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial surface width
    pub width: u32,
    /// Initial surface height
    pub height: u32,
    pub backend: BackendType,
    pub vsync: bool,
    /// Depth of the frame ring
    pub frames_in_flight: usize,
    pub render_mode: RenderMode,
    /// Render a directional shadow map
    pub shadows: bool,
    pub shadow_map_size: u32,
    /// ICB capacity; `None` sizes it to the registered drawable count
    pub max_drawables: Option<u32>,
    /// Light storage capacity per frame
    pub max_lights: u32,
    /// Accumulate into an HDR target and tonemap it into the surface
    pub post_process: bool,
    /// Frustum culling inside the synthesis kernel
    pub gpu_culling: bool,
    /// Generation-counter check before every frame ring write
    pub validate_frame_ring: bool,
    pub clear_color: [f32; 4],
    /// Ambient light: rgb color, intensity
    pub ambient: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "GPU-Driven Renderer".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Wgpu,
            vsync: true,
            frames_in_flight: 3,
            render_mode: RenderMode::Deferred,
            shadows: true,
            shadow_map_size: 2048,
            max_drawables: None,
            max_lights: 256,
            post_process: true,
            gpu_culling: false,
            validate_frame_ring: cfg!(debug_assertions),
            clear_color: [0.1, 0.1, 0.15, 1.0],
            ambient: [1.0, 1.0, 1.0, 0.1],
        }
    }
}

impl RendererConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_render_mode(mut self, render_mode: RenderMode) -> Self {
        self.render_mode = render_mode;
        self
    }

    pub fn with_shadows(mut self, shadows: bool) -> Self {
        self.shadows = shadows;
        self
    }

    pub fn with_shadow_map_size(mut self, size: u32) -> Self {
        self.shadow_map_size = size;
        self
    }

    pub fn with_max_drawables(mut self, max_drawables: u32) -> Self {
        self.max_drawables = Some(max_drawables);
        self
    }

    pub fn with_max_lights(mut self, max_lights: u32) -> Self {
        self.max_lights = max_lights;
        self
    }

    pub fn with_post_process(mut self, post_process: bool) -> Self {
        self.post_process = post_process;
        self
    }

    pub fn with_gpu_culling(mut self, gpu_culling: bool) -> Self {
        self.gpu_culling = gpu_culling;
        self
    }

    pub fn with_frame_ring_validation(mut self, validate: bool) -> Self {
        self.validate_frame_ring = validate;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn with_ambient(mut self, color: [f32; 3], intensity: f32) -> Self {
        self.ambient = [color[0], color[1], color[2], intensity];
        self
    }

    /// Reject settings no renderer can run with
    pub fn validate(&self) -> RendererResult<()> {
        if self.frames_in_flight == 0 {
            return Err(RendererError::InvalidConfig(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if self.shadow_map_size == 0 {
            return Err(RendererError::InvalidConfig(
                "shadow_map_size must be non-zero".into(),
            ));
        }
        if self.max_lights == 0 {
            return Err(RendererError::InvalidConfig(
                "max_lights must be non-zero".into(),
            ));
        }
        if self.max_drawables == Some(0) {
            return Err(RendererError::InvalidConfig(
                "max_drawables must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Initialize `env_logger` from `RUST_LOG`; later calls are no-ops
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.shadow_map_size, 2048);
        assert_eq!(config.render_mode, RenderMode::Deferred);
    }

    #[rstest]
    #[case::no_frames_in_flight(RendererConfig::default().with_frames_in_flight(0))]
    #[case::no_shadow_map(RendererConfig::default().with_shadow_map_size(0))]
    #[case::no_lights(RendererConfig::default().with_max_lights(0))]
    #[case::no_drawables(RendererConfig::default().with_max_drawables(0))]
    fn invalid_config_is_rejected(#[case] config: RendererConfig) {
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidConfig(_))
        ));
    }

    #[test]
    fn renderer_rejects_invalid_config() {
        let backend = Box::new(HeadlessBackend::new(8, 8));
        let result = Renderer::new(backend, RendererConfig::default().with_frames_in_flight(0));
        assert!(matches!(result, Err(RendererError::InvalidConfig(_))));
    }
}

//! Backend abstraction layer
//!
//! [`GraphicsBackend`] is the seam between the renderer and an accelerator. The wgpu
//! backend drives real hardware; the headless backend executes on the host and records
//! what it did, which is what the tests run against.

pub mod headless;
pub mod traits;
pub mod types;

#[cfg(feature = "native")]
pub mod wgpu_backend;

pub use traits::*;
pub use types::*;

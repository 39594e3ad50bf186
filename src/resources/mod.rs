//! Resource management
//!
//! Meshes, texture data, materials and the texture heap that makes them resident.

mod heap;
mod material;
mod mesh;
mod texture;

pub use heap::*;
pub use material::*;
pub use mesh::*;
pub use texture::*;

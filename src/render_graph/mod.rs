//! Render Graph System
//!
//! A declarative system for defining passes as a directed acyclic graph (DAG). Passes
//! declare the buffers, textures and heaps they read or write; the graph derives the
//! execution order and the barriers between passes from those declarations.

pub mod executor;
pub mod graph;
pub mod pass;
pub mod resource;

pub use executor::*;
pub use graph::*;
pub use pass::*;
pub use resource::*;

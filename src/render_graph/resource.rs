//! Virtual resources for the render graph

use crate::backend::traits::ResourceState;
use crate::backend::types::*;

/// Unique identifier for a render graph resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

/// Virtual texture resource in the render graph
#[derive(Debug, Clone)]
pub struct VirtualTexture {
    pub id: ResourceId,
    pub desc: TextureDescriptor,
    pub size: TextureSize,
    pub name: String,
}

/// Virtual buffer resource in the render graph
#[derive(Debug, Clone)]
pub struct VirtualBuffer {
    pub id: ResourceId,
    pub desc: BufferDescriptor,
    pub name: String,
}

/// Resource type enumeration
#[derive(Debug, Clone)]
pub enum VirtualResource {
    /// Transient texture allocated by the executor
    Texture(VirtualTexture),
    /// Transient buffer allocated by the executor
    Buffer(VirtualBuffer),
    /// Buffer owned outside the graph, possibly one per frame ring slot
    ImportedBuffer { id: ResourceId, name: String },
    /// Texture heap owned outside the graph
    Heap { id: ResourceId, name: String },
    /// External resource (like the presentable surface)
    External { id: ResourceId, name: String },
}

impl VirtualResource {
    pub fn id(&self) -> ResourceId {
        match self {
            VirtualResource::Texture(t) => t.id,
            VirtualResource::Buffer(b) => b.id,
            VirtualResource::ImportedBuffer { id, .. }
            | VirtualResource::Heap { id, .. }
            | VirtualResource::External { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            VirtualResource::Texture(t) => &t.name,
            VirtualResource::Buffer(b) => &b.name,
            VirtualResource::ImportedBuffer { name, .. }
            | VirtualResource::Heap { name, .. }
            | VirtualResource::External { name, .. } => name,
        }
    }
}

/// How a pass uses a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    /// Read as a texture (sampled)
    TextureRead,
    /// Write as a render target
    RenderTarget,
    /// Depth/stencil attachment
    DepthStencilRead,
    DepthStencilWrite,
    /// Read as uniform buffer
    UniformBuffer,
    /// Read/write as storage buffer
    StorageBufferRead,
    StorageBufferWrite,
    /// Consumed as indirect draw arguments
    IndirectRead,
    /// Source or destination of a copy
    TransferRead,
    TransferWrite,
    /// Textures of a heap sampled through their residency handles
    HeapRead,
}

impl ResourceUsage {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ResourceUsage::RenderTarget
                | ResourceUsage::DepthStencilWrite
                | ResourceUsage::StorageBufferWrite
                | ResourceUsage::TransferWrite
        )
    }

    /// Access state a backend barrier transitions to or from
    pub fn state(&self) -> ResourceState {
        match self {
            ResourceUsage::TextureRead
            | ResourceUsage::StorageBufferRead
            | ResourceUsage::HeapRead => ResourceState::ShaderRead,
            ResourceUsage::StorageBufferWrite => ResourceState::ShaderWrite,
            ResourceUsage::RenderTarget => ResourceState::RenderTarget,
            ResourceUsage::DepthStencilRead => ResourceState::DepthRead,
            ResourceUsage::DepthStencilWrite => ResourceState::DepthWrite,
            ResourceUsage::UniformBuffer => ResourceState::Uniform,
            ResourceUsage::IndirectRead => ResourceState::IndirectArgument,
            ResourceUsage::TransferRead => ResourceState::CopySrc,
            ResourceUsage::TransferWrite => ResourceState::CopyDst,
        }
    }
}

/// Resource access declaration for a pass
#[derive(Debug, Clone)]
pub struct ResourceAccess {
    pub resource: ResourceId,
    pub usage: ResourceUsage,
}

impl ResourceAccess {
    pub fn is_read(&self) -> bool {
        !self.usage.is_write()
    }

    pub fn is_write(&self) -> bool {
        self.usage.is_write()
    }
}

/// Describes texture dimensions that can be relative to screen size
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextureSize {
    /// Absolute size in pixels
    Absolute { width: u32, height: u32 },
    /// Relative to screen size (1.0 = full screen)
    Relative { width_scale: f32, height_scale: f32 },
}

impl Default for TextureSize {
    fn default() -> Self {
        TextureSize::Relative {
            width_scale: 1.0,
            height_scale: 1.0,
        }
    }
}

impl TextureSize {
    pub fn resolve(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        match self {
            TextureSize::Absolute { width, height } => (*width, *height),
            TextureSize::Relative {
                width_scale,
                height_scale,
            } => (
                (((screen_width as f32) * width_scale) as u32).max(1),
                (((screen_height as f32) * height_scale) as u32).max(1),
            ),
        }
    }
}

//! Render pass definitions for the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::context::GraphicsContext;
use crate::error::RendererResult;
use crate::render_graph::resource::*;
use std::any::Any;
use std::collections::HashMap;

/// Unique identifier for a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) u32);

/// Context for setting up pass resources
pub struct PassSetupContext<'a> {
    pub(crate) resources: &'a mut Vec<VirtualResource>,
    pub(crate) inputs: &'a mut Vec<ResourceAccess>,
    pub(crate) outputs: &'a mut Vec<ResourceAccess>,
    pub(crate) next_resource_id: &'a mut u32,
    pub(crate) screen_width: u32,
    pub(crate) screen_height: u32,
}

impl<'a> PassSetupContext<'a> {
    /// Create a pass-private texture with size relative to screen
    pub fn create_texture_relative(
        &mut self,
        name: &str,
        size: TextureSize,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> ResourceId {
        let id = ResourceId(*self.next_resource_id);
        *self.next_resource_id += 1;
        let (width, height) = size.resolve(self.screen_width, self.screen_height);

        self.resources.push(VirtualResource::Texture(VirtualTexture {
            id,
            desc: TextureDescriptor {
                label: Some(name.to_string()),
                width,
                height,
                format,
                usage,
                ..Default::default()
            },
            size,
            name: name.to_string(),
        }));

        id
    }

    /// Declare that this pass reads from a resource
    pub fn read(&mut self, resource: ResourceId, usage: ResourceUsage) {
        self.inputs.push(ResourceAccess { resource, usage });
    }

    /// Declare that this pass writes to a resource
    pub fn write(&mut self, resource: ResourceId, usage: ResourceUsage) {
        self.outputs.push(ResourceAccess { resource, usage });
    }

    /// Get screen dimensions
    pub fn screen_size(&self) -> (u32, u32) {
        (self.screen_width, self.screen_height)
    }
}

/// Heap-resident textures as a pass binds them
#[derive(Debug, Clone, Default)]
pub struct HeapBinding {
    pub heap: Option<HeapHandle>,
    /// One view per resident texture, in residency index order
    pub views: Vec<TextureViewHandle>,
}

/// Resolved handles of every graph resource
#[derive(Debug, Default)]
pub struct ResourceTable {
    pub(crate) textures: HashMap<ResourceId, TextureViewHandle>,
    /// One entry per frame ring slot for ring-backed imports, otherwise one entry
    pub(crate) buffers: HashMap<ResourceId, Vec<BufferHandle>>,
    pub(crate) heaps: HashMap<ResourceId, HeapBinding>,
}

impl ResourceTable {
    pub fn texture(&self, resource: ResourceId) -> Option<TextureViewHandle> {
        self.textures.get(&resource).copied()
    }

    /// Buffer bound for `slot`; single-buffer imports serve every slot
    pub fn buffer(&self, resource: ResourceId, slot: usize) -> Option<BufferHandle> {
        let buffers = self.buffers.get(&resource)?;
        buffers.get(slot).or_else(|| buffers.first()).copied()
    }

    pub fn buffers(&self, resource: ResourceId) -> &[BufferHandle] {
        self.buffers.get(&resource).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn heap(&self, resource: ResourceId) -> Option<&HeapBinding> {
        self.heaps.get(&resource)
    }
}

/// Per-frame values every pass may read
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameState {
    pub frame_index: u64,
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub drawable_count: u32,
    pub directional_lights: u32,
    pub point_lights: u32,
}

/// Context for creating pipelines and bind groups once per graph build
pub struct PassPrepareContext<'a> {
    pub gfx: &'a mut GraphicsContext,
    pub resources: &'a ResourceTable,
    pub frames_in_flight: usize,
    pub width: u32,
    pub height: u32,
}

impl<'a> PassPrepareContext<'a> {
    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        self.gfx.backend_mut()
    }

    pub fn get_texture(&self, resource: ResourceId) -> Option<TextureViewHandle> {
        self.resources.texture(resource)
    }

    /// Buffer bound for each frame ring slot
    pub fn get_slot_buffers(&self, resource: ResourceId) -> Vec<Option<BufferHandle>> {
        (0..self.frames_in_flight)
            .map(|slot| self.resources.buffer(resource, slot))
            .collect()
    }

    pub fn get_buffer(&self, resource: ResourceId) -> Option<BufferHandle> {
        self.resources.buffer(resource, 0)
    }

    pub fn get_heap(&self, resource: ResourceId) -> Option<&HeapBinding> {
        self.resources.heap(resource)
    }
}

/// Context for executing a render pass
pub struct PassExecuteContext<'a> {
    pub gfx: &'a mut GraphicsContext,
    pub frame: &'a FrameState,
    pub resources: &'a ResourceTable,
}

impl<'a> PassExecuteContext<'a> {
    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        self.gfx.backend_mut()
    }

    /// Get a texture view handle for a resource
    pub fn get_texture(&self, resource: ResourceId) -> Option<TextureViewHandle> {
        self.resources.texture(resource)
    }

    /// Get the buffer bound for the current frame slot
    pub fn get_buffer(&self, resource: ResourceId) -> Option<BufferHandle> {
        self.resources.buffer(resource, self.frame.slot)
    }
}

/// Trait for render passes
pub trait RenderPass: Send + Sync {
    /// Get the pass name for debugging
    fn name(&self) -> &str;

    /// Setup phase - declare resources and dependencies
    fn setup(&mut self, ctx: &mut PassSetupContext);

    /// Prepare phase - pipelines and bind groups, once per graph build
    fn prepare(&mut self, _ctx: &mut PassPrepareContext) -> RendererResult<()> {
        Ok(())
    }

    /// Execute phase - record commands
    fn execute(&self, ctx: &mut PassExecuteContext);

    /// Allow downcasting
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Type of render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    /// Graphics render pass
    Graphics,
    /// Compute pass
    Compute,
    /// Transfer/copy pass
    Transfer,
}

/// Metadata about a pass in the graph
#[derive(Debug)]
pub struct PassNode {
    pub id: PassId,
    pub name: String,
    pub pass_type: PassType,
    pub inputs: Vec<ResourceAccess>,
    pub outputs: Vec<ResourceAccess>,
}

impl PassNode {
    pub fn reads_resource(&self, resource: ResourceId) -> bool {
        self.inputs.iter().any(|a| a.resource == resource)
    }

    pub fn writes_resource(&self, resource: ResourceId) -> bool {
        self.outputs.iter().any(|a| a.resource == resource)
    }

    /// Reads then writes, in declaration order
    pub fn accesses(&self) -> impl Iterator<Item = &ResourceAccess> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

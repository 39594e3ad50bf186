//! Render graph executor

use crate::backend::traits::*;
use crate::context::GraphicsContext;
use crate::error::RendererResult;
use crate::render_graph::graph::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use std::collections::HashMap;

/// Executor for running the compiled render graph
#[derive(Default)]
pub struct RenderGraphExecutor {
    /// Allocated textures mapped by resource ID
    allocated_textures: HashMap<ResourceId, TextureHandle>,

    /// Allocated buffers mapped by resource ID
    allocated_buffers: HashMap<ResourceId, BufferHandle>,

    /// Views, buffers and heaps passes resolve their resources through
    table: ResourceTable,

    frames_in_flight: usize,
}

impl RenderGraphExecutor {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            ..Default::default()
        }
    }

    /// Bind an imported buffer shared by every frame slot
    pub fn import_buffer(&mut self, resource: ResourceId, buffer: BufferHandle) {
        self.table.buffers.insert(resource, vec![buffer]);
    }

    /// Bind an imported buffer with one instance per frame ring slot
    pub fn import_ring_buffer(&mut self, resource: ResourceId, buffers: Vec<BufferHandle>) {
        self.table.buffers.insert(resource, buffers);
    }

    pub fn import_heap(&mut self, resource: ResourceId, heap: HeapBinding) {
        self.table.heaps.insert(resource, heap);
    }

    /// Set an external texture view (e.g., the presentable surface)
    pub fn set_external_view(&mut self, resource: ResourceId, view: TextureViewHandle) {
        self.table.textures.insert(resource, view);
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.table
    }

    /// Texture allocated for a graph resource
    pub fn texture(&self, resource: ResourceId) -> Option<TextureHandle> {
        self.allocated_textures.get(&resource).copied()
    }

    /// Allocate resources needed for the render graph
    pub fn allocate_resources(
        &mut self,
        graph: &RenderGraph,
        backend: &mut dyn GraphicsBackend,
    ) -> BackendResult<()> {
        for resource in graph.resources() {
            match resource {
                VirtualResource::Texture(tex) => {
                    if !self.allocated_textures.contains_key(&tex.id) {
                        let handle = backend.create_texture(&tex.desc)?;
                        let view = backend.create_texture_view(handle)?;
                        self.allocated_textures.insert(tex.id, handle);
                        self.table.textures.insert(tex.id, view);
                    }
                }
                VirtualResource::Buffer(buf) => {
                    if !self.allocated_buffers.contains_key(&buf.id) {
                        let handle = backend.create_buffer(&buf.desc)?;
                        self.allocated_buffers.insert(buf.id, handle);
                        self.table.buffers.insert(buf.id, vec![handle]);
                    }
                }
                VirtualResource::ImportedBuffer { .. }
                | VirtualResource::Heap { .. }
                | VirtualResource::External { .. } => {
                    // Bound by the owner through the import methods
                }
            }
        }
        Ok(())
    }

    /// Run every pass's prepare step, in execution order
    pub fn prepare(
        &self,
        graph: &mut RenderGraph,
        compiled: &CompiledGraph,
        gfx: &mut GraphicsContext,
    ) -> RendererResult<()> {
        let (width, height) = graph.screen_size();
        for &pass_id in &compiled.pass_order {
            let Some(index) = graph.pass_nodes().iter().position(|n| n.id == pass_id) else {
                continue;
            };
            let pass = &mut graph.passes_mut()[index];
            log::debug!("Preparing pass '{}'", pass.name());
            let mut ctx = PassPrepareContext {
                gfx: &mut *gfx,
                resources: &self.table,
                frames_in_flight: self.frames_in_flight,
                width,
                height,
            };
            pass.prepare(&mut ctx)?;
        }
        Ok(())
    }

    fn resolve_barrier(&self, barrier: &PlannedBarrier, slot: usize) -> Option<ResourceBarrier> {
        let target = if let Some(view) = self.table.texture(barrier.resource) {
            BarrierTarget::Texture(view)
        } else if let Some(buffer) = self.table.buffer(barrier.resource, slot) {
            BarrierTarget::Buffer(buffer)
        } else {
            BarrierTarget::Heap(self.table.heap(barrier.resource)?.heap?)
        };
        Some(ResourceBarrier {
            target,
            before: barrier.before.state(),
            after: barrier.after.state(),
        })
    }

    /// Record the compiled graph into the current command stream
    pub fn execute(
        &self,
        graph: &RenderGraph,
        compiled: &CompiledGraph,
        gfx: &mut GraphicsContext,
        frame: &FrameState,
    ) {
        for &pass_id in &compiled.pass_order {
            let Some(pass) = graph.get_pass(pass_id) else {
                continue;
            };

            let barriers: Vec<ResourceBarrier> = compiled
                .barriers_for(pass_id)
                .iter()
                .filter_map(|b| self.resolve_barrier(b, frame.slot))
                .collect();
            if !barriers.is_empty() {
                gfx.backend_mut().resource_barrier(&barriers);
            }

            let mut ctx = PassExecuteContext {
                gfx: &mut *gfx,
                frame,
                resources: &self.table,
            };
            pass.execute(&mut ctx);
        }
    }

    /// Release transient resources; imports are left to their owners
    pub fn cleanup(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, handle) in self.allocated_textures.drain() {
            backend.destroy_texture(handle);
        }
        for (_, handle) in self.allocated_buffers.drain() {
            backend.destroy_buffer(handle);
        }
        self.table = ResourceTable::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, TraceEvent};
    use crate::backend::types::*;
    use crate::library::ShaderLibrary;
    use std::any::Any;

    struct ClearPass {
        name: &'static str,
        target: ResourceId,
        sample: Option<ResourceId>,
    }

    impl RenderPass for ClearPass {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&mut self, ctx: &mut PassSetupContext) {
            if let Some(sample) = self.sample {
                ctx.read(sample, ResourceUsage::TextureRead);
            }
            ctx.write(self.target, ResourceUsage::RenderTarget);
        }

        fn execute(&self, ctx: &mut PassExecuteContext) {
            let Some(view) = ctx.get_texture(self.target) else {
                return;
            };
            let backend = ctx.backend();
            backend.begin_render_pass(&RenderPassDescriptor {
                label: Some(self.name.to_string()),
                color_attachments: vec![ColorAttachment {
                    view,
                    resolve_target: None,
                    load_op: LoadOp::Clear([1.0, 0.0, 0.0, 1.0]),
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            });
            backend.end_render_pass();
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn executes_in_order_and_emits_barriers() {
        let mut gfx = GraphicsContext::new(Box::new(HeadlessBackend::new(8, 8)), ShaderLibrary::new());
        let mut graph = RenderGraph::new(8, 8);
        let first = graph.create_texture(
            "first",
            TextureSize::default(),
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        );
        let surface = graph.register_external("surface");
        graph.add_pass(
            ClearPass {
                name: "second",
                target: surface,
                sample: Some(first),
            },
            PassType::Graphics,
        );
        graph.add_pass(
            ClearPass {
                name: "first",
                target: first,
                sample: None,
            },
            PassType::Graphics,
        );
        let compiled = graph.compile().unwrap();

        let mut executor = RenderGraphExecutor::new(1);
        executor.allocate_resources(&graph, gfx.backend_mut()).unwrap();
        let frame_view = gfx.backend_mut().acquire_surface().unwrap().swapchain_view;
        executor.set_external_view(surface, frame_view);
        executor.prepare(&mut graph, &compiled, &mut gfx).unwrap();

        gfx.backend_mut().begin_encoding("frame");
        executor.execute(&graph, &compiled, &mut gfx, &FrameState::default());
        gfx.backend_mut().submit(None).unwrap();

        let headless = gfx.backend_as::<HeadlessBackend>().unwrap();
        let events = headless.trace().events();
        let labels: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::BeginPass { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["first", "second"]);
        assert!(events.iter().any(|e| matches!(
            e,
            TraceEvent::Barrier { barrier, .. }
                if barrier.before == ResourceState::RenderTarget
                    && barrier.after == ResourceState::ShaderRead
        )));
    }
}

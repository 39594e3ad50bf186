//! Renderer orchestration
//!
//! Two phases: `initialize` does every fallible one-time step (heap promotion,
//! descriptor table, ICB, pipelines) and `render_frame` only writes the acquired
//! frame-ring slot, encodes the compiled graph and submits it.

use std::path::Path;

use glam::{Mat4, UVec4, Vec4};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::context::GraphicsContext;
use crate::error::{RendererError, RendererResult};
use crate::frame_ring::{FrameRing, FrameSlot, RingBuffer};
use crate::gpu_driven::layout::{
    FrameUniforms, LightRecord, ObjectTransformRecord, SynthesisParams, LAYOUT_VERSION,
};
use crate::gpu_driven::{DescriptorBuffers, DescriptorTable, IndirectCommandBuffer, ReplayPlan};
use crate::library::ShaderLibrary;
use crate::pipeline::{build_frame_graph, FrameGraphConfig, FrameResources};
use crate::render_graph::{CompiledGraph, FrameState, HeapBinding, RenderGraph, RenderGraphExecutor};
use crate::resources::{GpuMesh, Mesh, TextureData, TextureHeap, TextureId};
use crate::scene::shadow::fit_directional_light;
use crate::scene::{frustum_planes, pack_lights, CameraProvider, LightProvider, SceneProvider};
use crate::{RenderMode, RendererConfig};

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented(FrameStats),
    /// The surface was unavailable; nothing was submitted and the ring slot was released
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub slot: usize,
    pub submission: SubmissionId,
    pub drawables: u32,
    pub directional_lights: u32,
    pub volume_lights: u32,
}

/// Device-side state derived from the scene's drawable set
struct GeometryState {
    table: DescriptorTable,
    buffers: DescriptorBuffers,
    params: BufferHandle,
    icb: IndirectCommandBuffer,
    transforms: RingBuffer,
}

impl GeometryState {
    fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        self.buffers.destroy(backend);
        backend.destroy_buffer(self.params);
        self.icb.destroy(backend);
        self.transforms.destroy(backend);
    }
}

struct FrameGraph {
    graph: RenderGraph,
    compiled: CompiledGraph,
    executor: RenderGraphExecutor,
    resources: FrameResources,
}

/// 1x1 white texture bound when the heap holds nothing
struct Placeholder {
    texture: TextureHandle,
    view: TextureViewHandle,
}

pub struct Renderer {
    gfx: GraphicsContext,
    config: RendererConfig,
    width: u32,
    height: u32,
    heap: TextureHeap,
    placeholder: Placeholder,
    ring: FrameRing,
    frame_uniforms: RingBuffer,
    lights: RingBuffer,
    light_volume: GpuMesh,
    geometry: Option<GeometryState>,
    frame_graph: Option<FrameGraph>,
    transform_scratch: Vec<ObjectTransformRecord>,
}

impl Renderer {
    /// Create a renderer on `backend`. Fails on invalid configuration or when the
    /// backend cannot create the per-frame buffers.
    pub fn new(backend: Box<dyn GraphicsBackend>, config: RendererConfig) -> RendererResult<Self> {
        config.validate()?;
        let mut gfx = GraphicsContext::new(backend, ShaderLibrary::with_builtin_programs());
        let (width, height) = gfx.backend().surface_size();
        let slots = config.frames_in_flight;

        let backend = gfx.backend_mut();
        let frame_uniforms = RingBuffer::new(
            backend,
            "Frame Uniforms",
            std::mem::size_of::<FrameUniforms>() as u64,
            BufferUsage::UNIFORM,
            slots,
        )?;
        let lights = RingBuffer::new(
            backend,
            "Lights",
            (config.max_lights as usize * std::mem::size_of::<LightRecord>()) as u64,
            BufferUsage::STORAGE,
            slots,
        )?;
        let light_volume = Mesh::icosahedron().upload(backend)?;

        let texture = backend.create_texture(&TextureDescriptor {
            label: Some("Heap Placeholder".into()),
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(texture, TextureSubresource::BASE, &[255; 4]);
        let view = backend.create_texture_view(texture)?;

        log::info!(
            "Renderer created: {}x{}, {:?}, {} frames in flight",
            width,
            height,
            config.render_mode,
            slots
        );

        Ok(Self {
            gfx,
            ring: FrameRing::new(slots, config.validate_frame_ring),
            config,
            width,
            height,
            heap: TextureHeap::new(),
            placeholder: Placeholder { texture, view },
            frame_uniforms,
            lights,
            light_volume,
            geometry: None,
            frame_graph: None,
            transform_scratch: Vec::new(),
        })
    }

    /// Stage a texture for the next heap build
    pub fn intern_texture(&mut self, data: &TextureData) -> RendererResult<TextureId> {
        self.heap.intern(self.gfx.backend_mut(), data)
    }

    /// Stage a texture file; load failures resolve to no texture
    pub fn intern_texture_file(&mut self, path: impl AsRef<Path>) -> RendererResult<TextureId> {
        self.heap.intern_file(self.gfx.backend_mut(), path)
    }

    /// Upload a mesh so scene models can reference it
    pub fn upload_mesh(&mut self, mesh: &Mesh) -> RendererResult<GpuMesh> {
        Ok(mesh.upload(self.gfx.backend_mut())?)
    }

    /// One-time setup before the frame loop: heap promotion, descriptor table, ICB,
    /// frame graph pipelines.
    pub fn initialize(&mut self, scene: &dyn SceneProvider) -> RendererResult<()> {
        self.teardown();
        self.heap.build(self.gfx.backend_mut())?;
        self.build_geometry(scene)?;
        self.build_graph()?;
        self.heap.release_staging(self.gfx.backend_mut());
        log::info!(
            "Renderer initialized: {} drawables, {} textures",
            self.drawable_count(),
            self.heap.len()
        );
        Ok(())
    }

    /// Rebuild the descriptor table, ICB and graph after models were added or removed.
    /// Textures interned since the last build are promoted into a new heap first.
    pub fn rebuild_geometry(&mut self, scene: &dyn SceneProvider) -> RendererResult<()> {
        if self.geometry.is_none() {
            return Err(RendererError::NotInitialized);
        }
        self.teardown();
        if self.heap.staged_count() > 0 {
            self.heap.build(self.gfx.backend_mut())?;
        }
        self.build_geometry(scene)?;
        self.build_graph()?;
        self.heap.release_staging(self.gfx.backend_mut());
        log::debug!("Geometry rebuilt: {} drawables", self.drawable_count());
        Ok(())
    }

    fn build_geometry(&mut self, scene: &dyn SceneProvider) -> RendererResult<()> {
        let drawables = scene.drawables();
        let capacity = self
            .config
            .max_drawables
            .unwrap_or(drawables.len() as u32)
            .max(1);

        let mut table = DescriptorTable::new(capacity);
        for material in scene.materials() {
            table.add_material(material.encode(&self.heap)?);
        }
        for drawable in &drawables {
            table.register(drawable)?;
        }

        let backend = self.gfx.backend_mut();
        let buffers = table.upload(backend)?;
        let params = SynthesisParams {
            drawable_count: table.len(),
            layout_version: LAYOUT_VERSION,
            culling_enabled: u32::from(self.config.gpu_culling),
            _pad: 0,
        };
        let params = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Synthesis Params".into()),
                size: std::mem::size_of::<SynthesisParams>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            bytemuck::bytes_of(&params),
        )?;
        let icb = IndirectCommandBuffer::new(backend, capacity)?;
        let transforms = RingBuffer::new(
            backend,
            "Object Transforms",
            capacity as u64 * std::mem::size_of::<ObjectTransformRecord>() as u64,
            BufferUsage::STORAGE,
            self.config.frames_in_flight,
        )?;

        log::debug!(
            "Descriptor table built: {} drawables, {} materials, {} geometry slots, capacity {}",
            table.len(),
            table.materials().len(),
            table.geometry().len(),
            capacity
        );
        self.geometry = Some(GeometryState {
            table,
            buffers,
            params,
            icb,
            transforms,
        });
        Ok(())
    }

    fn build_graph(&mut self) -> RendererResult<()> {
        let geometry = self.geometry.as_ref().ok_or(RendererError::NotInitialized)?;
        let config = FrameGraphConfig {
            mode: self.config.render_mode,
            shadows: self.config.shadows,
            shadow_map_size: self.config.shadow_map_size,
            post_process: self.config.post_process,
            clear_color: self.config.clear_color,
        };
        let (mut graph, resources) = build_frame_graph(
            self.width,
            self.height,
            &config,
            ReplayPlan::from_table(&geometry.table),
            &self.light_volume,
        );
        let compiled = graph.compile()?;

        let mut executor = RenderGraphExecutor::new(self.config.frames_in_flight);
        executor.import_buffer(resources.params, geometry.params);
        executor.import_buffer(resources.records, geometry.buffers.records);
        executor.import_buffer(resources.templates, geometry.buffers.templates);
        executor.import_buffer(resources.materials, geometry.buffers.materials);
        executor.import_buffer(resources.icb_synthesized, geometry.icb.synthesized());
        executor.import_buffer(resources.icb_replay, geometry.icb.replay());
        executor.import_ring_buffer(resources.transforms, geometry.transforms.buffers().to_vec());
        executor.import_ring_buffer(resources.frame_uniforms, self.frame_uniforms.buffers().to_vec());
        executor.import_ring_buffer(resources.lights, self.lights.buffers().to_vec());

        let mut views = self.heap.resident_views();
        if views.is_empty() {
            views.push(self.placeholder.view);
        }
        executor.import_heap(
            resources.heap,
            HeapBinding {
                heap: self.heap.current_heap(),
                views,
            },
        );

        executor.allocate_resources(&graph, self.gfx.backend_mut())?;
        executor.prepare(&mut graph, &compiled, &mut self.gfx)?;
        log::debug!(
            "Frame graph ready: {}",
            graph.ordered_names(&compiled).join(" -> ")
        );
        self.frame_graph = Some(FrameGraph {
            graph,
            compiled,
            executor,
            resources,
        });
        Ok(())
    }

    /// Wait for in-flight frames, then release the graph and geometry state
    fn teardown(&mut self) {
        if self.frame_graph.is_none() && self.geometry.is_none() {
            return;
        }
        let backend = self.gfx.backend_mut();
        backend.poll(true);
        if let Some(mut frame_graph) = self.frame_graph.take() {
            frame_graph.executor.cleanup(backend);
        }
        if let Some(geometry) = self.geometry.take() {
            geometry.destroy(backend);
        }
    }

    /// Render and present one frame.
    ///
    /// Blocks only in the frame ring's acquire, until the slot being reused has been
    /// released by the accelerator.
    pub fn render_frame(
        &mut self,
        scene: &dyn SceneProvider,
        camera: &dyn CameraProvider,
        lights: &dyn LightProvider,
    ) -> RendererResult<FrameOutcome> {
        if self.geometry.is_none() || self.frame_graph.is_none() {
            return Err(RendererError::NotInitialized);
        }
        let slot = self.ring.acquire(self.gfx.backend_mut());
        match self.record_frame(slot, scene, camera, lights) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log::error!("Frame {} failed: {}", slot.frame, err);
                self.ring.abandon(slot);
                Err(err)
            }
        }
    }

    fn record_frame(
        &mut self,
        slot: FrameSlot,
        scene: &dyn SceneProvider,
        camera: &dyn CameraProvider,
        lights: &dyn LightProvider,
    ) -> RendererResult<FrameOutcome> {
        self.ring.check_writable(slot.index)?;

        let (Some(geometry), Some(frame_graph)) = (&self.geometry, &mut self.frame_graph) else {
            return Err(RendererError::NotInitialized);
        };
        let drawables = geometry.table.len();
        scene.write_transforms(&mut self.transform_scratch);
        if self.transform_scratch.len() != drawables as usize {
            return Err(RendererError::InvalidConfig(format!(
                "scene has {} drawables but geometry was built for {}; call rebuild_geometry",
                self.transform_scratch.len(),
                drawables
            )));
        }

        let (light_records, directional, volumes) =
            pack_lights(lights.lights(), self.config.max_lights as usize);
        let sun = lights
            .lights()
            .iter()
            .filter(|l| l.is_directional())
            .find_map(|l| l.direction());
        let shadow_view_proj = match sun {
            Some(direction) if self.config.shadows => fit_directional_light(camera, direction).view_proj,
            _ => Mat4::IDENTITY,
        };
        let mut flags = 0;
        if self.config.shadows && directional > 0 {
            flags |= FrameUniforms::FLAG_SHADOWS;
        }
        if self.config.render_mode == RenderMode::Deferred {
            flags |= FrameUniforms::FLAG_ALPHA_TEST;
        }

        let view = camera.view();
        let proj = camera.projection();
        let view_proj = proj * view;
        let uniforms = FrameUniforms {
            view,
            proj,
            view_proj,
            inv_view: view.inverse(),
            shadow_view_proj,
            camera_position: camera.position().extend(1.0),
            ambient: Vec4::from_array(self.config.ambient),
            frustum: frustum_planes(view_proj),
            counts: UVec4::new(directional, volumes, drawables, flags),
            frame: UVec4::new(slot.frame as u32, slot.index as u32, self.width, self.height),
        };

        let backend = self.gfx.backend_mut();
        self.frame_uniforms
            .write(backend, slot.index, bytemuck::bytes_of(&uniforms));
        geometry
            .transforms
            .write(backend, slot.index, bytemuck::cast_slice(&self.transform_scratch));
        if !light_records.is_empty() {
            self.lights
                .write(backend, slot.index, bytemuck::cast_slice(&light_records));
        }

        let surface = match backend.acquire_surface() {
            Ok(surface) => surface,
            Err(err) if err.is_frame_recoverable() => {
                log::warn!("Dropping frame {}: {}", slot.frame, err);
                self.ring.abandon(slot);
                return Ok(FrameOutcome::Dropped);
            }
            Err(err) => return Err(err.into()),
        };
        frame_graph
            .executor
            .set_external_view(frame_graph.resources.surface, surface.swapchain_view);

        let state = FrameState {
            frame_index: slot.frame,
            slot: slot.index,
            width: self.width,
            height: self.height,
            drawable_count: drawables,
            directional_lights: directional,
            point_lights: volumes,
        };
        self.gfx
            .backend_mut()
            .begin_encoding(&format!("Frame {}", slot.frame));
        frame_graph
            .executor
            .execute(&frame_graph.graph, &frame_graph.compiled, &mut self.gfx, &state);

        let backend = self.gfx.backend_mut();
        let submission = backend.submit(Some(self.ring.completion_handler(slot)))?;
        self.ring.mark_submitted(slot, submission);
        backend.present();
        self.ring.advance();

        log::trace!(
            "Frame {} submitted from slot {} ({} drawables, {} lights)",
            slot.frame,
            slot.index,
            drawables,
            directional + volumes
        );
        Ok(FrameOutcome::Presented(FrameStats {
            frame_index: slot.frame,
            slot: slot.index,
            submission,
            drawables,
            directional_lights: directional,
            volume_lights: volumes,
        }))
    }

    /// Resize the surface and rebuild every intermediate target at the new size
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.gfx.backend_mut().resize(width, height);
        let (width, height) = self.gfx.backend().surface_size();
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        self.width = width;
        self.height = height;
        log::debug!("Renderer resized to {}x{}", width, height);
        self.rebuild_graph()
    }

    /// Switch between deferred and forward shading
    pub fn set_render_mode(&mut self, mode: RenderMode) -> RendererResult<()> {
        if self.config.render_mode == mode {
            return Ok(());
        }
        self.config.render_mode = mode;
        log::info!("Render mode set to {:?}", mode);
        self.rebuild_graph()
    }

    fn rebuild_graph(&mut self) -> RendererResult<()> {
        let Some(mut frame_graph) = self.frame_graph.take() else {
            return Ok(());
        };
        let backend = self.gfx.backend_mut();
        backend.poll(true);
        frame_graph.executor.cleanup(backend);
        self.build_graph()
    }

    pub fn context(&self) -> &GraphicsContext {
        &self.gfx
    }

    pub fn context_mut(&mut self) -> &mut GraphicsContext {
        &mut self.gfx
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn heap(&self) -> &TextureHeap {
        &self.heap
    }

    pub fn frame_ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn descriptor_table(&self) -> Option<&DescriptorTable> {
        self.geometry.as_ref().map(|g| &g.table)
    }

    pub fn command_buffer(&self) -> Option<&IndirectCommandBuffer> {
        self.geometry.as_ref().map(|g| &g.icb)
    }

    pub fn frame_uniform_buffers(&self) -> &[BufferHandle] {
        self.frame_uniforms.buffers()
    }

    pub fn frame_resources(&self) -> Option<&FrameResources> {
        self.frame_graph.as_ref().map(|g| &g.resources)
    }

    /// Texture allocated for a graph resource such as a G-buffer target
    pub fn graph_texture(&self, resource: crate::render_graph::ResourceId) -> Option<TextureHandle> {
        self.frame_graph
            .as_ref()
            .and_then(|g| g.executor.texture(resource))
    }

    /// Pass names in execution order
    pub fn pass_order(&self) -> Vec<String> {
        self.frame_graph
            .as_ref()
            .map(|g| g.graph.ordered_names(&g.compiled))
            .unwrap_or_default()
    }

    pub fn drawable_count(&self) -> u32 {
        self.geometry.as_ref().map_or(0, |g| g.table.len())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.teardown();
        let backend = self.gfx.backend_mut();
        self.heap.destroy(backend);
        self.frame_uniforms.destroy(backend);
        self.lights.destroy(backend);
        self.light_volume.destroy(backend);
        backend.destroy_texture(self.placeholder.texture);
    }
}

//! wgpu backend implementation
//!
//! Render and compute commands are buffered while a pass is open and replayed into a
//! real wgpu pass when it ends, so pass recording can go through `&mut self` without
//! holding wgpu pass lifetimes across trait calls.

mod convert;

use crate::backend::traits::*;
use crate::backend::types::*;
use std::any::Any;
use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU64};
use std::ops::Range;
use std::sync::{mpsc, Arc};

/// Placement alignment used for emulated heaps.
pub const WGPU_HEAP_ALIGNMENT: u64 = 64 * 1024;

/// Features the GPU-driven path cannot run without
const REQUIRED_FEATURES: wgpu::Features = wgpu::Features::INDIRECT_FIRST_INSTANCE
    .union(wgpu::Features::TEXTURE_BINDING_ARRAY)
    .union(wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING);

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    SetStencilReference(u32),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    DrawIndexedIndirect { buffer: BufferHandle, offset: u64, count: u32 },
}

/// Buffered compute pass command
#[derive(Clone)]
enum ComputeCommand {
    SetPipeline(ComputePipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
}

/// Pending compute pass with buffered commands
struct PendingComputePass {
    label: Option<String>,
    commands: Vec<ComputeCommand>,
}

/// wgpu has no placement heaps; this tracks capacity and placements so heap
/// accounting behaves the same as on backends that do.
struct EmulatedHeap {
    size: u64,
    placed: Vec<(Range<u64>, u64)>,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    current_texture: Option<wgpu::SurfaceTexture>,
    current_view_id: u64,
    capabilities: BackendCapabilities,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, wgpu::Texture>,
    texture_views: HashMap<u64, wgpu::TextureView>,
    samplers: HashMap<u64, wgpu::Sampler>,
    heaps: HashMap<u64, EmulatedHeap>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    compute_pipelines: HashMap<u64, wgpu::ComputePipeline>,
    submissions: HashMap<u64, wgpu::SubmissionIndex>,

    next_id: u64,
    next_submission: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    encoder_label: String,
    pending_render_pass: Option<PendingRenderPass>,
    pending_compute_pass: Option<PendingComputePass>,
}

impl WgpuBackend {
    /// Create a backend rendering into `window`, blocking on adapter and device requests.
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let available = adapter.features();
        if !available.contains(REQUIRED_FEATURES) {
            return Err(BackendError::InitializationFailed(format!(
                "adapter lacks required features {:?}",
                REQUIRED_FEATURES - available
            )));
        }
        let multi_draw = available.contains(wgpu::Features::MULTI_DRAW_INDIRECT);
        let mut required_features = REQUIRED_FEATURES;
        if multi_draw {
            required_features |= wgpu::Features::MULTI_DRAW_INDIRECT;
        } else {
            log::warn!("MULTI_DRAW_INDIRECT unavailable, indirect replay falls back to single draws");
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("GPU-Driven Device"),
                    required_features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| BackendError::SurfaceCreationFailed("surface has no formats".into()))?;

        let max_size = device.limits().max_texture_dimension_2d;
        let (width, height) = clamp_extent(size.width, size.height, max_size);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let capabilities = BackendCapabilities {
            multi_draw_indirect: multi_draw,
            indirect_first_instance: true,
            texture_binding_array: true,
            max_texture_dimension: max_size,
            heap_alignment: WGPU_HEAP_ALIGNMENT,
        };

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            current_texture: None,
            current_view_id: 0,
            capabilities,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            heaps: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            submissions: HashMap::new(),
            next_id: 1,
            next_submission: 1,
            encoder: None,
            encoder_label: String::new(),
            pending_render_pass: None,
            pending_compute_pass: None,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            log::warn!("WgpuBackend: recording outside begin_encoding, opening implicit encoder");
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Implicit Encoder"),
            })
        })
    }

    fn push_render(&mut self, command: RenderCommand) {
        match self.pending_render_pass.as_mut() {
            Some(pending) => pending.commands.push(command),
            None => log::error!("WgpuBackend: render command outside a render pass"),
        }
    }

    fn push_compute(&mut self, command: ComputeCommand) {
        match self.pending_compute_pass.as_mut() {
            Some(pending) => pending.commands.push(command),
            None => log::error!("WgpuBackend: compute command outside a compute pass"),
        }
    }

    fn image_copy<'a>(
        texture: &'a wgpu::Texture,
        subresource: TextureSubresource,
    ) -> wgpu::ImageCopyTexture<'a> {
        wgpu::ImageCopyTexture {
            texture,
            mip_level: subresource.mip_level,
            origin: wgpu::Origin3d {
                x: 0,
                y: 0,
                z: subresource.array_layer,
            },
            aspect: wgpu::TextureAspect::All,
        }
    }

    fn mip_extent(texture: &wgpu::Texture, mip_level: u32) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: (texture.width() >> mip_level).max(1),
            height: (texture.height() >> mip_level).max(1),
            depth_or_array_layers: 1,
        }
    }

    /// Map a MAP_READ buffer and copy its contents out, blocking until the GPU is done.
    fn map_and_read(&self, staging: &wgpu::Buffer) -> BackendResult<Vec<u8>> {
        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn end_render_pass_inner(&mut self, pending: PendingRenderPass) {
        let swapchain_view: Option<wgpu::TextureView> = self
            .current_texture
            .as_ref()
            .map(|tex| tex.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let current_view_id = self.current_view_id;
        let multi_draw = self.capabilities.multi_draw_indirect;

        let Some(mut encoder) = self.encoder.take() else {
            log::error!("WgpuBackend: render pass ended without an encoder");
            return;
        };

        {
            let views = &self.texture_views;
            let resolve = |id: u64| -> Option<&wgpu::TextureView> {
                if id == current_view_id {
                    swapchain_view.as_ref()
                } else {
                    views.get(&id)
                }
            };

            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
                .descriptor
                .color_attachments
                .iter()
                .map(|att| {
                    resolve(att.view.0).map(|view| wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: att.resolve_target.and_then(|r| resolve(r.0)),
                        ops: wgpu::Operations {
                            load: convert::load_color(&att.load_op),
                            store: convert::store_op(att.store_op),
                        },
                    })
                })
                .collect();

            let depth_attachment = pending
                .descriptor
                .depth_stencil_attachment
                .as_ref()
                .and_then(|att| {
                    let view = resolve(att.view.0)?;
                    Some(wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: (!att.depth_read_only).then(|| wgpu::Operations {
                            load: match att.depth_load_op {
                                LoadOp::Clear(_) => wgpu::LoadOp::Clear(att.depth_clear_value),
                                LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: convert::store_op(att.depth_store_op),
                        }),
                        stencil_ops: att.stencil.map(|s| wgpu::Operations {
                            load: match s.clear_value {
                                Some(value) => wgpu::LoadOp::Clear(value),
                                None => wgpu::LoadOp::Load,
                            },
                            store: convert::store_op(s.store_op),
                        }),
                    })
                });

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for cmd in &pending.commands {
                match cmd {
                    RenderCommand::SetPipeline(handle) => {
                        if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                            render_pass.set_pipeline(pipeline);
                        }
                    }
                    RenderCommand::SetBindGroup { index, bind_group } => {
                        if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                            render_pass.set_bind_group(*index, bg, &[]);
                        }
                    }
                    RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            render_pass.set_vertex_buffer(*slot, buf.slice(*offset..));
                        }
                    }
                    RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            render_pass
                                .set_index_buffer(buf.slice(*offset..), convert::index_format(*format));
                        }
                    }
                    RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth } => {
                        render_pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth);
                    }
                    RenderCommand::SetStencilReference(reference) => {
                        render_pass.set_stencil_reference(*reference);
                    }
                    RenderCommand::Draw { vertices, instances } => {
                        render_pass.draw(vertices.clone(), instances.clone());
                    }
                    RenderCommand::DrawIndexed { indices, base_vertex, instances } => {
                        render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                    RenderCommand::DrawIndexedIndirect { buffer, offset, count } => {
                        let Some(buf) = self.buffers.get(&buffer.0) else {
                            continue;
                        };
                        if multi_draw {
                            render_pass.multi_draw_indexed_indirect(buf, *offset, *count);
                        } else {
                            let stride =
                                std::mem::size_of::<wgpu::util::DrawIndexedIndirectArgs>() as u64;
                            for i in 0..*count as u64 {
                                render_pass.draw_indexed_indirect(buf, offset + i * stride);
                            }
                        }
                    }
                }
            }
        }

        self.encoder = Some(encoder);
    }

    fn end_compute_pass_inner(&mut self, pending: PendingComputePass) {
        let Some(encoder) = self.encoder.as_mut() else {
            log::error!("WgpuBackend: compute pass ended without an encoder");
            return;
        };
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: pending.label.as_deref(),
            timestamp_writes: None,
        });
        for cmd in &pending.commands {
            match cmd {
                ComputeCommand::SetPipeline(handle) => {
                    if let Some(pipeline) = self.compute_pipelines.get(&handle.0) {
                        compute_pass.set_pipeline(pipeline);
                    }
                }
                ComputeCommand::SetBindGroup { index, bind_group } => {
                    if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                        compute_pass.set_bind_group(*index, bg, &[]);
                    }
                }
                ComputeCommand::Dispatch { x, y, z } => {
                    compute_pass.dispatch_workgroups(*x, *y, *z);
                }
            }
        }
    }
}

/// Clamp to device limits while keeping the aspect ratio
fn clamp_extent(width: u32, height: u32, max_size: u32) -> (u32, u32) {
    if width > max_size || height > max_size {
        let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
        (
            ((width as f32 * scale) as u32).max(1),
            ((height as f32 * scale) as u32).max(1),
        )
    } else {
        (width.max(1), height.max(1))
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            let (width, height) =
                clamp_extent(width, height, self.device.limits().max_texture_dimension_2d);
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn surface_format(&self) -> TextureFormat {
        convert::texture_format_back(self.surface_config.format)
    }

    fn acquire_surface(&mut self) -> BackendResult<FrameContext> {
        let output = self
            .surface
            .get_current_texture()
            .map_err(convert::surface_error)?;

        // The swapchain view is created when a pass references this id
        self.current_view_id = self.alloc_id();
        self.current_texture = Some(output);

        Ok(FrameContext {
            swapchain_view: TextureViewHandle(self.current_view_id),
            width: self.surface_config.width,
            height: self.surface_config.height,
        })
    }

    fn present(&mut self) {
        if let Some(texture) = self.current_texture.take() {
            texture.present();
        }
    }

    fn begin_encoding(&mut self, label: &str) {
        if self.encoder.is_some() {
            log::warn!("WgpuBackend: begin_encoding discards an unsubmitted encoder");
        }
        self.encoder_label = label.to_string();
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) }),
        );
    }

    fn submit(&mut self, on_complete: Option<CompletionCallback>) -> BackendResult<SubmissionId> {
        if self.pending_render_pass.is_some() || self.pending_compute_pass.is_some() {
            return Err(BackendError::CommandEncodingFailed(format!(
                "'{}' submitted with an open pass",
                self.encoder_label
            )));
        }
        let encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Empty") })
        });
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(on_complete) = on_complete {
            self.queue.on_submitted_work_done(on_complete);
        }

        let id = self.next_submission;
        self.next_submission += 1;
        self.submissions.insert(id, index);
        Ok(SubmissionId(id))
    }

    fn abandon_encoding(&mut self) {
        self.pending_render_pass = None;
        self.pending_compute_pass = None;
        self.encoder = None;
    }

    fn poll(&mut self, wait: bool) {
        self.device.poll(if wait {
            wgpu::Maintain::Wait
        } else {
            wgpu::Maintain::Poll
        });
        if wait {
            self.submissions.clear();
        }
    }

    fn wait_for_submission(&mut self, submission: SubmissionId) {
        let finished: Vec<u64> = self
            .submissions
            .keys()
            .copied()
            .filter(|&id| id <= submission.0)
            .collect();
        if let Some(index) = self.submissions.get(&submission.0).cloned() {
            self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
        for id in finished {
            self.submissions.remove(&id);
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: convert::buffer_usage(desc.usage),
            mapped_at_creation: desc.mapped_at_creation,
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        use wgpu::util::DeviceExt;
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: desc.label.as_deref(),
                contents: data,
                usage: convert::buffer_usage(desc.usage),
            });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(buf) = self.buffers.get(&buffer.0) {
            self.queue.write_buffer(buf, offset, data);
        }
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        let source = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let size = source.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.map_and_read(&staging)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: convert::texture_format(desc.format),
            usage: convert::texture_usage(desc.usage),
            view_formats: &[],
        });
        let id = self.alloc_id();
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let view = tex.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc_id();
        self.texture_views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, subresource: TextureSubresource, data: &[u8]) {
        let Some(tex) = self.textures.get(&texture.0) else {
            log::error!("WgpuBackend: write to unknown texture {:?}", texture);
            return;
        };
        let extent = Self::mip_extent(tex, subresource.mip_level);
        let bytes_per_pixel = data.len() as u32 / (extent.width * extent.height).max(1);
        self.queue.write_texture(
            Self::image_copy(tex, subresource),
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(extent.width * bytes_per_pixel),
                rows_per_image: Some(extent.height),
            },
            extent,
        );
    }

    fn read_texture(
        &mut self,
        texture: TextureHandle,
        subresource: TextureSubresource,
    ) -> BackendResult<Vec<u8>> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        if tex.format().has_stencil_aspect() {
            return Err(BackendError::ReadbackFailed(
                "depth-stencil textures cannot be read back whole".into(),
            ));
        }
        let bytes_per_pixel = tex.format().block_copy_size(None).ok_or_else(|| {
            BackendError::ReadbackFailed(format!("{:?} has no copy size", tex.format()))
        })?;
        let extent = Self::mip_extent(tex, subresource.mip_level);
        let row = extent.width * bytes_per_pixel;
        let padded_row = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Texture Readback Staging"),
            size: padded_row as u64 * extent.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
        encoder.copy_texture_to_buffer(
            Self::image_copy(tex, subresource),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(extent.height),
                },
            },
            extent,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let padded = self.map_and_read(&staging)?;
        Ok(padded
            .chunks_exact(padded_row as usize)
            .flat_map(|r| &r[..row as usize])
            .copied()
            .collect())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&convert::sampler_descriptor(desc));
        let id = self.alloc_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn heap_texture_requirements(&self, desc: &TextureDescriptor) -> HeapSizeAndAlign {
        HeapSizeAndAlign {
            size: desc.footprint(),
            align: WGPU_HEAP_ALIGNMENT,
        }
    }

    fn create_heap(&mut self, desc: &HeapDescriptor) -> BackendResult<HeapHandle> {
        if desc.size == 0 {
            return Err(BackendError::HeapCreationFailed("zero-sized heap".into()));
        }
        log::debug!("WgpuBackend: heap {:?} of {} bytes", desc.label, desc.size);
        let id = self.alloc_id();
        self.heaps.insert(
            id,
            EmulatedHeap {
                size: desc.size,
                placed: Vec::new(),
            },
        );
        Ok(HeapHandle(id))
    }

    fn create_heap_texture(
        &mut self,
        heap: HeapHandle,
        offset: u64,
        desc: &TextureDescriptor,
    ) -> BackendResult<TextureHandle> {
        let requirements = self.heap_texture_requirements(desc);
        let range = offset..offset + requirements.size;
        let target = self
            .heaps
            .get(&heap.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", heap)))?;
        if offset % requirements.align != 0 || range.end > target.size {
            return Err(BackendError::OutOfMemory);
        }
        let texture = self.create_texture(desc)?;
        if let Some(target) = self.heaps.get_mut(&heap.0) {
            target.placed.push((range, texture.0));
        }
        Ok(texture)
    }

    fn destroy_heap(&mut self, heap: HeapHandle) {
        if let Some(removed) = self.heaps.remove(&heap.0) {
            for (_, texture) in removed.placed {
                if let Some(tex) = self.textures.remove(&texture) {
                    tex.destroy();
                }
            }
        }
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|e| wgpu::BindGroupLayoutEntry {
                binding: e.binding,
                visibility: convert::shader_stages(e.visibility),
                ty: convert::binding_type(&e.ty),
                count: e.count.and_then(NonZeroU32::new),
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &wgpu_entries,
            });
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_ref = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::BindGroupCreationFailed("Layout not found".into()))?;

        let arrays: Vec<Vec<&wgpu::TextureView>> = entries
            .iter()
            .map(|(_, entry)| match entry {
                BindGroupEntry::TextureArray(views) => views
                    .iter()
                    .filter_map(|v| self.texture_views.get(&v.0))
                    .collect(),
                _ => Vec::new(),
            })
            .collect();

        let mut wgpu_entries = Vec::with_capacity(entries.len());
        for ((binding, entry), array) in entries.iter().zip(arrays.iter()) {
            let missing = || BackendError::BindGroupCreationFailed(format!("binding {}", binding));
            let resource = match entry {
                BindGroupEntry::Buffer { buffer, offset, size } => {
                    let buf = self.buffers.get(&buffer.0).ok_or_else(missing)?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: buf,
                        offset: *offset,
                        size: size.and_then(NonZeroU64::new),
                    })
                }
                BindGroupEntry::Texture(view) | BindGroupEntry::StorageTexture(view) => {
                    wgpu::BindingResource::TextureView(
                        self.texture_views.get(&view.0).ok_or_else(missing)?,
                    )
                }
                BindGroupEntry::TextureArray(_) => {
                    wgpu::BindingResource::TextureViewArray(array.as_slice())
                }
                BindGroupEntry::Sampler(sampler) => {
                    wgpu::BindingResource::Sampler(self.samplers.get(&sampler.0).ok_or_else(missing)?)
                }
            };
            wgpu_entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: layout_ref,
            entries: &wgpu_entries,
        });
        let id = self.alloc_id();
        self.bind_groups.insert(id, bind_group);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.program),
                source: wgpu::ShaderSource::Wgsl(desc.source.as_str().into()),
            });

        let layouts: Vec<&wgpu::BindGroupLayout> = desc
            .bind_group_layouts
            .iter()
            .filter_map(|h| self.bind_group_layouts.get(&h.0))
            .collect();
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&desc.program),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });

        let vertex_attrs: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: convert::vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(vertex_attrs.iter())
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: match layout.step_mode {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes: attrs,
            })
            .collect();
        let color_targets: Vec<Option<wgpu::ColorTargetState>> =
            desc.color_targets.iter().map(convert::color_target).collect();

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: &desc.vertex_entry,
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: desc.fragment_entry.as_ref().map(|entry| wgpu::FragmentState {
                    module: &shader,
                    entry_point: entry,
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: convert::primitive_state(desc),
                depth_stencil: desc.depth_stencil.as_ref().map(convert::depth_stencil_state),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        let id = self.alloc_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.program),
                source: wgpu::ShaderSource::Wgsl(desc.source.as_str().into()),
            });
        let layouts: Vec<&wgpu::BindGroupLayout> = desc
            .bind_group_layouts
            .iter()
            .filter_map(|h| self.bind_group_layouts.get(&h.0))
            .collect();
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&desc.program),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: &desc.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        let id = self.alloc_id();
        self.compute_pipelines.insert(id, pipeline);
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        if let Some(pending) = self.pending_render_pass.take() {
            self.end_render_pass_inner(pending);
        }
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.pending_compute_pass = Some(PendingComputePass {
            label: label.map(|s| s.to_string()),
            commands: Vec::new(),
        });
    }

    fn end_compute_pass(&mut self) {
        if let Some(pending) = self.pending_compute_pass.take() {
            self.end_compute_pass_inner(pending);
        }
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        if size == 0 {
            return;
        }
        self.encoder();
        let (Some(src), Some(dst), Some(encoder)) = (
            self.buffers.get(&src.0),
            self.buffers.get(&dst.0),
            self.encoder.as_mut(),
        ) else {
            log::error!("WgpuBackend: buffer copy with unknown buffer");
            return;
        };
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
    }

    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        subresource: TextureSubresource,
    ) {
        self.encoder();
        let (Some(src), Some(dst), Some(encoder)) = (
            self.textures.get(&src.0),
            self.textures.get(&dst.0),
            self.encoder.as_mut(),
        ) else {
            log::error!("WgpuBackend: texture copy with unknown texture");
            return;
        };
        encoder.copy_texture_to_texture(
            Self::image_copy(src, subresource),
            Self::image_copy(dst, subresource),
            Self::mip_extent(src, subresource.mip_level),
        );
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        // wgpu derives transitions from usage tracking
        for barrier in barriers {
            log::trace!(
                "WgpuBackend: {:?} {:?} -> {:?}",
                barrier.target,
                barrier.before,
                barrier.after
            );
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.push_render(RenderCommand::SetPipeline(pipeline));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.push_compute(ComputeCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        if self.pending_render_pass.is_some() {
            self.push_render(RenderCommand::SetBindGroup { index, bind_group });
        } else {
            self.push_compute(ComputeCommand::SetBindGroup { index, bind_group });
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.push_render(RenderCommand::SetVertexBuffer { slot, buffer, offset });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.push_render(RenderCommand::SetIndexBuffer { buffer, offset, format });
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.push_render(RenderCommand::SetViewport {
            x,
            y,
            width,
            height,
            min_depth,
            max_depth,
        });
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.push_render(RenderCommand::SetStencilReference(reference));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.push_render(RenderCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.push_render(RenderCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32) {
        self.push_render(RenderCommand::DrawIndexedIndirect {
            buffer,
            offset,
            count,
        });
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.push_compute(ComputeCommand::Dispatch { x, y, z });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            for heap in self.heaps.values_mut() {
                heap.placed.retain(|(_, t)| *t != texture.0);
            }
            tex.destroy();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//! Headless CPU backend for testing and CI.
//!
//! This backend keeps every buffer and texture in host memory and executes recorded
//! command streams on the CPU: copies move bytes, indirect draws read their arguments
//! from buffer memory at execution time, and compute dispatches run host kernels
//! registered under the program's name. Nothing is rasterized; draws and passes are
//! recorded into an [`ExecutionTrace`] instead.
//!
//! Host buffer writes land immediately, like shared-storage memory on a unified
//! memory device. In [`ExecutionMode::Deferred`] submitted work only runs when it is
//! polled or waited on, so a host write racing in-flight work is observable.

mod kernel;
mod trace;

pub use kernel::{HostKernel, KernelInvocation};
pub use trace::{DrawKind, DrawRecord, ExecutionTrace, PassKind, TraceEvent};

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::gpu_driven::commands::DrawIndexedIndirectArgs;
use kernel::KernelBinding;

/// Placement alignment of textures inside a headless heap.
pub const HEADLESS_HEAP_ALIGNMENT: u64 = 256;

/// When submitted work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Work runs inside `submit`
    #[default]
    Immediate,
    /// Work runs when polled with `wait`, waited on, or read back
    Deferred,
}

#[derive(Debug)]
pub(crate) struct HeadlessBuffer {
    pub label: Option<String>,
    pub usage: BufferUsage,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessTexture {
    desc: TextureDescriptor,
    /// Indexed by `array_layer * mip_levels + mip_level`
    subresources: Vec<Vec<u8>>,
    /// Last submission that rendered into this texture; host writes reset it
    last_written: Option<SubmissionId>,
    heap: Option<u64>,
}

impl HeadlessTexture {
    fn new(desc: &TextureDescriptor, heap: Option<u64>) -> Self {
        let mut subresources = Vec::with_capacity((desc.mip_levels * desc.array_layers) as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                subresources.push(vec![0u8; desc.subresource_size(mip) as usize]);
            }
        }
        Self {
            desc: desc.clone(),
            subresources,
            last_written: None,
            heap,
        }
    }

    fn index(&self, subresource: TextureSubresource) -> Option<usize> {
        (subresource.mip_level < self.desc.mip_levels
            && subresource.array_layer < self.desc.array_layers)
            .then(|| (subresource.array_layer * self.desc.mip_levels + subresource.mip_level) as usize)
    }
}

#[derive(Debug)]
struct HeadlessHeap {
    size: u64,
    placed: Vec<(Range<u64>, u64)>,
}

#[derive(Debug, Clone)]
enum Command {
    BeginRenderPass(RenderPassDescriptor),
    EndRenderPass,
    BeginComputePass(Option<String>),
    EndComputePass,
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
        subresource: TextureSubresource,
    },
    Barrier(Vec<ResourceBarrier>),
    SetRenderPipeline(RenderPipelineHandle),
    SetComputePipeline(ComputePipelineHandle),
    SetBindGroup(u32, BindGroupHandle),
    SetVertexBuffer(BufferHandle),
    SetIndexBuffer(BufferHandle, u64, IndexFormat),
    SetStencilReference(u32),
    Draw(Range<u32>, Range<u32>),
    DrawIndexed(Range<u32>, i32, Range<u32>),
    DrawIndexedIndirect(BufferHandle, u64, u32),
    Dispatch([u32; 3]),
}

struct Recording {
    label: String,
    commands: Vec<Command>,
}

struct PendingSubmission {
    id: SubmissionId,
    label: String,
    commands: Vec<Command>,
    on_complete: Option<CompletionCallback>,
}

/// State tracked while executing one command stream
#[derive(Default)]
struct ExecState {
    pass: Option<String>,
    render_pipeline: Option<u64>,
    compute_pipeline: Option<u64>,
    bind_groups: HashMap<u32, u64>,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<(BufferHandle, u64, IndexFormat)>,
    stencil_reference: u32,
    attachments: Vec<u64>,
}

/// Headless CPU backend.
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    surface_format: TextureFormat,
    surface_texture: TextureHandle,
    surface_view: TextureViewHandle,
    capabilities: BackendCapabilities,
    mode: ExecutionMode,

    next_id: u64,
    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, HeadlessTexture>,
    views: HashMap<u64, u64>,
    samplers: HashMap<u64, SamplerDescriptor>,
    heaps: HashMap<u64, HeadlessHeap>,
    layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashMap<u64, Vec<(u32, BindGroupEntry)>>,
    render_pipelines: HashMap<u64, String>,
    compute_pipelines: HashMap<u64, (String, HostKernel)>,
    kernels: HashMap<String, HostKernel>,

    recording: Option<Recording>,
    pending: VecDeque<PendingSubmission>,
    next_submission: u64,
    last_completed: Option<SubmissionId>,
    presented: u64,
    surface_faults: VecDeque<BackendError>,
    trace: ExecutionTrace,
}

impl HeadlessBackend {
    /// Create a headless backend with an sRGB surface of the given size.
    ///
    /// The command synthesis kernel is registered by default.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            width: width.max(1),
            height: height.max(1),
            surface_format: TextureFormat::Rgba8UnormSrgb,
            surface_texture: TextureHandle(0),
            surface_view: TextureViewHandle(0),
            capabilities: BackendCapabilities {
                multi_draw_indirect: true,
                indirect_first_instance: true,
                texture_binding_array: true,
                max_texture_dimension: 16384,
                heap_alignment: HEADLESS_HEAP_ALIGNMENT,
            },
            mode: ExecutionMode::Immediate,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            heaps: HashMap::new(),
            layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            kernels: HashMap::new(),
            recording: None,
            pending: VecDeque::new(),
            next_submission: 1,
            last_completed: None,
            presented: 0,
            surface_faults: VecDeque::new(),
            trace: ExecutionTrace::default(),
        };
        backend.create_surface();
        backend.register_kernel(
            crate::gpu_driven::synthesis::ENCODE_COMMANDS_PROGRAM,
            crate::gpu_driven::synthesis::encode_commands_host,
        );
        log::debug!("HeadlessBackend: created {}x{} surface", width, height);
        backend
    }

    /// Switch between immediate and deferred execution.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override reported capabilities, e.g. to exercise the single-draw replay path.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Register a host implementation for a compute program.
    pub fn register_kernel(&mut self, program: &str, kernel: HostKernel) {
        self.kernels.insert(program.to_string(), kernel);
    }

    /// Make the next `acquire_surface` fail with `error`; queued faults fire in order.
    pub fn fail_next_acquire(&mut self, error: BackendError) {
        self.surface_faults.push_back(error);
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut ExecutionTrace {
        &mut self.trace
    }

    /// Submissions recorded but not yet executed
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    pub fn last_completed(&self) -> Option<SubmissionId> {
        self.last_completed
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    /// Texture a view was created from
    pub fn view_texture(&self, view: TextureViewHandle) -> Option<TextureHandle> {
        self.views.get(&view.0).map(|&t| TextureHandle(t))
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    /// Heap a texture was placed in, if any
    pub fn texture_heap(&self, texture: TextureHandle) -> Option<HeapHandle> {
        self.textures
            .get(&texture.0)
            .and_then(|t| t.heap)
            .map(HeapHandle)
    }

    pub fn heap_size(&self, heap: HeapHandle) -> Option<u64> {
        self.heaps.get(&heap.0).map(|h| h.size)
    }

    /// Submission that last rendered into a texture
    pub fn texture_last_written(&self, texture: TextureHandle) -> Option<SubmissionId> {
        self.textures.get(&texture.0).and_then(|t| t.last_written)
    }

    pub fn buffer_exists(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(&buffer.0)
    }

    pub fn texture_exists(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture.0)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_surface(&mut self) {
        let desc = TextureDescriptor {
            label: Some("Headless Surface".into()),
            width: self.width,
            height: self.height,
            format: self.surface_format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
            ..Default::default()
        };
        let texture = self.alloc_id();
        self.textures.insert(texture, HeadlessTexture::new(&desc, None));
        let view = self.alloc_id();
        self.views.insert(view, texture);
        self.surface_texture = TextureHandle(texture);
        self.surface_view = TextureViewHandle(view);
    }

    fn record(&mut self, command: Command) {
        let recording = self.recording.get_or_insert_with(|| {
            log::warn!("HeadlessBackend: recording outside begin_encoding, opening implicit stream");
            Recording {
                label: "implicit".into(),
                commands: Vec::new(),
            }
        });
        recording.commands.push(command);
    }

    fn run_until(&mut self, target: Option<SubmissionId>) {
        while let Some(front) = self.pending.front() {
            if let Some(target) = target {
                if front.id > target {
                    break;
                }
            }
            if let Some(submission) = self.pending.pop_front() {
                self.execute(submission);
            }
        }
    }

    fn execute(&mut self, submission: PendingSubmission) {
        log::trace!(
            "HeadlessBackend: executing submission {:?} ({}, {} commands)",
            submission.id,
            submission.label,
            submission.commands.len()
        );
        let id = submission.id;
        let mut state = ExecState::default();
        for command in submission.commands {
            self.execute_command(id, &mut state, command);
        }
        self.last_completed = Some(id);
        if let Some(on_complete) = submission.on_complete {
            on_complete();
        }
    }

    fn execute_command(&mut self, id: SubmissionId, state: &mut ExecState, command: Command) {
        match command {
            Command::BeginRenderPass(desc) => self.begin_pass_exec(id, state, desc),
            Command::EndRenderPass => {
                for texture in state.attachments.drain(..) {
                    if let Some(tex) = self.textures.get_mut(&texture) {
                        tex.last_written = Some(id);
                    }
                }
                state.pass = None;
            }
            Command::BeginComputePass(label) => {
                let label = label.unwrap_or_else(|| "compute".into());
                self.trace.push(TraceEvent::BeginPass {
                    submission: id,
                    label: label.clone(),
                    kind: PassKind::Compute,
                    color_targets: Vec::new(),
                    depth_target: None,
                });
                state.pass = Some(label);
            }
            Command::EndComputePass => state.pass = None,
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let bytes = self.buffers.get(&src.0).and_then(|b| {
                    b.data
                        .get(src_offset as usize..(src_offset + size) as usize)
                        .map(<[u8]>::to_vec)
                });
                match (bytes, self.buffers.get_mut(&dst.0)) {
                    (Some(bytes), Some(target))
                        if (dst_offset + size) as usize <= target.data.len() =>
                    {
                        target.data[dst_offset as usize..(dst_offset + size) as usize]
                            .copy_from_slice(&bytes);
                    }
                    _ => log::error!(
                        "HeadlessBackend: buffer copy {:?} -> {:?} ({} bytes) out of range",
                        src,
                        dst,
                        size
                    ),
                }
                self.trace.push(TraceEvent::CopyBuffer {
                    submission: id,
                    src,
                    dst,
                    size,
                });
            }
            Command::CopyTexture {
                src,
                dst,
                subresource,
            } => {
                let bytes = self.textures.get(&src.0).and_then(|t| {
                    t.index(subresource).map(|i| t.subresources[i].clone())
                });
                match (bytes, self.textures.get_mut(&dst.0)) {
                    (Some(bytes), Some(target)) => match target.index(subresource) {
                        Some(i) if target.subresources[i].len() == bytes.len() => {
                            target.subresources[i] = bytes;
                        }
                        _ => log::error!(
                            "HeadlessBackend: texture copy {:?} -> {:?} subresource mismatch",
                            src,
                            dst
                        ),
                    },
                    _ => log::error!("HeadlessBackend: texture copy with unknown texture"),
                }
                self.trace.push(TraceEvent::CopyTexture {
                    submission: id,
                    src,
                    dst,
                });
            }
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.trace.push(TraceEvent::Barrier {
                        submission: id,
                        barrier,
                    });
                }
            }
            Command::SetRenderPipeline(p) => state.render_pipeline = Some(p.0),
            Command::SetComputePipeline(p) => state.compute_pipeline = Some(p.0),
            Command::SetBindGroup(index, group) => {
                state.bind_groups.insert(index, group.0);
            }
            Command::SetVertexBuffer(buffer) => state.vertex_buffer = Some(buffer),
            Command::SetIndexBuffer(buffer, offset, format) => {
                state.index_buffer = Some((buffer, offset, format))
            }
            Command::SetStencilReference(reference) => state.stencil_reference = reference,
            Command::Draw(vertices, instances) => {
                let record = self.draw_record(id, state, DrawKind::Direct, vertices, 0, instances);
                self.trace.push(TraceEvent::Draw(record));
            }
            Command::DrawIndexed(indices, base_vertex, instances) => {
                let record =
                    self.draw_record(id, state, DrawKind::Indexed, indices, base_vertex, instances);
                self.trace.push(TraceEvent::Draw(record));
            }
            Command::DrawIndexedIndirect(buffer, offset, count) => {
                let stride = std::mem::size_of::<DrawIndexedIndirectArgs>() as u64;
                for i in 0..count as u64 {
                    let start = (offset + i * stride) as usize;
                    let args = self
                        .buffers
                        .get(&buffer.0)
                        .and_then(|b| b.data.get(start..start + stride as usize))
                        .map(bytemuck::pod_read_unaligned::<DrawIndexedIndirectArgs>);
                    let Some(args) = args else {
                        log::error!("HeadlessBackend: indirect read past end of {:?}", buffer);
                        break;
                    };
                    let kind = DrawKind::Indirect {
                        buffer,
                        slot: (offset / stride + i) as u32,
                    };
                    let record = self.draw_record(
                        id,
                        state,
                        kind,
                        args.first_index..args.first_index + args.index_count,
                        args.base_vertex,
                        args.first_instance..args.first_instance + args.instance_count,
                    );
                    self.trace.push(TraceEvent::Draw(record));
                }
            }
            Command::Dispatch(workgroups) => self.dispatch_exec(id, state, workgroups),
        }
    }

    fn begin_pass_exec(&mut self, id: SubmissionId, state: &mut ExecState, desc: RenderPassDescriptor) {
        let mut color_targets = Vec::new();
        for attachment in &desc.color_attachments {
            let Some(&texture) = self.views.get(&attachment.view.0) else {
                continue;
            };
            if let LoadOp::Clear(color) = attachment.load_op {
                self.clear_texture(texture, |format| encode_clear_color(format, color));
            }
            color_targets.push(TextureHandle(texture));
            state.attachments.push(texture);
        }

        let mut depth_target = None;
        if let Some(depth) = &desc.depth_stencil_attachment {
            if let Some(&texture) = self.views.get(&depth.view.0) {
                if depth.depth_load_op != LoadOp::Load {
                    let value = depth.depth_clear_value;
                    let stencil = depth.stencil.and_then(|s| s.clear_value).unwrap_or(0);
                    self.clear_texture(texture, |format| encode_clear_depth(format, value, stencil));
                }
                depth_target = Some(TextureHandle(texture));
                if !depth.depth_read_only
                    || depth.stencil.map(|s| s.store_op == StoreOp::Store).unwrap_or(false)
                {
                    state.attachments.push(texture);
                }
            }
        }

        let label = desc.label.unwrap_or_else(|| "render".into());
        self.trace.push(TraceEvent::BeginPass {
            submission: id,
            label: label.clone(),
            kind: PassKind::Render,
            color_targets,
            depth_target,
        });
        state.pass = Some(label);
    }

    fn clear_texture(&mut self, texture: u64, encode: impl Fn(TextureFormat) -> Vec<u8>) {
        if let Some(tex) = self.textures.get_mut(&texture) {
            let texel = encode(tex.desc.format);
            if let Some(base) = tex.subresources.first_mut() {
                for chunk in base.chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
    }

    fn bound_buffers(&self, state: &ExecState) -> Vec<KernelBinding> {
        let mut bindings = Vec::new();
        let mut groups: Vec<_> = state.bind_groups.iter().collect();
        groups.sort();
        for (&group, bind_group) in groups {
            let Some(entries) = self.bind_groups.get(bind_group) else {
                continue;
            };
            for (binding, entry) in entries {
                if let BindGroupEntry::Buffer {
                    buffer,
                    offset,
                    size,
                } = entry
                {
                    bindings.push(KernelBinding {
                        group,
                        binding: *binding,
                        buffer: buffer.0,
                        offset: *offset,
                        size: *size,
                    });
                }
            }
        }
        bindings
    }

    fn bound_textures(&self, state: &ExecState) -> Vec<(TextureHandle, Option<SubmissionId>)> {
        let mut textures = Vec::new();
        let mut groups: Vec<_> = state.bind_groups.values().collect();
        groups.sort();
        for bind_group in groups {
            let Some(entries) = self.bind_groups.get(bind_group) else {
                continue;
            };
            for (_, entry) in entries {
                let views: &[TextureViewHandle] = match entry {
                    BindGroupEntry::Texture(view) => std::slice::from_ref(view),
                    BindGroupEntry::TextureArray(views) => views,
                    _ => &[],
                };
                for view in views {
                    if let Some(&texture) = self.views.get(&view.0) {
                        let written = self.textures.get(&texture).and_then(|t| t.last_written);
                        textures.push((TextureHandle(texture), written));
                    }
                }
            }
        }
        textures
    }

    fn draw_record(
        &self,
        id: SubmissionId,
        state: &ExecState,
        kind: DrawKind,
        elements: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    ) -> DrawRecord {
        let uniforms = self
            .bound_buffers(state)
            .into_iter()
            .filter_map(|b| {
                let buffer = self.buffers.get(&b.buffer)?;
                if !buffer.usage.contains(BufferUsage::UNIFORM) {
                    return None;
                }
                let start = b.offset as usize;
                let end = b.size.map(|s| start + s as usize).unwrap_or(buffer.data.len());
                Some((BufferHandle(b.buffer), buffer.data.get(start..end)?.to_vec()))
            })
            .collect();

        let indices = match kind {
            DrawKind::Direct => Vec::new(),
            _ => self.fetch_indices(state, elements.clone()),
        };

        DrawRecord {
            submission: id,
            pass: state.pass.clone().unwrap_or_default(),
            program: state
                .render_pipeline
                .and_then(|p| self.render_pipelines.get(&p).cloned())
                .unwrap_or_default(),
            kind,
            element_count: elements.end.saturating_sub(elements.start),
            first_element: elements.start,
            base_vertex,
            instance_count: instances.end.saturating_sub(instances.start),
            first_instance: instances.start,
            vertex_buffer: state.vertex_buffer,
            index_buffer: state.index_buffer.map(|(buffer, _, _)| buffer),
            indices,
            stencil_reference: state.stencil_reference,
            uniforms,
            sampled_textures: self.bound_textures(state),
        }
    }

    /// Index values an indexed draw reads through the bound buffer's offset and format
    fn fetch_indices(&self, state: &ExecState, elements: Range<u32>) -> Vec<u32> {
        let Some((buffer, offset, format)) = state.index_buffer else {
            log::error!("HeadlessBackend: indexed draw without an index buffer");
            return Vec::new();
        };
        let size = format.size();
        let start = (offset + elements.start as u64 * size) as usize;
        let end = (offset + elements.end as u64 * size) as usize;
        let Some(bytes) = self.buffers.get(&buffer.0).and_then(|b| b.data.get(start..end)) else {
            log::error!(
                "HeadlessBackend: indices {:?} past the end of {:?}",
                elements,
                buffer
            );
            return Vec::new();
        };
        match format {
            IndexFormat::Uint16 => bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                .collect(),
            IndexFormat::Uint32 => bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        }
    }

    fn dispatch_exec(&mut self, id: SubmissionId, state: &ExecState, workgroups: [u32; 3]) {
        let Some((program, kernel)) = state
            .compute_pipeline
            .and_then(|p| self.compute_pipelines.get(&p).cloned())
        else {
            log::error!("HeadlessBackend: dispatch without a compute pipeline");
            return;
        };
        let bindings = self.bound_buffers(state);
        let mut invocation = KernelInvocation {
            workgroups,
            bindings,
            buffers: &mut self.buffers,
        };
        kernel(&mut invocation);
        self.trace.push(TraceEvent::Dispatch {
            submission: id,
            program,
            workgroups,
        });
    }
}

/// Texel bytes for a clear color in the given format.
fn encode_clear_color(format: TextureFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            color.iter().map(|&c| unorm(c)).collect()
        }
        TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb => {
            [color[2], color[1], color[0], color[3]].iter().map(|&c| unorm(c)).collect()
        }
        TextureFormat::Rgba16Float => color
            .iter()
            .flat_map(|&c| f32_to_f16_bits(c).to_le_bytes())
            .collect(),
        TextureFormat::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        TextureFormat::R32Float => color[0].to_le_bytes().to_vec(),
        TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => {
            encode_clear_depth(format, color[0], 0)
        }
    }
}

/// Texel bytes for a depth/stencil clear.
fn encode_clear_depth(format: TextureFormat, depth: f32, stencil: u32) -> Vec<u8> {
    match format {
        TextureFormat::Depth24PlusStencil8 => {
            let depth = (depth.clamp(0.0, 1.0) * 0x00ff_ffff as f32) as u32;
            (depth | (stencil & 0xff) << 24).to_le_bytes().to_vec()
        }
        _ => depth.to_le_bytes().to_vec(),
    }
}

/// IEEE half-precision bits, rounding toward zero.
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;
    if exponent == 0xff {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1f {
        sign | 0x7c00
    } else if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x0080_0000;
        sign | (mantissa >> (14 - half_exponent)) as u16
    } else {
        sign | ((half_exponent as u16) << 10) | (mantissa >> 13) as u16
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.textures.remove(&self.surface_texture.0);
        self.views.remove(&self.surface_view.0);
        self.width = width;
        self.height = height;
        self.create_surface();
        log::debug!("HeadlessBackend: resized surface to {}x{}", width, height);
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn surface_format(&self) -> TextureFormat {
        self.surface_format
    }

    fn acquire_surface(&mut self) -> BackendResult<FrameContext> {
        if let Some(error) = self.surface_faults.pop_front() {
            log::debug!("HeadlessBackend: injected surface failure: {}", error);
            return Err(error);
        }
        Ok(FrameContext {
            swapchain_view: self.surface_view,
            width: self.width,
            height: self.height,
        })
    }

    fn present(&mut self) {
        self.presented += 1;
    }

    fn begin_encoding(&mut self, label: &str) {
        if self.recording.is_some() {
            log::warn!("HeadlessBackend: begin_encoding discards an unsubmitted stream");
        }
        self.recording = Some(Recording {
            label: label.to_string(),
            commands: Vec::new(),
        });
    }

    fn submit(&mut self, on_complete: Option<CompletionCallback>) -> BackendResult<SubmissionId> {
        let recording = self.recording.take().unwrap_or(Recording {
            label: "empty".into(),
            commands: Vec::new(),
        });
        let id = SubmissionId(self.next_submission);
        self.next_submission += 1;
        log::trace!(
            "HeadlessBackend: submit {:?} ({}, {} commands)",
            id,
            recording.label,
            recording.commands.len()
        );
        let submission = PendingSubmission {
            id,
            label: recording.label,
            commands: recording.commands,
            on_complete,
        };
        match self.mode {
            ExecutionMode::Immediate => self.execute(submission),
            ExecutionMode::Deferred => self.pending.push_back(submission),
        }
        Ok(id)
    }

    fn abandon_encoding(&mut self) {
        if let Some(recording) = self.recording.take() {
            log::debug!("HeadlessBackend: abandoned stream {}", recording.label);
        }
    }

    fn poll(&mut self, wait: bool) {
        if wait {
            self.run_until(None);
        }
    }

    fn wait_for_submission(&mut self, submission: SubmissionId) {
        self.run_until(Some(submission));
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                label: desc.label.clone(),
                usage: desc.usage,
                data: vec![0u8; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(&BufferDescriptor {
            size: desc.size.max(data.len() as u64),
            ..desc.clone()
        })?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffers.get_mut(&buffer.0) {
            Some(target) if offset as usize + data.len() <= target.data.len() => {
                target.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            }
            Some(target) => log::error!(
                "HeadlessBackend: write of {} bytes at {} overflows buffer {:?}",
                data.len(),
                offset,
                target.label
            ),
            None => log::error!("HeadlessBackend: write to unknown buffer {:?}", buffer),
        }
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        self.run_until(None);
        self.buffers
            .get(&buffer.0)
            .map(|b| b.data.clone())
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}, {} mips, {} layers)",
            desc.label,
            desc.width,
            desc.height,
            desc.mip_levels,
            desc.array_layers
        );
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has an empty extent",
                desc.label
            )));
        }
        let id = self.alloc_id();
        self.textures.insert(id, HeadlessTexture::new(desc, None));
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle(format!("{:?}", texture)));
        }
        let id = self.alloc_id();
        self.views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, subresource: TextureSubresource, data: &[u8]) {
        let Some(target) = self.textures.get_mut(&texture.0) else {
            log::error!("HeadlessBackend: write to unknown texture {:?}", texture);
            return;
        };
        match target.index(subresource) {
            Some(i) if target.subresources[i].len() == data.len() => {
                target.subresources[i].copy_from_slice(data);
                target.last_written = None;
            }
            _ => log::error!(
                "HeadlessBackend: texture write of {} bytes does not match {:?} {:?}",
                data.len(),
                target.desc.label,
                subresource
            ),
        }
    }

    fn read_texture(
        &mut self,
        texture: TextureHandle,
        subresource: TextureSubresource,
    ) -> BackendResult<Vec<u8>> {
        self.run_until(None);
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        tex.index(subresource)
            .map(|i| tex.subresources[i].clone())
            .ok_or_else(|| BackendError::ReadbackFailed(format!("{:?} out of range", subresource)))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.alloc_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn heap_texture_requirements(&self, desc: &TextureDescriptor) -> HeapSizeAndAlign {
        HeapSizeAndAlign {
            size: desc.footprint(),
            align: HEADLESS_HEAP_ALIGNMENT,
        }
    }

    fn create_heap(&mut self, desc: &HeapDescriptor) -> BackendResult<HeapHandle> {
        if desc.size == 0 {
            return Err(BackendError::HeapCreationFailed("zero-sized heap".into()));
        }
        log::trace!("HeadlessBackend: creating heap {:?} ({} bytes)", desc.label, desc.size);
        let id = self.alloc_id();
        self.heaps.insert(
            id,
            HeadlessHeap {
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
        if offset % requirements.align != 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "heap offset {} is not {}-byte aligned",
                offset, requirements.align
            )));
        }
        if range.end > target.size {
            return Err(BackendError::OutOfMemory);
        }
        if target
            .placed
            .iter()
            .any(|(r, _)| r.start < range.end && range.start < r.end)
        {
            return Err(BackendError::TextureCreationFailed(format!(
                "heap range {:?} overlaps a placed texture",
                range
            )));
        }
        let id = self.alloc_id();
        self.textures.insert(id, HeadlessTexture::new(desc, Some(heap.0)));
        if let Some(target) = self.heaps.get_mut(&heap.0) {
            target.placed.push((range, id));
        }
        Ok(TextureHandle(id))
    }

    fn destroy_heap(&mut self, heap: HeapHandle) {
        if let Some(removed) = self.heaps.remove(&heap.0) {
            for (_, texture) in removed.placed {
                self.textures.remove(&texture);
                self.views.retain(|_, t| *t != texture);
            }
        }
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.alloc_id();
        self.layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_entries = self
            .layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", layout)))?;
        for (binding, _) in entries {
            if !layout_entries.iter().any(|e| e.binding == *binding) {
                return Err(BackendError::BindGroupCreationFailed(format!(
                    "binding {} is not in the layout",
                    binding
                )));
            }
        }
        let id = self.alloc_id();
        self.bind_groups.insert(id, entries.to_vec());
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        log::trace!("HeadlessBackend: creating render pipeline {}", desc.program);
        let id = self.alloc_id();
        self.render_pipelines.insert(id, desc.program.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let kernel = *self.kernels.get(&desc.program).ok_or_else(|| {
            BackendError::PipelineCreationFailed(format!(
                "no host kernel registered for '{}'",
                desc.program
            ))
        })?;
        let id = self.alloc_id();
        self.compute_pipelines
            .insert(id, (desc.program.clone(), kernel));
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.record(Command::BeginRenderPass(desc.clone()));
    }

    fn end_render_pass(&mut self) {
        self.record(Command::EndRenderPass);
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.record(Command::BeginComputePass(label.map(str::to_string)));
    }

    fn end_compute_pass(&mut self) {
        self.record(Command::EndComputePass);
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.record(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        subresource: TextureSubresource,
    ) {
        self.record(Command::CopyTexture {
            src,
            dst,
            subresource,
        });
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        if !barriers.is_empty() {
            self.record(Command::Barrier(barriers.to_vec()));
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(Command::SetRenderPipeline(pipeline));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record(Command::SetComputePipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record(Command::SetBindGroup(index, bind_group));
    }

    fn set_vertex_buffer(&mut self, _slot: u32, buffer: BufferHandle, _offset: u64) {
        self.record(Command::SetVertexBuffer(buffer));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(Command::SetIndexBuffer(buffer, offset, format));
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, _w: f32, _h: f32, _min: f32, _max: f32) {}

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record(Command::SetStencilReference(reference));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(Command::Draw(vertices, instances));
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record(Command::DrawIndexed(indices, base_vertex, instances));
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32) {
        self.record(Command::DrawIndexedIndirect(buffer, offset, count));
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch([x, y, z]));
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            if let Some(heap) = tex.heap.and_then(|h| self.heaps.get_mut(&h)) {
                heap.placed.retain(|(_, t)| *t != texture.0);
            }
            self.views.retain(|_, t| *t != texture.0);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn buffer(backend: &mut HeadlessBackend, size: u64, usage: BufferUsage) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size,
                usage,
                mapped_at_creation: false,
            })
            .unwrap()
    }

    #[test]
    fn test_buffer_copy_executes_on_submit() {
        let mut backend = HeadlessBackend::new(4, 4);
        let src = buffer(&mut backend, 8, BufferUsage::COPY_SRC);
        let dst = buffer(&mut backend, 8, BufferUsage::COPY_DST);
        backend.write_buffer(src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);

        backend.begin_encoding("copy");
        backend.copy_buffer_to_buffer(src, 2, dst, 0, 4);
        backend.submit(None).unwrap();

        assert_eq!(backend.read_buffer(dst).unwrap(), vec![3, 4, 5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn test_deferred_mode_runs_on_wait() {
        let mut backend = HeadlessBackend::new(4, 4).with_execution_mode(ExecutionMode::Deferred);
        let completed = Arc::new(AtomicU32::new(0));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let counter = completed.clone();
            backend.begin_encoding("frame");
            ids.push(
                backend
                    .submit(Some(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })))
                    .unwrap(),
            );
        }
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(backend.pending_submissions(), 3);

        backend.wait_for_submission(ids[1]);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(backend.last_completed(), Some(ids[1]));

        backend.poll(true);
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_indirect_draw_reads_arguments_at_execution() {
        let mut backend = HeadlessBackend::new(4, 4).with_execution_mode(ExecutionMode::Deferred);
        let args = buffer(&mut backend, 40, BufferUsage::INDIRECT | BufferUsage::COPY_DST);

        backend.begin_encoding("replay");
        backend.draw_indexed_indirect(args, 0, 2);
        backend.submit(None).unwrap();

        // Written after recording, before execution
        let commands = [
            DrawIndexedIndirectArgs::new(36, 1, 0, 0, 0),
            DrawIndexedIndirectArgs::new(6, 0, 36, 0, 1),
        ];
        backend.write_buffer(args, 0, bytemuck::cast_slice(&commands));
        backend.poll(true);

        let draws: Vec<_> = backend.trace().draws().collect();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].element_count, 36);
        assert_eq!(draws[1].instance_count, 0);
        assert_eq!(draws[1].kind, DrawKind::Indirect { buffer: args, slot: 1 });
        assert_eq!(draws[1].triangle_count(), 0);
    }

    #[test]
    fn test_indexed_draw_fetches_through_offset_and_format() {
        let mut backend = HeadlessBackend::new(4, 4);
        let indices = buffer(&mut backend, 16, BufferUsage::INDEX | BufferUsage::COPY_DST);
        let packed: [u16; 8] = [9, 9, 0, 1, 2, 2, 3, 0];
        backend.write_buffer(indices, 0, bytemuck::cast_slice(&packed));

        backend.begin_encoding("indexed");
        backend.set_index_buffer(indices, 4, IndexFormat::Uint16);
        backend.draw_indexed(0..6, 0, 0..1);
        backend.set_index_buffer(indices, 4, IndexFormat::Uint32);
        backend.draw_indexed(1..2, 0, 0..1);
        backend.draw_indexed(0..8, 0, 0..1);
        backend.submit(None).unwrap();

        let draws: Vec<_> = backend.trace().draws().collect();
        assert_eq!(draws[0].indices, vec![0, 1, 2, 2, 3, 0]);
        assert_eq!(draws[1].indices, vec![0x0002_0002]);
        assert!(draws[2].indices.is_empty());
    }

    #[test]
    fn test_heap_placement_is_checked() {
        let mut backend = HeadlessBackend::new(4, 4);
        let desc = TextureDescriptor {
            width: 8,
            height: 8,
            ..Default::default()
        };
        let heap = backend
            .create_heap(&HeapDescriptor {
                label: None,
                size: 512,
            })
            .unwrap();
        assert!(backend.create_heap_texture(heap, 0, &desc).is_ok());
        assert!(backend.create_heap_texture(heap, 128, &desc).is_err());
        assert!(matches!(
            backend.create_heap_texture(heap, 512, &desc),
            Err(BackendError::OutOfMemory)
        ));
        assert!(backend.create_heap_texture(heap, 256, &desc).is_ok());
    }

    #[test]
    fn test_render_pass_clear_stamps_writer() {
        let mut backend = HeadlessBackend::new(2, 2);
        let frame = backend.acquire_surface().unwrap();
        backend.begin_encoding("clear");
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("clear".into()),
            color_attachments: vec![ColorAttachment {
                view: frame.swapchain_view,
                resolve_target: None,
                load_op: LoadOp::Clear([1.0, 0.0, 0.0, 1.0]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        backend.end_render_pass();
        let id = backend.submit(None).unwrap();

        let surface = backend.view_texture(frame.swapchain_view).unwrap();
        assert_eq!(backend.texture_last_written(surface), Some(id));
        let texels = backend.read_texture(surface, TextureSubresource::BASE).unwrap();
        assert_eq!(&texels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_half_float_encoding() {
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
        assert_eq!(f32_to_f16_bits(0.0), 0);
        assert_eq!(f32_to_f16_bits(f32::INFINITY), 0x7c00);
    }
}

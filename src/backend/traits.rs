//! Core backend abstraction traits
//!
//! These traits define the interface that both the wgpu and headless backends implement.
//! The trait is object safe: the render graph, passes and GPU-driven stages all record
//! through `&mut dyn GraphicsBackend`.

use crate::backend::types::*;
use std::any::Any;
use std::ops::Range;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to acquire surface texture: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create heap: {0}")]
    HeapCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create bind group: {0}")]
    BindGroupCreationFailed(String),
    #[error("Failed to record commands: {0}")]
    CommandEncodingFailed(String),
    #[error("Failed to read back resource: {0}")]
    ReadbackFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Surface outdated")]
    SurfaceOutdated,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

impl BackendError {
    /// Errors that only cost the current frame.
    pub fn is_frame_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::SurfaceLost
                | BackendError::SurfaceOutdated
                | BackendError::AcquireImageFailed(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a device memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

/// Handle to a bind group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

/// Handle to a bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// Identifies one submitted command stream. Ids increase monotonically per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub(crate) u64);

/// Invoked exactly once when the accelerator has finished a submission.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Bind group entry for creating bind groups
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
    /// Array of sampled textures indexed from shaders
    TextureArray(Vec<TextureViewHandle>),
    Sampler(SamplerHandle),
    StorageTexture(TextureViewHandle),
}

impl BindGroupEntry {
    pub fn buffer(buffer: BufferHandle) -> Self {
        BindGroupEntry::Buffer {
            buffer,
            offset: 0,
            size: None,
        }
    }
}

/// Bind group layout entry
#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
    /// Element count for texture arrays
    pub count: Option<u32>,
}

impl BindGroupLayoutEntry {
    pub fn new(binding: u32, visibility: ShaderStageFlags, ty: BindingType) -> Self {
        Self {
            binding,
            visibility,
            ty,
            count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));
    pub const ALL: Self = Self((1 << 0) | (1 << 1) | (1 << 2));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Binding type
#[derive(Debug, Clone)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    Texture { sample_type: TextureSampleType },
    StorageTexture { format: TextureFormat },
    Sampler { comparison: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSampleType {
    Float { filterable: bool },
    Depth,
    Uint,
}

/// Render pipeline descriptor
///
/// `program` names the entry in the shader library the pipeline was built from;
/// `source` is that program's text, opaque to everything but the backend.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub program: String,
    pub source: String,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

impl RenderPipelineDescriptor {
    /// Triangle list with back-face culling and the conventional `vs_main`/`fs_main` entries.
    pub fn new(program: &str, source: &str) -> Self {
        Self {
            label: Some(program.to_string()),
            program: program.to_string(),
            source: source.to_string(),
            vertex_entry: "vs_main".to_string(),
            fragment_entry: Some("fs_main".to_string()),
            vertex_layouts: Vec::new(),
            bind_group_layouts: Vec::new(),
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: None,
            color_targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
    pub stencil: StencilState,
    pub bias: DepthBias,
}

impl DepthStencilState {
    pub fn depth(format: TextureFormat, write: bool, compare: CompareFunction) -> Self {
        Self {
            format,
            depth_write_enabled: write,
            depth_compare: compare,
            stencil: StencilState::disabled(),
            bias: DepthBias::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl ColorTargetState {
    pub fn opaque(format: TextureFormat) -> Self {
        Self {
            format,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const RED: Self = Self(1 << 0);
    pub const GREEN: Self = Self(1 << 1);
    pub const BLUE: Self = Self(1 << 2);
    pub const ALPHA: Self = Self(1 << 3);
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub program: String,
    pub source: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
}

/// Color attachment for render pass
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub resolve_target: Option<TextureViewHandle>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Depth stencil attachment for render pass
#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub view: TextureViewHandle,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
    /// Depth is bound for testing only
    pub depth_read_only: bool,
    /// Stencil operations; `None` keeps stencil read-only or the format has no stencil aspect
    pub stencil: Option<StencilAttachmentOps>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilAttachmentOps {
    pub clear_value: Option<u32>,
    pub store_op: StoreOp,
}

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

/// Frame context returned when acquiring the presentable surface
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub swapchain_view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
}

/// Resource addressed by a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierTarget {
    Buffer(BufferHandle),
    Texture(TextureViewHandle),
    Heap(HeapHandle),
}

/// How a resource is accessed on one side of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    ShaderRead,
    ShaderWrite,
    Uniform,
    RenderTarget,
    DepthRead,
    DepthWrite,
    IndirectArgument,
    CopySrc,
    CopyDst,
}

/// Transition between two accesses of the same resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub target: BarrierTarget,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Main graphics backend trait
pub trait GraphicsBackend: Any {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Optional features available on this device
    fn capabilities(&self) -> BackendCapabilities;

    /// Resize the presentable surface
    fn resize(&mut self, width: u32, height: u32);

    /// Get the actual surface size (may be clamped by device limits)
    fn surface_size(&self) -> (u32, u32);

    /// Get the presentable surface format
    fn surface_format(&self) -> TextureFormat;

    /// Acquire the next presentable surface texture
    fn acquire_surface(&mut self) -> BackendResult<FrameContext>;

    /// Present the acquired surface texture
    fn present(&mut self);

    // Submission

    /// Start recording a command stream
    fn begin_encoding(&mut self, label: &str);

    /// Submit the recorded command stream. `on_complete` runs once the accelerator is done with it.
    fn submit(&mut self, on_complete: Option<CompletionCallback>) -> BackendResult<SubmissionId>;

    /// Drop the command stream being recorded without submitting it
    fn abandon_encoding(&mut self);

    /// Process finished submissions, firing their completion callbacks.
    /// With `wait`, block until everything submitted so far has finished.
    fn poll(&mut self, wait: bool);

    /// Block until the given submission has finished
    fn wait_for_submission(&mut self, submission: SubmissionId);

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a buffer with initial data
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Read a buffer's contents back to the host, waiting for outstanding work
    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>>;

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view covering the whole texture
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    /// Write tightly packed texels into one subresource
    fn write_texture(&mut self, texture: TextureHandle, subresource: TextureSubresource, data: &[u8]);

    /// Read one subresource back to the host, tightly packed, waiting for outstanding work
    fn read_texture(
        &mut self,
        texture: TextureHandle,
        subresource: TextureSubresource,
    ) -> BackendResult<Vec<u8>>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Heaps

    /// Size and alignment a texture with this descriptor occupies inside a heap
    fn heap_texture_requirements(&self, desc: &TextureDescriptor) -> HeapSizeAndAlign;

    /// Allocate a heap
    fn create_heap(&mut self, desc: &HeapDescriptor) -> BackendResult<HeapHandle>;

    /// Place a texture inside a heap at `offset`
    fn create_heap_texture(
        &mut self,
        heap: HeapHandle,
        offset: u64,
        desc: &TextureDescriptor,
    ) -> BackendResult<TextureHandle>;

    /// Release a heap and every texture placed in it
    fn destroy_heap(&mut self, heap: HeapHandle);

    // Pipeline creation

    /// Create a bind group layout
    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Create a bind group
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    /// Create a render pipeline
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    /// Create a compute pipeline
    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    // Command recording

    /// Begin a render pass
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Begin a compute pass
    fn begin_compute_pass(&mut self, label: Option<&str>);

    /// End the current compute pass
    fn end_compute_pass(&mut self);

    /// Copy a byte range between buffers. Must be recorded outside passes.
    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    );

    /// Copy one whole subresource between textures of identical format and extent.
    /// Must be recorded outside passes.
    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        subresource: TextureSubresource,
    );

    /// Make prior accesses visible to the accesses that follow
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);

    /// Set the render pipeline
    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Set the compute pipeline
    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);

    /// Set a bind group
    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    /// Set viewport
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);

    /// Set the stencil reference value used by stencil tests and `Replace`
    fn set_stencil_reference(&mut self, reference: u32);

    /// Draw primitives
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    /// Replay `count` consecutive indexed indirect commands starting at `offset` bytes
    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32);

    /// Dispatch compute work
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32);

    // Resource cleanup

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Allow downcasting to the concrete backend
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

//! Conversions from backend-neutral descriptors to wgpu types

use crate::backend::traits::*;
use crate::backend::types::*;

pub(super) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
    }
}

pub(super) fn texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
        wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
        wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
        wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
        wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
        wgpu::TextureFormat::Depth32Float => TextureFormat::Depth32Float,
        wgpu::TextureFormat::Depth24PlusStencil8 => TextureFormat::Depth24PlusStencil8,
        wgpu::TextureFormat::R32Float => TextureFormat::R32Float,
        other => {
            log::warn!("Unmapped surface format {:?}, treating as Bgra8UnormSrgb", other);
            TextureFormat::Bgra8UnormSrgb
        }
    }
}

pub(super) fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    const PAIRS: [(BufferUsage, wgpu::BufferUsages); 9] = [
        (BufferUsage::MAP_READ, wgpu::BufferUsages::MAP_READ),
        (BufferUsage::MAP_WRITE, wgpu::BufferUsages::MAP_WRITE),
        (BufferUsage::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ];
    PAIRS
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(wgpu::BufferUsages::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(super) fn texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    const PAIRS: [(TextureUsage, wgpu::TextureUsages); 5] = [
        (TextureUsage::COPY_SRC, wgpu::TextureUsages::COPY_SRC),
        (TextureUsage::COPY_DST, wgpu::TextureUsages::COPY_DST),
        (TextureUsage::TEXTURE_BINDING, wgpu::TextureUsages::TEXTURE_BINDING),
        (TextureUsage::STORAGE_BINDING, wgpu::TextureUsages::STORAGE_BINDING),
        (TextureUsage::RENDER_ATTACHMENT, wgpu::TextureUsages::RENDER_ATTACHMENT),
    ];
    PAIRS
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(wgpu::TextureUsages::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(super) fn shader_stages(flags: ShaderStageFlags) -> wgpu::ShaderStages {
    let mut stages = wgpu::ShaderStages::empty();
    if flags.contains(ShaderStageFlags::VERTEX) {
        stages |= wgpu::ShaderStages::VERTEX;
    }
    if flags.contains(ShaderStageFlags::FRAGMENT) {
        stages |= wgpu::ShaderStages::FRAGMENT;
    }
    if flags.contains(ShaderStageFlags::COMPUTE) {
        stages |= wgpu::ShaderStages::COMPUTE;
    }
    stages
}

pub(super) fn binding_type(ty: &BindingType) -> wgpu::BindingType {
    match ty {
        BindingType::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: *read_only,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::Texture { sample_type } => wgpu::BindingType::Texture {
            sample_type: match sample_type {
                TextureSampleType::Float { filterable } => wgpu::TextureSampleType::Float {
                    filterable: *filterable,
                },
                TextureSampleType::Depth => wgpu::TextureSampleType::Depth,
                TextureSampleType::Uint => wgpu::TextureSampleType::Uint,
            },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingType::StorageTexture { format } => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: texture_format(*format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingType::Sampler { comparison } => wgpu::BindingType::Sampler(if *comparison {
            wgpu::SamplerBindingType::Comparison
        } else {
            wgpu::SamplerBindingType::Filtering
        }),
    }
}

pub(super) fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
    }
}

pub(super) fn compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
    match op {
        StencilOperation::Keep => wgpu::StencilOperation::Keep,
        StencilOperation::Zero => wgpu::StencilOperation::Zero,
        StencilOperation::Replace => wgpu::StencilOperation::Replace,
        StencilOperation::Invert => wgpu::StencilOperation::Invert,
        StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
    }
}

fn stencil_face(face: &StencilFaceState) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: compare_function(face.compare),
        fail_op: stencil_operation(face.fail_op),
        depth_fail_op: stencil_operation(face.depth_fail_op),
        pass_op: stencil_operation(face.pass_op),
    }
}

pub(super) fn depth_stencil_state(state: &DepthStencilState) -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: texture_format(state.format),
        depth_write_enabled: state.depth_write_enabled,
        depth_compare: compare_function(state.depth_compare),
        stencil: wgpu::StencilState {
            front: stencil_face(&state.stencil.front),
            back: stencil_face(&state.stencil.back),
            read_mask: state.stencil.read_mask,
            write_mask: state.stencil.write_mask,
        },
        bias: wgpu::DepthBiasState {
            constant: state.bias.constant,
            slope_scale: state.bias.slope_scale,
            clamp: state.bias.clamp,
        },
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
    match op {
        BlendOperation::Add => wgpu::BlendOperation::Add,
        BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOperation::Min => wgpu::BlendOperation::Min,
        BlendOperation::Max => wgpu::BlendOperation::Max,
    }
}

fn blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: blend_factor(component.src_factor),
        dst_factor: blend_factor(component.dst_factor),
        operation: blend_operation(component.operation),
    }
}

pub(super) fn color_target(target: &ColorTargetState) -> Option<wgpu::ColorTargetState> {
    Some(wgpu::ColorTargetState {
        format: texture_format(target.format),
        blend: target.blend.as_ref().map(|b| wgpu::BlendState {
            color: blend_component(&b.color),
            alpha: blend_component(&b.alpha),
        }),
        write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
    })
}

pub(super) fn primitive_state(desc: &RenderPipelineDescriptor) -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: match desc.primitive_topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        },
        strip_index_format: None,
        front_face: match desc.front_face {
            FrontFace::Ccw => wgpu::FrontFace::Ccw,
            FrontFace::Cw => wgpu::FrontFace::Cw,
        },
        cull_mode: match desc.cull_mode {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        },
        ..Default::default()
    }
}

pub(super) fn sampler_descriptor(desc: &SamplerDescriptor) -> wgpu::SamplerDescriptor<'_> {
    let filter = |mode: FilterMode| match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    };
    let address = |mode: AddressMode| match mode {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
    };
    wgpu::SamplerDescriptor {
        label: desc.label.as_deref(),
        address_mode_u: address(desc.address_mode_u),
        address_mode_v: address(desc.address_mode_v),
        address_mode_w: address(desc.address_mode_w),
        mag_filter: filter(desc.mag_filter),
        min_filter: filter(desc.min_filter),
        mipmap_filter: filter(desc.mipmap_filter),
        compare: desc.compare.map(compare_function),
        ..Default::default()
    }
}

pub(super) fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

pub(super) fn load_color(op: &LoadOp) -> wgpu::LoadOp<wgpu::Color> {
    match op {
        LoadOp::Clear(c) => wgpu::LoadOp::Clear(wgpu::Color {
            r: c[0] as f64,
            g: c[1] as f64,
            b: c[2] as f64,
            a: c[3] as f64,
        }),
        LoadOp::Load => wgpu::LoadOp::Load,
    }
}

pub(super) fn store_op(op: StoreOp) -> wgpu::StoreOp {
    match op {
        StoreOp::Store => wgpu::StoreOp::Store,
        StoreOp::Discard => wgpu::StoreOp::Discard,
    }
}

pub(super) fn surface_error(error: wgpu::SurfaceError) -> BackendError {
    match error {
        wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
        wgpu::SurfaceError::Outdated => BackendError::SurfaceOutdated,
        wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
        #[allow(unreachable_patterns)]
        other => BackendError::AcquireImageFailed(other.to_string()),
    }
}

//! Frame pipeline
//!
//! Every frame runs as one command stream:
//! 1. Command synthesis (compute) fills the synthesized ICB
//! 2. ICB optimize (copy) moves it into the replay buffer
//! 3. Shadow pass renders directional-light depth by replaying the ICB
//! 4. Deferred: G-buffer pass replays the ICB into the G-buffer, then the lighting
//!    pass accumulates a full-screen ambient/directional draw and instanced point-light
//!    volumes. Forward: the forward pass shades every object directly.
//! 5. Optional composite tonemaps the HDR target into the surface

pub mod composite_pass;
pub mod forward_pass;
pub mod gbuffer_pass;
pub mod lighting_pass;
pub mod shadow_pass;

pub use composite_pass::CompositePass;
pub use forward_pass::ForwardPass;
pub use gbuffer_pass::GBufferPass;
pub use lighting_pass::LightingPass;
pub use shadow_pass::ShadowPass;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RendererError, RendererResult};
use crate::gpu_driven::optimizer::{IcbOptimizePass, ReplayPlan};
use crate::gpu_driven::synthesis::{CommandSynthesisPass, SynthesisInputs};
use crate::render_graph::*;
use crate::resources::GpuMesh;
use crate::RenderMode;

pub const GBUFFER_ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const GBUFFER_NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const GBUFFER_POSITION_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Depth plus the stencil the G-buffer stamps for the lighting pass
pub const GBUFFER_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;
pub const SHADOW_FORMAT: TextureFormat = TextureFormat::Depth32Float;
pub const FORWARD_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;
pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Stencil value marking pixels covered by geometry
pub const LIT_STENCIL_REFERENCE: u32 = 1;

/// Bindings shared by every program that draws scene geometry (group 0)
pub mod scene_bindings {
    pub const FRAME: u32 = 0;
    pub const TRANSFORMS: u32 = 1;
    pub const RECORDS: u32 = 2;
    pub const MATERIALS: u32 = 3;
    pub const LIGHTS: u32 = 4;
}

/// Bindings of material and shadow textures (group 1)
pub mod texture_bindings {
    pub const HEAP_TEXTURES: u32 = 0;
    pub const MATERIAL_SAMPLER: u32 = 1;
    pub const SHADOW_MAP: u32 = 2;
    pub const SHADOW_SAMPLER: u32 = 3;
}

pub(crate) fn bound<T>(value: Option<T>, what: &str) -> RendererResult<T> {
    value.ok_or_else(|| RendererError::InvalidConfig(format!("graph resource '{}' is not bound", what)))
}

/// Buffers every geometry program reads
#[derive(Debug, Clone, Copy)]
pub struct SceneInputs {
    /// Frame ring
    pub frame_uniforms: ResourceId,
    /// Frame ring
    pub transforms: ResourceId,
    pub records: ResourceId,
    pub materials: ResourceId,
    /// Frame ring
    pub lights: ResourceId,
}

impl SceneInputs {
    pub fn declare(&self, ctx: &mut PassSetupContext) {
        ctx.read(self.frame_uniforms, ResourceUsage::UniformBuffer);
        ctx.read(self.transforms, ResourceUsage::StorageBufferRead);
        ctx.read(self.records, ResourceUsage::StorageBufferRead);
        ctx.read(self.materials, ResourceUsage::StorageBufferRead);
        ctx.read(self.lights, ResourceUsage::StorageBufferRead);
    }

    pub fn create_layout(backend: &mut dyn GraphicsBackend) -> BackendResult<BindGroupLayoutHandle> {
        let read_only = BindingType::StorageBuffer { read_only: true };
        backend.create_bind_group_layout(&[
            BindGroupLayoutEntry::new(
                scene_bindings::FRAME,
                ShaderStageFlags::VERTEX_FRAGMENT,
                BindingType::UniformBuffer,
            ),
            BindGroupLayoutEntry::new(scene_bindings::TRANSFORMS, ShaderStageFlags::VERTEX, read_only.clone()),
            BindGroupLayoutEntry::new(scene_bindings::RECORDS, ShaderStageFlags::VERTEX, read_only.clone()),
            BindGroupLayoutEntry::new(
                scene_bindings::MATERIALS,
                ShaderStageFlags::VERTEX_FRAGMENT,
                read_only.clone(),
            ),
            BindGroupLayoutEntry::new(scene_bindings::LIGHTS, ShaderStageFlags::FRAGMENT, read_only),
        ])
    }

    /// One bind group per frame ring slot
    pub fn create_bind_groups(
        &self,
        ctx: &mut PassPrepareContext,
        layout: BindGroupLayoutHandle,
    ) -> RendererResult<Vec<BindGroupHandle>> {
        let records = bound(ctx.get_buffer(self.records), "records")?;
        let materials = bound(ctx.get_buffer(self.materials), "materials")?;
        let uniforms = ctx.get_slot_buffers(self.frame_uniforms);
        let transforms = ctx.get_slot_buffers(self.transforms);
        let lights = ctx.get_slot_buffers(self.lights);

        let mut groups = Vec::with_capacity(uniforms.len());
        for ((uniforms, transforms), lights) in uniforms.into_iter().zip(transforms).zip(lights) {
            groups.push(ctx.backend().create_bind_group(
                layout,
                &[
                    (scene_bindings::FRAME, BindGroupEntry::buffer(bound(uniforms, "frame uniforms")?)),
                    (scene_bindings::TRANSFORMS, BindGroupEntry::buffer(bound(transforms, "transforms")?)),
                    (scene_bindings::RECORDS, BindGroupEntry::buffer(records)),
                    (scene_bindings::MATERIALS, BindGroupEntry::buffer(materials)),
                    (scene_bindings::LIGHTS, BindGroupEntry::buffer(bound(lights, "lights")?)),
                ],
            )?);
        }
        Ok(groups)
    }
}

/// Heap textures plus the shadow map, as the G-buffer and forward programs sample them
pub(crate) fn create_texture_bindings(
    ctx: &mut PassPrepareContext,
    heap: ResourceId,
    shadow_map: ResourceId,
) -> RendererResult<(BindGroupLayoutHandle, BindGroupHandle)> {
    let views = bound(ctx.get_heap(heap), "texture heap")?.views.clone();
    if views.is_empty() {
        return Err(RendererError::InvalidConfig(
            "texture heap binding needs at least one view".into(),
        ));
    }
    let shadow = bound(ctx.get_texture(shadow_map), "shadow map")?;

    let backend = ctx.backend();
    let mut textures = BindGroupLayoutEntry::new(
        texture_bindings::HEAP_TEXTURES,
        ShaderStageFlags::FRAGMENT,
        BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: true },
        },
    );
    textures.count = Some(views.len() as u32);
    let layout = backend.create_bind_group_layout(&[
        textures,
        BindGroupLayoutEntry::new(
            texture_bindings::MATERIAL_SAMPLER,
            ShaderStageFlags::FRAGMENT,
            BindingType::Sampler { comparison: false },
        ),
        BindGroupLayoutEntry::new(
            texture_bindings::SHADOW_MAP,
            ShaderStageFlags::FRAGMENT,
            BindingType::Texture {
                sample_type: TextureSampleType::Depth,
            },
        ),
        BindGroupLayoutEntry::new(
            texture_bindings::SHADOW_SAMPLER,
            ShaderStageFlags::FRAGMENT,
            BindingType::Sampler { comparison: true },
        ),
    ])?;
    let material_sampler = backend.create_sampler(&SamplerDescriptor::repeat_linear("Material Sampler"))?;
    let shadow_sampler = backend.create_sampler(&SamplerDescriptor::shadow_comparison("Shadow Sampler"))?;
    let group = backend.create_bind_group(
        layout,
        &[
            (texture_bindings::HEAP_TEXTURES, BindGroupEntry::TextureArray(views)),
            (texture_bindings::MATERIAL_SAMPLER, BindGroupEntry::Sampler(material_sampler)),
            (texture_bindings::SHADOW_MAP, BindGroupEntry::Texture(shadow)),
            (texture_bindings::SHADOW_SAMPLER, BindGroupEntry::Sampler(shadow_sampler)),
        ],
    )?;
    Ok((layout, group))
}

/// Color attachment cleared to `color` and stored
pub(crate) fn cleared(view: TextureViewHandle, color: [f32; 4]) -> ColorAttachment {
    ColorAttachment {
        view,
        resolve_target: None,
        load_op: LoadOp::Clear(color),
        store_op: StoreOp::Store,
    }
}

/// Settings the frame graph is built from
#[derive(Debug, Clone)]
pub struct FrameGraphConfig {
    pub mode: RenderMode,
    pub shadows: bool,
    pub shadow_map_size: u32,
    pub post_process: bool,
    pub clear_color: [f32; 4],
}

/// G-buffer targets shared by the G-buffer and lighting passes
#[derive(Debug, Clone, Copy)]
pub struct GBufferTargets {
    pub albedo: ResourceId,
    pub normal: ResourceId,
    pub position: ResourceId,
    pub depth: ResourceId,
}

/// Graph resources the renderer binds before preparing the graph
#[derive(Debug, Clone, Copy)]
pub struct FrameResources {
    pub params: ResourceId,
    pub records: ResourceId,
    pub templates: ResourceId,
    pub materials: ResourceId,
    pub transforms: ResourceId,
    pub frame_uniforms: ResourceId,
    pub lights: ResourceId,
    pub icb_synthesized: ResourceId,
    pub icb_replay: ResourceId,
    pub heap: ResourceId,
    pub surface: ResourceId,
    pub shadow_map: ResourceId,
    pub gbuffer: Option<GBufferTargets>,
    /// HDR accumulation target when post-processing is on
    pub hdr: Option<ResourceId>,
}

/// Build the per-frame graph for `config.mode`.
///
/// `light_volume` is the mesh instanced once per point light in the lighting pass.
pub fn build_frame_graph(
    width: u32,
    height: u32,
    config: &FrameGraphConfig,
    plan: ReplayPlan,
    light_volume: &GpuMesh,
) -> (RenderGraph, FrameResources) {
    let mut graph = RenderGraph::new(width, height);

    let params = graph.import_buffer("synthesis_params");
    let records = graph.import_buffer("argument_records");
    let templates = graph.import_buffer("draw_templates");
    let materials = graph.import_buffer("material_records");
    let transforms = graph.import_buffer("object_transforms");
    let frame_uniforms = graph.import_buffer("frame_uniforms");
    let lights = graph.import_buffer("lights");
    let icb_synthesized = graph.import_buffer("icb_synthesized");
    let icb_replay = graph.import_buffer("icb_replay");
    let heap = graph.import_heap("texture_heap");
    let surface = graph.register_external("surface");

    let sampled_target = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
    let shadow_map = graph.create_texture(
        "shadow_map",
        TextureSize::Absolute {
            width: config.shadow_map_size,
            height: config.shadow_map_size,
        },
        SHADOW_FORMAT,
        sampled_target,
    );
    let hdr = config.post_process.then(|| {
        graph.create_texture("hdr_color", TextureSize::default(), HDR_FORMAT, sampled_target)
    });
    let color_target = hdr.unwrap_or(surface);

    let scene = SceneInputs {
        frame_uniforms,
        transforms,
        records,
        materials,
        lights,
    };

    graph.add_pass(
        CommandSynthesisPass::new(SynthesisInputs {
            params,
            records,
            templates,
            transforms,
            frame_uniforms,
            commands: icb_synthesized,
        }),
        PassType::Compute,
    );
    graph.add_pass(IcbOptimizePass::new(icb_synthesized, icb_replay), PassType::Transfer);
    graph.add_pass(
        ShadowPass::new(scene, icb_replay, shadow_map, plan.clone(), config.shadows),
        PassType::Graphics,
    );

    let gbuffer = match config.mode {
        RenderMode::Deferred => {
            let targets = GBufferTargets {
                albedo: graph.create_texture(
                    "gbuffer_albedo",
                    TextureSize::default(),
                    GBUFFER_ALBEDO_FORMAT,
                    sampled_target,
                ),
                normal: graph.create_texture(
                    "gbuffer_normal",
                    TextureSize::default(),
                    GBUFFER_NORMAL_FORMAT,
                    sampled_target,
                ),
                position: graph.create_texture(
                    "gbuffer_position",
                    TextureSize::default(),
                    GBUFFER_POSITION_FORMAT,
                    sampled_target,
                ),
                depth: graph.create_texture(
                    "gbuffer_depth",
                    TextureSize::default(),
                    GBUFFER_DEPTH_FORMAT,
                    TextureUsage::RENDER_ATTACHMENT,
                ),
            };
            graph.add_pass(
                GBufferPass::new(scene, icb_replay, heap, shadow_map, targets, plan),
                PassType::Graphics,
            );
            graph.add_pass(
                LightingPass::new(
                    scene,
                    shadow_map,
                    targets,
                    color_target,
                    hdr.is_some(),
                    config.clear_color,
                    light_volume.clone(),
                ),
                PassType::Graphics,
            );
            Some(targets)
        }
        RenderMode::Forward => {
            graph.add_pass(
                ForwardPass::new(
                    scene,
                    icb_replay,
                    heap,
                    shadow_map,
                    color_target,
                    hdr.is_some(),
                    config.clear_color,
                    plan,
                ),
                PassType::Graphics,
            );
            None
        }
    };

    if let Some(hdr) = hdr {
        graph.add_pass(CompositePass::new(hdr, surface), PassType::Graphics);
    }

    log::debug!(
        "Built {:?} frame graph ({}x{}, post process: {})",
        config.mode,
        width,
        height,
        config.post_process
    );

    (
        graph,
        FrameResources {
            params,
            records,
            templates,
            materials,
            transforms,
            frame_uniforms,
            lights,
            icb_synthesized,
            icb_replay,
            heap,
            surface,
            shadow_map,
            gbuffer,
            hdr,
        },
    )
}

/// Shared WGSL declarations of the frame records; mirrors `gpu_driven::layout`.
pub const COMMON_WGSL: &str = r#"
struct FrameUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    shadow_view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    ambient: vec4<f32>,
    frustum: array<vec4<f32>, 6>,
    counts: vec4<u32>,
    frame: vec4<u32>,
}

struct ObjectTransform {
    model: mat4x4<f32>,
    normal0: vec4<f32>,
    normal1: vec4<f32>,
    normal2: vec4<f32>,
    tiling: f32,
    flags: u32,
    _pad: vec2<u32>,
}

struct ArgumentRecord {
    geometry_slot: u32,
    material_index: u32,
    index_format: u32,
    transform_index: u32,
}

struct MaterialRecord {
    base_color: vec4<f32>,
    params: vec4<f32>,
    specular: vec4<f32>,
    textures0: vec4<u32>,
    textures1: vec2<u32>,
    flags: u32,
    _pad: u32,
}

struct Light {
    position_radius: vec4<f32>,
    color_intensity: vec4<f32>,
    direction_type: vec4<f32>,
    attenuation: vec4<f32>,
    cone: vec4<f32>,
}

const NO_TEXTURE: u32 = 0xffffffffu;
const FLAG_SHADOWS: u32 = 1u;
const FLAG_ALPHA_TEST: u32 = 2u;

@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var<storage, read> transforms: array<ObjectTransform>;
@group(0) @binding(2) var<storage, read> records: array<ArgumentRecord>;
@group(0) @binding(3) var<storage, read> materials: array<MaterialRecord>;
@group(0) @binding(4) var<storage, read> lights: array<Light>;

struct VertexInput {
    @builtin(instance_index) instance: u32,
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

fn normal_matrix(t: ObjectTransform) -> mat3x3<f32> {
    return mat3x3<f32>(t.normal0.xyz, t.normal1.xyz, t.normal2.xyz);
}

fn light_attenuation(light: Light, to_light: vec3<f32>) -> f32 {
    let distance = length(to_light);
    if (distance > light.position_radius.w) {
        return 0.0;
    }
    let k = light.attenuation.xyz;
    var falloff = 1.0 / (k.x + k.y * distance + k.z * distance * distance);
    if (light.direction_type.w > 1.5) {
        let cos_angle = dot(normalize(-to_light), normalize(light.direction_type.xyz));
        falloff *= smoothstep(light.cone.y, light.cone.x, cos_angle);
    }
    return falloff;
}
"#;

/// Sampling helpers for programs that bind the texture group
pub const TEXTURED_WGSL: &str = r#"
@group(1) @binding(0) var heap_textures: binding_array<texture_2d<f32>>;
@group(1) @binding(1) var material_sampler: sampler;
@group(1) @binding(2) var shadow_map: texture_depth_2d;
@group(1) @binding(3) var shadow_sampler: sampler_comparison;

fn texture_slot(material: MaterialRecord, channel: u32) -> u32 {
    if (channel < 4u) {
        return material.textures0[channel];
    }
    return material.textures1[channel - 4u];
}

// Absent textures sample as `fallback`
fn sample_channel(material: MaterialRecord, channel: u32, uv: vec2<f32>, fallback: vec4<f32>) -> vec4<f32> {
    let slot = texture_slot(material, channel);
    if (slot == NO_TEXTURE) {
        return fallback;
    }
    return textureSample(heap_textures[slot], material_sampler, uv);
}

fn shadow_factor(world_position: vec3<f32>) -> f32 {
    if ((frame.counts.w & FLAG_SHADOWS) == 0u) {
        return 1.0;
    }
    let clip = frame.shadow_view_proj * vec4<f32>(world_position, 1.0);
    let ndc = clip.xyz / clip.w;
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if (any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) || ndc.z > 1.0) {
        return 1.0;
    }
    return textureSampleCompareLevel(shadow_map, shadow_sampler, uv, ndc.z - 0.002);
}
"#;

/// Program source with the shared declarations prepended
pub(crate) fn with_common(body: &str, textured: bool) -> String {
    let mut source = String::from(COMMON_WGSL);
    if textured {
        source.push_str(TEXTURED_WGSL);
    }
    source.push_str(body);
    source
}

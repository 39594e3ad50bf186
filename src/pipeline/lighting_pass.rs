//! Deferred lighting pass
//!
//! Reads the G-buffer and the shadow map. A full-screen draw accumulates ambient and
//! directional light, then one instanced light-volume draw adds every point and spot
//! light. Both draws are stencil-tested against the G-buffer stamp, so background
//! pixels keep the clear color.

use std::any::Any;

use super::*;

pub const LIGHTING_PROGRAM: &str = "lighting";

/// Bindings of the G-buffer group (group 1)
pub mod gbuffer_bindings {
    pub const ALBEDO: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const POSITION: u32 = 2;
    pub const SHADOW_MAP: u32 = 3;
    pub const SHADOW_SAMPLER: u32 = 4;
}

pub const LIGHTING_SHADER: &str = r#"
@group(1) @binding(0) var gbuffer_albedo: texture_2d<f32>;
@group(1) @binding(1) var gbuffer_normal: texture_2d<f32>;
@group(1) @binding(2) var gbuffer_position: texture_2d<f32>;
@group(1) @binding(3) var shadow_map: texture_depth_2d;
@group(1) @binding(4) var shadow_sampler: sampler_comparison;

struct Surface {
    albedo: vec3<f32>,
    occlusion: f32,
    normal: vec3<f32>,
    roughness: f32,
    position: vec3<f32>,
    metallic: f32,
}

fn load_surface(coord: vec4<f32>) -> Surface {
    let texel = vec2<i32>(coord.xy);
    let albedo = textureLoad(gbuffer_albedo, texel, 0);
    let normal = textureLoad(gbuffer_normal, texel, 0);
    let position = textureLoad(gbuffer_position, texel, 0);
    return Surface(albedo.rgb, albedo.a, normalize(normal.xyz * 2.0 - 1.0), normal.a, position.xyz, position.a);
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

fn shade(surface: Surface, to_light: vec3<f32>, radiance: vec3<f32>) -> vec3<f32> {
    let view = normalize(frame.camera_position.xyz - surface.position);
    let half_vector = normalize(to_light + view);
    let n_dot_l = max(dot(surface.normal, to_light), 0.0);
    let shininess = mix(256.0, 4.0, surface.roughness);
    let specular_color = mix(vec3<f32>(0.04), surface.albedo, surface.metallic);
    let diffuse = surface.albedo * (1.0 - surface.metallic);
    let specular = specular_color * pow(max(dot(surface.normal, half_vector), 0.0), shininess);
    return (diffuse + specular) * radiance * n_dot_l;
}

struct FullscreenOutput {
    @builtin(position) clip_position: vec4<f32>,
}

@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> FullscreenOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: FullscreenOutput;
    out.clip_position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    return out;
}

@fragment
fn fs_directional(in: FullscreenOutput) -> @location(0) vec4<f32> {
    let surface = load_surface(in.clip_position);
    var color = surface.albedo * frame.ambient.rgb * frame.ambient.w * surface.occlusion;
    for (var i = 0u; i < frame.counts.x; i++) {
        let light = lights[i];
        var radiance = light.color_intensity.rgb * light.color_intensity.w;
        if (i == 0u) {
            radiance *= shadow_factor(surface.position);
        }
        color += shade(surface, normalize(-light.direction_type.xyz), radiance);
    }
    return vec4<f32>(color, 1.0);
}

struct VolumeOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) @interpolate(flat) light: u32,
}

@vertex
fn vs_volume(in: VertexInput) -> VolumeOutput {
    let light = lights[in.instance];
    let world = light.position_radius.xyz + in.position * light.position_radius.w;
    var out: VolumeOutput;
    out.clip_position = frame.view_proj * vec4<f32>(world, 1.0);
    out.light = in.instance;
    return out;
}

@fragment
fn fs_volume(in: VolumeOutput) -> @location(0) vec4<f32> {
    let surface = load_surface(in.clip_position);
    let light = lights[in.light];
    let to_light = light.position_radius.xyz - surface.position;
    let radiance = light.color_intensity.rgb * light.color_intensity.w * light_attenuation(light, to_light);
    return vec4<f32>(shade(surface, normalize(to_light), radiance), 0.0);
}
"#;

pub struct LightingPass {
    scene: SceneInputs,
    shadow_map: ResourceId,
    gbuffer: GBufferTargets,
    output: ResourceId,
    /// Output is the HDR target rather than the surface
    hdr_output: bool,
    clear_color: [f32; 4],
    light_volume: GpuMesh,
    directional_pipeline: Option<RenderPipelineHandle>,
    volume_pipeline: Option<RenderPipelineHandle>,
    scene_groups: Vec<BindGroupHandle>,
    gbuffer_group: Option<BindGroupHandle>,
}

impl LightingPass {
    pub fn new(
        scene: SceneInputs,
        shadow_map: ResourceId,
        gbuffer: GBufferTargets,
        output: ResourceId,
        hdr_output: bool,
        clear_color: [f32; 4],
        light_volume: GpuMesh,
    ) -> Self {
        Self {
            scene,
            shadow_map,
            gbuffer,
            output,
            hdr_output,
            clear_color,
            light_volume,
            directional_pipeline: None,
            volume_pipeline: None,
            scene_groups: Vec::new(),
            gbuffer_group: None,
        }
    }

    fn create_gbuffer_group(
        &self,
        ctx: &mut PassPrepareContext,
    ) -> RendererResult<(BindGroupLayoutHandle, BindGroupHandle)> {
        let albedo = bound(ctx.get_texture(self.gbuffer.albedo), "gbuffer albedo")?;
        let normal = bound(ctx.get_texture(self.gbuffer.normal), "gbuffer normal")?;
        let position = bound(ctx.get_texture(self.gbuffer.position), "gbuffer position")?;
        let shadow = bound(ctx.get_texture(self.shadow_map), "shadow map")?;

        let unfiltered = BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: false },
        };
        let backend = ctx.backend();
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry::new(gbuffer_bindings::ALBEDO, ShaderStageFlags::FRAGMENT, unfiltered.clone()),
            BindGroupLayoutEntry::new(gbuffer_bindings::NORMAL, ShaderStageFlags::FRAGMENT, unfiltered.clone()),
            BindGroupLayoutEntry::new(gbuffer_bindings::POSITION, ShaderStageFlags::FRAGMENT, unfiltered),
            BindGroupLayoutEntry::new(
                gbuffer_bindings::SHADOW_MAP,
                ShaderStageFlags::FRAGMENT,
                BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                },
            ),
            BindGroupLayoutEntry::new(
                gbuffer_bindings::SHADOW_SAMPLER,
                ShaderStageFlags::FRAGMENT,
                BindingType::Sampler { comparison: true },
            ),
        ])?;
        let sampler = backend.create_sampler(&SamplerDescriptor::shadow_comparison("Lighting Shadow Sampler"))?;
        let group = backend.create_bind_group(
            layout,
            &[
                (gbuffer_bindings::ALBEDO, BindGroupEntry::Texture(albedo)),
                (gbuffer_bindings::NORMAL, BindGroupEntry::Texture(normal)),
                (gbuffer_bindings::POSITION, BindGroupEntry::Texture(position)),
                (gbuffer_bindings::SHADOW_MAP, BindGroupEntry::Texture(shadow)),
                (gbuffer_bindings::SHADOW_SAMPLER, BindGroupEntry::Sampler(sampler)),
            ],
        )?;
        Ok((layout, group))
    }
}

impl RenderPass for LightingPass {
    fn name(&self) -> &str {
        "Lighting Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        self.scene.declare(ctx);
        ctx.read(self.gbuffer.albedo, ResourceUsage::TextureRead);
        ctx.read(self.gbuffer.normal, ResourceUsage::TextureRead);
        ctx.read(self.gbuffer.position, ResourceUsage::TextureRead);
        ctx.read(self.gbuffer.depth, ResourceUsage::DepthStencilRead);
        ctx.read(self.shadow_map, ResourceUsage::TextureRead);
        ctx.write(self.output, ResourceUsage::RenderTarget);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(LIGHTING_PROGRAM)?.to_string();
        let output_format = if self.hdr_output {
            HDR_FORMAT
        } else {
            ctx.backend().surface_format()
        };
        let scene_layout = SceneInputs::create_layout(ctx.backend())?;
        self.scene_groups = self.scene.create_bind_groups(ctx, scene_layout)?;
        let (gbuffer_layout, gbuffer_group) = self.create_gbuffer_group(ctx)?;
        self.gbuffer_group = Some(gbuffer_group);

        let mut stencil_tested = DepthStencilState::depth(GBUFFER_DEPTH_FORMAT, false, CompareFunction::Always);
        stencil_tested.stencil = StencilState::equal_to_reference();

        let mut directional = RenderPipelineDescriptor::new(LIGHTING_PROGRAM, &source);
        directional.label = Some("Directional Lighting Pipeline".into());
        directional.vertex_entry = "vs_fullscreen".into();
        directional.fragment_entry = Some("fs_directional".into());
        directional.cull_mode = CullMode::None;
        directional.bind_group_layouts = vec![scene_layout, gbuffer_layout];
        directional.depth_stencil = Some(stencil_tested.clone());
        directional.color_targets = vec![ColorTargetState::opaque(output_format)];
        self.directional_pipeline = Some(ctx.backend().create_render_pipeline(&directional)?);

        let mut volume = RenderPipelineDescriptor::new(LIGHTING_PROGRAM, &source);
        volume.label = Some("Light Volume Pipeline".into());
        volume.vertex_entry = "vs_volume".into();
        volume.fragment_entry = Some("fs_volume".into());
        // Back faces still rasterize when the camera is inside a volume
        volume.cull_mode = CullMode::Front;
        volume.vertex_layouts = vec![Vertex::layout()];
        volume.bind_group_layouts = vec![scene_layout, gbuffer_layout];
        volume.depth_stencil = Some(stencil_tested);
        volume.color_targets = vec![ColorTargetState {
            blend: Some(BlendState::additive()),
            ..ColorTargetState::opaque(output_format)
        }];
        self.volume_pipeline = Some(ctx.backend().create_render_pipeline(&volume)?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let (Some(directional), Some(volume), Some(&scene_group), Some(gbuffer_group)) = (
            self.directional_pipeline,
            self.volume_pipeline,
            self.scene_groups.get(ctx.frame.slot),
            self.gbuffer_group,
        ) else {
            log::error!("Lighting pass executed before prepare");
            return;
        };
        let (Some(output), Some(depth)) = (ctx.get_texture(self.output), ctx.get_texture(self.gbuffer.depth))
        else {
            log::error!("Lighting pass: output or depth not bound");
            return;
        };
        let first_volume = ctx.frame.directional_lights;
        let volumes = ctx.frame.point_lights;
        let index_count = self.light_volume.submeshes.iter().map(|s| s.index_count).sum::<u32>();

        let backend = ctx.backend();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Lighting Pass".into()),
            color_attachments: vec![cleared(output, self.clear_color)],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Load,
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                depth_read_only: true,
                stencil: None,
            }),
        });
        backend.set_stencil_reference(LIT_STENCIL_REFERENCE);
        backend.set_bind_group(0, scene_group);
        backend.set_bind_group(1, gbuffer_group);

        backend.set_render_pipeline(directional);
        backend.draw(0..3, 0..1);

        if volumes > 0 {
            backend.set_render_pipeline(volume);
            backend.set_vertex_buffer(0, self.light_volume.vertex_buffer, 0);
            backend.set_index_buffer(self.light_volume.index_buffer, 0, self.light_volume.index_format);
            backend.draw_indexed(0..index_count, 0, first_volume..first_volume + volumes);
        }
        backend.end_render_pass();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

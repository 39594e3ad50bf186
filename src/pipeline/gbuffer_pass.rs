//! G-buffer pass for deferred rendering
//!
//! Replays the ICB into three color targets plus depth/stencil:
//! - Albedo: base color, alpha carries ambient occlusion
//! - Normal: world-space normal, alpha carries roughness
//! - Position: world-space position, alpha carries metallic
//!
//! Every covered pixel is stamped with [`LIT_STENCIL_REFERENCE`] so the lighting pass
//! only shades geometry.

use std::any::Any;

use super::*;
use crate::gpu_driven::optimizer::ReplayPlan;

pub const GBUFFER_PROGRAM: &str = "gbuffer";

pub const GBUFFER_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
    @location(4) @interpolate(flat) material: u32,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) position: vec4<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    let transform = transforms[in.instance];
    let normals = normal_matrix(transform);
    let world = transform.model * vec4<f32>(in.position, 1.0);
    var out: VertexOutput;
    out.clip_position = frame.view_proj * world;
    out.world_position = world.xyz;
    out.normal = normalize(normals * in.normal);
    out.uv = in.uv * transform.tiling;
    out.tangent = vec4<f32>(normalize(normals * in.tangent.xyz), in.tangent.w);
    out.material = records[in.instance].material_index;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> GBufferOutput {
    let material = materials[in.material];
    let base = sample_channel(material, 0u, in.uv, vec4<f32>(1.0)) * material.base_color;
    let opacity = base.a * sample_channel(material, 5u, in.uv, vec4<f32>(1.0)).r;
    if ((frame.counts.w & FLAG_ALPHA_TEST) != 0u && opacity < 0.1) {
        discard;
    }

    var normal = normalize(in.normal);
    let slot = texture_slot(material, 1u);
    if (slot != NO_TEXTURE) {
        let tangent = normalize(in.tangent.xyz - normal * dot(normal, in.tangent.xyz));
        let bitangent = cross(normal, tangent) * in.tangent.w;
        let mapped = textureSample(heap_textures[slot], material_sampler, in.uv).xyz * 2.0 - 1.0;
        normal = normalize(mat3x3<f32>(tangent, bitangent, normal) * mapped);
    }

    let roughness = material.params.x * sample_channel(material, 2u, in.uv, vec4<f32>(1.0)).r;
    let metallic = material.params.y * sample_channel(material, 3u, in.uv, vec4<f32>(1.0)).r;
    let occlusion = material.params.z * sample_channel(material, 4u, in.uv, vec4<f32>(1.0)).r;

    var out: GBufferOutput;
    out.albedo = vec4<f32>(base.rgb, occlusion);
    out.normal = vec4<f32>(normal * 0.5 + 0.5, roughness);
    out.position = vec4<f32>(in.world_position, metallic);
    return out;
}
"#;

pub struct GBufferPass {
    scene: SceneInputs,
    commands: ResourceId,
    heap: ResourceId,
    shadow_map: ResourceId,
    targets: GBufferTargets,
    plan: ReplayPlan,
    pipeline: Option<RenderPipelineHandle>,
    scene_groups: Vec<BindGroupHandle>,
    texture_group: Option<BindGroupHandle>,
}

impl GBufferPass {
    pub fn new(
        scene: SceneInputs,
        commands: ResourceId,
        heap: ResourceId,
        shadow_map: ResourceId,
        targets: GBufferTargets,
        plan: ReplayPlan,
    ) -> Self {
        Self {
            scene,
            commands,
            heap,
            shadow_map,
            targets,
            plan,
            pipeline: None,
            scene_groups: Vec::new(),
            texture_group: None,
        }
    }

    pub fn targets(&self) -> GBufferTargets {
        self.targets
    }
}

impl RenderPass for GBufferPass {
    fn name(&self) -> &str {
        "G-Buffer Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        self.scene.declare(ctx);
        ctx.read(self.commands, ResourceUsage::IndirectRead);
        ctx.read(self.heap, ResourceUsage::HeapRead);
        // Bound in the shared texture group
        ctx.read(self.shadow_map, ResourceUsage::TextureRead);
        ctx.write(self.targets.albedo, ResourceUsage::RenderTarget);
        ctx.write(self.targets.normal, ResourceUsage::RenderTarget);
        ctx.write(self.targets.position, ResourceUsage::RenderTarget);
        ctx.write(self.targets.depth, ResourceUsage::DepthStencilWrite);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(GBUFFER_PROGRAM)?.to_string();
        let scene_layout = SceneInputs::create_layout(ctx.backend())?;
        self.scene_groups = self.scene.create_bind_groups(ctx, scene_layout)?;
        let (texture_layout, texture_group) = create_texture_bindings(ctx, self.heap, self.shadow_map)?;
        self.texture_group = Some(texture_group);

        let mut depth = DepthStencilState::depth(GBUFFER_DEPTH_FORMAT, true, CompareFunction::Less);
        depth.stencil = StencilState::stamp();
        let mut desc = RenderPipelineDescriptor::new(GBUFFER_PROGRAM, &source);
        desc.label = Some("G-Buffer Pipeline".into());
        desc.vertex_layouts = vec![Vertex::layout()];
        desc.bind_group_layouts = vec![scene_layout, texture_layout];
        desc.depth_stencil = Some(depth);
        desc.color_targets = vec![
            ColorTargetState::opaque(GBUFFER_ALBEDO_FORMAT),
            ColorTargetState::opaque(GBUFFER_NORMAL_FORMAT),
            ColorTargetState::opaque(GBUFFER_POSITION_FORMAT),
        ];
        self.pipeline = Some(ctx.backend().create_render_pipeline(&desc)?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let (Some(pipeline), Some(&scene_group), Some(texture_group)) = (
            self.pipeline,
            self.scene_groups.get(ctx.frame.slot),
            self.texture_group,
        ) else {
            log::error!("G-buffer pass executed before prepare");
            return;
        };
        let (Some(albedo), Some(normal), Some(position), Some(depth), Some(commands)) = (
            ctx.get_texture(self.targets.albedo),
            ctx.get_texture(self.targets.normal),
            ctx.get_texture(self.targets.position),
            ctx.get_texture(self.targets.depth),
            ctx.get_buffer(self.commands),
        ) else {
            log::error!("G-buffer pass: resources not bound");
            return;
        };
        let draw = ctx.frame.drawable_count > 0;

        let backend = ctx.backend();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("G-Buffer Pass".into()),
            color_attachments: vec![
                cleared(albedo, [0.0; 4]),
                cleared(normal, [0.0; 4]),
                cleared(position, [0.0; 4]),
            ],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                depth_read_only: false,
                stencil: Some(StencilAttachmentOps {
                    clear_value: Some(0),
                    store_op: StoreOp::Store,
                }),
            }),
        });
        if draw {
            backend.set_render_pipeline(pipeline);
            backend.set_bind_group(0, scene_group);
            backend.set_bind_group(1, texture_group);
            backend.set_stencil_reference(LIT_STENCIL_REFERENCE);
            self.plan.replay(backend, commands);
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

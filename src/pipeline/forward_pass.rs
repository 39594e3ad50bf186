//! Forward rendering pass
//!
//! Shades every object directly by replaying the ICB with alpha blending. Used when
//! the renderer runs in forward mode instead of G-buffer plus lighting.

use std::any::Any;

use super::*;
use crate::gpu_driven::optimizer::ReplayPlan;

pub const FORWARD_PROGRAM: &str = "forward";

pub const FORWARD_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) @interpolate(flat) material: u32,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    let transform = transforms[in.instance];
    let world = transform.model * vec4<f32>(in.position, 1.0);
    var out: VertexOutput;
    out.clip_position = frame.view_proj * world;
    out.world_position = world.xyz;
    out.normal = normalize(normal_matrix(transform) * in.normal);
    out.uv = in.uv * transform.tiling;
    out.material = records[in.instance].material_index;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let material = materials[in.material];
    let base = sample_channel(material, 0u, in.uv, vec4<f32>(1.0)) * material.base_color;
    let opacity = base.a * sample_channel(material, 5u, in.uv, vec4<f32>(1.0)).r;
    if ((frame.counts.w & FLAG_ALPHA_TEST) != 0u && opacity < 0.1) {
        discard;
    }

    let normal = normalize(in.normal);
    let view = normalize(frame.camera_position.xyz - in.world_position);
    let occlusion = material.params.z * sample_channel(material, 4u, in.uv, vec4<f32>(1.0)).r;
    let shininess = max(material.params.w, 1.0);
    var color = base.rgb * frame.ambient.rgb * frame.ambient.w * occlusion;

    let light_count = frame.counts.x + frame.counts.y;
    for (var i = 0u; i < light_count; i++) {
        let light = lights[i];
        var to_light: vec3<f32>;
        var radiance = light.color_intensity.rgb * light.color_intensity.w;
        if (i < frame.counts.x) {
            to_light = normalize(-light.direction_type.xyz);
            if (i == 0u) {
                radiance *= shadow_factor(in.world_position);
            }
        } else {
            let offset = light.position_radius.xyz - in.world_position;
            radiance *= light_attenuation(light, offset);
            to_light = normalize(offset);
        }
        let n_dot_l = max(dot(normal, to_light), 0.0);
        let half_vector = normalize(to_light + view);
        let specular = material.specular.rgb * pow(max(dot(normal, half_vector), 0.0), shininess);
        color += (base.rgb + specular) * radiance * n_dot_l;
    }
    return vec4<f32>(color, opacity);
}
"#;

pub struct ForwardPass {
    scene: SceneInputs,
    commands: ResourceId,
    heap: ResourceId,
    shadow_map: ResourceId,
    output: ResourceId,
    hdr_output: bool,
    clear_color: [f32; 4],
    plan: ReplayPlan,
    depth: Option<ResourceId>,
    pipeline: Option<RenderPipelineHandle>,
    scene_groups: Vec<BindGroupHandle>,
    texture_group: Option<BindGroupHandle>,
}

impl ForwardPass {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scene: SceneInputs,
        commands: ResourceId,
        heap: ResourceId,
        shadow_map: ResourceId,
        output: ResourceId,
        hdr_output: bool,
        clear_color: [f32; 4],
        plan: ReplayPlan,
    ) -> Self {
        Self {
            scene,
            commands,
            heap,
            shadow_map,
            output,
            hdr_output,
            clear_color,
            plan,
            depth: None,
            pipeline: None,
            scene_groups: Vec::new(),
            texture_group: None,
        }
    }

    pub fn depth_texture(&self) -> Option<ResourceId> {
        self.depth
    }
}

impl RenderPass for ForwardPass {
    fn name(&self) -> &str {
        "Forward Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        let depth = ctx.create_texture_relative(
            "forward_depth",
            TextureSize::default(),
            FORWARD_DEPTH_FORMAT,
            TextureUsage::RENDER_ATTACHMENT,
        );
        self.depth = Some(depth);

        self.scene.declare(ctx);
        ctx.read(self.commands, ResourceUsage::IndirectRead);
        ctx.read(self.heap, ResourceUsage::HeapRead);
        ctx.read(self.shadow_map, ResourceUsage::TextureRead);
        ctx.write(depth, ResourceUsage::DepthStencilWrite);
        ctx.write(self.output, ResourceUsage::RenderTarget);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(FORWARD_PROGRAM)?.to_string();
        let output_format = if self.hdr_output {
            HDR_FORMAT
        } else {
            ctx.backend().surface_format()
        };
        let scene_layout = SceneInputs::create_layout(ctx.backend())?;
        self.scene_groups = self.scene.create_bind_groups(ctx, scene_layout)?;
        let (texture_layout, texture_group) = create_texture_bindings(ctx, self.heap, self.shadow_map)?;
        self.texture_group = Some(texture_group);

        let mut desc = RenderPipelineDescriptor::new(FORWARD_PROGRAM, &source);
        desc.label = Some("Forward Pipeline".into());
        desc.vertex_layouts = vec![Vertex::layout()];
        desc.bind_group_layouts = vec![scene_layout, texture_layout];
        desc.depth_stencil = Some(DepthStencilState::depth(
            FORWARD_DEPTH_FORMAT,
            true,
            CompareFunction::Less,
        ));
        desc.color_targets = vec![ColorTargetState {
            blend: Some(BlendState::alpha_blending()),
            ..ColorTargetState::opaque(output_format)
        }];
        self.pipeline = Some(ctx.backend().create_render_pipeline(&desc)?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let (Some(pipeline), Some(&scene_group), Some(texture_group), Some(depth)) = (
            self.pipeline,
            self.scene_groups.get(ctx.frame.slot),
            self.texture_group,
            self.depth,
        ) else {
            log::error!("Forward pass executed before prepare");
            return;
        };
        let (Some(output), Some(depth_view), Some(commands)) = (
            ctx.get_texture(self.output),
            ctx.get_texture(depth),
            ctx.get_buffer(self.commands),
        ) else {
            log::error!("Forward pass: resources not bound");
            return;
        };
        let draw = ctx.frame.drawable_count > 0;

        let backend = ctx.backend();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Forward Pass".into()),
            color_attachments: vec![cleared(output, self.clear_color)],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth_view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
                depth_read_only: false,
                stencil: None,
            }),
        });
        if draw {
            backend.set_render_pipeline(pipeline);
            backend.set_bind_group(0, scene_group);
            backend.set_bind_group(1, texture_group);
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

//! Directional shadow map pass

use std::any::Any;

use super::{bound, SceneInputs, SHADOW_FORMAT};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RendererResult;
use crate::gpu_driven::optimizer::ReplayPlan;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

pub const SHADOW_PROGRAM: &str = "shadow";

pub const SHADOW_SHADER: &str = r#"
@vertex
fn vs_main(in: VertexInput) -> @builtin(position) vec4<f32> {
    let world = transforms[in.instance].model * vec4<f32>(in.position, 1.0);
    return frame.shadow_view_proj * world;
}
"#;

/// Renders scene depth from the first directional light by replaying the ICB.
///
/// The map is always cleared so the lighting programs can sample it even when no
/// directional light exists.
pub struct ShadowPass {
    scene: SceneInputs,
    commands: ResourceId,
    shadow_map: ResourceId,
    plan: ReplayPlan,
    enabled: bool,
    pipeline: Option<RenderPipelineHandle>,
    bind_groups: Vec<BindGroupHandle>,
}

impl ShadowPass {
    pub fn new(
        scene: SceneInputs,
        commands: ResourceId,
        shadow_map: ResourceId,
        plan: ReplayPlan,
        enabled: bool,
    ) -> Self {
        Self {
            scene,
            commands,
            shadow_map,
            plan,
            enabled,
            pipeline: None,
            bind_groups: Vec::new(),
        }
    }

    pub fn shadow_map(&self) -> ResourceId {
        self.shadow_map
    }
}

impl RenderPass for ShadowPass {
    fn name(&self) -> &str {
        "Shadow Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        self.scene.declare(ctx);
        ctx.read(self.commands, ResourceUsage::IndirectRead);
        ctx.write(self.shadow_map, ResourceUsage::DepthStencilWrite);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(SHADOW_PROGRAM)?.to_string();
        let layout = SceneInputs::create_layout(ctx.backend())?;
        self.bind_groups = self.scene.create_bind_groups(ctx, layout)?;

        let mut depth = DepthStencilState::depth(SHADOW_FORMAT, true, CompareFunction::LessEqual);
        depth.bias = DepthBias {
            constant: 2,
            slope_scale: 2.0,
            clamp: 0.0,
        };
        let mut desc = RenderPipelineDescriptor::new(SHADOW_PROGRAM, &source);
        desc.label = Some("Shadow Pipeline".into());
        desc.fragment_entry = None;
        desc.vertex_layouts = vec![Vertex::layout()];
        desc.bind_group_layouts = vec![layout];
        desc.depth_stencil = Some(depth);
        self.pipeline = Some(ctx.backend().create_render_pipeline(&desc)?);
        bound(ctx.get_texture(self.shadow_map), "shadow map")?;
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let (Some(pipeline), Some(&group)) = (self.pipeline, self.bind_groups.get(ctx.frame.slot)) else {
            log::error!("Shadow pass executed before prepare");
            return;
        };
        let (Some(view), Some(commands)) = (ctx.get_texture(self.shadow_map), ctx.get_buffer(self.commands))
        else {
            log::error!("Shadow pass: resources not bound");
            return;
        };
        let replay = self.enabled && ctx.frame.directional_lights > 0 && ctx.frame.drawable_count > 0;

        let backend = ctx.backend();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Shadow Pass".into()),
            color_attachments: Vec::new(),
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                depth_read_only: false,
                stencil: None,
            }),
        });
        if replay {
            backend.set_render_pipeline(pipeline);
            backend.set_bind_group(0, group);
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

//! Tonemaps the HDR target into the presentable surface

use std::any::Any;

use super::*;

pub const COMPOSITE_PROGRAM: &str = "composite";

pub const COMPOSITE_SHADER: &str = r#"
@group(0) @binding(0) var hdr_color: texture_2d<f32>;
@group(0) @binding(1) var hdr_sampler: sampler;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.clip_position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}

// ACES filmic approximation
fn tonemap(color: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return clamp((color * (a * color + b)) / (color * (c * color + d) + e), vec3<f32>(0.0), vec3<f32>(1.0));
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let hdr = textureSample(hdr_color, hdr_sampler, in.uv);
    return vec4<f32>(tonemap(hdr.rgb), 1.0);
}
"#;

pub struct CompositePass {
    input: ResourceId,
    output: ResourceId,
    pipeline: Option<RenderPipelineHandle>,
    bind_group: Option<BindGroupHandle>,
}

impl CompositePass {
    pub fn new(input: ResourceId, output: ResourceId) -> Self {
        Self {
            input,
            output,
            pipeline: None,
            bind_group: None,
        }
    }
}

impl RenderPass for CompositePass {
    fn name(&self) -> &str {
        "Composite Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        ctx.read(self.input, ResourceUsage::TextureRead);
        ctx.write(self.output, ResourceUsage::RenderTarget);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(COMPOSITE_PROGRAM)?.to_string();
        let input = bound(ctx.get_texture(self.input), "hdr color")?;
        let backend = ctx.backend();
        let surface_format = backend.surface_format();
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry::new(
                0,
                ShaderStageFlags::FRAGMENT,
                BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                },
            ),
            BindGroupLayoutEntry::new(1, ShaderStageFlags::FRAGMENT, BindingType::Sampler { comparison: false }),
        ])?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Composite Sampler".into()),
            ..Default::default()
        })?;
        self.bind_group = Some(backend.create_bind_group(
            layout,
            &[(0, BindGroupEntry::Texture(input)), (1, BindGroupEntry::Sampler(sampler))],
        )?);

        let mut desc = RenderPipelineDescriptor::new(COMPOSITE_PROGRAM, &source);
        desc.label = Some("Composite Pipeline".into());
        desc.cull_mode = CullMode::None;
        desc.bind_group_layouts = vec![layout];
        desc.color_targets = vec![ColorTargetState::opaque(surface_format)];
        self.pipeline = Some(backend.create_render_pipeline(&desc)?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let (Some(pipeline), Some(group)) = (self.pipeline, self.bind_group) else {
            log::error!("Composite pass executed before prepare");
            return;
        };
        let Some(output) = ctx.get_texture(self.output) else {
            log::error!("Composite pass: surface not bound");
            return;
        };
        let backend = ctx.backend();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Composite Pass".into()),
            color_attachments: vec![cleared(output, [0.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
        });
        backend.set_render_pipeline(pipeline);
        backend.set_bind_group(0, group);
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

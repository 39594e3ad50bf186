//! Command synthesis: one compute invocation per drawable writes ICB slot `i`.
//!
//! The kernel reads argument record `i`, draw template `i` and transform `i`, and
//! emits an indexed draw whose `first_instance` is the transform index. Vertex
//! programs use that instance index to find the object's transform and material, so
//! slot `i` always draws drawable `i`. Culled or degenerate drawables keep their slot
//! with an instance count of zero.

use std::any::Any;

use glam::{Vec3, Vec4};

use super::commands::DrawIndexedIndirectArgs;
use super::layout::*;
use crate::backend::headless::KernelInvocation;
use crate::backend::traits::*;
use crate::error::{RendererError, RendererResult};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

pub const ENCODE_COMMANDS_PROGRAM: &str = "encode_commands";

/// Invocations per workgroup of the synthesis kernel
pub const WORKGROUP_SIZE: u32 = 64;

/// Bindings of the synthesis kernel, all in group 0
pub mod bindings {
    pub const PARAMS: u32 = 0;
    pub const RECORDS: u32 = 1;
    pub const TEMPLATES: u32 = 2;
    pub const TRANSFORMS: u32 = 3;
    pub const COMMANDS: u32 = 4;
    pub const FRAME: u32 = 5;
}

/// True when a world-space sphere is at least partly inside every plane
pub fn sphere_in_frustum(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    planes
        .iter()
        .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
}

/// The draw command for one drawable.
///
/// `frustum` enables culling against the given inward-facing planes.
pub fn synthesize_command(
    record: &ArgumentRecord,
    template: &DrawTemplate,
    transform: &ObjectTransformRecord,
    frustum: Option<&[Vec4; 6]>,
) -> DrawIndexedIndirectArgs {
    let visible = match frustum {
        Some(planes) => {
            let center = transform.model.transform_point3(template.bounds.truncate());
            let scale = transform
                .model
                .x_axis
                .truncate()
                .length()
                .max(transform.model.y_axis.truncate().length())
                .max(transform.model.z_axis.truncate().length());
            sphere_in_frustum(center, template.bounds.w * scale, planes)
        }
        None => true,
    };
    let drawn = visible && !transform.is_culled() && template.index_count > 0;
    DrawIndexedIndirectArgs::new(
        template.index_count,
        u32::from(drawn),
        template.first_index,
        template.base_vertex,
        record.transform_index,
    )
}

/// Command the kernel writes for one slot.
///
/// A layout version mismatch or a missing transform keeps the slot's template and
/// instance index but suppresses the draw.
pub fn encode_slot(
    params: &SynthesisParams,
    record: &ArgumentRecord,
    template: &DrawTemplate,
    transform: Option<&ObjectTransformRecord>,
    frustum: Option<&[Vec4; 6]>,
) -> DrawIndexedIndirectArgs {
    match transform {
        Some(transform) if params.layout_version == LAYOUT_VERSION => {
            synthesize_command(record, template, transform, frustum)
        }
        _ => DrawIndexedIndirectArgs::new(
            template.index_count,
            0,
            template.first_index,
            template.base_vertex,
            record.transform_index,
        ),
    }
}

/// Host implementation of [`ENCODE_COMMANDS_SHADER`] for the headless backend
pub fn encode_commands_host(invocation: &mut KernelInvocation<'_>) {
    let Some(params) = invocation.read_first::<SynthesisParams>(0, bindings::PARAMS) else {
        log::error!("encode_commands: params not bound");
        return;
    };
    let (Some(records), Some(templates), Some(transforms)) = (
        invocation.read::<ArgumentRecord>(0, bindings::RECORDS),
        invocation.read::<DrawTemplate>(0, bindings::TEMPLATES),
        invocation.read::<ObjectTransformRecord>(0, bindings::TRANSFORMS),
    ) else {
        log::error!("encode_commands: descriptor table not bound");
        return;
    };
    let frame = invocation
        .read_first::<FrameUniforms>(0, bindings::FRAME)
        .unwrap_or_default();

    let [groups, _, _] = invocation.workgroups();
    let invocations = groups.saturating_mul(WORKGROUP_SIZE);
    let count = params.drawable_count.min(invocations) as usize;
    let frustum = (params.culling_enabled != 0).then_some(&frame.frustum);
    for i in 0..count {
        let (Some(record), Some(template)) = (records.get(i), templates.get(i)) else {
            break;
        };
        let transform = transforms.get(record.transform_index as usize);
        let command = encode_slot(&params, record, template, transform, frustum);
        if !invocation.write(0, bindings::COMMANDS, i, &command) {
            log::error!("encode_commands: slot {} past the end of the command buffer", i);
            break;
        }
    }
}

/// Graph resources the synthesis dispatch binds
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInputs {
    pub params: ResourceId,
    pub records: ResourceId,
    pub templates: ResourceId,
    /// Frame ring
    pub transforms: ResourceId,
    /// Frame ring
    pub frame_uniforms: ResourceId,
    pub commands: ResourceId,
}

/// Compute pass that fills the synthesized ICB
pub struct CommandSynthesisPass {
    inputs: SynthesisInputs,
    pipeline: Option<ComputePipelineHandle>,
    /// One per frame ring slot
    bind_groups: Vec<BindGroupHandle>,
}

impl CommandSynthesisPass {
    pub fn new(inputs: SynthesisInputs) -> Self {
        Self {
            inputs,
            pipeline: None,
            bind_groups: Vec::new(),
        }
    }
}

fn bound<T>(value: Option<T>, what: &str) -> RendererResult<T> {
    value.ok_or_else(|| RendererError::InvalidConfig(format!("graph resource '{}' is not bound", what)))
}

impl RenderPass for CommandSynthesisPass {
    fn name(&self) -> &str {
        "Command Synthesis"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        ctx.read(self.inputs.params, ResourceUsage::UniformBuffer);
        ctx.read(self.inputs.frame_uniforms, ResourceUsage::UniformBuffer);
        ctx.read(self.inputs.records, ResourceUsage::StorageBufferRead);
        ctx.read(self.inputs.templates, ResourceUsage::StorageBufferRead);
        ctx.read(self.inputs.transforms, ResourceUsage::StorageBufferRead);
        ctx.write(self.inputs.commands, ResourceUsage::StorageBufferWrite);
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> RendererResult<()> {
        let source = ctx.gfx.library().source(ENCODE_COMMANDS_PROGRAM)?.to_string();
        let params = bound(ctx.get_buffer(self.inputs.params), "params")?;
        let records = bound(ctx.get_buffer(self.inputs.records), "records")?;
        let templates = bound(ctx.get_buffer(self.inputs.templates), "templates")?;
        let commands = bound(ctx.get_buffer(self.inputs.commands), "commands")?;
        let transforms = ctx.get_slot_buffers(self.inputs.transforms);
        let uniforms = ctx.get_slot_buffers(self.inputs.frame_uniforms);

        let storage = |read_only| BindingType::StorageBuffer { read_only };
        let compute = ShaderStageFlags::COMPUTE;
        let backend = ctx.backend();
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry::new(bindings::PARAMS, compute, BindingType::UniformBuffer),
            BindGroupLayoutEntry::new(bindings::RECORDS, compute, storage(true)),
            BindGroupLayoutEntry::new(bindings::TEMPLATES, compute, storage(true)),
            BindGroupLayoutEntry::new(bindings::TRANSFORMS, compute, storage(true)),
            BindGroupLayoutEntry::new(bindings::COMMANDS, compute, storage(false)),
            BindGroupLayoutEntry::new(bindings::FRAME, compute, BindingType::UniformBuffer),
        ])?;
        self.pipeline = Some(backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("Command Synthesis".into()),
            program: ENCODE_COMMANDS_PROGRAM.into(),
            source,
            entry_point: "main".into(),
            bind_group_layouts: vec![layout],
        })?);

        self.bind_groups.clear();
        for (transforms, uniforms) in transforms.into_iter().zip(uniforms) {
            let group = backend.create_bind_group(
                layout,
                &[
                    (bindings::PARAMS, BindGroupEntry::buffer(params)),
                    (bindings::RECORDS, BindGroupEntry::buffer(records)),
                    (bindings::TEMPLATES, BindGroupEntry::buffer(templates)),
                    (bindings::TRANSFORMS, BindGroupEntry::buffer(bound(transforms, "transforms")?)),
                    (bindings::COMMANDS, BindGroupEntry::buffer(commands)),
                    (bindings::FRAME, BindGroupEntry::buffer(bound(uniforms, "frame uniforms")?)),
                ],
            )?;
            self.bind_groups.push(group);
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let count = ctx.frame.drawable_count;
        let (Some(pipeline), Some(&group)) = (self.pipeline, self.bind_groups.get(ctx.frame.slot))
        else {
            log::error!("Command synthesis executed before prepare");
            return;
        };
        if count == 0 {
            return;
        }
        let backend = ctx.backend();
        backend.begin_compute_pass(Some("Command Synthesis"));
        backend.set_compute_pipeline(pipeline);
        backend.set_bind_group(0, group);
        backend.dispatch_compute(count.div_ceil(WORKGROUP_SIZE), 1, 1);
        backend.end_compute_pass();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Synthesis kernel. Record structs mirror `gpu_driven::layout` (layout version 1).
pub const ENCODE_COMMANDS_SHADER: &str = r#"
struct SynthesisParams {
    drawable_count: u32,
    layout_version: u32,
    culling_enabled: u32,
    _pad: u32,
}

struct ArgumentRecord {
    geometry_slot: u32,
    material_index: u32,
    index_format: u32,
    transform_index: u32,
}

struct DrawTemplate {
    index_count: u32,
    first_index: u32,
    base_vertex: i32,
    _pad: u32,
    bounds: vec4<f32>,
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

struct DrawCommand {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
}

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

const LAYOUT_VERSION: u32 = 1u;
const FLAG_CULLED: u32 = 1u;

@group(0) @binding(0) var<uniform> params: SynthesisParams;
@group(0) @binding(1) var<storage, read> records: array<ArgumentRecord>;
@group(0) @binding(2) var<storage, read> templates: array<DrawTemplate>;
@group(0) @binding(3) var<storage, read> transforms: array<ObjectTransform>;
@group(0) @binding(4) var<storage, read_write> commands: array<DrawCommand>;
@group(0) @binding(5) var<uniform> frame: FrameUniforms;

fn sphere_visible(center: vec3<f32>, radius: f32) -> bool {
    for (var i = 0u; i < 6u; i++) {
        let plane = frame.frustum[i];
        if (dot(plane.xyz, center) + plane.w < -radius) {
            return false;
        }
    }
    return true;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.drawable_count) {
        return;
    }
    let record = records[i];
    let draw_template = templates[i];
    let transform = transforms[record.transform_index];

    var drawn = params.layout_version == LAYOUT_VERSION
        && (transform.flags & FLAG_CULLED) == 0u
        && draw_template.index_count > 0u;
    if (drawn && params.culling_enabled != 0u) {
        let center = (transform.model * vec4<f32>(draw_template.bounds.xyz, 1.0)).xyz;
        let scale = max(
            length(transform.model[0].xyz),
            max(length(transform.model[1].xyz), length(transform.model[2].xyz)),
        );
        drawn = sphere_visible(center, draw_template.bounds.w * scale);
    }

    var command: DrawCommand;
    command.index_count = draw_template.index_count;
    command.instance_count = select(0u, 1u, drawn);
    command.first_index = draw_template.first_index;
    command.base_vertex = draw_template.base_vertex;
    command.first_instance = record.transform_index;
    commands[i] = command;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;
    use rstest::rstest;

    fn template(index_count: u32) -> DrawTemplate {
        DrawTemplate {
            index_count,
            first_index: 6,
            base_vertex: 2,
            _pad: 0,
            bounds: Vec4::new(0.0, 0.0, 0.0, 1.0),
        }
    }

    fn record(transform_index: u32) -> ArgumentRecord {
        ArgumentRecord {
            transform_index,
            ..Default::default()
        }
    }

    /// Inward planes of the box [-1, 1]^3
    fn unit_box() -> [Vec4; 6] {
        [
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec4::new(-1.0, 0.0, 0.0, 1.0),
            Vec4::new(0.0, 1.0, 0.0, 1.0),
            Vec4::new(0.0, -1.0, 0.0, 1.0),
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            Vec4::new(0.0, 0.0, -1.0, 1.0),
        ]
    }

    #[test]
    fn visible_drawable_gets_one_instance() {
        let command = synthesize_command(&record(3), &template(36), &Default::default(), None);
        assert_eq!(command, DrawIndexedIndirectArgs::new(36, 1, 6, 2, 3));
    }

    #[test]
    fn culled_and_degenerate_drawables_are_suppressed() {
        let culled = ObjectTransformRecord::new(Mat4::IDENTITY, 1.0, true);
        let command = synthesize_command(&record(0), &template(36), &culled, None);
        assert_eq!(command.instance_count, 0);
        assert_eq!(command.index_count, 36);

        let empty = synthesize_command(&record(0), &template(0), &Default::default(), None);
        assert!(empty.is_suppressed());
    }

    #[test]
    fn frustum_culling_uses_scaled_bounds() {
        let planes = unit_box();
        let outside = ObjectTransformRecord::new(Mat4::from_translation(Vec3::X * 5.0), 1.0, false);
        let command = synthesize_command(&record(0), &template(6), &outside, Some(&planes));
        assert_eq!(command.instance_count, 0);

        let scaled = ObjectTransformRecord::new(
            Mat4::from_translation(Vec3::X * 5.0) * Mat4::from_scale(Vec3::splat(4.5)),
            1.0,
            false,
        );
        let command = synthesize_command(&record(0), &template(6), &scaled, Some(&planes));
        assert_eq!(command.instance_count, 1);
    }

    #[rstest]
    #[case::stale_layout(LAYOUT_VERSION + 1, true)]
    #[case::missing_transform(LAYOUT_VERSION, false)]
    fn unusable_slot_keeps_template_and_instance_index(
        #[case] layout_version: u32,
        #[case] with_transform: bool,
    ) {
        let params = SynthesisParams {
            drawable_count: 1,
            layout_version,
            culling_enabled: 0,
            _pad: 0,
        };
        let transform = ObjectTransformRecord::default();
        let command = encode_slot(
            &params,
            &record(7),
            &template(36),
            with_transform.then_some(&transform),
            None,
        );
        assert_eq!(command, DrawIndexedIndirectArgs::new(36, 0, 6, 2, 7));

        let hidden = ObjectTransformRecord::new(Mat4::IDENTITY, 1.0, true);
        assert_eq!(command, synthesize_command(&record(7), &template(36), &hidden, None));
    }

    #[test]
    fn kernel_source_mirrors_host_layout() {
        assert!(ENCODE_COMMANDS_SHADER.contains("@workgroup_size(64)"));
        assert!(ENCODE_COMMANDS_SHADER.contains("const LAYOUT_VERSION: u32 = 1u;"));
        assert_eq!(LAYOUT_VERSION, 1);
    }
}

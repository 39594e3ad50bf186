//! ICB optimizer and replay.
//!
//! The optimizer is a copy pass that moves the synthesized command range into the
//! replay buffer, which is the only buffer render passes draw from. Declaring the
//! synthesized buffer as a transfer read and the replay buffer as a transfer write
//! puts the optimizer strictly between synthesis and every replaying pass.

use std::any::Any;

use super::commands::IndirectCommandBuffer;
use super::descriptor_table::{DescriptorTable, GeometrySlot, ReplayBatch};
use crate::backend::traits::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

/// Copy pass from the synthesized ICB into the replay ICB
pub struct IcbOptimizePass {
    synthesized: ResourceId,
    replay: ResourceId,
}

impl IcbOptimizePass {
    pub fn new(synthesized: ResourceId, replay: ResourceId) -> Self {
        Self {
            synthesized,
            replay,
        }
    }
}

impl RenderPass for IcbOptimizePass {
    fn name(&self) -> &str {
        "ICB Optimize"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) {
        ctx.read(self.synthesized, ResourceUsage::TransferRead);
        ctx.write(self.replay, ResourceUsage::TransferWrite);
    }

    fn execute(&self, ctx: &mut PassExecuteContext) {
        let count = ctx.frame.drawable_count;
        let (Some(src), Some(dst)) = (ctx.get_buffer(self.synthesized), ctx.get_buffer(self.replay))
        else {
            log::error!("ICB optimize: command buffers not bound");
            return;
        };
        if count == 0 {
            return;
        }
        ctx.backend()
            .copy_buffer_to_buffer(src, 0, dst, 0, IndirectCommandBuffer::range_size(count));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Geometry bindings and slot ranges a render pass needs to replay the ICB
#[derive(Debug, Clone, Default)]
pub struct ReplayPlan {
    pub geometry: Vec<GeometrySlot>,
    pub batches: Vec<ReplayBatch>,
}

impl ReplayPlan {
    pub fn from_table(table: &DescriptorTable) -> Self {
        Self {
            geometry: table.geometry().to_vec(),
            batches: table.batches().to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Slots covered by every batch
    pub fn slot_count(&self) -> u32 {
        self.batches.iter().map(|b| b.count).sum()
    }

    /// Record the indirect draws for every batch from `commands`.
    ///
    /// Each batch binds its vertex and index buffers once and issues one indirect draw
    /// over its slot range.
    pub fn replay(&self, backend: &mut dyn GraphicsBackend, commands: BufferHandle) {
        for batch in &self.batches {
            let Some(geometry) = self.geometry.get(batch.geometry_slot as usize) else {
                log::error!("Replay batch references missing geometry slot {}", batch.geometry_slot);
                continue;
            };
            backend.set_vertex_buffer(0, geometry.vertex_buffer, 0);
            backend.set_index_buffer(geometry.index_buffer, 0, geometry.index_format);
            backend.draw_indexed_indirect(
                commands,
                IndirectCommandBuffer::slot_offset(batch.first_slot),
                batch.count,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{DrawKind, HeadlessBackend};
    use crate::gpu_driven::commands::DrawIndexedIndirectArgs;
    use crate::gpu_driven::descriptor_table::Drawable;
    use crate::gpu_driven::layout::MaterialRecord;
    use crate::resources::Mesh;

    #[test]
    fn replay_draws_every_slot_with_its_geometry() {
        let mut backend = HeadlessBackend::new(4, 4);
        let cube = Mesh::cube().upload(&mut backend).unwrap();
        let quad = Mesh::quad().upload(&mut backend).unwrap();

        let mut table = DescriptorTable::new(4);
        table.add_material(MaterialRecord::default());
        let drawables: Vec<Drawable> = [&cube, &quad, &cube]
            .iter()
            .flat_map(|mesh| mesh.drawables(&[0]))
            .collect();
        for drawable in &drawables {
            table.register(drawable).unwrap();
        }

        let icb = IndirectCommandBuffer::new(&mut backend, 4).unwrap();
        let commands: Vec<DrawIndexedIndirectArgs> = drawables
            .iter()
            .enumerate()
            .map(|(i, d)| DrawIndexedIndirectArgs::new(d.index_count, 1, 0, 0, i as u32))
            .collect();
        backend.write_buffer(icb.replay(), 0, bytemuck::cast_slice(&commands));

        let plan = ReplayPlan::from_table(&table);
        assert_eq!(plan.batches.len(), 3);
        backend.begin_encoding("replay");
        plan.replay(&mut backend, icb.replay());
        backend.submit(None).unwrap();

        let draws: Vec<_> = backend.trace().draws().collect();
        assert_eq!(draws.len(), 3);
        for (slot, draw) in draws.iter().enumerate() {
            assert_eq!(
                draw.kind,
                DrawKind::Indirect {
                    buffer: icb.replay(),
                    slot: slot as u32
                }
            );
            assert_eq!(draw.first_instance, slot as u32);
            assert_eq!(draw.index_buffer, Some(drawables[slot].index_buffer));
        }
        assert_eq!(draws[1].element_count, 6);
    }
}

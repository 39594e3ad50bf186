//! Indirect draw command layout and the indirect command buffer (ICB).

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Byte stride between consecutive ICB slots.
pub const COMMAND_STRIDE: u64 = std::mem::size_of::<DrawIndexedIndirectArgs>() as u64;

/// Arguments of one indexed indirect draw, in the order accelerators consume them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

const_assert_eq!(std::mem::size_of::<DrawIndexedIndirectArgs>(), 20);

impl DrawIndexedIndirectArgs {
    pub fn new(
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> Self {
        Self {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        }
    }

    /// A command the accelerator will skip without producing fragments.
    pub fn is_suppressed(&self) -> bool {
        self.instance_count == 0 || self.index_count == 0
    }
}

/// Device-resident command storage with a fixed slot count.
///
/// The synthesized buffer is written by the synthesis kernel; the replay buffer is what
/// render passes draw from once the optimizer has copied the synthesized range across.
#[derive(Debug)]
pub struct IndirectCommandBuffer {
    capacity: u32,
    synthesized: BufferHandle,
    replay: BufferHandle,
}

impl IndirectCommandBuffer {
    pub fn new(backend: &mut dyn GraphicsBackend, capacity: u32) -> BackendResult<Self> {
        // Zero-sized buffers are rejected by some backends
        let size = COMMAND_STRIDE * capacity.max(1) as u64;
        let synthesized = backend.create_buffer(&BufferDescriptor {
            label: Some("ICB Synthesized".into()),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            mapped_at_creation: false,
        })?;
        let replay = backend.create_buffer(&BufferDescriptor {
            label: Some("ICB Replay".into()),
            size,
            usage: BufferUsage::INDIRECT | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            mapped_at_creation: false,
        })?;
        log::debug!(
            "ICB allocated with {} slots of {} bytes, {} bytes per buffer",
            capacity,
            COMMAND_STRIDE,
            size
        );
        Ok(Self {
            capacity,
            synthesized,
            replay,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn synthesized(&self) -> BufferHandle {
        self.synthesized
    }

    pub fn replay(&self) -> BufferHandle {
        self.replay
    }

    /// Byte offset of slot `index`.
    pub fn slot_offset(index: u32) -> u64 {
        index as u64 * COMMAND_STRIDE
    }

    /// Bytes covered by the first `count` slots.
    pub fn range_size(count: u32) -> u64 {
        count as u64 * COMMAND_STRIDE
    }

    /// Read back the replay buffer's first `count` commands.
    pub fn read_commands(
        &self,
        backend: &mut dyn GraphicsBackend,
        count: u32,
    ) -> BackendResult<Vec<DrawIndexedIndirectArgs>> {
        let bytes = backend.read_buffer(self.replay)?;
        let end = (Self::range_size(count.min(self.capacity)) as usize).min(bytes.len());
        Ok(bytes[..end]
            .chunks_exact(COMMAND_STRIDE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.synthesized);
        backend.destroy_buffer(self.replay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    #[test]
    fn slot_offsets_use_twenty_byte_stride() {
        assert_eq!(IndirectCommandBuffer::slot_offset(0), 0);
        assert_eq!(IndirectCommandBuffer::slot_offset(3), 60);
        assert_eq!(IndirectCommandBuffer::range_size(3), 60);
    }

    #[test]
    fn zero_capacity_still_allocates_one_slot() {
        let mut backend = HeadlessBackend::new(4, 4);
        let icb = IndirectCommandBuffer::new(&mut backend, 0).unwrap();
        assert_eq!(icb.capacity(), 0);
        assert_eq!(backend.read_buffer(icb.replay()).unwrap().len(), 20);
        assert!(icb.read_commands(&mut backend, 0).unwrap().is_empty());
    }

    #[test]
    fn both_buffers_hold_one_stride_per_slot() {
        let mut backend = HeadlessBackend::new(4, 4);
        let icb = IndirectCommandBuffer::new(&mut backend, 5).unwrap();
        for buffer in [icb.synthesized(), icb.replay()] {
            assert_eq!(backend.read_buffer(buffer).unwrap().len() as u64, 5 * COMMAND_STRIDE);
        }
    }

    #[test]
    fn suppression_covers_zero_instances_and_zero_indices() {
        assert!(DrawIndexedIndirectArgs::new(36, 0, 0, 0, 0).is_suppressed());
        assert!(DrawIndexedIndirectArgs::new(0, 1, 0, 0, 0).is_suppressed());
        assert!(!DrawIndexedIndirectArgs::new(6, 1, 36, 0, 1).is_suppressed());
    }
}

//! Host-side execution of compute programs.
//!
//! The headless backend cannot run WGSL, so every compute program it is asked to
//! dispatch must have a host kernel registered under the same program name. A host
//! kernel sees the buffers bound at dispatch time through [`KernelInvocation`].

use std::collections::HashMap;
use std::ops::Range;

use bytemuck::Pod;

use super::HeadlessBuffer;

/// A compute program implemented on the host.
pub type HostKernel = fn(&mut KernelInvocation<'_>);

/// One buffer binding visible to a dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelBinding {
    pub group: u32,
    pub binding: u32,
    pub buffer: u64,
    pub offset: u64,
    pub size: Option<u64>,
}

/// View of the bound buffers during one dispatch.
pub struct KernelInvocation<'a> {
    pub(crate) workgroups: [u32; 3],
    pub(crate) bindings: Vec<KernelBinding>,
    pub(crate) buffers: &'a mut HashMap<u64, HeadlessBuffer>,
}

impl KernelInvocation<'_> {
    /// Workgroup counts passed to the dispatch.
    pub fn workgroups(&self) -> [u32; 3] {
        self.workgroups
    }

    fn bound_range(&self, group: u32, binding: u32) -> Option<(u64, Range<usize>)> {
        let bound = self
            .bindings
            .iter()
            .find(|b| b.group == group && b.binding == binding)?;
        let buffer = self.buffers.get(&bound.buffer)?;
        let start = bound.offset as usize;
        let end = match bound.size {
            Some(size) => start + size as usize,
            None => buffer.data.len(),
        };
        (end <= buffer.data.len()).then_some((bound.buffer, start..end))
    }

    /// Copy out every whole element of type `T` in the bound range.
    pub fn read<T: Pod>(&self, group: u32, binding: u32) -> Option<Vec<T>> {
        let (buffer, range) = self.bound_range(group, binding)?;
        let bytes = &self.buffers.get(&buffer)?.data[range];
        Some(
            bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        )
    }

    /// Read the first element of the bound range, as for a uniform block.
    pub fn read_first<T: Pod>(&self, group: u32, binding: u32) -> Option<T> {
        let (buffer, range) = self.bound_range(group, binding)?;
        let bytes = &self.buffers.get(&buffer)?.data[range];
        let size = std::mem::size_of::<T>();
        (bytes.len() >= size).then(|| bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Store `value` as element `index` of the bound range. Returns false when out of bounds.
    pub fn write<T: Pod>(&mut self, group: u32, binding: u32, index: usize, value: &T) -> bool {
        let Some((buffer, range)) = self.bound_range(group, binding) else {
            return false;
        };
        let size = std::mem::size_of::<T>();
        let start = range.start + index * size;
        if start + size > range.end {
            return false;
        }
        match self.buffers.get_mut(&buffer) {
            Some(target) => {
                target.data[start..start + size].copy_from_slice(bytemuck::bytes_of(value));
                true
            }
            None => false,
        }
    }
}

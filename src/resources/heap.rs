//! Texture heap manager.
//!
//! Textures are interned by name into loose staging textures. `build` carves every
//! staged texture out of one freshly allocated heap and promotes it with a single copy
//! stream covering every mip level and array layer. Afterwards the texture's handle
//! resolves to its heap-resident copy and the staging texture can be released.
//!
//! Each `build` creates a new heap for whatever was staged since the previous one.
//! Residency indices are global across heaps, in promotion order, and are what
//! material records store.

use std::collections::HashMap;
use std::path::Path;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RendererError, RendererResult};
use crate::gpu_driven::layout::NO_TEXTURE;
use crate::resources::texture::TextureData;

/// Handle returned by interning; stable for the manager's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u32);

/// Where a texture handle currently resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Index into the heap-resident texture list
    Resident(u32),
    /// Interned but not yet promoted by `build`
    Staged,
    /// Failed to load; shaders treat it as no texture
    Missing,
}

#[derive(Debug)]
enum EntryState {
    Staged {
        staging: TextureHandle,
        desc: TextureDescriptor,
    },
    Resident {
        index: u32,
    },
    Missing,
}

#[derive(Debug)]
struct Entry {
    name: String,
    state: EntryState,
}

/// A heap-resident texture
#[derive(Debug, Clone)]
pub struct ResidentTexture {
    pub id: TextureId,
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub offset: u64,
    pub desc: TextureDescriptor,
}

/// One device memory arena and the textures placed in it
#[derive(Debug)]
pub struct Heap {
    pub handle: HeapHandle,
    pub size: u64,
    pub textures: Vec<ResidentTexture>,
}

#[derive(Debug, Default)]
pub struct TextureHeap {
    entries: Vec<Entry>,
    by_name: HashMap<String, TextureId>,
    heaps: Vec<Heap>,
    /// Resident textures in residency index order
    resident: Vec<(usize, usize)>,
    /// Staging textures awaiting release and the submission that last read them
    retired_staging: Vec<TextureHandle>,
    promotion: Option<SubmissionId>,
}

fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl TextureHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern texture data by name, staging it for the next `build`.
    ///
    /// Interning a name that is already known returns the existing handle.
    pub fn intern(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        data: &TextureData,
    ) -> RendererResult<TextureId> {
        if let Some(&id) = self.by_name.get(&data.name) {
            log::trace!("Texture '{}' already interned", data.name);
            return Ok(id);
        }

        let desc = data.descriptor();
        let staging = backend.create_texture(&TextureDescriptor {
            label: Some(format!("{} (staging)", data.name)),
            ..desc.clone()
        })?;
        for array_layer in 0..data.array_layers {
            for mip_level in 0..data.mip_levels {
                let subresource = TextureSubresource {
                    mip_level,
                    array_layer,
                };
                if let Some(bytes) = data.subresource(subresource) {
                    backend.write_texture(staging, subresource, bytes);
                }
            }
        }

        log::debug!(
            "Staged texture '{}' ({}x{}, {} mips, {} layers)",
            data.name,
            data.width,
            data.height,
            data.mip_levels,
            data.array_layers
        );
        Ok(self.push_entry(&data.name, EntryState::Staged { staging, desc }))
    }

    /// Intern an image file; its path is its identity.
    ///
    /// Load failures are logged and interned as missing, so the handle resolves to no
    /// texture and the file is not retried.
    pub fn intern_file(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        path: impl AsRef<Path>,
    ) -> RendererResult<TextureId> {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        if let Some(&id) = self.by_name.get(&name) {
            return Ok(id);
        }
        match TextureData::from_file(path) {
            Ok(data) => self.intern(backend, &data),
            Err(err) => {
                log::warn!("Texture '{}' failed to load: {}", name, err);
                Ok(self.intern_missing(&name))
            }
        }
    }

    /// Intern a name that resolves to no texture
    pub fn intern_missing(&mut self, name: &str) -> TextureId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        self.push_entry(name, EntryState::Missing)
    }

    fn push_entry(&mut self, name: &str, state: EntryState) -> TextureId {
        let id = TextureId(self.entries.len() as u32);
        self.entries.push(Entry {
            name: name.to_string(),
            state,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<TextureId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: TextureId) -> Option<&str> {
        self.entries.get(id.0 as usize).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn staged_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, EntryState::Staged { .. }))
            .count()
    }

    pub fn resolve(&self, id: TextureId) -> Residency {
        match self.entries.get(id.0 as usize).map(|e| &e.state) {
            Some(EntryState::Resident { index }) => Residency::Resident(*index),
            Some(EntryState::Staged { .. }) => Residency::Staged,
            Some(EntryState::Missing) | None => Residency::Missing,
        }
    }

    /// Residency index a material record stores for this texture.
    ///
    /// Missing textures encode as "no texture"; a texture that is staged but not yet
    /// promoted is a precondition violation.
    pub fn material_slot(&self, id: Option<TextureId>) -> RendererResult<u32> {
        let Some(id) = id else {
            return Ok(NO_TEXTURE);
        };
        match self.resolve(id) {
            Residency::Resident(index) => Ok(index),
            Residency::Missing => Ok(NO_TEXTURE),
            Residency::Staged => Err(RendererError::UnresidentTexture(
                self.name(id).unwrap_or_default().to_string(),
            )),
        }
    }

    /// Heap-resident texture behind a handle
    pub fn resident_texture(&self, id: TextureId) -> Option<&ResidentTexture> {
        let Residency::Resident(index) = self.resolve(id) else {
            return None;
        };
        let &(heap, slot) = self.resident.get(index as usize)?;
        self.heaps.get(heap)?.textures.get(slot)
    }

    /// Views of every resident texture, indexed by residency index
    pub fn resident_views(&self) -> Vec<TextureViewHandle> {
        self.resident
            .iter()
            .filter_map(|&(heap, slot)| self.heaps.get(heap)?.textures.get(slot))
            .map(|t| t.view)
            .collect()
    }

    pub fn heaps(&self) -> &[Heap] {
        &self.heaps
    }

    /// Most recently built heap
    pub fn current_heap(&self) -> Option<HeapHandle> {
        self.heaps.last().map(|h| h.handle)
    }

    /// Place every staged texture into a new heap and record the promotion copies.
    ///
    /// Returns `None` when nothing is staged.
    pub fn build(&mut self, backend: &mut dyn GraphicsBackend) -> RendererResult<Option<HeapHandle>> {
        let staged: Vec<(usize, TextureHandle, TextureDescriptor)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match &e.state {
                EntryState::Staged { staging, desc } => Some((i, *staging, desc.clone())),
                _ => None,
            })
            .collect();
        if staged.is_empty() {
            log::debug!("Texture heap build: nothing staged");
            return Ok(None);
        }

        let mut placements = Vec::with_capacity(staged.len());
        let mut size = 0u64;
        for (_, _, desc) in &staged {
            let requirements = backend.heap_texture_requirements(desc);
            let offset = align_up(size, requirements.align);
            placements.push(offset);
            size = offset + align_up(requirements.size, requirements.align);
        }

        let handle = backend.create_heap(&HeapDescriptor {
            label: Some(format!("Texture Heap {}", self.heaps.len())),
            size,
        })?;
        log::info!(
            "Texture heap: {} textures in {} bytes",
            staged.len(),
            size
        );

        let mut textures = Vec::with_capacity(staged.len());
        for ((entry, _, desc), &offset) in staged.iter().zip(&placements) {
            let texture = backend.create_heap_texture(handle, offset, desc)?;
            let view = backend.create_texture_view(texture)?;
            textures.push(ResidentTexture {
                id: TextureId(*entry as u32),
                texture,
                view,
                offset,
                desc: desc.clone(),
            });
        }

        backend.begin_encoding("Heap Promotion");
        for ((_, staging, desc), resident) in staged.iter().zip(&textures) {
            for array_layer in 0..desc.array_layers {
                for mip_level in 0..desc.mip_levels {
                    backend.copy_texture_to_texture(
                        *staging,
                        resident.texture,
                        TextureSubresource {
                            mip_level,
                            array_layer,
                        },
                    );
                }
            }
        }
        backend.resource_barrier(&[ResourceBarrier {
            target: BarrierTarget::Heap(handle),
            before: ResourceState::CopyDst,
            after: ResourceState::ShaderRead,
        }]);
        self.promotion = Some(backend.submit(None)?);

        let heap_index = self.heaps.len();
        for (slot, (entry, staging, _)) in staged.iter().enumerate() {
            let index = self.resident.len() as u32;
            self.resident.push((heap_index, slot));
            self.entries[*entry].state = EntryState::Resident { index };
            self.retired_staging.push(*staging);
        }
        self.heaps.push(Heap {
            handle,
            size,
            textures,
        });

        Ok(Some(handle))
    }

    /// Destroy staging textures once their promotion copies have finished
    pub fn release_staging(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.retired_staging.is_empty() {
            return;
        }
        if let Some(promotion) = self.promotion.take() {
            backend.wait_for_submission(promotion);
        }
        log::debug!("Releasing {} staging textures", self.retired_staging.len());
        for texture in self.retired_staging.drain(..) {
            backend.destroy_texture(texture);
        }
    }

    /// Free every heap and staging texture
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_staging(backend);
        for entry in &mut self.entries {
            if let EntryState::Staged { staging, .. } = entry.state {
                backend.destroy_texture(staging);
                entry.state = EntryState::Missing;
            }
        }
        for heap in self.heaps.drain(..) {
            backend.destroy_heap(heap.handle);
        }
        self.resident.clear();
        for entry in &mut self.entries {
            entry.state = EntryState::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    #[test]
    fn offsets_are_aligned_and_sizes_rounded() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(512, 256), 512);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn heap_size_is_sum_of_aligned_footprints() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut heap = TextureHeap::new();
        heap.intern(&mut backend, &TextureData::solid_color([1, 2, 3, 4], "a"))
            .unwrap();
        heap.intern(
            &mut backend,
            &TextureData::checkerboard("b", 16, [255; 4], [0; 4]),
        )
        .unwrap();
        let handle = heap.build(&mut backend).unwrap().unwrap();
        // 4 bytes -> 256, 1024 bytes -> 1024
        assert_eq!(backend.heap_size(handle), Some(256 + 1024));
        assert_eq!(heap.heaps()[0].textures[1].offset, 256);
    }

    #[test]
    fn staged_texture_in_material_is_rejected() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut heap = TextureHeap::new();
        let id = heap.intern(&mut backend, &TextureData::white()).unwrap();
        assert!(matches!(
            heap.material_slot(Some(id)),
            Err(RendererError::UnresidentTexture(name)) if name == "white"
        ));
        heap.build(&mut backend).unwrap();
        assert_eq!(heap.material_slot(Some(id)).unwrap(), 0);
        assert_eq!(heap.material_slot(None).unwrap(), NO_TEXTURE);
    }

    #[test]
    fn unreadable_file_interns_as_missing() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut heap = TextureHeap::new();
        let id = heap
            .intern_file(&mut backend, "does/not/exist.png")
            .unwrap();
        assert_eq!(heap.resolve(id), Residency::Missing);
        assert_eq!(heap.material_slot(Some(id)).unwrap(), NO_TEXTURE);
        assert_eq!(heap.intern_file(&mut backend, "does/not/exist.png").unwrap(), id);
        assert!(heap.build(&mut backend).unwrap().is_none());
    }

    #[test]
    fn release_staging_destroys_loose_textures() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut heap = TextureHeap::new();
        let id = heap.intern(&mut backend, &TextureData::white()).unwrap();
        heap.build(&mut backend).unwrap();
        heap.release_staging(&mut backend);
        let resident = heap.resident_texture(id).unwrap();
        assert!(backend.texture_exists(resident.texture));
        assert_eq!(backend.texture_heap(resident.texture), heap.current_heap());
    }
}

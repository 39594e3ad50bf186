//! Per-object descriptor table.
//!
//! Registration order is slot order: drawable `i` owns argument record `i`, draw
//! template `i` and ICB slot `i`. The table is rebuilt when the set of models changes
//! and is otherwise immutable across frames.

use glam::Vec4;

use super::layout::{ArgumentRecord, DrawTemplate, MaterialRecord};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RendererError, RendererResult};

/// One drawable unit: a submesh of a model with its material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drawable {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    /// Index into the table's material records
    pub material: u32,
    /// Local-space bounding sphere: xyz center, w radius
    pub bounds: Vec4,
}

/// A distinct vertex/index buffer pair that replay binds once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometrySlot {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_format: IndexFormat,
}

/// Contiguous ICB slots sharing one geometry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayBatch {
    pub geometry_slot: u32,
    pub first_slot: u32,
    pub count: u32,
}

/// Device copies of the table.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBuffers {
    pub records: BufferHandle,
    pub templates: BufferHandle,
    pub materials: BufferHandle,
}

#[derive(Debug)]
pub struct DescriptorTable {
    capacity: u32,
    records: Vec<ArgumentRecord>,
    templates: Vec<DrawTemplate>,
    materials: Vec<MaterialRecord>,
    geometry: Vec<GeometrySlot>,
    batches: Vec<ReplayBatch>,
}

impl DescriptorTable {
    /// Create a table that accepts at most `capacity` drawables.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            records: Vec::new(),
            templates: Vec::new(),
            materials: Vec::new(),
            geometry: Vec::new(),
            batches: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a material record and return its index.
    pub fn add_material(&mut self, record: MaterialRecord) -> u32 {
        self.materials.push(record);
        (self.materials.len() - 1) as u32
    }

    /// Register a drawable and return its record index, which is also its ICB slot.
    pub fn register(&mut self, drawable: &Drawable) -> RendererResult<u32> {
        let index = self.records.len() as u32;
        if index >= self.capacity {
            return Err(RendererError::CapacityExceeded {
                requested: index + 1,
                capacity: self.capacity,
            });
        }
        if drawable.material as usize >= self.materials.len() {
            return Err(RendererError::InvalidMaterial {
                drawable: index,
                material: drawable.material,
            });
        }

        let geometry = GeometrySlot {
            vertex_buffer: drawable.vertex_buffer,
            index_buffer: drawable.index_buffer,
            index_format: drawable.index_format,
        };
        let geometry_slot = match self.geometry.iter().position(|g| *g == geometry) {
            Some(slot) => slot as u32,
            None => {
                self.geometry.push(geometry);
                (self.geometry.len() - 1) as u32
            }
        };

        self.records.push(ArgumentRecord {
            geometry_slot,
            material_index: drawable.material,
            index_format: ArgumentRecord::encode_index_format(drawable.index_format),
            transform_index: index,
        });
        self.templates.push(DrawTemplate {
            index_count: drawable.index_count,
            first_index: drawable.first_index,
            base_vertex: drawable.base_vertex,
            _pad: 0,
            bounds: drawable.bounds,
        });

        match self.batches.last_mut() {
            Some(batch) if batch.geometry_slot == geometry_slot => batch.count += 1,
            _ => self.batches.push(ReplayBatch {
                geometry_slot,
                first_slot: index,
                count: 1,
            }),
        }

        Ok(index)
    }

    pub fn records(&self) -> &[ArgumentRecord] {
        &self.records
    }

    pub fn templates(&self) -> &[DrawTemplate] {
        &self.templates
    }

    pub fn materials(&self) -> &[MaterialRecord] {
        &self.materials
    }

    pub fn geometry(&self) -> &[GeometrySlot] {
        &self.geometry
    }

    pub fn batches(&self) -> &[ReplayBatch] {
        &self.batches
    }

    /// Upload records, templates and materials into storage buffers.
    ///
    /// Empty tables still get one zeroed element per buffer so bindings stay valid.
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<DescriptorBuffers> {
        fn storage<T: bytemuck::Pod + Default>(
            backend: &mut dyn GraphicsBackend,
            label: &str,
            items: &[T],
        ) -> BackendResult<BufferHandle> {
            let fallback = [T::default()];
            let items = if items.is_empty() { &fallback[..] } else { items };
            let bytes: &[u8] = bytemuck::cast_slice(items);
            backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(label.into()),
                    size: bytes.len() as u64,
                    usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
                    mapped_at_creation: false,
                },
                bytes,
            )
        }

        log::debug!(
            "Uploading descriptor table: {} drawables, {} materials, {} geometry slots",
            self.records.len(),
            self.materials.len(),
            self.geometry.len()
        );
        Ok(DescriptorBuffers {
            records: storage(backend, "Argument Records", &self.records)?,
            templates: storage(backend, "Draw Templates", &self.templates)?,
            materials: storage(backend, "Material Records", &self.materials)?,
        })
    }
}

impl DescriptorBuffers {
    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.records);
        backend.destroy_buffer(self.templates);
        backend.destroy_buffer(self.materials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawable(vertex: u64, index: u64, index_count: u32) -> Drawable {
        Drawable {
            vertex_buffer: BufferHandle(vertex),
            index_buffer: BufferHandle(index),
            index_format: IndexFormat::Uint32,
            index_count,
            first_index: 0,
            base_vertex: 0,
            material: 0,
            bounds: Vec4::new(0.0, 0.0, 0.0, 1.0),
        }
    }

    #[test]
    fn registration_order_is_slot_order() {
        let mut table = DescriptorTable::new(8);
        table.add_material(MaterialRecord::default());
        assert_eq!(table.register(&drawable(1, 2, 36)).unwrap(), 0);
        assert_eq!(table.register(&drawable(3, 4, 6)).unwrap(), 1);
        assert_eq!(table.register(&drawable(3, 4, 6)).unwrap(), 2);

        let counts: Vec<u32> = table.templates().iter().map(|t| t.index_count).collect();
        assert_eq!(counts, vec![36, 6, 6]);
        assert!(table
            .records()
            .iter()
            .enumerate()
            .all(|(i, r)| r.transform_index == i as u32));
    }

    #[test]
    fn shared_buffers_share_a_geometry_slot_and_batch() {
        let mut table = DescriptorTable::new(8);
        table.add_material(MaterialRecord::default());
        table.register(&drawable(1, 2, 36)).unwrap();
        table.register(&drawable(3, 4, 6)).unwrap();
        table.register(&drawable(3, 4, 12)).unwrap();
        table.register(&drawable(1, 2, 3)).unwrap();

        assert_eq!(table.geometry().len(), 2);
        assert_eq!(
            table.batches(),
            &[
                ReplayBatch { geometry_slot: 0, first_slot: 0, count: 1 },
                ReplayBatch { geometry_slot: 1, first_slot: 1, count: 2 },
                ReplayBatch { geometry_slot: 0, first_slot: 3, count: 1 },
            ]
        );
    }

    #[test]
    fn registration_past_capacity_is_rejected() {
        let mut table = DescriptorTable::new(1);
        table.add_material(MaterialRecord::default());
        table.register(&drawable(1, 2, 6)).unwrap();
        let err = table.register(&drawable(1, 2, 6)).unwrap_err();
        assert!(matches!(
            err,
            RendererError::CapacityExceeded { requested: 2, capacity: 1 }
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_material_is_rejected() {
        let mut table = DescriptorTable::new(4);
        let err = table.register(&drawable(1, 2, 6)).unwrap_err();
        assert!(matches!(err, RendererError::InvalidMaterial { drawable: 0, material: 0 }));
    }
}

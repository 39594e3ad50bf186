//! Mesh data, primitive generators and device upload

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::gpu_driven::descriptor_table::Drawable;
use glam::{Vec2, Vec3, Vec4};

/// An index range of a mesh drawn with one material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submesh {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
    /// Material slot, resolved through the model's material list
    pub material: u32,
}

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<Submesh>,
    pub name: String,
}

/// Vertex and index buffers of an uploaded mesh
#[derive(Debug, Clone)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_format: IndexFormat,
    pub submeshes: Vec<Submesh>,
    /// Local bounding sphere: xyz center, w radius
    pub bounds: Vec4,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            submeshes: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Submeshes, or one covering every index when none were declared
    pub fn submeshes(&self) -> Vec<Submesh> {
        if self.submeshes.is_empty() {
            vec![Submesh {
                first_index: 0,
                index_count: self.indices.len() as u32,
                base_vertex: 0,
                material: 0,
            }]
        } else {
            self.submeshes.clone()
        }
    }

    pub fn with_submesh(mut self, first_index: u32, index_count: u32, material: u32) -> Self {
        self.submeshes.push(Submesh {
            first_index,
            index_count,
            base_vertex: 0,
            material,
        });
        self
    }

    /// Narrowest index format that addresses every vertex
    pub fn index_format(&self) -> IndexFormat {
        if self.vertices.len() <= u16::MAX as usize {
            IndexFormat::Uint16
        } else {
            IndexFormat::Uint32
        }
    }

    /// Index bytes in `index_format`, padded to a 4-byte multiple
    pub fn index_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = match self.index_format() {
            IndexFormat::Uint16 => {
                let narrow: Vec<u16> = self.indices.iter().map(|&i| i as u16).collect();
                bytemuck::cast_slice(&narrow).to_vec()
            }
            IndexFormat::Uint32 => bytemuck::cast_slice(&self.indices).to_vec(),
        };
        bytes.resize(bytes.len().div_ceil(4) * 4, 0);
        bytes
    }

    /// Bounding sphere around the vertex positions
    pub fn bounds(&self) -> Vec4 {
        let Some(first) = self.vertices.first() else {
            return Vec4::ZERO;
        };
        let (min, max) = self
            .vertices
            .iter()
            .fold((first.position, first.position), |(min, max), v| {
                (min.min(v.position), max.max(v.position))
            });
        let center = (min + max) * 0.5;
        let radius = self
            .vertices
            .iter()
            .map(|v| v.position.distance(center))
            .fold(0.0f32, f32::max);
        center.extend(radius)
    }

    /// Upload vertex and index data into device buffers.
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<GpuMesh> {
        log::debug!(
            "Uploading mesh '{}' ({} vertices, {} indices)",
            self.name,
            self.vertices.len(),
            self.indices.len()
        );
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", self.name)),
                size: vertex_bytes.len().max(4) as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            vertex_bytes,
        )?;
        let index_bytes = self.index_bytes();
        let index_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} indices", self.name)),
                size: index_bytes.len().max(4) as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            &index_bytes,
        )?;
        Ok(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_format: self.index_format(),
            submeshes: self.submeshes(),
            bounds: self.bounds(),
        })
    }

    /// Unit cube centered at the origin, four vertices per face
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = mesh.vertices.len() as u32;
            let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
            for (x, y) in corners {
                let position = (normal + right * x + up * y) * 0.5;
                let uv = Vec2::new((x + 1.0) * 0.5, (1.0 - y) * 0.5);
                mesh.vertices.push(Vertex {
                    position,
                    normal,
                    uv,
                    tangent: right.extend(1.0),
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Unit quad on the XZ plane facing +Y
    pub fn quad() -> Self {
        Self::plane(1.0, 1.0, 1)
    }

    /// Single triangle in the XY plane facing +Z
    pub fn triangle() -> Self {
        let mut mesh = Mesh::new("triangle");
        mesh.vertices = vec![
            Vertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec3::Z, Vec2::new(0.0, 1.0)),
            Vertex::new(Vec3::new(0.5, -0.5, 0.0), Vec3::Z, Vec2::new(1.0, 1.0)),
            Vertex::new(Vec3::new(0.0, 0.5, 0.0), Vec3::Z, Vec2::new(0.5, 0.0)),
        ];
        mesh.indices = vec![0, 1, 2];
        mesh
    }

    /// Subdivided plane on the XZ axis
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let subdivisions = subdivisions.max(1);
        let step = Vec2::new(width, depth) / subdivisions as f32;
        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let uv = Vec2::new(x as f32, z as f32) / subdivisions as f32;
                mesh.vertices.push(Vertex::new(
                    Vec3::new(x as f32 * step.x - width * 0.5, 0.0, z as f32 * step.y - depth * 0.5),
                    Vec3::Y,
                    uv,
                ));
            }
        }
        mesh.indices = grid_indices(subdivisions, subdivisions);
        mesh
    }

    /// UV sphere of radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let (segments, rings) = (segments.max(3), rings.max(2));
        for ring in 0..=rings {
            let phi = ring as f32 / rings as f32 * std::f32::consts::PI;
            for segment in 0..=segments {
                let theta = segment as f32 / segments as f32 * std::f32::consts::TAU;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }
        mesh.indices = grid_indices(segments, rings);
        mesh
    }

    /// Icosahedron circumscribing the unit sphere; used as the point-light volume
    pub fn icosahedron() -> Self {
        let mut mesh = Mesh::new("icosahedron");
        let t = (1.0 + 5.0f32.sqrt()) / 2.0;
        let points = [
            (-1.0, t, 0.0),
            (1.0, t, 0.0),
            (-1.0, -t, 0.0),
            (1.0, -t, 0.0),
            (0.0, -1.0, t),
            (0.0, 1.0, t),
            (0.0, -1.0, -t),
            (0.0, 1.0, -t),
            (t, 0.0, -1.0),
            (t, 0.0, 1.0),
            (-t, 0.0, -1.0),
            (-t, 0.0, 1.0),
        ];
        // Inradius of a unit-circumradius icosahedron
        let inradius = 0.794_654_5;
        for (x, y, z) in points {
            let direction = Vec3::new(x, y, z).normalize();
            mesh.vertices
                .push(Vertex::new(direction / inradius, direction, Vec2::ZERO));
        }
        mesh.indices = vec![
            0, 11, 5, 0, 5, 1, 0, 1, 7, 0, 7, 10, 0, 10, 11, 1, 5, 9, 5, 11, 4, 11, 10, 2, 10, 7,
            6, 7, 1, 8, 3, 9, 4, 3, 4, 2, 3, 2, 6, 3, 6, 8, 3, 8, 9, 4, 9, 5, 2, 4, 11, 6, 2, 10,
            8, 6, 7, 9, 8, 1,
        ];
        mesh
    }
}

/// Two triangles per cell of a `columns` x `rows` vertex grid with `columns + 1` vertices per row
fn grid_indices(columns: u32, rows: u32) -> Vec<u32> {
    let mut indices = Vec::with_capacity((columns * rows * 6) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let current = row * (columns + 1) + column;
            let next = current + columns + 1;
            indices.extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
        }
    }
    indices
}

impl GpuMesh {
    /// One drawable per submesh; `materials` maps submesh material slots to table indices
    pub fn drawables(&self, materials: &[u32]) -> Vec<Drawable> {
        self.submeshes
            .iter()
            .map(|submesh| Drawable {
                vertex_buffer: self.vertex_buffer,
                index_buffer: self.index_buffer,
                index_format: self.index_format,
                index_count: submesh.index_count,
                first_index: submesh.first_index,
                base_vertex: submesh.base_vertex,
                material: materials
                    .get(submesh.material as usize)
                    .or(materials.first())
                    .copied()
                    .unwrap_or(0),
                bounds: self.bounds,
            })
            .collect()
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    #[test]
    fn primitive_index_counts() {
        assert_eq!(Mesh::cube().index_count(), 36);
        assert_eq!(Mesh::cube().vertex_count(), 24);
        assert_eq!(Mesh::quad().index_count(), 6);
        assert_eq!(Mesh::triangle().index_count(), 3);
        assert_eq!(Mesh::icosahedron().triangle_count(), 20);
    }

    #[test]
    fn cube_faces_wind_outward() {
        let cube = Mesh::cube();
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| cube.vertices[tri[i] as usize].position);
            let face_normal = (b - a).cross(c - a).normalize();
            assert!(face_normal.dot(cube.vertices[tri[0] as usize].normal) > 0.99);
        }
    }

    #[test]
    fn light_volume_contains_unit_sphere() {
        let volume = Mesh::icosahedron();
        for tri in volume.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| volume.vertices[tri[i] as usize].position);
            let normal = (b - a).cross(c - a).normalize();
            assert!(normal.dot(a).abs() >= 0.999, "face plane closer than unit distance");
        }
    }

    #[test]
    fn sixteen_bit_indices_are_padded() {
        let triangle = Mesh::triangle();
        assert_eq!(triangle.index_format(), IndexFormat::Uint16);
        assert_eq!(triangle.index_bytes().len(), 8);
    }

    #[test]
    fn upload_yields_one_drawable_per_submesh() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mesh = Mesh::cube()
            .with_submesh(0, 18, 0)
            .with_submesh(18, 18, 1);
        let gpu = mesh.upload(&mut backend).unwrap();
        let drawables = gpu.drawables(&[4, 7]);
        assert_eq!(drawables.len(), 2);
        assert_eq!(drawables[1].first_index, 18);
        assert_eq!(drawables[1].material, 7);
        assert!((gpu.bounds.w - 0.75f32.sqrt()).abs() < 1e-5);
    }
}

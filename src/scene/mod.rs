//! Scene-side collaborators.
//!
//! The renderer reads the scene through three provider traits: drawables and their
//! per-frame transforms, the camera, and the light list. [`Scene`] is a flat
//! implementation of all three used by the demo and the tests.

mod camera;
mod light;
pub mod shadow;
mod transform;

pub use camera::*;
pub use light::*;
pub use transform::*;

use glam::{Mat4, Vec3};

use crate::gpu_driven::descriptor_table::Drawable;
use crate::gpu_driven::layout::ObjectTransformRecord;
use crate::resources::{GpuMesh, Material};

/// Flattened geometry, materials and per-frame transforms
pub trait SceneProvider {
    /// Materials drawables reference by index
    fn materials(&self) -> &[Material];

    /// Every drawable, in a stable order
    fn drawables(&self) -> Vec<Drawable>;

    /// One transform record per drawable, in `drawables` order
    fn write_transforms(&self, out: &mut Vec<ObjectTransformRecord>);
}

pub trait CameraProvider {
    fn view(&self) -> Mat4;
    fn projection(&self) -> Mat4;
    fn position(&self) -> Vec3;
    fn near(&self) -> f32;
    fn far(&self) -> f32;
    /// Vertical field of view in radians
    fn fov_y(&self) -> f32;
    fn aspect(&self) -> f32;
}

pub trait LightProvider {
    fn lights(&self) -> &[Light];
}

/// Index of a model in a [`Scene`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(usize);

/// An uploaded mesh placed in the scene
#[derive(Debug, Clone)]
pub struct Model {
    pub mesh: GpuMesh,
    /// Scene material index per submesh material slot
    pub materials: Vec<u32>,
    pub transform: Transform,
    pub tiling: f32,
    /// Hidden models keep their slots and draw nothing
    pub visible: bool,
}

impl Model {
    pub fn new(mesh: GpuMesh, material: u32) -> Self {
        Self {
            mesh,
            materials: vec![material],
            transform: Transform::default(),
            tiling: 1.0,
            visible: true,
        }
    }

    pub fn with_materials(mut self, materials: Vec<u32>) -> Self {
        self.materials = materials;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_tiling(mut self, tiling: f32) -> Self {
        self.tiling = tiling;
        self
    }
}

#[derive(Debug, Default)]
pub struct Scene {
    materials: Vec<Material>,
    models: Vec<Option<Model>>,
    pub lights: Vec<Light>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_material(&mut self, material: Material) -> u32 {
        self.materials.push(material);
        (self.materials.len() - 1) as u32
    }

    /// Add a model. The renderer picks it up on the next geometry rebuild.
    pub fn add_model(&mut self, model: Model) -> ModelId {
        self.models.push(Some(model));
        ModelId(self.models.len() - 1)
    }

    /// Remove a model. The renderer drops it on the next geometry rebuild.
    pub fn remove_model(&mut self, id: ModelId) -> Option<Model> {
        self.models.get_mut(id.0).and_then(Option::take)
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(id.0).and_then(Option::as_ref)
    }

    pub fn model_mut(&mut self, id: ModelId) -> Option<&mut Model> {
        self.models.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter().flatten()
    }

    pub fn add_light(&mut self, light: Light) {
        self.lights.push(light);
    }
}

impl SceneProvider for Scene {
    fn materials(&self) -> &[Material] {
        &self.materials
    }

    fn drawables(&self) -> Vec<Drawable> {
        self.models()
            .flat_map(|model| model.mesh.drawables(&model.materials))
            .collect()
    }

    fn write_transforms(&self, out: &mut Vec<ObjectTransformRecord>) {
        out.clear();
        for model in self.models() {
            let record =
                ObjectTransformRecord::new(model.transform.matrix(), model.tiling, !model.visible);
            out.extend(std::iter::repeat(record).take(model.mesh.submeshes.len()));
        }
    }
}

impl LightProvider for Scene {
    fn lights(&self) -> &[Light] {
        &self.lights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;
    use crate::resources::Mesh;

    #[test]
    fn transforms_follow_drawable_order() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut scene = Scene::new();
        let red = scene.add_material(Material::plastic(Vec3::X));
        let blue = scene.add_material(Material::plastic(Vec3::Z));
        let split = Mesh::cube()
            .with_submesh(0, 18, 0)
            .with_submesh(18, 18, 1)
            .upload(&mut backend)
            .unwrap();
        scene.add_model(Model::new(split, red).with_materials(vec![red, blue]));
        let hidden = scene.add_model(
            Model::new(Mesh::quad().upload(&mut backend).unwrap(), blue)
                .with_transform(Transform::from_position(Vec3::X)),
        );
        if let Some(model) = scene.model_mut(hidden) {
            model.visible = false;
        }

        let drawables = scene.drawables();
        let mut transforms = Vec::new();
        scene.write_transforms(&mut transforms);
        assert_eq!(drawables.len(), 3);
        assert_eq!(transforms.len(), 3);
        assert_eq!(drawables[1].material, blue);
        assert!(transforms[2].is_culled());
        assert_eq!(transforms[2].model.w_axis.x, 1.0);
    }

    #[test]
    fn removed_models_leave_no_drawables() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut scene = Scene::new();
        let material = scene.add_material(Material::default());
        let id = scene.add_model(Model::new(Mesh::cube().upload(&mut backend).unwrap(), material));
        assert!(scene.remove_model(id).is_some());
        assert!(scene.drawables().is_empty());
        assert!(scene.remove_model(id).is_none());
    }
}

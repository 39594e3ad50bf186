//! Material definitions and their device record encoding

use glam::{Vec3, Vec4};

use super::heap::{TextureHeap, TextureId};
use crate::error::RendererResult;
use crate::gpu_driven::layout::MaterialRecord;

/// Surface material. Texture channels are optional; absent channels fall back to the
/// scalar coefficients.
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub base_color: Vec3,
    pub opacity: f32,
    pub roughness: f32,
    pub metallic: f32,
    pub ambient_occlusion: f32,
    pub shininess: f32,
    pub specular: Vec3,
    /// Opaque materials go through the G-buffer; the rest are alpha tested there and
    /// blended in forward mode
    pub opaque: bool,

    pub base_color_texture: Option<TextureId>,
    pub normal_texture: Option<TextureId>,
    pub roughness_texture: Option<TextureId>,
    pub metallic_texture: Option<TextureId>,
    pub occlusion_texture: Option<TextureId>,
    pub opacity_texture: Option<TextureId>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: Vec3::ONE,
            opacity: 1.0,
            roughness: 0.5,
            metallic: 0.0,
            ambient_occlusion: 1.0,
            shininess: 32.0,
            specular: Vec3::splat(0.5),
            opaque: true,
            base_color_texture: None,
            normal_texture: None,
            roughness_texture: None,
            metallic_texture: None,
            occlusion_texture: None,
            opacity_texture: None,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec3) -> Self {
        self.base_color = color;
        self
    }

    /// Opacity below one also marks the material as non-opaque
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self.opaque = opacity >= 1.0 && self.opacity_texture.is_none();
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_specular(mut self, specular: Vec3, shininess: f32) -> Self {
        self.specular = specular;
        self.shininess = shininess;
        self
    }

    pub fn with_base_color_texture(mut self, texture: TextureId) -> Self {
        self.base_color_texture = Some(texture);
        self
    }

    pub fn with_normal_texture(mut self, texture: TextureId) -> Self {
        self.normal_texture = Some(texture);
        self
    }

    pub fn with_roughness_texture(mut self, texture: TextureId) -> Self {
        self.roughness_texture = Some(texture);
        self
    }

    pub fn with_metallic_texture(mut self, texture: TextureId) -> Self {
        self.metallic_texture = Some(texture);
        self
    }

    pub fn with_occlusion_texture(mut self, texture: TextureId) -> Self {
        self.occlusion_texture = Some(texture);
        self
    }

    pub fn with_opacity_texture(mut self, texture: TextureId) -> Self {
        self.opacity_texture = Some(texture);
        self.opaque = false;
        self
    }

    /// Encode into the device record, addressing textures by heap residency index.
    ///
    /// Fails when a referenced texture is interned but the heap has not been built.
    pub fn encode(&self, heap: &TextureHeap) -> RendererResult<MaterialRecord> {
        let mut textures = [0u32; 6];
        textures[MaterialRecord::BASE_COLOR] = heap.material_slot(self.base_color_texture)?;
        textures[MaterialRecord::NORMAL] = heap.material_slot(self.normal_texture)?;
        textures[MaterialRecord::ROUGHNESS] = heap.material_slot(self.roughness_texture)?;
        textures[MaterialRecord::METALLIC] = heap.material_slot(self.metallic_texture)?;
        textures[MaterialRecord::AMBIENT_OCCLUSION] = heap.material_slot(self.occlusion_texture)?;
        textures[MaterialRecord::OPACITY] = heap.material_slot(self.opacity_texture)?;

        Ok(MaterialRecord {
            base_color: self.base_color.extend(self.opacity),
            params: Vec4::new(
                self.roughness,
                self.metallic,
                self.ambient_occlusion,
                self.shininess,
            ),
            specular: self.specular.extend(0.0),
            textures,
            flags: if self.opaque {
                MaterialRecord::FLAG_OPAQUE
            } else {
                0
            },
            _pad: 0,
        })
    }

    // Presets

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic")
            .with_base_color(color)
            .with_roughness(0.4)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_base_color(color)
            .with_metallic(1.0)
            .with_roughness(roughness)
            .with_specular(color, 64.0)
    }

    pub fn gold() -> Self {
        Self::metal(Vec3::new(1.0, 0.766, 0.336), 0.3)
    }

    pub fn glass() -> Self {
        Self::new("glass")
            .with_opacity(0.3)
            .with_roughness(0.1)
    }

    /// Material sampling one texture as base color
    pub fn textured(name: &str, texture: TextureId) -> Self {
        Self::new(name).with_base_color_texture(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;
    use crate::error::RendererError;
    use crate::gpu_driven::layout::NO_TEXTURE;
    use crate::resources::TextureData;

    #[test]
    fn absent_channels_encode_as_no_texture() {
        let heap = TextureHeap::new();
        let record = Material::gold().encode(&heap).unwrap();
        assert!(record.textures.iter().all(|&t| t == NO_TEXTURE));
        assert!(record.is_opaque());
        assert_eq!(record.params.y, 1.0);
    }

    #[test]
    fn resident_channels_encode_residency_index() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut heap = TextureHeap::new();
        let white = heap.intern(&mut backend, &TextureData::white()).unwrap();
        let normal = heap.intern(&mut backend, &TextureData::default_normal()).unwrap();
        let material = Material::textured("t", white).with_normal_texture(normal);
        assert!(matches!(
            material.encode(&heap),
            Err(RendererError::UnresidentTexture(_))
        ));
        heap.build(&mut backend).unwrap();
        let record = material.encode(&heap).unwrap();
        assert_eq!(record.textures[MaterialRecord::BASE_COLOR], 0);
        assert_eq!(record.textures[MaterialRecord::NORMAL], 1);
        assert_eq!(record.textures[MaterialRecord::OPACITY], NO_TEXTURE);
    }

    #[test]
    fn translucent_material_is_not_opaque() {
        let record = Material::glass().encode(&TextureHeap::new()).unwrap();
        assert!(!record.is_opaque());
        assert!((record.base_color.w - 0.3).abs() < f32::EPSILON);
    }
}

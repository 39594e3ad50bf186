//! Binary records shared between host writers and GPU programs.
//!
//! Every struct here is mirrored field-for-field by the WGSL programs. Any change to a
//! record must bump [`LAYOUT_VERSION`] together with the programs that read it.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, UVec4, Vec3, Vec4};
use static_assertions::const_assert_eq;

use crate::backend::traits::IndexFormat;

/// Version of the record layouts below, checked by the synthesis kernel.
pub const LAYOUT_VERSION: u32 = 1;

/// Texture slot value meaning "no texture".
pub const NO_TEXTURE: u32 = u32::MAX;

/// Per-drawable argument record read by command synthesis.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ArgumentRecord {
    /// Index into the table's deduplicated vertex/index buffer pairs
    pub geometry_slot: u32,
    pub material_index: u32,
    /// 0 = u16 indices, 1 = u32 indices
    pub index_format: u32,
    pub transform_index: u32,
}

impl ArgumentRecord {
    pub fn encode_index_format(format: IndexFormat) -> u32 {
        match format {
            IndexFormat::Uint16 => 0,
            IndexFormat::Uint32 => 1,
        }
    }
}

/// Draw arguments fixed at registration time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct DrawTemplate {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub _pad: u32,
    /// Local-space bounding sphere: xyz center, w radius
    pub bounds: Vec4,
}

/// Material parameters and heap texture indices.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    /// rgb color, a opacity
    pub base_color: Vec4,
    /// roughness, metallic, ambient occlusion, shininess
    pub params: Vec4,
    pub specular: Vec4,
    /// base color, normal, roughness, metallic, ambient occlusion, opacity
    pub textures: [u32; 6],
    pub flags: u32,
    pub _pad: u32,
}

impl MaterialRecord {
    pub const FLAG_OPAQUE: u32 = 1 << 0;

    pub const BASE_COLOR: usize = 0;
    pub const NORMAL: usize = 1;
    pub const ROUGHNESS: usize = 2;
    pub const METALLIC: usize = 3;
    pub const AMBIENT_OCCLUSION: usize = 4;
    pub const OPACITY: usize = 5;

    pub fn is_opaque(&self) -> bool {
        self.flags & Self::FLAG_OPAQUE != 0
    }
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            params: Vec4::new(0.5, 0.0, 1.0, 32.0),
            specular: Vec4::new(0.04, 0.04, 0.04, 1.0),
            textures: [NO_TEXTURE; 6],
            flags: Self::FLAG_OPAQUE,
            _pad: 0,
        }
    }
}

/// Per-drawable transform for the current frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectTransformRecord {
    pub model: Mat4,
    /// Inverse-transpose of the model's upper 3x3, one padded column per entry
    pub normal: [Vec4; 3],
    pub tiling: f32,
    pub flags: u32,
    pub _pad: [u32; 2],
}

impl ObjectTransformRecord {
    pub const FLAG_CULLED: u32 = 1 << 0;

    pub fn new(model: Mat4, tiling: f32, culled: bool) -> Self {
        let normal = Mat3::from_mat4(model).inverse().transpose();
        let column = |v: Vec3| v.extend(0.0);
        Self {
            model,
            normal: [
                column(normal.x_axis),
                column(normal.y_axis),
                column(normal.z_axis),
            ],
            tiling,
            flags: if culled { Self::FLAG_CULLED } else { 0 },
            _pad: [0; 2],
        }
    }

    pub fn is_culled(&self) -> bool {
        self.flags & Self::FLAG_CULLED != 0
    }
}

impl Default for ObjectTransformRecord {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, 1.0, false)
    }
}

/// Uniform block of the synthesis dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SynthesisParams {
    pub drawable_count: u32,
    pub layout_version: u32,
    pub culling_enabled: u32,
    pub _pad: u32,
}

/// Per-frame uniforms, one copy per frame ring slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub inv_view: Mat4,
    pub shadow_view_proj: Mat4,
    pub camera_position: Vec4,
    /// rgb color, w intensity
    pub ambient: Vec4,
    /// Inward-facing planes: xyz normal, w distance
    pub frustum: [Vec4; 6],
    /// directional lights, point lights, drawables, flags
    pub counts: UVec4,
    /// frame index, ring slot, width, height
    pub frame: UVec4,
}

impl FrameUniforms {
    pub const FLAG_SHADOWS: u32 = 1 << 0;
    pub const FLAG_ALPHA_TEST: u32 = 1 << 1;

    pub fn frame_index(&self) -> u32 {
        self.frame.x
    }
}

impl Default for FrameUniforms {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            view_proj: Mat4::IDENTITY,
            inv_view: Mat4::IDENTITY,
            shadow_view_proj: Mat4::IDENTITY,
            camera_position: Vec4::W,
            ambient: Vec4::ZERO,
            frustum: [Vec4::ZERO; 6],
            counts: UVec4::ZERO,
            frame: UVec4::ZERO,
        }
    }
}

/// One light as the lighting programs read it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LightRecord {
    /// xyz position, w radius
    pub position_radius: Vec4,
    /// rgb color, w intensity
    pub color_intensity: Vec4,
    /// xyz direction, w light type
    pub direction_type: Vec4,
    /// constant, linear, quadratic, unused
    pub attenuation: Vec4,
    /// cos inner, cos outer, unused, unused
    pub cone: Vec4,
}

impl LightRecord {
    pub const DIRECTIONAL: f32 = 0.0;
    pub const POINT: f32 = 1.0;
    pub const SPOT: f32 = 2.0;
}

const_assert_eq!(std::mem::size_of::<ArgumentRecord>(), 16);
const_assert_eq!(std::mem::size_of::<DrawTemplate>(), 32);
const_assert_eq!(std::mem::size_of::<MaterialRecord>(), 80);
const_assert_eq!(std::mem::size_of::<ObjectTransformRecord>(), 128);
const_assert_eq!(std::mem::size_of::<SynthesisParams>(), 16);
const_assert_eq!(std::mem::size_of::<FrameUniforms>(), 480);
const_assert_eq!(std::mem::size_of::<LightRecord>(), 80);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let model = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let record = ObjectTransformRecord::new(model, 1.0, false);
        assert!((record.normal[0].x - 0.5).abs() < 1e-6);
        assert!((record.normal[1].y - 1.0).abs() < 1e-6);
        assert_eq!(record.normal[0].w, 0.0);
    }

    #[test]
    fn culled_flag_round_trips() {
        assert!(ObjectTransformRecord::new(Mat4::IDENTITY, 1.0, true).is_culled());
        assert!(!ObjectTransformRecord::default().is_culled());
    }

    #[test]
    fn default_material_has_no_textures() {
        let record = MaterialRecord::default();
        assert!(record.textures.iter().all(|&t| t == NO_TEXTURE));
        assert!(record.is_opaque());
    }
}

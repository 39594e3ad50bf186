//! Light types for the scene

use glam::{Vec3, Vec4};

use crate::gpu_driven::layout::LightRecord;

/// A light as the scene describes it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Directional {
        /// Direction the light travels
        direction: Vec3,
        color: Vec3,
        intensity: f32,
    },
    Point {
        position: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        /// constant, linear, quadratic
        attenuation: Vec3,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        attenuation: Vec3,
        /// Radians
        inner_angle: f32,
        outer_angle: f32,
    },
}

/// Quadratic falloff reaching roughly 1% intensity at `radius`
fn default_attenuation(radius: f32) -> Vec3 {
    Vec3::new(1.0, 0.0, 100.0 / (radius * radius).max(f32::EPSILON))
}

impl Light {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Light::Directional {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }

    pub fn point(position: Vec3, color: Vec3, intensity: f32, radius: f32) -> Self {
        Light::Point {
            position,
            color,
            intensity,
            radius,
            attenuation: default_attenuation(radius),
        }
    }

    pub fn spot(
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        inner_angle: f32,
        outer_angle: f32,
    ) -> Self {
        Light::Spot {
            position,
            direction: direction.normalize_or_zero(),
            color,
            intensity,
            radius,
            attenuation: default_attenuation(radius),
            inner_angle,
            outer_angle,
        }
    }

    pub fn is_directional(&self) -> bool {
        matches!(self, Light::Directional { .. })
    }

    /// Direction of travel; point lights have none
    pub fn direction(&self) -> Option<Vec3> {
        match *self {
            Light::Directional { direction, .. } | Light::Spot { direction, .. } => Some(direction),
            Light::Point { .. } => None,
        }
    }

    /// Device record; point and spot lights are both drawn as light volumes
    pub fn record(&self) -> LightRecord {
        match *self {
            Light::Directional {
                direction,
                color,
                intensity,
            } => LightRecord {
                position_radius: Vec4::ZERO,
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(LightRecord::DIRECTIONAL),
                attenuation: Vec4::X,
                cone: Vec4::ZERO,
            },
            Light::Point {
                position,
                color,
                intensity,
                radius,
                attenuation,
            } => LightRecord {
                position_radius: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: Vec4::new(0.0, -1.0, 0.0, LightRecord::POINT),
                attenuation: attenuation.extend(0.0),
                cone: Vec4::new(-1.0, -1.0, 0.0, 0.0),
            },
            Light::Spot {
                position,
                direction,
                color,
                intensity,
                radius,
                attenuation,
                inner_angle,
                outer_angle,
            } => LightRecord {
                position_radius: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(LightRecord::SPOT),
                attenuation: attenuation.extend(0.0),
                cone: Vec4::new(inner_angle.cos(), outer_angle.cos(), 0.0, 0.0),
            },
        }
    }
}

/// Light records ordered directional first, then volume lights, with their counts
pub fn pack_lights(lights: &[Light], capacity: usize) -> (Vec<LightRecord>, u32, u32) {
    let directional: Vec<LightRecord> = lights
        .iter()
        .filter(|l| l.is_directional())
        .map(Light::record)
        .collect();
    let volumes: Vec<LightRecord> = lights
        .iter()
        .filter(|l| !l.is_directional())
        .map(Light::record)
        .collect();
    if directional.len() + volumes.len() > capacity {
        log::warn!(
            "{} lights exceed the light buffer capacity of {}; extra lights are dropped",
            directional.len() + volumes.len(),
            capacity
        );
    }
    let directional_count = directional.len().min(capacity);
    let volume_count = volumes.len().min(capacity - directional_count);
    let mut records = directional;
    records.truncate(directional_count);
    records.extend(volumes.into_iter().take(volume_count));
    (records, directional_count as u32, volume_count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_lights_pack_first() {
        let lights = [
            Light::point(Vec3::ZERO, Vec3::ONE, 1.0, 5.0),
            Light::directional(-Vec3::Y, Vec3::ONE, 2.0),
            Light::spot(Vec3::Y, -Vec3::Y, Vec3::ONE, 1.0, 4.0, 0.2, 0.4),
        ];
        let (records, directional, volumes) = pack_lights(&lights, 8);
        assert_eq!((directional, volumes), (1, 2));
        assert_eq!(records[0].direction_type.w, LightRecord::DIRECTIONAL);
        assert_eq!(records[1].direction_type.w, LightRecord::POINT);
        assert_eq!(records[2].direction_type.w, LightRecord::SPOT);
        assert!(records[2].cone.x > records[2].cone.y);
    }

    #[test]
    fn packing_respects_capacity() {
        let lights = vec![Light::point(Vec3::ZERO, Vec3::ONE, 1.0, 5.0); 5];
        let (records, _, volumes) = pack_lights(&lights, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(volumes, 3);
    }
}

//! Camera system

use glam::{Mat4, Vec3, Vec4};

use super::CameraProvider;

/// Camera projection type
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        half_width: f32,
        half_height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            half_width: width / 2.0,
            half_height: height / 2.0,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                half_width,
                half_height,
                near,
                far,
            } => Mat4::orthographic_rh(-half_width, half_width, -half_height, half_height, near, far),
        }
    }

    pub fn near(&self) -> f32 {
        match *self {
            Projection::Perspective { near, .. } | Projection::Orthographic { near, .. } => near,
        }
    }

    pub fn far(&self) -> f32 {
        match *self {
            Projection::Perspective { far, .. } | Projection::Orthographic { far, .. } => far,
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { aspect: a, .. } = self {
            *a = aspect;
        }
    }
}

/// Look-at camera
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize()
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        self.projection.set_aspect(width / height.max(1.0));
    }
}

impl CameraProvider for Camera {
    fn view(&self) -> Mat4 {
        self.view_matrix()
    }

    fn projection(&self) -> Mat4 {
        self.projection_matrix()
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn near(&self) -> f32 {
        self.projection.near()
    }

    fn far(&self) -> f32 {
        self.projection.far()
    }

    fn fov_y(&self) -> f32 {
        match self.projection {
            Projection::Perspective { fov_y, .. } => fov_y,
            Projection::Orthographic { .. } => 0.0,
        }
    }

    fn aspect(&self) -> f32 {
        match self.projection {
            Projection::Perspective { aspect, .. } => aspect,
            Projection::Orthographic {
                half_width,
                half_height,
                ..
            } => half_width / half_height,
        }
    }
}

/// Inward-facing clip planes of a view-projection with a [0, 1] depth range.
///
/// Order: left, right, bottom, top, near, far. Normals are unit length.
pub fn frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let [r0, r1, r2, r3] = [0, 1, 2, 3].map(|i| view_proj.row(i));
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
        let length = plane.truncate().length();
        if length > 0.0 {
            plane / length
        } else {
            plane
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frustum_contains_target_and_rejects_behind() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let planes = frustum_planes(camera.view_projection_matrix());
        let inside = |p: Vec3| planes.iter().all(|pl| pl.truncate().dot(p) + pl.w >= 0.0);
        assert!(inside(Vec3::ZERO));
        assert!(!inside(Vec3::new(0.0, 0.0, 10.0)));
        assert!(!inside(Vec3::new(50.0, 0.0, 0.0)));
    }

    #[test]
    fn provider_reports_projection_parameters() {
        let camera = Camera::default().with_projection(Projection::perspective(60.0, 2.0, 0.5, 50.0));
        assert!((camera.fov_y() - 60f32.to_radians()).abs() < 1e-6);
        assert_eq!(camera.aspect(), 2.0);
        assert_eq!(CameraProvider::near(&camera), 0.5);
        assert_eq!(CameraProvider::far(&camera), 50.0);
    }
}

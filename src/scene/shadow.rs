//! Directional shadow fitting.
//!
//! The light camera is fitted to the bounding sphere of the main camera's frustum so
//! every visible point can cast or receive a shadow, and the fit stays stable while
//! the camera rotates.

use glam::{Mat4, Vec3};

use super::CameraProvider;

/// Distance the light camera is pulled back beyond the bounding sphere
pub const SHADOW_MARGIN: f32 = 10.0;

/// Fitted light camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowFit {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub center: Vec3,
    pub radius: f32,
}

/// World-space frustum corners: near then far, each lower-left, lower-right,
/// upper-right, upper-left.
///
/// Un-projects the clip-space cube (depth range [0, 1]) through the camera's inverse
/// view-projection, so perspective and orthographic cameras both work.
pub fn frustum_corners(camera: &dyn CameraProvider) -> [Vec3; 8] {
    let inv_view_proj = (camera.projection() * camera.view()).inverse();
    let face = |depth: f32| {
        [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)]
            .map(|(x, y)| inv_view_proj.project_point3(Vec3::new(x, y, depth)))
    };
    let near = face(0.0);
    let far = face(1.0);
    [near[0], near[1], near[2], near[3], far[0], far[1], far[2], far[3]]
}

/// Bounding sphere of the camera frustum.
///
/// The center is the midpoint of the longer of the near-lower-left to far-upper-right
/// and far-lower-left to far-upper-right diagonals; the radius reaches every corner.
pub fn frustum_bounding_sphere(camera: &dyn CameraProvider) -> (Vec3, f32) {
    let corners = frustum_corners(camera);
    let (near_lower_left, far_lower_left, far_upper_right) = (corners[0], corners[4], corners[6]);
    let inner = far_upper_right - near_lower_left;
    let far_diagonal = far_upper_right - far_lower_left;
    let center = if inner.length_squared() >= far_diagonal.length_squared() {
        (near_lower_left + far_upper_right) * 0.5
    } else {
        (far_lower_left + far_upper_right) * 0.5
    };
    let radius = corners
        .iter()
        .map(|corner| corner.distance(center))
        .fold(0.0f32, f32::max);
    (center, radius)
}

/// Fit an orthographic light camera for a light travelling along `direction`
pub fn fit_directional_light(camera: &dyn CameraProvider, direction: Vec3) -> ShadowFit {
    let (center, radius) = frustum_bounding_sphere(camera);
    let to_light = (-direction).normalize_or_zero();
    let to_light = if to_light == Vec3::ZERO { Vec3::Y } else { to_light };
    let up = if to_light.cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let distance = radius + SHADOW_MARGIN;
    let eye = center + to_light * distance;
    let view = Mat4::look_at_rh(eye, center, up);
    let proj = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 2.0 * distance);
    ShadowFit {
        view,
        proj,
        view_proj: proj * view,
        center,
        radius,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Camera, Projection};
    use rstest::rstest;

    fn perspective_camera() -> Camera {
        Camera::new(Vec3::new(3.0, 4.0, 8.0), Vec3::ZERO)
            .with_projection(Projection::perspective(60.0, 16.0 / 9.0, 0.5, 40.0))
    }

    fn orthographic_camera() -> Camera {
        Camera::new(Vec3::new(3.0, 4.0, 8.0), Vec3::ZERO)
            .with_projection(Projection::orthographic(20.0, 20.0, 0.1, 20.0))
    }

    #[rstest]
    #[case::overhead_sun(perspective_camera(), Vec3::new(-0.3, -1.0, -0.2))]
    #[case::vertical_sun(perspective_camera(), Vec3::new(0.0, -1.0, 0.0))]
    #[case::low_sun(perspective_camera(), Vec3::new(1.0, -0.1, 0.0))]
    #[case::orthographic_overhead(orthographic_camera(), Vec3::new(-0.3, -1.0, -0.2))]
    #[case::orthographic_low_sun(orthographic_camera(), Vec3::new(1.0, -0.1, 0.0))]
    fn fitted_box_contains_every_frustum_corner(#[case] camera: Camera, #[case] direction: Vec3) {
        let fit = fit_directional_light(&camera, direction);
        for corner in frustum_corners(&camera) {
            assert!(corner.distance(fit.center) <= fit.radius + 1e-3);
            let clip = fit.view_proj.project_point3(corner);
            assert!(clip.x.abs() <= 1.0 + 1e-4, "x out of box: {clip}");
            assert!(clip.y.abs() <= 1.0 + 1e-4, "y out of box: {clip}");
            assert!((-1e-4..=1.0 + 1e-4).contains(&clip.z), "z out of box: {clip}");
        }
    }

    #[test]
    fn orthographic_corners_span_the_view_volume() {
        let camera = Camera::new(Vec3::ZERO, -Vec3::Z)
            .with_projection(Projection::orthographic(20.0, 20.0, 0.1, 10.0));
        let corners = frustum_corners(&camera);
        assert!(corners[0].abs_diff_eq(Vec3::new(-10.0, -10.0, -0.1), 1e-3));
        assert!(corners[6].abs_diff_eq(Vec3::new(10.0, 10.0, -10.0), 1e-3));
        let (_, radius) = frustum_bounding_sphere(&camera);
        assert!(radius >= Vec3::new(10.0, 10.0, 4.95).length() - 1e-3);
    }

    #[test]
    fn perspective_corners_match_field_of_view() {
        let camera = Camera::new(Vec3::ZERO, -Vec3::Z)
            .with_projection(Projection::perspective(90.0, 2.0, 1.0, 10.0));
        let corners = frustum_corners(&camera);
        assert!(corners[0].abs_diff_eq(Vec3::new(-2.0, -1.0, -1.0), 1e-3));
        assert!(corners[6].abs_diff_eq(Vec3::new(20.0, 10.0, -10.0), 1e-3));
    }

    /// Narrow frusta are longest corner to opposite corner; wide ones across the far plane
    #[rstest]
    #[case::narrow_uses_inner_diagonal(30.0, 0)]
    #[case::wide_uses_far_diagonal(120.0, 4)]
    fn bounding_sphere_centers_on_longer_diagonal(#[case] fov_y: f32, #[case] start: usize) {
        let camera = Camera::new(Vec3::ZERO, -Vec3::Z)
            .with_projection(Projection::perspective(fov_y, 1.0, 0.1, 100.0));
        let (center, _) = frustum_bounding_sphere(&camera);
        let corners = frustum_corners(&camera);
        let expected = (corners[start] + corners[6]) * 0.5;
        assert!(center.distance(expected) < 1e-2, "{center} != {expected}");
    }
}

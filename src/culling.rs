//! View-frustum culling.
//!
//! Planes are extracted every frame from `projection * camera_world⁻¹` by
//! combining the fourth row with each of the first three. Objects are tested
//! as spheres centred on their world translation with a radius equal to their
//! largest world-scale axis, which is a stand-in until geometry carries
//! bounding spheres.

use glam::{Mat4, Vec3, Vec4};

use crate::scene::{Camera, Drawable, SceneSource};

/// Plane order in [`FrustumCuller::planes`].
pub const PLANE_NAMES: [&str; 6] = ["left", "right", "bottom", "top", "near", "far"];

/// Per-frame culling counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CullStats {
    pub total: usize,
    pub culled: usize,
    pub visible: usize,
    /// `culled / total`, 0 when nothing was tested.
    pub cull_rate: f32,
}

#[derive(Debug, Clone)]
pub struct FrustumCuller {
    planes: [Vec4; 6],
    total: usize,
    culled: usize,
}

impl Default for FrustumCuller {
    fn default() -> Self {
        Self::new()
    }
}

impl FrustumCuller {
    /// A culler whose planes accept everything until the first update.
    pub fn new() -> Self {
        Self {
            planes: [Vec4::new(0.0, 0.0, 0.0, f32::MAX); 6],
            total: 0,
            culled: 0,
        }
    }

    /// Recompute the planes and reset the counters.
    pub fn update(&mut self, projection: Mat4, camera_world: Mat4) {
        let m = projection * camera_world.inverse();
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        self.planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2].map(normalize_plane);
        self.total = 0;
        self.culled = 0;
    }

    pub fn update_from_camera(&mut self, camera: &Camera) {
        self.update(camera.projection, camera.world);
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Pure sphere test against the current planes; does not touch the
    /// counters.
    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }

    /// Test an object by its world transform and count the result.
    pub fn test_object(&mut self, world: &Mat4) -> bool {
        let center = world.w_axis.truncate();
        let radius = world
            .x_axis
            .truncate()
            .length()
            .max(world.y_axis.truncate().length())
            .max(world.z_axis.truncate().length());

        self.total += 1;
        let visible = self.contains_sphere(center, radius);
        if !visible {
            self.culled += 1;
        }
        visible
    }

    /// Update from `camera` and keep the drawables that survive.
    pub fn cull<'a>(&mut self, camera: &Camera, drawables: &'a [Drawable]) -> Vec<&'a Drawable> {
        self.update_from_camera(camera);
        drawables
            .iter()
            .filter(|drawable| self.test_object(&drawable.world))
            .collect()
    }

    /// Update from `camera`, walk `scene` and call `on_visible` for every
    /// visible drawable inside the frustum. Drawables flagged invisible are
    /// skipped without being counted.
    pub fn cull_scene(
        &mut self,
        scene: &dyn SceneSource,
        camera: &Camera,
        on_visible: &mut dyn FnMut(&Drawable),
    ) {
        self.update_from_camera(camera);
        scene.traverse(&mut |drawable| {
            if drawable.visible && self.test_object(&drawable.world) {
                on_visible(drawable);
            }
        });
    }

    pub fn stats(&self) -> CullStats {
        CullStats {
            total: self.total,
            culled: self.culled,
            visible: self.total - self.culled,
            cull_rate: if self.total > 0 {
                self.culled as f32 / self.total as f32
            } else {
                0.0
            },
        }
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.truncate().length();
    if length > 0.0 {
        plane / length
    } else {
        plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::scene::{Geometry, GeometryId, Material, MaterialId, ObjectId, Scene};

    fn camera() -> Camera {
        Camera::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0)
    }

    fn drawable_at(id: u64, position: Vec3, scale: f32) -> Drawable {
        Drawable::new(
            ObjectId(id),
            Arc::new(Geometry::triangle(GeometryId(1))),
            Arc::new(Material::basic(MaterialId(1))),
        )
        .with_transform(Mat4::from_scale_rotation_translation(
            Vec3::splat(scale),
            glam::Quat::IDENTITY,
            position,
        ))
    }

    #[test]
    fn test_planes_are_normalized() {
        let mut culler = FrustumCuller::new();
        culler.update_from_camera(&camera());
        for plane in culler.planes() {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_in_front_is_visible_behind_is_culled() {
        let drawables = vec![
            drawable_at(0, Vec3::new(0.0, 0.0, -5.0), 1.0),
            drawable_at(1, Vec3::new(0.0, 0.0, 5.0), 1.0),
            drawable_at(2, Vec3::new(50.0, 0.0, -5.0), 1.0),
            drawable_at(3, Vec3::new(0.0, 0.0, -500.0), 1.0),
        ];
        let mut culler = FrustumCuller::new();
        let visible = culler.cull(&camera(), &drawables);

        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, ObjectId(0));
        let stats = culler.stats();
        assert_eq!((stats.total, stats.culled, stats.visible), (4, 3, 1));
        assert!((stats.cull_rate - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_large_scale_straddling_plane_is_kept() {
        // Centre is just outside the left plane but the radius reaches in.
        let mut culler = FrustumCuller::new();
        culler.update_from_camera(&camera());
        let straddling = drawable_at(0, Vec3::new(-7.0, 0.0, -5.0), 4.0);
        assert!(culler.test_object(&straddling.world));
        let small = drawable_at(1, Vec3::new(-7.0, 0.0, -5.0), 0.5);
        assert!(!culler.test_object(&small.world));
    }

    #[test]
    fn test_camera_transform_is_applied() {
        // Camera moved to +Z 20 and turned around to look towards +Z 40.
        let camera = camera().looking_at(Vec3::new(0.0, 0.0, 20.0), Vec3::new(0.0, 0.0, 40.0), Vec3::Y);
        let mut culler = FrustumCuller::new();
        culler.update_from_camera(&camera);
        assert!(culler.contains_sphere(Vec3::new(0.0, 0.0, 30.0), 0.1));
        assert!(!culler.contains_sphere(Vec3::new(0.0, 0.0, 0.0), 0.1));
    }

    #[test]
    fn test_cull_scene_skips_invisible() {
        let mut scene = Scene::new();
        scene.add(drawable_at(0, Vec3::new(0.0, 0.0, -5.0), 1.0));
        scene.add(drawable_at(1, Vec3::new(0.0, 0.0, -5.0), 1.0).with_visible(false));
        scene.add(drawable_at(2, Vec3::new(0.0, 0.0, 5.0), 1.0));

        let mut culler = FrustumCuller::new();
        let mut visited = Vec::new();
        culler.cull_scene(&scene, &camera(), &mut |d| visited.push(d.id));

        assert_eq!(visited, vec![ObjectId(0)]);
        assert_eq!(culler.stats().total, 2);
        assert_eq!(FrustumCuller::new().stats().cull_rate, 0.0);
    }
}

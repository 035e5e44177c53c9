//! The scene boundary the renderer draws from.
//!
//! Scene-graph management lives elsewhere. The renderer only needs a camera
//! and something that can walk its drawables, which is what
//! [`SceneSource`] expresses. [`Scene`] is a flat list implementation used by
//! the demo and the tests.

use std::sync::Arc;

use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::buffer::{INDICES_PER_TRIANGLE, VERTEX_STRIDE_FLOATS};
use crate::pipeline::RenderPipelineDescriptor;
use crate::shader::BASIC_SHADER;
use crate::types::{CullMode, DepthStencilState, TextureFormat};

/// Identifies a material for batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

/// Identifies a geometry; buffers are cached per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u64);

/// Identifies a scene object; uniform buffers are cached per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

bitflags! {
    /// Fixed-function state a material asks for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderStateBits: u32 {
        const DEPTH_TEST = 1 << 0;
        const DEPTH_WRITE = 1 << 1;
        const CULL_BACK = 1 << 2;
        const BLEND = 1 << 3;
    }
}

/// Projection plus the camera's world transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub projection: Mat4,
    pub world: Mat4,
}

impl Camera {
    pub fn new(projection: Mat4, world: Mat4) -> Self {
        Self { projection, world }
    }

    /// Right-handed perspective camera at the origin looking down -Z.
    pub fn perspective(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self::new(
            Mat4::perspective_rh(fov_y_radians, aspect, near, far),
            Mat4::IDENTITY,
        )
    }

    /// Move the camera to `eye`, looking at `target`.
    pub fn looking_at(mut self, eye: Vec3, target: Vec3, up: Vec3) -> Self {
        self.world = Mat4::look_at_rh(eye, target, up).inverse();
        self
    }

    pub fn set_aspect(&mut self, fov_y_radians: f32, aspect: f32, near: f32, far: f32) {
        self.projection = Mat4::perspective_rh(fov_y_radians, aspect, near, far);
    }

    pub fn view(&self) -> Mat4 {
        self.world.inverse()
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view()
    }
}

/// Interleaved position + color vertices with optional indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub id: GeometryId,
    /// Grouping key for batching, e.g. `"triangle"` or `"quad"`.
    pub geometry_type: &'static str,
    pub vertices: Vec<f32>,
    pub indices: Option<Vec<u32>>,
}

impl Geometry {
    pub fn new(id: GeometryId, geometry_type: &'static str, vertices: Vec<f32>) -> Self {
        Self {
            id,
            geometry_type,
            vertices,
            indices: None,
        }
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// One triangle with red, green and blue corners.
    pub fn triangle(id: GeometryId) -> Self {
        #[rustfmt::skip]
        let vertices = vec![
             0.0,  0.5, 0.0,  1.0, 0.0, 0.0,
            -0.5, -0.5, 0.0,  0.0, 1.0, 0.0,
             0.5, -0.5, 0.0,  0.0, 0.0, 1.0,
        ];
        Self::new(id, "triangle", vertices)
    }

    /// A unit quad in the XY plane drawn with indices.
    pub fn quad(id: GeometryId, color: [f32; 3]) -> Self {
        let [r, g, b] = color;
        #[rustfmt::skip]
        let vertices = vec![
            -0.5, -0.5, 0.0,  r, g, b,
             0.5, -0.5, 0.0,  r, g, b,
             0.5,  0.5, 0.0,  r, g, b,
            -0.5,  0.5, 0.0,  r, g, b,
        ];
        Self::new(id, "quad", vertices).with_indices(vec![0, 1, 2, 0, 2, 3])
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / VERTEX_STRIDE_FLOATS
    }

    pub fn triangle_count(&self) -> usize {
        match &self.indices {
            Some(indices) => indices.len() / INDICES_PER_TRIANGLE,
            None => self.vertex_count() / 3,
        }
    }
}

/// Shader source plus the fixed-function state it renders with.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub id: MaterialId,
    pub label: Option<String>,
    pub shader_source: String,
    pub render_state: RenderStateBits,
}

impl Material {
    pub fn new(id: MaterialId, shader_source: impl Into<String>) -> Self {
        Self {
            id,
            label: None,
            shader_source: shader_source.into(),
            render_state: RenderStateBits::empty(),
        }
    }

    /// The built-in vertex-color material with depth testing.
    pub fn basic(id: MaterialId) -> Self {
        Self::new(id, BASIC_SHADER)
            .with_render_state(RenderStateBits::DEPTH_TEST | RenderStateBits::DEPTH_WRITE)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_render_state(mut self, render_state: RenderStateBits) -> Self {
        self.render_state = render_state;
        self
    }

    /// Pipeline description for drawing this material into `color_format`.
    pub fn pipeline_descriptor(&self, color_format: TextureFormat) -> RenderPipelineDescriptor {
        let cull_mode = if self.render_state.contains(RenderStateBits::CULL_BACK) {
            CullMode::Back
        } else {
            CullMode::None
        };
        let mut descriptor =
            RenderPipelineDescriptor::new(&self.shader_source, color_format).with_cull_mode(cull_mode);
        if let Some(label) = &self.label {
            descriptor = descriptor.with_label(label.clone());
        }
        if self.render_state.contains(RenderStateBits::DEPTH_TEST) {
            let mut depth = DepthStencilState::depth_less();
            depth.depth_write_enabled = self.render_state.contains(RenderStateBits::DEPTH_WRITE);
            descriptor = descriptor.with_depth_stencil(depth);
        }
        descriptor
    }
}

/// One renderable object.
#[derive(Debug, Clone)]
pub struct Drawable {
    pub id: ObjectId,
    pub geometry: Arc<Geometry>,
    pub material: Arc<Material>,
    pub world: Mat4,
    pub visible: bool,
}

impl Drawable {
    pub fn new(id: ObjectId, geometry: Arc<Geometry>, material: Arc<Material>) -> Self {
        Self {
            id,
            geometry,
            material,
            world: Mat4::IDENTITY,
            visible: true,
        }
    }

    pub fn with_transform(mut self, world: Mat4) -> Self {
        self.world = world;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }
}

/// Anything that can walk its drawables. Order is unspecified.
pub trait SceneSource {
    fn traverse(&self, visit: &mut dyn FnMut(&Drawable));
}

/// A flat list of drawables.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    drawables: Vec<Drawable>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, drawable: Drawable) {
        self.drawables.push(drawable);
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Drawable> {
        let index = self.drawables.iter().position(|d| d.id == id)?;
        Some(self.drawables.remove(index))
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Drawable> {
        self.drawables.iter_mut().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.drawables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Drawable> {
        self.drawables.iter()
    }
}

impl SceneSource for Scene {
    fn traverse(&self, visit: &mut dyn FnMut(&Drawable)) {
        for drawable in &self.drawables {
            visit(drawable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_counts() {
        let triangle = Geometry::triangle(GeometryId(1));
        assert_eq!(triangle.vertex_count(), 3);
        assert_eq!(triangle.triangle_count(), 1);

        let quad = Geometry::quad(GeometryId(2), [1.0, 1.0, 1.0]);
        assert_eq!(quad.vertex_count(), 4);
        assert_eq!(quad.triangle_count(), 2);
    }

    #[test]
    fn test_material_descriptor_follows_render_state() {
        let basic = Material::basic(MaterialId(1));
        let desc = basic.pipeline_descriptor(TextureFormat::Bgra8Unorm);
        assert!(desc.uses_depth());
        assert_eq!(desc.cull_mode, CullMode::None);

        let flat = Material::new(MaterialId(2), BASIC_SHADER)
            .with_render_state(RenderStateBits::CULL_BACK);
        let desc = flat.pipeline_descriptor(TextureFormat::Bgra8Unorm);
        assert!(!desc.uses_depth());
        assert_eq!(desc.cull_mode, CullMode::Back);
    }

    #[test]
    fn test_camera_view_is_world_inverse() {
        let camera = Camera::perspective(1.0, 1.0, 0.1, 100.0).looking_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
        );
        let origin = camera.view().transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }

    #[test]
    fn test_scene_traverse_and_remove() {
        let geometry = Arc::new(Geometry::triangle(GeometryId(1)));
        let material = Arc::new(Material::basic(MaterialId(1)));
        let mut scene = Scene::new();
        for id in 0..3 {
            scene.add(Drawable::new(ObjectId(id), geometry.clone(), material.clone()));
        }
        assert!(scene.remove(ObjectId(1)).is_some());

        let mut seen = Vec::new();
        scene.traverse(&mut |d| seen.push(d.id));
        assert_eq!(seen, vec![ObjectId(0), ObjectId(2)]);
    }
}

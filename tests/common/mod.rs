//! Common utilities for integration tests.
//!
//! Every suite is parameterized over the backends with `rstest`. The native
//! backends need a window, so under `cargo test` they are negotiated against a
//! headless target, refuse it, and the case is skipped.

use std::sync::Arc;

use gpu_render_core::{
    BackendType, Camera, Drawable, DummyBackend, DummyControl, Geometry, GeometryId, GpuDevice,
    Material, MaterialId, ObjectId, Renderer, RendererConfig, Scene, SurfaceTarget,
};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Backends the suites run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Dummy backend (no actual GPU operations).
    Dummy,
    /// wgpu backend.
    Wgpu,
    /// Vulkan backend via ash.
    Vulkan,
}

impl Backend {
    pub fn backend_type(self) -> BackendType {
        match self {
            Backend::Dummy => BackendType::Dummy,
            Backend::Wgpu => BackendType::Wgpu,
            Backend::Vulkan => BackendType::Vulkan,
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// An initialized renderer, plus the dummy control when running on Dummy.
pub struct TestContext {
    #[allow(dead_code)]
    pub backend: Backend,
    pub renderer: Renderer,
    /// Fault injection, only available on the dummy backend.
    #[allow(dead_code)]
    pub control: Option<DummyControl>,
}

impl TestContext {
    /// Create and initialize a renderer on `backend`.
    ///
    /// Returns `None` if the backend cannot be brought up in this environment.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_config(backend, RendererConfig::headless())
    }

    pub fn with_config(backend: Backend, config: RendererConfig) -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let target = SurfaceTarget::headless(WIDTH, HEIGHT);

        let (mut renderer, control) = match backend {
            Backend::Dummy => {
                let mut device = GpuDevice::new();
                let dummy = DummyBackend::new(&target, device.loss_signal());
                let control = dummy.control();
                device.attach(Box::new(dummy));
                (Renderer::with_device(config, device), Some(control))
            }
            native => {
                let config = config
                    .with_backend(native.backend_type())
                    .with_backend_fallback(false);
                (Renderer::new(config), None)
            }
        };

        renderer.initialize(target).ok()?;
        Some(Self {
            backend,
            renderer,
            control,
        })
    }

    /// Dummy control; panics on native backends.
    #[allow(dead_code)]
    pub fn control(&self) -> &DummyControl {
        self.control
            .as_ref()
            .expect("fault injection is only available on the dummy backend")
    }
}

// ============================================================================
// Scene Helpers
// ============================================================================

/// `count` triangles spread along X in front of [`camera`], sharing one
/// material so they batch together.
#[allow(dead_code)]
pub fn triangle_scene(count: u64) -> Scene {
    let geometry = Arc::new(Geometry::triangle(GeometryId(1)));
    let material = Arc::new(Material::basic(MaterialId(1)));
    let mut scene = Scene::new();
    for i in 0..count {
        let x = i as f32 * 0.5 - count as f32 * 0.25;
        scene.add(
            Drawable::new(ObjectId(i + 1), geometry.clone(), material.clone())
                .with_transform(glam::Mat4::from_translation(glam::vec3(x, 0.0, -5.0))),
        );
    }
    scene
}

/// Perspective camera at the origin looking down -Z.
#[allow(dead_code)]
pub fn camera() -> Camera {
    Camera::perspective(
        std::f32::consts::FRAC_PI_3,
        WIDTH as f32 / HEIGHT as f32,
        0.1,
        100.0,
    )
}

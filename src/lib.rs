//! GPU Render Core - backend abstraction and resource lifecycle beneath a 3D renderer
//!
//! Two native backends sit behind one object-safe [`GpuBackend`] contract:
//! - **wgpu**: implicit queue ordering, asynchronous adapter and device negotiation
//! - **Vulkan**: direct Vulkan via ash with explicit fences and semaphores (native only)
//!
//! plus a **Dummy** backend that does no GPU work, used for tests and headless runs.
//!
//! # Features
//! - Buffer, texture, shader-module and pipeline managers with tombstoned handles
//! - Pipeline cache keyed by structural descriptor equality
//! - Swapchain state machine with out-of-date recovery
//! - Device-loss detection, gating and recovery
//! - Per-frame frustum culling, draw-call batching and statistics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gpu_render_core::{
//!     Camera, Drawable, Geometry, GeometryId, Material, MaterialId, ObjectId, Renderer,
//!     RendererConfig, Scene, SurfaceTarget,
//! };
//!
//! let mut renderer = Renderer::new(RendererConfig::headless());
//! renderer.initialize(SurfaceTarget::headless(800, 600))?;
//!
//! let mut scene = Scene::new();
//! scene.add(Drawable::new(
//!     ObjectId(1),
//!     Arc::new(Geometry::triangle(GeometryId(1))),
//!     Arc::new(Material::basic(MaterialId(1))),
//! ));
//! let camera = Camera::perspective(1.0, 800.0 / 600.0, 0.1, 100.0);
//! renderer.render(&scene, &camera)?;
//! # Ok::<(), gpu_render_core::RenderError>(())
//! ```

pub mod backend;
pub mod batching;
pub mod buffer;
pub mod commands;
pub mod config;
pub mod culling;
pub mod device;
pub mod device_loss;
pub mod error;
pub mod handle;
pub mod pipeline;
pub mod presentation;
pub mod renderer;
pub mod resource_pool;
pub mod scene;
pub mod shader;
pub mod stats;
pub mod texture;
pub mod types;

use serde::{Deserialize, Serialize};

pub use backend::{
    create_backend, AdapterInfo, BackendError, BackendResult, DeviceLimits, DummyBackend,
    DummyControl, GpuBackend, NativeHandle, SurfaceTarget,
};
#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanBackend;
#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;
pub use batching::{BatchKey, BatchingStats, DrawCallBatcher, MeshBatch};
pub use buffer::BufferManager;
pub use config::{ConfigError, RecoveryConfig, RendererConfig};
pub use culling::{CullStats, FrustumCuller};
pub use device::GpuDevice;
pub use device_loss::{DeviceLossRecovery, DeviceLossSignal, DeviceState};
pub use error::{RenderError, RenderResult};
pub use handle::{
    BufferHandle, PipelineHandle, ResourceHandle, ResourceKind, ShaderModuleHandle, TextureHandle,
    TextureViewHandle,
};
pub use pipeline::{PipelineManager, RenderPipelineDescriptor, ShaderStage};
pub use presentation::{PresentationConfig, PresentationManager, SwapchainImage, SwapchainState};
pub use renderer::Renderer;
pub use resource_pool::{CacheStats, ResourcePool};
pub use scene::{
    Camera, Drawable, Geometry, GeometryId, Material, MaterialId, ObjectId, RenderStateBits,
    Scene, SceneSource,
};
pub use shader::{ShaderModuleDescriptor, ShaderModuleManager, BASIC_SHADER};
pub use stats::{RenderStats, RenderStatsTracker};
pub use texture::TextureManager;

/// Which backend drives the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// No GPU work; records and validates calls only
    Dummy,
    /// wgpu - cross-platform, easier to use
    #[default]
    Wgpu,
    /// Vulkan via ash - maximum control (native only)
    Vulkan,
}

impl BackendType {
    pub fn name(&self) -> &'static str {
        match self {
            BackendType::Dummy => "Dummy",
            BackendType::Wgpu => "wgpu",
            BackendType::Vulkan => "Vulkan",
        }
    }

    /// Whether this backend was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            BackendType::Dummy => true,
            BackendType::Wgpu => cfg!(feature = "wgpu-backend"),
            BackendType::Vulkan => cfg!(feature = "vulkan-backend"),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

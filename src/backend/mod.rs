//! Backend abstraction layer
//!
//! [`GpuBackend`] is the contract every native API implements. Backends hand
//! out opaque [`NativeHandle`] ids for the objects they own and keep their own
//! synchronization internal: wgpu relies on implicit queue ordering, Vulkan on
//! a fence and two semaphores, the dummy backend on nothing at all.

pub mod dummy;
pub mod error;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::commands::FrameRecording;
use crate::device_loss::DeviceLossSignal;
use crate::pipeline::RenderPipelineDescriptor;
use crate::types::{
    BufferDescriptor, Extent2d, PresentMode, TextureDataLayout, TextureDescriptor, TextureFormat,
    TextureRegion, TextureViewInfo,
};
use crate::BackendType;

pub use dummy::{DummyBackend, DummyControl};
pub use error::{BackendError, BackendResult};

/// Id of an object owned by a backend. Meaningless to any other backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native#{}", self.0)
    }
}

/// Kind of physical adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

/// Adapter identity reported after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: AdapterType,
    pub driver: String,
    pub backend: BackendType,
}

/// Device limits the managers validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_texture_dimension_2d: u32,
    pub max_texture_array_layers: u32,
    pub max_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_vertex_buffer_array_stride: u32,
    pub min_uniform_buffer_offset_alignment: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_texture_dimension_2d: 8192,
            max_texture_array_layers: 256,
            max_buffer_size: 256 * 1024 * 1024,
            max_vertex_attributes: 16,
            max_vertex_buffer_array_stride: 2048,
            min_uniform_buffer_offset_alignment: 256,
        }
    }
}

/// One compiler message attached to a shader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDiagnostic {
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<u32>,
    /// 1-based column, when known.
    pub column: Option<u32>,
}

impl fmt::Display for ShaderDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{}:{}: {}", line, column, self.message),
            (Some(line), None) => write!(f, "{}: {}", line, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Native modules backing the two stages of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineShaders {
    pub vertex: NativeHandle,
    pub fragment: NativeHandle,
}

/// What the surface supports right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// `0` means no upper bound.
    pub max_image_count: u32,
    pub formats: Vec<TextureFormat>,
    pub present_modes: Vec<PresentMode>,
    pub current_extent: Option<Extent2d>,
}

/// Parameters of a swapchain build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceConfiguration {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub present_mode: PresentMode,
    pub image_count: u32,
}

/// A swapchain image handed out by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The image is usable but the swapchain no longer matches the surface.
    pub suboptimal: bool,
}

/// Result of a present call that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// A window the backends can create a presentation surface for.
pub trait SurfaceSource: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T: HasWindowHandle + HasDisplayHandle + Send + Sync> SurfaceSource for T {}

/// Where frames go.
#[derive(Clone)]
pub enum SurfaceTarget {
    /// An on-screen window.
    Window {
        source: Arc<dyn SurfaceSource>,
        width: u32,
        height: u32,
    },
    /// No window. Only the dummy backend presents to this.
    Headless { width: u32, height: u32 },
}

impl SurfaceTarget {
    pub fn window(source: Arc<dyn SurfaceSource>, width: u32, height: u32) -> Self {
        SurfaceTarget::Window {
            source,
            width,
            height,
        }
    }

    pub fn headless(width: u32, height: u32) -> Self {
        SurfaceTarget::Headless { width, height }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            SurfaceTarget::Window { width, height, .. } => (*width, *height),
            SurfaceTarget::Headless { width, height } => (*width, *height),
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, SurfaceTarget::Headless { .. })
    }
}

impl fmt::Debug for SurfaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceTarget::Window { width, height, .. } => f
                .debug_struct("Window")
                .field("width", width)
                .field("height", height)
                .finish_non_exhaustive(),
            SurfaceTarget::Headless { width, height } => f
                .debug_struct("Headless")
                .field("width", width)
                .field("height", height)
                .finish(),
        }
    }
}

/// The contract between the managers and a native graphics API.
///
/// All calls come from the render thread. Destroy calls are infallible; a
/// backend logs and ignores ids it does not know.
pub trait GpuBackend: Send {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    fn backend_type(&self) -> BackendType;

    fn adapter_info(&self) -> AdapterInfo;

    fn limits(&self) -> DeviceLimits;

    // === Buffers ===

    /// Allocate a buffer, optionally filling it with `contents`.
    fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> BackendResult<NativeHandle>;

    /// Queue a write. Ordered before the next submission, nothing more.
    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    fn destroy_buffer(&mut self, buffer: NativeHandle);

    // === Textures ===

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> BackendResult<NativeHandle>;

    fn write_texture(
        &mut self,
        texture: NativeHandle,
        region: &TextureRegion,
        data: &[u8],
        layout: &TextureDataLayout,
    ) -> BackendResult<()>;

    fn create_texture_view(
        &mut self,
        texture: NativeHandle,
        view: &TextureViewInfo,
    ) -> BackendResult<NativeHandle>;

    fn destroy_texture_view(&mut self, view: NativeHandle);

    fn destroy_texture(&mut self, texture: NativeHandle);

    // === Shaders and pipelines ===

    /// Build a native module from WGSL source.
    ///
    /// Backends without eager validation succeed here and report problems
    /// through [`shader_diagnostics`](Self::shader_diagnostics) and at
    /// pipeline creation.
    fn create_shader_module(&mut self, label: Option<&str>, source: &str)
        -> BackendResult<NativeHandle>;

    /// Messages recorded for a module, `None` if the id is unknown.
    fn shader_diagnostics(&self, module: NativeHandle) -> Option<Vec<ShaderDiagnostic>>;

    fn destroy_shader_module(&mut self, module: NativeHandle);

    fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
        shaders: &PipelineShaders,
    ) -> BackendResult<NativeHandle>;

    fn destroy_render_pipeline(&mut self, pipeline: NativeHandle);

    // === Presentation ===

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities>;

    /// (Re)build the swapchain. The caller has already waited for idle.
    fn configure_surface(&mut self, config: &SurfaceConfiguration) -> BackendResult<()>;

    fn acquire_image(&mut self, timeout: Duration) -> BackendResult<AcquiredImage>;

    /// Execute one frame's recorded passes against the acquired image.
    fn submit(&mut self, recording: &FrameRecording) -> BackendResult<()>;

    fn present(&mut self, image_index: u32) -> BackendResult<PresentStatus>;

    /// Give up on an acquired image without presenting it. Whatever the
    /// acquire left pending must be settled so the next acquire is valid.
    fn abandon_frame(&mut self, image_index: u32);

    /// Drop the swapchain. Frame synchronization objects live with the device.
    fn release_surface(&mut self);

    // === Device ===

    fn wait_idle(&mut self) -> BackendResult<()>;

    /// Throw away the logical device and negotiate a new one on the same
    /// surface. Every native id handed out before becomes invalid.
    fn recreate_device(&mut self) -> BackendResult<()>;
}

/// Create a backend of the requested kind.
///
/// With `allow_fallback`, a failing backend is followed by the remaining ones
/// in the order Vulkan, wgpu, dummy.
pub fn create_backend(
    kind: BackendType,
    target: &SurfaceTarget,
    signal: DeviceLossSignal,
    allow_fallback: bool,
) -> BackendResult<Box<dyn GpuBackend>> {
    let mut order = vec![kind];
    if allow_fallback {
        order.extend(
            [BackendType::Vulkan, BackendType::Wgpu, BackendType::Dummy]
                .into_iter()
                .filter(|candidate| *candidate != kind),
        );
    }

    let mut last_error = None;
    for candidate in order {
        match create_single(candidate, target, signal.clone()) {
            Ok(backend) => {
                if candidate != kind {
                    log::warn!("Falling back to {} backend", backend.name());
                }
                log::info!("Using {} ({})", backend.name(), backend.adapter_info().name);
                return Ok(backend);
            }
            Err(err) => {
                log::warn!("Failed to create {:?} backend: {}", candidate, err);
                last_error = Some(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| BackendError::InitializationFailed("no backend available".into())))
}

fn create_single(
    kind: BackendType,
    target: &SurfaceTarget,
    signal: DeviceLossSignal,
) -> BackendResult<Box<dyn GpuBackend>> {
    match kind {
        BackendType::Dummy => Ok(Box::new(DummyBackend::new(target, signal))),
        #[cfg(feature = "wgpu-backend")]
        BackendType::Wgpu => Ok(Box::new(wgpu_backend::WgpuBackend::new(target, signal)?)),
        #[cfg(feature = "vulkan-backend")]
        BackendType::Vulkan => Ok(Box::new(vulkan::VulkanBackend::new(target, signal)?)),
        #[allow(unreachable_patterns)]
        other => Err(BackendError::Unsupported(format!(
            "{:?} backend not compiled in",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dummy_backend() {
        let backend = create_backend(
            BackendType::Dummy,
            &SurfaceTarget::headless(320, 240),
            DeviceLossSignal::new(),
            false,
        )
        .unwrap();
        assert_eq!(backend.backend_type(), BackendType::Dummy);
    }

    #[test]
    fn test_headless_falls_back_to_dummy() {
        let backend = create_backend(
            BackendType::Vulkan,
            &SurfaceTarget::headless(320, 240),
            DeviceLossSignal::new(),
            true,
        )
        .unwrap();
        assert_eq!(backend.backend_type(), BackendType::Dummy);
    }

    #[test]
    fn test_headless_without_fallback_fails() {
        let result = create_backend(
            BackendType::Wgpu,
            &SurfaceTarget::headless(320, 240),
            DeviceLossSignal::new(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = ShaderDiagnostic {
            message: "expected ';'".into(),
            line: Some(3),
            column: Some(14),
        };
        assert_eq!(diag.to_string(), "3:14: expected ';'");
    }
}

//! Shader module management.
//!
//! WGSL source is an opaque blob to the managers. Whether a bad module fails
//! at [`ShaderModuleManager::compile`] or only later when a pipeline is built
//! from it depends on the backend: Vulkan has to translate to SPIR-V up front
//! and fails eagerly, wgpu and the dummy backend only record diagnostics.

use crate::backend::{NativeHandle, ShaderDiagnostic};
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::handle::{HandleTable, ShaderModuleHandle};

/// Position + color shader with a single MVP uniform at group 0, binding 0.
pub const BASIC_SHADER: &str = r#"
struct Uniforms {
    mvp: mat4x4<f32>,
};

@group(0) @binding(0)
var<uniform> uniforms: Uniforms;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) color: vec3<f32>,
};

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) color: vec3<f32>,
};

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = uniforms.mvp * vec4<f32>(in.position, 1.0);
    out.color = in.color;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(in.color, 1.0);
}
"#;

/// Source for a shader module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderModuleDescriptor {
    pub label: Option<String>,
    pub source: String,
}

impl ShaderModuleDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            label: None,
            source: source.into(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Information about a live shader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModuleInfo {
    pub label: Option<String>,
    pub source_len: usize,
}

struct ShaderModuleRecord {
    native: NativeHandle,
    info: ShaderModuleInfo,
}

const WHAT: &str = "shader-module";

/// Owns every shader module created through it.
#[derive(Default)]
pub struct ShaderModuleManager {
    modules: HandleTable<ShaderModuleRecord>,
}

impl ShaderModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a native module.
    ///
    /// Success does not mean the module is semantically valid; see
    /// [`diagnostics`](Self::diagnostics).
    pub fn compile(
        &mut self,
        device: &mut GpuDevice,
        descriptor: &ShaderModuleDescriptor,
    ) -> RenderResult<ShaderModuleHandle> {
        if descriptor.source.trim().is_empty() {
            return Err(RenderError::InvalidArgument(
                "shader source is empty".to_string(),
            ));
        }

        let backend = device.backend_mut()?;
        let native = backend.create_shader_module(descriptor.label.as_deref(), &descriptor.source)?;

        let id = self.modules.insert(ShaderModuleRecord {
            native,
            info: ShaderModuleInfo {
                label: descriptor.label.clone(),
                source_len: descriptor.source.len(),
            },
        });
        log::debug!(
            "Compiled shader module {:?} ({} bytes)",
            descriptor.label,
            descriptor.source.len()
        );
        Ok(ShaderModuleHandle(id))
    }

    /// Build a throwaway module and report whether it came out clean.
    pub fn validate(&mut self, device: &mut GpuDevice, code: &str) -> bool {
        let Ok(backend) = device.backend_mut() else {
            return false;
        };
        match backend.create_shader_module(Some("validation"), code) {
            Ok(native) => {
                let clean = backend
                    .shader_diagnostics(native)
                    .map_or(true, |messages| messages.is_empty());
                backend.destroy_shader_module(native);
                clean
            }
            Err(err) => {
                log::debug!("Shader validation failed: {}", err);
                false
            }
        }
    }

    /// Messages recorded for a module. Best effort: `None` when the handle is
    /// not live or the backend has nothing to say.
    pub fn diagnostics(
        &self,
        device: &GpuDevice,
        handle: ShaderModuleHandle,
    ) -> Option<Vec<ShaderDiagnostic>> {
        let record = self.modules.get(handle.0, WHAT).ok()?;
        device.backend().ok()?.shader_diagnostics(record.native)
    }

    pub fn dispose(&mut self, device: &mut GpuDevice, handle: ShaderModuleHandle) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.modules.destroy(handle.0, WHAT)?;
        backend.destroy_shader_module(record.native);
        Ok(())
    }

    pub fn info(&self, handle: ShaderModuleHandle) -> RenderResult<&ShaderModuleInfo> {
        Ok(&self.modules.get(handle.0, WHAT)?.info)
    }

    pub(crate) fn native(&self, handle: ShaderModuleHandle) -> RenderResult<NativeHandle> {
        Ok(self.modules.get(handle.0, WHAT)?.native)
    }

    pub fn is_live(&self, handle: ShaderModuleHandle) -> bool {
        self.modules.is_live(handle.0)
    }

    pub fn live_count(&self) -> usize {
        self.modules.live_count()
    }

    /// Release every module. Waits for the device to go idle first.
    pub fn dispose_all(&mut self, device: &mut GpuDevice) -> RenderResult<usize> {
        let backend = device.backend_mut()?;
        backend.wait_idle()?;
        let released = self.modules.destroy_all();
        for (_, record) in &released {
            backend.destroy_shader_module(record.native);
        }
        Ok(released.len())
    }

    /// Tombstone every module without native calls. Used once the device
    /// that owned them is gone.
    pub fn invalidate_all(&mut self) -> usize {
        self.modules.destroy_all().len()
    }
}

/// A parsed and validated WGSL module.
pub(crate) struct ParsedWgsl {
    pub module: naga::Module,
    pub info: naga::valid::ModuleInfo,
}

/// Parse and validate WGSL with naga, converting failures into diagnostics.
pub(crate) fn parse_wgsl(source: &str) -> Result<ParsedWgsl, Vec<ShaderDiagnostic>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|err| vec![diagnostic(err.message().to_string(), err.location(source))])?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|err| vec![diagnostic(err.as_inner().to_string(), err.location(source))])?;

    Ok(ParsedWgsl { module, info })
}

/// Whether `module` declares an entry point `name` for `stage`.
#[cfg_attr(not(feature = "vulkan-backend"), allow(dead_code))]
pub(crate) fn has_entry_point(module: &naga::Module, name: &str, stage: naga::ShaderStage) -> bool {
    module
        .entry_points
        .iter()
        .any(|ep| ep.name == name && ep.stage == stage)
}

fn diagnostic(message: String, location: Option<naga::SourceLocation>) -> ShaderDiagnostic {
    ShaderDiagnostic {
        message,
        line: location.map(|loc| loc.line_number),
        column: location.map(|loc| loc.line_position),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, SurfaceTarget};
    use crate::device_loss::DeviceLossSignal;

    fn device() -> GpuDevice {
        let signal = DeviceLossSignal::new();
        GpuDevice::with_backend(Box::new(DummyBackend::new(
            &SurfaceTarget::headless(64, 64),
            signal,
        )))
    }

    #[test]
    fn test_basic_shader_parses() {
        let parsed = parse_wgsl(BASIC_SHADER).unwrap();
        assert!(has_entry_point(&parsed.module, "vs_main", naga::ShaderStage::Vertex));
        assert!(has_entry_point(&parsed.module, "fs_main", naga::ShaderStage::Fragment));
        assert!(!has_entry_point(&parsed.module, "fs_main", naga::ShaderStage::Vertex));
    }

    #[test]
    fn test_parse_error_has_location() {
        let source = "@vertex\nfn vs_main( -> {\n}";
        let diagnostics = parse_wgsl(source).err().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, Some(2));
        assert!(diagnostics[0].column.is_some());
    }

    #[test]
    fn test_compile_and_dispose() {
        let mut device = device();
        let mut shaders = ShaderModuleManager::new();

        let handle = shaders
            .compile(&mut device, &ShaderModuleDescriptor::new(BASIC_SHADER).with_label("basic"))
            .unwrap();
        assert_eq!(shaders.live_count(), 1);
        assert_eq!(shaders.info(handle).unwrap().label.as_deref(), Some("basic"));
        assert_eq!(shaders.diagnostics(&device, handle), Some(Vec::new()));

        shaders.dispose(&mut device, handle).unwrap();
        assert!(matches!(
            shaders.dispose(&mut device, handle),
            Err(RenderError::InvalidHandle(_))
        ));
        assert_eq!(shaders.diagnostics(&device, handle), None);
    }

    #[test]
    fn test_compile_is_lazy_on_dummy() {
        let mut device = device();
        let mut shaders = ShaderModuleManager::new();

        // Broken source still yields a module; the problem shows up in diagnostics.
        let handle = shaders
            .compile(&mut device, &ShaderModuleDescriptor::new("fn broken( {"))
            .unwrap();
        let diagnostics = shaders.diagnostics(&device, handle).unwrap();
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn test_validate_does_not_retain() {
        let mut device = device();
        let mut shaders = ShaderModuleManager::new();

        assert!(shaders.validate(&mut device, BASIC_SHADER));
        assert!(!shaders.validate(&mut device, "not wgsl at all"));
        assert_eq!(shaders.live_count(), 0);
    }

    #[test]
    fn test_empty_source_rejected() {
        let mut device = device();
        let mut shaders = ShaderModuleManager::new();
        assert!(matches!(
            shaders.compile(&mut device, &ShaderModuleDescriptor::new("   ")),
            Err(RenderError::InvalidArgument(_))
        ));
    }
}

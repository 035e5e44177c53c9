//! Render pipeline assembly and caching.
//!
//! Pipelines are cached in a [`ResourcePool`] keyed by structural descriptor
//! equality, so materials that share shaders and state share one native
//! pipeline. The label does not take part in equality.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::backend::{NativeHandle, PipelineShaders};
use crate::commands::FrameRecorder;
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::handle::{HandleTable, PipelineHandle, ShaderModuleHandle};
use crate::resource_pool::ResourcePool;
use crate::shader::{ShaderModuleDescriptor, ShaderModuleManager};
use crate::types::{
    CullMode, DepthStencilState, FrontFace, MultisampleState, PrimitiveTopology, TextureFormat,
    VertexBufferLayout,
};

/// One programmable stage: WGSL source plus entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub source: String,
    pub entry_point: String,
}

impl ShaderStage {
    pub fn new(source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
        }
    }
}

/// Everything needed to build a render pipeline.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub vertex: ShaderStage,
    pub fragment: ShaderStage,
    pub vertex_layout: VertexBufferLayout,
    pub primitive_topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub color_format: TextureFormat,
    /// `None` means no depth attachment at all.
    pub depth_stencil: Option<DepthStencilState>,
    pub multisample: Option<MultisampleState>,
}

impl RenderPipelineDescriptor {
    /// A pipeline using `vs_main` and `fs_main` from one WGSL source with the
    /// position + color vertex layout.
    pub fn new(source: &str, color_format: TextureFormat) -> Self {
        Self {
            label: None,
            vertex: ShaderStage::new(source, "vs_main"),
            fragment: ShaderStage::new(source, "fs_main"),
            vertex_layout: VertexBufferLayout::position_color(),
            primitive_topology: PrimitiveTopology::default(),
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
            color_format,
            depth_stencil: None,
            multisample: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_depth_stencil(mut self, depth_stencil: DepthStencilState) -> Self {
        self.depth_stencil = Some(depth_stencil);
        self
    }

    pub fn with_multisample(mut self, multisample: MultisampleState) -> Self {
        self.multisample = Some(multisample);
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_front_face(mut self, front_face: FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.primitive_topology = topology;
        self
    }

    pub fn uses_depth(&self) -> bool {
        self.depth_stencil.is_some()
    }
}

impl PartialEq for RenderPipelineDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.vertex == other.vertex
            && self.fragment == other.fragment
            && self.vertex_layout == other.vertex_layout
            && self.primitive_topology == other.primitive_topology
            && self.cull_mode == other.cull_mode
            && self.front_face == other.front_face
            && self.color_format == other.color_format
            && self.depth_stencil == other.depth_stencil
            && self.multisample == other.multisample
    }
}

impl Eq for RenderPipelineDescriptor {}

impl Hash for RenderPipelineDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vertex.hash(state);
        self.fragment.hash(state);
        self.vertex_layout.hash(state);
        self.primitive_topology.hash(state);
        self.cull_mode.hash(state);
        self.front_face.hash(state);
        self.color_format.hash(state);
        self.depth_stencil.hash(state);
        self.multisample.hash(state);
    }
}

struct PipelineRecord {
    native: NativeHandle,
    uses_depth: bool,
    label: Option<String>,
}

const WHAT: &str = "pipeline";

/// Builds pipelines and owns the shader modules they are built from.
#[derive(Default)]
pub struct PipelineManager {
    pipelines: HandleTable<PipelineRecord>,
    shaders: ShaderModuleManager,
}

impl PipelineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pipeline for `descriptor`, building it on a miss.
    pub fn create_pipeline(
        &mut self,
        device: &mut GpuDevice,
        pool: &mut ResourcePool,
        descriptor: &RenderPipelineDescriptor,
    ) -> RenderResult<PipelineHandle> {
        device.backend()?;
        if let Some(handle) = pool.lookup_pipeline(descriptor) {
            if self.pipelines.is_live(handle.0) {
                return Ok(handle);
            }
        }

        validate_descriptor(device, descriptor)?;
        log::debug!("Pipeline cache miss for {:?}, compiling", descriptor.label);

        let vertex = self.module_for(device, pool, &descriptor.vertex.source)?;
        let fragment = self.module_for(device, pool, &descriptor.fragment.source)?;
        let shaders = PipelineShaders {
            vertex: self.shaders.native(vertex)?,
            fragment: self.shaders.native(fragment)?,
        };

        let native = device
            .backend_mut()?
            .create_render_pipeline(descriptor, &shaders)?;
        let handle = PipelineHandle(self.pipelines.insert(PipelineRecord {
            native,
            uses_depth: descriptor.uses_depth(),
            label: descriptor.label.clone(),
        }));
        pool.insert_pipeline(descriptor.clone(), handle);
        Ok(handle)
    }

    /// Record a pipeline bind.
    pub fn bind(&self, handle: PipelineHandle, recorder: &mut FrameRecorder) -> RenderResult<()> {
        let record = self.pipelines.get(handle.0, WHAT)?;
        recorder.set_pipeline(record.native, record.uses_depth);
        Ok(())
    }

    pub fn dispose(
        &mut self,
        device: &mut GpuDevice,
        pool: &mut ResourcePool,
        handle: PipelineHandle,
    ) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.pipelines.destroy(handle.0, WHAT)?;
        backend.destroy_render_pipeline(record.native);
        pool.remove_pipeline(handle);
        log::trace!("Disposed {} {:?}", handle, record.label);
        Ok(())
    }

    pub fn is_live(&self, handle: PipelineHandle) -> bool {
        self.pipelines.is_live(handle.0)
    }

    pub fn uses_depth(&self, handle: PipelineHandle) -> RenderResult<bool> {
        Ok(self.pipelines.get(handle.0, WHAT)?.uses_depth)
    }

    pub fn live_count(&self) -> usize {
        self.pipelines.live_count()
    }

    /// Shader modules compiled on behalf of pipelines.
    pub fn shader_module_count(&self) -> usize {
        self.shaders.live_count()
    }

    /// Release every pipeline and module and empty the pool.
    pub fn dispose_all(&mut self, device: &mut GpuDevice, pool: &mut ResourcePool) -> RenderResult<usize> {
        let backend = device.backend_mut()?;
        backend.wait_idle()?;
        let released = self.pipelines.destroy_all();
        for (_, record) in &released {
            backend.destroy_render_pipeline(record.native);
        }
        self.shaders.dispose_all(device)?;
        pool.clear();
        Ok(released.len())
    }

    /// Tombstone every pipeline and module without native calls.
    pub fn invalidate_all(&mut self) -> usize {
        self.shaders.invalidate_all();
        self.pipelines.destroy_all().len()
    }

    fn module_for(
        &mut self,
        device: &mut GpuDevice,
        pool: &mut ResourcePool,
        source: &str,
    ) -> RenderResult<ShaderModuleHandle> {
        if let Some(handle) = pool.shader_module(source) {
            if self.shaders.is_live(handle) {
                return Ok(handle);
            }
        }
        let handle = self
            .shaders
            .compile(device, &ShaderModuleDescriptor::new(source))?;
        pool.insert_shader_module(source, handle);
        Ok(handle)
    }
}

fn validate_descriptor(device: &GpuDevice, desc: &RenderPipelineDescriptor) -> RenderResult<()> {
    let invalid = |reason: String| Err(RenderError::InvalidArgument(reason));
    let limits = device.limits();
    let layout = &desc.vertex_layout;

    if desc.vertex.entry_point.is_empty() || desc.fragment.entry_point.is_empty() {
        return invalid("pipeline stages need an entry point".into());
    }
    if layout.array_stride == 0 || layout.array_stride > limits.max_vertex_buffer_array_stride as u64 {
        return invalid(format!("vertex stride {} is out of range", layout.array_stride));
    }
    if layout.attributes.len() > limits.max_vertex_attributes as usize {
        return invalid(format!(
            "{} vertex attributes exceed the device maximum {}",
            layout.attributes.len(),
            limits.max_vertex_attributes
        ));
    }
    let mut locations = HashSet::new();
    for attribute in &layout.attributes {
        if attribute.offset + attribute.format.size() > layout.array_stride {
            return invalid(format!(
                "attribute at location {} overruns the {}-byte stride",
                attribute.location, layout.array_stride
            ));
        }
        if !locations.insert(attribute.location) {
            return invalid(format!("location {} is bound twice", attribute.location));
        }
    }
    if desc.color_format.is_depth() {
        return invalid(format!("{:?} is not a color format", desc.color_format));
    }
    if let Some(depth) = &desc.depth_stencil {
        if !depth.format.is_depth() {
            return invalid(format!("{:?} is not a depth format", depth.format));
        }
    }
    if let Some(multisample) = &desc.multisample {
        if !matches!(multisample.count, 1 | 2 | 4 | 8) {
            return invalid(format!("unsupported sample count {}", multisample.count));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, SurfaceTarget};
    use crate::shader::BASIC_SHADER;
    use crate::types::{VertexAttribute, VertexFormat};

    fn setup() -> (GpuDevice, crate::backend::DummyControl, ResourcePool, PipelineManager) {
        let mut device = GpuDevice::new();
        let backend = DummyBackend::new(&SurfaceTarget::headless(64, 64), device.loss_signal());
        let control = backend.control();
        device.attach(Box::new(backend));
        (device, control, ResourcePool::new(), PipelineManager::new())
    }

    #[test]
    fn test_cache_idempotence() {
        let (mut device, control, mut pool, mut pipelines) = setup();
        let desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);

        let a = pipelines.create_pipeline(&mut device, &mut pool, &desc).unwrap();
        let b = pipelines
            .create_pipeline(&mut device, &mut pool, &desc.clone().with_label("other label"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(control.pipelines_created(), 1);
        // One source serves both stages.
        assert_eq!(control.shader_modules_created(), 1);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_distinct_state_distinct_pipeline() {
        let (mut device, control, mut pool, mut pipelines) = setup();
        let desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);
        let depth = desc.clone().with_depth_stencil(DepthStencilState::depth_less());

        let a = pipelines.create_pipeline(&mut device, &mut pool, &desc).unwrap();
        let b = pipelines.create_pipeline(&mut device, &mut pool, &depth).unwrap();
        assert_ne!(a, b);
        assert!(!pipelines.uses_depth(a).unwrap());
        assert!(pipelines.uses_depth(b).unwrap());
        assert_eq!(control.pipelines_created(), 2);
        assert_eq!(control.shader_modules_created(), 1);
    }

    #[test]
    fn test_broken_shader_fails_at_pipeline() {
        let (mut device, _control, mut pool, mut pipelines) = setup();
        let desc = RenderPipelineDescriptor::new("fn nope( {", TextureFormat::Bgra8Unorm);
        assert!(matches!(
            pipelines.create_pipeline(&mut device, &mut pool, &desc),
            Err(RenderError::CompileError(_))
        ));
        assert_eq!(pipelines.live_count(), 0);
    }

    #[test]
    fn test_missing_entry_point() {
        let (mut device, _control, mut pool, mut pipelines) = setup();
        let mut desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);
        desc.fragment.entry_point = "main".into();
        assert!(matches!(
            pipelines.create_pipeline(&mut device, &mut pool, &desc),
            Err(RenderError::CompileError(_))
        ));
    }

    #[test]
    fn test_layout_validation() {
        let (mut device, _control, mut pool, mut pipelines) = setup();
        let mut desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);
        desc.vertex_layout.attributes.push(VertexAttribute {
            format: VertexFormat::Float32x4,
            offset: 16,
            location: 2,
        });
        assert!(matches!(
            pipelines.create_pipeline(&mut device, &mut pool, &desc),
            Err(RenderError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bind_and_dispose() {
        let (mut device, _control, mut pool, mut pipelines) = setup();
        let desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);
        let handle = pipelines.create_pipeline(&mut device, &mut pool, &desc).unwrap();

        let mut recorder = FrameRecorder::new([0.0; 4], None);
        pipelines.bind(handle, &mut recorder).unwrap();
        assert!(recorder.has_pipeline());

        pipelines.dispose(&mut device, &mut pool, handle).unwrap();
        assert!(matches!(
            pipelines.bind(handle, &mut recorder),
            Err(RenderError::InvalidHandle(_))
        ));
        assert_eq!(pool.pipeline_count(), 0);

        // A fresh pipeline is built after an explicit dispose.
        let again = pipelines.create_pipeline(&mut device, &mut pool, &desc).unwrap();
        assert_ne!(again, handle);
    }
}

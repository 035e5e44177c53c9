//! wgpu backend implementation
//!
//! wgpu orders queue work implicitly, so this backend keeps no fences of its
//! own. Native ids index plain hash maps; the frame recording is replayed into
//! one command encoder per submission.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{FrameRecording, RecordedPass, RenderCommand};
use crate::device_loss::DeviceLossSignal;
use crate::pipeline::RenderPipelineDescriptor;
use crate::shader::parse_wgsl;
use crate::types::{
    BufferDescriptor, BufferUsage, CompareFunction, CullMode, FrontFace, IndexFormat, PresentMode,
    PrimitiveTopology, TextureDataLayout, TextureDescriptor, TextureFormat, TextureRegion,
    TextureUsage, TextureViewDimension, TextureViewInfo, VertexFormat,
};
use crate::BackendType;

use super::{
    AcquiredImage, AdapterInfo, AdapterType, BackendError, BackendResult, DeviceLimits,
    GpuBackend, NativeHandle, PipelineShaders, PresentStatus, ShaderDiagnostic,
    SurfaceCapabilities, SurfaceConfiguration, SurfaceTarget,
};

struct ShaderEntry {
    module: wgpu::ShaderModule,
    diagnostics: Vec<ShaderDiagnostic>,
}

struct AcquiredFrame {
    index: u32,
    texture: wgpu::SurfaceTexture,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    signal: DeviceLossSignal,
    /// Set before the current device is dropped on purpose, so its lost
    /// callback does not raise the signal.
    retiring: Arc<AtomicBool>,

    uniform_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,

    surface_config: Option<wgpu::SurfaceConfiguration>,
    image_count: u32,
    next_image: u32,
    current_frame: Option<AcquiredFrame>,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, wgpu::Texture>,
    texture_views: HashMap<u64, (u64, wgpu::TextureView)>,
    shader_modules: HashMap<u64, ShaderEntry>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    /// Uniform bind groups keyed by the buffer they bind.
    bind_groups: HashMap<u64, wgpu::BindGroup>,

    next_id: u64,
}

impl WgpuBackend {
    /// Create a backend presenting to `target`. Blocks on adapter and device
    /// negotiation.
    pub fn new(target: &SurfaceTarget, signal: DeviceLossSignal) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(target, signal))
    }

    pub async fn new_async(target: &SurfaceTarget, signal: DeviceLossSignal) -> BackendResult<Self> {
        let SurfaceTarget::Window { source, .. } = target else {
            return Err(BackendError::SurfaceCreationFailed(
                "wgpu backend needs a window".into(),
            ));
        };

        let backends = if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all())
        } else {
            wgpu::Backends::all()
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let surface = instance
            .create_surface(source.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let retiring = Arc::new(AtomicBool::new(false));
        let (device, queue) = Self::request_device(&adapter, &signal, &retiring).await?;
        let (uniform_layout, pipeline_layout) = Self::create_layouts(&device);

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            signal,
            retiring,
            uniform_layout,
            pipeline_layout,
            surface_config: None,
            image_count: 0,
            next_image: 0,
            current_frame: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            shader_modules: HashMap::new(),
            render_pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            next_id: 1,
        })
    }

    async fn request_device(
        adapter: &wgpu::Adapter,
        signal: &DeviceLossSignal,
        retiring: &Arc<AtomicBool>,
    ) -> BackendResult<(wgpu::Device, wgpu::Queue)> {
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("wgpu error: {}", error);
        }));

        let signal = signal.clone();
        let retiring = retiring.clone();
        device.set_device_lost_callback(move |reason, message| {
            if retiring.load(Ordering::SeqCst) {
                log::debug!("Retired wgpu device released ({:?})", reason);
                return;
            }
            log::error!("wgpu device lost ({:?}): {}", reason, message);
            signal.raise(format!("{:?}: {}", reason, message));
        });

        Ok((device, queue))
    }

    fn create_layouts(device: &wgpu::Device) -> (wgpu::BindGroupLayout, wgpu::PipelineLayout) {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Uniform Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout],
            push_constant_ranges: &[],
        });
        (uniform_layout, pipeline_layout)
    }

    fn allocate_id(&mut self) -> NativeHandle {
        let id = self.next_id;
        self.next_id += 1;
        NativeHandle(id)
    }

    fn check_device(&self) -> BackendResult<()> {
        if self.signal.is_raised() {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Run `create` inside an error scope, returning whatever the scope caught
    /// alongside the created object.
    fn scoped<T>(
        &self,
        filter: wgpu::ErrorFilter,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = create(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    /// Create a buffer or texture under both an out-of-memory and a
    /// validation scope. Scopes pop innermost first.
    fn scoped_resource<T>(
        &self,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> BackendResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = self.scoped(wgpu::ErrorFilter::OutOfMemory, create);
        let validation = pollster::block_on(self.device.pop_error_scope());
        match (result, validation) {
            ((_, Some(error)), _) => Err(Self::map_creation_error(error)),
            (_, Some(error)) => Err(Self::map_creation_error(error)),
            ((value, None), None) => Ok(value),
        }
    }

    fn scoped_ok<T>(
        &self,
        filter: wgpu::ErrorFilter,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, wgpu::Error> {
        match self.scoped(filter, create) {
            (_, Some(error)) => Err(error),
            (value, None) => Ok(value),
        }
    }

    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        }
    }

    /// Formats outside the supported set are skipped by the caller.
    fn convert_texture_format_back(format: wgpu::TextureFormat) -> Option<TextureFormat> {
        Some(match format {
            wgpu::TextureFormat::R8Unorm => TextureFormat::R8Unorm,
            wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
            wgpu::TextureFormat::Depth32Float => TextureFormat::Depth32Float,
            wgpu::TextureFormat::Depth24PlusStencil8 => TextureFormat::Depth24PlusStencil8,
            wgpu::TextureFormat::R32Float => TextureFormat::R32Float,
            wgpu::TextureFormat::Rg32Float => TextureFormat::Rg32Float,
            _ => return None,
        })
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::MAP_READ) {
            result |= wgpu::BufferUsages::MAP_READ;
        }
        if usage.contains(BufferUsage::MAP_WRITE) {
            result |= wgpu::BufferUsages::MAP_WRITE;
        }
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
            VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
            VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }

    fn convert_view_dimension(dimension: TextureViewDimension) -> wgpu::TextureViewDimension {
        match dimension {
            TextureViewDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            TextureViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        }
    }

    fn convert_present_mode(mode: PresentMode) -> wgpu::PresentMode {
        match mode {
            PresentMode::Immediate => wgpu::PresentMode::Immediate,
            PresentMode::Mailbox => wgpu::PresentMode::Mailbox,
            PresentMode::Fifo => wgpu::PresentMode::Fifo,
            PresentMode::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
        }
    }

    fn convert_present_mode_back(mode: wgpu::PresentMode) -> Option<PresentMode> {
        match mode {
            wgpu::PresentMode::Immediate => Some(PresentMode::Immediate),
            wgpu::PresentMode::Mailbox => Some(PresentMode::Mailbox),
            wgpu::PresentMode::Fifo => Some(PresentMode::Fifo),
            wgpu::PresentMode::FifoRelaxed => Some(PresentMode::FifoRelaxed),
            _ => None,
        }
    }

    fn map_creation_error(error: wgpu::Error) -> BackendError {
        match error {
            wgpu::Error::OutOfMemory { .. } => BackendError::OutOfMemory,
            other => BackendError::ResourceCreationFailed(other.to_string()),
        }
    }

    fn buffer(&self, id: NativeHandle) -> BackendResult<&wgpu::Buffer> {
        self.buffers
            .get(&id.0)
            .ok_or_else(|| BackendError::InvalidResource(format!("buffer {}", id)))
    }

    /// Make sure every uniform buffer bound in `passes` has a bind group.
    fn prepare_bind_groups(&mut self, passes: &[RecordedPass]) -> BackendResult<()> {
        for pass in passes {
            for command in &pass.commands {
                let RenderCommand::BindUniformBuffer { buffer } = command else {
                    continue;
                };
                if self.bind_groups.contains_key(&buffer.0) {
                    continue;
                }
                let native = self.buffer(*buffer)?;
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Uniform Bind Group"),
                    layout: &self.uniform_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: native.as_entire_binding(),
                    }],
                });
                self.bind_groups.insert(buffer.0, bind_group);
            }
        }
        Ok(())
    }

    fn replay<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        commands: &[RenderCommand],
    ) -> BackendResult<()> {
        for command in commands {
            match *command {
                RenderCommand::SetPipeline(pipeline) => {
                    let native = self.render_pipelines.get(&pipeline.0).ok_or_else(|| {
                        BackendError::InvalidResource(format!("pipeline {}", pipeline))
                    })?;
                    render_pass.set_pipeline(native);
                }
                RenderCommand::SetVertexBuffer {
                    slot,
                    buffer,
                    offset,
                } => {
                    render_pass.set_vertex_buffer(slot, self.buffer(buffer)?.slice(offset..));
                }
                RenderCommand::SetIndexBuffer { buffer, format } => {
                    render_pass.set_index_buffer(
                        self.buffer(buffer)?.slice(..),
                        Self::convert_index_format(format),
                    );
                }
                RenderCommand::BindUniformBuffer { buffer } => {
                    let bind_group = self.bind_groups.get(&buffer.0).ok_or_else(|| {
                        BackendError::InvalidResource(format!("uniform buffer {}", buffer))
                    })?;
                    render_pass.set_bind_group(0, bind_group, &[]);
                }
                RenderCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                } => {
                    render_pass.draw(
                        first_vertex..first_vertex + vertex_count,
                        0..instance_count,
                    );
                }
                RenderCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    base_vertex,
                } => {
                    render_pass.draw_indexed(
                        first_index..first_index + index_count,
                        base_vertex,
                        0..instance_count,
                    );
                }
            }
        }
        Ok(())
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Wgpu
    }

    fn adapter_info(&self) -> AdapterInfo {
        let info = self.adapter.get_info();
        AdapterInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: match info.device_type {
                wgpu::DeviceType::DiscreteGpu => AdapterType::DiscreteGpu,
                wgpu::DeviceType::IntegratedGpu => AdapterType::IntegratedGpu,
                wgpu::DeviceType::VirtualGpu => AdapterType::VirtualGpu,
                wgpu::DeviceType::Cpu => AdapterType::Cpu,
                wgpu::DeviceType::Other => AdapterType::Other,
            },
            driver: info.driver,
            backend: BackendType::Wgpu,
        }
    }

    fn limits(&self) -> DeviceLimits {
        let limits = self.device.limits();
        DeviceLimits {
            max_texture_dimension_2d: limits.max_texture_dimension_2d,
            max_texture_array_layers: limits.max_texture_array_layers,
            max_buffer_size: limits.max_buffer_size,
            max_vertex_attributes: limits.max_vertex_attributes,
            max_vertex_buffer_array_stride: limits.max_vertex_buffer_array_stride,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        }
    }

    fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        // Mapped creation needs a size aligned to COPY_BUFFER_ALIGNMENT.
        let size = descriptor.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self
            .scoped_resource(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: descriptor.label.as_deref(),
                    size,
                    usage: Self::convert_buffer_usage(descriptor.usage),
                    mapped_at_creation: contents.is_some() || descriptor.mapped_at_creation,
                })
            })?;

        if let Some(data) = contents.filter(|data| !data.is_empty()) {
            let padded = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
            buffer.slice(..padded).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
        }
        if contents.is_some() || descriptor.mapped_at_creation {
            buffer.unmap();
        }

        let id = self.allocate_id();
        self.buffers.insert(id.0, buffer);
        Ok(id)
    }

    fn write_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        self.check_device()?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(BackendError::Unsupported(format!(
                "buffer write offset {} is not {}-byte aligned",
                offset,
                wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }
        let native = self.buffer(buffer)?;
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(native, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(
                (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize,
                0,
            );
            self.queue.write_buffer(native, offset, &padded);
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        self.bind_groups.remove(&buffer.0);
        match self.buffers.remove(&buffer.0) {
            Some(native) => native.destroy(),
            None => log::warn!("WgpuBackend: destroy of unknown buffer {}", buffer),
        }
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let texture = self
            .scoped_resource(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: descriptor.label.as_deref(),
                    size: wgpu::Extent3d {
                        width: descriptor.width,
                        height: descriptor.height,
                        depth_or_array_layers: descriptor.depth_or_array_layers,
                    },
                    mip_level_count: descriptor.mip_level_count,
                    sample_count: descriptor.sample_count,
                    dimension: wgpu::TextureDimension::D2,
                    format: Self::convert_texture_format(descriptor.format),
                    usage: Self::convert_texture_usage(descriptor.usage),
                    view_formats: &[],
                })
            })?;

        let id = self.allocate_id();
        self.textures.insert(id.0, texture);
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: NativeHandle,
        region: &TextureRegion,
        data: &[u8],
        layout: &TextureDataLayout,
    ) -> BackendResult<()> {
        self.check_device()?;
        let native = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidResource(format!("texture {}", texture)))?;

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: native,
                mip_level: region.mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: region.array_layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: layout.offset,
                bytes_per_row: Some(layout.bytes_per_row),
                rows_per_image: Some(layout.rows_per_image),
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn create_texture_view(
        &mut self,
        texture: NativeHandle,
        view: &TextureViewInfo,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let native = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidResource(format!("texture {}", texture)))?;

        let texture_view = native.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            format: Some(Self::convert_texture_format(view.format)),
            dimension: Some(Self::convert_view_dimension(view.dimension)),
            aspect: wgpu::TextureAspect::All,
            base_mip_level: view.base_mip_level,
            mip_level_count: Some(view.mip_level_count),
            base_array_layer: view.base_array_layer,
            array_layer_count: Some(view.array_layer_count),
        });

        let id = self.allocate_id();
        self.texture_views.insert(id.0, (texture.0, texture_view));
        Ok(id)
    }

    fn destroy_texture_view(&mut self, view: NativeHandle) {
        if self.texture_views.remove(&view.0).is_none() {
            log::warn!("WgpuBackend: destroy of unknown texture view {}", view);
        }
    }

    fn destroy_texture(&mut self, texture: NativeHandle) {
        self.texture_views.retain(|_, (owner, _)| *owner != texture.0);
        match self.textures.remove(&texture.0) {
            Some(native) => native.destroy(),
            None => log::warn!("WgpuBackend: destroy of unknown texture {}", texture),
        }
    }

    fn create_shader_module(
        &mut self,
        label: Option<&str>,
        source: &str,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        // wgpu hands back an invalid module rather than failing; the error
        // only surfaces as diagnostics here and again at pipeline creation.
        let (module, error) = self.scoped(wgpu::ErrorFilter::Validation, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label,
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            })
        });
        let diagnostics = match error {
            None => Vec::new(),
            Some(error) => {
                let diagnostics = parse_wgsl(source).err().unwrap_or_else(|| {
                    vec![ShaderDiagnostic {
                        message: error.to_string(),
                        line: None,
                        column: None,
                    }]
                });
                log::warn!(
                    "WgpuBackend: shader module {:?} has {} diagnostics",
                    label,
                    diagnostics.len()
                );
                diagnostics
            }
        };

        let id = self.allocate_id();
        self.shader_modules
            .insert(id.0, ShaderEntry { module, diagnostics });
        Ok(id)
    }

    fn shader_diagnostics(&self, module: NativeHandle) -> Option<Vec<ShaderDiagnostic>> {
        self.shader_modules
            .get(&module.0)
            .map(|entry| entry.diagnostics.clone())
    }

    fn destroy_shader_module(&mut self, module: NativeHandle) {
        if self.shader_modules.remove(&module.0).is_none() {
            log::warn!("WgpuBackend: destroy of unknown shader module {}", module);
        }
    }

    fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
        shaders: &PipelineShaders,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let module = |id: NativeHandle| {
            self.shader_modules
                .get(&id.0)
                .map(|entry| &entry.module)
                .ok_or_else(|| BackendError::InvalidResource(format!("shader module {}", id)))
        };
        let vertex_module = module(shaders.vertex)?;
        let fragment_module = module(shaders.fragment)?;

        let attributes: Vec<wgpu::VertexAttribute> = descriptor
            .vertex_layout
            .attributes
            .iter()
            .map(|attr| wgpu::VertexAttribute {
                format: Self::convert_vertex_format(attr.format),
                offset: attr.offset,
                shader_location: attr.location,
            })
            .collect();
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: descriptor.vertex_layout.array_stride,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &attributes,
        }];

        let color_targets = [Some(wgpu::ColorTargetState {
            format: Self::convert_texture_format(descriptor.color_format),
            blend: Some(wgpu::BlendState::REPLACE),
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let multisample = descriptor.multisample.unwrap_or_default();

        let pipeline = self
            .scoped_ok(wgpu::ErrorFilter::Validation, |device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: descriptor.label.as_deref(),
                    layout: Some(&self.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: vertex_module,
                        entry_point: &descriptor.vertex.entry_point,
                        buffers: &vertex_buffers,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: fragment_module,
                        entry_point: &descriptor.fragment.entry_point,
                        targets: &color_targets,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: Self::convert_topology(descriptor.primitive_topology),
                        strip_index_format: None,
                        front_face: match descriptor.front_face {
                            FrontFace::Ccw => wgpu::FrontFace::Ccw,
                            FrontFace::Cw => wgpu::FrontFace::Cw,
                        },
                        cull_mode: match descriptor.cull_mode {
                            CullMode::None => None,
                            CullMode::Front => Some(wgpu::Face::Front),
                            CullMode::Back => Some(wgpu::Face::Back),
                        },
                        unclipped_depth: false,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        conservative: false,
                    },
                    depth_stencil: descriptor.depth_stencil.map(|ds| wgpu::DepthStencilState {
                        format: Self::convert_texture_format(ds.format),
                        depth_write_enabled: ds.depth_write_enabled,
                        depth_compare: Self::convert_compare_function(ds.depth_compare),
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState {
                        count: multisample.count,
                        mask: multisample.mask,
                        alpha_to_coverage_enabled: multisample.alpha_to_coverage_enabled,
                    },
                    multiview: None,
                })
            })
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let id = self.allocate_id();
        self.render_pipelines.insert(id.0, pipeline);
        Ok(id)
    }

    fn destroy_render_pipeline(&mut self, pipeline: NativeHandle) {
        if self.render_pipelines.remove(&pipeline.0).is_none() {
            log::warn!("WgpuBackend: destroy of unknown pipeline {}", pipeline);
        }
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        self.check_device()?;
        let caps = self.surface.get_capabilities(&self.adapter);
        if caps.formats.is_empty() {
            return Err(BackendError::SurfaceLost);
        }
        Ok(SurfaceCapabilities {
            // wgpu expresses image count as frame latency, which it allows
            // between 1 and 2 frames in flight.
            min_image_count: 2,
            max_image_count: 3,
            formats: caps
                .formats
                .into_iter()
                .filter_map(Self::convert_texture_format_back)
                .collect(),
            present_modes: caps
                .present_modes
                .into_iter()
                .filter_map(Self::convert_present_mode_back)
                .collect(),
            current_extent: None,
        })
    }

    fn configure_surface(&mut self, config: &SurfaceConfiguration) -> BackendResult<()> {
        self.check_device()?;
        self.current_frame = None;

        let caps = self.surface.get_capabilities(&self.adapter);
        let max_dim = self.device.limits().max_texture_dimension_2d;
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: Self::convert_texture_format(config.format),
            width: config.width.clamp(1, max_dim),
            height: config.height.clamp(1, max_dim),
            present_mode: Self::convert_present_mode(config.present_mode),
            desired_maximum_frame_latency: config.image_count.saturating_sub(1).clamp(1, 2),
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        self.surface.configure(&self.device, &surface_config);
        log::debug!(
            "WgpuBackend: configured surface {}x{} {:?} {:?}",
            surface_config.width,
            surface_config.height,
            surface_config.format,
            surface_config.present_mode
        );

        self.surface_config = Some(surface_config);
        self.image_count = config.image_count.max(1);
        self.next_image = 0;
        Ok(())
    }

    fn acquire_image(&mut self, _timeout: Duration) -> BackendResult<AcquiredImage> {
        // wgpu applies its own acquire timeout; the requested one is advisory.
        self.check_device()?;
        if self.surface_config.is_none() {
            return Err(BackendError::InvalidResource("surface not configured".into()));
        }
        if self.current_frame.take().is_some() {
            log::warn!("WgpuBackend: dropping a swapchain image that was never presented");
        }

        let texture = self.surface.get_current_texture().map_err(|e| match e {
            wgpu::SurfaceError::Timeout => BackendError::Timeout,
            wgpu::SurfaceError::Outdated => BackendError::SurfaceOutOfDate,
            wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
            wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
            #[allow(unreachable_patterns)]
            other => BackendError::Internal(other.to_string()),
        })?;

        let index = self.next_image % self.image_count;
        self.next_image = self.next_image.wrapping_add(1);
        let suboptimal = texture.suboptimal;
        self.current_frame = Some(AcquiredFrame { index, texture });
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(&mut self, recording: &FrameRecording) -> BackendResult<()> {
        self.check_device()?;
        let empty = [RecordedPass::default()];
        let passes: &[RecordedPass] = if recording.passes.is_empty() {
            &empty
        } else {
            &recording.passes
        };
        self.prepare_bind_groups(passes)?;

        let frame = self
            .current_frame
            .as_ref()
            .ok_or_else(|| BackendError::InvalidResource("no acquired swapchain image".into()))?;
        if frame.index != recording.image_index {
            return Err(BackendError::InvalidResource(format!(
                "recording targets image {} but image {} is acquired",
                recording.image_index, frame.index
            )));
        }
        let target = frame
            .texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let [r, g, b, a] = recording.clear_color;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });
        let mut cleared_depth = HashSet::new();

        for (i, pass) in passes.iter().enumerate() {
            let depth_view = match pass.depth_attachment {
                Some(view) => Some((
                    cleared_depth.insert(view.0),
                    &self
                        .texture_views
                        .get(&view.0)
                        .ok_or_else(|| BackendError::InvalidResource(format!("depth view {}", view)))?
                        .1,
                )),
                None => None,
            };

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Frame Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: if i == 0 {
                            wgpu::LoadOp::Clear(wgpu::Color {
                                r: r as f64,
                                g: g as f64,
                                b: b as f64,
                                a: a as f64,
                            })
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.map(|(first_use, view)| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: if first_use {
                                wgpu::LoadOp::Clear(1.0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            self.replay(&mut render_pass, &pass.commands)?;
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        self.check_device()
    }

    fn present(&mut self, image_index: u32) -> BackendResult<PresentStatus> {
        self.check_device()?;
        let frame = self
            .current_frame
            .take()
            .ok_or_else(|| BackendError::InvalidResource("no acquired swapchain image".into()))?;
        if frame.index != image_index {
            log::warn!(
                "WgpuBackend: presenting image {} but image {} was acquired",
                image_index,
                frame.index
            );
        }
        let suboptimal = frame.texture.suboptimal;
        frame.texture.present();
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Presented
        })
    }

    fn abandon_frame(&mut self, image_index: u32) {
        // Dropping an unpresented SurfaceTexture hands it back to wgpu.
        if let Some(frame) = self.current_frame.take() {
            log::debug!(
                "WgpuBackend: abandoned image {} (requested {})",
                frame.index,
                image_index
            );
        }
    }

    fn release_surface(&mut self) {
        // wgpu keeps the surface configured until it is reconfigured or
        // dropped; forgetting the frame and config is all that is needed.
        self.current_frame = None;
        self.surface_config = None;
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.check_device()?;
        self.device.poll(wgpu::Maintain::Wait);
        self.check_device()
    }

    fn recreate_device(&mut self) -> BackendResult<()> {
        log::info!("WgpuBackend: recreating device");
        self.current_frame = None;
        self.surface_config = None;
        self.bind_groups.clear();
        self.render_pipelines.clear();
        self.shader_modules.clear();
        self.texture_views.clear();
        self.textures.clear();
        self.buffers.clear();

        self.retiring.store(true, Ordering::SeqCst);
        let retiring = Arc::new(AtomicBool::new(false));
        let (device, queue) =
            pollster::block_on(Self::request_device(&self.adapter, &self.signal, &retiring))?;
        let (uniform_layout, pipeline_layout) = Self::create_layouts(&device);

        self.device = device;
        self.queue = queue;
        self.retiring = retiring;
        self.uniform_layout = uniform_layout;
        self.pipeline_layout = pipeline_layout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_target_is_rejected() {
        let result = WgpuBackend::new(&SurfaceTarget::headless(64, 64), DeviceLossSignal::new());
        assert!(matches!(
            result,
            Err(BackendError::SurfaceCreationFailed(_))
        ));
    }

    #[test]
    fn test_texture_format_conversion() {
        for format in [
            TextureFormat::R8Unorm,
            TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float,
        ] {
            let native = WgpuBackend::convert_texture_format(format);
            assert_eq!(WgpuBackend::convert_texture_format_back(native), Some(format));
        }
        assert_eq!(
            WgpuBackend::convert_texture_format_back(wgpu::TextureFormat::Rgb10a2Unorm),
            None
        );
    }

    #[test]
    fn test_usage_conversion() {
        let usage = WgpuBackend::convert_buffer_usage(BufferUsage::VERTEX | BufferUsage::COPY_DST);
        assert_eq!(usage, wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST);

        let usage = WgpuBackend::convert_texture_usage(TextureUsage::RENDER_ATTACHMENT);
        assert_eq!(usage, wgpu::TextureUsages::RENDER_ATTACHMENT);
    }

    #[test]
    fn test_present_mode_conversion() {
        assert_eq!(
            WgpuBackend::convert_present_mode_back(wgpu::PresentMode::AutoVsync),
            None
        );
        assert_eq!(
            WgpuBackend::convert_present_mode_back(WgpuBackend::convert_present_mode(
                PresentMode::Mailbox
            )),
            Some(PresentMode::Mailbox)
        );
    }
}

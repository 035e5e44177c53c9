//! Dummy GPU backend for testing and headless runs.
//!
//! This backend doesn't perform actual GPU operations. It keeps every object
//! it hands out in memory so that tests can check what was released, and it
//! exposes a [`DummyControl`] for injecting the failures real drivers produce:
//! allocation failure, out-of-date surfaces, acquire timeouts and device loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::commands::{FrameRecording, RenderCommand};
use crate::device_loss::DeviceLossSignal;
use crate::pipeline::RenderPipelineDescriptor;
use crate::shader::parse_wgsl;
use crate::types::{
    BufferDescriptor, Extent2d, PresentMode, TextureDataLayout, TextureDescriptor, TextureFormat,
    TextureRegion, TextureViewInfo,
};
use crate::BackendType;

use super::{
    AcquiredImage, AdapterInfo, AdapterType, BackendError, BackendResult, DeviceLimits,
    GpuBackend, NativeHandle, PipelineShaders, PresentStatus, ShaderDiagnostic,
    SurfaceCapabilities, SurfaceConfiguration, SurfaceTarget,
};

enum DummyObject {
    Buffer { data: Vec<u8> },
    Texture { descriptor: TextureDescriptor },
    TextureView { texture: NativeHandle },
    ShaderModule {
        diagnostics: Vec<ShaderDiagnostic>,
        entry_points: Vec<(String, naga::ShaderStage)>,
    },
    Pipeline { uses_depth: bool },
}

#[derive(Default)]
struct Counters {
    sync_primitives_created: AtomicU32,
    surface_configurations: AtomicU32,
    shader_modules_created: AtomicU32,
    pipelines_created: AtomicU32,
    submissions: AtomicU32,
    presents: AtomicU32,
    abandoned_frames: AtomicU32,
    wait_idle_calls: AtomicU32,
    device_generation: AtomicU32,
}

struct Shared {
    signal: DeviceLossSignal,
    objects: Mutex<HashMap<u64, DummyObject>>,
    capabilities: Mutex<SurfaceCapabilities>,
    last_recording: Mutex<Option<FrameRecording>>,
    failing_allocations: AtomicU32,
    surface_out_of_date: AtomicBool,
    next_acquire_suboptimal: AtomicBool,
    next_acquire_times_out: AtomicBool,
    next_submit_fails: AtomicBool,
    image_held: AtomicBool,
    device_lost: AtomicBool,
    fail_device_recreation: AtomicBool,
    counters: Counters,
}

/// Test-side handle onto a [`DummyBackend`]. Cheap to clone and usable after
/// the backend has been boxed.
#[derive(Clone)]
pub struct DummyControl {
    shared: Arc<Shared>,
}

impl DummyControl {
    /// Make the next `count` buffer or texture allocations fail with out of memory.
    pub fn fail_next_allocations(&self, count: u32) {
        self.shared.failing_allocations.store(count, Ordering::SeqCst);
    }

    /// Report the surface as out of date until the next reconfiguration.
    pub fn mark_surface_out_of_date(&self) {
        self.shared.surface_out_of_date.store(true, Ordering::SeqCst);
    }

    /// Flag the next acquired image as suboptimal.
    pub fn mark_next_acquire_suboptimal(&self) {
        self.shared
            .next_acquire_suboptimal
            .store(true, Ordering::SeqCst);
    }

    /// Make the next acquire time out.
    pub fn time_out_next_acquire(&self) {
        self.shared.next_acquire_times_out.store(true, Ordering::SeqCst);
    }

    /// Lose the device the way a driver reset would: every call fails and the
    /// loss signal is raised.
    /// Make the next submission fail with a backend error.
    pub fn fail_next_submit(&self) {
        self.shared.next_submit_fails.store(true, Ordering::SeqCst);
    }

    pub fn simulate_device_loss(&self, reason: &str) {
        self.shared.device_lost.store(true, Ordering::SeqCst);
        self.shared.signal.raise(reason);
    }

    pub fn fail_device_recreation(&self, fail: bool) {
        self.shared
            .fail_device_recreation
            .store(fail, Ordering::SeqCst);
    }

    pub fn set_surface_capabilities(&self, capabilities: SurfaceCapabilities) {
        *self.shared.capabilities.lock() = capabilities;
    }

    /// Native objects currently alive.
    pub fn live_objects(&self) -> usize {
        self.shared.objects.lock().len()
    }

    pub fn buffer_contents(&self, buffer: NativeHandle) -> Option<Vec<u8>> {
        match self.shared.objects.lock().get(&buffer.0) {
            Some(DummyObject::Buffer { data }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Fences and semaphores created so far.
    pub fn sync_primitives_created(&self) -> u32 {
        self.shared
            .counters
            .sync_primitives_created
            .load(Ordering::SeqCst)
    }

    pub fn surface_configurations(&self) -> u32 {
        self.shared
            .counters
            .surface_configurations
            .load(Ordering::SeqCst)
    }

    pub fn shader_modules_created(&self) -> u32 {
        self.shared
            .counters
            .shader_modules_created
            .load(Ordering::SeqCst)
    }

    pub fn pipelines_created(&self) -> u32 {
        self.shared.counters.pipelines_created.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> u32 {
        self.shared.counters.submissions.load(Ordering::SeqCst)
    }

    pub fn presents(&self) -> u32 {
        self.shared.counters.presents.load(Ordering::SeqCst)
    }

    /// Acquired images handed back without a present.
    pub fn abandoned_frames(&self) -> u32 {
        self.shared.counters.abandoned_frames.load(Ordering::SeqCst)
    }

    /// Whether an image is acquired and neither presented nor abandoned.
    pub fn image_held(&self) -> bool {
        self.shared.image_held.load(Ordering::SeqCst)
    }

    pub fn wait_idle_calls(&self) -> u32 {
        self.shared.counters.wait_idle_calls.load(Ordering::SeqCst)
    }

    /// How many times a device has been (re)created.
    pub fn device_generation(&self) -> u32 {
        self.shared.counters.device_generation.load(Ordering::SeqCst)
    }

    pub fn last_recording(&self) -> Option<FrameRecording> {
        self.shared.last_recording.lock().clone()
    }
}

struct DummySwapchain {
    config: SurfaceConfiguration,
    next_image: u32,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    swapchain: Option<DummySwapchain>,
    sync_created: bool,
}

impl DummyBackend {
    /// Create a new dummy backend presenting to `target`.
    pub fn new(target: &SurfaceTarget, signal: DeviceLossSignal) -> Self {
        let (width, height) = target.size();
        let shared = Arc::new(Shared {
            signal,
            objects: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 3,
                formats: vec![
                    TextureFormat::Bgra8UnormSrgb,
                    TextureFormat::Bgra8Unorm,
                    TextureFormat::Rgba8Unorm,
                ],
                present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
                current_extent: Some(Extent2d::new(width, height)),
            }),
            last_recording: Mutex::new(None),
            failing_allocations: AtomicU32::new(0),
            surface_out_of_date: AtomicBool::new(false),
            next_acquire_suboptimal: AtomicBool::new(false),
            next_acquire_times_out: AtomicBool::new(false),
            next_submit_fails: AtomicBool::new(false),
            image_held: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            fail_device_recreation: AtomicBool::new(false),
            counters: Counters::default(),
        });
        shared.counters.device_generation.store(1, Ordering::SeqCst);
        log::trace!("DummyBackend: created for {:?}", target);

        Self {
            shared,
            next_id: AtomicU64::new(1),
            swapchain: None,
            sync_created: false,
        }
    }

    pub fn control(&self) -> DummyControl {
        DummyControl {
            shared: self.shared.clone(),
        }
    }

    fn check_device(&self) -> BackendResult<()> {
        if self.shared.device_lost.load(Ordering::SeqCst) {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn take_allocation_failure(&self) -> bool {
        self.shared
            .failing_allocations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert(&self, object: DummyObject) -> NativeHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.objects.lock().insert(id, object);
        NativeHandle(id)
    }

    fn remove(&self, handle: NativeHandle, what: &str) {
        if self.shared.objects.lock().remove(&handle.0).is_none() {
            log::warn!("DummyBackend: destroying unknown {} {}", what, handle);
        }
    }

    fn check_recording(&self, recording: &FrameRecording) -> BackendResult<()> {
        let objects = self.shared.objects.lock();
        for pass in &recording.passes {
            if let Some(depth) = pass.depth_attachment {
                if !matches!(objects.get(&depth.0), Some(DummyObject::TextureView { .. })) {
                    return Err(BackendError::InvalidResource(format!("depth view {}", depth)));
                }
            }
            for command in &pass.commands {
                let (handle, ok) = match command {
                    RenderCommand::SetPipeline(p) => match objects.get(&p.0) {
                        Some(DummyObject::Pipeline { uses_depth }) => {
                            if *uses_depth != pass.depth_attachment.is_some() {
                                return Err(BackendError::Internal(format!(
                                    "{} depth state does not match its pass",
                                    p
                                )));
                            }
                            (*p, true)
                        }
                        _ => (*p, false),
                    },
                    RenderCommand::SetVertexBuffer { buffer, .. }
                    | RenderCommand::SetIndexBuffer { buffer, .. }
                    | RenderCommand::BindUniformBuffer { buffer } => (
                        *buffer,
                        matches!(objects.get(&buffer.0), Some(DummyObject::Buffer { .. })),
                    ),
                    RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. } => continue,
                };
                if !ok {
                    return Err(BackendError::InvalidResource(format!(
                        "{} referenced by {:?}",
                        handle, command
                    )));
                }
            }
        }
        Ok(())
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Dummy
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "Dummy Adapter".to_string(),
            vendor: 0,
            device: 0,
            device_type: AdapterType::Cpu,
            driver: "none".to_string(),
            backend: BackendType::Dummy,
        }
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        if self.take_allocation_failure() {
            log::trace!("DummyBackend: injected allocation failure for {:?}", descriptor.label);
            return Err(BackendError::OutOfMemory);
        }
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );

        let mut data = vec![0u8; descriptor.size as usize];
        if let Some(contents) = contents {
            let len = contents.len().min(data.len());
            data[..len].copy_from_slice(&contents[..len]);
        }
        Ok(self.insert(DummyObject::Buffer { data }))
    }

    fn write_buffer(&mut self, buffer: NativeHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.check_device()?;
        log::trace!(
            "DummyBackend: write_buffer {} offset={} len={}",
            buffer,
            offset,
            data.len()
        );
        let mut objects = self.shared.objects.lock();
        match objects.get_mut(&buffer.0) {
            Some(DummyObject::Buffer { data: storage }) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > storage.len() {
                    return Err(BackendError::Internal(format!(
                        "write of {} bytes at {} overruns {}",
                        data.len(),
                        offset,
                        buffer
                    )));
                }
                storage[start..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(BackendError::InvalidResource(buffer.to_string())),
        }
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        self.remove(buffer, "buffer");
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> BackendResult<NativeHandle> {
        self.check_device()?;
        if self.take_allocation_failure() {
            return Err(BackendError::OutOfMemory);
        }
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.depth_or_array_layers
        );
        Ok(self.insert(DummyObject::Texture {
            descriptor: descriptor.clone(),
        }))
    }

    fn write_texture(
        &mut self,
        texture: NativeHandle,
        region: &TextureRegion,
        data: &[u8],
        layout: &TextureDataLayout,
    ) -> BackendResult<()> {
        self.check_device()?;
        log::trace!(
            "DummyBackend: write_texture {} ({}x{}) len={} bytes_per_row={}",
            texture,
            region.width,
            region.height,
            data.len(),
            layout.bytes_per_row
        );
        match self.shared.objects.lock().get(&texture.0) {
            Some(DummyObject::Texture { descriptor }) => {
                if region.width > descriptor.width
                    || region.height > descriptor.height
                    || region.array_layer >= descriptor.depth_or_array_layers
                {
                    return Err(BackendError::Internal(format!(
                        "upload region exceeds {}",
                        texture
                    )));
                }
                Ok(())
            }
            _ => Err(BackendError::InvalidResource(texture.to_string())),
        }
    }

    fn create_texture_view(
        &mut self,
        texture: NativeHandle,
        view: &TextureViewInfo,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let known = matches!(
            self.shared.objects.lock().get(&texture.0),
            Some(DummyObject::Texture { .. })
        );
        if !known {
            return Err(BackendError::InvalidResource(texture.to_string()));
        }
        log::trace!("DummyBackend: creating {:?} view of {}", view.dimension, texture);
        Ok(self.insert(DummyObject::TextureView { texture }))
    }

    fn destroy_texture_view(&mut self, view: NativeHandle) {
        self.remove(view, "texture view");
    }

    fn destroy_texture(&mut self, texture: NativeHandle) {
        // Views die with their texture.
        self.shared.objects.lock().retain(
            |_, object| !matches!(object, DummyObject::TextureView { texture: t } if *t == texture),
        );
        self.remove(texture, "texture");
    }

    fn create_shader_module(
        &mut self,
        label: Option<&str>,
        source: &str,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let (diagnostics, entry_points) = match parse_wgsl(source) {
            Ok(parsed) => (
                Vec::new(),
                parsed
                    .module
                    .entry_points
                    .iter()
                    .map(|ep| (ep.name.clone(), ep.stage))
                    .collect(),
            ),
            Err(diagnostics) => (diagnostics, Vec::new()),
        };
        log::trace!(
            "DummyBackend: creating shader module {:?} ({} diagnostics)",
            label,
            diagnostics.len()
        );
        self.shared
            .counters
            .shader_modules_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(DummyObject::ShaderModule {
            diagnostics,
            entry_points,
        }))
    }

    fn shader_diagnostics(&self, module: NativeHandle) -> Option<Vec<ShaderDiagnostic>> {
        match self.shared.objects.lock().get(&module.0) {
            Some(DummyObject::ShaderModule { diagnostics, .. }) => Some(diagnostics.clone()),
            _ => None,
        }
    }

    fn destroy_shader_module(&mut self, module: NativeHandle) {
        self.remove(module, "shader module");
    }

    fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
        shaders: &PipelineShaders,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        {
            let objects = self.shared.objects.lock();
            let stages = [
                (shaders.vertex, &descriptor.vertex.entry_point, naga::ShaderStage::Vertex),
                (
                    shaders.fragment,
                    &descriptor.fragment.entry_point,
                    naga::ShaderStage::Fragment,
                ),
            ];
            for (module, entry_point, stage) in stages {
                match objects.get(&module.0) {
                    Some(DummyObject::ShaderModule {
                        diagnostics,
                        entry_points,
                    }) => {
                        if let Some(first) = diagnostics.first() {
                            return Err(BackendError::PipelineCreationFailed(format!(
                                "{:?}: {}",
                                descriptor.label, first
                            )));
                        }
                        if !entry_points
                            .iter()
                            .any(|(name, s)| name == entry_point && *s == stage)
                        {
                            return Err(BackendError::PipelineCreationFailed(format!(
                                "entry point '{}' not found for stage {:?}",
                                entry_point, stage
                            )));
                        }
                    }
                    _ => return Err(BackendError::InvalidResource(module.to_string())),
                }
            }
        }

        log::trace!("DummyBackend: creating render pipeline {:?}", descriptor.label);
        self.shared
            .counters
            .pipelines_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(DummyObject::Pipeline {
            uses_depth: descriptor.depth_stencil.is_some(),
        }))
    }

    fn destroy_render_pipeline(&mut self, pipeline: NativeHandle) {
        self.remove(pipeline, "pipeline");
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        self.check_device()?;
        Ok(self.shared.capabilities.lock().clone())
    }

    fn configure_surface(&mut self, config: &SurfaceConfiguration) -> BackendResult<()> {
        self.check_device()?;
        if !self.sync_created {
            // Two semaphores and one fence, once per device.
            self.shared
                .counters
                .sync_primitives_created
                .fetch_add(3, Ordering::SeqCst);
            self.sync_created = true;
        }
        self.shared
            .counters
            .surface_configurations
            .fetch_add(1, Ordering::SeqCst);
        self.shared.surface_out_of_date.store(false, Ordering::SeqCst);
        self.shared.image_held.store(false, Ordering::SeqCst);
        self.shared.capabilities.lock().current_extent =
            Some(Extent2d::new(config.width, config.height));
        log::trace!(
            "DummyBackend: configured surface {}x{} {:?} {:?} x{}",
            config.width,
            config.height,
            config.format,
            config.present_mode,
            config.image_count
        );
        self.swapchain = Some(DummySwapchain {
            config: *config,
            next_image: 0,
        });
        Ok(())
    }

    fn acquire_image(&mut self, timeout: Duration) -> BackendResult<AcquiredImage> {
        self.check_device()?;
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| BackendError::InvalidResource("surface not configured".into()))?;
        if self.shared.surface_out_of_date.load(Ordering::SeqCst) {
            return Err(BackendError::SurfaceOutOfDate);
        }
        if self.shared.next_acquire_times_out.swap(false, Ordering::SeqCst) {
            log::trace!("DummyBackend: acquire timed out after {:?}", timeout);
            return Err(BackendError::Timeout);
        }

        if self.shared.image_held.load(Ordering::SeqCst) {
            return Err(BackendError::InvalidResource(
                "previous image was neither presented nor abandoned".into(),
            ));
        }

        let index = swapchain.next_image % swapchain.config.image_count.max(1);
        swapchain.next_image = swapchain.next_image.wrapping_add(1);
        let suboptimal = self
            .shared
            .next_acquire_suboptimal
            .swap(false, Ordering::SeqCst);
        self.shared.image_held.store(true, Ordering::SeqCst);
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(&mut self, recording: &FrameRecording) -> BackendResult<()> {
        self.check_device()?;
        self.check_recording(recording)?;
        if self.shared.next_submit_fails.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Internal("injected submit failure".into()));
        }
        log::trace!(
            "DummyBackend: submitting {} passes ({} draws) for image {}",
            recording.passes.len(),
            recording.draw_count(),
            recording.image_index
        );
        self.shared.counters.submissions.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_recording.lock() = Some(recording.clone());
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> BackendResult<PresentStatus> {
        self.check_device()?;
        if self.swapchain.is_none() {
            return Err(BackendError::InvalidResource("surface not configured".into()));
        }
        self.shared.image_held.store(false, Ordering::SeqCst);
        if self.shared.surface_out_of_date.load(Ordering::SeqCst) {
            return Ok(PresentStatus::OutOfDate);
        }
        log::trace!("DummyBackend: presenting image {}", image_index);
        self.shared.counters.presents.fetch_add(1, Ordering::SeqCst);
        Ok(PresentStatus::Presented)
    }

    fn abandon_frame(&mut self, image_index: u32) {
        if self.shared.image_held.swap(false, Ordering::SeqCst) {
            log::trace!("DummyBackend: abandoned image {}", image_index);
            self.shared
                .counters
                .abandoned_frames
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn release_surface(&mut self) {
        self.swapchain = None;
        self.shared.image_held.store(false, Ordering::SeqCst);
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.check_device()?;
        self.shared
            .counters
            .wait_idle_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recreate_device(&mut self) -> BackendResult<()> {
        if self.shared.fail_device_recreation.load(Ordering::SeqCst) {
            return Err(BackendError::DeviceCreationFailed(
                "injected device creation failure".into(),
            ));
        }
        let released = {
            let mut objects = self.shared.objects.lock();
            let count = objects.len();
            objects.clear();
            count
        };
        self.swapchain = None;
        self.shared.image_held.store(false, Ordering::SeqCst);
        self.sync_created = false;
        self.shared.device_lost.store(false, Ordering::SeqCst);
        self.shared
            .counters
            .device_generation
            .fetch_add(1, Ordering::SeqCst);
        log::trace!("DummyBackend: recreated device, dropped {} objects", released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;

    fn backend() -> DummyBackend {
        DummyBackend::new(&SurfaceTarget::headless(800, 600), DeviceLossSignal::new())
    }

    #[test]
    fn test_buffer_contents() {
        let mut backend = backend();
        let control = backend.control();
        let desc = BufferDescriptor::new(16, BufferUsage::UNIFORM | BufferUsage::COPY_DST);

        let buffer = backend.create_buffer(&desc, Some(&[1, 2, 3, 4])).unwrap();
        backend.write_buffer(buffer, 8, &[9, 9]).unwrap();
        let contents = control.buffer_contents(buffer).unwrap();
        assert_eq!(&contents[..4], &[1, 2, 3, 4]);
        assert_eq!(&contents[8..10], &[9, 9]);

        backend.destroy_buffer(buffer);
        assert_eq!(control.live_objects(), 0);
    }

    #[test]
    fn test_injected_allocation_failure() {
        let mut backend = backend();
        backend.control().fail_next_allocations(1);
        let desc = BufferDescriptor::new(64, BufferUsage::VERTEX);
        assert_eq!(backend.create_buffer(&desc, None), Err(BackendError::OutOfMemory));
        assert!(backend.create_buffer(&desc, None).is_ok());
    }

    #[test]
    fn test_sync_primitives_created_once() {
        let mut backend = backend();
        let control = backend.control();
        let config = SurfaceConfiguration {
            width: 800,
            height: 600,
            format: TextureFormat::Bgra8Unorm,
            present_mode: PresentMode::Fifo,
            image_count: 3,
        };
        backend.configure_surface(&config).unwrap();
        backend.configure_surface(&config).unwrap();
        assert_eq!(control.sync_primitives_created(), 3);
        assert_eq!(control.surface_configurations(), 2);
    }

    #[test]
    fn test_acquire_cycles_images() {
        let mut backend = backend();
        backend
            .configure_surface(&SurfaceConfiguration {
                width: 8,
                height: 8,
                format: TextureFormat::Bgra8Unorm,
                present_mode: PresentMode::Fifo,
                image_count: 2,
            })
            .unwrap();
        let timeout = Duration::from_millis(10);
        let indices: Vec<u32> = (0..4)
            .map(|_| {
                let index = backend.acquire_image(timeout).unwrap().index;
                backend.present(index).unwrap();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_held_image_blocks_acquire_until_abandoned() {
        let mut backend = backend();
        let control = backend.control();
        backend
            .configure_surface(&SurfaceConfiguration {
                width: 8,
                height: 8,
                format: TextureFormat::Bgra8Unorm,
                present_mode: PresentMode::Fifo,
                image_count: 2,
            })
            .unwrap();
        let timeout = Duration::from_millis(10);

        let image = backend.acquire_image(timeout).unwrap();
        assert!(control.image_held());
        assert!(matches!(
            backend.acquire_image(timeout),
            Err(BackendError::InvalidResource(_))
        ));

        backend.abandon_frame(image.index);
        assert!(!control.image_held());
        assert_eq!(control.abandoned_frames(), 1);
        // Nothing held, nothing to abandon.
        backend.abandon_frame(image.index);
        assert_eq!(control.abandoned_frames(), 1);

        assert!(backend.acquire_image(timeout).is_ok());
    }

    #[test]
    fn test_simulated_device_loss() {
        let signal = DeviceLossSignal::new();
        let mut backend = DummyBackend::new(&SurfaceTarget::headless(8, 8), signal.clone());
        let control = backend.control();
        let desc = BufferDescriptor::new(64, BufferUsage::VERTEX);
        backend.create_buffer(&desc, None).unwrap();

        control.simulate_device_loss("reset");
        assert!(signal.is_raised());
        assert_eq!(backend.create_buffer(&desc, None), Err(BackendError::DeviceLost));

        backend.recreate_device().unwrap();
        assert_eq!(control.live_objects(), 0);
        assert_eq!(control.device_generation(), 2);
        assert!(backend.create_buffer(&desc, None).is_ok());
    }
}

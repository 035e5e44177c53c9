//! The renderer façade.
//!
//! [`Renderer`] owns the device, the resource managers, presentation and the
//! per-frame staging (culling, batching, statistics), and drives one frame
//! per [`Renderer::render`] call:
//!
//! 1. fold any reported device loss into the recovery state,
//! 2. recreate an out-of-date swapchain,
//! 3. cull and batch the scene,
//! 4. record draws against cached pipelines and buffers,
//! 5. acquire an image,
//! 6. submit and present.
//!
//! Everything that can fail on bad scene data happens before the acquire, so
//! an acquired image is always either presented or handed back.

use std::collections::HashMap;

use glam::Mat4;

use crate::backend::{AdapterInfo, GpuBackend, ShaderDiagnostic, SurfaceTarget};
use crate::batching::{BatchingStats, DrawCallBatcher};
use crate::buffer::{BufferInfo, BufferManager, MIN_UNIFORM_BUFFER_SIZE};
use crate::commands::FrameRecorder;
use crate::config::RendererConfig;
use crate::culling::{CullStats, FrustumCuller};
use crate::device::GpuDevice;
use crate::device_loss::DeviceState;
use crate::error::{RenderError, RenderResult};
use crate::handle::{BufferHandle, PipelineHandle, ShaderModuleHandle, TextureHandle, TextureViewHandle};
use crate::pipeline::{PipelineManager, RenderPipelineDescriptor};
use crate::presentation::{PresentationManager, SwapchainState};
use crate::resource_pool::{CacheStats, ResourcePool};
use crate::scene::{Camera, Drawable, Geometry, GeometryId, ObjectId, SceneSource};
use crate::shader::{ShaderModuleDescriptor, ShaderModuleManager};
use crate::stats::{RenderStats, RenderStatsTracker};
use crate::texture::{TextureInfo, TextureManager};
use crate::types::{
    Extent2d, IndexFormat, TextureDescriptor, TextureFormat, TextureRegion, TextureUsage,
    TextureViewDescriptor,
};
use crate::BackendType;

/// GPU buffers for one geometry.
#[derive(Debug, Clone, Copy)]
struct GpuMesh {
    vertex_buffer: BufferHandle,
    index_buffer: Option<BufferHandle>,
    vertex_count: u32,
    index_count: u32,
    triangles: u64,
}

/// Depth attachment matching the swapchain extent.
#[derive(Debug, Clone, Copy)]
struct DepthTarget {
    texture: TextureHandle,
    view: TextureViewHandle,
    size_bytes: u64,
}

pub struct Renderer {
    config: RendererConfig,
    device: GpuDevice,
    pool: ResourcePool,
    buffers: BufferManager,
    textures: TextureManager,
    shaders: ShaderModuleManager,
    pipelines: PipelineManager,
    presentation: PresentationManager,
    culler: FrustumCuller,
    batcher: DrawCallBatcher,
    stats: RenderStatsTracker,
    meshes: HashMap<GeometryId, GpuMesh>,
    object_uniforms: HashMap<ObjectId, BufferHandle>,
    depth: Option<DepthTarget>,
    surface_size: Extent2d,
    initialized: bool,
    resources_dropped: bool,
}

impl Renderer {
    /// A renderer that negotiates its backend in [`initialize`](Self::initialize).
    pub fn new(config: RendererConfig) -> Self {
        Self::with_device(config, GpuDevice::new())
    }

    /// Use `backend` instead of negotiating one.
    ///
    /// Losses the backend raises itself are only observed if it was built
    /// with a [`GpuDevice::loss_signal`]; prefer [`with_device`](Self::with_device)
    /// for that.
    pub fn with_backend(config: RendererConfig, backend: Box<dyn GpuBackend>) -> Self {
        Self::with_device(config, GpuDevice::with_backend(backend))
    }

    /// Use an already prepared device.
    pub fn with_device(config: RendererConfig, device: GpuDevice) -> Self {
        Self {
            presentation: PresentationManager::new(config.presentation_config()),
            stats: RenderStatsTracker::with_window(config.stats_window),
            config,
            device,
            pool: ResourcePool::new(),
            buffers: BufferManager::new(),
            textures: TextureManager::new(),
            shaders: ShaderModuleManager::new(),
            pipelines: PipelineManager::new(),
            culler: FrustumCuller::new(),
            batcher: DrawCallBatcher::new(),
            meshes: HashMap::new(),
            object_uniforms: HashMap::new(),
            depth: None,
            surface_size: Extent2d::default(),
            initialized: false,
            resources_dropped: false,
        }
    }

    /// Bring up the device (unless one was supplied) and the swapchain.
    pub fn initialize(&mut self, surface: SurfaceTarget) -> RenderResult<()> {
        if self.initialized {
            return Err(RenderError::InvalidState("renderer already initialized".into()));
        }
        self.config.validate()?;

        let (width, height) = surface.size();
        if !self.device.is_initialized() {
            self.device = GpuDevice::create(
                self.config.backend,
                &surface,
                self.config.allow_backend_fallback,
            )?;
        }
        if let Some(info) = self.device.adapter_info() {
            log::info!(
                "Renderer using {:?} backend on {} ({:?})",
                info.backend,
                info.name,
                info.device_type
            );
        }

        self.surface_size = Extent2d::new(width, height);
        self.presentation.create(&mut self.device, width, height)?;
        self.create_depth_target()?;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Draw one frame of `scene` as seen by `camera`.
    pub fn render(&mut self, scene: &dyn SceneSource, camera: &Camera) -> RenderResult<()> {
        self.ensure_initialized()?;

        if self.sync_loss() != DeviceState::Active {
            let recovery = &self.config.recovery;
            if !recovery.auto_recover
                || self.device.recovery().failed_attempts() >= recovery.max_attempts
            {
                return Err(RenderError::DeviceLost);
            }
            if let Err(err) = self.restore_context() {
                log::warn!("Automatic device recovery failed: {}", err);
                return Err(RenderError::DeviceLost);
            }
        }

        self.ensure_presentation()?;
        if self.presentation.needs_recreation() {
            if self.config.auto_recreate_swapchain {
                self.recreate_surface()?;
            } else if self.presentation.state() == SwapchainState::OutOfDate {
                return Err(RenderError::SwapchainOutOfDate);
            }
        }

        self.stats.frame_start();
        let recorder = self.record_frame(scene, camera)?;
        let image = self.presentation.acquire_next_image(&mut self.device)?;

        let recording = recorder.finish(image.index());
        let submitted = match self.device.backend_mut() {
            Ok(backend) => backend.submit(&recording).map_err(RenderError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = submitted {
            self.presentation.abandon_image(&mut self.device, image);
            return Err(err);
        }
        self.presentation.present_image(&mut self.device, image)?;
        self.stats.frame_end();

        log::trace!(
            "Frame {}: {} draw calls, {} culled",
            self.stats.stats().frame,
            self.stats.stats().draw_calls,
            self.culler.stats().culled
        );
        Ok(())
    }

    /// Record the new surface size and rebuild the swapchain for it.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidArgument(format!(
                "cannot resize to {}x{}",
                width, height
            )));
        }
        self.ensure_initialized()?;
        self.surface_size = Extent2d::new(width, height);
        self.recreate_surface()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats.stats()
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn stats_summary(&self) -> String {
        self.stats.summary()
    }

    pub fn cull_stats(&self) -> CullStats {
        self.culler.stats()
    }

    pub fn batching_stats(&self) -> BatchingStats {
        self.batcher.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.pool.stats()
    }

    /// Release every resource and the device. The renderer can be
    /// initialized again afterwards.
    pub fn dispose(&mut self) -> RenderResult<()> {
        if !self.initialized {
            return Ok(());
        }
        self.sync_loss();

        if self.device.recovery().is_active() {
            self.pipelines.dispose_all(&mut self.device, &mut self.pool)?;
            self.shaders.dispose_all(&mut self.device)?;
            self.textures.dispose_all(&mut self.device)?;
            self.buffers.dispose_all(&mut self.device)?;
            self.presentation.release(&mut self.device);
        } else {
            self.drop_device_resources();
        }

        self.meshes.clear();
        self.object_uniforms.clear();
        self.depth = None;
        self.pool.clear();
        self.stats.clear_resources();
        self.device.shutdown();
        self.initialized = false;
        log::info!("Renderer disposed");
        Ok(())
    }

    /// Simulate losing the device. Every handle becomes invalid.
    pub fn force_context_loss(&mut self) {
        self.device.force_loss("context loss forced by caller");
        self.drop_device_resources();
    }

    /// Whether the device is lost or a loss has been reported but not yet
    /// observed.
    pub fn is_context_lost(&self) -> bool {
        self.device.is_lost() || self.device.loss_signal().is_raised()
    }

    /// Negotiate a new device if it was lost, then rebuild whatever part of
    /// the swapchain and depth target is missing. Safe to call again after a
    /// partial failure.
    pub fn restore_context(&mut self) -> RenderResult<()> {
        self.ensure_initialized()?;
        if self.sync_loss() != DeviceState::Active {
            self.device.recover()?;
            self.resources_dropped = false;
        }
        self.ensure_presentation()
    }

    pub fn on_context_lost(&mut self, callback: impl FnMut(&str) + Send + 'static) {
        self.device.recovery_mut().subscribe_lost(Box::new(callback));
    }

    pub fn on_context_restored(&mut self, callback: impl FnMut() + Send + 'static) {
        self.device.recovery_mut().subscribe_restored(Box::new(callback));
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    pub fn presentation(&self) -> &PresentationManager {
        &self.presentation
    }

    pub fn backend_type(&self) -> Option<BackendType> {
        self.device.backend_type()
    }

    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        self.device.adapter_info()
    }

    pub fn set_vsync(&mut self, vsync: bool) -> RenderResult<()> {
        self.config.vsync = vsync;
        self.presentation.set_vsync(vsync);
        if self.initialized && self.device.recovery().is_active() {
            self.recreate_surface()?;
        }
        Ok(())
    }

    // Buffers

    pub fn create_vertex_buffer(&mut self, data: &[f32]) -> RenderResult<BufferHandle> {
        let handle = self.buffers.create_vertex_buffer(&mut self.device, data)?;
        self.record_buffer(handle);
        Ok(handle)
    }

    pub fn create_index_buffer(&mut self, data: &[u32]) -> RenderResult<BufferHandle> {
        let handle = self.buffers.create_index_buffer(&mut self.device, data)?;
        self.record_buffer(handle);
        Ok(handle)
    }

    pub fn create_uniform_buffer(&mut self, size: u64) -> RenderResult<BufferHandle> {
        let handle = self.buffers.create_uniform_buffer(&mut self.device, size)?;
        self.record_buffer(handle);
        Ok(handle)
    }

    pub fn update_uniform_buffer(
        &mut self,
        handle: BufferHandle,
        data: &[u8],
        offset: u64,
    ) -> RenderResult<()> {
        self.buffers
            .update_uniform_buffer(&mut self.device, handle, data, offset)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> RenderResult<()> {
        let size = self.buffers.buffer_info(handle).map(|info| info.size).unwrap_or(0);
        self.buffers.destroy_buffer(&mut self.device, handle)?;
        self.stats.record_buffer_deallocated(size);
        Ok(())
    }

    pub fn buffer_info(&self, handle: BufferHandle) -> RenderResult<&BufferInfo> {
        self.buffers.buffer_info(handle)
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    // Textures

    pub fn create_texture(&mut self, descriptor: &TextureDescriptor) -> RenderResult<TextureHandle> {
        let handle = self.textures.create_texture(&mut self.device, descriptor)?;
        self.stats.record_texture_created(descriptor.size_in_bytes());
        Ok(handle)
    }

    pub fn upload_texture(
        &mut self,
        handle: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        self.textures
            .upload(&mut self.device, handle, data, width, height)
    }

    pub fn upload_texture_region(
        &mut self,
        handle: TextureHandle,
        data: &[u8],
        region: TextureRegion,
    ) -> RenderResult<()> {
        self.textures
            .upload_region(&mut self.device, handle, data, region)
    }

    pub fn create_texture_view(
        &mut self,
        handle: TextureHandle,
        descriptor: Option<&TextureViewDescriptor>,
    ) -> RenderResult<TextureViewHandle> {
        self.textures.create_view(&mut self.device, handle, descriptor)
    }

    pub fn destroy_texture_view(&mut self, view: TextureViewHandle) -> RenderResult<()> {
        self.textures.dispose_view(&mut self.device, view)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) -> RenderResult<()> {
        let size = self
            .textures
            .texture_info(handle)
            .map(|info| info.size_bytes)
            .unwrap_or(0);
        self.textures.dispose(&mut self.device, handle)?;
        self.stats.record_texture_disposed(size);
        Ok(())
    }

    pub fn texture_info(&self, handle: TextureHandle) -> RenderResult<TextureInfo> {
        self.textures.texture_info(handle)
    }

    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    // Shaders and pipelines

    pub fn compile_shader(
        &mut self,
        descriptor: &ShaderModuleDescriptor,
    ) -> RenderResult<ShaderModuleHandle> {
        let handle = self.shaders.compile(&mut self.device, descriptor)?;
        self.stats.record_shader_created();
        Ok(handle)
    }

    pub fn validate_shader(&mut self, code: &str) -> bool {
        self.shaders.validate(&mut self.device, code)
    }

    pub fn shader_diagnostics(&self, handle: ShaderModuleHandle) -> Option<Vec<ShaderDiagnostic>> {
        self.shaders.diagnostics(&self.device, handle)
    }

    pub fn destroy_shader(&mut self, handle: ShaderModuleHandle) -> RenderResult<()> {
        self.shaders.dispose(&mut self.device, handle)?;
        self.stats.record_shader_disposed();
        Ok(())
    }

    /// Shader modules the pipeline needs are compiled (once per source) and
    /// counted in [`stats`](Self::stats) alongside standalone ones.
    pub fn create_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
    ) -> RenderResult<PipelineHandle> {
        let modules_before = self.pipelines.shader_module_count();
        let result = self
            .pipelines
            .create_pipeline(&mut self.device, &mut self.pool, descriptor);
        for _ in modules_before..self.pipelines.shader_module_count() {
            self.stats.record_shader_created();
        }
        result
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle) -> RenderResult<()> {
        self.pipelines
            .dispose(&mut self.device, &mut self.pool, handle)
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }

    /// Release the GPU buffers cached for a geometry that left the scene.
    pub fn release_geometry(&mut self, id: GeometryId) -> RenderResult<()> {
        if let Some(mesh) = self.meshes.remove(&id) {
            self.destroy_buffer(mesh.vertex_buffer)?;
            if let Some(index) = mesh.index_buffer {
                self.destroy_buffer(index)?;
            }
            self.stats.record_geometry_disposed();
        }
        Ok(())
    }

    /// Release the uniform buffer cached for an object that left the scene.
    pub fn release_object(&mut self, id: ObjectId) -> RenderResult<()> {
        match self.object_uniforms.remove(&id) {
            Some(buffer) => self.destroy_buffer(buffer),
            None => Ok(()),
        }
    }

    fn ensure_initialized(&self) -> RenderResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(RenderError::InvalidState("renderer is not initialized".into()))
        }
    }

    /// Poll for loss and drop device-owned state the first time it is seen.
    fn sync_loss(&mut self) -> DeviceState {
        let state = self.device.poll_loss();
        if state != DeviceState::Active {
            self.drop_device_resources();
        }
        state
    }

    fn drop_device_resources(&mut self) {
        if self.resources_dropped {
            return;
        }
        let buffers = self.buffers.invalidate_all();
        let textures = self.textures.invalidate_all();
        let shaders = self.shaders.invalidate_all();
        let pipelines = self.pipelines.invalidate_all();
        self.pool.clear();
        self.presentation.invalidate();
        self.meshes.clear();
        self.object_uniforms.clear();
        self.depth = None;
        self.stats.clear_resources();
        self.resources_dropped = true;
        log::info!(
            "Invalidated {} buffers, {} textures, {} shaders and {} pipelines after device loss",
            buffers,
            textures,
            shaders,
            pipelines
        );
    }

    fn ensure_presentation(&mut self) -> RenderResult<()> {
        if self.presentation.state() == SwapchainState::Uninitialized {
            let Extent2d { width, height } = self.surface_size;
            self.presentation.create(&mut self.device, width, height)?;
        }
        if self.depth.is_none() {
            self.create_depth_target()?;
        }
        Ok(())
    }

    fn recreate_surface(&mut self) -> RenderResult<()> {
        let Extent2d { width, height } = self.surface_size;
        self.presentation
            .recreate_swapchain(&mut self.device, width, height)?;
        self.create_depth_target()
    }

    fn create_depth_target(&mut self) -> RenderResult<()> {
        if let Some(old) = self.depth.take() {
            self.textures.dispose(&mut self.device, old.texture)?;
            self.stats.record_texture_disposed(old.size_bytes);
        }
        let Extent2d { width, height } = self.presentation.extent();
        let descriptor = TextureDescriptor::new_2d(width, height, TextureFormat::Depth32Float)
            .with_label("depth")
            .with_usage(TextureUsage::RENDER_ATTACHMENT);
        let texture = self.textures.create_texture(&mut self.device, &descriptor)?;
        let view = self.textures.create_view(&mut self.device, texture, None)?;
        let size_bytes = descriptor.size_in_bytes();
        self.stats.record_texture_created(size_bytes);
        self.depth = Some(DepthTarget {
            texture,
            view,
            size_bytes,
        });
        Ok(())
    }

    fn record_buffer(&mut self, handle: BufferHandle) {
        if let Ok(info) = self.buffers.buffer_info(handle) {
            self.stats.record_buffer_allocated(info.size);
        }
    }

    /// Upload what the visible objects need and record their draws.
    fn record_frame(
        &mut self,
        scene: &dyn SceneSource,
        camera: &Camera,
    ) -> RenderResult<FrameRecorder> {
        let format = self
            .presentation
            .format()
            .ok_or_else(|| RenderError::InvalidState("swapchain has no format".into()))?;

        let groups = self.visible_groups(scene, camera);
        let depth_view = match self.depth {
            Some(depth) => Some(self.textures.native_view(depth.view)?),
            None => None,
        };
        let mut recorder = FrameRecorder::new(self.config.clear_color, depth_view);
        let view_projection = camera.view_projection();

        for group in &groups {
            let Some(first) = group.first() else {
                continue;
            };
            let descriptor = first.material.pipeline_descriptor(format);
            let pipeline = self.create_pipeline(&descriptor)?;
            self.pipelines.bind(pipeline, &mut recorder)?;
            for drawable in group {
                self.record_drawable(&mut recorder, drawable, view_projection)?;
            }
        }

        Ok(recorder)
    }

    /// Cull, then group into pipeline-compatible runs.
    fn visible_groups(&mut self, scene: &dyn SceneSource, camera: &Camera) -> Vec<Vec<Drawable>> {
        let mut visible = Vec::new();
        if self.config.frustum_culling {
            self.culler
                .cull_scene(scene, camera, &mut |drawable| visible.push(drawable.clone()));
        } else {
            scene.traverse(&mut |drawable| {
                if drawable.visible {
                    visible.push(drawable.clone());
                }
            });
        }

        self.batcher.clear();
        if !self.config.batching {
            return visible.into_iter().map(|drawable| vec![drawable]).collect();
        }
        for drawable in visible {
            self.batcher.add(drawable);
        }
        self.batcher
            .batches()
            .iter()
            .map(|batch| batch.items.clone())
            .collect()
    }

    fn record_drawable(
        &mut self,
        recorder: &mut FrameRecorder,
        drawable: &Drawable,
        view_projection: Mat4,
    ) -> RenderResult<()> {
        let mesh = self.mesh_for(&drawable.geometry)?;
        let uniform = self.uniform_for(drawable.id)?;

        let mvp = view_projection * drawable.world;
        self.buffers
            .update_uniform_buffer(&mut self.device, uniform, bytemuck::bytes_of(&mvp), 0)?;

        recorder.bind_uniform_buffer(self.buffers.native(uniform)?);
        recorder.set_vertex_buffer(0, self.buffers.native(mesh.vertex_buffer)?);
        match mesh.index_buffer {
            Some(index_buffer) => {
                recorder.set_index_buffer(self.buffers.native(index_buffer)?, IndexFormat::Uint32);
                recorder.draw_indexed(mesh.index_count, 1);
            }
            None => recorder.draw(mesh.vertex_count, 1),
        }
        self.stats.record_draw_call(mesh.triangles);
        Ok(())
    }

    fn mesh_for(&mut self, geometry: &Geometry) -> RenderResult<GpuMesh> {
        if let Some(mesh) = self.meshes.get(&geometry.id) {
            return Ok(*mesh);
        }

        let vertex_buffer = self.create_vertex_buffer(&geometry.vertices)?;
        let index_buffer = match &geometry.indices {
            Some(indices) => Some(self.create_index_buffer(indices)?),
            None => None,
        };
        let mesh = GpuMesh {
            vertex_buffer,
            index_buffer,
            vertex_count: geometry.vertex_count() as u32,
            index_count: geometry.indices.as_ref().map_or(0, |i| i.len() as u32),
            triangles: geometry.triangle_count() as u64,
        };
        self.meshes.insert(geometry.id, mesh);
        self.stats.record_geometry_created();
        log::debug!("Uploaded geometry {:?} ({})", geometry.id, geometry.geometry_type);
        Ok(mesh)
    }

    fn uniform_for(&mut self, object: ObjectId) -> RenderResult<BufferHandle> {
        if let Some(buffer) = self.object_uniforms.get(&object) {
            return Ok(*buffer);
        }
        let buffer = self.create_uniform_buffer(MIN_UNIFORM_BUFFER_SIZE)?;
        self.object_uniforms.insert(object, buffer);
        Ok(buffer)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::warn!("Renderer dispose on drop failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::{DummyBackend, DummyControl, SurfaceCapabilities};
    use crate::scene::{Material, MaterialId, Scene};

    fn headless() -> (Renderer, DummyControl) {
        let target = SurfaceTarget::headless(320, 240);
        let mut device = GpuDevice::new();
        let backend = DummyBackend::new(&target, device.loss_signal());
        let control = backend.control();
        device.attach(Box::new(backend));
        let mut renderer = Renderer::with_device(RendererConfig::headless(), device);
        renderer.initialize(target).unwrap();
        (renderer, control)
    }

    fn camera() -> Camera {
        Camera::perspective(1.0, 320.0 / 240.0, 0.1, 100.0)
    }

    fn triangle_scene(count: u64) -> Scene {
        let geometry = Arc::new(Geometry::triangle(GeometryId(1)));
        let material = Arc::new(Material::basic(MaterialId(1)));
        let mut scene = Scene::new();
        for id in 0..count {
            scene.add(
                Drawable::new(ObjectId(id), geometry.clone(), material.clone())
                    .with_transform(Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -3.0))),
            );
        }
        scene
    }

    #[test]
    fn test_render_before_initialize() {
        let mut renderer = Renderer::new(RendererConfig::headless());
        let result = renderer.render(&Scene::new(), &camera());
        assert!(matches!(result, Err(RenderError::InvalidState(_))));
    }

    #[test]
    fn test_initialize_negotiates_dummy() {
        let mut renderer = Renderer::new(RendererConfig::headless());
        renderer.initialize(SurfaceTarget::headless(64, 64)).unwrap();
        assert_eq!(renderer.backend_type(), Some(BackendType::Dummy));
        assert_eq!(renderer.presentation().extent(), Extent2d::new(64, 64));
        assert!(matches!(
            renderer.initialize(SurfaceTarget::headless(64, 64)),
            Err(RenderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_frame_batches_into_one_pipeline() {
        let (mut renderer, control) = headless();
        renderer.render(&triangle_scene(4), &camera()).unwrap();

        let stats = renderer.stats();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.draw_calls, 4);
        assert_eq!(stats.triangles, 4);
        assert_eq!(stats.shaders, 1);
        assert_eq!(renderer.batching_stats().total_batches, 1);
        assert_eq!(control.pipelines_created(), 1);
        assert_eq!(control.submissions(), 1);
        assert_eq!(control.presents(), 1);

        let recording = control.last_recording().unwrap();
        assert_eq!(recording.draw_count(), 4);
        assert_eq!(recording.passes.len(), 1);
        assert!(recording.passes[0].depth_attachment.is_some());

        // Second frame reuses geometry, uniforms and pipeline.
        let buffers = renderer.buffers().live_count();
        renderer.render(&triangle_scene(4), &camera()).unwrap();
        assert_eq!(renderer.buffers().live_count(), buffers);
        assert_eq!(control.pipelines_created(), 1);
        assert!(renderer.cache_stats().hits >= 1);
    }

    #[test]
    fn test_objects_behind_camera_are_culled() {
        let (mut renderer, control) = headless();
        let mut scene = triangle_scene(1);
        scene.add(
            Drawable::new(
                ObjectId(9),
                Arc::new(Geometry::triangle(GeometryId(1))),
                Arc::new(Material::basic(MaterialId(1))),
            )
            .with_transform(Mat4::from_translation(glam::Vec3::new(0.0, 0.0, 10.0))),
        );
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.cull_stats().culled, 1);
        assert_eq!(control.last_recording().unwrap().draw_count(), 1);
    }

    #[test]
    fn test_forced_loss_blocks_render_until_restored() {
        let (mut renderer, _control) = headless();
        let buffer = renderer.create_uniform_buffer(64).unwrap();

        renderer.force_context_loss();
        assert!(renderer.is_context_lost());
        assert!(matches!(
            renderer.render(&triangle_scene(1), &camera()),
            Err(RenderError::DeviceLost)
        ));

        renderer.restore_context().unwrap();
        assert!(!renderer.is_context_lost());
        assert!(matches!(
            renderer.update_uniform_buffer(buffer, &[0u8; 64], 0),
            Err(RenderError::InvalidHandle(_))
        ));
        renderer.render(&triangle_scene(1), &camera()).unwrap();
    }

    #[test]
    fn test_bad_geometry_fails_before_acquire() {
        let (mut renderer, control) = headless();
        let mut scene = Scene::new();
        scene.add(
            Drawable::new(
                ObjectId(1),
                Arc::new(Geometry::new(GeometryId(7), "broken", vec![0.0; 7])),
                Arc::new(Material::basic(MaterialId(1))),
            )
            .with_transform(Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -3.0))),
        );

        assert!(matches!(
            renderer.render(&scene, &camera()),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(!control.image_held());
        assert!(!renderer.presentation().has_outstanding_image());
        assert_eq!(control.submissions(), 0);

        renderer.render(&triangle_scene(1), &camera()).unwrap();
        assert_eq!(control.presents(), 1);
        assert_eq!(control.abandoned_frames(), 0);
    }

    #[test]
    fn test_failed_submit_hands_the_image_back() {
        let (mut renderer, control) = headless();
        control.fail_next_submit();

        assert!(matches!(
            renderer.render(&triangle_scene(2), &camera()),
            Err(RenderError::Backend(_))
        ));
        assert_eq!(control.abandoned_frames(), 1);
        assert!(!control.image_held());
        assert!(!renderer.presentation().has_outstanding_image());
        assert_eq!(renderer.stats().frame, 0);

        renderer.render(&triangle_scene(2), &camera()).unwrap();
        assert_eq!(control.submissions(), 1);
        assert_eq!(control.presents(), 1);
        assert_eq!(renderer.stats().frame, 1);
    }

    #[test]
    fn test_restore_retries_presentation_after_partial_failure() {
        let (mut renderer, control) = headless();
        let supported = renderer.device().backend().unwrap().surface_capabilities().unwrap();

        renderer.force_context_loss();
        control.set_surface_capabilities(SurfaceCapabilities {
            formats: Vec::new(),
            ..supported.clone()
        });
        assert!(matches!(
            renderer.restore_context(),
            Err(RenderError::Initialization(_))
        ));
        // The device came back; only the swapchain is missing.
        assert!(!renderer.is_context_lost());
        assert_eq!(renderer.presentation().state(), SwapchainState::Uninitialized);

        control.set_surface_capabilities(supported);
        renderer.restore_context().unwrap();
        assert_eq!(renderer.presentation().state(), SwapchainState::Ready);
        renderer.render(&triangle_scene(1), &camera()).unwrap();
        assert_eq!(control.presents(), 1);
    }

    #[test]
    fn test_out_of_date_swapchain_is_recreated() {
        let (mut renderer, control) = headless();
        control.mark_surface_out_of_date();
        assert!(matches!(
            renderer.render(&triangle_scene(1), &camera()),
            Err(RenderError::SwapchainOutOfDate)
        ));
        renderer.render(&triangle_scene(1), &camera()).unwrap();
        assert_eq!(control.surface_configurations(), 2);
    }

    #[test]
    fn test_resize_rejects_zero_and_updates_extent() {
        let (mut renderer, _control) = headless();
        assert!(matches!(renderer.resize(0, 10), Err(RenderError::InvalidArgument(_))));
        renderer.resize(800, 600).unwrap();
        assert_eq!(renderer.presentation().extent(), Extent2d::new(800, 600));
    }

    #[test]
    fn test_dispose_releases_everything() {
        let (mut renderer, control) = headless();
        renderer.render(&triangle_scene(2), &camera()).unwrap();
        renderer.dispose().unwrap();
        assert_eq!(control.live_objects(), 0);
        assert!(!renderer.is_initialized());
        assert_eq!(renderer.stats().buffers, 0);
    }
}

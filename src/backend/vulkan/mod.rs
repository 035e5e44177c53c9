//! Vulkan backend implementation (native only)
//!
//! Direct Vulkan 1.3 through ash:
//! - dynamic rendering, no render pass objects
//! - gpu-allocator for memory; buffers live in host-visible memory so writes
//!   are a plain copy into the mapping
//! - WGSL is translated to SPIR-V with naga when a module is created
//! - one in-flight fence and two semaphores per device, waited on at acquire
//!
//! Device objects sit in a [`DeviceContext`] so that recovering from device
//! loss is a matter of dropping one context and building another on the same
//! surface.

mod conversion;
mod debug;
mod device;
mod instance;
mod pipeline;
mod swapchain;

use std::ffi::CStr;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::commands::{FrameRecording, RecordedPass, RenderCommand};
use crate::device_loss::DeviceLossSignal;
use crate::pipeline::RenderPipelineDescriptor;
use crate::types::{
    BufferDescriptor, Extent2d, TextureDataLayout, TextureDescriptor, TextureDimension,
    TextureRegion, TextureViewInfo,
};
use crate::BackendType;

use super::{
    AcquiredImage, AdapterInfo, AdapterType, BackendError, BackendResult, DeviceLimits,
    GpuBackend, NativeHandle, PipelineShaders, PresentStatus, ShaderDiagnostic,
    SurfaceCapabilities, SurfaceConfiguration, SurfaceTarget,
};

use conversion::{
    aspect_mask, convert_buffer_usage, convert_index_format, convert_present_mode_back,
    convert_texture_format, convert_texture_format_back, convert_texture_usage,
    convert_view_dimension,
};
use device::{DeviceContext, VkBuffer, VkTexture, VkView};
use debug::DebugMessenger;
use swapchain::{color_range, VulkanSwapchain};

/// A recorded command with every id resolved to a Vulkan handle.
#[derive(Clone, Copy)]
enum NativeCommand {
    BindPipeline(vk::Pipeline),
    BindVertexBuffer {
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    BindDescriptorSet(vk::DescriptorSet),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    },
}

struct NativeDepth {
    view: vk::ImageView,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    clear: bool,
}

struct NativePass {
    depth: Option<NativeDepth>,
    commands: Vec<NativeCommand>,
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    properties: vk::PhysicalDeviceProperties,
    largest_heap: u64,
    signal: DeviceLossSignal,

    /// `None` after a failed device rebuild.
    ctx: Option<DeviceContext>,
    swapchain: Option<VulkanSwapchain>,
    /// Image handed out by the last acquire and not yet presented.
    acquired: Option<u32>,

    next_id: u64,
}

fn map_vk(signal: &DeviceLossSignal, what: &str, result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => {
            log::error!("Vulkan device lost during {}", what);
            signal.raise(format!("VK_ERROR_DEVICE_LOST during {}", what));
            BackendError::DeviceLost
        }
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        other => BackendError::Internal(format!("Failed to {}: {:?}", what, other)),
    }
}

fn map_alloc(error: gpu_allocator::AllocationError) -> BackendError {
    match error {
        gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
        other => BackendError::ResourceCreationFailed(other.to_string()),
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u64::MAX as u128) as u64
}

impl VulkanBackend {
    /// Create a backend presenting to `target`. Headless targets are refused.
    pub fn new(target: &SurfaceTarget, signal: DeviceLossSignal) -> BackendResult<Self> {
        let SurfaceTarget::Window { source, .. } = target else {
            return Err(BackendError::SurfaceCreationFailed(
                "Vulkan backend needs a window".into(),
            ));
        };
        let display = source.display_handle().map_err(|e| {
            BackendError::SurfaceCreationFailed(format!("Failed to get display handle: {e}"))
        })?;
        let window = source.window_handle().map_err(|e| {
            BackendError::SurfaceCreationFailed(format!("Failed to get window handle: {e}"))
        })?;

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let validation = cfg!(debug_assertions);
        let (instance, debug) = instance::create_instance(&entry, display.as_raw(), validation)?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display.as_raw(), window.as_raw(), None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe {
                    if let Some(debug) = debug {
                        debug.destroy();
                    }
                    instance.destroy_instance(None);
                }
                return Err(BackendError::SurfaceCreationFailed(format!(
                    "Failed to create Vulkan surface: {e}"
                )));
            }
        };

        // From here on Drop cleans up whatever exists.
        let mut backend = Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            physical_device: vk::PhysicalDevice::null(),
            queue_family: 0,
            properties: vk::PhysicalDeviceProperties::default(),
            largest_heap: 0,
            signal,
            ctx: None,
            swapchain: None,
            acquired: None,
            next_id: 1,
        };

        let (physical_device, queue_family) = device::select_physical_device(
            &backend.instance,
            &backend.surface_loader,
            backend.surface,
        )?;
        backend.physical_device = physical_device;
        backend.queue_family = queue_family;
        backend.properties = unsafe {
            backend
                .instance
                .get_physical_device_properties(physical_device)
        };
        let memory = unsafe {
            backend
                .instance
                .get_physical_device_memory_properties(physical_device)
        };
        backend.largest_heap = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .map(|heap| heap.size)
            .max()
            .unwrap_or(0);

        backend.ctx = Some(DeviceContext::new(
            &backend.instance,
            physical_device,
            queue_family,
        )?);

        log::info!(
            "Vulkan backend initialized on {} (validation: {})",
            backend.adapter_name(),
            validation
        );
        Ok(backend)
    }

    fn adapter_name(&self) -> String {
        // SAFETY: device_name is NUL-terminated by the driver
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn allocate_id(&mut self) -> NativeHandle {
        let id = self.next_id;
        self.next_id += 1;
        NativeHandle(id)
    }

    fn check_device(&self) -> BackendResult<()> {
        if self.signal.is_raised() || self.ctx.is_none() {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn ctx(&self) -> BackendResult<&DeviceContext> {
        self.check_device()?;
        self.ctx.as_ref().ok_or(BackendError::DeviceLost)
    }

    /// Wait for the last submitted frame so its resources can be released.
    fn wait_for_frame(&self) {
        if let Some(ctx) = &self.ctx {
            let result = unsafe {
                ctx.device
                    .wait_for_fences(&[ctx.sync.in_flight], true, u64::MAX)
            };
            if let Err(e) = result {
                map_vk(&self.signal, "wait for frame fence", e);
            }
        }
    }

    /// Allocate a host-visible buffer and bind its memory.
    fn create_mapped_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<VkBuffer> {
        self.check_device()?;
        let signal = &self.signal;
        let ctx = self.ctx.as_mut().ok_or(BackendError::DeviceLost)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { ctx.device.create_buffer(&buffer_info, None) }
            .map_err(|e| map_vk(signal, "create buffer", e))?;
        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let allocator = ctx.allocator.as_mut().ok_or(BackendError::DeviceLost)?;
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: label,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(map_alloc(e));
            }
        };

        let bound = unsafe {
            ctx.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let vk_buffer = VkBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };
        if let Err(e) = bound {
            ctx.free_buffer(vk_buffer);
            return Err(map_vk(signal, "bind buffer memory", e));
        }
        Ok(vk_buffer)
    }

    /// Record with `record` into a throwaway command buffer and wait for it.
    fn submit_once(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> BackendResult<()> {
        let ctx = self.ctx()?;
        let device = &ctx.device;
        let fail = |what: &str, e: vk::Result| map_vk(&self.signal, what, e);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| fail("allocate upload command buffer", e))?[0];

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .map_err(|e| fail("begin upload command buffer", e))?;
            record(device, cmd);
            unsafe { device.end_command_buffer(cmd) }
                .map_err(|e| fail("end upload command buffer", e))?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            unsafe { device.queue_submit(ctx.queue, &[submit_info], vk::Fence::null()) }
                .map_err(|e| fail("submit upload", e))?;
            unsafe { device.queue_wait_idle(ctx.queue) }.map_err(|e| fail("wait for upload", e))
        })();

        unsafe { device.free_command_buffers(ctx.command_pool, &[cmd]) };
        result
    }

    /// Make sure every uniform buffer bound in `passes` has a descriptor set.
    fn prepare_descriptor_sets(&mut self, passes: &[RecordedPass]) -> BackendResult<()> {
        let signal = &self.signal;
        let ctx = self.ctx.as_mut().ok_or(BackendError::DeviceLost)?;

        for command in passes.iter().flat_map(|pass| pass.commands.iter()) {
            let RenderCommand::BindUniformBuffer { buffer } = *command else {
                continue;
            };
            if ctx.descriptor_sets.contains_key(&buffer.0) {
                continue;
            }
            let native = ctx
                .buffers
                .get(&buffer.0)
                .ok_or_else(|| BackendError::InvalidResource(format!("uniform buffer {}", buffer)))?;

            let layouts = [ctx.uniform_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(ctx.descriptor_pool)
                .set_layouts(&layouts);
            let set = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
                .map_err(|e| map_vk(signal, "allocate descriptor set", e))?[0];

            let buffer_infos = [vk::DescriptorBufferInfo {
                buffer: native.buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_infos);
            unsafe { ctx.device.update_descriptor_sets(&[write], &[]) };

            ctx.descriptor_sets.insert(buffer.0, set);
        }
        Ok(())
    }

    /// Resolve every id in `passes` before anything is recorded.
    fn resolve_passes(&self, passes: &[RecordedPass]) -> BackendResult<Vec<NativePass>> {
        let ctx = self.ctx()?;
        let buffer = |id: NativeHandle| {
            ctx.buffers
                .get(&id.0)
                .map(|b| b.buffer)
                .ok_or_else(|| BackendError::InvalidResource(format!("buffer {}", id)))
        };

        let mut cleared = std::collections::HashSet::new();
        passes
            .iter()
            .map(|pass| -> BackendResult<NativePass> {
                let depth = match pass.depth_attachment {
                    Some(id) => {
                        let view = ctx.views.get(&id.0).ok_or_else(|| {
                            BackendError::InvalidResource(format!("depth view {}", id))
                        })?;
                        Some(NativeDepth {
                            view: view.view,
                            image: view.image,
                            aspect: view.aspect,
                            clear: cleared.insert(id.0),
                        })
                    }
                    None => None,
                };

                let commands = pass
                    .commands
                    .iter()
                    .map(|command| -> BackendResult<NativeCommand> {
                        Ok(match *command {
                            RenderCommand::SetPipeline(id) => NativeCommand::BindPipeline(
                                *ctx.pipelines.get(&id.0).ok_or_else(|| {
                                    BackendError::InvalidResource(format!("pipeline {}", id))
                                })?,
                            ),
                            RenderCommand::SetVertexBuffer {
                                slot,
                                buffer: id,
                                offset,
                            } => NativeCommand::BindVertexBuffer {
                                slot,
                                buffer: buffer(id)?,
                                offset,
                            },
                            RenderCommand::SetIndexBuffer { buffer: id, format } => {
                                NativeCommand::BindIndexBuffer {
                                    buffer: buffer(id)?,
                                    index_type: convert_index_format(format),
                                }
                            }
                            RenderCommand::BindUniformBuffer { buffer: id } => {
                                NativeCommand::BindDescriptorSet(
                                    *ctx.descriptor_sets.get(&id.0).ok_or_else(|| {
                                        BackendError::InvalidResource(format!(
                                            "uniform buffer {}",
                                            id
                                        ))
                                    })?,
                                )
                            }
                            RenderCommand::Draw {
                                vertex_count,
                                instance_count,
                                first_vertex,
                            } => NativeCommand::Draw {
                                vertex_count,
                                instance_count,
                                first_vertex,
                            },
                            RenderCommand::DrawIndexed {
                                index_count,
                                instance_count,
                                first_index,
                                base_vertex,
                            } => NativeCommand::DrawIndexed {
                                index_count,
                                instance_count,
                                first_index,
                                base_vertex,
                            },
                        })
                    })
                    .collect::<BackendResult<Vec<_>>>()?;

                Ok(NativePass { depth, commands })
            })
            .collect()
    }

    /// Record the whole frame into the device's frame command buffer.
    fn record_frame(
        &self,
        ctx: &DeviceContext,
        swapchain: &VulkanSwapchain,
        image_index: u32,
        clear_color: [f32; 4],
        passes: &[NativePass],
    ) -> BackendResult<()> {
        let device = &ctx.device;
        let cmd = ctx.frame_commands;
        let image = swapchain.images[image_index as usize];
        let target = swapchain.image_views[image_index as usize];
        let extent = swapchain.extent;

        unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
            .map_err(|e| map_vk(&self.signal, "reset frame command buffer", e))?;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| map_vk(&self.signal, "begin frame command buffer", e))?;

        // Contents are discarded on the way in; the first pass clears.
        let mut barriers = vec![vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range())
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];
        for depth in passes.iter().filter_map(|p| p.depth.as_ref()).filter(|d| d.clear) {
            barriers.push(
                vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(depth.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: depth.aspect,
                        ..color_range()
                    })
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(
                        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    ),
            );
        }
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        // Negative height flips Y to match wgpu's clip space.
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };

        for (i, pass) in passes.iter().enumerate() {
            let color_attachments = [vk::RenderingAttachmentInfo::default()
                .image_view(target)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(if i == 0 {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                })];

            let depth_attachment = pass.depth.as_ref().map(|depth| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(depth.view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(if depth.clear {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    })
            });

            let mut rendering_info = vk::RenderingInfo::default()
                .render_area(render_area)
                .layer_count(1)
                .color_attachments(&color_attachments);
            if let Some(depth) = &depth_attachment {
                rendering_info = rendering_info.depth_attachment(depth);
                if pass
                    .depth
                    .as_ref()
                    .is_some_and(|d| d.aspect.contains(vk::ImageAspectFlags::STENCIL))
                {
                    rendering_info = rendering_info.stencil_attachment(depth);
                }
            }

            unsafe {
                device.cmd_begin_rendering(cmd, &rendering_info);
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[render_area]);

                for command in &pass.commands {
                    match *command {
                        NativeCommand::BindPipeline(pipeline) => {
                            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
                        }
                        NativeCommand::BindVertexBuffer {
                            slot,
                            buffer,
                            offset,
                        } => device.cmd_bind_vertex_buffers(cmd, slot, &[buffer], &[offset]),
                        NativeCommand::BindIndexBuffer { buffer, index_type } => {
                            device.cmd_bind_index_buffer(cmd, buffer, 0, index_type)
                        }
                        NativeCommand::BindDescriptorSet(set) => device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            ctx.pipeline_layout,
                            0,
                            &[set],
                            &[],
                        ),
                        NativeCommand::Draw {
                            vertex_count,
                            instance_count,
                            first_vertex,
                        } => device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, 0),
                        NativeCommand::DrawIndexed {
                            index_count,
                            instance_count,
                            first_index,
                            base_vertex,
                        } => device.cmd_draw_indexed(
                            cmd,
                            index_count,
                            instance_count,
                            first_index,
                            base_vertex,
                            0,
                        ),
                    }
                }

                device.cmd_end_rendering(cmd);
            }
        }

        let present_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range())
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::empty());
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[present_barrier],
            );
        }

        unsafe { device.end_command_buffer(cmd) }
            .map_err(|e| map_vk(&self.signal, "end frame command buffer", e))
    }

    fn destroy_swapchain(&mut self) {
        if let (Some(mut swapchain), Some(ctx)) = (self.swapchain.take(), self.ctx.as_ref()) {
            unsafe {
                let _ = ctx.device.device_wait_idle();
            }
            swapchain.destroy(ctx);
        }
        self.acquired = None;
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
    }

    fn adapter_info(&self) -> AdapterInfo {
        let version = self.properties.driver_version;
        AdapterInfo {
            name: self.adapter_name(),
            vendor: self.properties.vendor_id,
            device: self.properties.device_id,
            device_type: match self.properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => AdapterType::DiscreteGpu,
                vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterType::IntegratedGpu,
                vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterType::VirtualGpu,
                vk::PhysicalDeviceType::CPU => AdapterType::Cpu,
                _ => AdapterType::Other,
            },
            driver: format!(
                "{}.{}.{}",
                vk::api_version_major(version),
                vk::api_version_minor(version),
                vk::api_version_patch(version)
            ),
            backend: BackendType::Vulkan,
        }
    }

    fn limits(&self) -> DeviceLimits {
        let limits = &self.properties.limits;
        DeviceLimits {
            max_texture_dimension_2d: limits.max_image_dimension2_d,
            max_texture_array_layers: limits.max_image_array_layers,
            max_buffer_size: self.largest_heap,
            max_vertex_attributes: limits.max_vertex_input_attributes,
            max_vertex_buffer_array_stride: limits.max_vertex_input_binding_stride,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment
                as u32,
        }
    }

    fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> BackendResult<NativeHandle> {
        let mut buffer = self.create_mapped_buffer(
            descriptor.label.as_deref().unwrap_or("buffer"),
            descriptor.size,
            convert_buffer_usage(descriptor.usage),
        )?;

        if let Some(data) = contents {
            match buffer
                .allocation
                .as_mut()
                .and_then(|allocation| allocation.mapped_slice_mut())
            {
                Some(mapped) if data.len() <= mapped.len() => {
                    mapped[..data.len()].copy_from_slice(data);
                }
                _ => {
                    if let Some(ctx) = self.ctx.as_mut() {
                        ctx.free_buffer(buffer);
                    }
                    return Err(BackendError::ResourceCreationFailed(
                        "buffer memory is not mapped".into(),
                    ));
                }
            }
        }

        let id = self.allocate_id();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.buffers.insert(id.0, buffer);
        }
        Ok(id)
    }

    fn write_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        self.check_device()?;
        // Host writes land immediately; the frame still on the GPU may be
        // reading this memory.
        self.wait_for_frame();
        let ctx = self.ctx.as_mut().ok_or(BackendError::DeviceLost)?;
        let native = ctx
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidResource(format!("buffer {}", buffer)))?;

        let end = offset + data.len() as u64;
        if end > native.size {
            return Err(BackendError::InvalidResource(format!(
                "write of {} bytes at {} overruns buffer {} ({} bytes)",
                data.len(),
                offset,
                buffer,
                native.size
            )));
        }
        let mapped = native
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| BackendError::Internal("buffer memory is not mapped".into()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: NativeHandle) {
        self.wait_for_frame();
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        if let Some(set) = ctx.descriptor_sets.remove(&buffer.0) {
            if let Err(e) = unsafe { ctx.device.free_descriptor_sets(ctx.descriptor_pool, &[set]) } {
                log::warn!("Failed to free descriptor set: {:?}", e);
            }
        }
        match ctx.buffers.remove(&buffer.0) {
            Some(native) => ctx.free_buffer(native),
            None => log::warn!("VulkanBackend: destroy of unknown buffer {}", buffer),
        }
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let signal = &self.signal;
        let ctx = self.ctx.as_mut().ok_or(BackendError::DeviceLost)?;

        let flags = if descriptor.dimension == TextureDimension::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: descriptor.width,
                height: descriptor.height,
                depth: 1,
            })
            .mip_levels(descriptor.mip_level_count)
            .array_layers(descriptor.depth_or_array_layers)
            .format(convert_texture_format(descriptor.format))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(convert_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::from_raw(descriptor.sample_count));

        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .map_err(|e| map_vk(signal, "create image", e))?;
        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };

        let allocator = ctx.allocator.as_mut().ok_or(BackendError::DeviceLost)?;
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: descriptor.label.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(map_alloc(e));
            }
        };

        let bound = unsafe {
            ctx.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let texture = VkTexture {
            image,
            allocation: Some(allocation),
            format: descriptor.format,
            initialized: Default::default(),
        };
        if let Err(e) = bound {
            ctx.free_texture(texture);
            return Err(map_vk(signal, "bind image memory", e));
        }

        let id = self.allocate_id();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.textures.insert(id.0, texture);
        }
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: NativeHandle,
        region: &TextureRegion,
        data: &[u8],
        layout: &TextureDataLayout,
    ) -> BackendResult<()> {
        let (image, format, was_initialized) = {
            let ctx = self.ctx()?;
            let native = ctx
                .textures
                .get(&texture.0)
                .ok_or_else(|| BackendError::InvalidResource(format!("texture {}", texture)))?;
            (
                native.image,
                native.format,
                native
                    .initialized
                    .contains(&(region.mip_level, region.array_layer)),
            )
        };

        let mut staging = self.create_mapped_buffer(
            "texture staging",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        if let Some(mapped) = staging
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
        {
            mapped[..data.len()].copy_from_slice(data);
        }

        let copy_aspect = if format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: copy_aspect,
            base_mip_level: region.mip_level,
            level_count: 1,
            base_array_layer: region.array_layer,
            layer_count: 1,
        };
        let old_layout = if was_initialized {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let copy = vk::BufferImageCopy {
            buffer_offset: layout.offset,
            buffer_row_length: layout.bytes_per_row / format.block_size(),
            buffer_image_height: layout.rows_per_image,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: copy_aspect,
                mip_level: region.mip_level,
                base_array_layer: region.array_layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: region.width,
                height: region.height,
                depth: 1,
            },
        };
        let staging_buffer = staging.buffer;

        let result = self.submit_once(|device, cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .old_layout(old_layout)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );

            let to_shader = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });

        if let Some(ctx) = self.ctx.as_mut() {
            ctx.free_buffer(staging);
            if result.is_ok() {
                if let Some(native) = ctx.textures.get_mut(&texture.0) {
                    native
                        .initialized
                        .insert((region.mip_level, region.array_layer));
                }
            }
        }
        result
    }

    fn create_texture_view(
        &mut self,
        texture: NativeHandle,
        view: &TextureViewInfo,
    ) -> BackendResult<NativeHandle> {
        self.check_device()?;
        let signal = &self.signal;
        let ctx = self.ctx.as_mut().ok_or(BackendError::DeviceLost)?;
        let image = ctx
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidResource(format!("texture {}", texture)))?
            .image;

        let aspect = aspect_mask(view.format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(convert_view_dimension(view.dimension))
            .format(convert_texture_format(view.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: view.base_mip_level,
                level_count: view.mip_level_count,
                base_array_layer: view.base_array_layer,
                layer_count: view.array_layer_count,
            });
        let native = unsafe { ctx.device.create_image_view(&view_info, None) }
            .map_err(|e| map_vk(signal, "create image view", e))?;

        let id = self.allocate_id();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.views.insert(
                id.0,
                VkView {
                    texture: texture.0,
                    view: native,
                    image,
                    aspect,
                },
            );
        }
        Ok(id)
    }

    fn destroy_texture_view(&mut self, view: NativeHandle) {
        self.wait_for_frame();
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        match ctx.views.remove(&view.0) {
            Some(native) => unsafe { ctx.device.destroy_image_view(native.view, None) },
            None => log::warn!("VulkanBackend: destroy of unknown texture view {}", view),
        }
    }

    fn destroy_texture(&mut self, texture: NativeHandle) {
        self.wait_for_frame();
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let orphaned: Vec<u64> = ctx
            .views
            .iter()
            .filter(|(_, view)| view.texture == texture.0)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            if let Some(view) = ctx.views.remove(&id) {
                unsafe { ctx.device.destroy_image_view(view.view, None) };
            }
        }
        match ctx.textures.remove(&texture.0) {
            Some(native) => ctx.free_texture(native),
            None => log::warn!("VulkanBackend: destroy of unknown texture {}", texture),
        }
    }

    fn create_shader_module(
        &mut self,
        label: Option<&str>,
        source: &str,
    ) -> BackendResult<NativeHandle> {
        let shader = pipeline::compile_shader(&self.ctx()?.device, source)?;
        log::debug!("VulkanBackend: created shader module {:?}", label);

        let id = self.allocate_id();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.shaders.insert(id.0, shader);
        }
        Ok(id)
    }

    fn shader_diagnostics(&self, module: NativeHandle) -> Option<Vec<ShaderDiagnostic>> {
        // Invalid WGSL never becomes a module here, so known modules are clean.
        self.ctx
            .as_ref()?
            .shaders
            .contains_key(&module.0)
            .then(Vec::new)
    }

    fn destroy_shader_module(&mut self, module: NativeHandle) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        match ctx.shaders.remove(&module.0) {
            Some(shader) => unsafe { ctx.device.destroy_shader_module(shader.module, None) },
            None => log::warn!("VulkanBackend: destroy of unknown shader module {}", module),
        }
    }

    fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
        shaders: &PipelineShaders,
    ) -> BackendResult<NativeHandle> {
        let native = {
            let ctx = self.ctx()?;
            let shader = |id: NativeHandle| {
                ctx.shaders
                    .get(&id.0)
                    .ok_or_else(|| BackendError::InvalidResource(format!("shader module {}", id)))
            };
            pipeline::create_graphics_pipeline(
                &ctx.device,
                ctx.pipeline_layout,
                descriptor,
                shader(shaders.vertex)?,
                shader(shaders.fragment)?,
            )?
        };

        let id = self.allocate_id();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.pipelines.insert(id.0, native);
        }
        Ok(id)
    }

    fn destroy_render_pipeline(&mut self, pipeline: NativeHandle) {
        self.wait_for_frame();
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        match ctx.pipelines.remove(&pipeline.0) {
            Some(native) => unsafe { ctx.device.destroy_pipeline(native, None) },
            None => log::warn!("VulkanBackend: destroy of unknown pipeline {}", pipeline),
        }
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        self.check_device()?;
        let query_failed = |e: vk::Result| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
            other => map_vk(&self.signal, "query surface", other),
        };

        let (capabilities, formats, present_modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                    .map_err(query_failed)?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)
                    .map_err(query_failed)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                    .map_err(query_failed)?,
            )
        };

        let mut supported = Vec::new();
        for format in formats
            .iter()
            .filter_map(|f| convert_texture_format_back(f.format))
        {
            if !supported.contains(&format) {
                supported.push(format);
            }
        }

        Ok(SurfaceCapabilities {
            min_image_count: capabilities.min_image_count,
            max_image_count: capabilities.max_image_count,
            formats: supported,
            present_modes: present_modes
                .into_iter()
                .filter_map(convert_present_mode_back)
                .collect(),
            current_extent: (capabilities.current_extent.width != u32::MAX).then(|| {
                Extent2d::new(
                    capabilities.current_extent.width,
                    capabilities.current_extent.height,
                )
            }),
        })
    }

    fn configure_surface(&mut self, config: &SurfaceConfiguration) -> BackendResult<()> {
        self.check_device()?;
        let ctx = self.ctx.as_ref().ok_or(BackendError::DeviceLost)?;

        let old = self.swapchain.take();
        let old_handle = old
            .as_ref()
            .map(|s| s.swapchain)
            .unwrap_or(vk::SwapchainKHR::null());

        match VulkanSwapchain::new(
            ctx,
            &self.surface_loader,
            self.physical_device,
            self.surface,
            config,
            old_handle,
        ) {
            Ok(swapchain) => {
                if let Some(mut old) = old {
                    old.destroy(ctx);
                }
                self.swapchain = Some(swapchain);
                self.acquired = None;
                Ok(())
            }
            Err(err) => {
                self.swapchain = old;
                Err(err)
            }
        }
    }

    fn acquire_image(&mut self, timeout: Duration) -> BackendResult<AcquiredImage> {
        let ctx = self.ctx()?;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| BackendError::InvalidResource("surface not configured".into()))?;
        let timeout = timeout_ns(timeout);

        unsafe {
            ctx.device
                .wait_for_fences(&[ctx.sync.in_flight], true, timeout)
        }
        .map_err(|e| match e {
            vk::Result::TIMEOUT => BackendError::Timeout,
            other => map_vk(&self.signal, "wait for frame fence", other),
        })?;

        let (index, suboptimal) = unsafe {
            ctx.swapchain_loader.acquire_next_image(
                swapchain.swapchain,
                timeout,
                ctx.sync.image_available,
                vk::Fence::null(),
            )
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => BackendError::Timeout,
            other => map_vk(&self.signal, "acquire swapchain image", other),
        })?;

        self.acquired = Some(index);
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(&mut self, recording: &FrameRecording) -> BackendResult<()> {
        self.check_device()?;
        match self.acquired {
            Some(index) if index == recording.image_index => {}
            Some(index) => {
                return Err(BackendError::InvalidResource(format!(
                    "recording targets image {} but image {} is acquired",
                    recording.image_index, index
                )))
            }
            None => {
                return Err(BackendError::InvalidResource(
                    "no acquired swapchain image".into(),
                ))
            }
        }

        let empty = [RecordedPass::default()];
        let passes: &[RecordedPass] = if recording.passes.is_empty() {
            &empty
        } else {
            &recording.passes
        };
        self.prepare_descriptor_sets(passes)?;
        let native_passes = self.resolve_passes(passes)?;

        let ctx = self.ctx()?;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| BackendError::InvalidResource("surface not configured".into()))?;
        self.record_frame(
            ctx,
            swapchain,
            recording.image_index,
            recording.clear_color,
            &native_passes,
        )?;

        unsafe { ctx.device.reset_fences(&[ctx.sync.in_flight]) }
            .map_err(|e| map_vk(&self.signal, "reset frame fence", e))?;

        let wait_semaphores = [ctx.sync.image_available];
        let signal_semaphores = [ctx.sync.render_finished];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [ctx.frame_commands];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            ctx.device
                .queue_submit(ctx.queue, &[submit_info], ctx.sync.in_flight)
        }
        .map_err(|e| map_vk(&self.signal, "submit frame", e))
    }

    fn present(&mut self, image_index: u32) -> BackendResult<PresentStatus> {
        let ctx = self.ctx()?;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| BackendError::InvalidResource("surface not configured".into()))?;

        let wait_semaphores = [ctx.sync.render_finished];
        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { ctx.swapchain_loader.queue_present(ctx.queue, &present_info) };
        let status = match result {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date at present");
                Ok(PresentStatus::OutOfDate)
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(e) => Err(map_vk(&self.signal, "present swapchain image", e)),
        };
        self.acquired = None;
        status
    }

    fn abandon_frame(&mut self, image_index: u32) {
        if self.acquired != Some(image_index) {
            return;
        }
        // Core Vulkan only releases an acquired image through a present, and
        // the acquire semaphore must be waited on before the next acquire.
        // A cleared frame settles both.
        let cleared = FrameRecording {
            image_index,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            passes: Vec::new(),
        };
        let result = self
            .submit(&cleared)
            .and_then(|()| self.present(image_index).map(|_| ()));
        if let Err(err) = result {
            log::warn!("VulkanBackend: failed to settle abandoned image {}: {}", image_index, err);
            self.acquired = None;
        }
    }

    fn release_surface(&mut self) {
        self.destroy_swapchain();
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        let ctx = self.ctx()?;
        unsafe { ctx.device.device_wait_idle() }.map_err(|e| map_vk(&self.signal, "wait idle", e))
    }

    fn recreate_device(&mut self) -> BackendResult<()> {
        log::info!("VulkanBackend: recreating device");
        self.destroy_swapchain();
        if let Some(mut ctx) = self.ctx.take() {
            ctx.destroy();
        }
        self.ctx = Some(DeviceContext::new(
            &self.instance,
            self.physical_device,
            self.queue_family,
        )?);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.destroy_swapchain();
        if let Some(mut ctx) = self.ctx.take() {
            ctx.destroy();
        }
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_target_is_rejected() {
        let result = VulkanBackend::new(&SurfaceTarget::headless(64, 64), DeviceLossSignal::new());
        assert!(matches!(
            result,
            Err(BackendError::SurfaceCreationFailed(_))
        ));
    }

    #[test]
    fn test_device_lost_raises_signal() {
        let signal = DeviceLossSignal::new();
        let err = map_vk(&signal, "submit frame", vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err, BackendError::DeviceLost);
        assert!(signal.is_raised());

        let err = map_vk(&signal, "create buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err, BackendError::OutOfMemory);
    }

    #[test]
    fn test_timeout_conversion_saturates() {
        assert_eq!(timeout_ns(Duration::from_millis(2)), 2_000_000);
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
    }
}

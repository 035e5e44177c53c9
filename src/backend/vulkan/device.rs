//! Physical device selection and everything owned by one logical device.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};

use crate::backend::{BackendError, BackendResult};
use crate::types::TextureFormat;

use super::instance::REQUIRED_API_VERSION;

/// Uniform descriptor sets the pool can hand out at once.
const MAX_UNIFORM_SETS: u32 = 1024;

pub struct VkBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

pub struct VkTexture {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: TextureFormat,
    /// (mip, layer) pairs that have been uploaded and sit in
    /// SHADER_READ_ONLY_OPTIMAL.
    pub initialized: HashSet<(u32, u32)>,
}

pub struct VkView {
    pub texture: u64,
    pub view: vk::ImageView,
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
}

pub struct VkShader {
    pub module: vk::ShaderModule,
    pub naga: naga::Module,
}

/// One fence and two semaphores, reused every frame.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Pick the highest-scoring GPU that can present to `surface`, together with
/// a queue family that does graphics and present.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> BackendResult<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    let mut best = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        // SAFETY: device_name is NUL-terminated by the driver
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {:?}: Vulkan 1.3 not supported", device_name);
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, surface_loader, surface, device)
        else {
            log::info!("Skipping GPU {:?}: cannot present to the surface", device_name);
            continue;
        };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best = Some((device, queue_family));
        }
    }

    best.ok_or_else(|| BackendError::InitializationFailed("No suitable GPU found".to_string()))
}

fn find_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let presents = unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, index, surface)
        }
        .unwrap_or(false);
        (family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presents).then_some(index)
    })
}

/// Logical device and every object created from it.
pub struct DeviceContext {
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub swapchain_loader: ash::khr::swapchain::Device,
    /// `None` only while tearing down.
    pub allocator: Option<Allocator>,
    pub command_pool: vk::CommandPool,
    pub frame_commands: vk::CommandBuffer,
    pub sync: FrameSync,
    pub descriptor_pool: vk::DescriptorPool,
    pub uniform_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,

    pub buffers: HashMap<u64, VkBuffer>,
    pub textures: HashMap<u64, VkTexture>,
    pub views: HashMap<u64, VkView>,
    pub shaders: HashMap<u64, VkShader>,
    pub pipelines: HashMap<u64, vk::Pipeline>,
    /// Uniform descriptor sets keyed by the buffer they point at.
    pub descriptor_sets: HashMap<u64, vk::DescriptorSet>,
}

impl DeviceContext {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> BackendResult<Self> {
        let device = create_logical_device(instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        // From here on a failure has to tear down what was already created,
        // which `destroy` does for a partially filled context.
        let mut ctx = Self {
            device,
            queue,
            swapchain_loader,
            allocator: None,
            command_pool: vk::CommandPool::null(),
            frame_commands: vk::CommandBuffer::null(),
            sync: FrameSync {
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            },
            descriptor_pool: vk::DescriptorPool::null(),
            uniform_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            descriptor_sets: HashMap::new(),
        };

        if let Err(err) = ctx.create_objects(instance, physical_device, queue_family) {
            ctx.destroy();
            return Err(err);
        }
        Ok(ctx)
    }

    fn create_objects(
        &mut self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> BackendResult<()> {
        let device = &self.device;
        let failed = |what: &str, e: vk::Result| {
            BackendError::DeviceCreationFailed(format!("Failed to create {}: {:?}", what, e))
        };

        self.allocator = Some(
            Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: gpu_allocator::AllocationSizes::default(),
            })
            .map_err(|e| {
                BackendError::DeviceCreationFailed(format!(
                    "Failed to create memory allocator: {}",
                    e
                ))
            })?,
        );

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| failed("command pool", e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.frame_commands = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| failed("frame command buffer", e))?[0];

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Signaled so the first acquire does not wait on a frame that never ran.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        self.sync.image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| failed("image available semaphore", e))?;
        self.sync.render_finished = unsafe { device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| failed("render finished semaphore", e))?;
        self.sync.in_flight = unsafe { device.create_fence(&fence_info, None) }
            .map_err(|e| failed("in-flight fence", e))?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: MAX_UNIFORM_SETS,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_UNIFORM_SETS)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| failed("descriptor pool", e))?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.uniform_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| failed("descriptor set layout", e))?;

        let set_layouts = [self.uniform_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        self.pipeline_layout =
            unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
                .map_err(|e| failed("pipeline layout", e))?;

        Ok(())
    }

    pub fn free_buffer(&mut self, buffer: VkBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        if let (Some(allocator), Some(allocation)) = (self.allocator.as_mut(), buffer.allocation) {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }

    pub fn free_texture(&mut self, texture: VkTexture) {
        unsafe { self.device.destroy_image(texture.image, None) };
        if let (Some(allocator), Some(allocation)) = (self.allocator.as_mut(), texture.allocation)
        {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free texture memory: {}", e);
            }
        }
    }

    /// Release everything, then the device itself. Null handles are skipped.
    pub fn destroy(&mut self) {
        unsafe {
            // A lost device reports an error here; teardown goes ahead anyway.
            let _ = self.device.device_wait_idle();

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, shader) in self.shaders.drain() {
                self.device.destroy_shader_module(shader.module, None);
            }
            for (_, view) in self.views.drain() {
                self.device.destroy_image_view(view.view, None);
            }
        }

        let textures: Vec<VkTexture> = self.textures.drain().map(|(_, t)| t).collect();
        for texture in textures {
            self.free_texture(texture);
        }
        let buffers: Vec<VkBuffer> = self.buffers.drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            self.free_buffer(buffer);
        }
        self.descriptor_sets.clear();

        // The allocator has to go before the device it allocated from.
        drop(self.allocator.take());

        unsafe {
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.uniform_layout != vk::DescriptorSetLayout::null() {
                self.device
                    .destroy_descriptor_set_layout(self.uniform_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.sync.in_flight != vk::Fence::null() {
                self.device.destroy_fence(self.sync.in_flight, None);
            }
            if self.sync.render_finished != vk::Semaphore::null() {
                self.device.destroy_semaphore(self.sync.render_finished, None);
            }
            if self.sync.image_available != vk::Semaphore::null() {
                self.device.destroy_semaphore(self.sync.image_available, None);
            }
            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool, None);
            }
            self.device.destroy_device(None);
        }
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> BackendResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

//! Vulkan swapchain.
//!
//! Synchronization objects live on the device, not here, so a rebuild only
//! replaces images and views. The previous swapchain is passed as
//! `old_swapchain` and destroyed once its successor exists.

use ash::vk;

use crate::backend::{BackendError, BackendResult, SurfaceConfiguration};

use super::conversion::{convert_present_mode, convert_texture_format};
use super::device::DeviceContext;

pub struct VulkanSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl VulkanSwapchain {
    pub fn new(
        ctx: &DeviceContext,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        config: &SurfaceConfiguration,
        old_swapchain: vk::SwapchainKHR,
    ) -> BackendResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(surface_error)?;
        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }
                .map_err(surface_error)?;

        let wanted = convert_texture_format(config.format);
        let surface_format = formats
            .iter()
            .find(|f| f.format == wanted)
            .copied()
            .ok_or_else(|| {
                BackendError::Unsupported(format!("surface format {:?}", config.format))
            })?;

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: config.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: config.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        if extent.width == 0 || extent.height == 0 {
            return Err(BackendError::SurfaceOutOfDate);
        }

        let max_images = if capabilities.max_image_count > 0 {
            capabilities.max_image_count
        } else {
            u32::MAX
        };
        let image_count = config
            .image_count
            .clamp(capabilities.min_image_count, max_images);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(convert_present_mode(config.present_mode))
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceOutOfDate,
                vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
                other => BackendError::ResourceCreationFailed(format!(
                    "Failed to create swapchain: {:?}",
                    other
                )),
            })?;

        let mut result = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
        };
        if let Err(err) = result.create_views(ctx) {
            result.destroy(ctx);
            return Err(err);
        }

        log::info!(
            "Created Vulkan swapchain: {}x{} with {} images",
            extent.width,
            extent.height,
            result.images.len()
        );
        Ok(result)
    }

    fn create_views(&mut self, ctx: &DeviceContext) -> BackendResult<()> {
        self.images = unsafe { ctx.swapchain_loader.get_swapchain_images(self.swapchain) }
            .map_err(|e| {
                BackendError::ResourceCreationFailed(format!(
                    "Failed to get swapchain images: {:?}",
                    e
                ))
            })?;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(color_range());
            let view = unsafe { ctx.device.create_image_view(&view_info, None) }.map_err(|e| {
                BackendError::ResourceCreationFailed(format!(
                    "Failed to create swapchain image view: {:?}",
                    e
                ))
            })?;
            self.image_views.push(view);
        }
        Ok(())
    }

    /// Destroy views and the swapchain. The caller has waited for idle.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        if self.swapchain == vk::SwapchainKHR::null() {
            return;
        }
        unsafe {
            for view in self.image_views.drain(..) {
                ctx.device.destroy_image_view(view, None);
            }
            ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn surface_error(e: vk::Result) -> BackendError {
    match e {
        vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
        other => BackendError::Internal(format!("Failed to query surface: {:?}", other)),
    }
}

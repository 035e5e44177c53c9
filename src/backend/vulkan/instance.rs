//! Vulkan instance creation.

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::backend::{BackendError, BackendResult};

use super::debug::DebugMessenger;

/// Dynamic rendering is core from 1.3 on.
pub const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create an instance with the surface extensions `display` needs, plus
/// validation when requested and available.
pub fn create_instance(
    entry: &ash::Entry,
    display: RawDisplayHandle,
    validation_enabled: bool,
) -> BackendResult<(ash::Instance, Option<DebugMessenger>)> {
    let validation_available = validation_enabled && check_validation_layer_support(entry);
    if validation_enabled && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"gpu-render-core")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"gpu-render-core")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(|e| {
            BackendError::InitializationFailed(format!(
                "No surface extensions for this display: {:?}",
                e
            ))
        })?
        .to_vec();
    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    let debug = if validation_available {
        match DebugMessenger::new(entry, &instance) {
            Ok(messenger) => Some(messenger),
            Err(err) => {
                log::warn!("{}", err);
                None
            }
        }
    } else {
        None
    };

    Ok((instance, debug))
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let Ok(available_layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };

    available_layers.iter().any(|layer| {
        // SAFETY: layer_name is a NUL-terminated array filled in by the loader
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}

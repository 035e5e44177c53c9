//! Validation layer messages routed into `log`.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::backend::{BackendError, BackendResult};

/// Error-severity messages seen by any messenger in this process.
static VALIDATION_ERRORS: AtomicU64 = AtomicU64::new(0);

pub fn validation_error_count() -> u64 {
    VALIDATION_ERRORS.load(Ordering::Relaxed)
}

/// Debug-utils loader plus the messenger registered with it.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> BackendResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(forward_message));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| {
                BackendError::InitializationFailed(format!("Debug messenger: {:?}", e))
            })?;
        Ok(Self { loader, messenger })
    }

    /// Must run before the owning instance is destroyed.
    pub fn destroy(self) {
        let errors = validation_error_count();
        if errors > 0 {
            log::warn!("Vulkan validation reported {} error(s) this session", errors);
        }
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None)
        };
    }
}

unsafe extern "system" fn forward_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes valid callback data for the duration of the call
    let message = match unsafe { callback_data.as_ref() } {
        Some(data) if !data.p_message.is_null() => {
            // SAFETY: p_message is NUL-terminated and owned by the loader
            unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
        }
        _ => "(empty)".into(),
    };

    let kind = if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        VALIDATION_ERRORS.fetch_add(1, Ordering::Relaxed);
        log::error!("vk/{}: {}", kind, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("vk/{}: {}", kind, message);
    } else {
        log::debug!("vk/{}: {}", kind, message);
    }

    vk::FALSE
}

use std::ffi::{CStr, CString, c_void};

use anyhow::{Context, bail};
use ash::{Entry, ext::debug_utils, vk};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn forward_to_log(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let message = unsafe {
        if data.is_null() || (*data).p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    let level = match severity {
        Severity::VERBOSE => log::Level::Debug,
        Severity::INFO => log::Level::Info,
        Severity::WARNING => log::Level::Warn,
        _ => log::Level::Error,
    };
    log::log!(target: "vulkan", level, "{:?} - {}", kind, message);
    vk::FALSE
}

/// The validation layer names to enable, failing if the loader does not provide them.
pub fn validation_layers(entry: &Entry) -> anyhow::Result<Vec<CString>> {
    let available = unsafe {
        entry
            .enumerate_instance_layer_properties()
            .context("failed to enumerate Vulkan instance layer properties")?
    };
    let found = available
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
    if !found {
        bail!(
            "validation layer not supported: {}",
            VALIDATION_LAYER.to_string_lossy()
        );
    }
    Ok(vec![VALIDATION_LAYER.to_owned()])
}

pub fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_to_log))
}

/// Routes validation messages into `log` for the lifetime of an instance.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Installs the messenger; a failure only costs the messages, so it is logged and skipped.
    pub fn install(entry: &Entry, instance: &ash::Instance) -> Option<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        match unsafe { loader.create_debug_utils_messenger(&messenger_create_info(), None) } {
            Ok(messenger) => Some(Self { loader, messenger }),
            Err(e) => {
                log::warn!("failed to create debug messenger: {:?}", e);
                None
            }
        }
    }

    /// Must run before the owning instance is destroyed.
    pub fn destroy(&mut self) {
        log::trace!("Destroying debug messenger");
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
        self.messenger = vk::DebugUtilsMessengerEXT::null();
    }
}

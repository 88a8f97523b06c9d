use std::ffi::CString;

use anyhow::Context;
use ash::{ext::debug_utils, vk};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::debug::{DebugMessenger, messenger_create_info, validation_layers};

/// The Vulkan instance and the instance-level loaders shared by every window.
pub struct InstanceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_instance: ash::khr::surface::Instance,
    debug_messenger: Option<DebugMessenger>,
}

impl InstanceContext {
    pub fn new(
        app_name: &str,
        display: &impl HasDisplayHandle,
        validation: bool,
    ) -> anyhow::Result<Self> {
        let entry = ash::Entry::linked();
        let display_handle = display
            .display_handle()
            .context("failed to acquire display handle")?;

        let app_name = CString::new(app_name).context("application name contains a nul byte")?;
        let engine_name = c"Cadence";
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3)
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0));

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle.as_raw())
                .context("failed to enumerate required extensions")?
                .to_vec();
        if validation {
            extension_names.push(debug_utils::NAME.as_ptr());
        }
        let create_flags = if cfg!(any(target_os = "macos", target_os = "ios")) {
            extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::default()
        };

        let layers = if validation {
            validation_layers(&entry).context("failed to enable validation")?
        } else {
            Vec::new()
        };
        let layer_ptrs = layers.iter().map(|name| name.as_ptr()).collect::<Vec<_>>();

        let mut debug_create_info = messenger_create_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_ptrs)
            .flags(create_flags);
        if validation {
            create_info = create_info.push_next(&mut debug_create_info);
        }

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .context("failed to create ash::Instance")?
        };
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);
        let debug_messenger = if validation {
            DebugMessenger::install(&entry, &instance)
        } else {
            None
        };

        log::debug!(
            "Created Vulkan instance (validation {})",
            if validation { "on" } else { "off" }
        );

        Ok(Self {
            entry,
            instance,
            surface_instance,
            debug_messenger,
        })
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn create_surface(
        &self,
        window: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> anyhow::Result<vk::SurfaceKHR> {
        let display_handle = window
            .display_handle()
            .context("failed to acquire display handle")?;
        let window_handle = window
            .window_handle()
            .context("failed to acquire window handle")?;
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .context("failed to create surface")
        }
    }

    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        log::trace!("Destroying surface");
        unsafe {
            self.surface_instance.destroy_surface(surface, None);
        }
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        log::trace!("Destroying Instance Context");
        if let Some(messenger) = &mut self.debug_messenger {
            messenger.destroy();
        }
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

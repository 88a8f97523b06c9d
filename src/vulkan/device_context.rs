use std::{ffi::CString, mem::ManuallyDrop, sync::Arc};

use anyhow::Context;
use ash::vk;

use crate::render::{QueueFamilies, QueueFamily};

use super::{
    device::{Queues, create_logical_device},
    instance::InstanceContext,
    physical::pick_physical_device,
};

/// The logical device, its queues and its memory allocator. Shared by every window.
pub struct DeviceContext {
    pub instance: Arc<InstanceContext>,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub swapchain_device: ash::khr::swapchain::Device,
    pub allocator: ManuallyDrop<vk_mem::Allocator>,
    pub families: QueueFamilies,
    queues: Queues,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl DeviceContext {
    /// Picks a physical device able to present to `surface` and creates the logical device on it.
    pub fn new(instance: Arc<InstanceContext>, surface: vk::SurfaceKHR) -> anyhow::Result<Self> {
        let (physical_device, families) =
            pick_physical_device(&instance.instance, &instance.surface_instance, surface)
                .context("failed to pick physical device")?;

        let (device, queues) = create_logical_device(&instance.instance, physical_device, families)
            .context("failed to create logical device")?;

        let mut aci = vk_mem::AllocatorCreateInfo::new(&instance.instance, &device, physical_device);
        aci.vulkan_api_version = vk::API_VERSION_1_3;
        aci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = match unsafe { vk_mem::Allocator::new(aci) } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("failed to create allocator");
            }
        };

        let swapchain_device = ash::khr::swapchain::Device::new(&instance.instance, &device);
        let debug_utils = instance
            .validation_enabled()
            .then(|| ash::ext::debug_utils::Device::new(&instance.instance, &device));

        log::debug!("Created device context (queue families {:?})", families);

        Ok(Self {
            instance,
            physical_device,
            device,
            swapchain_device,
            allocator: ManuallyDrop::new(allocator),
            families,
            queues,
            debug_utils,
        })
    }

    pub fn queue(&self, family: QueueFamily) -> vk::Queue {
        self.queues.get(family)
    }

    pub fn supports_present(&self, surface: vk::SurfaceKHR) -> anyhow::Result<bool> {
        unsafe {
            self.instance
                .surface_instance
                .get_physical_device_surface_support(
                    self.physical_device,
                    self.families.present,
                    surface,
                )
                .context("failed to query surface support")
        }
    }

    pub fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .context("failed to wait for device idle")
        }
    }

    /// Attaches a debug name to `handle`. A no-op without validation.
    pub fn name_object<T>(&self, handle: T, debug_name: impl AsRef<str>) -> anyhow::Result<()>
    where
        T: vk::Handle,
    {
        let Some(debug) = &self.debug_utils else {
            return Ok(());
        };

        let cname =
            CString::new(debug_name.as_ref()).context("debug name contains interior null byte")?;

        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&cname);

        unsafe {
            debug
                .set_debug_utils_object_name(&name_info)
                .context("failed to set debug name")
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::trace!("Destroying Device Context");
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

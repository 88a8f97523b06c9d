use anyhow::Context;
use ash::vk;

use crate::render::{QueueFamilies, QueueFamily};

use super::physical::required_device_extensions;

/// One queue handle per logical lane; lanes on the same physical family share a queue.
#[derive(Clone, Copy, Debug)]
pub struct Queues {
    queues: [vk::Queue; 4],
}

impl Queues {
    pub fn get(&self, family: QueueFamily) -> vk::Queue {
        self.queues[family.ordinal()]
    }
}

pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
) -> anyhow::Result<(ash::Device, Queues)> {
    let queue_priorities = [1.0f32];
    let unique_indices = families.unique_indices();
    let queue_create_infos = unique_indices
        .iter()
        .map(|index| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(*index)
                .queue_priorities(&queue_priorities)
        })
        .collect::<Vec<_>>();

    let device_extensions_ptrs = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect::<Vec<_>>();

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(true);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions_ptrs)
        .push_next(&mut features12)
        .push_next(&mut features13);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .context("failed to create logical device.")?
    };

    let mut queues = [vk::Queue::null(); 4];
    for family in QueueFamily::ALL {
        queues[family.ordinal()] = unsafe { device.get_device_queue(families.index(family), 0) };
    }

    log::trace!(
        "Created logical device with {} queue(s)",
        queue_create_infos.len()
    );

    Ok((device, Queues { queues }))
}

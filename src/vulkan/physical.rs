use std::ffi::CStr;

use anyhow::Context;
use ash::{khr::surface, vk};

use crate::{
    render::{QueueFamilies, QueueFamilyProbe},
    vulkan::swapchain::SwapchainSupportDetails,
};

pub fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::khr::swapchain::NAME]
}

/// Finds a family per lane. Compute and transfer prefer families without graphics support so
/// they run on separate hardware queues; present prefers the graphics family.
pub fn probe_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> QueueFamilyProbe {
    let mut probe = QueueFamilyProbe::default();
    let usable = families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0)
        .map(|(index, family)| (index as u32, family.queue_flags))
        .collect::<Vec<_>>();

    probe.graphics = usable
        .iter()
        .find(|(_, flags)| flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(index, _)| *index);
    probe.compute = usable
        .iter()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|(index, _)| *index);
    probe.transfer = usable
        .iter()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(index, _)| *index);
    probe.present = probe
        .graphics
        .filter(|graphics| supports_present(*graphics))
        .or_else(|| {
            usable
                .iter()
                .map(|(index, _)| *index)
                .find(|index| supports_present(*index))
        });
    probe
}

pub fn pick_physical_device(
    instance: &ash::Instance,
    surface: &surface::Instance,
    surface_khr: vk::SurfaceKHR,
) -> anyhow::Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .context("failed to enumerate physical devices")?
    };

    let mut candidates = devices
        .into_iter()
        .filter_map(|device| {
            let families = suitable_families(instance, surface, surface_khr, device)?;
            let props = unsafe { instance.get_physical_device_properties(device) };
            let rank = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 2,
            };
            Some((rank, device, families, props))
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(rank, ..)| *rank);

    let (_, device, families, props) = candidates
        .into_iter()
        .next()
        .context("no physical device supports the required queues, extensions and features")?;

    log::debug!(
        "Selected physical device: {:?} (queue families {:?})",
        props.device_name_as_c_str().unwrap_or(c"<unnamed>"),
        families
    );
    Ok((device, families))
}

fn suitable_families(
    instance: &ash::Instance,
    surface: &surface::Instance,
    surface_khr: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let probe = probe_queue_families(&props, |index| {
        match unsafe { surface.get_physical_device_surface_support(device, index, surface_khr) } {
            Ok(supported) => supported,
            Err(e) => {
                log::warn!("failed to query present support for queue family {index}: {e}");
                false
            }
        }
    });
    let families = probe.resolve().ok()?;

    let swapchain_adequate = match SwapchainSupportDetails::new(device, surface, surface_khr) {
        Ok(details) => !details.formats.is_empty() && !details.present_modes.is_empty(),
        Err(_) => {
            log::warn!("failed to query swapchain support details");
            false
        }
    };

    (check_device_extension_support(instance, device)
        && swapchain_adequate
        && check_device_features(instance, device))
    .then_some(families)
}

fn check_device_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features12)
        .push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    features12.timeline_semaphore == vk::TRUE
        && features12.buffer_device_address == vk::TRUE
        && features13.synchronization2 == vk::TRUE
        && features13.dynamic_rendering == vk::TRUE
}

fn check_device_extension_support(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let extension_props = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(props) => props,
        Err(e) => {
            log::warn!("Failed to enumerate device extension properties: {e}");
            return false;
        }
    };

    required_device_extensions().iter().all(|required| {
        let found = extension_props
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *required));
        if !found {
            log::warn!(
                "Required device extension not supported: {}",
                required.to_string_lossy()
            );
        }
        found
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        use vk::QueueFlags as Q;
        let families = [
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER),
            family(Q::COMPUTE | Q::TRANSFER),
            family(Q::TRANSFER),
        ];
        let resolved = probe_queue_families(&families, |_| true).resolve().unwrap();
        assert_eq!(resolved.graphics, 0);
        assert_eq!(resolved.compute, 1);
        assert_eq!(resolved.transfer, 2);
        assert_eq!(resolved.present, 0);
    }

    #[test]
    fn single_family_devices_share_everything() {
        use vk::QueueFlags as Q;
        let families = [family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER)];
        let resolved = probe_queue_families(&families, |_| true).resolve().unwrap();
        assert_eq!(resolved, QueueFamilies::unified(0));
    }

    #[test]
    fn present_falls_back_to_another_family() {
        use vk::QueueFlags as Q;
        let mut empty = family(Q::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(Q::GRAPHICS), family(Q::TRANSFER)];
        let probe = probe_queue_families(&families, |index| index == 2);
        assert_eq!(probe.graphics, Some(1));
        assert_eq!(probe.present, Some(2));
        assert!(probe.resolve().unwrap().has_dedicated_present_queue());
    }
}

use anyhow::Context;
use ash::vk;

use super::DeviceContext;

#[derive(Clone, Copy, Debug)]
pub struct SwapchainProperties {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    pub fn new(
        device: vk::PhysicalDevice,
        surface: &ash::khr::surface::Instance,
        surface_khr: vk::SurfaceKHR,
    ) -> anyhow::Result<Self> {
        let capabilities = unsafe {
            surface
                .get_physical_device_surface_capabilities(device, surface_khr)
                .context("failed to get physical device surface capabilities")?
        };

        let formats = unsafe {
            surface
                .get_physical_device_surface_formats(device, surface_khr)
                .context("failed to get physical device surface formats")?
        };

        let present_modes = unsafe {
            surface
                .get_physical_device_surface_present_modes(device, surface_khr)
                .context("failed to get physical device surface present modes")?
        };

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    pub fn ideal_properties(
        &self,
        preferred_mode: vk::PresentModeKHR,
        preferred_dimensions: [u32; 2],
    ) -> SwapchainProperties {
        SwapchainProperties {
            format: choose_surface_format(&self.formats),
            present_mode: choose_present_mode(&self.present_modes, preferred_mode),
            extent: choose_extent(self.capabilities, preferred_dimensions),
        }
    }

    pub fn image_count(&self) -> u32 {
        let max = self.capabilities.max_image_count;
        let preferred = self.capabilities.min_image_count + 1;
        if max > 0 { preferred.min(max) } else { preferred }
    }
}

fn choose_surface_format(available_formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let fallback = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    if available_formats.len() == 1 && available_formats[0].format == vk::Format::UNDEFINED {
        return fallback;
    }

    available_formats
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_UNORM
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available_formats.first())
        .copied()
        .unwrap_or(fallback)
}

/// FIFO is the only mode every implementation supports, so it backs every other preference.
fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(
    capabilities: vk::SurfaceCapabilitiesKHR,
    preferred_dimensions: [u32; 2],
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    let width = preferred_dimensions[0].min(max.width).max(min.width);
    let height = preferred_dimensions[1].min(max.height).max(min.height);
    vk::Extent2D { width, height }
}

/// A swapchain with one view per image.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub properties: SwapchainProperties,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Creates a swapchain for `surface`, retiring `old` when it is not null. Images are owned
    /// exclusively by one queue family at a time; presenting from a dedicated family goes through
    /// an ownership transfer.
    pub fn new(
        context: &DeviceContext,
        surface: vk::SurfaceKHR,
        preferred_mode: vk::PresentModeKHR,
        preferred_dimensions: [u32; 2],
        old: vk::SwapchainKHR,
    ) -> anyhow::Result<Self> {
        let details = SwapchainSupportDetails::new(
            context.physical_device,
            &context.instance.surface_instance,
            surface,
        )
        .context("failed to create swapchain support details")?;
        let properties = details.ideal_properties(preferred_mode, preferred_dimensions);
        let image_count = details.image_count();

        log::debug!(
            "Creating swapchain.\n\tFormat: {:?}\n\tColorSpace: {:?}\n\tPresentMode: {:?}\n\tExtent: {:?}\n\tImageCount: {:?}",
            properties.format.format,
            properties.format.color_space,
            properties.present_mode,
            properties.extent,
            image_count,
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(properties.format.format)
            .image_color_space(properties.format.color_space)
            .image_extent(properties.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(details.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(properties.present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe {
            context
                .swapchain_device
                .create_swapchain(&create_info, None)
                .context("failed to create swapchain")?
        };
        let mut swapchain = Self {
            handle,
            properties,
            images: Vec::new(),
            views: Vec::new(),
        };
        if let Err(e) = swapchain.create_views(context) {
            swapchain.destroy(context);
            return Err(e);
        }
        Ok(swapchain)
    }

    fn create_views(&mut self, context: &DeviceContext) -> anyhow::Result<()> {
        self.images = unsafe {
            context
                .swapchain_device
                .get_swapchain_images(self.handle)
                .context("failed to get swapchain images")?
        };
        for (index, image) in self.images.iter().enumerate() {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.properties.format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe {
                context
                    .device
                    .create_image_view(&create_info, None)
                    .context("failed to create swapchain image view")?
            };
            self.views.push(view);
            context.name_object(*image, format!("swapchain image {index}"))?;
        }
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.properties.extent
    }

    pub fn destroy(&mut self, context: &DeviceContext) {
        log::trace!("Destroying swapchain");
        unsafe {
            for view in self.views.drain(..) {
                context.device.destroy_image_view(view, None);
            }
            context
                .swapchain_device
                .destroy_swapchain(self.handle, None);
        }
        self.images.clear();
        self.handle = vk::SwapchainKHR::null();
    }
}

use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use vk_mem::Alloc;

use crate::{
    render::gpu::RenderTargets,
    vulkan::{DeviceContext, Swapchain},
};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Depth attachment matching the swapchain extent.
struct DepthTarget {
    image: vk::Image,
    allocation: vk_mem::Allocation,
    view: vk::ImageView,
}

impl DepthTarget {
    fn new(context: &DeviceContext, extent: vk::Extent2D) -> anyhow::Result<Self> {
        let ici = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let aci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe {
            context
                .allocator
                .create_image(&ici, &aci)
                .context("failed to create depth image")?
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::DEPTH)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = match unsafe { context.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { context.allocator.destroy_image(image, &mut allocation) };
                return Err(e).context("failed to create depth image view");
            }
        };
        context.name_object(image, "depth")?;

        Ok(Self {
            image,
            allocation,
            view,
        })
    }

    fn destroy(mut self, context: &DeviceContext) {
        log::trace!("Destroying depth target");
        unsafe {
            context.device.destroy_image_view(self.view, None);
            context
                .allocator
                .destroy_image(self.image, &mut self.allocation);
        }
    }
}

/// Window settings the swapchain is built from.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceSettings {
    pub present_mode: vk::PresentModeKHR,
    pub size: [u32; 2],
}

/// A window surface with its swapchain, depth attachment and one render-finished semaphore
/// per swapchain image.
pub struct PresentationSurface {
    context: Arc<DeviceContext>,
    surface: vk::SurfaceKHR,
    settings: SurfaceSettings,
    swapchain: Option<Swapchain>,
    depth: Option<DepthTarget>,
    render_finished: Vec<vk::Semaphore>,
}

impl PresentationSurface {
    /// Takes ownership of `surface`, which is destroyed with this value.
    pub fn new(
        context: Arc<DeviceContext>,
        surface: vk::SurfaceKHR,
        settings: SurfaceSettings,
    ) -> anyhow::Result<Self> {
        let mut presentation = Self {
            context,
            surface,
            settings,
            swapchain: None,
            depth: None,
            render_finished: Vec::new(),
        };
        presentation.rebuild()?;
        Ok(presentation)
    }

    pub fn set_size(&mut self, size: [u32; 2]) {
        self.settings.size = size;
    }

    /// Replaces the swapchain and everything sized from it. Waits for the device first since
    /// in-flight frames may still reference the old images.
    pub fn rebuild(&mut self) -> anyhow::Result<vk::Extent2D> {
        self.context.wait_idle()?;

        let old = self
            .swapchain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |swapchain| swapchain.handle);
        let swapchain = Swapchain::new(
            &self.context,
            self.surface,
            self.settings.present_mode,
            self.settings.size,
            old,
        )?;
        let extent = swapchain.extent();
        let image_count = swapchain.images.len();

        self.release_sized_state();
        self.swapchain = Some(swapchain);
        self.depth = Some(DepthTarget::new(&self.context, extent)?);
        for _ in 0..image_count {
            let semaphore = unsafe {
                self.context
                    .device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                    .context("failed to create render finished semaphore")?
            };
            self.render_finished.push(semaphore);
        }
        Ok(extent)
    }

    fn release_sized_state(&mut self) {
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.context.device.destroy_semaphore(semaphore, None) };
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(&self.context);
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.context);
        }
    }

    fn swapchain(&self) -> anyhow::Result<&Swapchain> {
        self.swapchain.as_ref().context("surface has no swapchain")
    }

    pub fn handle(&self) -> anyhow::Result<vk::SwapchainKHR> {
        Ok(self.swapchain()?.handle)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(vk::Extent2D::default(), Swapchain::extent)
    }

    pub fn targets(&self) -> RenderTargets {
        RenderTargets {
            color_format: self
                .swapchain
                .as_ref()
                .map_or(vk::Format::UNDEFINED, |s| s.properties.format.format),
            depth_format: DEPTH_FORMAT,
        }
    }

    pub fn image(&self, image_index: u32) -> anyhow::Result<(vk::Image, vk::ImageView)> {
        let swapchain = self.swapchain()?;
        let index = image_index as usize;
        match (swapchain.images.get(index), swapchain.views.get(index)) {
            (Some(image), Some(view)) => Ok((*image, *view)),
            _ => anyhow::bail!("swapchain image {} does not exist", image_index),
        }
    }

    pub fn depth(&self) -> anyhow::Result<(vk::Image, vk::ImageView)> {
        self.depth
            .as_ref()
            .map(|depth| (depth.image, depth.view))
            .context("surface has no depth target")
    }

    pub fn render_finished(&self, image_index: u32) -> anyhow::Result<vk::Semaphore> {
        self.render_finished
            .get(image_index as usize)
            .copied()
            .with_context(|| format!("no render finished semaphore for image {}", image_index))
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        log::trace!("Destroying presentation surface");
        self.release_sized_state();
        self.context.instance.destroy_surface(self.surface);
    }
}

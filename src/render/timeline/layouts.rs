use std::fmt;

use ash::vk;

/// Layout plus the stage/access scope an image is used with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl ImageState {
    pub const UNDEFINED: ImageState = ImageState {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::NONE,
    };

    pub const COLOR_ATTACHMENT_WRITE: ImageState = ImageState {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };

    pub const DEPTH_ATTACHMENT_WRITE: ImageState = ImageState {
        layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
    };

    pub const PRESENT: ImageState = ImageState {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.layout {
            vk::ImageLayout::UNDEFINED => "UNDEFINED",
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => "COLOR_ATTACHMENT_OPTIMAL",
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => "DEPTH_ATTACHMENT_OPTIMAL",
            vk::ImageLayout::PRESENT_SRC_KHR => "PRESENT_SRC_KHR",
            _ => "OTHER",
        };
        write!(f, "{} @ {:?} / {:?}", layout, self.stage, self.access)
    }
}

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub const DEPTH_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::DEPTH,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Layout transition, optionally one half of a queue-family ownership transfer.
pub fn image_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    from: ImageState,
    to: ImageState,
    queue_families: (u32, u32),
) -> vk::ImageMemoryBarrier2<'static> {
    let (src, dst) = queue_families;
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(range)
        .src_stage_mask(from.stage)
        .src_access_mask(from.access)
        .old_layout(from.layout)
        .dst_stage_mask(to.stage)
        .dst_access_mask(to.access)
        .new_layout(to.layout)
        .src_queue_family_index(src)
        .dst_queue_family_index(dst)
}

pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    barrier: vk::ImageMemoryBarrier2<'static>,
    debug_name: &str,
) {
    log::trace!(
        "Transition {}: {:?} -> {:?} (queue {} -> {})",
        debug_name,
        barrier.old_layout,
        barrier.new_layout,
        barrier.src_queue_family_index,
        barrier.dst_queue_family_index
    );
    let dep_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dep_info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_fields_are_carried() {
        let barrier = image_barrier(
            vk::Image::null(),
            COLOR_RANGE,
            ImageState::COLOR_ATTACHMENT_WRITE,
            ImageState::PRESENT,
            (0, 2),
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.src_queue_family_index, 0);
        assert_eq!(barrier.dst_queue_family_index, 2);
        assert!(ImageState::PRESENT.to_string().starts_with("PRESENT_SRC_KHR"));
    }
}

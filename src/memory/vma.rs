use std::{ptr::NonNull, sync::Arc, time::Duration};

use anyhow::Context;
use ash::vk;
use vk_mem::Alloc;

use crate::{
    error::RenderError,
    memory::backend::{BlockRequest, MemoryBackend, MemoryBlock, copy_mapped},
    render::{QueueFamily, timeout_nanos},
    resource::MemoryPolicy,
    vulkan::DeviceContext,
};

pub struct VmaBlock {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: u64,
    mapped: Option<NonNull<u8>>,
    address: Option<vk::DeviceAddress>,
}

impl MemoryBlock for VmaBlock {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.address
    }

    fn mapped(&self) -> Option<&[u8]> {
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) })
    }

    fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }
}

fn allocation_create_info(memory: MemoryPolicy) -> vk_mem::AllocationCreateInfo {
    use vk_mem::AllocationCreateFlags as F;

    match memory {
        MemoryPolicy::GpuLocal => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        },
        MemoryPolicy::Shared => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: F::MAPPED | F::HOST_ACCESS_SEQUENTIAL_WRITE,
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            ..Default::default()
        },
        MemoryPolicy::CpuLocal | MemoryPolicy::PushConstant => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: F::MAPPED | F::HOST_ACCESS_RANDOM,
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            ..Default::default()
        },
    }
}

/// Pooled buffer memory from the device's vk-mem allocator. Block-to-block copies that cannot be
/// done through mapped pointers are recorded into a one-shot command buffer on the graphics
/// queue and waited on for at most `timeout`.
pub struct VmaMemory {
    context: Arc<DeviceContext>,
    timeout: Duration,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    copy_fence: vk::Fence,
}

impl VmaMemory {
    pub fn new(context: Arc<DeviceContext>, timeout: Duration) -> anyhow::Result<Self> {
        let device = &context.device;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(context.families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("failed to create block copy command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let allocated = unsafe { device.allocate_command_buffers(&alloc_info) };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) };
        let (command_buffer, copy_fence) = match (allocated, fence) {
            (Ok(buffers), Ok(fence)) if !buffers.is_empty() => (buffers[0], fence),
            (_, fence) => {
                unsafe {
                    if let Ok(fence) = fence {
                        device.destroy_fence(fence, None);
                    }
                    device.destroy_command_pool(command_pool, None);
                }
                anyhow::bail!("failed to create block copy command buffer");
            }
        };

        Ok(Self {
            context,
            timeout,
            command_pool,
            command_buffer,
            copy_fence,
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    fn submit_copy(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()> {
        let device = &self.context.device;
        let cmd = self.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("failed to begin block copy")?;
            device.cmd_copy_buffer(cmd, src, dst, regions);
            device
                .end_command_buffer(cmd)
                .context("failed to end block copy")?;

            let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
            let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);
            device
                .queue_submit2(
                    self.context.queue(QueueFamily::Graphics),
                    &[submit],
                    self.copy_fence,
                )
                .map_err(|e| RenderError::from_vk(e, "block copy submit"))?;
            device
                .wait_for_fences(&[self.copy_fence], true, timeout_nanos(self.timeout))
                .map_err(|e| RenderError::from_vk(e, "block copy fence"))?;
            device
                .reset_fences(&[self.copy_fence])
                .context("failed to reset block copy fence")?;
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("failed to reset block copy command buffer")?;
        }
        Ok(())
    }
}

impl MemoryBackend for VmaMemory {
    type Block = VmaBlock;

    fn create_block(&mut self, request: &BlockRequest) -> anyhow::Result<VmaBlock> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let aci = allocation_create_info(request.memory);

        let allocator = &self.context.allocator;
        let (buffer, allocation) = unsafe {
            allocator
                .create_buffer(&buffer_info, &aci)
                .map_err(|e| RenderError::from_vk(e, "buffer allocation"))
                .with_context(|| format!("failed to allocate block {}", request.debug_name))?
        };
        let info = allocator.get_allocation_info(&allocation);
        let mapped = NonNull::new(info.mapped_data.cast::<u8>());

        let address = request
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| unsafe {
                self.context
                    .device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            });

        self.context.name_object(buffer, &request.debug_name)?;
        log::trace!(
            "Created block {} ({} bytes, {:?})",
            request.debug_name,
            request.size,
            request.memory
        );

        Ok(VmaBlock {
            buffer,
            allocation,
            size: request.size,
            mapped,
            address,
        })
    }

    fn destroy_block(&mut self, mut block: VmaBlock) {
        log::trace!("Destroying block ({} bytes)", block.size);
        unsafe {
            self.context
                .allocator
                .destroy_buffer(block.buffer, &mut block.allocation);
        }
    }

    fn copy_blocks(
        &mut self,
        src: &VmaBlock,
        dst: &mut VmaBlock,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        if copy_mapped(src, dst, regions).is_some() {
            return Ok(());
        }
        self.submit_copy(src.buffer, dst.buffer, regions)
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        self.context.wait_idle()
    }
}

impl Drop for VmaMemory {
    fn drop(&mut self) {
        log::trace!("Destroying block copy resources");
        unsafe {
            self.context.device.destroy_fence(self.copy_fence, None);
            self.context
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

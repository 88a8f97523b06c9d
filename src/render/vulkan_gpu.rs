use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use ash::vk;
use smallvec::SmallVec;

use crate::{
    error::RenderError,
    memory::{BlockRequest, MemoryBackend, VmaBlock, VmaMemory},
    render::{
        frame::CommandSlots,
        gpu::{
            AcquireOutcome, Gpu, GpuCommand, Pipeline, PipelineFactory, PresentStatus,
            RenderTargets, SemaphoreOp, SemaphoreRef, Submission, SyncPoint,
        },
        queue::{QueueFamilies, QueueFamily},
        surface::{PresentationSurface, SurfaceSettings},
        sync::timeout_nanos,
        timeline::{COLOR_RANGE, DEPTH_RANGE, ImageState, image_barrier, transition_image},
    },
    vulkan::DeviceContext,
};

/// The [`Gpu`] of one window on a Vulkan device.
pub struct VulkanGpu {
    memory: VmaMemory,
    context: Arc<DeviceContext>,
    surface: PresentationSurface,
    commands: CommandSlots,
    timelines: HashMap<SyncPoint, vk::Semaphore>,
    image_acquired: Vec<vk::Semaphore>,
    frame_timeout: Duration,
}

impl VulkanGpu {
    /// Takes ownership of `surface`.
    pub fn new(
        context: Arc<DeviceContext>,
        surface: vk::SurfaceKHR,
        settings: SurfaceSettings,
        pipeline_depth: usize,
        frame_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if !context.supports_present(surface)? {
            context.instance.destroy_surface(surface);
            return Err(RenderError::MissingQueueFamily(QueueFamily::Present))
                .context("the device cannot present to this window");
        }
        let surface = PresentationSurface::new(context.clone(), surface, settings)
            .context("failed to create presentation surface")?;
        let memory = VmaMemory::new(context.clone(), frame_timeout)?;
        let mut commands = CommandSlots::new(&context.device, context.families, pipeline_depth)?;

        let mut image_acquired = Vec::with_capacity(pipeline_depth);
        for slot in 0..pipeline_depth {
            match create_binary_semaphore(&context, slot) {
                Ok(semaphore) => image_acquired.push(semaphore),
                Err(e) => {
                    for semaphore in image_acquired {
                        unsafe { context.device.destroy_semaphore(semaphore, None) };
                    }
                    commands.destroy(&context.device);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            memory,
            context,
            surface,
            commands,
            timelines: HashMap::new(),
            image_acquired,
            frame_timeout,
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Size the next surface rebuild targets when the surface leaves the extent open.
    pub fn set_window_size(&mut self, size: [u32; 2]) {
        self.surface.set_size(size);
    }

    fn timeout_nanos(&self) -> u64 {
        timeout_nanos(self.frame_timeout)
    }

    fn timeline(&mut self, point: SyncPoint) -> anyhow::Result<vk::Semaphore> {
        if let Some(semaphore) = self.timelines.get(&point) {
            return Ok(*semaphore);
        }
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe {
            self.context
                .device
                .create_semaphore(&create_info, None)
                .context("failed to create timeline semaphore")?
        };
        self.context.name_object(
            semaphore,
            format!("{:?} slot {} @ {:?}", point.family, point.slot, point.stage),
        )?;
        self.timelines.insert(point, semaphore);
        Ok(semaphore)
    }

    fn semaphore_info(
        &mut self,
        op: &SemaphoreOp,
    ) -> anyhow::Result<vk::SemaphoreSubmitInfo<'static>> {
        let (semaphore, value) = match op.semaphore {
            SemaphoreRef::Timeline(point) => (self.timeline(point)?, op.value),
            SemaphoreRef::ImageAcquired { slot } => (
                self.image_acquired
                    .get(slot)
                    .copied()
                    .with_context(|| format!("no acquire semaphore for slot {}", slot))?,
                0,
            ),
            SemaphoreRef::RenderFinished { image_index } => {
                (self.surface.render_finished(image_index)?, 0)
            }
        };
        Ok(vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(op.stage))
    }

    fn begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        clear: Option<[f32; 4]>,
    ) -> anyhow::Result<()> {
        let device = &self.context.device;
        let (_, color_view) = self.surface.image(image_index)?;
        let (depth_image, depth_view) = self.surface.depth()?;
        let extent = self.surface.extent();

        let depth_from = if clear.is_some() {
            ImageState {
                layout: vk::ImageLayout::UNDEFINED,
                ..ImageState::DEPTH_ATTACHMENT_WRITE
            }
        } else {
            ImageState::DEPTH_ATTACHMENT_WRITE
        };
        transition_image(
            device,
            cmd,
            image_barrier(
                depth_image,
                DEPTH_RANGE,
                depth_from,
                ImageState::DEPTH_ATTACHMENT_WRITE,
                (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
            ),
            "depth",
        );

        let load_op = if clear.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear.unwrap_or_default(),
                },
            });
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        Ok(())
    }
}

fn create_binary_semaphore(context: &DeviceContext, slot: usize) -> anyhow::Result<vk::Semaphore> {
    let semaphore = unsafe {
        context
            .device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .context("failed to create image acquired semaphore")?
    };
    context.name_object(semaphore, format!("image acquired (slot {slot})"))?;
    Ok(semaphore)
}

impl MemoryBackend for VulkanGpu {
    type Block = VmaBlock;

    fn create_block(&mut self, request: &BlockRequest) -> anyhow::Result<VmaBlock> {
        self.memory.create_block(request)
    }

    fn destroy_block(&mut self, block: VmaBlock) {
        self.memory.destroy_block(block)
    }

    fn copy_blocks(
        &mut self,
        src: &VmaBlock,
        dst: &mut VmaBlock,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()> {
        self.memory.copy_blocks(src, dst, regions)
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        self.memory.drain()
    }
}

impl Gpu for VulkanGpu {
    fn queue_families(&self) -> QueueFamilies {
        self.context.families
    }

    fn surface_extent(&self) -> vk::Extent2D {
        self.surface.extent()
    }

    fn render_targets(&self) -> RenderTargets {
        self.surface.targets()
    }

    fn wait_for_slot(&mut self, slot: usize, signals: &[(SyncPoint, u64)]) -> anyhow::Result<()> {
        if !signals.is_empty() {
            let mut semaphores = SmallVec::<[vk::Semaphore; 4]>::new();
            let mut values = SmallVec::<[u64; 4]>::new();
            for (point, value) in signals {
                semaphores.push(self.timeline(*point)?);
                values.push(*value);
            }
            let wait_info = vk::SemaphoreWaitInfo::default()
                .semaphores(&semaphores)
                .values(&values);
            unsafe {
                self.context
                    .device
                    .wait_semaphores(&wait_info, self.timeout_nanos())
                    .map_err(|e| RenderError::from_vk(e, "frame slot"))?;
            }
        }
        self.commands.reset_slot(&self.context.device, slot)
    }

    fn acquire_image(&mut self, slot: usize) -> anyhow::Result<AcquireOutcome> {
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("acquire image");

        let semaphore = self
            .image_acquired
            .get(slot)
            .copied()
            .with_context(|| format!("no acquire semaphore for slot {}", slot))?;
        let result = unsafe {
            self.context.swapchain_device.acquire_next_image(
                self.surface.handle()?,
                self.timeout_nanos(),
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RenderError::from_vk(e, "swapchain image").into()),
        }
    }

    fn rebuild_surface(&mut self) -> anyhow::Result<vk::Extent2D> {
        self.surface.rebuild()
    }

    fn discard_acquire(&mut self, slot: usize) -> anyhow::Result<()> {
        self.context.wait_idle()?;
        let replacement = create_binary_semaphore(&self.context, slot)?;
        let Some(semaphore) = self.image_acquired.get_mut(slot) else {
            unsafe { self.context.device.destroy_semaphore(replacement, None) };
            anyhow::bail!("no acquire semaphore for slot {}", slot);
        };
        let old = std::mem::replace(semaphore, replacement);
        unsafe { self.context.device.destroy_semaphore(old, None) };
        log::debug!("Replaced acquire semaphore of slot {}", slot);
        Ok(())
    }

    fn begin(&mut self, family: QueueFamily, slot: usize) -> anyhow::Result<()> {
        self.commands
            .begin(&self.context.device, family, slot)
            .map(|_| ())
    }

    fn record(
        &mut self,
        family: QueueFamily,
        slot: usize,
        command: &GpuCommand,
    ) -> anyhow::Result<()> {
        let cmd = self.commands.current(family, slot)?;
        let device = &self.context.device;
        match command {
            GpuCommand::Barrier(batch) => {
                if batch.is_empty() {
                    return Ok(());
                }
                let dep_info = vk::DependencyInfo::default().buffer_memory_barriers(&batch.buffers);
                unsafe { device.cmd_pipeline_barrier2(cmd, &dep_info) };
            }
            GpuCommand::TransitionImage {
                image_index,
                from,
                to,
                src_queue_family,
                dst_queue_family,
            } => {
                let (image, _) = self.surface.image(*image_index)?;
                let barrier = image_barrier(
                    image,
                    COLOR_RANGE,
                    *from,
                    *to,
                    (*src_queue_family, *dst_queue_family),
                );
                transition_image(device, cmd, barrier, "swapchain image");
            }
            GpuCommand::CopyBuffer(batch) => unsafe {
                device.cmd_copy_buffer(cmd, batch.src, batch.dst, &batch.regions);
            },
            GpuCommand::BeginRendering { image_index, clear } => {
                self.begin_rendering(cmd, *image_index, *clear)?;
            }
            GpuCommand::EndRendering => unsafe { device.cmd_end_rendering(cmd) },
            GpuCommand::BindPipeline(pipeline) => unsafe {
                device.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
            },
            GpuCommand::BindVertexBuffer {
                binding,
                buffer,
                offset,
            } => unsafe {
                device.cmd_bind_vertex_buffers(cmd, *binding, &[*buffer], &[*offset]);
            },
            GpuCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => unsafe {
                device.cmd_bind_index_buffer(cmd, *buffer, *offset, *index_type);
            },
            GpuCommand::PushConstants {
                layout,
                stages,
                offset,
                bytes,
            } => unsafe {
                device.cmd_push_constants(cmd, *layout, *stages, *offset, bytes);
            },
            GpuCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                device.cmd_draw(
                    cmd,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                );
            },
            GpuCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                );
            },
            GpuCommand::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => unsafe {
                device.cmd_draw_indirect(cmd, *buffer, *offset, *draw_count, *stride);
            },
            GpuCommand::Dispatch { groups } => unsafe {
                device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            },
        }
        Ok(())
    }

    fn end(&mut self, family: QueueFamily, slot: usize) -> anyhow::Result<()> {
        let cmd = self.commands.current(family, slot)?;
        unsafe {
            self.context
                .device
                .end_command_buffer(cmd)
                .context("failed to end command buffer")
        }
    }

    fn submit(&mut self, submission: &Submission) -> anyhow::Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("queue submit");

        let cmd = self.commands.current(submission.family, submission.slot)?;
        let waits = submission
            .waits
            .iter()
            .map(|op| self.semaphore_info(op))
            .collect::<anyhow::Result<SmallVec<[_; 4]>>>()?;
        let signals = submission
            .signals
            .iter()
            .map(|op| self.semaphore_info(op))
            .collect::<anyhow::Result<SmallVec<[_; 4]>>>()?;
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        unsafe {
            self.context
                .device
                .queue_submit2(
                    self.context.queue(submission.family),
                    &[submit],
                    vk::Fence::null(),
                )
                .map_err(|e| RenderError::from_vk(e, "queue submit"))?;
        }
        Ok(())
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> anyhow::Result<PresentStatus> {
        let wait = [self.surface.render_finished(image_index)?];
        let swapchains = [self.surface.handle()?];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe {
            self.context
                .swapchain_device
                .queue_present(self.context.queue(QueueFamily::Present), &present_info)
        };
        match result {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(RenderError::from_vk(e, "present").into()),
        }
    }

    fn create_pipeline(&mut self, factory: &dyn PipelineFactory) -> anyhow::Result<Pipeline> {
        factory.create(&self.context.device, &self.surface.targets())
    }

    fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        log::trace!("Destroying pipeline");
        unsafe {
            self.context.device.destroy_pipeline(pipeline.pipeline, None);
            self.context
                .device
                .destroy_pipeline_layout(pipeline.layout, None);
        }
    }
}

impl Drop for VulkanGpu {
    fn drop(&mut self) {
        log::trace!("Destroying VulkanGpu");
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
        let device = &self.context.device;
        unsafe {
            for semaphore in self.image_acquired.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
            for (_, semaphore) in self.timelines.drain() {
                device.destroy_semaphore(semaphore, None);
            }
        }
        self.commands.destroy(device);
    }
}

use ash::vk;
use smallvec::SmallVec;

use crate::{
    memory::{CopyBatch, MemoryBackend},
    render::{
        queue::{QueueFamilies, QueueFamily},
        timeline::ImageState,
    },
};

/// One timeline semaphore: the counter a lane signals for a frame slot at one pipeline stage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SyncPoint {
    pub family: QueueFamily,
    pub slot: usize,
    pub stage: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SemaphoreRef {
    Timeline(SyncPoint),
    /// Binary semaphore signalled by image acquisition for a frame slot.
    ImageAcquired { slot: usize },
    /// Binary semaphore the present engine waits on for a swapchain image.
    RenderFinished { image_index: u32 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SemaphoreOp {
    pub semaphore: SemaphoreRef,
    /// Counter value for timeline semaphores, ignored for binary ones.
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub family: QueueFamily,
    pub slot: usize,
    pub waits: SmallVec<[SemaphoreOp; 4]>,
    pub signals: SmallVec<[SemaphoreOp; 4]>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentStatus {
    pub fn needs_rebuild(self) -> bool {
        self != PresentStatus::Optimal
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

/// Formats a pipeline must be compatible with to render into the window.
#[derive(Clone, Copy, Debug)]
pub struct RenderTargets {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

/// Builds a drawable's or dispatchable's pipeline object. Invoked once per window.
pub trait PipelineFactory {
    fn create(&self, device: &ash::Device, targets: &RenderTargets) -> anyhow::Result<Pipeline>;
}

#[derive(Clone, Debug, Default)]
pub struct BarrierBatch {
    pub buffers: SmallVec<[vk::BufferMemoryBarrier2<'static>; 4]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// A command appended to the command buffer of one (lane, slot).
#[derive(Clone, Debug)]
pub enum GpuCommand {
    Barrier(BarrierBatch),
    TransitionImage {
        image_index: u32,
        from: ImageState,
        to: ImageState,
        src_queue_family: u32,
        dst_queue_family: u32,
    },
    CopyBuffer(CopyBatch),
    /// Begins dynamic rendering into the swapchain image and the depth attachment, clearing
    /// both when `clear` is set and loading them otherwise.
    BeginRendering {
        image_index: u32,
        clear: Option<[f32; 4]>,
    },
    EndRendering,
    BindPipeline(Pipeline),
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: SmallVec<[u8; 128]>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
}

/// Everything the frame and timeline logic needs from a device and its window surface.
pub trait Gpu: MemoryBackend {
    fn queue_families(&self) -> QueueFamilies;

    fn surface_extent(&self) -> vk::Extent2D;

    fn render_targets(&self) -> RenderTargets;

    /// Blocks until every counter in `signals` has reached its value.
    fn wait_for_slot(&mut self, slot: usize, signals: &[(SyncPoint, u64)]) -> anyhow::Result<()>;

    fn acquire_image(&mut self, slot: usize) -> anyhow::Result<AcquireOutcome>;

    /// Recreates the swapchain and its dependent depth state; returns the new extent.
    fn rebuild_surface(&mut self) -> anyhow::Result<vk::Extent2D>;

    /// Replaces the slot's acquire semaphore after a frame that acquired an image was abandoned.
    fn discard_acquire(&mut self, slot: usize) -> anyhow::Result<()>;

    fn begin(&mut self, family: QueueFamily, slot: usize) -> anyhow::Result<()>;

    fn record(
        &mut self,
        family: QueueFamily,
        slot: usize,
        command: &GpuCommand,
    ) -> anyhow::Result<()>;

    fn end(&mut self, family: QueueFamily, slot: usize) -> anyhow::Result<()>;

    fn submit(&mut self, submission: &Submission) -> anyhow::Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<PresentStatus>;

    fn create_pipeline(&mut self, factory: &dyn PipelineFactory) -> anyhow::Result<Pipeline>;

    fn destroy_pipeline(&mut self, pipeline: Pipeline);
}

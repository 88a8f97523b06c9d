mod context;
mod frame;
mod gpu;
mod queue;
mod surface;
mod sync;
pub mod timeline;
mod vulkan_gpu;

pub use context::{FrameConfig, FrameContext, SwapchainCallback};
pub use gpu::{
    AcquireOutcome, BarrierBatch, Gpu, GpuCommand, Pipeline, PipelineFactory, PresentStatus,
    RenderTargets, SemaphoreOp, SemaphoreRef, Submission, SyncPoint,
};
pub use queue::{QueueFamilies, QueueFamily, QueueFamilyProbe};
pub use surface::{DEPTH_FORMAT, SurfaceSettings};
pub use sync::COMPLETION_STAGE;
pub(crate) use sync::timeout_nanos;
pub use timeline::{Step, Submit, Timeline, TimelineBuilder, TimelineSetup};
pub use vulkan_gpu::VulkanGpu;

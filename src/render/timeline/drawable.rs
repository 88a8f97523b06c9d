use ash::vk;

use crate::{
    memory::Segment,
    render::gpu::PipelineFactory,
    resource::{MemoryPolicy, ResourceKey},
};

/// A resolved binding handed to a drawable when it decides what to draw this frame.
#[derive(Clone, Copy, Debug)]
pub struct BoundResource {
    pub key: ResourceKey,
    pub memory: MemoryPolicy,
    pub usage: vk::BufferUsageFlags,
    pub visibility: vk::ShaderStageFlags,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub capacity: u64,
    pub address: Option<vk::DeviceAddress>,
}

impl BoundResource {
    pub fn from_segment(segment: &Segment<'_>) -> Self {
        let descriptor = segment.descriptor();
        Self {
            key: segment.key(),
            memory: descriptor.memory,
            usage: descriptor.usage,
            visibility: descriptor.visibility,
            buffer: segment.buffer(),
            offset: segment.offset(),
            size: segment.size(),
            capacity: segment.capacity(),
            address: segment.gpu_address(),
        }
    }

    /// Number of whole `T` elements currently live in the segment.
    pub fn count_of<T>(&self) -> u32 {
        (self.size / std::mem::size_of::<T>().max(1) as u64) as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawCall {
    Vertices { vertex_count: u32, instance_count: u32 },
    Indexed { index_count: u32, instance_count: u32 },
    /// Draws from the first bound `INDIRECT_BUFFER` segment.
    Indirect { draw_count: u32 },
    Skip,
}

/// Something recorded by a `Draw` step. Bindings are resolved against the current frame slot
/// and bound in declaration order: vertex buffers to consecutive bindings, the first index
/// buffer as the index buffer, push constants packed back to back.
pub trait Drawable {
    fn name(&self) -> &str;

    fn bindings(&self) -> &[ResourceKey];

    fn pipeline(&self) -> &dyn PipelineFactory;

    fn draw_call(&self, bound: &[BoundResource]) -> DrawCall;
}

/// Something recorded by a `Dispatch` step.
pub trait Dispatchable {
    fn name(&self) -> &str;

    fn bindings(&self) -> &[ResourceKey];

    fn pipeline(&self) -> &dyn PipelineFactory;

    /// Workgroup counts; any zero skips the dispatch.
    fn workgroups(&self, bound: &[BoundResource]) -> [u32; 3];
}

use ash::vk;
use smallvec::SmallVec;

use crate::{
    render::{
        gpu::BarrierBatch,
        queue::{QueueFamilies, QueueFamily},
    },
    resource::ResourceKey,
};

/// Orders accesses to buffers between a producing and a consuming pipeline stage set.
///
/// When producer and consumer run on different physical queue families the dependency is an
/// ownership transfer: it must appear once in the producer's group (the release half) and once
/// in the consumer's group (the acquire half).
#[derive(Clone, Debug)]
pub struct ResourceDependency {
    /// The lane whose command group this step is recorded into.
    pub family: QueueFamily,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub keys: SmallVec<[ResourceKey; 4]>,
}

/// How a dependency is realised on a particular device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyPlan {
    /// Producer and consumer share a lane; queue submission order and the group's semaphores
    /// already cover it.
    Elided,
    /// Different lanes on one physical family: a single barrier on the consumer side.
    Memory,
    /// Different physical families: a matched release/acquire pair.
    OwnershipTransfer { src_index: u32, dst_index: u32 },
}

/// The buffer range a dependency covers for one resource in the current slot.
#[derive(Clone, Copy, Debug)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl ResourceDependency {
    pub fn new(
        family: QueueFamily,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
        keys: impl IntoIterator<Item = ResourceKey>,
    ) -> Self {
        Self {
            family,
            src_stages: src.0,
            src_access: src.1,
            dst_stages: dst.0,
            dst_access: dst.1,
            keys: keys.into_iter().collect(),
        }
    }

    pub fn producer(&self) -> QueueFamily {
        QueueFamily::for_stages(self.src_stages)
    }

    pub fn consumer(&self) -> QueueFamily {
        QueueFamily::for_stages(self.dst_stages)
    }

    /// Whether the dependency crosses lanes at all. Intra-lane dependencies are elided.
    pub fn is_inter_command(&self) -> bool {
        self.producer() != self.consumer()
    }

    pub fn plan(&self, families: &QueueFamilies) -> DependencyPlan {
        let (producer, consumer) = (self.producer(), self.consumer());
        if producer == consumer {
            DependencyPlan::Elided
        } else if families.is_cross_family(producer, consumer) {
            DependencyPlan::OwnershipTransfer {
                src_index: families.index(producer),
                dst_index: families.index(consumer),
            }
        } else {
            DependencyPlan::Memory
        }
    }

    /// Barriers this step records into its own lane's command buffer.
    pub fn barriers(&self, families: &QueueFamilies, ranges: &[BufferRange]) -> BarrierBatch {
        let mut batch = BarrierBatch::default();
        let on_producer = self.family == self.producer();
        let on_consumer = self.family == self.consumer();

        let template = match self.plan(families) {
            DependencyPlan::Elided => return batch,
            DependencyPlan::Memory if on_consumer => vk::BufferMemoryBarrier2::default()
                .src_stage_mask(self.src_stages)
                .src_access_mask(self.src_access)
                .dst_stage_mask(self.dst_stages)
                .dst_access_mask(self.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
            DependencyPlan::Memory => return batch,
            DependencyPlan::OwnershipTransfer {
                src_index,
                dst_index,
            } => {
                let barrier = vk::BufferMemoryBarrier2::default()
                    .src_queue_family_index(src_index)
                    .dst_queue_family_index(dst_index);
                if on_producer {
                    barrier
                        .src_stage_mask(self.src_stages)
                        .src_access_mask(self.src_access)
                } else if on_consumer {
                    barrier
                        .dst_stage_mask(self.dst_stages)
                        .dst_access_mask(self.dst_access)
                } else {
                    return batch;
                }
            }
        };

        batch.buffers.extend(ranges.iter().map(|range| {
            template
                .buffer(range.buffer)
                .offset(range.offset)
                .size(range.size)
        }));
        batch
    }
}

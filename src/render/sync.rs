use std::{collections::HashMap, time::Duration};

use ash::vk;
use smallvec::SmallVec;

use crate::render::{gpu::SyncPoint, queue::QueueFamily};

/// Stage every submission signals in addition to its requested stages, so waiting on it
/// retires all of the submission's work.
pub const COMPLETION_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::ALL_COMMANDS;

/// Last value handed out for every timeline semaphore of a frame context.
#[derive(Default, Debug)]
pub struct SyncCounters {
    values: HashMap<SyncPoint, u64>,
}

impl SyncCounters {
    pub fn current(&self, point: SyncPoint) -> u64 {
        self.values.get(&point).copied().unwrap_or(0)
    }

    pub fn next(&self, point: SyncPoint) -> u64 {
        self.current(point) + 1
    }

    /// Records that `point` will reach `value`; only called once the signalling submission was
    /// accepted by the queue.
    pub fn commit(&mut self, point: SyncPoint, value: u64) {
        let entry = self.values.entry(point).or_insert(0);
        *entry = (*entry).max(value);
    }

    /// Completion counters a CPU wait must observe before `slot` is reused.
    pub fn slot_completion(&self, slot: usize) -> SmallVec<[(SyncPoint, u64); 4]> {
        let mut signals = self
            .values
            .iter()
            .filter(|(point, _)| point.slot == slot && point.stage == COMPLETION_STAGE)
            .map(|(point, value)| (*point, *value))
            .collect::<SmallVec<[(SyncPoint, u64); 4]>>();
        signals.sort_by_key(|(point, _)| point.family);
        signals
    }
}

/// Individual stage bits of `mask` plus the completion stage, lowest bit first.
pub fn signal_stages(mask: vk::PipelineStageFlags2) -> SmallVec<[vk::PipelineStageFlags2; 4]> {
    let raw = mask.as_raw();
    let mut stages = (0..64)
        .map(|bit| 1u64 << bit)
        .filter(|bit| raw & bit != 0)
        .map(vk::PipelineStageFlags2::from_raw)
        .filter(|stage| *stage != COMPLETION_STAGE)
        .collect::<SmallVec<[vk::PipelineStageFlags2; 4]>>();
    stages.push(COMPLETION_STAGE);
    stages
}

/// Position of a single stage bit in logical pipeline order. Stages that span the whole
/// pipeline sort last.
pub fn stage_order(stage: vk::PipelineStageFlags2) -> u8 {
    use vk::PipelineStageFlags2 as S;
    const ORDER: [vk::PipelineStageFlags2; 8] = [
        S::from_raw(
            S::TOP_OF_PIPE.as_raw()
                | S::HOST.as_raw()
                | S::TRANSFER.as_raw()
                | S::COPY.as_raw()
                | S::BLIT.as_raw()
                | S::RESOLVE.as_raw()
                | S::CLEAR.as_raw(),
        ),
        S::from_raw(S::DRAW_INDIRECT.as_raw() | S::COMPUTE_SHADER.as_raw()),
        S::from_raw(
            S::VERTEX_INPUT.as_raw() | S::INDEX_INPUT.as_raw() | S::VERTEX_ATTRIBUTE_INPUT.as_raw(),
        ),
        S::from_raw(
            S::VERTEX_SHADER.as_raw()
                | S::TESSELLATION_CONTROL_SHADER.as_raw()
                | S::TESSELLATION_EVALUATION_SHADER.as_raw()
                | S::GEOMETRY_SHADER.as_raw()
                | S::PRE_RASTERIZATION_SHADERS.as_raw(),
        ),
        S::EARLY_FRAGMENT_TESTS,
        S::FRAGMENT_SHADER,
        S::LATE_FRAGMENT_TESTS,
        S::COLOR_ATTACHMENT_OUTPUT,
    ];
    ORDER
        .iter()
        .position(|group| group.contains(stage))
        .map_or(ORDER.len() as u8, |position| position as u8)
}

/// Latest [`stage_order`] among the bits of `mask`.
pub fn latest_stage_order(mask: vk::PipelineStageFlags2) -> u8 {
    let raw = mask.as_raw();
    (0..64)
        .map(|bit| 1u64 << bit)
        .filter(|bit| raw & bit != 0)
        .map(|bit| stage_order(vk::PipelineStageFlags2::from_raw(bit)))
        .max()
        .unwrap_or(0)
}

/// Nanoseconds for a Vulkan wait, saturating at the no-timeout value.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

pub fn sync_point(family: QueueFamily, slot: usize, stage: vk::PipelineStageFlags2) -> SyncPoint {
    SyncPoint {
        family,
        slot,
        stage,
    }
}

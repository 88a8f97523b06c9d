use ash::vk;
use smallvec::SmallVec;

use crate::{
    error::RenderError,
    render::{
        gpu::{SemaphoreOp, SemaphoreRef, Submission},
        queue::QueueFamily,
        sync::{COMPLETION_STAGE, latest_stage_order, stage_order},
        timeline::layouts::ImageState,
    },
};

/// Transient per-frame state threaded through every step executor.
#[derive(Debug)]
pub struct TimelineState {
    pub(crate) frame: u64,
    pub(crate) slot: usize,
    image_index: Option<u32>,
    acquire_pending: bool,
    presented: bool,
    recording: Option<QueueFamily>,
    rendering: bool,
    image: ImageState,
    image_written_in_group: bool,
    /// Layout the image was released from towards the present lane, until acquired there.
    pending_release: Option<vk::ImageLayout>,
    /// Timeline signals made by groups already submitted this frame, one entry per submission.
    signalled: SmallVec<[SmallVec<[SemaphoreOp; 4]>; 4]>,
    /// Buffers written by copies recorded this frame.
    transferred: SmallVec<[vk::Buffer; 4]>,
}

impl TimelineState {
    pub fn new(frame: u64, slot: usize) -> Self {
        Self {
            frame,
            slot,
            image_index: None,
            acquire_pending: false,
            presented: false,
            recording: None,
            rendering: false,
            image: ImageState::UNDEFINED,
            image_written_in_group: false,
            pending_release: None,
            signalled: SmallVec::new(),
            transferred: SmallVec::new(),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn require_image(&self, step: usize) -> Result<u32, RenderError> {
        self.image_index.ok_or_else(|| {
            RenderError::InvalidTimeline(format!("step {} needs an acquired image", step))
        })
    }

    pub(crate) fn image_acquired(&mut self, image_index: u32) {
        self.image_index = Some(image_index);
        self.acquire_pending = true;
        self.image = ImageState::UNDEFINED;
    }

    /// Whether the acquire semaphore still has to be waited on by a submission.
    pub fn acquire_pending(&self) -> bool {
        self.acquire_pending
    }

    pub fn presented(&self) -> bool {
        self.presented
    }

    pub(crate) fn mark_presented(&mut self) {
        self.presented = true;
    }

    pub fn recording(&self) -> Option<QueueFamily> {
        self.recording
    }

    pub(crate) fn begin_recording(&mut self, family: QueueFamily) {
        self.recording = Some(family);
        self.image_written_in_group = false;
    }

    pub(crate) fn end_recording(&mut self) {
        self.recording = None;
        self.rendering = false;
    }

    /// Fails unless `family` is the lane currently recording.
    pub fn expect_recording(&self, step: usize, family: QueueFamily) -> Result<(), RenderError> {
        if self.recording == Some(family) {
            Ok(())
        } else {
            Err(RenderError::RecordingState {
                step,
                expected: Some(family),
                found: self.recording,
            })
        }
    }

    pub fn rendering(&self) -> bool {
        self.rendering
    }

    pub(crate) fn set_rendering(&mut self, rendering: bool) {
        self.rendering = rendering;
    }

    pub fn image_state(&self) -> ImageState {
        self.image
    }

    pub(crate) fn set_image_state(&mut self, state: ImageState) {
        self.image = state;
        self.image_written_in_group = true;
    }

    pub(crate) fn set_pending_release(&mut self, layout: vk::ImageLayout) {
        self.pending_release = Some(layout);
    }

    pub(crate) fn take_pending_release(&mut self) -> Option<vk::ImageLayout> {
        self.pending_release.take()
    }

    pub fn signalled(&self) -> impl Iterator<Item = &SemaphoreOp> {
        self.signalled.iter().flatten()
    }

    pub(crate) fn note_transfer(&mut self, buffer: vk::Buffer) {
        if !self.transferred.contains(&buffer) {
            self.transferred.push(buffer);
        }
    }

    /// Whether a copy recorded earlier this frame wrote into `buffer`.
    pub fn was_transferred(&self, buffer: vk::Buffer) -> bool {
        self.transferred.contains(&buffer)
    }

    /// Notes what a successful submission consumed: its timeline signals become waits for later
    /// groups and a waited acquire semaphore is no longer pending.
    pub(crate) fn record_submission(&mut self, submission: &Submission) {
        let signals = submission
            .signals
            .iter()
            .filter(|op| matches!(op.semaphore, SemaphoreRef::Timeline(_)))
            .copied()
            .collect::<SmallVec<[SemaphoreOp; 4]>>();
        if !signals.is_empty() {
            self.signalled.push(signals);
        }
        if submission
            .waits
            .iter()
            .any(|op| matches!(op.semaphore, SemaphoreRef::ImageAcquired { .. }))
        {
            self.acquire_pending = false;
        }
    }

    /// Waits a submission needs: one signal of every earlier group of this frame, plus the
    /// acquire semaphore when this group is the first to touch the image.
    ///
    /// From each earlier group the latest declared stage signal that runs no later in the
    /// pipeline than `wait_for` is waited on. Groups without such a signal, and every group when
    /// `wait_for` is empty, are waited on through their completion signal.
    pub(crate) fn waits(
        &self,
        wait_for: vk::PipelineStageFlags2,
        present: bool,
    ) -> SmallVec<[SemaphoreOp; 4]> {
        let stage = if wait_for.is_empty() {
            vk::PipelineStageFlags2::ALL_COMMANDS
        } else {
            wait_for
        };

        let mut waits = self
            .signalled
            .iter()
            .filter_map(|signals| wait_target(signals, wait_for))
            .map(|op| SemaphoreOp { stage, ..*op })
            .collect::<SmallVec<[SemaphoreOp; 4]>>();

        let touches_image = self.image_written_in_group
            || present
            || wait_for.contains(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        if self.acquire_pending && touches_image {
            waits.push(SemaphoreOp {
                semaphore: SemaphoreRef::ImageAcquired { slot: self.slot },
                value: 0,
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            });
        }
        waits
    }
}

fn wait_target(
    signals: &[SemaphoreOp],
    wait_for: vk::PipelineStageFlags2,
) -> Option<&SemaphoreOp> {
    let completion = signals
        .iter()
        .find(|op| op.stage == COMPLETION_STAGE)
        .or(signals.last());
    if wait_for.is_empty() || wait_for.contains(COMPLETION_STAGE) {
        return completion;
    }

    let limit = latest_stage_order(wait_for);
    signals
        .iter()
        .filter(|op| op.stage != COMPLETION_STAGE && stage_order(op.stage) <= limit)
        .max_by_key(|op| stage_order(op.stage))
        .or(completion)
}

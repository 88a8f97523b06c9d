use std::sync::Arc;

use anyhow::Context;
use ash::vk;
#[cfg(feature = "tracing")]
use tracy_client::frame_mark;

use crate::{
    error::RenderError,
    memory::{CopyBatch, ResourceArena, Segment, SegmentMut},
    render::{
        gpu::{AcquireOutcome, Gpu, SemaphoreRef, Submission},
        queue::QueueFamilies,
        sync::SyncCounters,
        timeline::TimelineState,
    },
    resource::{ResourceKey, ResourceTable},
};

/// Attempts at acquiring an image before a frame gives up on an unstable surface.
const ACQUIRE_ATTEMPTS: usize = 3;

pub type SwapchainCallback = Box<dyn FnMut(vk::Extent2D)>;

#[derive(Clone, Copy, Debug)]
pub struct FrameConfig {
    pub pipeline_depth: usize,
    pub clear_color: [f32; 4],
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Per-window state that lives for the whole session: the resource segments, the frame
/// counter and the synchronisation counters of every frame slot.
pub struct FrameContext<G: Gpu> {
    gpu: G,
    resources: ResourceArena<G::Block>,
    config: FrameConfig,
    frame_count: u64,
    counters: SyncCounters,
    extent: vk::Extent2D,
    callbacks: Vec<SwapchainCallback>,
    surface_stale: bool,
    slot_ready: bool,
}

impl<G: Gpu> FrameContext<G> {
    pub fn new(mut gpu: G, table: Arc<ResourceTable>, config: FrameConfig) -> anyhow::Result<Self> {
        if !(1..=3).contains(&config.pipeline_depth) {
            return Err(RenderError::InvalidConfig(format!(
                "pipeline depth {} is outside 1..=3",
                config.pipeline_depth
            ))
            .into());
        }

        let resources = ResourceArena::new(&mut gpu, table, config.pipeline_depth)
            .context("failed to create resource arena")?;
        let extent = gpu.surface_extent();
        log::debug!(
            "Created frame context: depth {}, {} resources, {}x{}",
            config.pipeline_depth,
            resources.table().len(),
            extent.width,
            extent.height
        );

        Ok(Self {
            gpu,
            resources,
            config,
            frame_count: 0,
            counters: SyncCounters::default(),
            extent,
            callbacks: Vec::new(),
            surface_stale: false,
            slot_ready: false,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Buffer slot of the current frame, `frame_count % pipeline_depth`.
    pub fn frame_index(&self) -> usize {
        (self.frame_count % self.config.pipeline_depth as u64) as usize
    }

    pub fn pipeline_depth(&self) -> usize {
        self.config.pipeline_depth
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.config.clear_color
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.gpu.queue_families()
    }

    pub fn has_dedicated_present_queue(&self) -> bool {
        self.gpu.queue_families().has_dedicated_present_queue()
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn resources(&self) -> &ResourceArena<G::Block> {
        &self.resources
    }

    pub(crate) fn counters(&self) -> &SyncCounters {
        &self.counters
    }

    pub fn is_surface_stale(&self) -> bool {
        self.surface_stale
    }

    /// Registers a callback run with the new extent every time the swapchain is rebuilt.
    pub fn on_swapchain_updated(&mut self, callback: impl FnMut(vk::Extent2D) + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// The current frame's view of `key`.
    pub fn segment(&self, key: ResourceKey) -> anyhow::Result<Segment<'_>> {
        self.resources.segment(key, self.frame_index())
    }

    pub fn segment_mut(&mut self, key: ResourceKey) -> anyhow::Result<SegmentMut<'_, G>> {
        let slot = self.frame_index();
        self.resources.segment_mut(&mut self.gpu, key, slot)
    }

    /// Resolves a device-side copy between two segments of the current frame.
    pub fn copy(
        &mut self,
        src: ResourceKey,
        dst: ResourceKey,
        size: u64,
        offsets: (u64, u64),
    ) -> anyhow::Result<CopyBatch> {
        let slot = self.frame_index();
        self.resources.copy_between(src, dst, slot, size, offsets)
    }

    pub fn commit_transfers(&mut self) -> anyhow::Result<Vec<CopyBatch>> {
        let slot = self.frame_index();
        self.resources.commit_transfers(&mut self.gpu, slot)
    }

    /// Waits until the GPU has finished everything submitted against the current slot, after
    /// which the slot's segments may be written. Waits at most once per frame.
    pub fn wait_for_slot(&mut self) -> anyhow::Result<()> {
        if self.slot_ready {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("wait for frame slot");

        let slot = self.frame_index();
        let signals = self.counters.slot_completion(slot);
        self.gpu
            .wait_for_slot(slot, &signals)
            .with_context(|| format!("failed to wait for frame slot {}", slot))?;
        self.slot_ready = true;
        Ok(())
    }

    pub fn begin_frame(&mut self) -> anyhow::Result<TimelineState> {
        self.wait_for_slot()?;
        Ok(TimelineState::new(self.frame_count, self.frame_index()))
    }

    /// Acquires the next presentable image, rebuilding the surface first when it is stale and
    /// again whenever acquisition reports it out of date or suboptimal.
    pub fn acquire_image(&mut self) -> anyhow::Result<u32> {
        let slot = self.frame_index();
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            if self.surface_stale {
                self.rebuild_surface()?;
            }

            match self
                .gpu
                .acquire_image(slot)
                .context("failed to acquire swapchain image")?
            {
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                } => return Ok(image_index),
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: true,
                } if attempt == ACQUIRE_ATTEMPTS => {
                    log::warn!("Surface still suboptimal after rebuilding, rendering anyway");
                    self.surface_stale = true;
                    return Ok(image_index);
                }
                AcquireOutcome::Acquired { .. } => {
                    log::debug!("Acquired a suboptimal image, rebuilding surface");
                    self.gpu
                        .discard_acquire(slot)
                        .context("failed to release suboptimal acquire")?;
                    self.surface_stale = true;
                }
                AcquireOutcome::OutOfDate => {
                    log::debug!("Surface out of date, rebuilding");
                    self.surface_stale = true;
                }
            }
        }
        Err(RenderError::from_vk(vk::Result::ERROR_OUT_OF_DATE_KHR, "a stable surface").into())
    }

    /// Recreates the surface state and notifies every swapchain callback once.
    pub fn rebuild_surface(&mut self) -> anyhow::Result<()> {
        let extent = self
            .gpu
            .rebuild_surface()
            .context("failed to rebuild surface")?;
        self.extent = extent;
        self.surface_stale = false;
        log::debug!("Surface rebuilt at {}x{}", extent.width, extent.height);
        for callback in &mut self.callbacks {
            callback(extent);
        }
        Ok(())
    }

    /// Marks the surface for rebuilding before the next acquisition, e.g. after a resize.
    pub fn invalidate_surface(&mut self) {
        self.surface_stale = true;
    }

    pub(crate) fn submit(&mut self, submission: &Submission) -> anyhow::Result<()> {
        self.gpu
            .submit(submission)
            .with_context(|| format!("failed to submit {:?} work", submission.family))?;
        for signal in &submission.signals {
            if let SemaphoreRef::Timeline(point) = signal.semaphore {
                self.counters.commit(point, signal.value);
            }
        }
        Ok(())
    }

    pub(crate) fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<()> {
        let status = self
            .gpu
            .present(slot, image_index)
            .context("failed to present")?;
        if status.needs_rebuild() {
            log::debug!("Present reported {:?}, rebuilding on next acquire", status);
            self.surface_stale = true;
        }
        Ok(())
    }

    pub(crate) fn end_frame(&mut self, _state: &TimelineState) {
        self.frame_count += 1;
        self.slot_ready = false;
        #[cfg(feature = "tracing")]
        frame_mark();
    }

    /// Cleans up after a frame that failed part-way, leaving the context usable.
    pub(crate) fn abort_frame(&mut self, state: &TimelineState) {
        if let Some(family) = state.recording() {
            if let Err(e) = self.gpu.end(family, state.slot()) {
                log::warn!("Failed to close {:?} recording of aborted frame: {:#}", family, e);
            }
        }
        if state.acquire_pending() {
            if let Err(e) = self.gpu.discard_acquire(state.slot()) {
                log::warn!("Failed to discard acquire of aborted frame: {:#}", e);
            }
        }
        if state.image_index().is_some() && !state.presented() {
            self.surface_stale = true;
        }
        self.frame_count += 1;
        self.slot_ready = false;
    }

    /// Blocks until the device is idle.
    pub fn wait_idle(&mut self) -> anyhow::Result<()> {
        self.gpu.drain()
    }
}

impl<G: Gpu> Drop for FrameContext<G> {
    fn drop(&mut self) {
        log::trace!("Destroying FrameContext");
        if let Err(e) = self.gpu.drain() {
            log::error!("Failed to drain device before destroying frame context: {:#}", e);
        }
        self.resources.release(&mut self.gpu);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        error::render_error,
        render::{PresentStatus, QueueFamily},
        resource::ResourceDescriptor,
        testing::ScriptedGpu,
    };

    const VIEW: ResourceKey = ResourceKey::new(1);
    const VERTICES: ResourceKey = ResourceKey::new(2);

    fn table() -> Arc<ResourceTable> {
        Arc::new(
            ResourceTable::builder()
                .declare(
                    VIEW,
                    ResourceDescriptor::push_constant(8, ash::vk::ShaderStageFlags::VERTEX),
                )
                .declare(
                    VERTICES,
                    ResourceDescriptor::shared(ash::vk::BufferUsageFlags::VERTEX_BUFFER, 64)
                        .multi(),
                )
                .build()
                .unwrap(),
        )
    }

    fn context(gpu: ScriptedGpu) -> FrameContext<ScriptedGpu> {
        FrameContext::new(gpu, table(), FrameConfig::default()).unwrap()
    }

    #[test]
    fn frame_index_cycles_through_slots() {
        let mut frame = context(ScriptedGpu::unified());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let state = frame.begin_frame().unwrap();
            seen.push(frame.frame_index());
            frame.end_frame(&state);
        }
        assert_eq!(seen, vec![0, 1, 0]);
        assert_eq!(frame.frame_count(), 3);
    }

    #[test]
    fn invalid_depth_is_a_configuration_error() {
        let config = FrameConfig {
            pipeline_depth: 4,
            ..Default::default()
        };
        let err = FrameContext::new(ScriptedGpu::unified(), table(), config)
            .err()
            .unwrap();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn suboptimal_acquire_rebuilds_and_notifies_once() {
        let mut gpu = ScriptedGpu::unified();
        gpu.acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 0,
            suboptimal: true,
        });
        gpu.acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: false,
        });
        let mut frame = context(gpu);

        let observed = Rc::new(RefCell::new(Vec::new()));
        let sink = observed.clone();
        frame.on_swapchain_updated(move |extent| sink.borrow_mut().push(extent.width));
        frame.gpu_mut().extent = vk::Extent2D {
            width: 800,
            height: 600,
        };

        assert_eq!(frame.acquire_image().unwrap(), 1);
        assert_eq!(observed.borrow().as_slice(), &[800]);
        assert_eq!(frame.extent().height, 600);
        assert_eq!(frame.gpu().rebuilds, 1);
        assert_eq!(frame.gpu().discarded_acquires, 1);
        assert!(!frame.is_surface_stale());
    }

    #[test]
    fn out_of_date_present_defers_rebuild_to_next_acquire() {
        let mut gpu = ScriptedGpu::unified();
        gpu.present_script.push_back(PresentStatus::OutOfDate);
        let mut frame = context(gpu);

        frame.present(0, 0).unwrap();
        assert!(frame.is_surface_stale());
        assert_eq!(frame.gpu().rebuilds, 0);

        frame.acquire_image().unwrap();
        assert_eq!(frame.gpu().rebuilds, 1);
    }

    #[test]
    fn slot_wait_covers_committed_completion_signals() {
        use crate::render::{
            gpu::SemaphoreOp,
            sync::{COMPLETION_STAGE, sync_point},
        };

        let mut frame = context(ScriptedGpu::unified());
        let point = sync_point(QueueFamily::Graphics, 0, COMPLETION_STAGE);
        frame
            .submit(&Submission {
                family: QueueFamily::Graphics,
                slot: 0,
                waits: Default::default(),
                signals: smallvec::smallvec![SemaphoreOp {
                    semaphore: SemaphoreRef::Timeline(point),
                    value: 1,
                    stage: COMPLETION_STAGE,
                }],
            })
            .unwrap();

        for _ in 0..3 {
            let state = frame.begin_frame().unwrap();
            frame.end_frame(&state);
        }
        let waits = &frame.gpu().slot_waits;
        assert_eq!(waits[0].1, vec![(point, 1)]);
        assert!(waits[1].1.is_empty());
        assert_eq!(waits[2].1, vec![(point, 1)]);
    }

    #[test]
    fn early_slot_wait_is_not_repeated_by_begin_frame() {
        let mut frame = context(ScriptedGpu::unified());
        frame.wait_for_slot().unwrap();
        let state = frame.begin_frame().unwrap();
        frame.end_frame(&state);
        assert_eq!(frame.gpu().slot_waits.len(), 1);

        let state = frame.begin_frame().unwrap();
        frame.end_frame(&state);
        assert_eq!(frame.gpu().slot_waits.len(), 2);
        assert_eq!(frame.gpu().slot_waits[1].0, 1);
    }

    #[test]
    fn segments_follow_the_frame_slot() {
        let mut frame = context(ScriptedGpu::unified());
        frame
            .segment_mut(VERTICES)
            .unwrap()
            .push_back(&[1.0f32, 2.0])
            .unwrap();
        assert_eq!(frame.segment(VERTICES).unwrap().size(), 8);

        let state = frame.begin_frame().unwrap();
        frame.end_frame(&state);
        assert!(frame.segment(VERTICES).unwrap().is_empty());
    }
}

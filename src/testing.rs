//! Host-only stand-ins for the device, used by unit tests.

use std::collections::VecDeque;

use ash::vk::{self, Handle};

use crate::{
    error::RenderError,
    memory::{BlockRequest, MemoryBackend, MemoryBlock},
    render::{
        AcquireOutcome, Gpu, GpuCommand, Pipeline, PipelineFactory, PresentStatus, QueueFamilies,
        QueueFamily, RenderTargets, Submission, SyncPoint,
    },
};

pub struct HostBlock {
    id: u64,
    storage: Vec<u64>,
    size: u64,
    host_visible: bool,
}

impl HostBlock {
    /// Contents regardless of host visibility.
    pub fn contents(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.storage)[..self.size as usize]
    }

    fn contents_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.storage)[..self.size as usize]
    }
}

impl MemoryBlock for HostBlock {
    fn buffer(&self) -> vk::Buffer {
        vk::Buffer::from_raw(self.id)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> Option<vk::DeviceAddress> {
        Some(self.id << 32)
    }

    fn mapped(&self) -> Option<&[u8]> {
        self.host_visible.then(|| self.contents())
    }

    fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        if self.host_visible {
            Some(self.contents_mut())
        } else {
            None
        }
    }
}

/// Memory backend whose blocks live in host vectors.
#[derive(Default)]
pub struct HostMemory {
    next_id: u64,
    live: usize,
    fail_next: bool,
    drains: usize,
}

impl HostMemory {
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    pub fn drains(&self) -> usize {
        self.drains
    }

    pub fn fail_next_allocation(&mut self) {
        self.fail_next = true;
    }
}

impl MemoryBackend for HostMemory {
    type Block = HostBlock;

    fn create_block(&mut self, request: &BlockRequest) -> anyhow::Result<HostBlock> {
        if std::mem::take(&mut self.fail_next) {
            return Err(RenderError::OutOfDeviceMemory.into());
        }
        self.next_id += 1;
        self.live += 1;
        Ok(HostBlock {
            id: self.next_id,
            storage: vec![0; request.size.div_ceil(8) as usize],
            size: request.size,
            host_visible: request.memory.is_host_visible(),
        })
    }

    fn destroy_block(&mut self, _block: HostBlock) {
        self.live -= 1;
    }

    fn copy_blocks(
        &mut self,
        src: &HostBlock,
        dst: &mut HostBlock,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()> {
        let from = src.contents();
        let to = dst.contents_mut();
        for region in regions {
            let (s, d, n) = (
                region.src_offset as usize,
                region.dst_offset as usize,
                region.size as usize,
            );
            to[d..d + n].copy_from_slice(&from[s..s + n]);
        }
        Ok(())
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        self.drains += 1;
        Ok(())
    }
}

/// Device stand-in that records everything the frame logic asks of it.
pub struct ScriptedGpu {
    pub memory: HostMemory,
    pub families: QueueFamilies,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub acquire_script: VecDeque<AcquireOutcome>,
    pub present_script: VecDeque<PresentStatus>,
    pub fail_submit: Option<QueueFamily>,
    pub commands: Vec<(QueueFamily, usize, GpuCommand)>,
    pub submissions: Vec<Submission>,
    pub presents: Vec<(usize, u32)>,
    pub slot_waits: Vec<(usize, Vec<(SyncPoint, u64)>)>,
    pub recording: Vec<(QueueFamily, usize)>,
    pub rebuilds: usize,
    pub discarded_acquires: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    next_image: u32,
}

impl ScriptedGpu {
    pub fn new(families: QueueFamilies) -> Self {
        Self {
            memory: HostMemory::default(),
            families,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            image_count: 3,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            fail_submit: None,
            commands: Vec::new(),
            submissions: Vec::new(),
            presents: Vec::new(),
            slot_waits: Vec::new(),
            recording: Vec::new(),
            rebuilds: 0,
            discarded_acquires: 0,
            pipelines_created: 0,
            pipelines_destroyed: 0,
            next_image: 0,
        }
    }

    pub fn unified() -> Self {
        Self::new(QueueFamilies::unified(0))
    }

    /// Commands recorded for `family`, in order.
    pub fn commands_on(&self, family: QueueFamily) -> Vec<&GpuCommand> {
        self.commands
            .iter()
            .filter(|(f, _, _)| *f == family)
            .map(|(_, _, command)| command)
            .collect()
    }
}

impl MemoryBackend for ScriptedGpu {
    type Block = HostBlock;

    fn create_block(&mut self, request: &BlockRequest) -> anyhow::Result<HostBlock> {
        self.memory.create_block(request)
    }

    fn destroy_block(&mut self, block: HostBlock) {
        self.memory.destroy_block(block)
    }

    fn copy_blocks(
        &mut self,
        src: &HostBlock,
        dst: &mut HostBlock,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()> {
        self.memory.copy_blocks(src, dst, regions)
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        self.memory.drain()
    }
}

impl Gpu for ScriptedGpu {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn surface_extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn render_targets(&self) -> RenderTargets {
        RenderTargets {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }

    fn wait_for_slot(&mut self, slot: usize, signals: &[(SyncPoint, u64)]) -> anyhow::Result<()> {
        self.slot_waits.push((slot, signals.to_vec()));
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> anyhow::Result<AcquireOutcome> {
        if let Some(outcome) = self.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn rebuild_surface(&mut self) -> anyhow::Result<vk::Extent2D> {
        self.rebuilds += 1;
        Ok(self.extent)
    }

    fn discard_acquire(&mut self, _slot: usize) -> anyhow::Result<()> {
        self.discarded_acquires += 1;
        Ok(())
    }

    fn begin(&mut self, family: QueueFamily, slot: usize) -> anyhow::Result<()> {
        self.recording.push((family, slot));
        Ok(())
    }

    fn record(
        &mut self,
        family: QueueFamily,
        slot: usize,
        command: &GpuCommand,
    ) -> anyhow::Result<()> {
        self.commands.push((family, slot, command.clone()));
        Ok(())
    }

    fn end(&mut self, _family: QueueFamily, _slot: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn submit(&mut self, submission: &Submission) -> anyhow::Result<()> {
        if self.fail_submit == Some(submission.family) {
            return Err(RenderError::DeviceLost.into());
        }
        self.submissions.push(submission.clone());
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<PresentStatus> {
        self.presents.push((slot, image_index));
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentStatus::Optimal))
    }

    fn create_pipeline(&mut self, _factory: &dyn PipelineFactory) -> anyhow::Result<Pipeline> {
        self.pipelines_created += 1;
        Ok(Pipeline {
            pipeline: vk::Pipeline::from_raw(self.pipelines_created as u64),
            layout: vk::PipelineLayout::from_raw(self.pipelines_created as u64),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    fn destroy_pipeline(&mut self, _pipeline: Pipeline) {
        self.pipelines_destroyed += 1;
    }
}

/// A factory the scripted device never calls into.
pub struct NullPipeline;

impl PipelineFactory for NullPipeline {
    fn create(&self, _device: &ash::Device, _targets: &RenderTargets) -> anyhow::Result<Pipeline> {
        Ok(Pipeline {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }
}

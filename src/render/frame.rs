use anyhow::Context;
use ash::vk;

use crate::render::queue::{QueueFamilies, QueueFamily};

/// Command buffers one lane records into during one frame slot. A lane may record several
/// command groups per frame, so buffers are handed out from a cursor that is rewound once the
/// slot's previous frame has completed.
struct LaneCommands {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    used: usize,
}

impl LaneCommands {
    fn new(device: &ash::Device, queue_family: u32) -> anyhow::Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("failed to create command pool")?
        };
        Ok(Self {
            pool,
            buffers: Vec::new(),
            used: 0,
        })
    }

    fn next(&mut self, device: &ash::Device) -> anyhow::Result<vk::CommandBuffer> {
        if self.used == self.buffers.len() {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let allocated = unsafe {
                device
                    .allocate_command_buffers(&alloc_info)
                    .context("failed to allocate command buffer")?
            };
            self.buffers.extend(allocated);
        }
        let buffer = self
            .buffers
            .get(self.used)
            .copied()
            .context("command pool returned no buffer")?;
        self.used += 1;
        Ok(buffer)
    }

    fn current(&self) -> Option<vk::CommandBuffer> {
        self.used.checked_sub(1).map(|index| self.buffers[index])
    }
}

/// Every lane's command buffers for every frame slot.
pub struct CommandSlots {
    slots: Vec<[LaneCommands; 4]>,
}

impl CommandSlots {
    pub fn new(
        device: &ash::Device,
        families: QueueFamilies,
        pipeline_depth: usize,
    ) -> anyhow::Result<Self> {
        let mut commands = Self { slots: Vec::new() };
        for _ in 0..pipeline_depth {
            let lanes = QueueFamily::ALL.map(|family| LaneCommands::new(device, families.index(family)));
            match collect_lanes(lanes) {
                Ok(lanes) => commands.slots.push(lanes),
                Err((e, created)) => {
                    for lane in created {
                        unsafe { device.destroy_command_pool(lane.pool, None) };
                    }
                    commands.destroy(device);
                    return Err(e);
                }
            }
        }
        Ok(commands)
    }

    /// Rewinds the slot; only valid once all of its submitted work has completed.
    pub fn reset_slot(&mut self, device: &ash::Device, slot: usize) -> anyhow::Result<()> {
        for lane in &mut self.slots[slot] {
            if lane.used == 0 {
                continue;
            }
            unsafe {
                device
                    .reset_command_pool(lane.pool, vk::CommandPoolResetFlags::empty())
                    .context("failed to reset command pool")?;
            }
            lane.used = 0;
        }
        Ok(())
    }

    pub fn begin(
        &mut self,
        device: &ash::Device,
        family: QueueFamily,
        slot: usize,
    ) -> anyhow::Result<vk::CommandBuffer> {
        let cmd = self.slots[slot][family.ordinal()].next(device)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("failed to begin command buffer")?;
        }
        Ok(cmd)
    }

    /// The buffer most recently begun by `family` in `slot`.
    pub fn current(&self, family: QueueFamily, slot: usize) -> anyhow::Result<vk::CommandBuffer> {
        self.slots[slot][family.ordinal()]
            .current()
            .with_context(|| format!("{:?} has not begun recording in slot {}", family, slot))
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        log::trace!("Destroying command slots");
        for lanes in self.slots.drain(..) {
            for lane in lanes {
                unsafe { device.destroy_command_pool(lane.pool, None) };
            }
        }
    }
}

fn collect_lanes(
    lanes: [anyhow::Result<LaneCommands>; 4],
) -> Result<[LaneCommands; 4], (anyhow::Error, Vec<LaneCommands>)> {
    let mut created = Vec::with_capacity(4);
    let mut failure = None;
    for lane in lanes {
        match lane {
            Ok(lane) => created.push(lane),
            Err(e) => failure = failure.or(Some(e)),
        }
    }
    if let Some(e) = failure {
        return Err((e, created));
    }
    created
        .try_into()
        .map_err(|created| (anyhow::anyhow!("expected one command pool per lane"), created))
}

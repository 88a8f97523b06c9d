use anyhow::Context;
use ash::vk;

use crate::{
    memory::backend::{BlockRequest, MemoryBackend, MemoryBlock},
    resource::MemoryPolicy,
};

const MIN_STAGING_BYTES: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug)]
pub(crate) struct StagedWrite {
    pub table_index: usize,
    pub dst_offset: u64,
    pub src_offset: u64,
    pub size: u64,
}

struct StagingSlot<B> {
    bytes: Vec<u8>,
    writes: Vec<StagedWrite>,
    block: Option<B>,
}

/// Host bytes bound for device-local segments, queued per frame slot until `CommitTransfers`.
pub(crate) struct StagingBelt<B> {
    slots: Vec<StagingSlot<B>>,
}

impl<B: MemoryBlock> StagingBelt<B> {
    pub fn new(pipeline_depth: usize) -> Self {
        Self {
            slots: (0..pipeline_depth)
                .map(|_| StagingSlot {
                    bytes: Vec::new(),
                    writes: Vec::new(),
                    block: None,
                })
                .collect(),
        }
    }

    pub fn stage(&mut self, slot: usize, table_index: usize, dst_offset: u64, data: &[u8]) {
        let staging = &mut self.slots[slot];
        let src_offset = staging.bytes.len() as u64;
        staging.bytes.extend_from_slice(data);
        staging.writes.push(StagedWrite {
            table_index,
            dst_offset,
            src_offset,
            size: data.len() as u64,
        });
    }

    pub fn pending(&self, slot: usize) -> usize {
        self.slots[slot].writes.len()
    }

    /// Uploads the slot's queued bytes into its staging block and hands back the writes to
    /// record. The slot's previous staging block is only replaced once the caller has waited
    /// for the slot.
    pub fn flush<M>(
        &mut self,
        backend: &mut M,
        slot: usize,
    ) -> anyhow::Result<Option<(vk::Buffer, Vec<StagedWrite>)>>
    where
        M: MemoryBackend<Block = B>,
    {
        let staging = &mut self.slots[slot];
        if staging.writes.is_empty() {
            return Ok(None);
        }

        let needed = staging.bytes.len() as u64;
        let too_small = staging
            .block
            .as_ref()
            .is_none_or(|block| block.size() < needed);
        if too_small {
            if let Some(old) = staging.block.take() {
                backend.destroy_block(old);
            }
            let request = BlockRequest {
                size: needed.next_power_of_two().max(MIN_STAGING_BYTES),
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                memory: MemoryPolicy::CpuLocal,
                debug_name: format!("Staging (Slot {})", slot),
            };
            staging.block = Some(
                backend
                    .create_block(&request)
                    .context("failed to create staging block")?,
            );
        }

        let Some(block) = staging.block.as_mut() else {
            return Ok(None);
        };
        let mapped = block
            .mapped_mut()
            .context("staging block is not host visible")?;
        mapped[..staging.bytes.len()].copy_from_slice(&staging.bytes);

        staging.bytes.clear();
        let writes = std::mem::take(&mut staging.writes);
        Ok(Some((block.buffer(), writes)))
    }

    pub fn release<M>(&mut self, backend: &mut M)
    where
        M: MemoryBackend<Block = B>,
    {
        for staging in &mut self.slots {
            if let Some(block) = staging.block.take() {
                log::trace!("Destroying staging block");
                backend.destroy_block(block);
            }
            staging.bytes.clear();
            staging.writes.clear();
        }
    }
}

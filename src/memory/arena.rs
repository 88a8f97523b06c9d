use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::{
    error::RenderError,
    memory::{
        allocation::DeviceAllocation,
        backend::{MemoryBackend, MemoryBlock},
        segment::{Segment, SegmentMut},
        staging::StagingBelt,
    },
    resource::{AllocationClass, ResourceDescriptor, ResourceKey, ResourceTable},
};

new_key_type! { pub struct AllocationKey; }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    Pooled {
        allocation: AllocationKey,
        member: usize,
    },
    Inline {
        index: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Growth {
    Allow,
    Forbid,
}

/// Push-constant bytes, one vector per frame slot.
struct InlineSegment {
    capacity: u64,
    slots: SmallVec<[Vec<u8>; 3]>,
}

/// A batch of buffer copies recorded as one command.
#[derive(Clone, Debug)]
pub struct CopyBatch {
    pub src: vk::Buffer,
    pub dst: vk::Buffer,
    pub regions: SmallVec<[vk::BufferCopy; 4]>,
}

/// Owns every device allocation of a frame context and maps resource keys onto them.
pub struct ResourceArena<B> {
    table: Arc<ResourceTable>,
    pipeline_depth: usize,
    allocations: SlotMap<AllocationKey, DeviceAllocation<B>>,
    placements: Vec<Placement>,
    inline: Vec<InlineSegment>,
    staging: StagingBelt<B>,
}

impl<B: MemoryBlock> ResourceArena<B> {
    pub fn new<M>(
        backend: &mut M,
        table: Arc<ResourceTable>,
        pipeline_depth: usize,
    ) -> anyhow::Result<Self>
    where
        M: MemoryBackend<Block = B>,
    {
        let mut arena = Self {
            placements: Vec::with_capacity(table.len()),
            table: table.clone(),
            pipeline_depth,
            allocations: SlotMap::with_key(),
            inline: Vec::new(),
            staging: StagingBelt::new(pipeline_depth),
        };

        let mut pooled = vec![None; table.len()];
        for class in table.classes() {
            let allocation = match DeviceAllocation::create(backend, &table, class, pipeline_depth)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    arena.release(backend);
                    return Err(e);
                }
            };
            let members = allocation
                .members()
                .iter()
                .enumerate()
                .map(|(member, m)| (m.table_index, member))
                .collect::<Vec<_>>();
            let key = arena.allocations.insert(allocation);
            for (table_index, member) in members {
                pooled[table_index] = Some(Placement::Pooled {
                    allocation: key,
                    member,
                });
            }
        }

        for (index, (_, desc)) in table.iter().enumerate() {
            let placement = match pooled[index] {
                Some(placement) => placement,
                None => {
                    arena.inline.push(InlineSegment {
                        capacity: desc.initial_capacity,
                        slots: (0..pipeline_depth).map(|_| Vec::new()).collect(),
                    });
                    Placement::Inline {
                        index: arena.inline.len() - 1,
                    }
                }
            };
            arena.placements.push(placement);
        }

        Ok(arena)
    }

    pub fn table(&self) -> &Arc<ResourceTable> {
        &self.table
    }

    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// The allocation currently backing `key`; `None` for push constants.
    pub fn allocation_of(&self, key: ResourceKey) -> anyhow::Result<Option<AllocationKey>> {
        let index = self.table.index_of(key)?;
        Ok(match self.placements[index] {
            Placement::Pooled { allocation, .. } => Some(allocation),
            Placement::Inline { .. } => None,
        })
    }

    pub fn allocation(&self, key: AllocationKey) -> Option<&DeviceAllocation<B>> {
        self.allocations.get(key)
    }

    pub fn segment(&self, key: ResourceKey, slot: usize) -> anyhow::Result<Segment<'_>> {
        let index = self.table.index_of(key)?;
        self.segment_at(index, slot)
    }

    pub fn segment_mut<'a, M>(
        &'a mut self,
        backend: &'a mut M,
        key: ResourceKey,
        slot: usize,
    ) -> anyhow::Result<SegmentMut<'a, M>>
    where
        M: MemoryBackend<Block = B>,
    {
        let index = self.table.index_of(key)?;
        Ok(SegmentMut::new(self, backend, index, slot))
    }

    pub(crate) fn segment_at(&self, index: usize, slot: usize) -> anyhow::Result<Segment<'_>> {
        let (key, descriptor) = self.entry(index);
        match self.placements[index] {
            Placement::Inline { index: inline } => {
                let segment = &self.inline[inline];
                let bytes = &segment.slots[slot];
                Ok(Segment::new(
                    key,
                    descriptor,
                    vk::Buffer::null(),
                    0,
                    bytes.len() as u64,
                    segment.capacity,
                    None,
                    Some(bytes.as_slice()),
                ))
            }
            Placement::Pooled { allocation, member } => {
                let allocation = self.pooled(allocation)?;
                let instance = descriptor.buffering.instance_for_slot(slot);
                let m = allocation.member(member);
                let block = allocation.block(instance);
                let size = m.sizes[instance];
                let bytes = block
                    .mapped()
                    .map(|mapped| &mapped[m.offset as usize..(m.offset + size) as usize]);
                Ok(Segment::new(
                    key,
                    descriptor,
                    block.buffer(),
                    m.offset,
                    size,
                    m.capacity,
                    block.device_address().map(|address| address + m.offset),
                    bytes,
                ))
            }
        }
    }

    fn entry(&self, index: usize) -> (ResourceKey, ResourceDescriptor) {
        let (key, descriptor) = self.table.entry(index);
        (key, *descriptor)
    }

    fn pooled(&self, key: AllocationKey) -> anyhow::Result<&DeviceAllocation<B>> {
        self.allocations
            .get(key)
            .context("segment refers to a released allocation")
    }

    fn pooled_mut(&mut self, key: AllocationKey) -> anyhow::Result<&mut DeviceAllocation<B>> {
        self.allocations
            .get_mut(key)
            .context("segment refers to a released allocation")
    }

    /// Current `(size, capacity)` of the resource at `index` for `slot`.
    pub(crate) fn extent(&self, index: usize, slot: usize) -> anyhow::Result<(u64, u64)> {
        match self.placements[index] {
            Placement::Inline { index: inline } => {
                let segment = &self.inline[inline];
                Ok((segment.slots[slot].len() as u64, segment.capacity))
            }
            Placement::Pooled { allocation, member } => {
                let allocation = self.pooled(allocation)?;
                let instance = allocation.class().buffering.instance_for_slot(slot);
                let m = allocation.member(member);
                Ok((m.sizes[instance], m.capacity))
            }
        }
    }

    /// Makes room for `required` bytes, growing the owning allocation when allowed.
    pub(crate) fn reserve<M>(
        &mut self,
        backend: &mut M,
        index: usize,
        required: u64,
        growth: Growth,
    ) -> anyhow::Result<()>
    where
        M: MemoryBackend<Block = B>,
    {
        let (key, descriptor) = self.entry(index);
        let (_, capacity) = self.extent(index, 0)?;
        if required <= capacity {
            return Ok(());
        }
        if growth == Growth::Forbid || !descriptor.is_growable() {
            return Err(RenderError::Capacity {
                key,
                requested: required,
                capacity,
            }
            .into());
        }
        self.grow(backend, key, required.max(capacity.saturating_mul(2)))
    }

    /// Reallocates the allocation owning `key` so the resource holds at least `new_capacity`
    /// bytes. Every member keeps its contents; the replacement is only published once the copy
    /// has completed.
    pub fn grow<M>(
        &mut self,
        backend: &mut M,
        key: ResourceKey,
        new_capacity: u64,
    ) -> anyhow::Result<()>
    where
        M: MemoryBackend<Block = B>,
    {
        let index = self.table.index_of(key)?;
        let Placement::Pooled { allocation, member } = self.placements[index] else {
            let (_, capacity) = self.extent(index, 0)?;
            return Err(RenderError::Capacity {
                key,
                requested: new_capacity,
                capacity,
            }
            .into());
        };

        backend
            .drain()
            .context("failed to drain the device before growing an allocation")?;

        let grown = self
            .pooled(allocation)?
            .grow(backend, member, new_capacity)
            .with_context(|| format!("failed to grow allocation for resource {}", key))?;
        let published = self.allocations.insert(grown);

        for placement in &mut self.placements {
            if let Placement::Pooled { allocation: a, .. } = placement {
                if *a == allocation {
                    *a = published;
                }
            }
        }

        if let Some(old) = self.allocations.remove(allocation) {
            old.release(backend);
        }
        Ok(())
    }

    pub(crate) fn set_size(&mut self, index: usize, slot: usize, size: u64) -> anyhow::Result<()> {
        match self.placements[index] {
            Placement::Inline { index: inline } => {
                self.inline[inline].slots[slot].resize(size as usize, 0);
            }
            Placement::Pooled { allocation, member } => {
                let allocation = self.pooled_mut(allocation)?;
                let instance = allocation.class().buffering.instance_for_slot(slot);
                allocation.member_mut(member).sizes[instance] = size;
            }
        }
        Ok(())
    }

    /// Writes `data` at `offset` within the resource; device-local resources are staged.
    pub(crate) fn write_at(
        &mut self,
        index: usize,
        slot: usize,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let (key, _) = self.entry(index);
        let (_, capacity) = self.extent(index, slot)?;
        let end = offset.saturating_add(data.len() as u64);
        if end > capacity {
            return Err(RenderError::Capacity {
                key,
                requested: end,
                capacity,
            }
            .into());
        }

        match self.placements[index] {
            Placement::Inline { index: inline } => {
                let bytes = &mut self.inline[inline].slots[slot];
                if bytes.len() < end as usize {
                    bytes.resize(end as usize, 0);
                }
                bytes[offset as usize..end as usize].copy_from_slice(data);
            }
            Placement::Pooled { allocation, member } => {
                let allocation = self
                    .allocations
                    .get_mut(allocation)
                    .context("segment refers to a released allocation")?;
                let instance = allocation.class().buffering.instance_for_slot(slot);
                let base = allocation.member(member).offset;
                let staged = match allocation.block_mut(instance).mapped_mut() {
                    Some(mapped) => {
                        mapped[(base + offset) as usize..(base + end) as usize]
                            .copy_from_slice(data);
                        false
                    }
                    None => true,
                };
                if staged {
                    self.staging.stage(slot, index, offset, data);
                }
            }
        }
        Ok(())
    }

    /// Host view of `len` bytes at `offset`; fails for device-local resources.
    pub(crate) fn host_bytes_mut(
        &mut self,
        index: usize,
        slot: usize,
        offset: u64,
        len: u64,
    ) -> anyhow::Result<&mut [u8]> {
        let (key, _) = self.entry(index);
        let range = offset as usize..(offset + len) as usize;
        match self.placements[index] {
            Placement::Inline { index: inline } => Ok(&mut self.inline[inline].slots[slot][range]),
            Placement::Pooled { allocation, member } => {
                let allocation = self.pooled_mut(allocation)?;
                let instance = allocation.class().buffering.instance_for_slot(slot);
                let base = allocation.member(member).offset as usize;
                let mapped = allocation
                    .block_mut(instance)
                    .mapped_mut()
                    .ok_or(RenderError::HostAccess(key))?;
                Ok(&mut mapped[base + range.start..base + range.end])
            }
        }
    }

    pub fn pending_transfers(&self, slot: usize) -> usize {
        self.staging.pending(slot)
    }

    /// Flushes the slot's staged writes and returns the copies that land them in their
    /// segments' current allocations.
    pub fn commit_transfers<M>(
        &mut self,
        backend: &mut M,
        slot: usize,
    ) -> anyhow::Result<Vec<CopyBatch>>
    where
        M: MemoryBackend<Block = B>,
    {
        let Some((src, writes)) = self.staging.flush(backend, slot)? else {
            return Ok(Vec::new());
        };

        let mut batches: Vec<CopyBatch> = Vec::new();
        for write in writes {
            let segment = self.segment_at(write.table_index, slot)?;
            let dst = segment.buffer();
            let region = vk::BufferCopy {
                src_offset: write.src_offset,
                dst_offset: segment.offset() + write.dst_offset,
                size: write.size,
            };
            match batches.iter_mut().find(|batch| batch.dst == dst) {
                Some(batch) => batch.regions.push(region),
                None => batches.push(CopyBatch {
                    src,
                    dst,
                    regions: SmallVec::from_slice(&[region]),
                }),
            }
        }
        Ok(batches)
    }

    /// Resolves a device-to-device copy between two pooled segments of `slot`. The destination's
    /// size is extended to cover the written range.
    pub fn copy_between(
        &mut self,
        src: ResourceKey,
        dst: ResourceKey,
        slot: usize,
        size: u64,
        offsets: (u64, u64),
    ) -> anyhow::Result<CopyBatch> {
        let (src_offset, dst_offset) = offsets;
        let src_index = self.table.index_of(src)?;
        let dst_index = self.table.index_of(dst)?;

        let src_segment = self.segment_at(src_index, slot)?;
        let dst_segment = self.segment_at(dst_index, slot)?;
        for (segment, offset) in [(&src_segment, src_offset), (&dst_segment, dst_offset)] {
            let end = offset.saturating_add(size);
            if segment.buffer() == vk::Buffer::null() || end > segment.capacity() {
                return Err(RenderError::Capacity {
                    key: segment.key(),
                    requested: end,
                    capacity: segment.capacity(),
                }
                .into());
            }
        }

        let batch = CopyBatch {
            src: src_segment.buffer(),
            dst: dst_segment.buffer(),
            regions: SmallVec::from_slice(&[vk::BufferCopy {
                src_offset: src_segment.offset() + src_offset,
                dst_offset: dst_segment.offset() + dst_offset,
                size,
            }]),
        };

        let covered = (dst_offset + size).max(dst_segment.size());
        self.set_size(dst_index, slot, covered)?;
        Ok(batch)
    }

    pub fn release<M>(&mut self, backend: &mut M)
    where
        M: MemoryBackend<Block = B>,
    {
        log::trace!("Destroying resource arena");
        self.staging.release(backend);
        for (_, allocation) in self.allocations.drain() {
            allocation.release(backend);
        }
    }
}

#[cfg(test)]
impl<B: MemoryBlock> ResourceArena<B> {
    pub(crate) fn class_of(&self, key: ResourceKey) -> Option<AllocationClass> {
        let allocation = self.allocation_of(key).ok()??;
        self.allocations.get(allocation).map(|a| a.class())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::{
        error::render_error,
        resource::{MemoryPolicy, ResourceDescriptor},
        testing::HostMemory,
    };

    const POSITIONS: ResourceKey = ResourceKey::new(1);
    const COLORS: ResourceKey = ResourceKey::new(2);
    const INDICES: ResourceKey = ResourceKey::new(3);
    const VIEW: ResourceKey = ResourceKey::new(4);
    const UNIFORMS: ResourceKey = ResourceKey::new(5);

    fn table() -> Arc<ResourceTable> {
        Arc::new(
            ResourceTable::builder()
                .declare(
                    POSITIONS,
                    ResourceDescriptor::cpu_local(vk::BufferUsageFlags::STORAGE_BUFFER, 64),
                )
                .declare(
                    COLORS,
                    ResourceDescriptor::cpu_local(vk::BufferUsageFlags::STORAGE_BUFFER, 64),
                )
                .declare(
                    INDICES,
                    ResourceDescriptor::gpu_local(vk::BufferUsageFlags::INDEX_BUFFER, 32).fixed(),
                )
                .declare(
                    VIEW,
                    ResourceDescriptor::push_constant(8, vk::ShaderStageFlags::VERTEX),
                )
                .declare(
                    UNIFORMS,
                    ResourceDescriptor::shared(vk::BufferUsageFlags::UNIFORM_BUFFER, 16).multi(),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn one_allocation_per_class() {
        let mut memory = HostMemory::default();
        let arena = ResourceArena::new(&mut memory, table(), 3).unwrap();

        assert_eq!(arena.allocation_count(), 3);
        assert_eq!(arena.allocation_of(VIEW).unwrap(), None);
        assert_eq!(
            arena.allocation_of(POSITIONS).unwrap(),
            arena.allocation_of(COLORS).unwrap()
        );
        assert_eq!(arena.class_of(INDICES).unwrap().memory, MemoryPolicy::GpuLocal);
        // single cpu, single gpu, three shared instances
        assert_eq!(memory.live_blocks(), 5);
    }

    #[test]
    fn multi_buffered_slots_are_isolated() {
        let depth = 3;
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), depth).unwrap();

        for slot in 0..depth {
            let pattern = [slot as u32 + 1; 4];
            let mut segment = arena.segment_mut(&mut memory, UNIFORMS, slot).unwrap();
            segment.extend_from_slice(&pattern).unwrap();
        }

        for slot in 0..depth {
            let segment = arena.segment(UNIFORMS, slot).unwrap();
            let values: &[u32] = bytemuck::cast_slice(segment.data().unwrap());
            assert_eq!(values, &[slot as u32 + 1; 4]);
        }
    }

    #[test]
    fn growth_preserves_neighbouring_segments() {
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), 2).unwrap();

        let colors = (0..16u32).collect::<Vec<_>>();
        arena
            .segment_mut(&mut memory, COLORS, 0)
            .unwrap()
            .extend_from_slice(&colors)
            .unwrap();
        assert_eq!(arena.segment(COLORS, 0).unwrap().size(), 64);

        let before = arena.allocation_of(POSITIONS).unwrap().unwrap();
        let positions = [7u32; 40];
        arena
            .segment_mut(&mut memory, POSITIONS, 0)
            .unwrap()
            .extend_from_slice(&positions)
            .unwrap();
        let after = arena.allocation_of(POSITIONS).unwrap().unwrap();

        assert_ne!(before, after);
        assert!(arena.allocation(before).is_none());
        assert_eq!(arena.allocation_of(COLORS).unwrap(), Some(after));

        let segment = arena.segment(COLORS, 0).unwrap();
        let read: &[u32] = bytemuck::cast_slice(segment.data().unwrap());
        assert_eq!(read, colors.as_slice());

        let segment = arena.segment(POSITIONS, 0).unwrap();
        assert!(segment.capacity() >= 160);
        let read: &[u32] = bytemuck::cast_slice(segment.data().unwrap());
        assert_eq!(read, &positions);
    }

    #[test]
    fn device_local_writes_are_staged_until_commit() {
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), 2).unwrap();

        arena
            .segment_mut(&mut memory, INDICES, 1)
            .unwrap()
            .extend_from_slice(&[0u32, 1, 2])
            .unwrap();

        assert_eq!(arena.pending_transfers(0), 0);
        assert_eq!(arena.pending_transfers(1), 1);
        assert!(arena.commit_transfers(&mut memory, 0).unwrap().is_empty());

        let batches = arena.commit_transfers(&mut memory, 1).unwrap();
        let indices = arena.segment(INDICES, 1).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].dst, indices.buffer());
        assert_eq!(batches[0].regions[0].size, 12);
        assert_eq!(batches[0].regions[0].dst_offset, indices.offset());
        assert_eq!(arena.pending_transfers(1), 0);
    }

    #[test]
    fn copy_between_checks_capacity() {
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), 2).unwrap();

        let batch = arena.copy_between(POSITIONS, COLORS, 0, 32, (0, 16)).unwrap();
        assert_eq!(batch.regions[0].size, 32);
        assert_eq!(arena.segment(COLORS, 0).unwrap().size(), 48);

        let err = arena
            .copy_between(POSITIONS, COLORS, 0, 64, (0, 16))
            .unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::Capacity { .. })
        ));

        let err = arena.copy_between(VIEW, COLORS, 0, 4, (0, 0)).unwrap_err();
        assert!(render_error(&err).is_some());

        let err = arena
            .copy_between(POSITIONS, COLORS, 0, 8, (u64::MAX - 4, 0))
            .unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::Capacity { requested: u64::MAX, .. })
        ));
    }

    #[test]
    fn writes_past_the_end_of_the_address_space_are_rejected() {
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), 2).unwrap();
        let index = arena.table().index_of(INDICES).unwrap();

        let err = arena
            .write_at(index, 0, u64::MAX - 2, &[1, 2, 3, 4])
            .unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::Capacity { requested: u64::MAX, .. })
        ));
        assert_eq!(arena.pending_transfers(0), 0);
    }

    #[test]
    fn release_frees_every_block() {
        let mut memory = HostMemory::default();
        let mut arena = ResourceArena::new(&mut memory, table(), 2).unwrap();
        arena
            .segment_mut(&mut memory, INDICES, 0)
            .unwrap()
            .push_back(&5u32)
            .unwrap();
        arena.commit_transfers(&mut memory, 0).unwrap();

        arena.release(&mut memory);
        assert_eq!(memory.live_blocks(), 0);
    }
}

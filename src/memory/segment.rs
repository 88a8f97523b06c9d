use ash::vk;
use bytemuck::Pod;

use crate::{
    error::RenderError,
    memory::{
        arena::{Growth, ResourceArena},
        backend::MemoryBackend,
    },
    resource::{MemoryPolicy, ResourceDescriptor, ResourceKey},
};

/// Read-only view of one resource for one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    key: ResourceKey,
    descriptor: ResourceDescriptor,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
    capacity: u64,
    address: Option<vk::DeviceAddress>,
    bytes: Option<&'a [u8]>,
}

impl<'a> Segment<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ResourceKey,
        descriptor: ResourceDescriptor,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        capacity: u64,
        address: Option<vk::DeviceAddress>,
        bytes: Option<&'a [u8]>,
    ) -> Self {
        Self {
            key,
            descriptor,
            buffer,
            offset,
            size,
            capacity,
            address,
            bytes,
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The live bytes of the current slot. Device-local segments have no host view.
    pub fn data(&self) -> anyhow::Result<&'a [u8]> {
        self.bytes
            .ok_or_else(|| RenderError::HostAccess(self.key).into())
    }

    pub fn gpu_address(&self) -> Option<vk::DeviceAddress> {
        self.address
    }

    /// The buffer backing this segment, null for push constants.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_push_constant(&self) -> bool {
        self.descriptor.memory == MemoryPolicy::PushConstant
    }
}

/// Mutable view of one resource for one frame slot. Operations that outgrow the segment
/// reallocate its device allocation; the `try_` variants fail instead.
pub struct SegmentMut<'a, M: MemoryBackend> {
    arena: &'a mut ResourceArena<M::Block>,
    backend: &'a mut M,
    index: usize,
    slot: usize,
}

impl<'a, M: MemoryBackend> SegmentMut<'a, M> {
    pub(crate) fn new(
        arena: &'a mut ResourceArena<M::Block>,
        backend: &'a mut M,
        index: usize,
        slot: usize,
    ) -> Self {
        Self {
            arena,
            backend,
            index,
            slot,
        }
    }

    pub fn view(&self) -> anyhow::Result<Segment<'_>> {
        self.arena.segment_at(self.index, self.slot)
    }

    pub fn size(&self) -> anyhow::Result<u64> {
        Ok(self.arena.extent(self.index, self.slot)?.0)
    }

    pub fn capacity(&self) -> anyhow::Result<u64> {
        Ok(self.arena.extent(self.index, self.slot)?.1)
    }

    pub fn push_back<T: Pod>(&mut self, value: &T) -> anyhow::Result<()> {
        self.append(bytemuck::bytes_of(value), Growth::Allow)
    }

    pub fn try_push_back<T: Pod>(&mut self, value: &T) -> anyhow::Result<()> {
        self.append(bytemuck::bytes_of(value), Growth::Forbid)
    }

    pub fn extend_from_slice<T: Pod>(&mut self, values: &[T]) -> anyhow::Result<()> {
        self.append(bytemuck::cast_slice(values), Growth::Allow)
    }

    pub fn try_extend_from_slice<T: Pod>(&mut self, values: &[T]) -> anyhow::Result<()> {
        self.append(bytemuck::cast_slice(values), Growth::Forbid)
    }

    /// Appends a zeroed `T` and hands it back for in-place construction. Only host-visible
    /// segments can be emplaced into.
    pub fn emplace_back<T: Pod>(&mut self) -> anyhow::Result<&mut T> {
        self.emplace(Growth::Allow)
    }

    pub fn try_emplace_back<T: Pod>(&mut self) -> anyhow::Result<&mut T> {
        self.emplace(Growth::Forbid)
    }

    /// Sets the live size. Growing past capacity reallocates; shrinking never releases capacity,
    /// so a segment never drops below its initial capacity.
    pub fn resize(&mut self, new_size: u64) -> anyhow::Result<()> {
        self.arena
            .reserve(self.backend, self.index, new_size, Growth::Allow)?;
        self.arena.set_size(self.index, self.slot, new_size)
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.arena.set_size(self.index, self.slot, 0)
    }

    /// Overwrites live bytes starting at byte `offset`.
    pub fn write<T: Pod>(&mut self, offset: u64, values: &[T]) -> anyhow::Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let (size, _) = self.arena.extent(self.index, self.slot)?;
        let end = offset.saturating_add(bytes.len() as u64);
        if end > size {
            let key = self.arena.table().entry(self.index).0;
            return Err(RenderError::Capacity {
                key,
                requested: end,
                capacity: size,
            }
            .into());
        }
        self.arena.write_at(self.index, self.slot, offset, bytes)
    }

    fn append(&mut self, bytes: &[u8], growth: Growth) -> anyhow::Result<()> {
        let (size, _) = self.arena.extent(self.index, self.slot)?;
        let end = size + bytes.len() as u64;
        self.arena.reserve(self.backend, self.index, end, growth)?;
        self.arena.write_at(self.index, self.slot, size, bytes)?;
        self.arena.set_size(self.index, self.slot, end)
    }

    fn emplace<T: Pod>(&mut self, growth: Growth) -> anyhow::Result<&mut T> {
        let (key, descriptor) = self.arena.table().entry(self.index);
        if !descriptor.memory.is_host_visible() {
            return Err(RenderError::HostAccess(key).into());
        }

        let (size, _) = self.arena.extent(self.index, self.slot)?;
        let align = std::mem::align_of::<T>() as u64;
        let start = size.div_ceil(align) * align;
        let len = std::mem::size_of::<T>() as u64;
        self.arena
            .reserve(self.backend, self.index, start + len, growth)?;
        self.arena.set_size(self.index, self.slot, start + len)?;

        let bytes = self.arena.host_bytes_mut(self.index, self.slot, start, len)?;
        bytes.fill(0);
        bytemuck::try_from_bytes_mut(bytes)
            .map_err(|e| anyhow::anyhow!("segment {} is misaligned for emplace: {:?}", key, e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk;

    use super::*;
    use crate::{
        error::render_error,
        resource::{ResourceDescriptor, ResourceTable},
        testing::HostMemory,
    };

    const INDICES: ResourceKey = ResourceKey::new(10);
    const VIEW: ResourceKey = ResourceKey::new(11);
    const SPRITES: ResourceKey = ResourceKey::new(12);

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Sprite {
        position: [f32; 2],
        size: [f32; 2],
    }

    fn arena(memory: &mut HostMemory) -> ResourceArena<crate::testing::HostBlock> {
        let table = ResourceTable::builder()
            .declare(
                INDICES,
                ResourceDescriptor::gpu_local(vk::BufferUsageFlags::INDEX_BUFFER, 16).fixed(),
            )
            .declare(
                VIEW,
                ResourceDescriptor::push_constant(8, vk::ShaderStageFlags::VERTEX),
            )
            .declare(
                SPRITES,
                ResourceDescriptor::shared(vk::BufferUsageFlags::STORAGE_BUFFER, 32).multi(),
            )
            .build()
            .unwrap();
        ResourceArena::new(memory, Arc::new(table), 2).unwrap()
    }

    #[test]
    fn fixed_gpu_local_segment_rejects_overflow() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        let mut indices = arena.segment_mut(&mut memory, INDICES, 0).unwrap();

        indices.try_extend_from_slice(&[0u32, 1, 2, 3]).unwrap();
        assert_eq!(indices.size().unwrap(), 16);

        let err = indices.try_push_back(&4u32).unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::Capacity { requested: 20, capacity: 16, .. })
        ));
        assert_eq!(indices.size().unwrap(), 16);

        // growth is refused for fixed segments even without the try_ variant
        assert!(indices.push_back(&4u32).is_err());
        assert_eq!(indices.size().unwrap(), 16);
    }

    #[test]
    fn gpu_local_segments_have_no_host_view() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        arena
            .segment_mut(&mut memory, INDICES, 0)
            .unwrap()
            .push_back(&9u32)
            .unwrap();

        let segment = arena.segment(INDICES, 0).unwrap();
        assert_eq!(segment.size(), 4);
        assert!(matches!(
            render_error(&segment.data().unwrap_err()),
            Some(RenderError::HostAccess(_))
        ));
        assert!(
            arena
                .segment_mut(&mut memory, INDICES, 0)
                .unwrap()
                .emplace_back::<u32>()
                .is_err()
        );
    }

    #[test]
    fn overflowing_write_offsets_are_capacity_errors() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        let mut sprites = arena.segment_mut(&mut memory, SPRITES, 0).unwrap();
        sprites.resize(16).unwrap();

        let err = sprites.write(u64::MAX - 4, &[1u32, 2]).unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::Capacity { requested: u64::MAX, capacity: 16, .. })
        ));
        sprites.write(8, &[1u32, 2]).unwrap();
    }

    #[test]
    fn push_constants_never_grow() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        let mut view = arena.segment_mut(&mut memory, VIEW, 1).unwrap();

        view.push_back(&[800.0f32, 600.0]).unwrap();
        assert!(view.push_back(&1.0f32).is_err());
        assert!(view.try_push_back(&1.0f32).is_err());

        let segment = arena.segment(VIEW, 1).unwrap();
        assert!(segment.is_push_constant());
        assert_eq!(segment.data().unwrap(), bytemuck::bytes_of(&[800.0f32, 600.0]));
        assert!(arena.segment(VIEW, 0).unwrap().is_empty());
    }

    #[test]
    fn emplace_constructs_in_place_and_grows() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        let mut sprites = arena.segment_mut(&mut memory, SPRITES, 0).unwrap();

        for i in 0..4 {
            let sprite = sprites.emplace_back::<Sprite>().unwrap();
            sprite.position = [i as f32, 0.0];
            sprite.size = [1.0, 1.0];
        }
        assert_eq!(sprites.size().unwrap(), 64);
        assert!(sprites.capacity().unwrap() >= 64);

        let segment = arena.segment(SPRITES, 0).unwrap();
        let read: &[Sprite] = bytemuck::cast_slice(segment.data().unwrap());
        assert_eq!(read[3].position, [3.0, 0.0]);
        assert!(arena.segment(SPRITES, 1).unwrap().is_empty());
    }

    #[test]
    fn resize_keeps_capacity_when_shrinking() {
        let mut memory = HostMemory::default();
        let mut arena = arena(&mut memory);
        let mut sprites = arena.segment_mut(&mut memory, SPRITES, 0).unwrap();

        sprites.resize(100).unwrap();
        let grown = sprites.capacity().unwrap();
        assert!(grown >= 100);

        sprites.resize(4).unwrap();
        assert_eq!(sprites.size().unwrap(), 4);
        assert_eq!(sprites.capacity().unwrap(), grown);

        sprites.write(0, &[0xAAu8; 4]).unwrap();
        assert!(sprites.write(2, &[0u8; 4]).is_err());
    }
}

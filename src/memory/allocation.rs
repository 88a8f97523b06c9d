use anyhow::Context;
use ash::vk;
use smallvec::SmallVec;

use crate::{
    memory::backend::{BlockRequest, MemoryBackend, MemoryBlock},
    resource::{AllocationClass, ResourceKey, ResourceTable},
};

/// Member offsets are aligned for every buffer binding kind.
pub const SEGMENT_ALIGNMENT: u64 = 256;

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub key: ResourceKey,
    pub table_index: usize,
    pub offset: u64,
    pub capacity: u64,
    pub initial_capacity: u64,
    pub usage: vk::BufferUsageFlags,
    /// Live byte count per physical instance.
    pub sizes: SmallVec<[u64; 3]>,
}

/// Pools every resource of one [`AllocationClass`] into a single buffer per physical instance.
pub struct DeviceAllocation<B> {
    class: AllocationClass,
    members: Vec<Member>,
    blocks: SmallVec<[B; 3]>,
    block_size: u64,
    usage: vk::BufferUsageFlags,
}

impl<B: MemoryBlock> DeviceAllocation<B> {
    pub fn create<M>(
        backend: &mut M,
        table: &ResourceTable,
        class: AllocationClass,
        pipeline_depth: usize,
    ) -> anyhow::Result<Self>
    where
        M: MemoryBackend<Block = B>,
    {
        let instances = class.buffering.instance_count(pipeline_depth);
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let mut members = table
            .members_of(class)
            .map(|(table_index, key, desc)| {
                usage |= desc.usage;
                Member {
                    key,
                    table_index,
                    offset: 0,
                    capacity: desc.initial_capacity,
                    initial_capacity: desc.initial_capacity,
                    usage: desc.usage,
                    sizes: SmallVec::from_elem(0, instances),
                }
            })
            .collect::<Vec<_>>();

        let block_size = layout(&mut members);
        let blocks = allocate_blocks(backend, class, usage, block_size, instances)
            .with_context(|| format!("failed to create {:?} allocation", class))?;

        log::debug!(
            "Created {:?} allocation: {} members, {} x {} bytes",
            class,
            members.len(),
            instances,
            block_size
        );

        Ok(Self {
            class,
            members,
            blocks,
            block_size,
            usage,
        })
    }

    /// Builds a replacement allocation in which `member` holds at least `new_capacity` bytes,
    /// carrying over every member's live bytes. `self` is left untouched, so on error the caller
    /// still owns a valid allocation.
    pub fn grow<M>(
        &self,
        backend: &mut M,
        member: usize,
        new_capacity: u64,
    ) -> anyhow::Result<Self>
    where
        M: MemoryBackend<Block = B>,
    {
        let mut members = self.members.clone();
        members[member].capacity = members[member].capacity.max(new_capacity);
        let block_size = layout(&mut members);

        let instances = self.blocks.len();
        let mut blocks = allocate_blocks(backend, self.class, self.usage, block_size, instances)
            .with_context(|| format!("failed to grow {:?} allocation", self.class))?;

        for instance in 0..instances {
            let regions = self
                .members
                .iter()
                .zip(members.iter())
                .filter(|(old, _)| old.sizes[instance] > 0)
                .map(|(old, new)| vk::BufferCopy {
                    src_offset: old.offset,
                    dst_offset: new.offset,
                    size: old.sizes[instance],
                })
                .collect::<SmallVec<[vk::BufferCopy; 8]>>();

            if regions.is_empty() {
                continue;
            }

            let copied =
                backend.copy_blocks(&self.blocks[instance], &mut blocks[instance], &regions);
            if let Err(e) = copied {
                for block in blocks.drain(..) {
                    backend.destroy_block(block);
                }
                return Err(e.context("failed to copy segments into grown allocation"));
            }
        }

        log::debug!(
            "Grew {:?} allocation for {}: {} -> {} bytes per instance",
            self.class,
            self.members[member].key,
            self.block_size,
            block_size
        );

        Ok(Self {
            class: self.class,
            members,
            blocks,
            block_size,
            usage: self.usage,
        })
    }

    pub fn release<M>(self, backend: &mut M)
    where
        M: MemoryBackend<Block = B>,
    {
        log::trace!("Destroying {:?} allocation", self.class);
        for block in self.blocks {
            backend.destroy_block(block);
        }
    }

    pub fn class(&self) -> AllocationClass {
        self.class
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn instance_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn member_index(&self, key: ResourceKey) -> Option<usize> {
        self.members.iter().position(|m| m.key == key)
    }

    pub(crate) fn member(&self, member: usize) -> &Member {
        &self.members[member]
    }

    pub(crate) fn member_mut(&mut self, member: usize) -> &mut Member {
        &mut self.members[member]
    }

    pub(crate) fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn block(&self, instance: usize) -> &B {
        &self.blocks[instance]
    }

    pub(crate) fn block_mut(&mut self, instance: usize) -> &mut B {
        &mut self.blocks[instance]
    }
}

fn layout(members: &mut [Member]) -> u64 {
    let mut cursor = 0;
    for member in members.iter_mut() {
        member.offset = cursor;
        cursor = align_up(cursor + member.capacity, SEGMENT_ALIGNMENT);
    }
    cursor.max(SEGMENT_ALIGNMENT)
}

fn allocate_blocks<M: MemoryBackend>(
    backend: &mut M,
    class: AllocationClass,
    usage: vk::BufferUsageFlags,
    size: u64,
    count: usize,
) -> anyhow::Result<SmallVec<[M::Block; 3]>> {
    let mut blocks = SmallVec::new();
    for instance in 0..count {
        let request = BlockRequest {
            size,
            usage,
            memory: class.memory,
            debug_name: format!("{:?}/{:?} (Instance {})", class.memory, class.buffering, instance),
        };
        match backend.create_block(&request) {
            Ok(block) => blocks.push(block),
            Err(e) => {
                for block in blocks.drain(..) {
                    backend.destroy_block(block);
                }
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

use ash::vk;

use crate::resource::MemoryPolicy;

#[derive(Clone, Debug)]
pub struct BlockRequest {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryPolicy,
    pub debug_name: String,
}

/// One physical buffer backing every member of a device allocation for one frame slot.
pub trait MemoryBlock {
    fn buffer(&self) -> vk::Buffer;

    fn size(&self) -> u64;

    fn device_address(&self) -> Option<vk::DeviceAddress>;

    /// Host view of the whole block, `None` unless the block is host visible.
    fn mapped(&self) -> Option<&[u8]>;

    fn mapped_mut(&mut self) -> Option<&mut [u8]>;
}

pub trait MemoryBackend {
    type Block: MemoryBlock;

    fn create_block(&mut self, request: &BlockRequest) -> anyhow::Result<Self::Block>;

    fn destroy_block(&mut self, block: Self::Block);

    /// Copies `regions` from `src` into `dst` and returns only once the copy has completed.
    fn copy_blocks(
        &mut self,
        src: &Self::Block,
        dst: &mut Self::Block,
        regions: &[vk::BufferCopy],
    ) -> anyhow::Result<()>;

    /// Blocks until no submitted work can still reference any block.
    fn drain(&mut self) -> anyhow::Result<()>;
}

/// Copies between two host-visible blocks without touching the device.
pub fn copy_mapped<B: MemoryBlock>(
    src: &B,
    dst: &mut B,
    regions: &[vk::BufferCopy],
) -> Option<()> {
    let src = src.mapped()?;
    let dst = dst.mapped_mut()?;
    for region in regions {
        let from = region.src_offset as usize..(region.src_offset + region.size) as usize;
        let to = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
        dst.get_mut(to)?.copy_from_slice(src.get(from)?);
    }
    Some(())
}

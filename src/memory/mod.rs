mod allocation;
mod arena;
mod backend;
mod segment;
mod staging;
mod vma;

pub use allocation::{DeviceAllocation, SEGMENT_ALIGNMENT};
pub use arena::{AllocationKey, CopyBatch, ResourceArena};
pub use backend::{BlockRequest, MemoryBackend, MemoryBlock, copy_mapped};
pub use segment::{Segment, SegmentMut};
pub use vma::{VmaBlock, VmaMemory};

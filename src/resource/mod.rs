mod keys;
mod spec;
mod table;

pub use keys::ResourceKey;
pub use spec::{
    BufferingPolicy, CapacityPolicy, MAX_PUSH_CONSTANT_BYTES, MemoryPolicy, ResourceDescriptor,
};
pub use table::{AllocationClass, ResourceTable, ResourceTableBuilder};

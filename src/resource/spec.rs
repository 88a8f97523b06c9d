use ash::vk;

/// Largest push-constant block every conforming device must accept.
pub const MAX_PUSH_CONSTANT_BYTES: u64 = 128;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryPolicy {
    GpuLocal,
    CpuLocal,
    Shared,
    PushConstant,
}

impl MemoryPolicy {
    pub fn is_host_visible(self) -> bool {
        match self {
            MemoryPolicy::GpuLocal => false,
            MemoryPolicy::CpuLocal | MemoryPolicy::Shared | MemoryPolicy::PushConstant => true,
        }
    }

    pub fn is_pooled(self) -> bool {
        self != MemoryPolicy::PushConstant
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BufferingPolicy {
    Single,
    Multi,
}

impl BufferingPolicy {
    pub fn instance_count(self, pipeline_depth: usize) -> usize {
        match self {
            BufferingPolicy::Single => 1,
            BufferingPolicy::Multi => pipeline_depth,
        }
    }

    /// The physical instance a frame slot reads and writes.
    pub fn instance_for_slot(self, slot: usize) -> usize {
        match self {
            BufferingPolicy::Single => 0,
            BufferingPolicy::Multi => slot,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CapacityPolicy {
    Growable,
    Fixed,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceDescriptor {
    pub memory: MemoryPolicy,
    pub buffering: BufferingPolicy,
    pub capacity_policy: CapacityPolicy,
    pub usage: vk::BufferUsageFlags,
    pub visibility: vk::ShaderStageFlags,
    pub initial_capacity: u64,
}

impl ResourceDescriptor {
    fn new(memory: MemoryPolicy, usage: vk::BufferUsageFlags, initial_capacity: u64) -> Self {
        Self {
            memory,
            buffering: BufferingPolicy::Single,
            capacity_policy: CapacityPolicy::Growable,
            usage,
            visibility: vk::ShaderStageFlags::ALL_GRAPHICS | vk::ShaderStageFlags::COMPUTE,
            initial_capacity,
        }
    }

    pub fn gpu_local(usage: vk::BufferUsageFlags, initial_capacity: u64) -> Self {
        Self::new(MemoryPolicy::GpuLocal, usage, initial_capacity)
    }

    pub fn cpu_local(usage: vk::BufferUsageFlags, initial_capacity: u64) -> Self {
        Self::new(MemoryPolicy::CpuLocal, usage, initial_capacity)
    }

    pub fn shared(usage: vk::BufferUsageFlags, initial_capacity: u64) -> Self {
        Self::new(MemoryPolicy::Shared, usage, initial_capacity)
    }

    /// Push constants are recorded straight into command state, so they are always
    /// multi-buffered and never grow.
    pub fn push_constant(size: u64, visibility: vk::ShaderStageFlags) -> Self {
        Self {
            memory: MemoryPolicy::PushConstant,
            buffering: BufferingPolicy::Multi,
            capacity_policy: CapacityPolicy::Fixed,
            usage: vk::BufferUsageFlags::empty(),
            visibility,
            initial_capacity: size,
        }
    }

    pub fn multi(mut self) -> Self {
        self.buffering = BufferingPolicy::Multi;
        self
    }

    pub fn single(mut self) -> Self {
        self.buffering = BufferingPolicy::Single;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.capacity_policy = CapacityPolicy::Fixed;
        self
    }

    pub fn visible_to(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.visibility = stages;
        self
    }

    pub fn is_growable(&self) -> bool {
        self.capacity_policy == CapacityPolicy::Growable && self.memory.is_pooled()
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.initial_capacity == 0 {
            return Err("initial capacity must be non-zero");
        }
        if self.memory == MemoryPolicy::PushConstant {
            if self.buffering != BufferingPolicy::Multi {
                return Err("push constants must be multi-buffered");
            }
            if self.initial_capacity > MAX_PUSH_CONSTANT_BYTES {
                return Err("push constant block exceeds 128 bytes");
            }
            if self.initial_capacity % 4 != 0 {
                return Err("push constant size must be a multiple of 4");
            }
        }
        Ok(())
    }
}

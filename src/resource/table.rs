use std::collections::HashMap;

use crate::{
    error::RenderError,
    resource::{
        keys::ResourceKey,
        spec::{BufferingPolicy, MemoryPolicy, ResourceDescriptor},
    },
};

/// The pooling class of a resource: every pooled resource sharing one shares a device allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AllocationClass {
    pub buffering: BufferingPolicy,
    pub memory: MemoryPolicy,
}

/// Immutable, ordered schema of every resource a window renders with.
#[derive(Debug)]
pub struct ResourceTable {
    entries: Vec<(ResourceKey, ResourceDescriptor)>,
    indices: HashMap<ResourceKey, usize>,
}

#[derive(Default)]
pub struct ResourceTableBuilder {
    entries: Vec<(ResourceKey, ResourceDescriptor)>,
}

impl ResourceTableBuilder {
    pub fn declare(mut self, key: ResourceKey, descriptor: ResourceDescriptor) -> Self {
        self.entries.push((key, descriptor));
        self
    }

    pub fn build(self) -> anyhow::Result<ResourceTable> {
        ResourceTable::new(self.entries)
    }
}

impl ResourceTable {
    pub fn builder() -> ResourceTableBuilder {
        ResourceTableBuilder::default()
    }

    pub fn new(
        entries: impl IntoIterator<Item = (ResourceKey, ResourceDescriptor)>,
    ) -> anyhow::Result<Self> {
        let entries = entries.into_iter().collect::<Vec<_>>();
        let mut indices = HashMap::with_capacity(entries.len());

        for (index, (key, descriptor)) in entries.iter().enumerate() {
            if indices.insert(*key, index).is_some() {
                return Err(RenderError::DuplicateResource(*key).into());
            }
            descriptor
                .validate()
                .map_err(|reason| RenderError::InvalidDescriptor { key: *key, reason })?;
        }

        log::debug!("Resource table declares {} resources", entries.len());
        Ok(Self { entries, indices })
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.indices.contains_key(&key)
    }

    pub fn index_of(&self, key: ResourceKey) -> anyhow::Result<usize> {
        self.indices
            .get(&key)
            .copied()
            .ok_or_else(|| RenderError::UnknownResource(key).into())
    }

    pub fn descriptor(&self, key: ResourceKey) -> anyhow::Result<&ResourceDescriptor> {
        let index = self.index_of(key)?;
        Ok(&self.entries[index].1)
    }

    /// The entry at a position previously returned by [`ResourceTable::index_of`].
    pub fn entry(&self, index: usize) -> (ResourceKey, &ResourceDescriptor) {
        let (key, descriptor) = &self.entries[index];
        (*key, descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, &ResourceDescriptor)> {
        self.entries.iter().map(|(key, desc)| (*key, desc))
    }

    /// Distinct pooling classes with at least one member, in first-declared order.
    pub fn classes(&self) -> Vec<AllocationClass> {
        let mut classes = Vec::new();
        for (_, desc) in &self.entries {
            if !desc.memory.is_pooled() {
                continue;
            }
            let class = AllocationClass {
                buffering: desc.buffering,
                memory: desc.memory,
            };
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
        classes
    }

    pub fn members_of(
        &self,
        class: AllocationClass,
    ) -> impl Iterator<Item = (usize, ResourceKey, &ResourceDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, (_, desc))| {
                desc.memory.is_pooled()
                    && desc.memory == class.memory
                    && desc.buffering == class.buffering
            })
            .map(|(index, (key, desc))| (index, *key, desc))
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::error::render_error;

    fn vertices() -> ResourceDescriptor {
        ResourceDescriptor::shared(vk::BufferUsageFlags::VERTEX_BUFFER, 1024).multi()
    }

    #[test]
    fn index_of_is_a_stable_bijection() {
        let keys = [40, 3, 17, 9, 1000].map(ResourceKey::new);
        let table = ResourceTable::new(keys.iter().map(|k| (*k, vertices()))).unwrap();

        let mut seen = keys
            .iter()
            .map(|k| table.index_of(*k).unwrap())
            .collect::<Vec<_>>();
        for (position, key) in keys.iter().enumerate() {
            assert_eq!(table.index_of(*key).unwrap(), position);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..keys.len()).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = ResourceTable::builder()
            .declare(ResourceKey::new(1), vertices())
            .declare(ResourceKey::new(2), vertices())
            .declare(ResourceKey::new(1), vertices())
            .build()
            .unwrap_err();

        assert!(matches!(
            render_error(&err),
            Some(RenderError::DuplicateResource(k)) if k.id() == 1
        ));
    }

    #[test]
    fn unknown_key_is_a_programmer_error() {
        let table = ResourceTable::builder()
            .declare(ResourceKey::new(1), vertices())
            .build()
            .unwrap();

        assert!(table.contains(ResourceKey::new(1)));
        assert!(!table.contains(ResourceKey::new(2)));
        let err = table.index_of(ResourceKey::new(2)).unwrap_err();
        assert!(matches!(
            render_error(&err),
            Some(RenderError::UnknownResource(_))
        ));
    }

    #[test]
    fn classes_skip_push_constants() {
        let table = ResourceTable::builder()
            .declare(ResourceKey::new(1), vertices())
            .declare(
                ResourceKey::new(2),
                ResourceDescriptor::push_constant(8, vk::ShaderStageFlags::VERTEX),
            )
            .declare(
                ResourceKey::new(3),
                ResourceDescriptor::gpu_local(vk::BufferUsageFlags::INDEX_BUFFER, 512),
            )
            .declare(
                ResourceKey::new(4),
                ResourceDescriptor::shared(vk::BufferUsageFlags::UNIFORM_BUFFER, 256).multi(),
            )
            .build()
            .unwrap();

        let classes = table.classes();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].memory, MemoryPolicy::Shared);
        assert_eq!(classes[1].memory, MemoryPolicy::GpuLocal);
        assert_eq!(table.members_of(classes[0]).count(), 2);
    }
}

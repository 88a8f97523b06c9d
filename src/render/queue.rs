use ash::vk;
use smallvec::SmallVec;

use crate::error::RenderError;

/// A logical execution lane. Several lanes may resolve to the same physical queue family.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum QueueFamily {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueFamily {
    pub const ALL: [QueueFamily; 4] = [
        QueueFamily::Graphics,
        QueueFamily::Compute,
        QueueFamily::Transfer,
        QueueFamily::Present,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// The lane that executes work in `stages`. Stage sets that are purely copies belong to the
    /// transfer lane and pure compute to the compute lane; everything else is graphics.
    pub fn for_stages(stages: vk::PipelineStageFlags2) -> QueueFamily {
        let transfer = vk::PipelineStageFlags2::TRANSFER
            | vk::PipelineStageFlags2::COPY
            | vk::PipelineStageFlags2::HOST;
        let compute = vk::PipelineStageFlags2::COMPUTE_SHADER;

        if stages.is_empty() {
            QueueFamily::Graphics
        } else if transfer.contains(stages) {
            QueueFamily::Transfer
        } else if compute.contains(stages) {
            QueueFamily::Compute
        } else {
            QueueFamily::Graphics
        }
    }
}

/// Physical queue-family index for every logical lane on one device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Every lane on one family, as on most integrated devices.
    pub fn unified(index: u32) -> Self {
        Self {
            graphics: index,
            compute: index,
            transfer: index,
            present: index,
        }
    }

    pub fn index(&self, family: QueueFamily) -> u32 {
        match family {
            QueueFamily::Graphics => self.graphics,
            QueueFamily::Compute => self.compute,
            QueueFamily::Transfer => self.transfer,
            QueueFamily::Present => self.present,
        }
    }

    pub fn has_dedicated_present_queue(&self) -> bool {
        self.present != self.graphics
    }

    /// Whether two lanes execute on different physical families and need ownership transfers.
    pub fn is_cross_family(&self, a: QueueFamily, b: QueueFamily) -> bool {
        self.index(a) != self.index(b)
    }

    /// Distinct physical indices, graphics first.
    pub fn unique_indices(&self) -> SmallVec<[u32; 4]> {
        let mut indices = SmallVec::new();
        for family in QueueFamily::ALL {
            let index = self.index(family);
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }
}

/// Queue-family candidates found while probing a physical device.
#[derive(Clone, Copy, Default, Debug)]
pub struct QueueFamilyProbe {
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyProbe {
    /// Resolves the probe, falling back to the graphics family for lanes without a dedicated
    /// family. Graphics and present are mandatory.
    pub fn resolve(self) -> Result<QueueFamilies, RenderError> {
        let graphics = self
            .graphics
            .ok_or(RenderError::MissingQueueFamily(QueueFamily::Graphics))?;
        let present = self
            .present
            .ok_or(RenderError::MissingQueueFamily(QueueFamily::Present))?;
        Ok(QueueFamilies {
            graphics,
            compute: self.compute.unwrap_or(graphics),
            transfer: self.transfer.unwrap_or(graphics),
            present,
        })
    }
}

use std::fmt;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    render::{
        queue::QueueFamily,
        timeline::{
            barrier::ResourceDependency,
            drawable::{Dispatchable, Drawable},
        },
    },
    resource::ResourceKey,
};

/// Terminal step of a command group.
#[derive(Clone, Copy, Debug)]
pub struct Submit {
    pub family: QueueFamily,
    /// Stages whose completion later groups (and the next use of this slot) can wait on.
    pub signal_at: vk::PipelineStageFlags2,
    /// Destination stages blocked until earlier groups of the frame have signalled.
    pub wait_for: vk::PipelineStageFlags2,
    pub present: bool,
}

impl Submit {
    pub fn new(family: QueueFamily) -> Self {
        Self {
            family,
            signal_at: vk::PipelineStageFlags2::ALL_COMMANDS,
            wait_for: vk::PipelineStageFlags2::ALL_COMMANDS,
            present: false,
        }
    }

    pub fn signal_at(mut self, stages: vk::PipelineStageFlags2) -> Self {
        self.signal_at = stages;
        self
    }

    pub fn wait_for(mut self, stages: vk::PipelineStageFlags2) -> Self {
        self.wait_for = stages;
        self
    }

    pub fn present(mut self) -> Self {
        self.present = true;
        self
    }
}

/// Device-to-device copy between two pooled segments of the current slot.
#[derive(Clone, Copy, Debug)]
pub struct CopyStep {
    pub family: QueueFamily,
    pub src: ResourceKey,
    pub dst: ResourceKey,
    pub size: u64,
    pub src_offset: u64,
    pub dst_offset: u64,
}

pub enum Step {
    AcquireImage,
    Initialize(QueueFamily),
    Draw {
        family: QueueFamily,
        drawable: Box<dyn Drawable>,
    },
    Dispatch {
        family: QueueFamily,
        dispatchable: Box<dyn Dispatchable>,
    },
    ResourceDependency(ResourceDependency),
    CommitTransfers(QueueFamily),
    Copy(CopyStep),
    Submit(Submit),
}

impl Step {
    pub fn ends_command_group(&self) -> bool {
        matches!(self, Step::AcquireImage | Step::Submit(_))
    }

    pub fn family(&self) -> Option<QueueFamily> {
        match self {
            Step::AcquireImage => None,
            Step::Initialize(family) | Step::CommitTransfers(family) => Some(*family),
            Step::Draw { family, .. } | Step::Dispatch { family, .. } => Some(*family),
            Step::ResourceDependency(dependency) => Some(dependency.family),
            Step::Copy(copy) => Some(copy.family),
            Step::Submit(submit) => Some(submit.family),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::AcquireImage => "AcquireImage",
            Step::Initialize(_) => "Initialize",
            Step::Draw { .. } => "Draw",
            Step::Dispatch { .. } => "Dispatch",
            Step::ResourceDependency(_) => "ResourceDependency",
            Step::CommitTransfers(_) => "CommitTransfers",
            Step::Copy(_) => "Copy",
            Step::Submit(_) => "Submit",
        }
    }

    /// Resource keys the step touches.
    pub fn resources(&self) -> SmallVec<[ResourceKey; 4]> {
        match self {
            Step::Draw { drawable, .. } => drawable.bindings().iter().copied().collect(),
            Step::Dispatch { dispatchable, .. } => {
                dispatchable.bindings().iter().copied().collect()
            }
            Step::ResourceDependency(dependency) => dependency.keys.clone(),
            Step::Copy(copy) => SmallVec::from_slice(&[copy.src, copy.dst]),
            _ => SmallVec::new(),
        }
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self, Step::Submit(Submit { present: true, .. }))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Draw { family, drawable } => {
                write!(f, "Draw({:?}, {})", family, drawable.name())
            }
            Step::Dispatch {
                family,
                dispatchable,
            } => write!(f, "Dispatch({:?}, {})", family, dispatchable.name()),
            other => match other.family() {
                Some(family) => write!(f, "{}({:?})", other.kind(), family),
                None => f.write_str(other.kind()),
            },
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

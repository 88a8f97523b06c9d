use ash::vk;

use crate::{render::QueueFamily, resource::ResourceKey};

/// Broad category of a [`RenderError`], used by callers to decide whether a window can continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed schema or timeline, caught before any device object exists.
    Configuration,
    /// A GPU-API failure reported by the driver.
    Device,
    /// A call that would otherwise corrupt engine state.
    Programmer,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("resource {0} is declared more than once")]
    DuplicateResource(ResourceKey),

    #[error("resource {key} has an invalid descriptor: {reason}")]
    InvalidDescriptor {
        key: ResourceKey,
        reason: &'static str,
    },

    #[error("invalid timeline: {0}")]
    InvalidTimeline(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource {0} is not declared in the resource table")]
    UnknownResource(ResourceKey),

    #[error("no {0:?} queue family is available")]
    MissingQueueFamily(QueueFamily),

    #[error("resource {key} needs {requested} bytes but its capacity is {capacity}")]
    Capacity {
        key: ResourceKey,
        requested: u64,
        capacity: u64,
    },

    #[error("resource {0} is not host visible")]
    HostAccess(ResourceKey),

    #[error("step {step} expected {expected:?} recording but found {found:?}")]
    RecordingState {
        step: usize,
        expected: Option<QueueFamily>,
        found: Option<QueueFamily>,
    },

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unsupported by the device: {0:?}")]
    Unsupported(vk::Result),

    #[error("vulkan call failed: {0:?}")]
    Vulkan(vk::Result),
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::DuplicateResource(_)
            | RenderError::InvalidDescriptor { .. }
            | RenderError::InvalidTimeline(_)
            | RenderError::InvalidConfig(_) => ErrorClass::Configuration,
            RenderError::UnknownResource(_)
            | RenderError::MissingQueueFamily(_)
            | RenderError::Capacity { .. }
            | RenderError::HostAccess(_)
            | RenderError::RecordingState { .. } => ErrorClass::Programmer,
            RenderError::OutOfHostMemory
            | RenderError::OutOfDeviceMemory
            | RenderError::DeviceLost
            | RenderError::Timeout(_)
            | RenderError::Unsupported(_)
            | RenderError::Vulkan(_) => ErrorClass::Device,
        }
    }

    /// Maps a raw API result code into the engine's error space.
    pub fn from_vk(result: vk::Result, waiting_on: &'static str) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => RenderError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => RenderError::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => RenderError::Timeout(waiting_on),
            vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER => RenderError::Unsupported(result),
            other => RenderError::Vulkan(other),
        }
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        RenderError::from_vk(result, "device")
    }
}

/// Finds the engine error at the root of an `anyhow` chain, if there is one.
pub fn render_error(err: &anyhow::Error) -> Option<&RenderError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RenderError>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn memory_codes_map_to_device_errors() {
        let err = RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, RenderError::OutOfDeviceMemory));
        assert_eq!(err.class(), ErrorClass::Device);

        let err = RenderError::from_vk(vk::Result::TIMEOUT, "frame slot");
        assert!(matches!(err, RenderError::Timeout("frame slot")));
    }

    #[test]
    fn root_cause_survives_context() {
        let result = Err::<(), _>(RenderError::UnknownResource(ResourceKey::new(7)))
            .context("failed to look up segment")
            .context("step 3 (Draw) failed");
        let err = result.unwrap_err();

        let root = render_error(&err).expect("render error in chain");
        assert!(matches!(root, RenderError::UnknownResource(k) if k.id() == 7));
        assert_eq!(root.class(), ErrorClass::Programmer);
    }
}

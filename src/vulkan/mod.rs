mod debug;
mod device;
mod device_context;
mod instance;
mod physical;
mod swapchain;

pub use device_context::DeviceContext;
pub use instance::InstanceContext;
pub use physical::probe_queue_families;
pub use swapchain::{Swapchain, SwapchainProperties, SwapchainSupportDetails};

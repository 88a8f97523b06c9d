pub mod app;
pub mod config;
pub mod error;
pub mod memory;
pub mod render;
pub mod resource;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Application;
pub use config::EngineConfig;
pub use error::{ErrorClass, RenderError, render_error};

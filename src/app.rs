use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use raw_window_handle::HasDisplayHandle;
use winit::{
    dpi::PhysicalSize,
    event_loop::ActiveEventLoop,
    window::{Window, WindowId},
};

use crate::{
    config::EngineConfig,
    render::{FrameContext, SurfaceSettings, Timeline, TimelineSetup, VulkanGpu},
    resource::ResourceTable,
    vulkan::{DeviceContext, InstanceContext},
};

/// Everything one open window renders with. Fields are torn down in declaration order after
/// the pipelines are released: frame resources and surface first, the native window last.
struct WindowState {
    frame: FrameContext<VulkanGpu>,
    timeline: Timeline,
    setup: TimelineSetup,
    window: Window,
}

impl WindowState {
    fn is_minimized(&self) -> bool {
        let size = self.window.inner_size();
        size.width == 0 || size.height == 0
    }
}

impl Drop for WindowState {
    fn drop(&mut self) {
        log::trace!("Destroying window state");
        if let Err(e) = self.frame.wait_idle() {
            log::error!("Failed to drain window before teardown: {:#}", e);
        }
        self.setup.release(self.frame.gpu_mut());
    }
}

/// Owns the Vulkan instance, the device shared by every window and the windows themselves.
pub struct Application {
    windows: HashMap<WindowId, WindowState>,
    device: Option<Arc<DeviceContext>>,
    instance: Arc<InstanceContext>,
    config: EngineConfig,
}

impl Application {
    pub fn create(display: &impl HasDisplayHandle, config: EngineConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let instance = InstanceContext::new(&config.app_name, display, config.validation)
            .context("failed to create Vulkan instance")?;
        log::debug!("Created application {}", config.app_name);
        Ok(Self {
            windows: HashMap::new(),
            device: None,
            instance: Arc::new(instance),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a window rendering `timeline` over resources declared by `table`. The first window
    /// also selects and creates the device.
    pub fn add_window(
        &mut self,
        event_loop: &ActiveEventLoop,
        title: &str,
        table: Arc<ResourceTable>,
        timeline: Timeline,
    ) -> anyhow::Result<WindowId> {
        let [width, height] = self.config.window_size;
        let window = event_loop
            .create_window(
                Window::default_attributes()
                    .with_title(title)
                    .with_inner_size(PhysicalSize::new(width, height)),
            )
            .context("failed to create window")?;
        let surface = self
            .instance
            .create_surface(&window)
            .context("failed to create window surface")?;

        let device = match &self.device {
            Some(device) => device.clone(),
            None => match DeviceContext::new(self.instance.clone(), surface) {
                Ok(device) => {
                    let device = Arc::new(device);
                    self.device = Some(device.clone());
                    device
                }
                Err(e) => {
                    self.instance.destroy_surface(surface);
                    return Err(e.context("failed to create device"));
                }
            },
        };

        let size = window.inner_size();
        let settings = SurfaceSettings {
            present_mode: self.config.present_mode,
            size: [size.width, size.height],
        };
        let gpu = VulkanGpu::new(
            device,
            surface,
            settings,
            self.config.pipeline_depth,
            self.config.frame_timeout,
        )
        .with_context(|| format!("failed to set up window {:?}", title))?;
        let mut frame = FrameContext::new(gpu, table, self.config.frame_config())?;
        let setup = timeline
            .setup(&mut frame)
            .with_context(|| format!("failed to set up the timeline of window {:?}", title))?;

        let id = window.id();
        self.windows.insert(
            id,
            WindowState {
                frame,
                timeline,
                setup,
                window,
            },
        );
        log::debug!("Opened window {:?} ({:?})", title, id);
        Ok(id)
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id).map(|state| &state.window)
    }

    /// The frame context of a window, e.g. to write segments or register swapchain callbacks.
    pub fn frame_mut(&mut self, id: WindowId) -> Option<&mut FrameContext<VulkanGpu>> {
        self.windows.get_mut(&id).map(|state| &mut state.frame)
    }

    pub fn window_ids(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.windows.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Runs one timeline pass per open, visible window. Every window is attempted; the first
    /// failure is returned.
    pub fn render(&mut self) -> anyhow::Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("render windows");

        let mut first_error = None;
        for (id, state) in &mut self.windows {
            if state.is_minimized() {
                continue;
            }
            let result = state
                .timeline
                .render(&state.setup, &mut state.frame)
                .with_context(|| format!("failed to render window {:?}", id));
            if let Err(e) = result {
                log::warn!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Blocks until every queue has drained.
    pub fn join(&mut self) -> anyhow::Result<()> {
        for state in self.windows.values_mut() {
            state.frame.wait_idle()?;
        }
        if let Some(device) = &self.device {
            device.wait_idle()?;
        }
        Ok(())
    }

    pub fn resize_window(&mut self, id: WindowId, size: PhysicalSize<u32>) {
        if let Some(state) = self.windows.get_mut(&id) {
            log::debug!("Window {:?} resized to {}x{}", id, size.width, size.height);
            state
                .frame
                .gpu_mut()
                .set_window_size([size.width, size.height]);
            state.frame.invalidate_surface();
        }
    }

    pub fn request_redraws(&self) {
        for state in self.windows.values() {
            state.window.request_redraw();
        }
    }

    pub fn close_window(&mut self, id: WindowId) -> bool {
        let closed = self.windows.remove(&id).is_some();
        if closed {
            log::debug!("Closed window {:?}", id);
        }
        closed
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        log::trace!("Destroying Application");
        if let Err(e) = self.join() {
            log::error!("Failed to drain device before teardown: {:#}", e);
        }
        self.windows.clear();
        self.device = None;
    }
}

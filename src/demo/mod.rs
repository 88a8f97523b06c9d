mod pipeline;
mod scene;

use std::{cell::Cell, collections::HashMap, rc::Rc, time::Instant};

use anyhow::Context;
use ash::vk;
use cadence::{Application, EngineConfig};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    window::WindowId,
};

#[derive(Default)]
pub enum AppState {
    #[default]
    Running,
    FatalError(anyhow::Error),
}

/// Animated quads in one window, redrawn continuously.
pub struct Demo {
    config: EngineConfig,
    app: Option<Application>,
    extents: HashMap<WindowId, Rc<Cell<vk::Extent2D>>>,
    started: Instant,
    pub app_state: AppState,
}

impl Demo {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            app: None,
            extents: HashMap::new(),
            started: Instant::now(),
            app_state: AppState::Running,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let mut app = Application::create(event_loop, self.config.clone())
            .context("failed to create application")?;
        let title = self.config.app_name.clone();
        let id = app.add_window(
            event_loop,
            &title,
            scene::resource_table()?,
            scene::timeline()?,
        )?;

        let frame = app
            .frame_mut(id)
            .context("window vanished right after opening")?;
        let extent = Rc::new(Cell::new(frame.extent()));
        let observed = extent.clone();
        frame.on_swapchain_updated(move |updated| observed.set(updated));
        scene::upload_indices(frame)?;

        self.extents.insert(id, extent);
        self.app = Some(app);
        Ok(())
    }

    fn draw(&mut self) -> anyhow::Result<()> {
        let Some(app) = self.app.as_mut() else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("demo frame");

        let seconds = self.started.elapsed().as_secs_f32();
        for (id, extent) in &self.extents {
            if let Some(frame) = app.frame_mut(*id) {
                frame.wait_for_slot()?;
                scene::update(frame, extent.get(), seconds)?;
            }
        }
        app.render()
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(mut app) = self.app.take() {
            app.join().context("failed to drain before shutdown")?;
        }
        self.extents.clear();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.app_state = AppState::FatalError(e);
        self.extents.clear();
        self.app = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for Demo {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.app.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::debug!("The close button was pressed; stopping");
                if let Some(app) = self.app.as_mut() {
                    app.close_window(id);
                }
                self.extents.remove(&id);
                if self.extents.is_empty() {
                    if let Err(e) = self.shutdown() {
                        self.app_state = AppState::FatalError(e);
                    }
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(app) = self.app.as_mut() {
                    app.resize_window(id, size);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw() {
                    self.fail(event_loop, e);
                    return;
                }
                if let Some(window) = self.app.as_ref().and_then(|app| app.window(id)) {
                    window.request_redraw();
                }
            }
            _ => (),
        }
    }
}

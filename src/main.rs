use anyhow::Context;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use winit::event_loop::{ControlFlow, EventLoop};

use cadence::EngineConfig;

use crate::demo::{AppState, Demo};

mod demo;

const LOG_CONFIG: &str = "log4rs.yml";

fn init_logging() -> anyhow::Result<()> {
    if std::path::Path::new(LOG_CONFIG).exists() {
        return log4rs::init_file(LOG_CONFIG, Default::default())
            .context("failed to load logging config file");
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} {h({l:5})} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .context("failed to build logging config")?;
    log4rs::init_config(config).context("failed to initialize logging")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging()?;

    #[cfg(feature = "tracing")]
    let _client = tracy_client::Client::start();

    let config = EngineConfig::from_env().context("failed to read engine configuration")?;
    log::info!(
        "Starting {} with pipeline depth {}",
        config.app_name,
        config.pipeline_depth
    );

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut demo = Demo::new(config);
    event_loop
        .run_app(&mut demo)
        .context("failed to run application")?;

    if let AppState::FatalError(e) = &demo.app_state {
        log::error!("{:?}", e);
    }

    Ok(())
}

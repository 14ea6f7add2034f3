mod build_config;
mod dispatcher;
mod env;
mod event;
mod executors;
mod message;
mod once_map;
mod recovery;
mod server;
mod settings;
mod tracking;

use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, Result};
use dispatcher::{Dispatcher, Processor};
use executors::{AwsExecutorFactory, RegionalExecutors};
use log::{debug, info};
use settings::Settings;
use simplelog::LevelFilter;
use tokio_util::sync::CancellationToken;
use tracking::HttpTrackerFactory;

const VERSION: &str = env!("CARGO_PKG_VERSION");
static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "build-dispatcher/{} ({}, {})",
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;

    let level: LevelFilter = settings
        .core
        .log_level
        .parse()
        .map_err(|_| anyhow!("invalid log level '{}'", settings.core.log_level))?;
    simplelog::SimpleLogger::init(level, simplelog::Config::default())?;
    debug!("{:?}", settings);

    recovery::install_hook();

    let executors = RegionalExecutors::new(AwsExecutorFactory::new(
        settings.eks.clone(),
        settings.serverless.clone(),
    ));
    let trackers = HttpTrackerFactory::new(&settings.tracking)?;
    let processor = Processor::new(executors, trackers, settings.core.stacktrace_dir());
    let dispatcher = Arc::new(Dispatcher::new(processor));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        on_signal.cancel();
    })?;

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.core.port)).await?;
    info!("{} listening on {}", *USER_AGENT, listener.local_addr()?);

    let app = server::router(dispatcher, shutdown.clone(), settings.core.max_body_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Server stopped");
    Ok(())
}

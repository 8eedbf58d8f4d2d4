mod audio;
mod http;
mod mqtt;
mod pipeline;
mod recover;
mod service;
mod session;
mod supervisor;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use streamer_proto::config::Config;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::audio::NetworkBackend;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup stdout + file logging
    let data_dir = streamer_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("streamer.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,radio_streamer=debug,streamer_proto=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let backend = NetworkBackend::new(&config.source, tokio::runtime::Handle::current())?;
    let supervisor = Supervisor::new(config, Arc::new(backend))?;

    supervisor.run().await?;
    info!("Stopped");
    Ok(())
}

/// Process supervisor: builds one generation of components, waits for a
/// signal, the scheduled restart, or a fatal error, then tears down.
///
/// ```text
///   ┌─► build session + service ─► resume if was_playing ─► start adapters
///   │                                                           │
///   │       signal ──────────► stop all, close output ─► exit 0 │
///   │       fatal  ──────────► exit with error                  │
///   └─ sleep ◄─ stop all ◄─── restart deadline ◄────────────────┘
/// ```
///
/// The output host and the audio backend outlive generations; only the
/// "was it playing" flag crosses a restart.
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use streamer_proto::config::Config;
use streamer_proto::selection::{SelectionStore, YamlSelectionStore};
use streamer_proto::stations::StationList;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http;
use crate::mqtt::{Dispatcher, MqttListener};
use crate::pipeline::{AudioBackend, OutputHost};
use crate::recover::{fatal_channel, FatalSender};
use crate::service::ControlService;
use crate::session::Session;

/// How long adapters get to wind down before they are abandoned.
const ADAPTER_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: Config,
    stations: StationList,
    selection_path: PathBuf,
    backend: Arc<dyn AudioBackend>,
    output: Arc<OutputHost>,
}

struct Generation {
    service: Arc<ControlService>,
    shutdown: CancellationToken,
    adapters: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Reads the station list once; it does not change while the process
    /// lives.
    pub fn new(config: Config, backend: Arc<dyn AudioBackend>) -> anyhow::Result<Self> {
        let selection_path = config.selection.resolved_path();
        let record = YamlSelectionStore::new(&selection_path)
            .load()
            .with_context(|| format!("cannot load selection from {:?}", selection_path))?;
        info!(
            "{} stations loaded from {:?}",
            record.streams.len(),
            selection_path
        );

        Ok(Self {
            config,
            stations: StationList::new(record.streams),
            selection_path,
            backend,
            output: Arc::new(OutputHost::new()),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (fatal_tx, mut fatal_rx) = fatal_channel();
        let mut was_playing = false;

        loop {
            info!("starting application");
            let generation = self.start_generation(&fatal_tx, was_playing).await?;

            let restart_in = self.config.restart.interval();
            if let Ok(delta) = chrono::Duration::from_std(restart_in) {
                info!("scheduled application restart time: {}", (Local::now() + delta).to_rfc3339());
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("got termination signal, stopping application");
                    generation.stop().await;
                    if let Err(e) = self.output.shutdown() {
                        warn!("closing audio output failed: {}", e);
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(restart_in) => {
                    info!("got restart signal, stopping application");
                    was_playing = generation.service.is_radio_playing().await;
                    generation.stop().await;
                    tokio::time::sleep(self.config.restart.recovery_delay()).await;
                }
                Some(err) = fatal_rx.recv() => {
                    error!("got runtime error: {:#}", err);
                    return Err(err);
                }
            }
        }
    }

    async fn start_generation(
        &self,
        fatal: &FatalSender,
        was_playing: bool,
    ) -> anyhow::Result<Generation> {
        let store = YamlSelectionStore::new(&self.selection_path);
        let (station, volume) = match store.load() {
            Ok(record) => (record.current_stream, record.volume().unwrap_or(0.5)),
            Err(e) => {
                warn!("selection unreadable, starting from defaults: {}", e);
                (1, 0.5)
            }
        };

        let session = Session::new(
            self.stations.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.output),
        )
        .starting_at(station)
        .with_volume(volume);
        let mut states = session.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().to_string();
                debug!("session: {}", state);
            }
        });
        let session_fatal = fatal.clone();
        session.on_error(move |err| {
            let _ = session_fatal.send(anyhow::Error::new(err).context("playback failed"));
        });

        let service = Arc::new(ControlService::new(session, Box::new(store)));
        if was_playing {
            info!("resuming playback");
            service
                .play_radio()
                .await
                .context("cannot resume playback")?;
        }

        let shutdown = CancellationToken::new();
        let mut adapters = Vec::new();
        let step = self.config.volume.step;

        if self.config.http.enabled {
            let app = http::router(Arc::clone(&service), step, fatal.clone());
            let address = self.config.http.address.clone();
            let token = shutdown.clone();
            adapters.push(spawn_adapter("http", fatal.clone(), async move {
                http::serve(&address, app, token).await
            }));
        }

        if self.config.mqtt.enabled {
            let dispatcher = Dispatcher::new(
                self.config.mqtt.actions.clone(),
                Arc::clone(&service),
                step,
                fatal.clone(),
            );
            let listener = MqttListener::new(&self.config.mqtt, dispatcher)?;
            adapters.push(spawn_adapter(
                "mqtt",
                fatal.clone(),
                listener.run(shutdown.clone()),
            ));
        }

        Ok(Generation {
            service,
            shutdown,
            adapters,
        })
    }
}

impl Generation {
    /// Stops the adapters, then closes the service.
    async fn stop(self) {
        self.shutdown.cancel();
        for adapter in self.adapters {
            if tokio::time::timeout(ADAPTER_GRACE, adapter).await.is_err() {
                warn!("adapter did not stop within {:?}", ADAPTER_GRACE);
            }
        }
        if let Err(e) = self.service.close().await {
            warn!("closing control service failed: {}", e);
        }
        debug!("generation stopped");
    }
}

/// Runs an adapter; an error exit is fatal, a clean exit is not.
fn spawn_adapter<F>(name: &'static str, fatal: FatalSender, adapter: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = adapter.await {
            let _ = fatal.send(e.context(format!("{} adapter stopped", name)));
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
}

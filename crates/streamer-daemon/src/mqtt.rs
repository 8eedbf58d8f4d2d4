/// MQTT control listener.
///
/// Subscribes to one topic; every payload is a button token looked up in the
/// configured token table.  Unknown tokens are ignored.  Each matched action
/// runs on its own task so a slow verb never stalls the event loop.  A lost
/// broker connection is retried.
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::FutureExt;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use streamer_proto::config::MqttConfig;
use streamer_proto::protocol::Action;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::recover::{forward_panic, FatalSender};
use crate::service::ControlService;

const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Maps a payload to its action. Surrounding whitespace is ignored.
pub fn resolve(actions: &BTreeMap<String, Action>, payload: &[u8]) -> Option<Action> {
    let token = std::str::from_utf8(payload).ok()?.trim();
    actions.get(token).copied()
}

/// Runs matched actions against the control service.
#[derive(Clone)]
pub struct Dispatcher {
    actions: BTreeMap<String, Action>,
    service: Arc<ControlService>,
    step: f64,
    fatal: FatalSender,
}

impl Dispatcher {
    pub fn new(
        actions: BTreeMap<String, Action>,
        service: Arc<ControlService>,
        step: f64,
        fatal: FatalSender,
    ) -> Self {
        Self {
            actions,
            service,
            step,
            fatal,
        }
    }

    /// Spawns the handler for `payload`, or returns `None` for an unknown
    /// token.
    pub fn dispatch(&self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let Some(action) = resolve(&self.actions, payload) else {
            debug!("MQTT: ignoring token {:?}", String::from_utf8_lossy(payload));
            return None;
        };

        let service = Arc::clone(&self.service);
        let fatal = self.fatal.clone();
        let step = self.step;
        Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(service.perform(action, step))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => debug!("MQTT: {:?} done", action),
                Ok(Err(e)) => error!("MQTT: {:?} failed: {}", action, e),
                Err(payload) => {
                    forward_panic(&fatal, "mqtt", &*payload);
                }
            }
        }))
    }
}

pub struct MqttListener {
    options: MqttOptions,
    topic: String,
    dispatcher: Dispatcher,
}

impl MqttListener {
    pub fn new(config: &MqttConfig, dispatcher: Dispatcher) -> anyhow::Result<Self> {
        let (host, port) = config.host_port()?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_credentials(config.user.clone(), config.password.clone());
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        Ok(Self {
            options,
            topic: config.topic.clone(),
            dispatcher,
        })
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Failing to reach the broker the first time is an error.  Once
    /// connected, a dropped link is logged and retried; the ConnAck that
    /// follows each reconnect resubscribes.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (host, port) = self.options.broker_address();
        info!("MQTT: connecting to {}:{} as {}", host, port, self.options.client_id());
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let mut connected = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    connected = true;
                    info!("MQTT: connected ({:?}), subscribing to {}", ack.code, self.topic);
                    client
                        .subscribe(self.topic.clone(), QoS::AtMostOnce)
                        .await
                        .context("MQTT subscribe failed")?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    info!(
                        "MQTT [{}] {}",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                    self.dispatcher.dispatch(&publish.payload);
                }
                Ok(_) => {}
                Err(e) if !connected => {
                    return Err(anyhow::Error::new(e).context("MQTT connection failed"));
                }
                Err(e) => {
                    warn!("MQTT: connection lost: {}, retrying in {:?}", e, RECONNECT_DELAY);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = client.disconnect().await {
            debug!("MQTT: disconnect failed: {}", e);
        }
        info!("MQTT listener stopped");
        Ok(())
    }
}

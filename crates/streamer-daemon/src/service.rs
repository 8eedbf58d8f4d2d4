/// The control service: every external verb runs here, under one lock.
///
/// Each verb is a single transaction of {read selection, drive the session,
/// write selection}.  The selection file is re-read on every verb and never
/// cached, so edits made while the daemon runs are picked up by the next
/// verb.
use streamer_proto::protocol::{Action, RadioStatus};
use streamer_proto::selection::{clamp_volume, SelectionStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pipeline::PipelineError;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

struct Radio {
    session: Session,
    store: Box<dyn SelectionStore>,
}

pub struct ControlService {
    radio: Mutex<Radio>,
}

impl ControlService {
    pub fn new(session: Session, store: Box<dyn SelectionStore>) -> Self {
        Self {
            radio: Mutex::new(Radio { session, store }),
        }
    }

    /// Idempotent: a live session is left alone and the store is not read.
    pub async fn play_radio(&self) -> Result<(), ServiceError> {
        let radio = self.radio.lock().await;
        if radio.session.is_live() {
            debug!("play: already playing");
            return Ok(());
        }
        radio.start().await
    }

    pub async fn stop_radio(&self) -> Result<(), ServiceError> {
        let radio = self.radio.lock().await;
        if radio.session.is_live() {
            radio.session.stop().await;
        }
        Ok(())
    }

    /// Power button: stop when live, otherwise play.
    pub async fn toggle_radio(&self) -> Result<(), ServiceError> {
        let radio = self.radio.lock().await;
        if radio.session.is_live() {
            info!("power: stopping");
            radio.session.stop().await;
            return Ok(());
        }

        info!("power: starting");
        radio.start().await
    }

    pub async fn is_radio_playing(&self) -> bool {
        self.radio.lock().await.session.is_live()
    }

    pub async fn next_radio_stream(&self) -> Result<usize, ServiceError> {
        let radio = self.radio.lock().await;
        let number = radio.session.next().await;
        radio.persist_station(number)?;
        Ok(number)
    }

    pub async fn prev_radio_stream(&self) -> Result<usize, ServiceError> {
        let radio = self.radio.lock().await;
        let number = radio.session.prev().await;
        radio.persist_station(number)?;
        Ok(number)
    }

    pub async fn up_volume(&self, step: f64) -> Result<f64, ServiceError> {
        self.shift_volume(step).await
    }

    pub async fn down_volume(&self, step: f64) -> Result<f64, ServiceError> {
        self.shift_volume(-step).await
    }

    async fn shift_volume(&self, delta: f64) -> Result<f64, ServiceError> {
        let radio = self.radio.lock().await;
        let level = clamp_volume(radio.session.volume().await + delta);
        radio.session.set_volume(level).await;

        let mut record = radio.store.load()?;
        record.set_volume(level);
        radio.store.store(&record)?;
        debug!("volume set to {}", record.current_volume);
        Ok(level)
    }

    pub async fn close(&self) -> Result<(), ServiceError> {
        let radio = self.radio.lock().await;
        if !radio.session.is_live() {
            return Ok(());
        }
        radio.session.close().await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<RadioStatus, ServiceError> {
        let radio = self.radio.lock().await;
        let record = radio.store.load()?;
        Ok(RadioStatus {
            playing: radio.session.is_live(),
            station: record.current_stream,
            volume: record.current_volume,
        })
    }

    /// Runs the verb bound to `action`. `step` is used by the volume verbs.
    pub async fn perform(&self, action: Action, step: f64) -> Result<(), ServiceError> {
        match action {
            Action::Power => self.toggle_radio().await,
            Action::NextStream => self.next_radio_stream().await.map(drop),
            Action::PrevStream => self.prev_radio_stream().await.map(drop),
            Action::VolumeUp => self.up_volume(step).await.map(drop),
            Action::VolumeDown => self.down_volume(step).await.map(drop),
        }
    }
}

impl Radio {
    /// Applies the stored volume, then plays the stored station.
    async fn start(&self) -> Result<(), ServiceError> {
        let record = self.store.load()?;
        let volume = record.volume()?;
        self.session.set_volume(volume).await;
        self.session.play(record.current_stream);
        Ok(())
    }

    /// The session pointer has already moved; a failure here leaves the
    /// file behind it until the next successful write.
    fn persist_station(&self, number: usize) -> Result<(), StoreError> {
        let mut record = self.store.load()?;
        record.current_stream = number;
        self.store.store(&record)
    }
}

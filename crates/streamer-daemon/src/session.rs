/// Playback session: owner of at most one live pipeline.
///
/// ```text
///   Session (async callers)                 session thread
///   ───────────────────────                 ──────────────
///   play() ── spawn ──────────────────────► open pipeline ─► Active
///   next()/prev() ── Control::Switch ─────► close + reopen
///   set_volume()  ── Control::SetVolume ──► sink.set_volume
///   volume()      ── Control::Volume ◄────► reply
///   stop()        ── Control::Stop ───────► close ─► Idle ─► ack
/// ```
///
/// The control sender lives inside `SessionState::{Starting, Active}`, so a
/// caller can only reach the loop while the state says it is live.  Sends go
/// through a bounded channel and replies come back over oneshots: if the loop
/// has already exited the send or the reply fails instead of blocking.
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use streamer_proto::selection::clamp_volume;
use streamer_proto::stations::StationList;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::pipeline::{AudioBackend, OutputHost, Pipeline, PipelineError};
use crate::recover::panic_message;

const CONTROL_CAPACITY: usize = 8;

pub type ErrorHandler = Arc<dyn Fn(PipelineError) + Send + Sync>;

#[derive(Debug)]
pub enum Control {
    Switch {
        station: usize,
    },
    SetVolume {
        level: f64,
    },
    Volume {
        reply: oneshot::Sender<f64>,
    },
    Stop {
        ack: oneshot::Sender<Result<(), PipelineError>>,
    },
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    /// A pipeline for `station` is being built.
    Starting {
        station: usize,
        control: mpsc::Sender<Control>,
    },
    /// Audio is flowing.
    Active {
        station: usize,
        control: mpsc::Sender<Control>,
    },
    Stopping,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    /// Starting or Active: a loop is running and accepts controls.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Starting { .. } | SessionState::Active { .. }
        )
    }

    /// 0-based station of the pipeline being built or playing.
    pub fn station(&self) -> Option<usize> {
        match self {
            SessionState::Starting { station, .. } | SessionState::Active { station, .. } => {
                Some(*station)
            }
            _ => None,
        }
    }

    fn live_control(&self) -> Option<mpsc::Sender<Control>> {
        match self {
            SessionState::Starting { control, .. } | SessionState::Active { control, .. } => {
                Some(control.clone())
            }
            _ => None,
        }
    }

    fn active_control(&self) -> Option<mpsc::Sender<Control>> {
        match self {
            SessionState::Active { control, .. } => Some(control.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Stopping => f.write_str("stopping"),
            live => {
                let verb = if live.is_active() { "playing" } else { "starting" };
                let number = live.station().map_or(0, StationList::number_of);
                write!(f, "{} station {}", verb, number)
            }
        }
    }
}

struct Shared {
    stations: StationList,
    backend: Arc<dyn AudioBackend>,
    output: Arc<OutputHost>,
    state: watch::Sender<SessionState>,
    cursor: AtomicUsize,
    last_volume: Mutex<f64>,
    on_error: RwLock<ErrorHandler>,
}

impl Shared {
    fn report(&self, err: PipelineError) {
        let handler = self
            .on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler(err);
    }

    fn last_volume(&self) -> f64 {
        *self.last_volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_control(&self) -> Option<mpsc::Sender<Control>> {
        self.state.borrow().live_control()
    }

    fn active_control(&self) -> Option<mpsc::Sender<Control>> {
        self.state.borrow().active_control()
    }

    fn open(&self, station: usize) -> Result<Pipeline, PipelineError> {
        let locator = self
            .stations
            .get(station)
            .ok_or_else(|| PipelineError::Source {
                locator: format!("#{}", StationList::number_of(station)),
                message: "no such station".to_string(),
            })?;
        Pipeline::open(
            self.backend.as_ref(),
            &self.output,
            locator,
            self.last_volume(),
        )
    }

    fn mark_active(&self) {
        self.state.send_if_modified(|state| match state {
            SessionState::Starting { station, control } => {
                let next = SessionState::Active {
                    station: *station,
                    control: control.clone(),
                };
                *state = next;
                true
            }
            _ => false,
        });
    }

    fn mark_starting(&self, target: usize) {
        self.state.send_if_modified(|state| match state {
            SessionState::Active { control, .. } | SessionState::Starting { control, .. } => {
                let next = SessionState::Starting {
                    station: target,
                    control: control.clone(),
                };
                *state = next;
                true
            }
            _ => false,
        });
    }
}

pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(stations: StationList, backend: Arc<dyn AudioBackend>, output: Arc<OutputHost>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let default_handler: ErrorHandler = Arc::new(|err| {
            error!("an error occurred while playing/stopping: {}", err);
        });
        Self {
            shared: Arc::new(Shared {
                stations,
                backend,
                output,
                state,
                cursor: AtomicUsize::new(0),
                last_volume: Mutex::new(0.5),
                on_error: RwLock::new(default_handler),
            }),
        }
    }

    /// Seeds the station pointer from a 1-based station number.
    pub fn starting_at(self, number: usize) -> Self {
        let index = self.shared.stations.resolve(number);
        self.shared.cursor.store(index, Ordering::SeqCst);
        self
    }

    pub fn with_volume(self, level: f64) -> Self {
        *self
            .shared
            .last_volume
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = clamp_volume(level);
        self
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(PipelineError) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.shared.state.borrow().is_idle()
    }

    pub fn is_live(&self) -> bool {
        self.shared.state.borrow().is_live()
    }

    /// 1-based number of the station the pointer is on.
    #[cfg(test)]
    pub fn station_number(&self) -> usize {
        StationList::number_of(self.shared.cursor.load(Ordering::SeqCst))
    }

    /// Starts playback in the background. Failures surface through the
    /// error handler, never here.
    pub fn play(&self, number: usize) {
        let shared = &self.shared;
        if shared.stations.is_empty() {
            debug!("play ignored: station list is empty");
            return;
        }

        let station = shared.stations.resolve(number);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let claimed = shared.state.send_if_modified(|state| {
            if state.is_idle() {
                *state = SessionState::Starting {
                    station,
                    control: control_tx,
                };
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("play ignored: session is {}", *shared.state.borrow());
            return;
        }

        shared.cursor.store(station, Ordering::SeqCst);
        info!("starting playback of station {}", StationList::number_of(station));

        let loop_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name("radio-session".to_string())
            .spawn(move || session_thread(loop_shared, station, control_rx));
        if let Err(e) = spawned {
            shared.state.send_replace(SessionState::Idle);
            shared.report(PipelineError::Spawn(e));
        }
    }

    pub async fn next(&self) -> usize {
        self.step(StationList::next_of).await
    }

    pub async fn prev(&self) -> usize {
        self.step(StationList::prev_of).await
    }

    async fn step(&self, advance: fn(&StationList, usize) -> usize) -> usize {
        let shared = &self.shared;
        let station = advance(&shared.stations, shared.cursor.load(Ordering::SeqCst));
        shared.cursor.store(station, Ordering::SeqCst);

        if let Some(control) = shared.live_control() {
            if control.send(Control::Switch { station }).await.is_err() {
                debug!("switch dropped: session loop already exited");
            }
        }
        StationList::number_of(station)
    }

    /// Live sink volume while active, otherwise the last value set.
    pub async fn volume(&self) -> f64 {
        if let Some(control) = self.shared.active_control() {
            let (reply, answer) = oneshot::channel();
            if control.send(Control::Volume { reply }).await.is_ok() {
                if let Ok(level) = answer.await {
                    return level;
                }
            }
        }
        self.shared.last_volume()
    }

    pub async fn set_volume(&self, level: f64) {
        let level = clamp_volume(level);
        *self
            .shared
            .last_volume
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = level;

        if let Some(control) = self.shared.live_control() {
            let _ = control.send(Control::SetVolume { level }).await;
        }
    }

    /// Teardown errors go to the error handler.
    pub async fn stop(&self) {
        if let Err(e) = self.request_stop().await {
            warn!("teardown failed: {}", e);
            self.shared.report(e);
        }
    }

    /// Shutdown path: stops the loop and returns the teardown result. The
    /// shared output context stays with the `OutputHost`.
    pub async fn close(&self) -> Result<(), PipelineError> {
        info!("closing playback session");
        self.request_stop().await
    }

    async fn request_stop(&self) -> Result<(), PipelineError> {
        let Some(control) = self.shared.live_control() else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        if control.send(Control::Stop { ack }).await.is_err() {
            return Ok(());
        }
        drop(control);
        // A dropped ack means the loop exited on its own first.
        done.await.unwrap_or(Ok(()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping the control sender lets the loop see a closed channel.
        let was_live = self.shared.state.send_if_modified(|state| {
            if state.is_live() {
                *state = SessionState::Stopping;
                true
            } else {
                false
            }
        });
        if was_live {
            debug!("session dropped while live, loop will wind down");
        }
    }
}

// ── session thread ───────────────────────────────────────────────────────────

fn session_thread(shared: Arc<Shared>, station: usize, control: mpsc::Receiver<Control>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_session(&shared, station, control)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(payload) => Some(PipelineError::Panicked(panic_message(&*payload))),
    };

    if let Some(e) = failure {
        shared.state.send_replace(SessionState::Idle);
        error!("playback session ended: {}", e);
        shared.report(e);
    }
}

/// Returns `Ok` only after it has put the state back to `Idle` itself.
fn run_session(
    shared: &Shared,
    station: usize,
    mut control: mpsc::Receiver<Control>,
) -> Result<(), PipelineError> {
    let mut pipeline = shared.open(station)?;
    shared.mark_active();

    loop {
        match control.try_recv() {
            Ok(Control::Switch { station }) => {
                info!("switching to station {}", StationList::number_of(station));
                shared.mark_starting(station);
                pipeline.close()?;
                pipeline = shared.open(station)?;
                shared.mark_active();
            }
            Ok(Control::SetVolume { level }) => pipeline.set_volume(level),
            Ok(Control::Volume { reply }) => {
                let _ = reply.send(pipeline.volume());
            }
            Ok(Control::Stop { ack }) => {
                info!("stopping playback of {}", pipeline.locator());
                shared.state.send_replace(SessionState::Stopping);
                let result = pipeline.close();
                shared.state.send_replace(SessionState::Idle);
                let _ = ack.send(result);
                return Ok(());
            }
            Err(TryRecvError::Empty) => {
                if let Err(e) = pipeline.pump() {
                    if let Err(close_err) = pipeline.close() {
                        warn!("teardown after playback failure: {}", close_err);
                    }
                    return Err(e);
                }
            }
            Err(TryRecvError::Disconnected) => {
                debug!("control channel closed, winding down");
                pipeline.close()?;
                shared.state.send_replace(SessionState::Idle);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stations, FakeBackend, Fault};
    use std::time::Duration;

    fn session(backend: &FakeBackend, locators: &[&str]) -> Session {
        Session::new(
            StationList::new(stations(locators)),
            Arc::new(backend.clone()),
            Arc::new(OutputHost::new()),
        )
    }

    async fn wait_until<F>(rx: &mut watch::Receiver<SessionState>, predicate: F)
    where
        F: FnMut(&SessionState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("session state channel closed");
    }

    fn collect_errors(session: &Session) -> mpsc::UnboundedReceiver<PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.on_error(move |e| {
            let _ = tx.send(e);
        });
        rx
    }

    async fn next_error(rx: &mut mpsc::UnboundedReceiver<PipelineError>) -> PipelineError {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for error")
            .expect("error channel closed")
    }

    #[tokio::test]
    async fn play_becomes_active_on_the_resolved_station() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b", "http://c"]);
        let mut states = session.subscribe();

        session.play(2);
        wait_until(&mut states, |s| s.is_active()).await;

        assert_eq!(session.subscribe().borrow().station(), Some(1));
        assert_eq!(session.station_number(), 2);
        assert_eq!(backend.opened(), vec!["http://b"]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_station_defaults_to_first() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b"]);
        let mut states = session.subscribe();

        session.play(9);
        wait_until(&mut states, |s| s.is_active()).await;
        assert_eq!(backend.opened(), vec!["http://a"]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn play_with_empty_station_list_is_a_no_op() {
        let backend = FakeBackend::new();
        let session = session(&backend, &[]);
        let mut errors = collect_errors(&session);

        session.play(1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.is_idle());
        assert!(backend.events().is_empty());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_play_while_live_builds_nothing() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b"]);
        let mut states = session.subscribe();

        session.play(1);
        session.play(2);
        wait_until(&mut states, |s| s.is_active()).await;
        session.play(2);

        assert_eq!(backend.opened(), vec!["http://a"]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn next_and_prev_while_idle_only_move_the_pointer() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b", "http://c"]).starting_at(3);

        assert_eq!(session.next().await, 1);
        assert_eq!(session.next().await, 2);
        assert_eq!(session.prev().await, 1);
        assert_eq!(session.prev().await, 3);

        assert!(session.is_idle());
        assert!(backend.events().is_empty());
    }

    #[tokio::test]
    async fn next_while_active_switches_the_pipeline() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b", "http://c"]);
        let mut states = session.subscribe();

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;

        assert_eq!(session.next().await, 2);
        wait_until(&mut states, |s| s.is_active() && s.station() == Some(1)).await;

        let events = backend.events();
        let closed_a = events.iter().position(|e| e == "close source http://a").unwrap();
        let opened_b = events.iter().position(|e| e == "open source http://b").unwrap();
        assert!(closed_a < opened_b, "{events:?}");
        assert_eq!(backend.contexts_created(), 1);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn stop_tears_down_before_returning() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a"]);
        let mut states = session.subscribe();

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        backend.clear_events();

        session.stop().await;

        assert!(session.is_idle());
        assert_eq!(
            backend.events(),
            vec!["close sink", "close decoder http://a", "close source http://a"]
        );
    }

    #[tokio::test]
    async fn stop_and_close_while_idle_do_nothing() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a"]);
        let mut errors = collect_errors(&session);

        session.stop().await;
        session.close().await.unwrap();

        assert!(backend.events().is_empty());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_of_stream_is_reported_and_session_goes_idle() {
        let backend = FakeBackend::new().with_frames(3);
        let session = session(&backend, &["http://a"]);
        let mut errors = collect_errors(&session);

        session.play(1);

        let err = next_error(&mut errors).await;
        assert!(matches!(err, PipelineError::EndOfStream(_)), "{err}");
        assert!(session.is_idle());
        assert!(backend.events().contains(&"close source http://a".to_string()));
    }

    #[tokio::test]
    async fn failed_start_is_reported_through_the_handler() {
        let backend = FakeBackend::new();
        backend.inject(Fault::Source);
        let session = session(&backend, &["http://a"]);
        let mut errors = collect_errors(&session);

        session.play(1);

        let err = next_error(&mut errors).await;
        assert!(matches!(err, PipelineError::Source { .. }), "{err}");
        assert!(session.is_idle());

        backend.heal(&Fault::Source);
        let mut states = session.subscribe();
        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn switch_to_a_broken_station_reports_and_goes_idle() {
        let backend = FakeBackend::new();
        backend.inject(Fault::SourceFor("http://b".to_string()));
        let session = session(&backend, &["http://a", "http://b"]);
        let mut states = session.subscribe();
        let mut errors = collect_errors(&session);

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        assert_eq!(session.next().await, 2);

        let err = next_error(&mut errors).await;
        assert!(err.to_string().contains("http://b"), "{err}");
        wait_until(&mut states, |s| s.is_idle()).await;
        assert_eq!(session.station_number(), 2);
    }

    #[tokio::test]
    async fn panics_in_the_loop_are_reported() {
        let backend = FakeBackend::new();
        backend.inject(Fault::Panic);
        let session = session(&backend, &["http://a"]);
        let mut errors = collect_errors(&session);

        session.play(1);

        match next_error(&mut errors).await {
            PipelineError::Panicked(message) => assert!(message.contains("decoder exploded")),
            other => panic!("unexpected error {other}"),
        }
        assert!(session.is_idle());
    }

    #[tokio::test]
    async fn volume_follows_the_live_sink_and_survives_rebuilds() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a", "http://b"]);
        let mut states = session.subscribe();

        session.set_volume(0.8).await;
        assert_eq!(session.volume().await, 0.8);

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        assert_eq!(session.volume().await, 0.8);

        session.set_volume(0.3).await;
        assert_eq!(session.volume().await, 0.3);

        session.next().await;
        wait_until(&mut states, |s| s.is_active() && s.station() == Some(1)).await;
        assert_eq!(session.volume().await, 0.3);

        session.set_volume(4.0).await;
        assert_eq!(session.volume().await, 1.0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn controls_never_hang_after_the_loop_exits_on_its_own() {
        for _ in 0..20 {
            let backend = FakeBackend::new().with_frames(2);
            let session = session(&backend, &["http://a", "http://b"]);
            let _errors = collect_errors(&session);

            session.play(1);
            let controls = async {
                session.next().await;
                session.set_volume(0.2).await;
                let _ = session.volume().await;
                session.stop().await;
            };
            tokio::time::timeout(Duration::from_secs(5), controls)
                .await
                .expect("control call blocked on an exited loop");
        }
    }

    #[tokio::test]
    async fn teardown_errors_on_stop_reach_the_handler() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a"]);
        let mut states = session.subscribe();
        let mut errors = collect_errors(&session);

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        backend.inject(Fault::SinkClose);
        session.stop().await;

        assert!(matches!(next_error(&mut errors).await, PipelineError::Output(_)));
        assert!(session.is_idle());
        assert!(backend.events().contains(&"close source http://a".to_string()));
    }

    #[tokio::test]
    async fn dropping_a_live_session_winds_the_loop_down() {
        let backend = FakeBackend::new();
        let session = session(&backend, &["http://a"]);
        let mut states = session.subscribe();

        session.play(1);
        wait_until(&mut states, |s| s.is_active()).await;
        drop(session);

        wait_until(&mut states, |s| s.is_idle()).await;
        assert!(backend.events().contains(&"close source http://a".to_string()));
    }
}

//! In-memory doubles for the audio backend and the selection store.

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use streamer_proto::selection::{SelectionRecord, SelectionStore, StoreError};

use crate::pipeline::{
    AudioBackend, Decoder, OutputContext, PipelineError, Sink, Source, StreamFormat,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Every source open fails.
    Source,
    /// Opening this particular locator fails.
    SourceFor(String),
    Handshake,
    SinkOpen,
    SinkClose,
    DecoderClose,
    SourceClose,
    /// The decoder panics on its first frame.
    Panic,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<String>>,
    faults: Mutex<HashSet<Fault>>,
    contexts: AtomicUsize,
}

impl Shared {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn has(&self, fault: &Fault) -> bool {
        self.faults.lock().unwrap().contains(fault)
    }
}

#[derive(Clone)]
pub struct FakeBackend {
    shared: Arc<Shared>,
    /// `None` streams forever.
    frames: Option<usize>,
    frame_delay: Duration,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            frames: None,
            frame_delay: Duration::from_millis(1),
        }
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.shared.faults.lock().unwrap().insert(fault);
    }

    pub fn heal(&self, fault: &Fault) {
        self.shared.faults.lock().unwrap().remove(fault);
    }

    pub fn events(&self) -> Vec<String> {
        self.shared.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().unwrap().clear();
    }

    /// Locators that were opened, in order.
    pub fn opened(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("open source ").map(str::to_string))
            .collect()
    }

    pub fn contexts_created(&self) -> usize {
        self.shared.contexts.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeBackend {
    fn open_source(&self, locator: &str) -> Result<Box<dyn Source>, PipelineError> {
        if self.shared.has(&Fault::Source) || self.shared.has(&Fault::SourceFor(locator.to_string())) {
            return Err(PipelineError::Source {
                locator: locator.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.shared.record(format!("open source {locator}"));
        Ok(Box::new(FakeSource {
            shared: Arc::clone(&self.shared),
            locator: locator.to_string(),
            taken: false,
        }))
    }

    fn open_decoder(&self, source: &mut dyn Source) -> Result<Box<dyn Decoder>, PipelineError> {
        let mut locator = String::new();
        source
            .take_reader()?
            .read_to_string(&mut locator)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        if self.shared.has(&Fault::Handshake) {
            return Err(PipelineError::Handshake("no frame sync".to_string()));
        }
        self.shared.record(format!("open decoder {locator}"));
        Ok(Box::new(FakeDecoder {
            shared: Arc::clone(&self.shared),
            locator,
            remaining: self.frames,
            delay: self.frame_delay,
        }))
    }

    fn create_output(&self) -> Result<Arc<dyn OutputContext>, PipelineError> {
        self.shared.contexts.fetch_add(1, Ordering::SeqCst);
        self.shared.record("create context");
        Ok(Arc::new(FakeContext {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeSource {
    shared: Arc<Shared>,
    locator: String,
    taken: bool,
}

impl Source for FakeSource {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PipelineError> {
        if self.taken {
            return Err(PipelineError::SourceTaken);
        }
        self.taken = true;
        Ok(Box::new(std::io::Cursor::new(self.locator.clone().into_bytes())))
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.shared.record(format!("close source {}", self.locator));
        if self.shared.has(&Fault::SourceClose) {
            return Err(PipelineError::Source {
                locator: self.locator.clone(),
                message: "source close failed".to_string(),
            });
        }
        Ok(())
    }
}

struct FakeDecoder {
    shared: Arc<Shared>,
    locator: String,
    remaining: Option<usize>,
    delay: Duration,
}

impl Decoder for FakeDecoder {
    fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: 44_100,
            channels: 2,
        }
    }

    fn next_frame(&mut self) -> Result<Option<Vec<i16>>, PipelineError> {
        if self.shared.has(&Fault::Panic) {
            panic!("decoder exploded on {}", self.locator);
        }
        match self.remaining.as_mut() {
            Some(0) => return Ok(None),
            Some(n) => *n -= 1,
            None => {}
        }
        std::thread::sleep(self.delay);
        Ok(Some(vec![0; 64]))
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.shared.record(format!("close decoder {}", self.locator));
        if self.shared.has(&Fault::DecoderClose) {
            return Err(PipelineError::Decode("decoder close failed".to_string()));
        }
        Ok(())
    }
}

struct FakeContext {
    shared: Arc<Shared>,
}

impl OutputContext for FakeContext {
    fn open_sink(&self, _format: StreamFormat, volume: f64) -> Result<Box<dyn Sink>, PipelineError> {
        if self.shared.has(&Fault::SinkOpen) {
            return Err(PipelineError::Output("device busy".to_string()));
        }
        self.shared.record("open sink");
        Ok(Box::new(FakeSink {
            shared: Arc::clone(&self.shared),
            volume,
        }))
    }

    fn close(&self) -> Result<(), PipelineError> {
        self.shared.record("close context");
        Ok(())
    }
}

struct FakeSink {
    shared: Arc<Shared>,
    volume: f64,
}

impl Sink for FakeSink {
    fn write(&mut self, _samples: &[i16]) -> Result<(), PipelineError> {
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn set_volume(&mut self, level: f64) {
        self.volume = level;
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.shared.record("close sink");
        if self.shared.has(&Fault::SinkClose) {
            return Err(PipelineError::Output("sink close failed".to_string()));
        }
        Ok(())
    }
}

// ── selection store ──────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    record: Mutex<SelectionRecord>,
    loads: AtomicUsize,
    stores: AtomicUsize,
    fail_load: AtomicBool,
    fail_store: AtomicBool,
}

/// Cloneable handle; clones share the same record.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<StoreState>,
}

impl MemoryStore {
    pub fn new(record: SelectionRecord) -> Self {
        let store = Self::default();
        *store.state.record.lock().unwrap() = record;
        store
    }

    pub fn record(&self) -> SelectionRecord {
        self.state.record.lock().unwrap().clone()
    }

    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.state.stores.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.state.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stores(&self, fail: bool) {
        self.state.fail_store.store(fail, Ordering::SeqCst);
    }
}

fn disk_error(message: &str) -> StoreError {
    StoreError::Io {
        path: "memory".into(),
        source: std::io::Error::new(std::io::ErrorKind::Other, message.to_string()),
    }
}

impl SelectionStore for MemoryStore {
    fn load(&self) -> Result<SelectionRecord, StoreError> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_load.load(Ordering::SeqCst) {
            return Err(disk_error("read failed"));
        }
        Ok(self.record())
    }

    fn store(&self, record: &SelectionRecord) -> Result<(), StoreError> {
        self.state.stores.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_store.load(Ordering::SeqCst) {
            return Err(disk_error("disk full"));
        }
        *self.state.record.lock().unwrap() = record.clone();
        Ok(())
    }
}

pub fn stations(locators: &[&str]) -> Vec<String> {
    locators.iter().map(|l| l.to_string()).collect()
}

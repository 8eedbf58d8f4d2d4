/// Audio pipeline seams and the per-station resource bundle.
///
/// ```text
///   AudioBackend ── open_source ──► Source ──► open_decoder ──► Decoder
///        │                                                         │ format
///        └── create_output (once per process, via OutputHost)      ▼
///                       OutputContext ── open_sink ──────────────► Sink
/// ```
///
/// A `Pipeline` owns one source, decoder and sink.  The output context is
/// process-wide: the audio layer does not support recreating it while the
/// process is alive, so it lives in `OutputHost` and outlives every pipeline
/// and every session generation.
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot open source {locator}: {message}")]
    Source { locator: String, message: String },
    #[error("source reader already taken")]
    SourceTaken,
    #[error("decoder did not synchronise: {0}")]
    Handshake(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("audio output error: {0}")]
    Output(String),
    #[error("end of stream: {0}")]
    EndOfStream(String),
    #[error("session loop panicked: {0}")]
    Panicked(String),
    #[error("cannot spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Sample layout produced by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A fetched stream. The decoder consumes its byte reader; closing the
/// source releases the underlying connection.
pub trait Source {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PipelineError>;
    fn close(&mut self) -> Result<(), PipelineError>;
}

pub trait Decoder {
    fn format(&self) -> StreamFormat;
    /// Interleaved 16-bit samples; `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Vec<i16>>, PipelineError>;
    fn close(&mut self) -> Result<(), PipelineError>;
}

pub trait Sink {
    /// Blocks while the output queue is full.
    fn write(&mut self, samples: &[i16]) -> Result<(), PipelineError>;
    fn volume(&self) -> f64;
    fn set_volume(&mut self, level: f64);
    fn close(&mut self) -> Result<(), PipelineError>;
}

pub trait OutputContext: Send + Sync {
    fn open_sink(&self, format: StreamFormat, volume: f64) -> Result<Box<dyn Sink>, PipelineError>;
    fn close(&self) -> Result<(), PipelineError>;
}

pub trait AudioBackend: Send + Sync {
    fn open_source(&self, locator: &str) -> Result<Box<dyn Source>, PipelineError>;
    /// Returns only once the decoder has locked onto a valid stream.
    fn open_decoder(&self, source: &mut dyn Source) -> Result<Box<dyn Decoder>, PipelineError>;
    fn create_output(&self) -> Result<Arc<dyn OutputContext>, PipelineError>;
}

// ── process-wide output context ─────────────────────────────────────────────

/// Lazily created, never recreated output context.
pub struct OutputHost {
    context: Mutex<Option<Arc<dyn OutputContext>>>,
}

impl OutputHost {
    pub fn new() -> Self {
        Self {
            context: Mutex::new(None),
        }
    }

    pub fn get_or_create(
        &self,
        backend: &dyn AudioBackend,
    ) -> Result<Arc<dyn OutputContext>, PipelineError> {
        let mut slot = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }
        let context = backend.create_output()?;
        info!("audio output context created");
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    #[cfg(test)]
    pub fn is_created(&self) -> bool {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Only called when the process is exiting.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match context {
            Some(context) => {
                info!("closing audio output context");
                context.close()
            }
            None => Ok(()),
        }
    }
}

impl Default for OutputHost {
    fn default() -> Self {
        Self::new()
    }
}

// ── pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    locator: String,
    source: Box<dyn Source>,
    decoder: Box<dyn Decoder>,
    sink: Box<dyn Sink>,
}

impl Pipeline {
    pub fn open(
        backend: &dyn AudioBackend,
        host: &OutputHost,
        locator: &str,
        volume: f64,
    ) -> Result<Self, PipelineError> {
        debug!("pipeline: opening {}", locator);
        let mut source = backend.open_source(locator)?;

        let mut decoder = match backend.open_decoder(source.as_mut()) {
            Ok(decoder) => decoder,
            Err(e) => {
                release(locator, None, Some(source.as_mut()));
                return Err(e);
            }
        };

        let format = decoder.format();
        let sink = host
            .get_or_create(backend)
            .and_then(|context| context.open_sink(format, volume));
        let mut sink = match sink {
            Ok(sink) => sink,
            Err(e) => {
                release(locator, Some(decoder.as_mut()), Some(source.as_mut()));
                return Err(e);
            }
        };
        sink.set_volume(volume);

        info!(
            "audio stream initialised (url: {}, samplerate: {}, channels: {}, volume: {:.2})",
            locator, format.sample_rate, format.channels, volume
        );

        Ok(Self {
            locator: locator.to_string(),
            source,
            decoder,
            sink,
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Moves one decoded frame into the sink.
    pub fn pump(&mut self) -> Result<(), PipelineError> {
        match self.decoder.next_frame()? {
            Some(samples) => self.sink.write(&samples),
            None => Err(PipelineError::EndOfStream(self.locator.clone())),
        }
    }

    pub fn volume(&self) -> f64 {
        self.sink.volume()
    }

    pub fn set_volume(&mut self, level: f64) {
        self.sink.set_volume(level);
    }

    /// Closes sink, decoder and source in that order. Every close is
    /// attempted; the first failure is returned.
    pub fn close(mut self) -> Result<(), PipelineError> {
        debug!("pipeline: closing {}", self.locator);
        let results = [
            self.sink.close(),
            self.decoder.close(),
            self.source.close(),
        ];
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!("pipeline: close failed for {}: {}", self.locator, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Best-effort cleanup of a half-built pipeline.
fn release(locator: &str, decoder: Option<&mut dyn Decoder>, source: Option<&mut dyn Source>) {
    if let Some(decoder) = decoder {
        if let Err(e) = decoder.close() {
            warn!("pipeline: decoder close after failed open of {}: {}", locator, e);
        }
    }
    if let Some(source) = source {
        if let Err(e) = source.close() {
            warn!("pipeline: source close after failed open of {}: {}", locator, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Fault};

    #[test]
    fn close_order_is_sink_decoder_source() {
        let backend = FakeBackend::new();
        let host = OutputHost::new();
        let pipeline = Pipeline::open(&backend, &host, "http://a", 0.3).unwrap();
        backend.clear_events();

        pipeline.close().unwrap();
        assert_eq!(
            backend.events(),
            vec!["close sink", "close decoder http://a", "close source http://a"]
        );
    }

    #[test]
    fn first_close_error_wins_but_all_closes_run() {
        let backend = FakeBackend::new();
        backend.inject(Fault::DecoderClose);
        backend.inject(Fault::SourceClose);
        let host = OutputHost::new();
        let pipeline = Pipeline::open(&backend, &host, "http://a", 0.3).unwrap();
        backend.clear_events();

        let err = pipeline.close().unwrap_err();
        assert!(err.to_string().contains("decoder"), "{err}");
        assert_eq!(backend.events().len(), 3);
    }

    #[test]
    fn failed_sink_releases_decoder_and_source() {
        let backend = FakeBackend::new();
        backend.inject(Fault::SinkOpen);
        let host = OutputHost::new();

        let err = Pipeline::open(&backend, &host, "http://a", 0.3).err().unwrap();
        assert!(matches!(err, PipelineError::Output(_)));
        let events = backend.events();
        assert!(events.contains(&"close decoder http://a".to_string()));
        assert!(events.contains(&"close source http://a".to_string()));
    }

    #[test]
    fn failed_handshake_releases_source() {
        let backend = FakeBackend::new();
        backend.inject(Fault::Handshake);
        let host = OutputHost::new();

        let err = Pipeline::open(&backend, &host, "http://a", 0.3).err().unwrap();
        assert!(matches!(err, PipelineError::Handshake(_)));
        assert!(backend.events().contains(&"close source http://a".to_string()));
        assert!(!host.is_created());
    }

    #[test]
    fn output_context_is_created_once_across_pipelines() {
        let backend = FakeBackend::new();
        let host = OutputHost::new();
        for locator in ["http://a", "http://b", "http://a"] {
            Pipeline::open(&backend, &host, locator, 0.5)
                .unwrap()
                .close()
                .unwrap();
        }
        assert_eq!(backend.contexts_created(), 1);

        host.shutdown().unwrap();
        assert!(!host.is_created());
        assert!(backend.events().contains(&"close context".to_string()));
    }

    #[test]
    fn volume_is_applied_to_the_new_sink() {
        let backend = FakeBackend::new();
        let host = OutputHost::new();
        let mut pipeline = Pipeline::open(&backend, &host, "http://a", 0.7).unwrap();
        assert_eq!(pipeline.volume(), 0.7);
        pipeline.set_volume(0.2);
        assert_eq!(pipeline.volume(), 0.2);
    }

    #[test]
    fn pump_reports_end_of_stream() {
        let backend = FakeBackend::new().with_frames(2);
        let host = OutputHost::new();
        let mut pipeline = Pipeline::open(&backend, &host, "http://a", 0.5).unwrap();
        pipeline.pump().unwrap();
        pipeline.pump().unwrap();
        assert!(matches!(pipeline.pump(), Err(PipelineError::EndOfStream(_))));
    }
}

//! Network audio backend: HTTP source, MP3 decoder, cpal output.
//!
//! ```text
//! reqwest body ─► [pump task] ─► mpsc ─► ChannelReader (Read) ─► minimp3 ─► CpalSink queue ─► cpal callback
//! ```
//!
//! Everything after the channel runs on the session thread.  The pump task
//! lives on the tokio runtime and is aborted when the source closes.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use futures_util::StreamExt;
use minimp3::{Decoder as MiniMp3Decoder, Error as MiniMp3Error};
use streamer_proto::config::SourceConfig;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::{
    AudioBackend, Decoder, OutputContext, PipelineError, Sink, Source, StreamFormat,
};

/// Body chunks buffered between the pump task and the decoder.
const CHANNEL_CAPACITY: usize = 32;

/// Frames the decoder may skip while looking for the first valid one.
const HANDSHAKE_ATTEMPTS: usize = 64;

/// About one second of 44.1 kHz stereo.
const QUEUE_CAPACITY: usize = 88_200;

const STALL_LIMIT: Duration = Duration::from_secs(5);

pub struct NetworkBackend {
    client: reqwest::Client,
    runtime: Handle,
    response_timeout: Duration,
}

impl NetworkBackend {
    pub fn new(config: &SourceConfig, runtime: Handle) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("radio-streamer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            runtime,
            response_timeout: config.response_timeout(),
        })
    }
}

impl AudioBackend for NetworkBackend {
    fn open_source(&self, locator: &str) -> Result<Box<dyn Source>, PipelineError> {
        let source_error = |message: String| PipelineError::Source {
            locator: locator.to_string(),
            message,
        };

        let request = self.client.get(locator).send();
        let response = self
            .runtime
            .block_on(async { tokio::time::timeout(self.response_timeout, request).await })
            .map_err(|_| source_error("timed out waiting for response".to_string()))?
            .and_then(|response| response.error_for_status())
            .map_err(|e| source_error(e.to_string()))?;

        debug!(
            "source {}: status {}, content-type {:?}",
            locator,
            response.status(),
            response.headers().get(reqwest::header::CONTENT_TYPE)
        );

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_CAPACITY);
        let pump_locator = locator.to_string();
        let pump = self.runtime.spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
            debug!("source {}: body pump finished", pump_locator);
        });

        Ok(Box::new(HttpSource {
            locator: locator.to_string(),
            reader: Some(ChannelReader::new(
                rx,
                self.runtime.clone(),
                self.response_timeout,
            )),
            pump,
        }))
    }

    fn open_decoder(&self, source: &mut dyn Source) -> Result<Box<dyn Decoder>, PipelineError> {
        let reader = source.take_reader()?;
        Ok(Box::new(Mp3Decoder::open(reader)?))
    }

    fn create_output(&self) -> Result<Arc<dyn OutputContext>, PipelineError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PipelineError::Output("no output device available".to_string()))?;
        info!(
            "using audio device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );
        Ok(Arc::new(CpalOutput { device }))
    }
}

// ── source ───────────────────────────────────────────────────────────────────

struct HttpSource {
    locator: String,
    reader: Option<ChannelReader>,
    pump: JoinHandle<()>,
}

impl Source for HttpSource {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PipelineError> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as Box<dyn Read + Send>)
            .ok_or(PipelineError::SourceTaken)
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        debug!("source {}: closing connection", self.locator);
        self.pump.abort();
        Ok(())
    }
}

impl Drop for HttpSource {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Blocking `Read` over the body channel. A read that sees no data within
/// `idle_timeout` fails with `TimedOut`.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    runtime: Handle,
    idle_timeout: Duration,
    current: Bytes,
    offset: usize,
    finished: bool,
}

impl ChannelReader {
    pub(crate) fn new(
        rx: mpsc::Receiver<io::Result<Bytes>>,
        runtime: Handle,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            rx,
            runtime,
            idle_timeout,
            current: Bytes::new(),
            offset: 0,
            finished: false,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.current.len() {
                let n = buf.len().min(self.current.len() - self.offset);
                buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }

            if self.finished {
                return Ok(0);
            }

            let next = self
                .runtime
                .block_on(tokio::time::timeout(self.idle_timeout, self.rx.recv()));
            match next {
                Ok(Some(Ok(bytes))) => {
                    self.current = bytes;
                    self.offset = 0;
                }
                Ok(Some(Err(err))) => {
                    self.finished = true;
                    return Err(err);
                }
                Ok(None) => {
                    self.finished = true;
                    return Ok(0);
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no stream data for {:?}", self.idle_timeout),
                    ));
                }
            }
        }
    }
}

// ── decoder ──────────────────────────────────────────────────────────────────

pub(crate) struct Mp3Decoder {
    inner: MiniMp3Decoder<Box<dyn Read + Send>>,
    format: StreamFormat,
    /// First frame, decoded during the handshake.
    pending: Option<Vec<i16>>,
}

impl Mp3Decoder {
    /// Reads until the first valid frame so the output format is known.
    pub(crate) fn open(reader: Box<dyn Read + Send>) -> Result<Self, PipelineError> {
        let mut inner = MiniMp3Decoder::new(reader);

        for _ in 0..HANDSHAKE_ATTEMPTS {
            match inner.next_frame() {
                Ok(frame) if frame.channels > 0 && frame.sample_rate > 0 => {
                    let format = StreamFormat {
                        sample_rate: frame.sample_rate as u32,
                        channels: frame.channels as u16,
                    };
                    info!(
                        "mp3 stream: {} kbps, {} Hz, {} channels",
                        frame.bitrate, format.sample_rate, format.channels
                    );
                    return Ok(Self {
                        inner,
                        format,
                        pending: Some(frame.data),
                    });
                }
                Ok(_) | Err(MiniMp3Error::InsufficientData) | Err(MiniMp3Error::SkippedData) => {
                    continue
                }
                Err(MiniMp3Error::Eof) => {
                    return Err(PipelineError::Handshake(
                        "stream ended before the first frame".to_string(),
                    ))
                }
                Err(MiniMp3Error::Io(err)) => return Err(PipelineError::Handshake(err.to_string())),
            }
        }

        Err(PipelineError::Handshake(format!(
            "no valid frame within {} attempts",
            HANDSHAKE_ATTEMPTS
        )))
    }
}

impl Decoder for Mp3Decoder {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn next_frame(&mut self) -> Result<Option<Vec<i16>>, PipelineError> {
        if let Some(samples) = self.pending.take() {
            return Ok(Some(samples));
        }
        loop {
            match self.inner.next_frame() {
                Ok(frame) if frame.data.is_empty() => continue,
                Ok(frame) => return Ok(Some(frame.data)),
                Err(MiniMp3Error::InsufficientData) | Err(MiniMp3Error::SkippedData) => continue,
                Err(MiniMp3Error::Eof) => return Ok(None),
                Err(MiniMp3Error::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(MiniMp3Error::Io(err)) => return Err(PipelineError::Decode(err.to_string())),
            }
        }
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.pending = None;
        Ok(())
    }
}

// ── output ───────────────────────────────────────────────────────────────────

struct CpalOutput {
    device: cpal::Device,
}

impl OutputContext for CpalOutput {
    fn open_sink(&self, format: StreamFormat, volume: f64) -> Result<Box<dyn Sink>, PipelineError> {
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            space: Condvar::new(),
            gain: AtomicU32::new((volume as f32).to_bits()),
            failure: Mutex::new(None),
        });

        let callback_shared = Arc::clone(&shared);
        let error_shared = Arc::clone(&shared);
        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let gain = f32::from_bits(callback_shared.gain.load(Ordering::Relaxed));
                    let mut queue = callback_shared
                        .queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    drain_into(&mut queue, data, gain);
                    drop(queue);
                    callback_shared.space.notify_one();
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                    *error_shared
                        .failure
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
                    error_shared.space.notify_one();
                },
                None,
            )
            .map_err(|e| PipelineError::Output(format!("failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| PipelineError::Output(format!("failed to start output stream: {}", e)))?;

        Ok(Box::new(CpalSink {
            shared,
            stream: Some(stream),
            volume,
        }))
    }

    fn close(&self) -> Result<(), PipelineError> {
        debug!("audio output context released");
        Ok(())
    }
}

struct SinkShared {
    queue: Mutex<VecDeque<i16>>,
    space: Condvar,
    /// `f32` bits of the current gain.
    gain: AtomicU32,
    failure: Mutex<Option<String>>,
}

impl SinkShared {
    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct CpalSink {
    shared: Arc<SinkShared>,
    stream: Option<cpal::Stream>,
    volume: f64,
}

impl Sink for CpalSink {
    fn write(&mut self, samples: &[i16]) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while queue.len() + samples.len() > QUEUE_CAPACITY && !queue.is_empty() {
            if let Some(message) = self.shared.failure() {
                return Err(PipelineError::Output(message));
            }
            if started.elapsed() > STALL_LIMIT {
                return Err(PipelineError::Output("audio device stalled".to_string()));
            }
            let (guard, _) = self
                .shared
                .space
                .wait_timeout(queue, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }

        queue.extend(samples.iter().copied());
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn set_volume(&mut self, level: f64) {
        self.volume = level;
        self.shared
            .gain
            .store((level as f32).to_bits(), Ordering::Relaxed);
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.pause();
        drop(stream);
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        paused.map_err(|e| PipelineError::Output(format!("failed to stop output stream: {}", e)))
    }
}

/// Fills `out` from the queue, scaling by `gain`; missing samples are
/// silence. Returns how many samples came from the queue.
fn drain_into(queue: &mut VecDeque<i16>, out: &mut [f32], gain: f32) -> usize {
    let mut taken = 0;
    for slot in out.iter_mut() {
        *slot = match queue.pop_front() {
            Some(sample) => {
                taken += 1;
                f32::from(sample) / 32768.0 * gain
            }
            None => 0.0,
        };
    }
    taken
}

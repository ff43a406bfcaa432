//! Frame sink: publishes each frame to the key-value store and the stream.
//!
//! For every frame the sink derives a key from the wall clock, encodes the
//! pixels as BMP, stores the payload under that key and appends a metadata
//! record referencing it. Under [`AppendPolicy::Always`] the record is
//! appended even when the payload put failed, so a record may reference a key
//! that was never stored; [`AppendPolicy::RequireStored`] closes that gap.

use crate::config::{AppendPolicy, Config, FailurePolicy, FrameConfig, SinkConfig, StreamConfig};
use crate::encoder::{self, EncodeError, EncodedPayload};
use crate::endpoint::Endpoint;
use crate::frame::{Clock, Frame, FrameKey, SystemClock};
use crate::health::{self, BackendHealth, HealthReport};
use crate::kv::{KeyValueStore, KvError, MemcachedConnection};
use crate::record::MetadataRecord;
use crate::stream::{RedisStream, StreamError, StreamLog};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop a sink from starting or a frame from being published
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Key-value backend: {0}")]
    KeyValue(#[from] KvError),

    #[error("Stream backend: {0}")]
    Stream(#[from] StreamError),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] EncodeError),

    #[error("Frame sink is not ready")]
    NotReady,

    #[error("Frame sink is closed")]
    Closed,
}

impl SinkError {
    /// Malformed endpoint strings
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SinkError::KeyValue(KvError::Configuration(_))
                | SinkError::Stream(StreamError::Configuration(_))
        )
    }
}

/// Lifecycle of a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Uninitialized,
    Ready,
    Closed,
}

/// Outcome of one backend write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed(String),
    Skipped(&'static str),
}

impl StepOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, StepOutcome::Done)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Done => f.write_str("done"),
            StepOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            StepOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// What happened to one published frame
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub key: FrameKey,
    pub payload_bytes: usize,
    pub stored: StepOutcome,
    pub appended: StepOutcome,
    /// Entry id assigned by the stream backend
    pub entry_id: Option<String>,
}

impl PublishReport {
    /// Both the payload and the record were written
    pub fn is_success(&self) -> bool {
        self.stored.is_done() && self.appended.is_done()
    }
}

/// Settings the sink needs after construction
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub frame: FrameConfig,
    pub stream: StreamConfig,
    pub sink: SinkConfig,
}

impl From<&Config> for SinkSettings {
    fn from(config: &Config) -> Self {
        Self {
            frame: config.frame.clone(),
            stream: config.stream.clone(),
            sink: config.sink.clone(),
        }
    }
}

/// Publishes frames to a key-value store and a stream log.
///
/// Owns both backend connections for its whole lifetime and releases them
/// exactly once, on [`FrameSink::close`] or drop.
pub struct FrameSink<K: KeyValueStore = MemcachedConnection, S: StreamLog = RedisStream> {
    key_value: Option<K>,
    stream: Option<S>,
    settings: SinkSettings,
    clock: Box<dyn Clock>,
    state: SinkState,
}

impl FrameSink<MemcachedConnection, RedisStream> {
    /// Connect both backends and optionally run the startup health check.
    ///
    /// Malformed endpoints always fail. A backend that cannot be reached
    /// either fails construction or is disabled, per its
    /// `on_connect_failure` policy. Health check failures are only logged.
    pub fn connect(config: &Config) -> Result<Self, SinkError> {
        Endpoint::parse(&config.key_value.endpoint).map_err(KvError::from)?;
        Endpoint::parse_tcp(&config.stream.endpoint).map_err(StreamError::from)?;

        let mut sink = Self::uninitialized(SinkSettings::from(config));

        sink.key_value = match MemcachedConnection::connect(&config.key_value) {
            Ok(connection) => Some(connection),
            Err(e) => match config.key_value.on_connect_failure {
                FailurePolicy::Abort => return Err(e.into()),
                FailurePolicy::Disable => {
                    error!(error = %e, "Key-value backend unavailable, payload puts disabled");
                    None
                }
            },
        };

        sink.stream = match RedisStream::connect(&config.stream) {
            Ok(stream) => Some(stream),
            Err(e) => match config.stream.on_connect_failure {
                FailurePolicy::Abort => return Err(e.into()),
                FailurePolicy::Disable => {
                    error!(error = %e, "Stream backend unavailable, record appends disabled");
                    None
                }
            },
        };

        sink.state = SinkState::Ready;

        if config.sink.self_test_on_start {
            sink.health_check(config.sink.health_timeout());
        }

        info!(
            key_value = sink.key_value.is_some(),
            stream = sink.stream.is_some(),
            stream_key = %config.stream.stream_key,
            "Frame sink ready"
        );

        Ok(sink)
    }
}

impl<K: KeyValueStore, S: StreamLog> FrameSink<K, S> {
    fn uninitialized(settings: SinkSettings) -> Self {
        Self {
            key_value: None,
            stream: None,
            settings,
            clock: Box::new(SystemClock),
            state: SinkState::Uninitialized,
        }
    }

    /// Build a ready sink from already connected backends.
    /// `None` marks a backend as disabled.
    pub fn with_backends(key_value: Option<K>, stream: Option<S>, settings: SinkSettings) -> Self {
        Self {
            key_value,
            stream,
            settings,
            clock: Box::new(SystemClock),
            state: SinkState::Ready,
        }
    }

    /// Replace the clock used for key derivation
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    pub fn key_value_enabled(&self) -> bool {
        self.key_value.is_some()
    }

    pub fn stream_enabled(&self) -> bool {
        self.stream.is_some()
    }

    /// Publish one frame.
    ///
    /// Encoding failures return an error before either backend is contacted.
    /// Backend failures are logged and reported in the [`PublishReport`];
    /// nothing is retried.
    #[instrument(skip(self, frame), fields(width = frame.width, height = frame.height))]
    pub fn publish(&mut self, frame: &Frame<'_>) -> Result<PublishReport, SinkError> {
        match self.state {
            SinkState::Ready => {}
            SinkState::Uninitialized => return Err(SinkError::NotReady),
            SinkState::Closed => return Err(SinkError::Closed),
        }

        let started = Instant::now();
        let key = FrameKey::from_millis(self.clock.now_millis());

        let payload = match encoder::encode(frame.data, frame.width, frame.height) {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to encode frame to BMP");
                metrics::counter!("sink.frames.encode_failed").increment(1);
                return Err(e.into());
            }
        };

        let stored = self.store_payload(&key, &payload);

        let (appended, entry_id) = match (self.settings.sink.append_policy, &stored) {
            (AppendPolicy::Always, _) | (AppendPolicy::RequireStored, StepOutcome::Done) => {
                self.append_record(&key, frame)
            }
            (AppendPolicy::RequireStored, _) => {
                warn!(key = %key, "Payload not stored, skipping stream record");
                (StepOutcome::Skipped("payload not stored"), None)
            }
        };

        let report = PublishReport {
            key,
            payload_bytes: payload.len(),
            stored,
            appended,
            entry_id,
        };

        metrics::histogram!("sink.publish.duration_seconds").record(started.elapsed().as_secs_f64());
        if report.is_success() {
            metrics::counter!("sink.frames.published").increment(1);
        }

        debug!(
            key = %report.key,
            size_bytes = report.payload_bytes,
            stored = %report.stored,
            appended = %report.appended,
            "Frame published"
        );

        Ok(report)
    }

    fn store_payload(&mut self, key: &FrameKey, payload: &EncodedPayload) -> StepOutcome {
        let flags = self.settings.sink.value_flags;
        let ttl = self.settings.sink.ttl_secs;

        let result = match self.key_value.as_mut() {
            Some(store) => store.put(key.as_str(), payload.as_bytes(), flags, ttl),
            None => Err(KvError::Disabled),
        };

        match result {
            Ok(()) => {
                debug!(key = %key, size_bytes = payload.len(), "Value added to memcached");
                StepOutcome::Done
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to add value to memcached");
                metrics::counter!("sink.kv.put_failed").increment(1);
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    fn append_record(&mut self, key: &FrameKey, frame: &Frame<'_>) -> (StepOutcome, Option<String>) {
        let record = MetadataRecord::new(key.clone(), frame.width, frame.height, &self.settings.frame);

        let result = record
            .to_entry(&self.settings.stream)
            .and_then(|entry| match self.stream.as_mut() {
                Some(stream) => stream.append(&entry),
                None => Err(StreamError::Disabled),
            });

        match result {
            Ok(id) => {
                debug!(key = %key, id = %id, "Entry added to stream");
                (StepOutcome::Done, Some(id))
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to append stream entry");
                metrics::counter!("sink.stream.append_failed").increment(1);
                (StepOutcome::Failed(e.to_string()), None)
            }
        }
    }

    /// Check both backends, each bounded by `timeout`.
    ///
    /// Independent of construction; disabled backends report
    /// [`BackendHealth::Disabled`].
    pub fn health_check(&mut self, timeout: Duration) -> HealthReport {
        let key_value = match self.key_value.as_mut() {
            Some(store) => health::check_key_value(store, timeout),
            None => BackendHealth::Disabled,
        };

        let stream = match self.stream.as_mut() {
            Some(stream) => health::check_stream(stream, timeout),
            None => BackendHealth::Disabled,
        };

        let report = HealthReport { key_value, stream };

        match &report.key_value {
            BackendHealth::Unhealthy(reason) => {
                error!(reason = %reason, "Key-value health check failed")
            }
            health => info!(health = %health, "Key-value health check"),
        }
        match &report.stream {
            BackendHealth::Unhealthy(reason) => {
                error!(reason = %reason, "Stream health check failed")
            }
            health => info!(health = %health, "Stream health check"),
        }

        report
    }

    /// Release both connections. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SinkState::Closed {
            return;
        }

        drop(self.key_value.take());
        drop(self.stream.take());
        self.state = SinkState::Closed;

        info!("Frame sink closed");
    }
}

impl<K: KeyValueStore, S: StreamLog> Drop for FrameSink<K, S> {
    fn drop(&mut self) {
        self.close();
    }
}

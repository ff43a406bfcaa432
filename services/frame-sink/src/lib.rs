//! Frame Sink Service
//!
//! Publishes camera frames to a key-value cache and a capped stream log. Each
//! frame is encoded as an 8-bit grayscale BMP, stored in memcached under a
//! millisecond timestamp key, and announced with a metadata record appended to
//! a Redis stream. Consumers read the stream and fetch payloads by key.
//!
//! ## Features
//!
//! - **Two backends, independent failure**: a failed payload put does not stop
//!   the record append unless the `require_stored` policy is set
//! - **Configurable startup**: each backend either aborts startup or is
//!   disabled when it cannot be reached
//! - **Validated stream entries**: field names and values are checked before
//!   anything is sent
//! - **Health checks**: sentinel round trip on memcached, liveness write on
//!   Redis, both bounded by a timeout
//!
//! ## Architecture
//!
//! ```text
//! Raw frames                                        memcached
//! ┌──────────────┐                                 ┌──────────────┐
//! │ Frame        │                          put    │ {millis} ->  │
//! │ Reader       │                       ┌────────▶│   BMP bytes  │
//! └──────────────┘                       │         └──────────────┘
//!        │                               │
//!        ▼                               │
//! ┌──────────────┐    ┌──────────────┐   │
//! │ Frame        │───▶│ BMP          │───┘
//! │ Sink         │    │ Encoder      │
//! └──────────────┘    └──────────────┘              Redis
//!        │                                         ┌──────────────┐
//!        ▼                                 XADD    │ Bitmaps      │
//! ┌──────────────┐                       ┌────────▶│   MAXLEN ~   │
//! │ Metadata     │───────────────────────┘         │   1000       │
//! │ Record       │                                 └──────────────┘
//! └──────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod encoder;
pub mod endpoint;
pub mod frame;
pub mod health;
pub mod input;
pub mod kv;
pub mod record;
pub mod sink;
pub mod stream;

pub use config::Config;
pub use encoder::{encode, EncodeError, EncodedPayload};
pub use endpoint::{Endpoint, EndpointError};
pub use frame::{Clock, Frame, FrameKey, PixelFormat, SystemClock};
pub use health::{BackendHealth, HealthReport};
pub use input::{FrameReader, InputError};
pub use kv::{KeyValueStore, KvError, MemcachedConnection};
pub use record::MetadataRecord;
pub use sink::{FrameSink, PublishReport, SinkError, StepOutcome};
pub use stream::{RedisStream, StreamEntry, StreamError, StreamLog};

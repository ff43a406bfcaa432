//! Stream backend: capped Redis streams.
//!
//! Entries are built with [`StreamEntry`], which validates every field before
//! anything is sent, and appended with `XADD <key> MAXLEN [~] <cap> <id> ...`.

use crate::config::StreamConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::endpoint::{Endpoint, EndpointError};
use redis::RedisError;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const BACKEND: &str = "redis";

/// Key and value written by the liveness probe
pub const LIVENESS_KEY: &str = "CameraService";
pub const LIVENESS_VALUE: &str = "Alive";

/// Errors that can occur on the stream backend
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid stream endpoint: {0}")]
    Configuration(#[from] EndpointError),

    #[error("Failed to connect to redis at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Failed to append to stream {stream}: {message}")]
    Append { stream: String, message: String },

    #[error("Liveness probe failed: {0}")]
    Probe(String),

    #[error("Invalid stream field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Stream connection is {0}")]
    NotConnected(ConnectionState),

    #[error("Stream backend is disabled")]
    Disabled,
}

/// Entry id of an appended record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryId {
    /// Caller-chosen id, e.g. the frame key
    Explicit(String),
    /// Server-assigned (`*`)
    Auto,
}

impl EntryId {
    pub fn as_arg(&self) -> &str {
        match self {
            EntryId::Explicit(id) => id,
            EntryId::Auto => "*",
        }
    }
}

/// Retention cap applied on every append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trim {
    pub max_len: u64,
    pub approximate: bool,
}

/// A validated stream append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    stream: String,
    trim: Trim,
    id: EntryId,
    fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Start an entry for `stream`
    pub fn builder(stream: impl Into<String>) -> StreamEntryBuilder {
        StreamEntryBuilder {
            stream: stream.into(),
            trim: Trim {
                max_len: 1000,
                approximate: true,
            },
            id: EntryId::Auto,
            fields: Vec::new(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn trim(&self) -> Trim {
        self.trim
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Value of the first field called `name`
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `XADD` arguments, in order, without the command name
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(5 + self.fields.len() * 2);
        args.push(self.stream.clone());
        args.push("MAXLEN".to_string());
        if self.trim.approximate {
            args.push("~".to_string());
        }
        args.push(self.trim.max_len.to_string());
        args.push(self.id.as_arg().to_string());
        for (name, value) in &self.fields {
            args.push(name.clone());
            args.push(value.clone());
        }
        args
    }

    /// The `XADD` command for this entry
    pub fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        for arg in self.args() {
            cmd.arg(arg);
        }
        cmd
    }
}

/// Builder for [`StreamEntry`]
#[derive(Debug, Clone)]
pub struct StreamEntryBuilder {
    stream: String,
    trim: Trim,
    id: EntryId,
    fields: Vec<(String, String)>,
}

impl StreamEntryBuilder {
    /// Cap the stream at `max_len` entries, oldest evicted first
    pub fn max_len(mut self, max_len: u64, approximate: bool) -> Self {
        self.trim = Trim {
            max_len,
            approximate,
        };
        self
    }

    pub fn id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    /// Append a field; order is preserved
    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    /// Validate the stream key, entry id and every field
    pub fn build(self) -> Result<StreamEntry, StreamError> {
        validate_name("stream", &self.stream)?;
        if let EntryId::Explicit(ref id) = self.id {
            validate_name("id", id)?;
        }
        if self.trim.max_len == 0 {
            return Err(StreamError::InvalidField {
                field: "MAXLEN".to_string(),
                reason: "cap must be greater than 0".to_string(),
            });
        }
        if self.fields.is_empty() {
            return Err(StreamError::InvalidField {
                field: "fields".to_string(),
                reason: "an entry needs at least one field".to_string(),
            });
        }
        for (name, value) in &self.fields {
            validate_name(name, name)?;
            validate_value(name, value)?;
        }

        Ok(StreamEntry {
            stream: self.stream,
            trim: self.trim,
            id: self.id,
            fields: self.fields,
        })
    }
}

/// Names and ids: non-empty, no whitespace, no control characters
fn validate_name(field: &str, name: &str) -> Result<(), StreamError> {
    if name.is_empty() {
        return Err(StreamError::InvalidField {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StreamError::InvalidField {
            field: field.escape_debug().to_string(),
            reason: "must not contain whitespace or control characters".to_string(),
        });
    }
    Ok(())
}

/// Values: no control characters
fn validate_value(field: &str, value: &str) -> Result<(), StreamError> {
    if value.chars().any(char::is_control) {
        return Err(StreamError::InvalidField {
            field: field.to_string(),
            reason: format!("value {:?} contains control characters", value),
        });
    }
    Ok(())
}

/// Append-only log of ordered field records
#[cfg_attr(test, mockall::automock)]
pub trait StreamLog {
    /// Append an entry, returning the id the server assigned
    fn append(&mut self, entry: &StreamEntry) -> Result<String, StreamError>;

    /// Single liveness write
    fn probe(&mut self) -> Result<(), StreamError>;

    /// Bound every subsequent read and write
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), StreamError>;

    /// Timeout currently applied to reads and writes
    fn io_timeout(&self) -> Option<Duration>;
}

/// Build the redis client URL for an endpoint
pub fn client_url(endpoint: &Endpoint) -> Result<String, StreamError> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok(format!("redis://{}:{}/", host, port)),
        Endpoint::Unix(_) => Err(EndpointError::SocketNotSupported(endpoint.to_string()).into()),
    }
}

/// Connection to a Redis server
pub struct RedisStream {
    handle: ConnectionHandle<redis::Connection>,
    io_timeout: Option<Duration>,
}

impl RedisStream {
    /// Parse the endpoint and connect.
    ///
    /// The endpoint must be `host:port`; anything else fails with
    /// [`StreamError::Configuration`] before any connection is attempted.
    pub fn connect(config: &StreamConfig) -> Result<Self, StreamError> {
        let endpoint = Endpoint::parse_tcp(&config.endpoint)?;
        let url = client_url(&endpoint)?;
        let connect_timeout = config.connect_timeout();

        let mut handle = ConnectionHandle::new(BACKEND, endpoint);
        handle.establish(|endpoint| {
            let connection_error = |e: RedisError| StreamError::Connection {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            };

            let client = redis::Client::open(url.as_str()).map_err(connection_error)?;
            let connection = match connect_timeout {
                Some(timeout) => client.get_connection_with_timeout(timeout),
                None => client.get_connection(),
            };
            connection.map_err(connection_error)
        })?;

        let mut stream = Self {
            handle,
            io_timeout: None,
        };
        stream.set_io_timeout(config.io_timeout())?;

        debug!(stream = %config.stream_key, "Redis connection ready");

        Ok(stream)
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.handle.close();
    }

    fn connection(&mut self) -> Result<&mut redis::Connection, StreamError> {
        let state = self.handle.state();
        self.handle
            .transport_mut()
            .ok_or(StreamError::NotConnected(state))
    }

    /// I/O errors leave the connection unusable
    fn observe(&mut self, error: &RedisError) {
        if error.is_io_error() || error.is_connection_dropped() {
            self.handle.mark_failed();
        }
    }
}

impl StreamLog for RedisStream {
    #[instrument(skip(self, entry), fields(stream = %entry.stream(), id = %entry.id().as_arg()))]
    fn append(&mut self, entry: &StreamEntry) -> Result<String, StreamError> {
        let cmd = entry.to_cmd();
        let result = cmd.query::<String>(self.connection()?);

        result.map_err(|e| {
            self.observe(&e);
            StreamError::Append {
                stream: entry.stream().to_string(),
                message: e.to_string(),
            }
        })
    }

    #[instrument(skip(self))]
    fn probe(&mut self) -> Result<(), StreamError> {
        let result = redis::cmd("SET")
            .arg(LIVENESS_KEY)
            .arg(LIVENESS_VALUE)
            .query::<()>(self.connection()?);

        result.map_err(|e| {
            self.observe(&e);
            StreamError::Probe(e.to_string())
        })
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), StreamError> {
        let connection = self.connection()?;
        let applied = connection
            .set_read_timeout(timeout)
            .and_then(|_| connection.set_write_timeout(timeout));

        applied.map_err(|e| {
            self.observe(&e);
            StreamError::Connection {
                endpoint: self.handle.endpoint().to_string(),
                message: e.to_string(),
            }
        })?;

        self.io_timeout = timeout;
        Ok(())
    }

    fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;

    fn config(endpoint: &str) -> StreamConfig {
        StreamConfig {
            endpoint: endpoint.to_string(),
            stream_key: "Bitmaps".to_string(),
            max_len: 1000,
            approximate_trim: true,
            use_key_as_entry_id: true,
            on_connect_failure: FailurePolicy::Abort,
            connect_timeout_ms: None,
            io_timeout_ms: None,
        }
    }

    #[test]
    fn test_entry_args_preserve_order() {
        let entry = StreamEntry::builder("Bitmaps")
            .max_len(1000, true)
            .id(EntryId::Explicit("1700000000123".to_string()))
            .field("memcached", "1700000000123")
            .field("width", 64)
            .field("height", 48)
            .build()
            .unwrap();

        assert_eq!(
            entry.args(),
            vec![
                "Bitmaps",
                "MAXLEN",
                "~",
                "1000",
                "1700000000123",
                "memcached",
                "1700000000123",
                "width",
                "64",
                "height",
                "48",
            ]
        );
        assert_eq!(entry.field("width"), Some("64"));
    }

    #[test]
    fn test_exact_trim_and_auto_id() {
        let entry = StreamEntry::builder("Bitmaps")
            .max_len(10, false)
            .field("a", "b")
            .build()
            .unwrap();

        assert_eq!(entry.args(), vec!["Bitmaps", "MAXLEN", "10", "*", "a", "b"]);
    }

    #[test]
    fn test_value_with_spaces_is_a_single_argument() {
        let entry = StreamEntry::builder("Bitmaps")
            .field("roi", "0.1 0.2 0.3 0.4")
            .build()
            .unwrap();

        assert_eq!(entry.args().last().map(String::as_str), Some("0.1 0.2 0.3 0.4"));
    }

    #[test]
    fn test_rejects_control_characters_in_values() {
        let result = StreamEntry::builder("Bitmaps")
            .field("roi", "0,0,0,0\r\nFLUSHALL")
            .build();

        assert!(matches!(result, Err(StreamError::InvalidField { ref field, .. }) if field == "roi"));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(
            StreamEntry::builder("Bitmaps").field("sensor id", "x").build(),
            Err(StreamError::InvalidField { .. })
        ));
        assert!(matches!(
            StreamEntry::builder("Bitmaps").field("", "x").build(),
            Err(StreamError::InvalidField { .. })
        ));
        assert!(matches!(
            StreamEntry::builder("Bit maps").field("a", "x").build(),
            Err(StreamError::InvalidField { .. })
        ));
        assert!(matches!(
            StreamEntry::builder("Bitmaps")
                .id(EntryId::Explicit("1 2".to_string()))
                .field("a", "x")
                .build(),
            Err(StreamError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_entry_and_zero_cap() {
        assert!(matches!(
            StreamEntry::builder("Bitmaps").build(),
            Err(StreamError::InvalidField { .. })
        ));
        assert!(matches!(
            StreamEntry::builder("Bitmaps").max_len(0, true).field("a", "b").build(),
            Err(StreamError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_connect_rejects_missing_separator() {
        assert!(matches!(
            RedisStream::connect(&config("badformat")),
            Err(StreamError::Configuration(EndpointError::MissingSeparator(_)))
        ));
    }

    #[test]
    fn test_connect_rejects_socket_path() {
        assert!(matches!(
            RedisStream::connect(&config("/tmp/redis.sock")),
            Err(StreamError::Configuration(EndpointError::SocketNotSupported(_)))
        ));
    }

    #[test]
    fn test_client_url() {
        let endpoint = Endpoint::parse("redis.local:6379").unwrap();
        assert_eq!(client_url(&endpoint).unwrap(), "redis://redis.local:6379/");
    }
}

//! Key-value backend: memcached over TCP or a UNIX socket.

use crate::config::KeyValueConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::endpoint::{Endpoint, EndpointError};
use memcache::{MemcacheError, ToMemcacheValue};
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const BACKEND: &str = "memcached";

/// Errors that can occur on the key-value backend
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Invalid key-value endpoint: {0}")]
    Configuration(#[from] EndpointError),

    #[error("Failed to connect to memcached at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Failed to store key {key}: {message}")]
    Store { key: String, message: String },

    #[error("Key {0} not found")]
    NotFound(String),

    #[error("Failed to read key {key}: {message}")]
    Fetch { key: String, message: String },

    #[error("Key-value connection is {0}")]
    NotConnected(ConnectionState),

    #[error("Key-value backend is disabled")]
    Disabled,
}

/// A value read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub data: Vec<u8>,
    pub flags: u32,
}

/// Byte store addressed by string keys
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore {
    /// Store `value` under `key`. `ttl` is in seconds, 0 meaning no expiry.
    fn put(&mut self, key: &str, value: &[u8], flags: u32, ttl: u32) -> Result<(), KvError>;

    /// Read the value and flags stored under `key`
    fn get(&mut self, key: &str) -> Result<StoredValue, KvError>;

    /// Bound every subsequent read and write
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), KvError>;

    /// Timeout currently applied to reads and writes
    fn io_timeout(&self) -> Option<Duration>;
}

/// Bytes with explicit memcached flags
struct FlaggedValue<'a> {
    bytes: &'a [u8],
    flags: u32,
}

impl<'a, W: Write> ToMemcacheValue<W> for FlaggedValue<'a> {
    fn get_flags(&self) -> u32 {
        self.flags
    }

    fn get_length(&self) -> usize {
        self.bytes.len()
    }

    fn write_to(&self, stream: &mut W) -> std::io::Result<()> {
        stream.write_all(self.bytes)
    }
}

/// Build the memcache client URL for an endpoint.
///
/// Timeouts travel as query parameters in fractional seconds: `connect_timeout`
/// bounds the pool's wait for a connection and `timeout` is applied to each
/// TCP socket as soon as it is opened.
pub fn client_url(endpoint: &Endpoint, config: &KeyValueConfig) -> String {
    let base = match endpoint {
        Endpoint::Unix(path) => format!("memcache://{}", path.display()),
        Endpoint::Tcp { host, port } => format!("memcache://{}:{}", host, port),
    };

    let mut params = Vec::new();
    if !config.binary_protocol {
        params.push("protocol=ascii".to_string());
    }
    if let Some(timeout) = config.connect_timeout() {
        params.push(format!("connect_timeout={}", timeout.as_secs_f64()));
    }
    if let Some(timeout) = config.io_timeout() {
        params.push(format!("timeout={}", timeout.as_secs_f64()));
    }

    if params.is_empty() {
        base
    } else {
        format!("{}?{}", base, params.join("&"))
    }
}

/// Connection to a memcached server
pub struct MemcachedConnection {
    handle: ConnectionHandle<memcache::Client>,
    io_timeout: Option<Duration>,
}

impl MemcachedConnection {
    /// Parse the endpoint and connect.
    ///
    /// A malformed endpoint fails with [`KvError::Configuration`] before any
    /// connection is attempted.
    pub fn connect(config: &KeyValueConfig) -> Result<Self, KvError> {
        let endpoint = Endpoint::parse(&config.endpoint)?;
        let url = client_url(&endpoint, config);

        let mut handle = ConnectionHandle::new(BACKEND, endpoint);
        handle.establish(|endpoint| {
            memcache::Client::connect(url).map_err(|e| KvError::Connection {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })
        })?;

        let mut connection = Self {
            handle,
            io_timeout: None,
        };
        connection.set_io_timeout(config.io_timeout())?;

        debug!(
            binary_protocol = config.binary_protocol,
            socket = connection.handle.endpoint().is_socket(),
            "Memcached connection ready"
        );

        Ok(connection)
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

    fn client(&mut self) -> Result<&mut memcache::Client, KvError> {
        let state = self.handle.state();
        self.handle
            .transport_mut()
            .ok_or(KvError::NotConnected(state))
    }

    /// I/O errors leave the connection unusable
    fn observe(&mut self, error: &MemcacheError) {
        if matches!(error, MemcacheError::IOError(_)) {
            self.handle.mark_failed();
        }
    }
}

impl KeyValueStore for MemcachedConnection {
    #[instrument(skip(self, value), fields(size_bytes = value.len()))]
    fn put(&mut self, key: &str, value: &[u8], flags: u32, ttl: u32) -> Result<(), KvError> {
        let result = self
            .client()?
            .set(key, FlaggedValue { bytes: value, flags }, ttl);

        result.map_err(|e| {
            self.observe(&e);
            KvError::Store {
                key: key.to_string(),
                message: e.to_string(),
            }
        })
    }

    #[instrument(skip(self))]
    fn get(&mut self, key: &str) -> Result<StoredValue, KvError> {
        let result = self.client()?.get::<(Vec<u8>, u32)>(key);

        match result {
            Ok(Some((data, flags))) => Ok(StoredValue { data, flags }),
            Ok(None) => Err(KvError::NotFound(key.to_string())),
            Err(e) => {
                self.observe(&e);
                Err(KvError::Fetch {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), KvError> {
        let client = self.client()?;
        let applied = client
            .set_read_timeout(timeout)
            .and_then(|_| client.set_write_timeout(timeout));

        applied.map_err(|e| {
            self.observe(&e);
            KvError::Connection {
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
pub(crate) mod tests {
    use super::*;
    use crate::config::FailurePolicy;

    fn config(endpoint: &str) -> KeyValueConfig {
        KeyValueConfig {
            endpoint: endpoint.to_string(),
            binary_protocol: true,
            on_connect_failure: FailurePolicy::Disable,
            connect_timeout_ms: None,
            io_timeout_ms: None,
        }
    }

    #[test]
    fn test_client_url_tcp() {
        let endpoint = Endpoint::parse("cache.local:11211").unwrap();
        let mut config = config("cache.local:11211");
        assert_eq!(client_url(&endpoint, &config), "memcache://cache.local:11211");

        config.binary_protocol = false;
        assert_eq!(
            client_url(&endpoint, &config),
            "memcache://cache.local:11211?protocol=ascii"
        );
    }

    #[test]
    fn test_client_url_socket() {
        let endpoint = Endpoint::parse("/var/run/memcached.sock").unwrap();
        assert_eq!(
            client_url(&endpoint, &config("/var/run/memcached.sock")),
            "memcache:///var/run/memcached.sock"
        );
    }

    #[test]
    fn test_client_url_carries_timeouts() {
        let endpoint = Endpoint::parse("cache.local:11211").unwrap();
        let mut config = config("cache.local:11211");
        config.connect_timeout_ms = Some(250);
        config.io_timeout_ms = Some(2000);
        assert_eq!(
            client_url(&endpoint, &config),
            "memcache://cache.local:11211?connect_timeout=0.25&timeout=2"
        );

        config.binary_protocol = false;
        config.connect_timeout_ms = None;
        assert_eq!(
            client_url(&endpoint, &config),
            "memcache://cache.local:11211?protocol=ascii&timeout=2"
        );
    }

    #[test]
    fn test_connect_refused_within_connect_timeout() {
        let mut config = config(&refused_endpoint());
        config.connect_timeout_ms = Some(200);
        config.io_timeout_ms = Some(200);

        let started = std::time::Instant::now();
        let result = MemcachedConnection::connect(&config);

        assert!(matches!(result, Err(KvError::Connection { .. })));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    /// A local address with nothing listening on it
    pub(crate) fn refused_endpoint() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("127.0.0.1:{}", port)
    }

    #[test]
    fn test_connect_rejects_missing_separator() {
        assert!(matches!(
            MemcachedConnection::connect(&config("badformat")),
            Err(KvError::Configuration(EndpointError::MissingSeparator(_)))
        ));
    }

    #[test]
    fn test_connect_rejects_non_integral_port() {
        assert!(matches!(
            MemcachedConnection::connect(&config("localhost:eleven")),
            Err(KvError::Configuration(EndpointError::InvalidPort { .. }))
        ));
    }

    #[test]
    fn test_flagged_value_writes_bytes_and_flags() {
        let value = FlaggedValue {
            bytes: b"BM\x00\x01",
            flags: 16,
        };
        let mut out: Vec<u8> = Vec::new();

        assert_eq!(ToMemcacheValue::<Vec<u8>>::get_flags(&value), 16);
        assert_eq!(ToMemcacheValue::<Vec<u8>>::get_length(&value), 4);
        value.write_to(&mut out).unwrap();
        assert_eq!(out, b"BM\x00\x01");
    }
}

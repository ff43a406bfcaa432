//! Backend health checks.
//!
//! The key-value check stores a sentinel value and reads it back; the stream
//! check performs one liveness write. Each runs under a caller-supplied
//! timeout, after which the backend's previous I/O timeout is restored.

use crate::kv::{KeyValueStore, KvError};
use crate::stream::StreamLog;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Sentinel written by the key-value round trip
pub const SENTINEL_KEY: &str = "my_key";
pub const SENTINEL_VALUE: &[u8] = b"Hello, Memcached!";

/// Result of checking one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Unhealthy(String),
    /// The backend was disabled at startup
    Disabled,
}

impl BackendHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, BackendHealth::Healthy)
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendHealth::Healthy => f.write_str("healthy"),
            BackendHealth::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
            BackendHealth::Disabled => f.write_str("disabled"),
        }
    }
}

/// Health of both backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub key_value: BackendHealth,
    pub stream: BackendHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.key_value.is_healthy() && self.stream.is_healthy()
    }
}

/// Store the sentinel and compare what comes back byte for byte
pub fn check_key_value<K: KeyValueStore + ?Sized>(store: &mut K, timeout: Duration) -> BackendHealth {
    with_timeout(
        store,
        timeout,
        |s| s.io_timeout(),
        |s, t| s.set_io_timeout(t),
        key_value_round_trip,
    )
}

/// Perform the stream liveness write
pub fn check_stream<S: StreamLog + ?Sized>(stream: &mut S, timeout: Duration) -> BackendHealth {
    with_timeout(
        stream,
        timeout,
        |s| s.io_timeout(),
        |s, t| s.set_io_timeout(t),
        |s| s.probe(),
    )
}

fn key_value_round_trip<K: KeyValueStore + ?Sized>(store: &mut K) -> Result<(), KvError> {
    store.put(SENTINEL_KEY, SENTINEL_VALUE, 0, 0)?;
    let stored = store.get(SENTINEL_KEY)?;

    if stored.data != SENTINEL_VALUE {
        return Err(KvError::Fetch {
            key: SENTINEL_KEY.to_string(),
            message: format!(
                "read back {} bytes that differ from the {} bytes written",
                stored.data.len(),
                SENTINEL_VALUE.len()
            ),
        });
    }

    debug!(
        value = %String::from_utf8_lossy(&stored.data),
        "Retrieved value from memcached matches expected value"
    );
    Ok(())
}

/// Apply `timeout`, run `check`, then restore the previous timeout
fn with_timeout<B: ?Sized, E: fmt::Display>(
    backend: &mut B,
    timeout: Duration,
    current: impl Fn(&B) -> Option<Duration>,
    set: impl Fn(&mut B, Option<Duration>) -> Result<(), E>,
    check: impl FnOnce(&mut B) -> Result<(), E>,
) -> BackendHealth {
    let previous = current(&*backend);

    if let Err(e) = set(&mut *backend, Some(timeout)) {
        return BackendHealth::Unhealthy(e.to_string());
    }

    let health = match check(&mut *backend) {
        Ok(()) => BackendHealth::Healthy,
        Err(e) => BackendHealth::Unhealthy(e.to_string()),
    };

    if let Err(e) = set(&mut *backend, previous) {
        warn!(error = %e, "Failed to restore I/O timeout after health check");
    }

    health
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MockKeyValueStore, StoredValue};
    use crate::stream::{MockStreamLog, StreamError};
    use mockall::predicate::eq;
    use mockall::Sequence;

    const TIMEOUT: Duration = Duration::from_millis(250);

    #[test]
    fn test_key_value_round_trip_matches() {
        let mut store = MockKeyValueStore::new();
        let mut seq = Sequence::new();

        store.expect_io_timeout().return_const(None::<Duration>);
        store
            .expect_set_io_timeout()
            .with(eq(Some(TIMEOUT)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_put()
            .withf(|key, value, flags, ttl| {
                key == "my_key" && value == b"Hello, Memcached!" && *flags == 0 && *ttl == 0
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_get()
            .withf(|key| key == "my_key")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(StoredValue {
                    data: b"Hello, Memcached!".to_vec(),
                    flags: 0,
                })
            });
        store
            .expect_set_io_timeout()
            .with(eq(None::<Duration>))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert_eq!(check_key_value(&mut store, TIMEOUT), BackendHealth::Healthy);
    }

    #[test]
    fn test_key_value_round_trip_mismatch() {
        let mut store = MockKeyValueStore::new();
        store.expect_io_timeout().return_const(None::<Duration>);
        store.expect_set_io_timeout().returning(|_| Ok(()));
        store.expect_put().returning(|_, _, _, _| Ok(()));
        store.expect_get().returning(|_| {
            Ok(StoredValue {
                data: b"Hello, Memcached?".to_vec(),
                flags: 0,
            })
        });

        assert!(matches!(
            check_key_value(&mut store, TIMEOUT),
            BackendHealth::Unhealthy(_)
        ));
    }

    #[test]
    fn test_key_value_missing_sentinel() {
        let mut store = MockKeyValueStore::new();
        store.expect_io_timeout().return_const(None::<Duration>);
        store.expect_set_io_timeout().returning(|_| Ok(()));
        store.expect_put().returning(|_, _, _, _| Ok(()));
        store
            .expect_get()
            .returning(|key| Err(KvError::NotFound(key.to_string())));

        assert_eq!(
            check_key_value(&mut store, TIMEOUT),
            BackendHealth::Unhealthy("Key my_key not found".to_string())
        );
    }

    #[test]
    fn test_stream_probe_restores_previous_timeout() {
        let previous = Some(Duration::from_secs(5));
        let mut stream = MockStreamLog::new();
        let mut seq = Sequence::new();

        stream.expect_io_timeout().return_const(previous);
        stream
            .expect_set_io_timeout()
            .with(eq(Some(TIMEOUT)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        stream
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        stream
            .expect_set_io_timeout()
            .with(eq(previous))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert_eq!(check_stream(&mut stream, TIMEOUT), BackendHealth::Healthy);
    }

    #[test]
    fn test_stream_probe_failure() {
        let mut stream = MockStreamLog::new();
        stream.expect_io_timeout().return_const(None::<Duration>);
        stream.expect_set_io_timeout().returning(|_| Ok(()));
        stream
            .expect_probe()
            .returning(|| Err(StreamError::Probe("connection reset".to_string())));

        let health = check_stream(&mut stream, TIMEOUT);
        assert!(!health.is_healthy());
        assert_eq!(
            health.to_string(),
            "unhealthy: Liveness probe failed: connection reset"
        );
    }
}

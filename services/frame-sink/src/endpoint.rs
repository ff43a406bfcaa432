//! Backend endpoint parsing.
//!
//! Both backends are addressed by a single string. A leading `/` selects a
//! UNIX domain socket; anything else must be `host:port`, split at the first
//! colon.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Malformed endpoint string. Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint is empty")]
    Empty,

    #[error("Invalid endpoint '{0}': expected 'hostname:port' or a UNIX socket path")]
    MissingSeparator(String),

    #[error("Invalid endpoint '{0}': hostname is empty")]
    EmptyHost(String),

    #[error("Invalid port number in '{endpoint}': {message}")]
    InvalidPort { endpoint: String, message: String },

    #[error("Endpoint '{0}' is a UNIX socket, but this backend requires 'hostname:port'")]
    SocketNotSupported(String),
}

/// A parsed backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// UNIX domain socket path
    Unix(PathBuf),
    /// TCP host and port
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an endpoint that may be either a socket path or `host:port`.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EndpointError::Empty);
        }

        if input.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(input)));
        }

        Self::parse_host_port(input)
    }

    /// Parse an endpoint that must be `host:port`.
    pub fn parse_tcp(input: &str) -> Result<Self, EndpointError> {
        match Self::parse(input)? {
            Endpoint::Unix(_) => Err(EndpointError::SocketNotSupported(input.trim().to_string())),
            tcp => Ok(tcp),
        }
    }

    fn parse_host_port(input: &str) -> Result<Self, EndpointError> {
        let (host, port) = input
            .split_once(':')
            .ok_or_else(|| EndpointError::MissingSeparator(input.to_string()))?;

        if host.is_empty() {
            return Err(EndpointError::EmptyHost(input.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| EndpointError::InvalidPort {
                endpoint: input.to_string(),
                message: e.to_string(),
            })?;

        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Whether this endpoint is a UNIX domain socket
    pub fn is_socket(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

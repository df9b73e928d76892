//! Protocol constants and the option structs for both ends of a session.
//!
//! Keeping the wire constants next to the tunables makes it obvious which
//! values the client and server must agree on and which are local knobs.

use crate::util::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Current protocol: no START marker, clients probe the cursor eagerly.
pub const PROTOCOL_VERSION_CURRENT: i32 = -1;
/// Legacy protocol: the server writes START once it holds the transaction.
pub const PROTOCOL_VERSION_START_MARKER: i32 = 1;

pub const DEFAULT_FETCH_BATCH_SIZE: usize = 100;
/// Upper bound for one serialized object on a pipe.
pub const MAX_OBJECT_LEN: u32 = 64 * 1024 * 1024;
/// Output buffered by a pipe before it is pushed to the channel unflushed.
pub const PIPE_WRITE_BUFFER: usize = 8 * 1024;

pub const CLIENT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const CLIENT_RETRY_ATTEMPTS: usize = 3;
pub const CLIENT_BACKOFF: Duration = Duration::from_millis(50);
pub const SERVER_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period granted to the blocking listener when asked to shut down.
pub const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const MAX_CONCURRENT_CONNECTIONS: usize = 256;
/// A client not heard from for this long loses its lease and transactions.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const CLIENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub protocol_version: i32,
    /// How often the client renews its lease; `None` never renews it.
    pub keepalive_interval: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            keepalive_interval: Some(CLIENT_KEEPALIVE_INTERVAL),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol_version(mut self, version: i32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval.map(|interval| interval.max(Duration::from_millis(1)));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Records fetched under one attachment before the lease is released for I/O.
    pub fetch_batch_size: usize,
    pub client_idle_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            fetch_batch_size: DEFAULT_FETCH_BATCH_SIZE,
            client_idle_timeout: CLIENT_IDLE_TIMEOUT,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size.max(1);
        self
    }

    pub fn client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.client_idle_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpServerConfig {
    pub bind: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: Duration,
}

fn default_max_connections() -> usize {
    MAX_CONCURRENT_CONNECTIONS
}

fn default_stream_timeout() -> Duration {
    SERVER_STREAM_TIMEOUT
}

impl TcpServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            max_connections: MAX_CONCURRENT_CONNECTIONS,
            stream_timeout: SERVER_STREAM_TIMEOUT,
        }
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit.max(1);
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnectorOptions {
    pub(crate) socket_timeout: Duration,
    pub(crate) retry_policy: RetryPolicy,
}

impl Default for TcpConnectorOptions {
    fn default() -> Self {
        Self {
            socket_timeout: CLIENT_SOCKET_TIMEOUT,
            retry_policy: RetryPolicy::linear(CLIENT_RETRY_ATTEMPTS, CLIENT_BACKOFF)
                .with_skip_first_delay(true),
        }
    }
}

impl TcpConnectorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn retry_backoff(mut self, max_attempts: usize, base_delay: Duration) -> Self {
        self.retry_policy =
            RetryPolicy::linear(max_attempts, base_delay).with_skip_first_delay(true);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_deserialize_with_defaults() {
        let client: ClientOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(client.protocol_version, PROTOCOL_VERSION_CURRENT);
        let server: ServerOptions = serde_json::from_str(r#"{"fetch_batch_size":7}"#).unwrap();
        assert_eq!(server.fetch_batch_size, 7);
        assert_eq!(server.client_idle_timeout, CLIENT_IDLE_TIMEOUT);
        assert_eq!(client.keepalive_interval, Some(CLIENT_KEEPALIVE_INTERVAL));
    }

    #[test]
    fn batch_size_never_drops_to_zero() {
        assert_eq!(ServerOptions::new().fetch_batch_size(0).fetch_batch_size, 1);
    }
}

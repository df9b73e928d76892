//! Channel establishment. A [`Connector`] opens one duplex channel per call;
//! the server side of each channel is served by
//! [`RemoteRepositoryServer::serve`](crate::server::RemoteRepositoryServer::serve).

pub mod memory;
#[cfg(feature = "net")]
pub mod tcp;

pub use memory::{bounded_channel_pair, channel_pair, MemoryChannel, MemoryTransport};
#[cfg(feature = "net")]
pub use tcp::{TcpChannel, TcpConnector};

use crate::error::Result;
use crate::wire::Pipe;
use std::io::{self, Read, Write};

/// A bidirectional byte stream that can be shut down from either end.
pub trait Channel: Read + Write + Send {
    /// Closes both directions; the peer observes end of stream.
    fn shutdown(&mut self) -> io::Result<()>;

    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

pub trait Connector: Send + Sync {
    fn open(&self) -> Result<Pipe>;

    fn describe(&self) -> String;
}

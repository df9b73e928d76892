//! Blocking TCP listener that serves a remote repository session, one
//! connection per call.

use crate::error::RepositoryError;
use thiserror::Error;

mod repository;
mod server;

pub use repository::{RepositoryNetworkServer, RepositoryNetworkServerHandle};

/// Errors emitted by the listener itself. Failures of individual calls are
/// reported to the caller over the connection instead.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("service lock poisoned ({context})")]
    Poisoned { context: &'static str },
    #[error("{context} server shutdown timed out")]
    ShutdownTimeout { context: &'static str },
}

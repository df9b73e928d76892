//! Remote access to a transactional record repository.
//!
//! A [`server::RemoteRepositoryServer`] wraps an engine [`engine::Repository`]
//! and serves calls arriving over duplex channels. A
//! [`client::ClientRepository`] turns local storage, query, transaction,
//! sequence and procedure operations into those calls. Channels come from a
//! [`transport::Connector`]: in process through
//! [`transport::MemoryTransport`], or over TCP through
//! [`transport::TcpConnector`] and [`net::RepositoryNetworkServer`].

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
#[cfg(feature = "net")]
pub mod net;
pub mod prelude;
pub mod procedure;
pub mod record;
pub mod server;
pub mod transport;
pub mod util;
pub mod wire;

pub use client::{
    ClientCursor, ClientQuery, ClientRepository, ClientSequence, ClientStorage,
    ClientTransaction, ProcedureCall, ProcedureCursor,
};
pub use config::{ClientOptions, ServerOptions, TcpConnectorOptions, TcpServerConfig};
pub use engine::{Direction, Filter, IndexInfo, IsolationLevel, MapRepository, RelOp};
pub use error::{RemoteFailure, RepositoryError, Result};
pub use layout::{LayoutReconciler, RecordWriter};
pub use procedure::ProcedureItem;
pub use record::{Record, RecordLayout, Value, ValueKind};
pub use server::{ProcedureRegistry, ProcedureRequest, RemoteProcedure, RemoteRepositoryServer};
pub use transport::{Connector, MemoryTransport};

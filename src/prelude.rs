//! Convenience re-exports. Pull this module in via `use remora::prelude::*;`
//! for the types most callers need on either end of a session.

pub use crate::client::{ClientRepository, ClientStorage, ClientTransaction};
pub use crate::engine::{IsolationLevel, MapRepository, RelOp, Repository};
pub use crate::error::{RepositoryError, Result as RepositoryResult};
pub use crate::procedure::ProcedureItem;
pub use crate::record::{Record, RecordLayout, Value, ValueKind};
pub use crate::server::{ProcedureRegistry, RemoteRepositoryServer};
pub use crate::transport::{Connector, MemoryTransport};

#[cfg(feature = "net")]
pub use crate::net::RepositoryNetworkServer;
#[cfg(feature = "net")]
pub use crate::transport::TcpConnector;

//! Server side of the remote repository protocol.

mod controller;
mod lease;
mod lock;
mod procedure;
mod repository;
mod storage;
mod transaction;

pub use controller::UnreferencedController;
pub use procedure::{ProcedureRegistry, ProcedureReply, ProcedureRequest, RemoteProcedure};
pub use repository::{RemoteRepositoryServer, RemoteRepositoryServerBuilder};
pub use storage::RemoteStorageServer;
pub use transaction::{InertReason, LeaseCycle, TransactionHandle, TransactionLease};

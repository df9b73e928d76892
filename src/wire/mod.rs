//! Wire framing: op codes, the typed pipe, and call headers.

pub mod frame;
pub mod pipe;
pub mod request;

pub use frame::{CursorFrame, ProcedureOp, ResultCode};
pub use pipe::Pipe;
pub use request::{
    QueryAction, RecordTypeTransport, RemoteStorageTransport, RepositoryInfo, Request,
    SequenceOp, SequenceReply, StorageOp, TransactionOp, TransactionReply, TxnGrant, TxnRef,
};

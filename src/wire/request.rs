//! Call headers. Every channel opens with exactly one [`Request`]; what
//! follows on the pipe depends on the variant.

use crate::engine::{Filter, IsolationLevel, QuerySpec, Slice};
use crate::record::RecordLayout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Client side reference to a server transaction handle. `client` is the
/// lease the transaction was entered under; a reference outlives its lease
/// only as an invalid one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnRef {
    Live { client: u64, id: u64 },
    /// Stands in for a transaction whose parent could not be attached.
    Failed,
}

impl TxnRef {
    pub fn is_failed(&self) -> bool {
        matches!(self, TxnRef::Failed)
    }

    /// Lease the transaction belongs to.
    pub fn client(&self) -> Option<u64> {
        match self {
            TxnRef::Live { client, .. } => Some(*client),
            TxnRef::Failed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnGrant {
    pub txn: TxnRef,
    pub level: IsolationLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub session: u64,
    /// Lease minted for the describing client.
    pub client: u64,
}

/// What the client knows about a record type when it asks for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeTransport {
    pub protocol_version: i32,
    pub layout: RecordLayout,
}

/// The server's answer to a storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStorageTransport {
    pub storage: u64,
    pub protocol_version: i32,
    pub layout: RecordLayout,
    pub supported_properties: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Opens a client lease. `replaces` names a lease of the same client to
    /// retire, as on reconnect.
    Describe {
        replaces: Option<u64>,
    },
    KeepAlive {
        client: u64,
    },
    Release {
        client: u64,
    },
    StorageFor(RecordTypeTransport),
    EnterTransaction {
        client: u64,
        parent: Option<TxnRef>,
        level: IsolationLevel,
        lock_timeout_ms: Option<u64>,
        top: bool,
    },
    Transaction {
        txn: TxnRef,
        op: TransactionOp,
    },
    Storage {
        storage: u64,
        txn: Option<TxnRef>,
        op: StorageOp,
    },
    SequenceFor {
        name: String,
    },
    Sequence {
        name: String,
        op: SequenceOp,
    },
    Procedure {
        name: String,
        txn: Option<TxnRef>,
        /// Storage endpoints the caller bound; reply records are shaped for
        /// the caller's layouts of those types.
        #[serde(default)]
        endpoints: Vec<u64>,
    },
    IndexAccessors {
        type_name: String,
    },
    RepairIndex {
        type_name: String,
        index: String,
        desired_speed: f64,
    },
    Resync {
        type_name: String,
        desired_speed: f64,
        filter: Filter,
    },
}

impl Request {
    pub fn label(&self) -> &'static str {
        match self {
            Request::Describe { .. } => "describe",
            Request::KeepAlive { .. } => "keep_alive",
            Request::Release { .. } => "release",
            Request::StorageFor(_) => "storage_for",
            Request::EnterTransaction { .. } => "enter_transaction",
            Request::Transaction { op, .. } => op.label(),
            Request::Storage { op, .. } => op.label(),
            Request::SequenceFor { .. } => "sequence_for",
            Request::Sequence { .. } => "sequence",
            Request::Procedure { .. } => "procedure",
            Request::IndexAccessors { .. } => "index_accessors",
            Request::RepairIndex { .. } => "repair_index",
            Request::Resync { .. } => "resync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOp {
    Commit,
    Exit,
    SetForUpdate(bool),
    IsForUpdate,
    IsolationLevel,
}

impl TransactionOp {
    fn label(&self) -> &'static str {
        match self {
            TransactionOp::Commit => "txn_commit",
            TransactionOp::Exit => "txn_exit",
            TransactionOp::SetForUpdate(_) => "txn_set_for_update",
            TransactionOp::IsForUpdate => "txn_is_for_update",
            TransactionOp::IsolationLevel => "txn_isolation_level",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionReply {
    Committed(bool),
    Exited,
    ForUpdate(bool),
    Level(IsolationLevel),
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageOp {
    TryLoad,
    TryInsert,
    TryUpdate,
    TryDelete,
    Truncate,
    Query {
        spec: QuerySpec,
        action: QueryAction,
        timeout_ms: Option<u64>,
    },
}

impl StorageOp {
    fn label(&self) -> &'static str {
        match self {
            StorageOp::TryLoad => "try_load",
            StorageOp::TryInsert => "try_insert",
            StorageOp::TryUpdate => "try_update",
            StorageOp::TryDelete => "try_delete",
            StorageOp::Truncate => "truncate",
            StorageOp::Query { action, .. } => action.label(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryAction {
    Count,
    Fetch(Slice),
    LoadOne,
    TryLoadOne,
    DeleteOne,
    TryDeleteOne,
    DeleteAll,
    PrintNative { indent: usize },
    PrintPlan { indent: usize },
}

impl QueryAction {
    fn label(&self) -> &'static str {
        match self {
            QueryAction::Count => "query_count",
            QueryAction::Fetch(_) => "query_fetch",
            QueryAction::LoadOne => "query_load_one",
            QueryAction::TryLoadOne => "query_try_load_one",
            QueryAction::DeleteOne => "query_delete_one",
            QueryAction::TryDeleteOne => "query_try_delete_one",
            QueryAction::DeleteAll => "query_delete_all",
            QueryAction::PrintNative { .. } => "query_print_native",
            QueryAction::PrintPlan { .. } => "query_print_plan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceOp {
    NextInt,
    NextLong,
    NextDecimal,
    NextNumerical { radix: u32, min_length: usize },
    ReturnReservedValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceReply {
    Int(i32),
    Long(i64),
    Text(String),
    Flag(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_survive_json() {
        let request = Request::Storage {
            storage: 4,
            txn: Some(TxnRef::Live { client: 9, id: 2 }),
            op: StorageOp::Query {
                spec: QuerySpec::default(),
                action: QueryAction::Fetch(Slice::new(5, Some(10))),
                timeout_ms: None,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
        assert_eq!(back.label(), "query_fetch");
    }

    #[test]
    fn procedure_endpoints_default_to_none() {
        let json = r#"{"Procedure":{"name":"echo","txn":null}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            Request::Procedure {
                name: "echo".into(),
                txn: None,
                endpoints: Vec::new(),
            }
        );
        assert_eq!(TxnRef::Live { client: 3, id: 1 }.client(), Some(3));
        assert_eq!(TxnRef::Failed.client(), None);
    }
}

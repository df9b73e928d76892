use super::cursor::ClientCursor;
use super::query::ClientQuery;
use super::{read_reply, ClientCore};
use crate::config::PROTOCOL_VERSION_START_MARKER;
use crate::engine::{QuerySpec, Slice};
use crate::error::{RepositoryError, Result};
use crate::layout::RecordWriter;
use crate::record::{Record, RecordImage, RecordLayout};
use crate::transport::Connector;
use crate::wire::{Pipe, QueryAction, Request, ResultCode, StorageOp, TxnRef};
use log::debug;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Everything a storage proxy needs to reach its server endpoint. Replaced as
/// a whole on reconnect.
pub struct StorageBinding {
    connector: Arc<dyn Connector>,
    endpoint: u64,
    writer: Arc<RecordWriter>,
    protocol_version: i32,
    supported: BTreeSet<String>,
}

impl StorageBinding {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        endpoint: u64,
        writer: Arc<RecordWriter>,
        protocol_version: i32,
        supported: BTreeSet<String>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            writer,
            protocol_version,
            supported,
        }
    }

    pub fn endpoint(&self) -> u64 {
        self.endpoint
    }

    pub fn writer(&self) -> &Arc<RecordWriter> {
        &self.writer
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn supported_properties(&self) -> &BTreeSet<String> {
        &self.supported
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOp {
    Load,
    Insert,
    Update,
    Delete,
}

impl RecordOp {
    fn storage_op(self) -> StorageOp {
        match self {
            RecordOp::Load => StorageOp::TryLoad,
            RecordOp::Insert => StorageOp::TryInsert,
            RecordOp::Update => StorageOp::TryUpdate,
            RecordOp::Delete => StorageOp::TryDelete,
        }
    }

    fn image(self, writer: &RecordWriter, record: &Record) -> RecordImage {
        match self {
            RecordOp::Load => writer.for_load(record),
            RecordOp::Insert => writer.for_insert(record),
            RecordOp::Update => writer.for_update(record),
            RecordOp::Delete => writer.for_delete(record),
        }
    }

    fn narrow(self, err: RepositoryError) -> RepositoryError {
        match self {
            RecordOp::Load => err.into_fetch(),
            _ => err.into_persist(),
        }
    }
}

/// Local proxy for one record type stored on the server.
pub struct ClientStorage {
    core: Arc<ClientCore>,
    layout: Arc<RecordLayout>,
    binding: RwLock<Arc<StorageBinding>>,
}

impl ClientStorage {
    pub(crate) fn new(core: Arc<ClientCore>, layout: Arc<RecordLayout>, binding: StorageBinding) -> Self {
        Self {
            core,
            layout,
            binding: RwLock::new(Arc::new(binding)),
        }
    }

    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    pub fn binding(&self) -> Arc<StorageBinding> {
        self.binding.read().clone()
    }

    pub(crate) fn rebind(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let binding = self.core.bind_storage(connector, &self.layout)?;
        *self.binding.write() = Arc::new(binding);
        Ok(())
    }

    pub fn prepare(&self) -> Record {
        Record::new(self.layout.clone())
    }

    /// Whether the server can evaluate `name` on its own, as needed for
    /// filtering and ordering.
    pub fn is_property_supported(&self, name: &str) -> bool {
        self.binding.read().supported.contains(name)
    }

    pub fn query(&self) -> ClientQuery<'_> {
        ClientQuery::new(self)
    }

    pub fn try_load(&self, record: &mut Record) -> Result<bool> {
        self.record_call(RecordOp::Load, record)
    }

    pub fn try_insert(&self, record: &mut Record) -> Result<bool> {
        self.record_call(RecordOp::Insert, record)
    }

    pub fn try_update(&self, record: &mut Record) -> Result<bool> {
        self.record_call(RecordOp::Update, record)
    }

    pub fn try_delete(&self, record: &mut Record) -> Result<bool> {
        self.record_call(RecordOp::Delete, record)
    }

    pub fn load(&self, record: &mut Record) -> Result<()> {
        if self.try_load(record)? {
            Ok(())
        } else {
            Err(RepositoryError::FetchNone(self.describe_key(record)))
        }
    }

    pub fn insert(&self, record: &mut Record) -> Result<()> {
        if self.try_insert(record)? {
            Ok(())
        } else {
            Err(RepositoryError::UniqueConstraint(self.describe_key(record)))
        }
    }

    pub fn update(&self, record: &mut Record) -> Result<()> {
        if self.try_update(record)? {
            Ok(())
        } else {
            Err(RepositoryError::PersistNone(self.describe_key(record)))
        }
    }

    pub fn delete(&self, record: &mut Record) -> Result<()> {
        if self.try_delete(record)? {
            Ok(())
        } else {
            Err(RepositoryError::PersistNone(self.describe_key(record)))
        }
    }

    /// Removes every record of this type.
    pub fn truncate(&self) -> Result<()> {
        let (binding, txn) = self.prepare_call().map_err(RepositoryError::into_persist)?;
        self.simple_call(&binding, txn, StorageOp::Truncate)
            .map_err(RepositoryError::into_persist)
    }

    fn describe_key(&self, record: &Record) -> String {
        match record.primary_key() {
            Ok(key) => format!("{} {:?}", self.layout.type_name(), key),
            Err(_) => self.layout.type_name().to_string(),
        }
    }

    /// Current binding and thread transaction. A failed transaction is
    /// rejected here without contacting the server.
    fn prepare_call(&self) -> Result<(Arc<StorageBinding>, Option<TxnRef>)> {
        let txn = self.core.current_txn();
        if txn.map(|txn| txn.is_failed()).unwrap_or(false) {
            return Err(RepositoryError::TransactionInvalid);
        }
        Ok((self.binding(), txn))
    }

    fn open(&self, binding: &StorageBinding, txn: Option<TxnRef>, op: StorageOp) -> Result<Pipe> {
        self.core.begin_call(
            binding.connector.as_ref(),
            &Request::Storage {
                storage: binding.endpoint,
                txn,
                op,
            },
        )
    }

    fn record_call(&self, op: RecordOp, record: &mut Record) -> Result<bool> {
        let (binding, txn) = self.prepare_call().map_err(|err| op.narrow(err))?;
        let mut pipe = self
            .open(&binding, txn, op.storage_op())
            .map_err(|err| op.narrow(err))?;
        let outcome = Self::record_exchange(op, &binding, record, &mut pipe);
        let _ = pipe.close();
        outcome.map_err(|err| op.narrow(err))
    }

    fn record_exchange(
        op: RecordOp,
        binding: &StorageBinding,
        record: &mut Record,
        pipe: &mut Pipe,
    ) -> Result<bool> {
        pipe.write_object(&op.image(&binding.writer, record))?;
        pipe.flush()?;
        if let Some(failure) = pipe.read_throwable()? {
            return Err(failure.into_error());
        }
        match op {
            RecordOp::Load => {
                let found = pipe.read_bool()?;
                if found {
                    let image: RecordImage = pipe.read_object()?;
                    record.load_image(image);
                }
                Ok(found)
            }
            RecordOp::Delete => {
                let deleted = pipe.read_bool()?;
                if deleted {
                    record.mark_all_clean();
                }
                Ok(deleted)
            }
            RecordOp::Insert | RecordOp::Update => {
                match ResultCode::from_byte(pipe.read_byte()?)? {
                    ResultCode::Changed => {
                        let image: RecordImage = pipe.read_object()?;
                        record.load_image(image);
                        Ok(true)
                    }
                    ResultCode::Unchanged => {
                        record.mark_all_clean();
                        Ok(true)
                    }
                    ResultCode::ChangeFailed => Ok(false),
                }
            }
        }
    }

    fn simple_call<T: DeserializeOwned>(
        &self,
        binding: &StorageBinding,
        txn: Option<TxnRef>,
        op: StorageOp,
    ) -> Result<T> {
        let mut pipe = self.open(binding, txn, op)?;
        pipe.flush()?;
        let reply = read_reply(&mut pipe);
        let _ = pipe.close();
        reply
    }

    /// Runs a non-streaming query action and decodes its single reply.
    pub(crate) fn query_call<T: DeserializeOwned>(
        &self,
        spec: &QuerySpec,
        action: QueryAction,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let (binding, txn) = self.prepare_call()?;
        self.simple_call(
            &binding,
            txn,
            StorageOp::Query {
                spec: spec.clone(),
                action,
                timeout_ms: timeout.map(|timeout| timeout.as_millis() as u64),
            },
        )
    }

    /// Starts streaming the records selected by `spec`. Inside a transaction
    /// this returns only once the server holds the transaction.
    pub(crate) fn fetch(
        &self,
        spec: &QuerySpec,
        slice: Slice,
        timeout: Option<Duration>,
    ) -> Result<ClientCursor> {
        let (binding, txn) = self.prepare_call().map_err(RepositoryError::into_fetch)?;
        let op = StorageOp::Query {
            spec: spec.clone(),
            action: QueryAction::Fetch(slice),
            timeout_ms: timeout.map(|timeout| timeout.as_millis() as u64),
        };
        let mut pipe = self
            .open(&binding, txn, op)
            .map_err(RepositoryError::into_fetch)?;
        pipe.flush().map_err(RepositoryError::into_fetch)?;
        let mut cursor = ClientCursor::new(pipe, self.layout.clone());
        if txn.is_some() {
            if binding.protocol_version == PROTOCOL_VERSION_START_MARKER {
                cursor.await_start()?;
            } else {
                cursor.has_next()?;
            }
            debug!(
                "event=client_fetch_bound type={} endpoint={}",
                self.layout.type_name(),
                binding.endpoint
            );
        }
        Ok(cursor)
    }
}

//! Server end of a storage proxy: executes record and query calls against
//! one engine storage and writes the replies.

use super::controller::UnreferencedController;
use super::transaction::{LeaseCycle, TransactionHandle, TransactionLease};
use crate::engine::{Cursor, Query, QueryController, QuerySpec, Slice, Storage, TimeoutController};
use crate::error::{RepositoryError, Result};
use crate::layout::RecordWriter;
use crate::record::{Record, RecordImage};
use crate::wire::{CursorFrame, Pipe, QueryAction, ResultCode, StorageOp};
use log::debug;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOp {
    Load,
    Insert,
    Update,
    Delete,
}

impl RecordOp {
    fn narrow(self, err: RepositoryError) -> RepositoryError {
        match self {
            RecordOp::Load => err.into_fetch(),
            _ => err.into_persist(),
        }
    }
}

pub struct RemoteStorageServer {
    id: u64,
    storage: Arc<dyn Storage>,
    writer: Arc<RecordWriter>,
    write_start_marker: bool,
    batch_size: usize,
    session: Arc<UnreferencedController>,
}

impl RemoteStorageServer {
    pub(crate) fn new(
        id: u64,
        storage: Arc<dyn Storage>,
        writer: Arc<RecordWriter>,
        write_start_marker: bool,
        batch_size: usize,
        session: Arc<UnreferencedController>,
    ) -> Self {
        Self {
            id,
            storage,
            writer,
            write_start_marker,
            batch_size: batch_size.max(1),
            session,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn writer(&self) -> &Arc<RecordWriter> {
        &self.writer
    }

    pub fn dispatch(&self, op: StorageOp, txn: Option<Arc<TransactionHandle>>, pipe: Pipe) {
        match op {
            StorageOp::TryLoad => self.try_load(txn, pipe),
            StorageOp::TryInsert => self.try_insert(txn, pipe),
            StorageOp::TryUpdate => self.try_update(txn, pipe),
            StorageOp::TryDelete => self.try_delete(txn, pipe),
            StorageOp::Truncate => self.truncate(txn, pipe),
            StorageOp::Query {
                spec,
                action,
                timeout_ms,
            } => self.query(
                &spec,
                action,
                timeout_ms.map(Duration::from_millis),
                txn,
                pipe,
            ),
        }
    }

    pub fn try_load(&self, txn: Option<Arc<TransactionHandle>>, pipe: Pipe) {
        self.record_call(RecordOp::Load, txn, pipe)
    }

    pub fn try_insert(&self, txn: Option<Arc<TransactionHandle>>, pipe: Pipe) {
        self.record_call(RecordOp::Insert, txn, pipe)
    }

    pub fn try_update(&self, txn: Option<Arc<TransactionHandle>>, pipe: Pipe) {
        self.record_call(RecordOp::Update, txn, pipe)
    }

    pub fn try_delete(&self, txn: Option<Arc<TransactionHandle>>, pipe: Pipe) {
        self.record_call(RecordOp::Delete, txn, pipe)
    }

    pub fn truncate(&self, txn: Option<Arc<TransactionHandle>>, mut pipe: Pipe) {
        let result = attach(txn.as_ref()).and_then(|lease| {
            self.storage
                .truncate(lease.as_ref().map(TransactionLease::transaction))
        });
        let outcome = reply(&mut pipe, result.map_err(RepositoryError::into_persist));
        self.finish("truncate", outcome, pipe);
    }

    pub fn query(
        &self,
        spec: &QuerySpec,
        action: QueryAction,
        timeout: Option<Duration>,
        txn: Option<Arc<TransactionHandle>>,
        mut pipe: Pipe,
    ) {
        let outcome = match action {
            QueryAction::Fetch(slice) => self.fetch(spec, slice, timeout, txn, &mut pipe),
            QueryAction::PrintNative { indent } => {
                let printed = self.storage.query(spec).map(|query| query.print_native(indent));
                reply(&mut pipe, printed.map_err(RepositoryError::into_fetch))
            }
            QueryAction::PrintPlan { indent } => {
                let printed = self.storage.query(spec).map(|query| query.print_plan(indent));
                reply(&mut pipe, printed.map_err(RepositoryError::into_fetch))
            }
            action => {
                let persist = matches!(
                    action,
                    QueryAction::DeleteOne | QueryAction::TryDeleteOne | QueryAction::DeleteAll
                );
                let result = self.run_query(spec, action, timeout, txn.as_ref());
                let result = result.map_err(|err| {
                    if persist {
                        err.into_persist()
                    } else {
                        err.into_fetch()
                    }
                });
                reply(&mut pipe, result)
            }
        };
        self.finish("query", outcome, pipe);
    }

    fn finish(&self, call: &str, outcome: Result<()>, mut pipe: Pipe) {
        if let Err(err) = outcome {
            debug!(
                "event=storage_call_aborted storage={} call={call} error={err}",
                self.id
            );
        }
        if let Err(err) = pipe.close() {
            debug!(
                "event=storage_call_close_error storage={} call={call} error={err}",
                self.id
            );
        }
    }

    fn controller(&self, timeout: Option<Duration>) -> Arc<dyn QueryController> {
        let timeout = timeout
            .map(|timeout| Arc::new(TimeoutController::new(timeout)) as Arc<dyn QueryController>);
        self.session.merge(timeout)
    }

    fn record_call(&self, op: RecordOp, txn: Option<Arc<TransactionHandle>>, mut pipe: Pipe) {
        let outcome = self.record_exchange(op, txn.as_ref(), &mut pipe);
        self.finish("record", outcome, pipe);
    }

    fn record_exchange(
        &self,
        op: RecordOp,
        txn: Option<&Arc<TransactionHandle>>,
        pipe: &mut Pipe,
    ) -> Result<()> {
        let image: RecordImage = match pipe.read_object() {
            Ok(image) => image,
            Err(err) if err.is_io() => return Err(err),
            Err(err) => return reply_failure(pipe, op.narrow(err)),
        };
        let mut record = self.storage.prepare();
        record.load_image(image);
        let sent = record.image();

        let lease = match attach(txn) {
            Ok(lease) => lease,
            Err(err) => return reply_failure(pipe, op.narrow(err)),
        };
        let outcome = {
            let txn = lease.as_ref().map(TransactionLease::transaction);
            match op {
                RecordOp::Load => self.storage.try_load(txn, &mut record),
                RecordOp::Insert => self.storage.try_insert(txn, &mut record),
                RecordOp::Update => self.storage.try_update(txn, &mut record),
                RecordOp::Delete => self.storage.try_delete(txn, &mut record),
            }
        };
        drop(lease);

        let done = match outcome {
            Ok(done) => done,
            Err(err) => return reply_failure(pipe, op.narrow(err)),
        };
        pipe.write_throwable(None)?;
        match op {
            RecordOp::Load => {
                pipe.write_bool(done)?;
                if done {
                    pipe.write_object(&self.writer.load_response(&record))?;
                }
            }
            RecordOp::Delete => pipe.write_bool(done)?,
            RecordOp::Insert | RecordOp::Update => {
                if !done {
                    pipe.write_byte(ResultCode::ChangeFailed.as_byte())?;
                } else if record.image() == sent {
                    pipe.write_byte(ResultCode::Unchanged.as_byte())?;
                } else {
                    pipe.write_byte(ResultCode::Changed.as_byte())?;
                    let image = if op == RecordOp::Insert {
                        self.writer.insert_response(&record)
                    } else {
                        self.writer.update_response(&record)
                    };
                    pipe.write_object(&image)?;
                }
            }
        }
        pipe.flush()
    }

    fn run_query(
        &self,
        spec: &QuerySpec,
        action: QueryAction,
        timeout: Option<Duration>,
        txn: Option<&Arc<TransactionHandle>>,
    ) -> Result<JsonValue> {
        let query = self.storage.query(spec)?;
        let lease = attach(txn)?;
        let txn = lease.as_ref().map(TransactionLease::transaction);
        let value = match action {
            QueryAction::Count => {
                let controller = self.controller(timeout);
                controller.begin();
                let count = query.count(txn, controller.clone());
                controller.close();
                serde_json::to_value(count?)?
            }
            QueryAction::LoadOne => {
                serde_json::to_value(self.writer.load_response(&query.load_one(txn)?))?
            }
            QueryAction::TryLoadOne => serde_json::to_value(
                query
                    .try_load_one(txn)?
                    .map(|record| self.writer.load_response(&record)),
            )?,
            QueryAction::DeleteOne => {
                query.delete_one(txn)?;
                JsonValue::Null
            }
            QueryAction::TryDeleteOne => JsonValue::Bool(query.try_delete_one(txn)?),
            QueryAction::DeleteAll => {
                query.delete_all(txn)?;
                JsonValue::Null
            }
            QueryAction::Fetch(_)
            | QueryAction::PrintNative { .. }
            | QueryAction::PrintPlan { .. } => {
                return Err(RepositoryError::illegal_state(
                    "query action does not produce a single reply",
                ))
            }
        };
        Ok(value)
    }

    fn fetch(
        &self,
        spec: &QuerySpec,
        slice: Slice,
        timeout: Option<Duration>,
        txn: Option<Arc<TransactionHandle>>,
        pipe: &mut Pipe,
    ) -> Result<()> {
        let mut cycle = LeaseCycle::new(txn);
        let streamed = self.stream(spec, slice, timeout, &mut cycle, pipe);
        cycle.release();
        match streamed {
            Ok(rows) => {
                debug!("event=storage_fetch_end storage={} rows={rows}", self.id);
                Ok(())
            }
            Err(err) => {
                debug!(
                    "event=storage_fetch_failed storage={} error={err}",
                    self.id
                );
                let failure = err.into_fetch().to_remote();
                pipe.write_byte(CursorFrame::Exception.as_byte())?;
                pipe.write_object(&failure)?;
                pipe.flush()
            }
        }
    }

    fn stream(
        &self,
        spec: &QuerySpec,
        slice: Slice,
        timeout: Option<Duration>,
        cycle: &mut LeaseCycle,
        pipe: &mut Pipe,
    ) -> Result<usize> {
        cycle.acquire()?;
        if self.write_start_marker && cycle.is_bound() {
            pipe.write_byte(CursorFrame::Start.as_byte())?;
            pipe.flush()?;
        }
        let query = self.storage.query(spec)?;
        let controller = self.controller(timeout);
        controller.begin();
        let streamed = self.stream_batches(query.as_ref(), slice, controller.clone(), cycle, pipe);
        controller.close();
        streamed
    }

    fn stream_batches(
        &self,
        query: &dyn Query,
        slice: Slice,
        controller: Arc<dyn QueryController>,
        cycle: &mut LeaseCycle,
        pipe: &mut Pipe,
    ) -> Result<usize> {
        let mut cursor = CursorGuard(cycle.local(|txn| query.fetch(txn, slice, controller))?);
        let mut rows = 0;
        loop {
            let batch = cycle.local(|_| cursor.next_batch(self.batch_size))?;
            let exhausted = batch.len() < self.batch_size;
            rows += batch.len();
            cycle.io(|| self.write_batch(&batch, pipe))?;
            if exhausted {
                break;
            }
        }
        pipe.write_byte(CursorFrame::End.as_byte())?;
        pipe.flush()?;
        Ok(rows)
    }

    fn write_batch(&self, batch: &[Record], pipe: &mut Pipe) -> Result<()> {
        for record in batch {
            pipe.write_byte(CursorFrame::Record.as_byte())?;
            pipe.write_object(&self.writer.load_response(record))?;
        }
        pipe.flush()
    }
}

struct CursorGuard(Box<dyn Cursor>);

impl CursorGuard {
    fn next_batch(&mut self, size: usize) -> Result<Vec<Record>> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.0.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn attach(txn: Option<&Arc<TransactionHandle>>) -> Result<Option<TransactionLease>> {
    txn.map(|handle| handle.attach()).transpose()
}

fn reply_failure(pipe: &mut Pipe, err: RepositoryError) -> Result<()> {
    pipe.write_throwable(Some(&err.to_remote()))?;
    pipe.flush()
}

/// Null failure marker then the value, or the failure alone.
pub(crate) fn reply<T: Serialize>(pipe: &mut Pipe, result: Result<T>) -> Result<()> {
    match result {
        Ok(value) => {
            pipe.write_throwable(None)?;
            pipe.write_object(&value)?;
            pipe.flush()
        }
        Err(err) => reply_failure(pipe, err),
    }
}

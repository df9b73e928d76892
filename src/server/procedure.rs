//! Server half of remote procedure calls.
//!
//! The executor attaches the call's transaction for the whole exchange,
//! hands a [`ProcedureRequest`] to the named handler and guarantees that the
//! channel ends with exactly one terminator or failure frame.

use super::repository::RemoteRepositoryServer;
use super::transaction::{TransactionHandle, TransactionLease};
use crate::engine::{Repository, Transaction};
use crate::error::{RemoteFailure, RepositoryError, Result};
use crate::procedure::{ItemReceiver, ItemSender, ProcedureItem, RecordRole};
use crate::record::Record;
use crate::wire::{Pipe, ProcedureOp};
use log::{debug, error};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub trait RemoteProcedure: Send + Sync {
    fn handle_request(
        &self,
        repository: &dyn Repository,
        request: &mut ProcedureRequest<'_>,
    ) -> Result<()>;
}

struct FnProcedure<F>(F);

impl<F> RemoteProcedure for FnProcedure<F>
where
    F: Fn(&dyn Repository, &mut ProcedureRequest<'_>) -> Result<()> + Send + Sync,
{
    fn handle_request(
        &self,
        repository: &dyn Repository,
        request: &mut ProcedureRequest<'_>,
    ) -> Result<()> {
        (self.0)(repository, request)
    }
}

/// Procedures a session can run, by name.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, Arc<dyn RemoteProcedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, procedure: Arc<dyn RemoteProcedure>) {
        self.procedures.insert(name.into(), procedure);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&dyn Repository, &mut ProcedureRequest<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnProcedure(handler)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteProcedure>> {
        self.procedures.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Receiving,
    ReadyToSend,
    Sending,
    Closed,
}

pub struct ProcedureRequest<'a> {
    server: &'a RemoteRepositoryServer,
    endpoints: Vec<u64>,
    pipe: Pipe,
    lease: Option<TransactionLease>,
    bound: bool,
    state: RequestState,
    receiver: ItemReceiver,
    sender: ItemSender,
}

impl<'a> ProcedureRequest<'a> {
    fn new(
        server: &'a RemoteRepositoryServer,
        endpoints: Vec<u64>,
        pipe: Pipe,
        lease: Option<TransactionLease>,
    ) -> Self {
        Self {
            server,
            endpoints,
            pipe,
            bound: lease.is_some(),
            lease,
            state: RequestState::Receiving,
            receiver: ItemReceiver::default(),
            sender: ItemSender::default(),
        }
    }

    /// The attached transaction, until the request is closed.
    pub fn transaction(&self) -> Option<&dyn Transaction> {
        self.lease.as_ref().map(TransactionLease::transaction)
    }

    pub fn is_transaction_bound(&self) -> bool {
        self.bound
    }

    /// Next item sent by the caller; `None` once the caller is done.
    pub fn receive(&mut self) -> Result<Option<ProcedureItem>> {
        if self.state != RequestState::Receiving {
            return Err(RepositoryError::illegal_state(
                "request has been fully received",
            ));
        }
        match self.read_item() {
            Ok(None) => {
                self.state = RequestState::ReadyToSend;
                Ok(None)
            }
            Ok(item) => Ok(item),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Loads the next record sent by the caller into `record`. Returns
    /// `false` once the caller is done.
    pub fn receive_into(&mut self, record: &mut Record) -> Result<bool> {
        match self.receive()? {
            None => Ok(false),
            Some(ProcedureItem::Record(received)) => {
                if received.type_name() != record.type_name() {
                    return Err(RepositoryError::illegal_state(format!(
                        "expected a {} record, received a {} record",
                        record.type_name(),
                        received.type_name()
                    )));
                }
                record.load_image(received.image());
                Ok(true)
            }
            Some(ProcedureItem::Payload(_)) => Err(RepositoryError::illegal_state(
                "expected a record, received a payload",
            )),
        }
    }

    fn read_item(&mut self) -> Result<Option<ProcedureItem>> {
        let op = ProcedureOp::from_byte(self.pipe.read_byte()?)?;
        match op {
            ProcedureOp::Terminator => Ok(None),
            ProcedureOp::Serializable => Ok(Some(ProcedureItem::Payload(self.pipe.read_object()?))),
            ProcedureOp::StorableNewType | ProcedureOp::StorableExistingType => {
                let server = self.server;
                let record = self.receiver.receive_record(op, &mut self.pipe, |type_name| {
                    server.layout_for(type_name)
                })?;
                Ok(Some(ProcedureItem::Record(record)))
            }
            ProcedureOp::Throwable => {
                let failure: RemoteFailure = self.pipe.read_object()?;
                Err(failure.into_error())
            }
            ProcedureOp::Start => Err(RepositoryError::protocol(
                "unexpected start marker in procedure request",
            )),
        }
    }

    /// Switches the request to replying. Replying before the caller's items
    /// are all read is a protocol violation reported to both sides.
    pub fn begin_reply(&mut self) -> Result<ProcedureReply<'_, 'a>> {
        match self.state {
            RequestState::Receiving => {
                self.drain();
                let err = RepositoryError::illegal_state(
                    "reply started before the request was fully received",
                );
                self.close_with(Some(&err.to_remote()));
                return Err(err);
            }
            RequestState::ReadyToSend => {
                if let Err(err) = self.write_start() {
                    return Err(self.fail(err));
                }
                self.state = RequestState::Sending;
            }
            RequestState::Sending => {}
            RequestState::Closed => {
                return Err(RepositoryError::illegal_state("request is closed"));
            }
        }
        Ok(ProcedureReply { request: self })
    }

    /// Ends the exchange with a terminator. Unread items are discarded.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            RequestState::Closed => return Ok(()),
            RequestState::Receiving => self.drain(),
            RequestState::ReadyToSend | RequestState::Sending => {}
        }
        if self.state != RequestState::Sending {
            if let Err(err) = self.write_start() {
                return Err(self.fail(err));
            }
        }
        self.lease = None;
        let result = self
            .pipe
            .write_byte(ProcedureOp::Terminator.as_byte())
            .and_then(|_| self.pipe.flush());
        self.state = RequestState::Closed;
        let _ = self.pipe.close();
        result
    }

    pub fn silent_finish(&mut self) {
        if let Err(err) = self.finish() {
            debug!("event=remote_procedure_finish_failed error={err}");
        }
    }

    /// Ends the exchange with `err` as the caller's failure. Returns false
    /// when the request was already closed and nothing could be reported.
    pub fn silent_finish_with(&mut self, err: &RepositoryError) -> bool {
        if self.state == RequestState::Closed {
            return false;
        }
        if self.state == RequestState::Receiving {
            self.drain();
        }
        self.close_with(Some(&err.to_remote()))
    }

    pub fn is_closed(&self) -> bool {
        self.state == RequestState::Closed
    }

    fn write_start(&mut self) -> Result<()> {
        if self.bound {
            self.pipe.write_byte(ProcedureOp::Start.as_byte())?;
            self.pipe.flush()?;
        }
        Ok(())
    }

    fn drain(&mut self) {
        loop {
            match self.read_item() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    debug!("event=remote_procedure_drain_stopped error={err}");
                    break;
                }
            }
        }
        if self.state == RequestState::Receiving {
            self.state = RequestState::ReadyToSend;
        }
    }

    /// Closes after trying to report a failure. I/O problems are returned as
    /// they are; anything else is also written to the caller.
    fn fail(&mut self, err: RepositoryError) -> RepositoryError {
        if err.is_io() {
            self.close_with(None);
        } else {
            self.close_with(Some(&err.to_remote()));
        }
        err
    }

    fn close_with(&mut self, failure: Option<&RemoteFailure>) -> bool {
        self.lease = None;
        let mut written = true;
        if let Some(failure) = failure {
            let result = self
                .pipe
                .write_byte(ProcedureOp::Throwable.as_byte())
                .and_then(|_| self.pipe.write_object(failure))
                .and_then(|_| self.pipe.flush());
            if let Err(err) = result {
                debug!("event=remote_procedure_failure_unwritten error={err}");
                written = false;
            }
        }
        self.state = RequestState::Closed;
        let _ = self.pipe.close();
        written
    }

    fn send(&mut self, item: &ProcedureItem) -> Result<()> {
        if self.state != RequestState::Sending {
            return Err(RepositoryError::illegal_state("reply is closed"));
        }
        let server = self.server;
        let endpoints = &self.endpoints;
        let result = self.sender.send(&mut self.pipe, item, RecordRole::Reply, |layout| {
            Ok(server.reply_writer(layout.type_name(), endpoints))
        });
        result.map_err(|err| self.fail(err))
    }
}

impl Drop for ProcedureRequest<'_> {
    fn drop(&mut self) {
        // Detach before the pipe closes.
        self.lease = None;
    }
}

/// Items flowing back to the caller.
pub struct ProcedureReply<'r, 'a> {
    request: &'r mut ProcedureRequest<'a>,
}

impl ProcedureReply<'_, '_> {
    pub fn send(&mut self, item: impl Into<ProcedureItem>) -> Result<()> {
        self.request.send(&item.into())
    }

    pub fn send_all<I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<ProcedureItem>,
    {
        for item in items {
            self.send(item)?;
        }
        Ok(())
    }

    /// The next record re-announces its type.
    pub fn reset(&mut self) -> Result<()> {
        self.request.sender.reset();
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        let result = self.request.pipe.flush();
        result.map_err(|err| self.request.fail(err))
    }

    pub fn finish(self) -> Result<()> {
        self.request.finish()
    }
}

/// Runs one procedure call on behalf of `server`. Reply records are shaped
/// for the storage endpoints the caller has bound.
pub(crate) fn remote_call(
    server: &RemoteRepositoryServer,
    name: &str,
    txn: Option<Arc<TransactionHandle>>,
    endpoints: Vec<u64>,
    pipe: Pipe,
) {
    let lease = match txn.as_ref().map(|handle| handle.attach()).transpose() {
        Ok(lease) => lease,
        Err(err) => {
            let mut request = ProcedureRequest::new(server, endpoints, pipe, None);
            request.silent_finish_with(&err);
            return;
        }
    };
    let mut request = ProcedureRequest::new(server, endpoints, pipe, lease);
    let Some(procedure) = server.procedures().get(name) else {
        debug!("event=remote_procedure_unknown session={} name={name}", server.session_id());
        request.silent_finish_with(&RepositoryError::unsupported(format!(
            "no procedure named {name}"
        )));
        return;
    };
    debug!(
        "event=remote_procedure_start session={} name={name} bound={}",
        server.session_id(),
        request.is_transaction_bound()
    );
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        procedure.handle_request(server.repository().as_ref(), &mut request)
    }));
    match outcome {
        Ok(Ok(())) => request.silent_finish(),
        Ok(Err(err)) => {
            if !request.silent_finish_with(&err) {
                error!(
                    "event=remote_procedure_uncaught session={} name={name} error={err}",
                    server.session_id()
                );
            }
        }
        Err(_) => {
            error!(
                "event=remote_procedure_uncaught session={} name={name} error=panic",
                server.session_id()
            );
            request.silent_finish_with(&RepositoryError::Repository(format!(
                "procedure {name} panicked"
            )));
        }
    }
}

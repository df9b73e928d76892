//! Client half of remote procedure calls: items are streamed to the server
//! procedure, then its reply items are read back through a cursor.

use super::ClientCore;
use crate::error::{RemoteFailure, RepositoryError, Result};
use crate::procedure::{ItemReceiver, ItemSender, ProcedureItem, RecordRole};
use crate::wire::{Pipe, ProcedureOp, Request};
use log::debug;
use std::sync::Arc;
use std::thread;

pub struct ProcedureCall {
    core: Arc<ClientCore>,
    name: String,
    pipe: Option<Pipe>,
    sender: ItemSender,
    bound: bool,
}

impl ProcedureCall {
    pub(crate) fn begin(core: Arc<ClientCore>, name: &str) -> Result<Self> {
        let txn = core.current_txn();
        if txn.map(|txn| txn.is_failed()).unwrap_or(false) {
            return Err(RepositoryError::TransactionInvalid);
        }
        let connector = core.connector();
        let pipe = core.begin_call(
            connector.as_ref(),
            &Request::Procedure {
                name: name.to_string(),
                txn,
                endpoints: core.endpoints(),
            },
        )?;
        Ok(Self {
            core,
            name: name.to_string(),
            pipe: Some(pipe),
            sender: ItemSender::default(),
            bound: txn.is_some(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_transaction_bound(&self) -> bool {
        self.bound
    }

    pub fn send(&mut self, item: impl Into<ProcedureItem>) -> Result<()> {
        let item = item.into();
        let core = self.core.clone();
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(RepositoryError::illegal_state("procedure call is closed"));
        };
        let result = self.sender.send(pipe, &item, RecordRole::Request, |layout| {
            Ok(core.writer_for(layout))
        });
        if result.is_err() {
            self.abandon();
        }
        result
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
        self.sender.reset();
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        let result = match self.pipe.as_mut() {
            Some(pipe) => pipe.flush(),
            None => return Err(RepositoryError::illegal_state("procedure call is closed")),
        };
        if result.is_err() {
            self.abandon();
        }
        result
    }

    /// Ends the request and returns the server's reply. Inside a transaction
    /// this returns only once the server holds the transaction.
    pub fn fetch_reply(mut self) -> Result<ProcedureCursor> {
        let mut pipe = self
            .pipe
            .take()
            .ok_or_else(|| RepositoryError::illegal_state("procedure call is closed"))?;
        pipe.write_byte(ProcedureOp::Terminator.as_byte())?;
        pipe.flush()?;
        let mut cursor = ProcedureCursor {
            core: self.core.clone(),
            pipe: Some(pipe),
            receiver: ItemReceiver::default(),
        };
        if self.bound {
            cursor.await_start()?;
        }
        Ok(cursor)
    }

    /// Runs the procedure to completion, discarding its reply.
    pub fn execute(self) -> Result<()> {
        let mut cursor = self.fetch_reply()?;
        while cursor.next_item()?.is_some() {}
        Ok(())
    }

    /// Starts the procedure without waiting for it to finish. Not allowed
    /// inside a transaction.
    pub fn execute_async(self) -> Result<()> {
        if self.bound {
            return Err(RepositoryError::illegal_state(
                "asynchronous procedure calls cannot run inside a transaction",
            ));
        }
        let name = self.name.clone();
        let mut cursor = self.fetch_reply()?;
        thread::Builder::new()
            .name(format!("remora-procedure-{name}"))
            .spawn(move || loop {
                match cursor.next_item() {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(err) => {
                        debug!("event=procedure_async_failed name={name} error={err}");
                        break;
                    }
                }
            })?;
        Ok(())
    }

    fn abandon(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.close();
        }
    }
}

impl Drop for ProcedureCall {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Items sent back by a server procedure.
pub struct ProcedureCursor {
    core: Arc<ClientCore>,
    pipe: Option<Pipe>,
    receiver: ItemReceiver,
}

impl ProcedureCursor {
    fn await_start(&mut self) -> Result<()> {
        match self.read_op()? {
            ProcedureOp::Start => Ok(()),
            ProcedureOp::Throwable => Err(self.read_failure()),
            other => {
                self.close();
                Err(RepositoryError::protocol(format!(
                    "expected start marker, received {other:?}"
                )))
            }
        }
    }

    /// Next reply item; `None` after the terminator.
    pub fn next_item(&mut self) -> Result<Option<ProcedureItem>> {
        if self.pipe.is_none() {
            return Ok(None);
        }
        let op = self.read_op()?;
        let core = self.core.clone();
        let item = match op {
            ProcedureOp::Terminator => {
                self.close();
                return Ok(None);
            }
            ProcedureOp::Throwable => return Err(self.read_failure()),
            ProcedureOp::Start => {
                self.close();
                return Err(RepositoryError::protocol("start marker inside a reply"));
            }
            ProcedureOp::Serializable => self.with_pipe(|pipe, _| {
                pipe.read_object().map(ProcedureItem::Payload)
            }),
            ProcedureOp::StorableNewType | ProcedureOp::StorableExistingType => {
                self.with_pipe(|pipe, receiver| {
                    receiver
                        .receive_record(op, pipe, |type_name| core.layout_for(type_name))
                        .map(ProcedureItem::Record)
                })
            }
        };
        if item.is_err() {
            self.close();
        }
        item.map(Some)
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_none()
    }

    pub fn close(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.close();
        }
    }

    fn with_pipe<T, F>(&mut self, read: F) -> Result<T>
    where
        F: FnOnce(&mut Pipe, &mut ItemReceiver) -> Result<T>,
    {
        match self.pipe.as_mut() {
            Some(pipe) => read(pipe, &mut self.receiver),
            None => Err(RepositoryError::illegal_state("procedure reply is closed")),
        }
    }

    fn read_op(&mut self) -> Result<ProcedureOp> {
        let op = self.with_pipe(|pipe, _| pipe.read_byte().and_then(ProcedureOp::from_byte));
        if op.is_err() {
            self.close();
        }
        op
    }

    fn read_failure(&mut self) -> RepositoryError {
        let failure = self.with_pipe(|pipe, _| pipe.read_object::<RemoteFailure>());
        self.close();
        match failure {
            Ok(failure) => failure.into_error(),
            Err(err) => err,
        }
    }
}

impl Iterator for ProcedureCursor {
    type Item = Result<ProcedureItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

impl Drop for ProcedureCursor {
    fn drop(&mut self) {
        self.close();
    }
}

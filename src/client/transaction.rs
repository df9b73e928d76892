use super::scope;
use super::ClientCore;
use crate::engine::IsolationLevel;
use crate::error::{RepositoryError, Result};
use crate::wire::{Request, TransactionOp, TransactionReply, TxnRef};
use log::debug;
use std::marker::PhantomData;
use std::sync::Arc;

/// A remote transaction scoped to the thread that entered it. Storage calls
/// made on that thread run inside it until it exits; dropping it exits.
pub struct ClientTransaction {
    core: Arc<ClientCore>,
    txn: TxnRef,
    level: IsolationLevel,
    exited: bool,
    _thread: PhantomData<*const ()>,
}

impl ClientTransaction {
    pub(crate) fn new(core: Arc<ClientCore>, txn: TxnRef, level: IsolationLevel) -> Self {
        scope::push(core.id(), txn);
        Self {
            core,
            txn,
            level,
            exited: false,
            _thread: PhantomData,
        }
    }

    pub fn txn_ref(&self) -> TxnRef {
        self.txn
    }

    /// Entered under a parent that could not be attached, or under a lease
    /// the client has since given up; every use fails.
    pub fn is_failed(&self) -> bool {
        self.core.validate(self.txn).is_failed()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    /// `Ok(false)` when the server had already exited the transaction.
    /// Transactions lost to a reconnect fail with a persist error.
    pub fn commit(&mut self) -> Result<bool> {
        if self.exited {
            return Err(RepositoryError::illegal_state("transaction has exited"));
        }
        if self.is_failed() {
            return Err(RepositoryError::TransactionInvalid.into_persist());
        }
        match self.call(TransactionOp::Commit) {
            Ok(TransactionReply::Committed(committed)) => Ok(committed),
            Ok(other) => Err(unexpected(other)),
            Err(err) => Err(err.into_persist()),
        }
    }

    /// Exits the transaction, rolling back anything not committed. A
    /// transaction invalidated by a reconnect exits silently.
    pub fn exit(mut self) -> Result<()> {
        self.exit_in_place()
    }

    fn exit_in_place(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        scope::pop(self.core.id(), self.txn);
        if self.is_failed() {
            debug!("event=client_txn_exit_skipped txn={:?}", self.txn);
            return Ok(());
        }
        match self.call(TransactionOp::Exit) {
            Ok(_) => Ok(()),
            Err(err) if err.is_transaction_invalid() => {
                debug!("event=client_txn_exit_invalid txn={:?}", self.txn);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn set_for_update(&self, for_update: bool) -> Result<()> {
        self.live()?;
        self.call(TransactionOp::SetForUpdate(for_update)).map(|_| ())
    }

    pub fn is_for_update(&self) -> Result<bool> {
        self.live()?;
        match self.call(TransactionOp::IsForUpdate)? {
            TransactionReply::ForUpdate(for_update) => Ok(for_update),
            other => Err(unexpected(other)),
        }
    }

    /// Isolation level as the server currently reports it.
    pub fn remote_isolation_level(&self) -> Result<IsolationLevel> {
        self.live()?;
        match self.call(TransactionOp::IsolationLevel)? {
            TransactionReply::Level(level) => Ok(level),
            other => Err(unexpected(other)),
        }
    }

    fn live(&self) -> Result<()> {
        if self.exited {
            return Err(RepositoryError::illegal_state("transaction has exited"));
        }
        if self.is_failed() {
            return Err(RepositoryError::TransactionInvalid);
        }
        Ok(())
    }

    fn call(&self, op: TransactionOp) -> Result<TransactionReply> {
        self.core.call(&Request::Transaction { txn: self.txn, op })
    }
}

fn unexpected(reply: TransactionReply) -> RepositoryError {
    RepositoryError::protocol(format!("unexpected transaction reply {reply:?}"))
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        if let Err(err) = self.exit_in_place() {
            debug!(
                "event=client_txn_drop_exit_failed txn={:?} error={err}",
                self.txn
            );
        }
    }
}

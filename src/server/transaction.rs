//! Server side transaction handles.
//!
//! A handle owns one engine transaction on behalf of a remote client. Calls
//! for the same transaction may arrive on any worker thread, so every use of
//! the engine transaction happens under a [`TransactionLease`]: the handle's
//! FIFO lock is held and the engine transaction is attached to the thread for
//! the lifetime of the lease.

use super::lock::FairLock;
use crate::engine::{IsolationLevel, Transaction};
use crate::error::{RepositoryError, Result};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InertReason {
    Exited,
    /// The session that owned the handle went away.
    Unreferenced,
}

enum HandleState {
    Live(Arc<dyn Transaction>),
    Inert(InertReason),
    /// Created when a parent could not be attached; every use reports the
    /// transaction as invalid.
    Failed,
}

pub struct TransactionHandle {
    id: u64,
    state: Mutex<HandleState>,
    lock: FairLock,
}

impl TransactionHandle {
    pub fn live(id: u64, txn: Box<dyn Transaction>) -> Arc<Self> {
        Self::with_state(id, HandleState::Live(Arc::from(txn)))
    }

    pub fn failed() -> Arc<Self> {
        Self::with_state(0, HandleState::Failed)
    }

    pub fn exited(id: u64) -> Arc<Self> {
        Self::with_state(id, HandleState::Inert(InertReason::Exited))
    }

    fn with_state(id: u64, state: HandleState) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(state),
            lock: FairLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Live(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Failed)
    }

    pub fn inert_reason(&self) -> Option<InertReason> {
        match *self.state.lock() {
            HandleState::Inert(reason) => Some(reason),
            _ => None,
        }
    }

    fn underlying(&self) -> Result<Arc<dyn Transaction>> {
        match &*self.state.lock() {
            HandleState::Live(txn) => Ok(txn.clone()),
            HandleState::Inert(InertReason::Exited) => {
                Err(RepositoryError::illegal_state("transaction has exited"))
            }
            HandleState::Inert(InertReason::Unreferenced) => Err(
                RepositoryError::TransactionAborted("remote session was closed".into()),
            ),
            HandleState::Failed => Err(RepositoryError::TransactionInvalid),
        }
    }

    /// Waits in FIFO order for exclusive use of the engine transaction.
    pub fn attach(self: &Arc<Self>) -> Result<TransactionLease> {
        self.underlying()?;
        let ahead = self.lock.queued();
        if ahead > 0 {
            debug!("event=txn_handle_wait handle={} ahead={ahead}", self.id);
        }
        self.lock.acquire()?;
        let txn = match self.underlying() {
            Ok(txn) => txn,
            Err(err) => {
                self.lock.release();
                return Err(err);
            }
        };
        txn.attach();
        Ok(TransactionLease {
            handle: self.clone(),
            txn,
        })
    }

    /// `Ok(false)` when the handle already exited.
    pub fn commit(self: &Arc<Self>) -> Result<bool> {
        if let HandleState::Inert(InertReason::Exited) = *self.state.lock() {
            return Ok(false);
        }
        let lease = self.attach()?;
        lease.transaction().commit()?;
        Ok(true)
    }

    pub fn exit(self: &Arc<Self>) -> Result<()> {
        match *self.state.lock() {
            HandleState::Inert(_) => return Ok(()),
            HandleState::Failed => return Err(RepositoryError::TransactionInvalid),
            HandleState::Live(_) => {}
        }
        let lease = match self.attach() {
            Ok(lease) => lease,
            Err(_) if self.inert_reason().is_some() => return Ok(()),
            Err(err) => return Err(err),
        };
        lease.transaction().exit()?;
        *self.state.lock() = HandleState::Inert(InertReason::Exited);
        debug!("event=txn_handle_exit handle={}", self.id);
        Ok(())
    }

    /// Session teardown. Does not wait for the lock: an operation still
    /// holding a lease finishes against an exited engine transaction.
    pub fn unreferenced(&self) {
        let previous = {
            let mut state = self.state.lock();
            if !matches!(*state, HandleState::Live(_)) {
                return;
            }
            std::mem::replace(&mut *state, HandleState::Inert(InertReason::Unreferenced))
        };
        if let HandleState::Live(txn) = previous {
            if let Err(err) = txn.exit() {
                debug!(
                    "event=txn_handle_unreferenced_exit_error handle={} error={err}",
                    self.id
                );
            }
        }
        debug!("event=txn_handle_unreferenced handle={}", self.id);
    }

    pub fn set_for_update(&self, for_update: bool) -> Result<()> {
        match &*self.state.lock() {
            HandleState::Live(txn) => {
                txn.set_for_update(for_update);
                Ok(())
            }
            HandleState::Failed => Err(RepositoryError::TransactionInvalid),
            HandleState::Inert(_) => Ok(()),
        }
    }

    pub fn is_for_update(&self) -> bool {
        match &*self.state.lock() {
            HandleState::Live(txn) => txn.is_for_update(),
            _ => false,
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        match &*self.state.lock() {
            HandleState::Live(txn) => txn.isolation_level(),
            _ => IsolationLevel::None,
        }
    }
}

/// Exclusive use of a handle's engine transaction. Dropping the lease
/// detaches the transaction and admits the next waiter.
pub struct TransactionLease {
    handle: Arc<TransactionHandle>,
    txn: Arc<dyn Transaction>,
}

impl TransactionLease {
    pub fn transaction(&self) -> &dyn Transaction {
        self.txn.as_ref()
    }

    pub fn handle(&self) -> &Arc<TransactionHandle> {
        &self.handle
    }
}

impl Drop for TransactionLease {
    fn drop(&mut self) {
        self.txn.detach();
        self.handle.lock.release();
    }
}

/// Alternates between holding a lease for local work and releasing it for
/// I/O, as streaming operations must never block the transaction on the
/// network. Without a handle both phases simply run.
pub struct LeaseCycle {
    handle: Option<Arc<TransactionHandle>>,
    lease: Option<TransactionLease>,
}

impl LeaseCycle {
    pub fn new(handle: Option<Arc<TransactionHandle>>) -> Self {
        Self {
            handle,
            lease: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.lease.is_some()
    }

    pub fn acquire(&mut self) -> Result<()> {
        if self.lease.is_none() {
            if let Some(handle) = &self.handle {
                self.lease = Some(handle.attach()?);
            }
        }
        Ok(())
    }

    pub fn release(&mut self) {
        self.lease = None;
    }

    pub fn transaction(&self) -> Option<&dyn Transaction> {
        self.lease.as_ref().map(TransactionLease::transaction)
    }

    pub fn local<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(Option<&dyn Transaction>) -> Result<T>,
    {
        self.acquire()?;
        work(self.transaction())
    }

    pub fn io<T, F>(&mut self, io: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.release();
        io()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MapRepository, Repository};
    use std::thread;
    use std::time::Duration;

    fn live(repository: &MapRepository) -> Arc<TransactionHandle> {
        TransactionHandle::live(
            1,
            repository
                .enter_transaction(None, IsolationLevel::ReadCommitted)
                .unwrap(),
        )
    }

    #[test]
    fn exit_is_idempotent_and_commit_after_exit_reports_false() {
        let repository = MapRepository::new("t");
        let handle = live(&repository);
        assert!(handle.commit().unwrap());
        handle.exit().unwrap();
        handle.exit().unwrap();
        assert!(!handle.commit().unwrap());
        assert_eq!(handle.inert_reason(), Some(InertReason::Exited));
        assert!(matches!(
            handle.attach(),
            Err(RepositoryError::IllegalState(_))
        ));
        assert_eq!(handle.isolation_level(), IsolationLevel::None);
    }

    #[test]
    fn failed_handle_reports_invalid_everywhere() {
        let handle = TransactionHandle::failed();
        assert!(matches!(
            handle.attach(),
            Err(RepositoryError::TransactionInvalid)
        ));
        assert!(handle.commit().unwrap_err().is_transaction_invalid());
        assert!(handle.exit().unwrap_err().is_transaction_invalid());
    }

    #[test]
    fn unreferenced_commit_is_aborted() {
        let repository = MapRepository::new("t");
        let handle = live(&repository);
        handle.unreferenced();
        assert!(matches!(
            handle.commit(),
            Err(RepositoryError::TransactionAborted(_))
        ));
        handle.exit().unwrap();
    }

    #[test]
    fn leases_exclude_each_other_across_threads() {
        let repository = MapRepository::new("t");
        let handle = live(&repository);
        let mut workers = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..20 {
                    let lease = handle.attach().unwrap();
                    lease.transaction().set_for_update(true);
                    thread::sleep(Duration::from_micros(50));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(repository.attach_violations(), 0);
    }

    #[test]
    fn lease_cycle_releases_for_io() {
        let repository = MapRepository::new("t");
        let handle = live(&repository);
        let mut cycle = LeaseCycle::new(Some(handle.clone()));
        let bound = cycle.local(|txn| Ok(txn.is_some())).unwrap();
        assert!(bound);
        assert!(cycle.is_held());
        let other = handle.clone();
        let attached_elsewhere = cycle.io(|| {
            thread::spawn(move || other.attach().map(|_| true))
                .join()
                .unwrap()
                .unwrap()
        });
        assert!(attached_elsewhere);
        assert!(!cycle.is_held());
    }
}

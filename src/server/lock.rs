use crate::error::{RepositoryError, Result};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct TicketState {
    next_ticket: u64,
    serving: u64,
    owner: Option<ThreadId>,
}

/// FIFO mutual exclusion lock. Waiters are admitted strictly in arrival
/// order, so a thread that keeps re-acquiring between I/O rounds cannot
/// starve the others.
#[derive(Default)]
pub(crate) struct FairLock {
    state: Mutex<TicketState>,
    turn: Condvar,
}

impl FairLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until this caller's turn. Acquiring again from the owning
    /// thread is an error rather than a self-deadlock.
    pub(crate) fn acquire(&self) -> Result<()> {
        let current = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(current) {
            return Err(RepositoryError::illegal_state(
                "transaction is already attached to this thread",
            ));
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.serving != ticket {
            self.turn.wait(&mut state);
        }
        state.owner = Some(current);
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        state.serving += 1;
        drop(state);
        self.turn.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Holder plus waiters.
    pub(crate) fn queued(&self) -> u64 {
        let state = self.state.lock();
        state.next_ticket - state.serving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn same_thread_reacquire_is_rejected() {
        let lock = FairLock::new();
        lock.acquire().unwrap();
        assert!(matches!(
            lock.acquire(),
            Err(RepositoryError::IllegalState(_))
        ));
        lock.release();
        assert!(!lock.is_held());
        lock.acquire().unwrap();
        lock.release();
    }

    #[test]
    fn waiters_are_admitted_in_arrival_order() {
        let lock = Arc::new(FairLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.acquire().unwrap();
        let mut workers = Vec::new();
        for id in 0..4 {
            let worker_lock = lock.clone();
            let order = order.clone();
            workers.push(thread::spawn(move || {
                worker_lock.acquire().unwrap();
                order.lock().push(id);
                worker_lock.release();
            }));
            let deadline = Instant::now() + Duration::from_secs(5);
            while lock.queued() < id + 2 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
        lock.release();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}

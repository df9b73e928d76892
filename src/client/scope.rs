//! Per-thread transaction scope. Each client repository keeps its own stack
//! of entered transactions on every thread; the innermost one is implicitly
//! used by storage, query and procedure calls made on that thread.

use crate::wire::TxnRef;
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static SCOPES: RefCell<HashMap<u64, Vec<TxnRef>>> = RefCell::new(HashMap::new());
}

pub(crate) fn push(repository: u64, txn: TxnRef) {
    SCOPES.with(|scopes| {
        scopes
            .borrow_mut()
            .entry(repository)
            .or_default()
            .push(txn)
    });
}

/// Removes the innermost occurrence of `txn`.
pub(crate) fn pop(repository: u64, txn: TxnRef) {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if let Some(stack) = scopes.get_mut(&repository) {
            if let Some(position) = stack.iter().rposition(|entry| *entry == txn) {
                stack.remove(position);
            }
            if stack.is_empty() {
                scopes.remove(&repository);
            }
        }
    });
}

pub(crate) fn current(repository: u64) -> Option<TxnRef> {
    SCOPES.with(|scopes| {
        scopes
            .borrow()
            .get(&repository)
            .and_then(|stack| stack.last().copied())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_per_repository_and_per_thread() {
        let outer = TxnRef::Live { client: 1, id: 1 };
        let inner = TxnRef::Live { client: 1, id: 2 };
        push(7, outer);
        push(7, inner);
        push(8, TxnRef::Failed);
        assert_eq!(current(7), Some(inner));
        assert_eq!(current(8), Some(TxnRef::Failed));
        std::thread::spawn(|| assert_eq!(current(7), None))
            .join()
            .unwrap();
        pop(7, outer);
        assert_eq!(current(7), Some(inner));
        pop(7, inner);
        assert_eq!(current(7), None);
        pop(8, TxnRef::Failed);
    }
}

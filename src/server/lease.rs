//! Client leases.
//!
//! Every client is issued a lease when it describes the repository. The
//! transactions it enters belong to that lease, and a lease that is released,
//! replaced by a reconnect, or left idle past the timeout takes them along.

use super::transaction::TransactionHandle;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ClientLease {
    last_seen: Instant,
    transactions: HashMap<u64, Arc<TransactionHandle>>,
}

/// What a transaction reference found.
pub(crate) enum Lookup {
    Live(Arc<TransactionHandle>),
    /// The client still holds its lease but the transaction is gone.
    Gone,
    /// No lease is held under the referenced client id.
    UnknownClient,
}

pub(crate) struct ClientLeases {
    idle_timeout: Duration,
    clients: HashMap<u64, ClientLease>,
}

impl ClientLeases {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            clients: HashMap::new(),
        }
    }

    /// Issues a fresh lease under an unused nonzero id.
    pub(crate) fn issue(&mut self, now: Instant) -> u64 {
        let mut rng = rand::thread_rng();
        let client = loop {
            let candidate = rng.gen::<u64>();
            if candidate != 0 && !self.clients.contains_key(&candidate) {
                break candidate;
            }
        };
        self.clients.insert(
            client,
            ClientLease {
                last_seen: now,
                transactions: HashMap::new(),
            },
        );
        client
    }

    /// Records activity; `false` when no lease is held under `client`.
    pub(crate) fn touch(&mut self, client: u64, now: Instant) -> bool {
        match self.clients.get_mut(&client) {
            Some(lease) => {
                lease.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub(crate) fn lookup(&mut self, client: u64, id: u64, now: Instant) -> Lookup {
        match self.clients.get_mut(&client) {
            None => Lookup::UnknownClient,
            Some(lease) => {
                lease.last_seen = now;
                match lease.transactions.get(&id) {
                    Some(handle) => Lookup::Live(handle.clone()),
                    None => Lookup::Gone,
                }
            }
        }
    }

    /// `false` when the lease vanished before the handle could be filed.
    pub(crate) fn insert(&mut self, client: u64, handle: Arc<TransactionHandle>) -> bool {
        match self.clients.get_mut(&client) {
            Some(lease) => {
                lease.transactions.insert(handle.id(), handle);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_transaction(&mut self, client: u64, id: u64) {
        if let Some(lease) = self.clients.get_mut(&client) {
            lease.transactions.remove(&id);
        }
    }

    /// Drops the lease and hands back its transactions for teardown.
    pub(crate) fn retire(&mut self, client: u64) -> Vec<Arc<TransactionHandle>> {
        self.clients
            .remove(&client)
            .map(|lease| lease.transactions.into_values().collect())
            .unwrap_or_default()
    }

    /// Retires every lease idle for at least the timeout.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<(u64, Vec<Arc<TransactionHandle>>)> {
        let idle: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.last_seen) >= self.idle_timeout)
            .map(|(client, _)| *client)
            .collect();
        idle.into_iter()
            .map(|client| (client, self.retire(client)))
            .collect()
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = &Arc<TransactionHandle>> {
        self.clients
            .values()
            .flat_map(|lease| lease.transactions.values())
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }
}

//! One remote session: routes calls to storage endpoints, transaction
//! handles, sequences and procedures of a single engine repository.

use super::controller::UnreferencedController;
use super::lease::{ClientLeases, Lookup};
use super::procedure::{self, ProcedureRegistry};
use super::storage::{reply, RemoteStorageServer};
use super::transaction::TransactionHandle;
use crate::config::{ServerOptions, PROTOCOL_VERSION_START_MARKER};
use crate::engine::{IsolationLevel, Repository};
use crate::error::{RepositoryError, Result};
use crate::layout::{LayoutReconciler, RecordWriter};
use crate::record::RecordLayout;
use crate::wire::{
    CursorFrame, Pipe, ProcedureOp, QueryAction, RecordTypeTransport, RemoteStorageTransport,
    RepositoryInfo, Request, SequenceOp, SequenceReply, StorageOp, TransactionOp,
    TransactionReply, TxnGrant, TxnRef,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, PartialEq, Eq, Hash)]
struct StorageKey {
    protocol_version: i32,
    layout: RecordLayout,
}

#[derive(Default)]
struct StorageTable {
    by_key: HashMap<StorageKey, Arc<RemoteStorageServer>>,
    by_id: HashMap<u64, Arc<RemoteStorageServer>>,
}

pub struct RemoteRepositoryServerBuilder {
    repository: Arc<dyn Repository>,
    reconciler: Option<Arc<LayoutReconciler>>,
    options: ServerOptions,
    procedures: ProcedureRegistry,
}

impl RemoteRepositoryServerBuilder {
    pub fn reconciler(mut self, reconciler: Arc<LayoutReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn procedures(mut self, procedures: ProcedureRegistry) -> Self {
        self.procedures = procedures;
        self
    }

    pub fn build(self) -> Arc<RemoteRepositoryServer> {
        let session = rand::thread_rng().gen::<u64>();
        info!(
            "event=remote_session_open repository={} session={session} batch_size={} client_idle_ms={}",
            self.repository.name(),
            self.options.fetch_batch_size,
            self.options.client_idle_timeout.as_millis()
        );
        let leases = ClientLeases::new(self.options.client_idle_timeout);
        Arc::new(RemoteRepositoryServer {
            session,
            repository: self.repository,
            reconciler: self
                .reconciler
                .unwrap_or_else(|| Arc::new(LayoutReconciler::new())),
            options: self.options,
            procedures: self.procedures,
            storages: Mutex::new(StorageTable::default()),
            leases: Mutex::new(leases),
            next_id: AtomicU64::new(0),
            unreferenced: UnreferencedController::new(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct RemoteRepositoryServer {
    session: u64,
    repository: Arc<dyn Repository>,
    reconciler: Arc<LayoutReconciler>,
    options: ServerOptions,
    procedures: ProcedureRegistry,
    storages: Mutex<StorageTable>,
    leases: Mutex<ClientLeases>,
    next_id: AtomicU64,
    unreferenced: Arc<UnreferencedController>,
    closed: AtomicBool,
}

impl RemoteRepositoryServer {
    pub fn builder(repository: Arc<dyn Repository>) -> RemoteRepositoryServerBuilder {
        RemoteRepositoryServerBuilder {
            repository,
            reconciler: None,
            options: ServerOptions::default(),
            procedures: ProcedureRegistry::new(),
        }
    }

    pub fn new(repository: Arc<dyn Repository>) -> Arc<Self> {
        Self::builder(repository).build()
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn name(&self) -> &str {
        self.repository.name()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn procedures(&self) -> &ProcedureRegistry {
        &self.procedures
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transactions still usable by their clients.
    pub fn active_transactions(&self) -> usize {
        self.leases
            .lock()
            .handles()
            .filter(|handle| handle.is_live())
            .count()
    }

    pub fn client_idle_timeout(&self) -> Duration {
        self.options.client_idle_timeout
    }

    pub fn client_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// Ends the session: transactions are unreferenced and running queries
    /// are interrupted at their next check. Leases stay on file so a client
    /// still using a transaction learns it was aborted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unreferenced.unreferenced();
        let handles: Vec<_> = self.leases.lock().handles().cloned().collect();
        for handle in &handles {
            handle.unreferenced();
        }
        info!(
            "event=remote_session_close session={} transactions={}",
            self.session,
            handles.len()
        );
    }

    /// Retires the leases of clients idle past the configured timeout and
    /// unreferences their transactions. Returns how many were retired.
    pub fn expire_idle_clients(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let expired = self.leases.lock().expired(Instant::now());
        for (client, handles) in &expired {
            for handle in handles {
                handle.unreferenced();
            }
            warn!(
                "event=remote_client_expired session={} client={client} transactions={}",
                self.session,
                handles.len()
            );
        }
        expired.len()
    }

    fn retire_client(&self, client: u64, reason: &str) {
        let handles = self.leases.lock().retire(client);
        for handle in &handles {
            handle.unreferenced();
        }
        info!(
            "event=remote_client_retired session={} client={client} reason={reason} transactions={}",
            self.session,
            handles.len()
        );
    }

    /// Serves one inbound channel: reads its call header and runs the call.
    pub fn serve(&self, mut pipe: Pipe) {
        let request: Request = match pipe.read_object() {
            Ok(request) => request,
            Err(err) => {
                if !err.is_io() {
                    warn!(
                        "event=remote_call_bad_header session={} peer={} error={err}",
                        self.session,
                        pipe.peer()
                    );
                }
                let _ = pipe.close();
                return;
            }
        };
        debug!(
            "event=remote_call session={} call={}",
            self.session,
            request.label()
        );
        self.expire_idle_clients();
        // Transaction calls still resolve after close so their owners see
        // the abort.
        let after_close = matches!(request, Request::Transaction { .. } | Request::Release { .. });
        if self.is_closed() && !after_close {
            self.reject(
                &request,
                pipe,
                RepositoryError::illegal_state("remote session is closed"),
            );
            return;
        }
        match request {
            Request::Describe { replaces } => {
                let result = self.describe(replaces);
                self.respond(pipe, result)
            }
            Request::KeepAlive { client } => {
                let held = self.leases.lock().touch(client, Instant::now());
                if !held {
                    debug!(
                        "event=remote_keepalive_unknown session={} client={client}",
                        self.session
                    );
                }
                self.respond(pipe, Ok(held))
            }
            Request::Release { client } => {
                self.retire_client(client, "release");
                self.respond(pipe, Ok(()))
            }
            Request::StorageFor(transport) => {
                let result = self.storage_for(transport);
                self.respond(pipe, result)
            }
            Request::EnterTransaction {
                client,
                parent,
                level,
                lock_timeout_ms,
                top,
            } => {
                let result = self.enter_transaction(
                    client,
                    parent,
                    level,
                    lock_timeout_ms.map(Duration::from_millis),
                    top,
                );
                self.respond(pipe, result)
            }
            Request::Transaction { txn, op } => {
                let result = self.transaction_op(txn, op);
                self.respond(pipe, result)
            }
            Request::Storage { storage, txn, op } => match self.endpoint(storage) {
                Ok(endpoint) => endpoint.dispatch(op, self.resolve(txn), pipe),
                Err(err) => self.reject(&Request::Storage { storage, txn, op }, pipe, err),
            },
            Request::SequenceFor { name } => {
                let result = self.repository.sequence(&name).map(|_| ());
                self.respond(pipe, result)
            }
            Request::Sequence { name, op } => {
                let result = self.sequence_op(&name, op);
                self.respond(pipe, result)
            }
            Request::Procedure {
                name,
                txn,
                endpoints,
            } => procedure::remote_call(self, &name, self.resolve(txn), endpoints, pipe),
            Request::IndexAccessors { type_name } => {
                let result = self.repository.indexes(&type_name);
                self.respond(pipe, result)
            }
            Request::RepairIndex {
                type_name,
                index,
                desired_speed,
            } => {
                let result = self
                    .repository
                    .repair_index(&type_name, &index, desired_speed);
                self.respond(pipe, result)
            }
            Request::Resync {
                type_name,
                desired_speed,
                filter,
            } => {
                let result = self.repository.resync(&type_name, desired_speed, &filter);
                self.respond(pipe, result)
            }
        }
    }

    fn respond<T: serde::Serialize>(&self, mut pipe: Pipe, result: Result<T>) {
        if let Err(err) = reply(&mut pipe, result) {
            debug!(
                "event=remote_call_reply_failed session={} error={err}",
                self.session
            );
        }
        let _ = pipe.close();
    }

    /// Reports `err` using the framing the caller of `request` expects.
    fn reject(&self, request: &Request, mut pipe: Pipe, err: RepositoryError) {
        let failure = err.to_remote();
        let written = match request {
            Request::Storage {
                op:
                    StorageOp::Query {
                        action: QueryAction::Fetch(_),
                        ..
                    },
                ..
            } => pipe
                .write_byte(CursorFrame::Exception.as_byte())
                .and_then(|_| pipe.write_object(&failure)),
            Request::Procedure { .. } => pipe
                .write_byte(ProcedureOp::Throwable.as_byte())
                .and_then(|_| pipe.write_object(&failure)),
            _ => pipe.write_throwable(Some(&failure)),
        };
        if let Err(err) = written.and_then(|_| pipe.flush()) {
            debug!(
                "event=remote_call_reject_failed session={} error={err}",
                self.session
            );
        }
        let _ = pipe.close();
    }

    fn endpoint(&self, id: u64) -> Result<Arc<RemoteStorageServer>> {
        self.storages.lock().by_id.get(&id).cloned().ok_or_else(|| {
            RepositoryError::illegal_state(format!("unknown storage endpoint {id}"))
        })
    }

    /// Issues a lease, retiring the one a reconnecting client held before.
    fn describe(&self, replaces: Option<u64>) -> Result<RepositoryInfo> {
        if let Some(previous) = replaces {
            self.retire_client(previous, "reconnect");
        }
        let client = self.leases.lock().issue(Instant::now());
        info!(
            "event=remote_client_lease session={} client={client} replaces={replaces:?}",
            self.session
        );
        Ok(RepositoryInfo {
            name: self.repository.name().to_string(),
            session: self.session,
            client,
        })
    }

    /// Maps a wire reference to a handle. References held under a lease
    /// that was retired or never issued here resolve to a failed handle.
    pub(crate) fn resolve(&self, txn: Option<TxnRef>) -> Option<Arc<TransactionHandle>> {
        let (client, id) = match txn? {
            TxnRef::Failed => return Some(TransactionHandle::failed()),
            TxnRef::Live { client, id } => (client, id),
        };
        let found = self.leases.lock().lookup(client, id, Instant::now());
        Some(match found {
            Lookup::Live(handle) => handle,
            Lookup::Gone => TransactionHandle::exited(id),
            Lookup::UnknownClient => {
                debug!(
                    "event=remote_txn_stale session={} client={client} txn={id}",
                    self.session
                );
                TransactionHandle::failed()
            }
        })
    }

    fn storage_for(&self, transport: RecordTypeTransport) -> Result<RemoteStorageTransport> {
        let key = StorageKey {
            protocol_version: transport.protocol_version,
            layout: transport.layout,
        };
        let mut table = self.storages.lock();
        let endpoint = match table.by_key.get(&key) {
            Some(endpoint) => endpoint.clone(),
            None => {
                let storage = self.repository.storage_for(key.layout.type_name())?;
                let writer = self.reconciler.writer_for(&storage.layout(), &key.layout)?;
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let endpoint = Arc::new(RemoteStorageServer::new(
                    id,
                    storage,
                    writer,
                    key.protocol_version == PROTOCOL_VERSION_START_MARKER,
                    self.options.fetch_batch_size,
                    self.unreferenced.clone(),
                ));
                info!(
                    "event=remote_storage_bound session={} storage={id} type={} protocol={} projected={}",
                    self.session,
                    key.layout.type_name(),
                    key.protocol_version,
                    !endpoint.writer().is_identity()
                );
                table.by_id.insert(id, endpoint.clone());
                table.by_key.insert(key.clone(), endpoint.clone());
                endpoint
            }
        };
        drop(table);
        let names: Vec<String> = key
            .layout
            .properties()
            .iter()
            .map(|property| property.name.clone())
            .collect();
        Ok(RemoteStorageTransport {
            storage: endpoint.id(),
            protocol_version: key.protocol_version,
            layout: (*endpoint.storage().layout()).clone(),
            supported_properties: endpoint.storage().supported_properties(&names),
        })
    }

    /// Writer for records of `type_name` sent to a caller that has bound
    /// `endpoints`. A caller with no endpoint for the type gets the full
    /// engine layout.
    pub(crate) fn reply_writer(&self, type_name: &str, endpoints: &[u64]) -> Arc<RecordWriter> {
        let table = self.storages.lock();
        endpoints
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .find(|endpoint| endpoint.storage().layout().type_name() == type_name)
            .map(|endpoint| endpoint.writer().clone())
            .unwrap_or_else(|| Arc::new(RecordWriter::identity()))
    }

    pub(crate) fn layout_for(&self, type_name: &str) -> Result<Arc<RecordLayout>> {
        Ok(self.repository.storage_for(type_name)?.layout())
    }

    fn enter_transaction(
        &self,
        client: u64,
        parent: Option<TxnRef>,
        level: IsolationLevel,
        lock_timeout: Option<Duration>,
        top: bool,
    ) -> Result<TxnGrant> {
        if !self.leases.lock().touch(client, Instant::now()) {
            return Err(RepositoryError::illegal_state(format!(
                "client lease {client} is not held"
            )));
        }
        let parent = if top { None } else { self.resolve(parent) };
        let lease = match parent.as_ref().map(|handle| handle.attach()).transpose() {
            Ok(lease) => lease,
            Err(err) => {
                debug!(
                    "event=remote_txn_parent_unavailable session={} error={err}",
                    self.session
                );
                return Ok(TxnGrant {
                    txn: TxnRef::Failed,
                    level,
                });
            }
        };
        let txn = self
            .repository
            .enter_transaction(lease.as_ref().map(|lease| lease.transaction()), level)?;
        if let Some(timeout) = lock_timeout {
            txn.set_desired_lock_timeout(timeout);
        }
        drop(lease);
        let level = txn.isolation_level();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = TransactionHandle::live(id, txn);
        if !self.leases.lock().insert(client, handle.clone()) {
            handle.unreferenced();
            return Err(RepositoryError::illegal_state(format!(
                "client lease {client} expired while entering a transaction"
            )));
        }
        debug!(
            "event=remote_txn_enter session={} client={client} txn={id} nested={} level={level:?}",
            self.session,
            parent.is_some()
        );
        Ok(TxnGrant {
            txn: TxnRef::Live { client, id },
            level,
        })
    }

    fn transaction_op(&self, txn: TxnRef, op: TransactionOp) -> Result<TransactionReply> {
        let client = txn.client();
        let Some(handle) = self.resolve(Some(txn)) else {
            return Err(RepositoryError::illegal_state("missing transaction"));
        };
        match op {
            TransactionOp::Commit => handle.commit().map(TransactionReply::Committed),
            TransactionOp::Exit => {
                handle.exit()?;
                if let Some(client) = client {
                    self.leases.lock().remove_transaction(client, handle.id());
                }
                Ok(TransactionReply::Exited)
            }
            TransactionOp::SetForUpdate(for_update) => {
                handle.set_for_update(for_update)?;
                Ok(TransactionReply::Done)
            }
            TransactionOp::IsForUpdate => Ok(TransactionReply::ForUpdate(handle.is_for_update())),
            TransactionOp::IsolationLevel => Ok(TransactionReply::Level(handle.isolation_level())),
        }
    }

    fn sequence_op(&self, name: &str, op: SequenceOp) -> Result<SequenceReply> {
        let sequence = self.repository.sequence(name)?;
        let reply = match op {
            SequenceOp::NextInt => SequenceReply::Int(sequence.next_int()?),
            SequenceOp::NextLong => SequenceReply::Long(sequence.next_long()?),
            SequenceOp::NextDecimal => SequenceReply::Text(sequence.next_decimal()?),
            SequenceOp::NextNumerical { radix, min_length } => {
                SequenceReply::Text(sequence.next_numerical(radix, min_length)?)
            }
            SequenceOp::ReturnReservedValues => {
                SequenceReply::Flag(sequence.return_reserved_values()?)
            }
        };
        Ok(reply)
    }
}

//! Client side of the remote repository protocol.
//!
//! A [`ClientRepository`] hands out local proxies (storages, transactions,
//! sequences and procedure calls) that turn every operation into one call
//! over a channel opened by the current [`Connector`]. Reconnecting swaps the
//! connector and rebinds the proxies in place, so callers keep their handles.

mod capability;
mod cursor;
mod procedure;
mod query;
mod scope;
mod sequence;
mod storage;
mod transaction;

pub use cursor::ClientCursor;
pub use procedure::{ProcedureCall, ProcedureCursor};
pub use query::ClientQuery;
pub use sequence::ClientSequence;
pub use storage::{ClientStorage, StorageBinding};
pub use transaction::ClientTransaction;
pub use capability::{ClientIndexEntryAccessor, ClientResync};

use crate::config::ClientOptions;
use crate::engine::{IndexInfo, IsolationLevel};
use crate::error::{RepositoryError, Result};
use crate::layout::{LayoutReconciler, RecordWriter};
use crate::record::RecordLayout;
use crate::transport::Connector;
use crate::wire::{
    Pipe, RecordTypeTransport, RemoteStorageTransport, RepositoryInfo, Request, TxnGrant, TxnRef,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

const KEEPALIVE_TICK: Duration = Duration::from_millis(50);

struct Session {
    connector: Arc<dyn Connector>,
    info: RepositoryInfo,
}

/// A record type opened through this client.
struct BoundType {
    layout: Arc<RecordLayout>,
    writer: Arc<RecordWriter>,
    endpoint: u64,
}

/// State shared by a repository and every proxy it handed out.
pub(crate) struct ClientCore {
    id: u64,
    options: ClientOptions,
    reconciler: Arc<LayoutReconciler>,
    session: RwLock<Session>,
    types: RwLock<HashMap<String, BoundType>>,
    closed: AtomicBool,
}

impl ClientCore {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        self.session.read().connector.clone()
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session.read().info.session
    }

    /// Lease the server issued this client for the current session.
    pub(crate) fn lease_id(&self) -> u64 {
        self.session.read().info.client
    }

    /// A reference entered under an earlier lease is invalid; the server
    /// is never asked about it.
    pub(crate) fn validate(&self, txn: TxnRef) -> TxnRef {
        match txn.client() {
            Some(client) if client != self.lease_id() => TxnRef::Failed,
            _ => txn,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RepositoryError::illegal_state("client repository is closed"))
        } else {
            Ok(())
        }
    }

    /// Innermost transaction entered on this thread.
    pub(crate) fn current_txn(&self) -> Option<TxnRef> {
        scope::current(self.id).map(|txn| self.validate(txn))
    }

    /// Opens a channel and writes the call header; the caller continues the
    /// exchange.
    pub(crate) fn begin_call(&self, connector: &dyn Connector, request: &Request) -> Result<Pipe> {
        self.check_open()?;
        let mut pipe = connector.open()?;
        pipe.write_object(request)?;
        Ok(pipe)
    }

    /// A call whose reply is a null failure marker and one object.
    pub(crate) fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let connector = self.connector();
        self.call_on(connector.as_ref(), request)
    }

    pub(crate) fn call_on<T: DeserializeOwned>(
        &self,
        connector: &dyn Connector,
        request: &Request,
    ) -> Result<T> {
        let mut pipe = self.begin_call(connector, request)?;
        pipe.flush()?;
        let reply = read_reply(&mut pipe);
        let _ = pipe.close();
        reply
    }

    fn describe(&self, connector: &dyn Connector, replaces: Option<u64>) -> Result<RepositoryInfo> {
        self.call_on(connector, &Request::Describe { replaces })
    }

    /// Takes a fresh lease from the current server after the old one was
    /// lost. Transactions of the old lease stay invalid.
    fn renew_lease(&self) -> Result<()> {
        let connector = self.connector();
        let previous = self.lease_id();
        let info = self.describe(connector.as_ref(), Some(previous))?;
        let mut session = self.session.write();
        if session.info.client != previous {
            // A reconnect already replaced it.
            return Ok(());
        }
        warn!(
            "event=client_lease_renewed session={} old_client={previous} new_client={}",
            info.session, info.client
        );
        session.info = info;
        Ok(())
    }

    fn keep_alive(&self) -> Result<()> {
        let held: bool = self.call(&Request::KeepAlive {
            client: self.lease_id(),
        })?;
        if held {
            Ok(())
        } else {
            self.renew_lease()
        }
    }

    /// Storage endpoints bound by this client, for shaping reply records.
    pub(crate) fn endpoints(&self) -> Vec<u64> {
        self.types.read().values().map(|bound| bound.endpoint).collect()
    }

    /// Asks the server behind `connector` for storage of `local`'s type.
    pub(crate) fn bind_storage(
        &self,
        connector: Arc<dyn Connector>,
        local: &Arc<RecordLayout>,
    ) -> Result<StorageBinding> {
        let request = Request::StorageFor(RecordTypeTransport {
            protocol_version: self.options.protocol_version,
            layout: (**local).clone(),
        });
        let transport: RemoteStorageTransport = self.call_on(connector.as_ref(), &request)?;
        let remote = Arc::new(transport.layout);
        let writer = self.reconciler.writer_for(local, &remote)?;
        self.types.write().insert(
            local.type_name().to_string(),
            BoundType {
                layout: local.clone(),
                writer: writer.clone(),
                endpoint: transport.storage,
            },
        );
        debug!(
            "event=client_storage_bound type={} endpoint={} protocol={}",
            local.type_name(),
            transport.storage,
            transport.protocol_version
        );
        Ok(StorageBinding::new(
            connector,
            transport.storage,
            writer,
            transport.protocol_version,
            transport.supported_properties,
        ))
    }

    /// Local layout for records of `type_name` arriving from the server.
    pub(crate) fn layout_for(&self, type_name: &str) -> Result<Arc<RecordLayout>> {
        self.types
            .read()
            .get(type_name)
            .map(|bound| bound.layout.clone())
            .ok_or_else(|| {
                RepositoryError::illegal_state(format!(
                    "no storage has been opened for record type {type_name}"
                ))
            })
    }

    pub(crate) fn writer_for(&self, layout: &RecordLayout) -> Arc<RecordWriter> {
        self.types
            .read()
            .get(layout.type_name())
            .map(|bound| bound.writer.clone())
            .unwrap_or_else(|| Arc::new(RecordWriter::identity()))
    }
}

/// Renews the lease every `interval` until the client closes or is dropped.
fn spawn_keepalive(core: Weak<ClientCore>, interval: Duration) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("remora-keepalive".into())
        .spawn(move || {
            let mut next = Instant::now() + interval;
            loop {
                thread::sleep(KEEPALIVE_TICK.min(interval));
                let Some(core) = core.upgrade() else {
                    break;
                };
                if core.is_closed() {
                    break;
                }
                if Instant::now() < next {
                    continue;
                }
                if let Err(err) = core.keep_alive() {
                    debug!(
                        "event=client_keepalive_failed client={} error={err}",
                        core.lease_id()
                    );
                }
                next = Instant::now() + interval;
            }
        })?;
    Ok(handle)
}

/// Reads a null-or-failure marker then, on success, one object.
pub(crate) fn read_reply<T: DeserializeOwned>(pipe: &mut Pipe) -> Result<T> {
    if let Some(failure) = pipe.read_throwable()? {
        return Err(failure.into_error());
    }
    pipe.read_object()
}

pub struct ClientRepository {
    core: Arc<ClientCore>,
    storages: Mutex<HashMap<String, Arc<ClientStorage>>>,
    sequences: Mutex<HashMap<String, Arc<ClientSequence>>>,
    keepalive: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ClientRepository {
    pub fn connect(connector: Arc<dyn Connector>) -> Result<Self> {
        Self::connect_with(connector, ClientOptions::default())
    }

    pub fn connect_with(connector: Arc<dyn Connector>, options: ClientOptions) -> Result<Self> {
        Self::connect_with_reconciler(connector, options, Arc::new(LayoutReconciler::new()))
    }

    pub fn connect_with_reconciler(
        connector: Arc<dyn Connector>,
        options: ClientOptions,
        reconciler: Arc<LayoutReconciler>,
    ) -> Result<Self> {
        let info: RepositoryInfo = {
            let mut pipe = connector.open()?;
            pipe.write_object(&Request::Describe { replaces: None })?;
            pipe.flush()?;
            let reply = read_reply(&mut pipe);
            let _ = pipe.close();
            reply?
        };
        info!(
            "event=client_connect repository={} session={} client={} via={}",
            info.name,
            info.session,
            info.client,
            connector.describe()
        );
        let core = Arc::new(ClientCore {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            reconciler,
            session: RwLock::new(Session { connector, info }),
            types: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let keepalive = match core.options.keepalive_interval {
            Some(interval) => Some(spawn_keepalive(Arc::downgrade(&core), interval)?),
            None => None,
        };
        Ok(Self {
            core,
            storages: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(keepalive),
        })
    }

    pub fn name(&self) -> String {
        self.core.session.read().info.name.clone()
    }

    pub fn session_id(&self) -> u64 {
        self.core.session_id()
    }

    pub fn options(&self) -> &ClientOptions {
        self.core.options()
    }

    /// Storage proxy for `layout`'s record type; repeated requests return the
    /// same proxy.
    pub fn storage_for(&self, layout: impl Into<Arc<RecordLayout>>) -> Result<Arc<ClientStorage>> {
        let layout = layout.into();
        self.core.check_open()?;
        let mut storages = self.storages.lock();
        if let Some(storage) = storages.get(layout.type_name()) {
            if !storage.layout().equal_layouts(&layout) {
                return Err(RepositoryError::illegal_state(format!(
                    "record type {} is already open with another layout",
                    layout.type_name()
                )));
            }
            return Ok(storage.clone());
        }
        let binding = self.core.bind_storage(self.core.connector(), &layout)?;
        let storage = Arc::new(ClientStorage::new(self.core.clone(), layout, binding));
        storages.insert(storage.layout().type_name().to_string(), storage.clone());
        Ok(storage)
    }

    /// Enters a transaction nested in this thread's current one, if any.
    pub fn enter_transaction(&self) -> Result<ClientTransaction> {
        self.enter_transaction_with(IsolationLevel::ReadCommitted, None)
    }

    pub fn enter_transaction_with(
        &self,
        level: IsolationLevel,
        lock_timeout: Option<Duration>,
    ) -> Result<ClientTransaction> {
        self.enter(level, lock_timeout, false)
    }

    /// Enters a transaction that ignores this thread's current one.
    pub fn enter_top_transaction(&self, level: IsolationLevel) -> Result<ClientTransaction> {
        self.enter(level, None, true)
    }

    fn enter(
        &self,
        level: IsolationLevel,
        lock_timeout: Option<Duration>,
        top: bool,
    ) -> Result<ClientTransaction> {
        let parent = if top { None } else { self.core.current_txn() };
        let grant: TxnGrant = self.core.call(&Request::EnterTransaction {
            client: self.core.lease_id(),
            parent,
            level,
            lock_timeout_ms: lock_timeout.map(|timeout| timeout.as_millis() as u64),
            top,
        })?;
        if grant.txn.is_failed() {
            warn!(
                "event=client_txn_enter_failed parent={parent:?} session={}",
                self.core.session_id()
            );
        }
        Ok(ClientTransaction::new(self.core.clone(), grant.txn, grant.level))
    }

    pub fn sequence(&self, name: &str) -> Result<Arc<ClientSequence>> {
        self.core.check_open()?;
        let mut sequences = self.sequences.lock();
        if let Some(sequence) = sequences.get(name) {
            return Ok(sequence.clone());
        }
        let sequence = Arc::new(ClientSequence::bind(
            self.core.clone(),
            name,
            self.core.connector(),
        )?);
        sequences.insert(name.to_string(), sequence.clone());
        Ok(sequence)
    }

    /// Starts a call to the server procedure registered as `name`.
    pub fn procedure(&self, name: &str) -> Result<ProcedureCall> {
        ProcedureCall::begin(self.core.clone(), name)
    }

    /// Points every proxy at the session behind `connector` under a new
    /// lease. Transactions entered before the switch are not carried over,
    /// even when `connector` reaches the same server; using them fails with
    /// [`RepositoryError::TransactionInvalid`].
    pub fn reconnect(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.core.check_open()?;
        let info = self
            .core
            .describe(connector.as_ref(), Some(self.core.lease_id()))?;
        let storages: Vec<_> = self.storages.lock().values().cloned().collect();
        for storage in &storages {
            storage.rebind(connector.clone())?;
        }
        {
            let mut sequences = self.sequences.lock();
            let names: Vec<String> = sequences.keys().cloned().collect();
            for name in names {
                let rebound = match sequences.get(&name) {
                    Some(sequence) => sequence.rebind(connector.clone()),
                    None => continue,
                };
                if let Err(err) = rebound {
                    sequences.remove(&name);
                    return Err(err);
                }
            }
        }
        let mut session = self.core.session.write();
        info!(
            "event=client_reconnect repository={} old_session={} new_session={} old_client={} new_client={} storages={} via={}",
            info.name,
            session.info.session,
            info.session,
            session.info.client,
            info.client,
            storages.len(),
            connector.describe()
        );
        *session = Session { connector, info };
        Ok(())
    }

    /// Releases the lease, so the server exits this client's transactions,
    /// and makes later operations through this repository or its proxies
    /// fail.
    pub fn close(&self) {
        if self.core.is_closed() {
            return;
        }
        let client = self.core.lease_id();
        if let Err(err) = self.core.call::<()>(&Request::Release { client }) {
            debug!("event=client_release_failed client={client} error={err}");
        }
        if !self.core.closed.swap(true, Ordering::SeqCst) {
            info!(
                "event=client_close repository={} session={} client={client}",
                self.name(),
                self.core.session_id()
            );
        }
        if let Some(keepalive) = self.keepalive.lock().take() {
            let _ = keepalive.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Accessors for every index the server keeps on `type_name`.
    pub fn index_entry_accessors(&self, type_name: &str) -> Result<Vec<ClientIndexEntryAccessor>> {
        let indexes: Vec<IndexInfo> = self.core.call(&Request::IndexAccessors {
            type_name: type_name.to_string(),
        })?;
        Ok(indexes
            .into_iter()
            .map(|index| ClientIndexEntryAccessor::new(self.core.clone(), type_name, index))
            .collect())
    }

    pub fn resync(&self) -> ClientResync {
        ClientResync::new(self.core.clone(), self.name())
    }
}

//! In-process engine backed by ordered maps.
//!
//! Transactions are overlays: writes land in the innermost open transaction,
//! a nested commit folds them into the parent, and a top level commit applies
//! them to the tables. Reads walk the overlay chain before the tables.

use super::{
    Cursor, Direction, Filter, IndexInfo, IsolationLevel, Query, QueryController, QuerySpec,
    Repository, Sequence, Slice, Storage, Transaction,
};
use crate::error::{RepositoryError, Result};
use crate::record::{Record, RecordImage, RecordLayout};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

type RowKey = (String, String);

/// Name of the index every table keeps on its primary key.
pub const PRIMARY_INDEX: &str = "primary";

#[derive(Default)]
struct MapShared {
    tables: RwLock<HashMap<String, Arc<MapTable>>>,
    sequences: Mutex<HashMap<String, Arc<MapSequence>>>,
    next_txn: AtomicU64,
    attach_violations: AtomicUsize,
}

impl MapShared {
    fn table(&self, type_name: &str) -> Result<Arc<MapTable>> {
        self.tables.read().get(type_name).cloned().ok_or_else(|| {
            RepositoryError::Repository(format!("unknown record type {type_name}"))
        })
    }
}

struct MapTable {
    layout: Arc<RecordLayout>,
    rows: RwLock<BTreeMap<String, RecordImage>>,
    indexes: RwLock<Vec<IndexInfo>>,
    repairs: Mutex<HashMap<String, usize>>,
    resynced: AtomicU64,
}

impl MapTable {
    fn primary_index(&self) -> IndexInfo {
        IndexInfo {
            name: PRIMARY_INDEX.to_string(),
            unique: true,
            clustered: true,
            properties: self
                .layout
                .properties()
                .iter()
                .filter(|property| property.primary_key)
                .map(|property| (property.name.clone(), Direction::Ascending))
                .collect(),
        }
    }

    fn has_index(&self, name: &str) -> bool {
        name == PRIMARY_INDEX || self.indexes.read().iter().any(|index| index.name == name)
    }
}

fn check_speed(desired_speed: f64) -> Result<()> {
    if desired_speed.is_finite() && desired_speed > 0.0 {
        Ok(())
    } else {
        Err(RepositoryError::illegal_state(format!(
            "desired speed {desired_speed} must be positive"
        )))
    }
}

#[derive(Clone)]
pub struct MapRepository {
    name: String,
    shared: Arc<MapShared>,
}

impl MapRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(MapShared::default()),
        }
    }

    /// Registers a record type. Redefining with an identical layout is a no-op.
    pub fn define(&self, layout: RecordLayout) -> Result<Arc<dyn Storage>> {
        let mut tables = self.shared.tables.write();
        if let Some(existing) = tables.get(layout.type_name()) {
            if !existing.layout.equal_layouts(&layout) {
                return Err(RepositoryError::illegal_state(format!(
                    "record type {} is already defined with another layout",
                    layout.type_name()
                )));
            }
        } else {
            tables.insert(
                layout.type_name().to_string(),
                Arc::new(MapTable {
                    layout: Arc::new(layout.clone()),
                    rows: RwLock::new(BTreeMap::new()),
                    indexes: RwLock::new(Vec::new()),
                    repairs: Mutex::new(HashMap::new()),
                    resynced: AtomicU64::new(0),
                }),
            );
        }
        drop(tables);
        self.storage_for(layout.type_name())
    }

    /// Declares a secondary index over properties of a defined type.
    pub fn define_index(&self, type_name: &str, index: IndexInfo) -> Result<()> {
        let table = self.shared.table(type_name)?;
        if let Some((missing, _)) = index
            .properties
            .iter()
            .find(|(property, _)| !table.layout.has_property(property))
        {
            return Err(RepositoryError::illegal_state(format!(
                "{type_name} has no property {missing} to index"
            )));
        }
        if table.has_index(&index.name) {
            return Err(RepositoryError::illegal_state(format!(
                "{type_name} already has an index named {}",
                index.name
            )));
        }
        table.indexes.write().push(index);
        Ok(())
    }

    pub fn index_repairs(&self, type_name: &str, index: &str) -> usize {
        self.shared
            .table(type_name)
            .map(|table| table.repairs.lock().get(index).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Rows rewritten by resyncs of `type_name` so far.
    pub fn resynced_rows(&self, type_name: &str) -> u64 {
        self.shared
            .table(type_name)
            .map(|table| table.resynced.load(AtomicOrdering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of times a transaction was bound to a thread while another
    /// thread still held it.
    pub fn attach_violations(&self) -> usize {
        self.shared.attach_violations.load(AtomicOrdering::SeqCst)
    }
}

impl Repository for MapRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_for(&self, type_name: &str) -> Result<Arc<dyn Storage>> {
        let table = self.shared.table(type_name)?;
        Ok(Arc::new(MapStorage {
            table,
            shared: self.shared.clone(),
        }))
    }

    fn enter_transaction(
        &self,
        parent: Option<&dyn Transaction>,
        level: IsolationLevel,
    ) -> Result<Box<dyn Transaction>> {
        let parent = state_of(parent)?;
        let id = self.shared.next_txn.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        debug!(
            "event=map_txn_enter repository={} txn={} nested={} level={:?}",
            self.name,
            id,
            parent.is_some(),
            level
        );
        Ok(Box::new(MapTransaction {
            state: Arc::new(TxnState {
                id,
                parent,
                level,
                writes: Mutex::new(BTreeMap::new()),
                exited: AtomicBool::new(false),
                for_update: AtomicBool::new(false),
                lock_timeout: Mutex::new(None),
                bound: Mutex::new(None),
            }),
            shared: self.shared.clone(),
        }))
    }

    fn sequence(&self, name: &str) -> Result<Arc<dyn Sequence>> {
        let mut sequences = self.shared.sequences.lock();
        let sequence = sequences
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MapSequence {
                    next: AtomicI64::new(1),
                })
            })
            .clone();
        Ok(sequence)
    }

    fn indexes(&self, type_name: &str) -> Result<Vec<IndexInfo>> {
        let table = self.shared.table(type_name)?;
        let mut indexes = vec![table.primary_index()];
        indexes.extend(table.indexes.read().iter().cloned());
        Ok(indexes)
    }

    /// Map indexes are derived on every scan, so a repair only records that
    /// it was asked for.
    fn repair_index(&self, type_name: &str, index: &str, desired_speed: f64) -> Result<()> {
        check_speed(desired_speed)?;
        let table = self.shared.table(type_name)?;
        if !table.has_index(index) {
            return Err(RepositoryError::Repository(format!(
                "{type_name} has no index {index}"
            )));
        }
        *table.repairs.lock().entry(index.to_string()).or_default() += 1;
        debug!(
            "event=map_index_repair repository={} type={type_name} index={index} speed={desired_speed}",
            self.name
        );
        Ok(())
    }

    /// Rewrites matching rows through the current layout, dropping values
    /// of properties the layout no longer declares.
    fn resync(&self, type_name: &str, desired_speed: f64, filter: &Filter) -> Result<()> {
        check_speed(desired_speed)?;
        let table = self.shared.table(type_name)?;
        let mut visited = 0u64;
        for image in table.rows.write().values_mut() {
            let record = Record::from_image(table.layout.clone(), image.clone());
            if !filter.matches(&record) {
                continue;
            }
            *image = record.image();
            visited += 1;
        }
        table.resynced.fetch_add(visited, AtomicOrdering::SeqCst);
        debug!(
            "event=map_resync repository={} type={type_name} rows={visited}",
            self.name
        );
        Ok(())
    }
}

struct TxnState {
    id: u64,
    parent: Option<Arc<TxnState>>,
    level: IsolationLevel,
    writes: Mutex<BTreeMap<RowKey, Option<RecordImage>>>,
    exited: AtomicBool,
    for_update: AtomicBool,
    lock_timeout: Mutex<Option<Duration>>,
    bound: Mutex<Option<ThreadId>>,
}

impl TxnState {
    /// `Some(None)` means the row was deleted somewhere in the chain.
    fn lookup(&self, key: &RowKey) -> Option<Option<RecordImage>> {
        if let Some(found) = self.writes.lock().get(key) {
            return Some(found.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(key))
    }

    fn chain(self: &Arc<Self>) -> Vec<Arc<TxnState>> {
        let mut chain = vec![self.clone()];
        let mut cursor = self.parent.clone();
        while let Some(state) = cursor {
            cursor = state.parent.clone();
            chain.push(state);
        }
        chain.reverse();
        chain
    }
}

pub struct MapTransaction {
    state: Arc<TxnState>,
    shared: Arc<MapShared>,
}

impl MapTransaction {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn desired_lock_timeout(&self) -> Option<Duration> {
        *self.state.lock_timeout.lock()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.exited.load(AtomicOrdering::SeqCst) {
            Err(RepositoryError::illegal_state("transaction has exited"))
        } else {
            Ok(())
        }
    }
}

impl Transaction for MapTransaction {
    fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let writes = std::mem::take(&mut *self.state.writes.lock());
        match &self.state.parent {
            Some(parent) => parent.writes.lock().extend(writes),
            None => {
                for ((type_name, key), image) in writes {
                    let table = self.shared.table(&type_name)?;
                    let mut rows = table.rows.write();
                    match image {
                        Some(image) => {
                            rows.insert(key, image);
                        }
                        None => {
                            rows.remove(&key);
                        }
                    }
                }
            }
        }
        debug!("event=map_txn_commit txn={}", self.state.id);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        if !self.state.exited.swap(true, AtomicOrdering::SeqCst) {
            self.state.writes.lock().clear();
            debug!("event=map_txn_exit txn={}", self.state.id);
        }
        Ok(())
    }

    fn set_for_update(&self, for_update: bool) {
        self.state.for_update.store(for_update, AtomicOrdering::SeqCst);
    }

    fn is_for_update(&self) -> bool {
        self.state.for_update.load(AtomicOrdering::SeqCst)
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.state.level
    }

    fn set_desired_lock_timeout(&self, timeout: Duration) {
        *self.state.lock_timeout.lock() = Some(timeout);
    }

    fn attach(&self) {
        let current = thread::current().id();
        let mut bound = self.state.bound.lock();
        if matches!(*bound, Some(owner) if owner != current) {
            self.shared
                .attach_violations
                .fetch_add(1, AtomicOrdering::SeqCst);
        }
        *bound = Some(current);
    }

    fn detach(&self) {
        *self.state.bound.lock() = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn state_of(txn: Option<&dyn Transaction>) -> Result<Option<Arc<TxnState>>> {
    let Some(txn) = txn else {
        return Ok(None);
    };
    let Some(map) = txn.as_any().downcast_ref::<MapTransaction>() else {
        return Err(RepositoryError::illegal_state(
            "transaction belongs to another repository",
        ));
    };
    map.ensure_open()?;
    Ok(Some(map.state.clone()))
}

#[derive(Clone)]
struct MapStorage {
    table: Arc<MapTable>,
    shared: Arc<MapShared>,
}

impl MapStorage {
    fn type_name(&self) -> &str {
        self.table.layout.type_name()
    }

    fn key_of(&self, record: &Record) -> Result<String> {
        Ok(serde_json::to_string(&record.primary_key()?)?)
    }

    fn read(&self, state: Option<&Arc<TxnState>>, key: &str) -> Option<RecordImage> {
        if let Some(state) = state {
            if let Some(found) = state.lookup(&(self.type_name().to_string(), key.to_string())) {
                return found;
            }
        }
        self.table.rows.read().get(key).cloned()
    }

    fn write(&self, state: Option<&Arc<TxnState>>, key: String, image: Option<RecordImage>) {
        match state {
            Some(state) => {
                state
                    .writes
                    .lock()
                    .insert((self.type_name().to_string(), key), image);
            }
            None => {
                let mut rows = self.table.rows.write();
                match image {
                    Some(image) => {
                        rows.insert(key, image);
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
        }
    }

    fn visible(&self, state: Option<&Arc<TxnState>>) -> BTreeMap<String, RecordImage> {
        let mut rows = self.table.rows.read().clone();
        if let Some(state) = state {
            for level in state.chain() {
                for ((type_name, key), image) in level.writes.lock().iter() {
                    if type_name != self.type_name() {
                        continue;
                    }
                    match image {
                        Some(image) => {
                            rows.insert(key.clone(), image.clone());
                        }
                        None => {
                            rows.remove(key);
                        }
                    }
                }
            }
        }
        rows
    }
}

impl Storage for MapStorage {
    fn layout(&self) -> Arc<RecordLayout> {
        self.table.layout.clone()
    }

    fn try_load(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool> {
        let state = state_of(txn)?;
        let key = self.key_of(record)?;
        match self.read(state.as_ref(), &key) {
            Some(image) => {
                record.load_image(image);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_insert(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool> {
        let state = state_of(txn)?;
        let key = self.key_of(record)?;
        if self.read(state.as_ref(), &key).is_some() {
            return Ok(false);
        }
        self.write(state.as_ref(), key, Some(record.image()));
        record.mark_all_clean();
        Ok(true)
    }

    fn try_update(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool> {
        let state = state_of(txn)?;
        let key = self.key_of(record)?;
        let Some(mut merged) = self.read(state.as_ref(), &key) else {
            return Ok(false);
        };
        merged.values.extend(record.image().values);
        self.write(state.as_ref(), key, Some(merged.clone()));
        record.load_image(merged);
        Ok(true)
    }

    fn try_delete(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool> {
        let state = state_of(txn)?;
        let key = self.key_of(record)?;
        if self.read(state.as_ref(), &key).is_none() {
            return Ok(false);
        }
        self.write(state.as_ref(), key, None);
        Ok(true)
    }

    fn query(&self, spec: &QuerySpec) -> Result<Box<dyn Query>> {
        if let Some(unknown) = spec
            .properties()
            .find(|name| !self.table.layout.has_property(name))
        {
            return Err(RepositoryError::illegal_state(format!(
                "{} has no property {unknown}",
                self.type_name()
            )));
        }
        Ok(Box::new(MapQuery {
            storage: self.clone(),
            spec: spec.clone(),
        }))
    }

    fn truncate(&self, txn: Option<&dyn Transaction>) -> Result<()> {
        let state = state_of(txn)?;
        match state {
            Some(state) => {
                for key in self.visible(Some(&state)).into_keys() {
                    self.write(Some(&state), key, None);
                }
            }
            None => self.table.rows.write().clear(),
        }
        Ok(())
    }
}

struct MapQuery {
    storage: MapStorage,
    spec: QuerySpec,
}

impl MapQuery {
    fn matching(
        &self,
        txn: Option<&dyn Transaction>,
        controller: Option<&dyn QueryController>,
    ) -> Result<Vec<Record>> {
        let state = state_of(txn)?;
        let layout = self.storage.layout();
        let mut matches = Vec::new();
        for image in self.storage.visible(state.as_ref()).into_values() {
            if let Some(controller) = controller {
                controller.continue_check()?;
            }
            let record = Record::from_image(layout.clone(), image);
            if self.spec.filter.matches(&record) {
                matches.push(record);
            }
        }
        matches.sort_by(|a, b| self.compare(a, b));
        Ok(matches)
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for term in &self.spec.ordering {
            let ordering = match (a.get(&term.property), b.get(&term.property)) {
                (Some(left), Some(right)) => left.compare(right).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if term.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        for property in a.layout().primary_key() {
            if let (Some(left), Some(right)) = (a.get(&property.name), b.get(&property.name)) {
                let ordering = left.compare(right).unwrap_or(Ordering::Equal);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
        Ordering::Equal
    }

    fn delete(&self, txn: Option<&dyn Transaction>, record: &Record) -> Result<()> {
        let state = state_of(txn)?;
        let key = self.storage.key_of(record)?;
        self.storage.write(state.as_ref(), key, None);
        Ok(())
    }
}

impl Query for MapQuery {
    fn count(
        &self,
        txn: Option<&dyn Transaction>,
        controller: Arc<dyn QueryController>,
    ) -> Result<u64> {
        Ok(self.matching(txn, Some(controller.as_ref()))?.len() as u64)
    }

    fn fetch(
        &self,
        txn: Option<&dyn Transaction>,
        slice: Slice,
        controller: Arc<dyn QueryController>,
    ) -> Result<Box<dyn Cursor>> {
        let matches = self.matching(txn, Some(controller.as_ref()))?;
        let skipped = matches.into_iter().skip(slice.from as usize);
        let rows: VecDeque<Record> = match slice.take() {
            Some(take) => skipped.take(take as usize).collect(),
            None => skipped.collect(),
        };
        Ok(Box::new(MapCursor { rows, controller }))
    }

    fn try_load_one(&self, txn: Option<&dyn Transaction>) -> Result<Option<Record>> {
        let mut matches = self.matching(txn, None)?;
        if matches.len() > 1 {
            return Err(RepositoryError::fetch(format!(
                "query matched {} records, expected at most one",
                matches.len()
            )));
        }
        Ok(matches.pop())
    }

    fn try_delete_one(&self, txn: Option<&dyn Transaction>) -> Result<bool> {
        let matches = self.matching(txn, None)?;
        match matches.as_slice() {
            [] => Ok(false),
            [record] => {
                self.delete(txn, record)?;
                Ok(true)
            }
            _ => Err(RepositoryError::persist(format!(
                "query matched {} records, expected at most one",
                matches.len()
            ))),
        }
    }

    fn delete_all(&self, txn: Option<&dyn Transaction>) -> Result<()> {
        for record in self.matching(txn, None)? {
            self.delete(txn, &record)?;
        }
        Ok(())
    }

    fn print_plan(&self, indent: usize) -> Option<String> {
        let mut plan = format!(
            "{}scan {} where {}",
            " ".repeat(indent),
            self.storage.type_name(),
            self.spec.filter
        );
        if !self.spec.ordering.is_empty() {
            let terms: Vec<String> = self
                .spec
                .ordering
                .iter()
                .map(|term| {
                    if term.descending {
                        format!("-{}", term.property)
                    } else {
                        format!("+{}", term.property)
                    }
                })
                .collect();
            plan.push_str(&format!(" order by {}", terms.join(", ")));
        }
        Some(plan)
    }
}

struct MapCursor {
    rows: VecDeque<Record>,
    controller: Arc<dyn QueryController>,
}

impl Cursor for MapCursor {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        self.controller.continue_check()?;
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) {
        self.rows.clear();
    }
}

struct MapSequence {
    next: AtomicI64,
}

impl Sequence for MapSequence {
    fn next_long(&self) -> Result<i64> {
        Ok(self.next.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

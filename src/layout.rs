//! Reconciles record layouts that differ between client and server.
//!
//! A [`RecordWriter`] decides which properties of a record travel in each
//! request and response. When both sides agree on a layout the identity
//! writer sends everything; otherwise a projecting writer restricts images to
//! the properties the remote layout declares.

use crate::error::{RepositoryError, Result};
use crate::record::{Record, RecordImage, RecordLayout};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct RecordWriter {
    target: Option<Arc<RecordLayout>>,
}

impl RecordWriter {
    pub fn identity() -> Self {
        Self { target: None }
    }

    pub fn projecting(target: Arc<RecordLayout>) -> Self {
        Self {
            target: Some(target),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.target.is_none()
    }

    fn knows(&self, name: &str) -> bool {
        self.target
            .as_ref()
            .map(|layout| layout.has_property(name))
            .unwrap_or(true)
    }

    fn projected(&self, record: &Record) -> RecordImage {
        record.image_where(|name| self.knows(name))
    }

    pub fn for_load(&self, record: &Record) -> RecordImage {
        self.projected(record)
    }

    pub fn for_insert(&self, record: &Record) -> RecordImage {
        self.projected(record)
    }

    /// Projected updates carry the primary key and the dirty properties only.
    pub fn for_update(&self, record: &Record) -> RecordImage {
        if self.is_identity() {
            return record.image();
        }
        let layout = record.layout().clone();
        record.image_where(|name| {
            self.knows(name) && (layout.is_primary_key(name) || record.is_dirty(name))
        })
    }

    pub fn for_delete(&self, record: &Record) -> RecordImage {
        if self.is_identity() {
            return record.image();
        }
        let layout = record.layout().clone();
        record.image_where(|name| self.knows(name) && layout.is_primary_key(name))
    }

    pub fn load_response(&self, record: &Record) -> RecordImage {
        self.projected(record)
    }

    pub fn insert_response(&self, record: &Record) -> RecordImage {
        self.projected(record)
    }

    pub fn update_response(&self, record: &Record) -> RecordImage {
        self.projected(record)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    local: RecordLayout,
    remote: RecordLayout,
}

/// Cache of writers keyed by the pair of layouts they reconcile. Shared by
/// every session that should reuse the same reconstructions.
pub struct LayoutReconciler {
    identity: Arc<RecordWriter>,
    writers: Mutex<HashMap<LayoutKey, Arc<RecordWriter>>>,
}

impl Default for LayoutReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutReconciler {
    pub fn new() -> Self {
        Self {
            identity: Arc::new(RecordWriter::identity()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Writer used to send `local` records to a peer that knows `remote`.
    pub fn writer_for(
        &self,
        local: &RecordLayout,
        remote: &RecordLayout,
    ) -> Result<Arc<RecordWriter>> {
        if local.type_name() != remote.type_name() {
            return Err(RepositoryError::illegal_state(format!(
                "cannot reconcile {} with {}",
                local.type_name(),
                remote.type_name()
            )));
        }
        if local.equal_layouts(remote) {
            return Ok(self.identity.clone());
        }
        let key = LayoutKey {
            local: local.clone(),
            remote: remote.clone(),
        };
        let mut writers = self.writers.lock();
        let writer = writers
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    "event=layout_writer_built type={} local_properties={} remote_properties={}",
                    local.type_name(),
                    local.properties().len(),
                    remote.properties().len()
                );
                Arc::new(RecordWriter::projecting(Arc::new(remote.clone())))
            })
            .clone();
        Ok(writer)
    }

    pub fn cached_writers(&self) -> usize {
        self.writers.lock().len()
    }
}

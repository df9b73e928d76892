//! Index and resync capabilities of a remote repository. Index metadata,
//! repairs and resyncs run on the server; entry level access has no remote
//! form and fails without contacting it.

use super::ClientCore;
use crate::engine::{Direction, Filter, IndexInfo};
use crate::error::{RepositoryError, Result};
use crate::record::Record;
use crate::wire::Request;
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

/// One index the server keeps for a record type.
pub struct ClientIndexEntryAccessor {
    core: Arc<ClientCore>,
    type_name: String,
    index: IndexInfo,
}

impl ClientIndexEntryAccessor {
    pub(crate) fn new(core: Arc<ClientCore>, type_name: &str, index: IndexInfo) -> Self {
        Self {
            core,
            type_name: type_name.to_string(),
            index,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn is_unique(&self) -> bool {
        self.index.unique
    }

    pub fn is_clustered(&self) -> bool {
        self.index.clustered
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.index.property_names()
    }

    pub fn property_directions(&self) -> Vec<Direction> {
        self.index.property_directions()
    }

    pub fn info(&self) -> &IndexInfo {
        &self.index
    }

    /// Asks the server to rebuild the index, throttled to `desired_speed`.
    pub fn repair(&self, desired_speed: f64) -> Result<()> {
        debug!(
            "event=client_index_repair type={} index={} speed={desired_speed}",
            self.type_name, self.index.name
        );
        self.core.call(&Request::RepairIndex {
            type_name: self.type_name.clone(),
            index: self.index.name.clone(),
            desired_speed,
        })
    }

    pub fn comparator(&self) -> Result<Box<dyn Fn(&Record, &Record) -> Ordering>> {
        Err(self.unsupported("comparator"))
    }

    pub fn entry_storage(&self) -> Result<()> {
        Err(self.unsupported("entry storage"))
    }

    pub fn copy_to_master_primary_key(&self, _entry: &Record, _master: &mut Record) -> Result<()> {
        Err(self.unsupported("master primary key copy"))
    }

    pub fn is_consistent(&self, _entry: &Record, _master: &Record) -> Result<bool> {
        Err(self.unsupported("consistency check"))
    }

    fn unsupported(&self, what: &str) -> RepositoryError {
        RepositoryError::unsupported(format!(
            "{what} of {} index {} is not available remotely",
            self.type_name, self.index.name
        ))
    }
}

impl std::fmt::Debug for ClientIndexEntryAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIndexEntryAccessor")
            .field("type_name", &self.type_name)
            .field("index", &self.index)
            .finish()
    }
}

/// Replication resync of a repository.
pub struct ClientResync {
    core: Arc<ClientCore>,
    repository: String,
}

impl ClientResync {
    pub(crate) fn new(core: Arc<ClientCore>, repository: String) -> Self {
        Self { core, repository }
    }

    /// Resyncs the stored records of `type_name` selected by `filter`.
    pub fn resync(&self, type_name: &str, desired_speed: f64, filter: &Filter) -> Result<()> {
        debug!(
            "event=client_resync repository={} type={type_name} speed={desired_speed} terms={}",
            self.repository,
            filter.terms.len()
        );
        self.core.call(&Request::Resync {
            type_name: type_name.to_string(),
            desired_speed,
            filter: filter.clone(),
        })
    }

    pub fn master_repository(&self) -> Result<()> {
        Err(self.unsupported("master repository access"))
    }

    pub fn add_resync_listener(&self, _type_name: &str) -> Result<()> {
        Err(self.unsupported("resync listeners"))
    }

    fn unsupported(&self, what: &str) -> RepositoryError {
        RepositoryError::unsupported(format!(
            "{what} is not available through remote repository {}",
            self.repository
        ))
    }
}

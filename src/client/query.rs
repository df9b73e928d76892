use super::cursor::ClientCursor;
use super::storage::ClientStorage;
use crate::engine::{FilterTerm, OrderTerm, QuerySpec, RelOp, Slice};
use crate::error::{RepositoryError, Result};
use crate::record::{Record, RecordImage, Value};
use crate::wire::QueryAction;
use std::sync::Arc;
use std::time::Duration;

/// Query against a [`ClientStorage`], evaluated on the server.
#[derive(Clone)]
pub struct ClientQuery<'s> {
    storage: &'s ClientStorage,
    spec: QuerySpec,
    timeout: Option<Duration>,
}

impl<'s> ClientQuery<'s> {
    pub(crate) fn new(storage: &'s ClientStorage) -> Self {
        Self {
            storage,
            spec: QuerySpec::default(),
            timeout: None,
        }
    }

    pub fn filter(mut self, property: &str, op: RelOp, value: impl Into<Value>) -> Self {
        self.spec.filter.terms.push(FilterTerm {
            property: property.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, property: &str) -> Self {
        self.spec.ordering.push(OrderTerm {
            property: property.to_string(),
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, property: &str) -> Self {
        self.spec.ordering.push(OrderTerm {
            property: property.to_string(),
            descending: true,
        });
        self
    }

    /// Server side deadline; an expired query fails with a fetch timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn fetch(&self) -> Result<ClientCursor> {
        self.storage.fetch(&self.spec, Slice::all(), self.timeout)
    }

    /// Records at positions `from..to` of the ordered result.
    pub fn fetch_slice(&self, from: u64, to: Option<u64>) -> Result<ClientCursor> {
        if let Some(to) = to {
            if to < from {
                return Err(RepositoryError::illegal_state(format!(
                    "slice end {to} precedes start {from}"
                )));
            }
        }
        self.storage.fetch(&self.spec, Slice::new(from, to), self.timeout)
    }

    pub fn count(&self) -> Result<u64> {
        self.call(QueryAction::Count)
            .map_err(RepositoryError::into_fetch)
    }

    pub fn exists(&self) -> Result<bool> {
        let mut cursor = self.fetch_slice(0, Some(1))?;
        let found = cursor.has_next()?;
        cursor.close()?;
        Ok(found)
    }

    pub fn load_one(&self) -> Result<Record> {
        let image: RecordImage = self
            .call(QueryAction::LoadOne)
            .map_err(RepositoryError::into_fetch)?;
        Ok(self.record(image))
    }

    pub fn try_load_one(&self) -> Result<Option<Record>> {
        let image: Option<RecordImage> = self
            .call(QueryAction::TryLoadOne)
            .map_err(RepositoryError::into_fetch)?;
        Ok(image.map(|image| self.record(image)))
    }

    pub fn delete_one(&self) -> Result<()> {
        self.call(QueryAction::DeleteOne)
            .map_err(RepositoryError::into_persist)
    }

    pub fn try_delete_one(&self) -> Result<bool> {
        self.call(QueryAction::TryDeleteOne)
            .map_err(RepositoryError::into_persist)
    }

    pub fn delete_all(&self) -> Result<()> {
        self.call(QueryAction::DeleteAll)
            .map_err(RepositoryError::into_persist)
    }

    /// Engine specific rendering of the query, when the engine has one.
    pub fn print_native(&self, indent: usize) -> Result<Option<String>> {
        self.call(QueryAction::PrintNative { indent })
            .map_err(RepositoryError::into_fetch)
    }

    pub fn print_plan(&self, indent: usize) -> Result<Option<String>> {
        self.call(QueryAction::PrintPlan { indent })
            .map_err(RepositoryError::into_fetch)
    }

    fn call<T: serde::de::DeserializeOwned>(&self, action: QueryAction) -> Result<T> {
        self.storage.query_call(&self.spec, action, self.timeout)
    }

    fn record(&self, image: RecordImage) -> Record {
        Record::from_image(Arc::clone(self.storage.layout()), image)
    }
}

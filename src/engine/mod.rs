//! Storage engine collaborator interfaces.
//!
//! The server drives an engine through these traits; transactions are passed
//! explicitly rather than bound to the calling thread, which is how a
//! transaction handle can move between the worker threads that serve it.

pub mod memory;
mod query;

pub use memory::MapRepository;
pub use query::{
    Filter, FilterTerm, NoController, OrderTerm, QueryController, QuerySpec, RelOp, Slice,
    TimeoutController,
};

use crate::error::{RepositoryError, Result};
use crate::record::{Record, RecordLayout};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
    Unspecified,
}

/// Description of one index the engine maintains for a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub clustered: bool,
    pub properties: Vec<(String, Direction)>,
}

impl IndexInfo {
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn property_directions(&self) -> Vec<Direction> {
        self.properties.iter().map(|(_, direction)| *direction).collect()
    }
}

pub trait Transaction: Send + Sync {
    fn commit(&self) -> Result<()>;
    fn exit(&self) -> Result<()>;
    fn set_for_update(&self, for_update: bool);
    fn is_for_update(&self) -> bool;
    fn isolation_level(&self) -> IsolationLevel;
    fn set_desired_lock_timeout(&self, _timeout: Duration) {}
    /// Binds the transaction to the calling thread.
    fn attach(&self) {}
    fn detach(&self) {}
    fn as_any(&self) -> &dyn Any;
}

pub trait Repository: Send + Sync {
    fn name(&self) -> &str;
    fn storage_for(&self, type_name: &str) -> Result<Arc<dyn Storage>>;
    fn enter_transaction(
        &self,
        parent: Option<&dyn Transaction>,
        level: IsolationLevel,
    ) -> Result<Box<dyn Transaction>>;

    fn sequence(&self, name: &str) -> Result<Arc<dyn Sequence>> {
        Err(RepositoryError::unsupported(format!(
            "{} has no sequence {name}",
            self.name()
        )))
    }

    /// Indexes maintained for `type_name`. Engines without index access
    /// report none.
    fn indexes(&self, _type_name: &str) -> Result<Vec<IndexInfo>> {
        Ok(Vec::new())
    }

    /// Rebuilds the entries of one index. `desired_speed` is a fraction of
    /// full speed, used to throttle the work.
    fn repair_index(&self, type_name: &str, index: &str, _desired_speed: f64) -> Result<()> {
        Err(RepositoryError::unsupported(format!(
            "{} cannot repair index {index} of {type_name}",
            self.name()
        )))
    }

    /// Brings the records of `type_name` selected by `filter` back in line
    /// with their source of truth.
    fn resync(&self, type_name: &str, _desired_speed: f64, _filter: &Filter) -> Result<()> {
        Err(RepositoryError::unsupported(format!(
            "{} cannot resync {type_name}",
            self.name()
        )))
    }
}

pub trait Storage: Send + Sync {
    fn layout(&self) -> Arc<RecordLayout>;

    fn prepare(&self) -> Record {
        Record::new(self.layout())
    }

    fn try_load(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool>;
    fn try_insert(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool>;
    fn try_update(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool>;
    fn try_delete(&self, txn: Option<&dyn Transaction>, record: &mut Record) -> Result<bool>;
    fn query(&self, spec: &QuerySpec) -> Result<Box<dyn Query>>;
    fn truncate(&self, txn: Option<&dyn Transaction>) -> Result<()>;

    /// The subset of `names` this storage can filter, order and persist.
    fn supported_properties(&self, names: &[String]) -> BTreeSet<String> {
        let layout = self.layout();
        names
            .iter()
            .filter(|name| layout.has_property(name))
            .cloned()
            .collect()
    }
}

pub trait Query: Send + Sync {
    fn count(&self, txn: Option<&dyn Transaction>, controller: Arc<dyn QueryController>)
        -> Result<u64>;
    fn fetch(
        &self,
        txn: Option<&dyn Transaction>,
        slice: Slice,
        controller: Arc<dyn QueryController>,
    ) -> Result<Box<dyn Cursor>>;
    fn try_load_one(&self, txn: Option<&dyn Transaction>) -> Result<Option<Record>>;
    fn try_delete_one(&self, txn: Option<&dyn Transaction>) -> Result<bool>;
    fn delete_all(&self, txn: Option<&dyn Transaction>) -> Result<()>;

    fn load_one(&self, txn: Option<&dyn Transaction>) -> Result<Record> {
        self.try_load_one(txn)?
            .ok_or_else(|| RepositoryError::FetchNone("no record matches the query".into()))
    }

    fn delete_one(&self, txn: Option<&dyn Transaction>) -> Result<()> {
        if self.try_delete_one(txn)? {
            Ok(())
        } else {
            Err(RepositoryError::PersistNone(
                "no record matches the query".into(),
            ))
        }
    }

    fn print_native(&self, _indent: usize) -> Option<String> {
        None
    }

    fn print_plan(&self, _indent: usize) -> Option<String> {
        None
    }
}

pub trait Cursor: Send {
    fn next_record(&mut self) -> Result<Option<Record>>;
    fn close(&mut self) {}
}

pub trait Sequence: Send + Sync {
    fn next_long(&self) -> Result<i64>;

    fn next_int(&self) -> Result<i32> {
        let value = self.next_long()?;
        i32::try_from(value)
            .map_err(|_| RepositoryError::persist(format!("sequence value {value} exceeds i32")))
    }

    fn next_decimal(&self) -> Result<String> {
        Ok(self.next_long()?.to_string())
    }

    /// Next value rendered in `radix`, left padded with zeros to `min_length`.
    fn next_numerical(&self, radix: u32, min_length: usize) -> Result<String> {
        if !(2..=36).contains(&radix) {
            return Err(RepositoryError::illegal_state(format!(
                "radix {radix} out of range"
            )));
        }
        let value = self.next_long()?;
        let digits = to_radix(value, radix);
        if digits.len() >= min_length {
            Ok(digits)
        } else {
            Ok(format!("{}{}", "0".repeat(min_length - digits.len()), digits))
        }
    }

    fn return_reserved_values(&self) -> Result<bool> {
        Ok(false)
    }
}

fn to_radix(value: i64, radix: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let negative = value < 0;
    let mut remaining = value.unsigned_abs();
    let mut digits = Vec::new();
    while remaining > 0 {
        let digit = (remaining % u64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('?'));
        remaining /= u64::from(radix);
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

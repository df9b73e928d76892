use crate::error::{RepositoryError, Result};
use crate::record::{Record, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    fn symbol(self) -> &'static str {
        match self {
            RelOp::Eq => "=",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        }
    }

    fn accepts(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (RelOp::Ne, None) => true,
            (_, None) => false,
            (RelOp::Eq, Some(ord)) => ord == Ordering::Equal,
            (RelOp::Ne, Some(ord)) => ord != Ordering::Equal,
            (RelOp::Lt, Some(ord)) => ord == Ordering::Less,
            (RelOp::Le, Some(ord)) => ord != Ordering::Greater,
            (RelOp::Gt, Some(ord)) => ord == Ordering::Greater,
            (RelOp::Ge, Some(ord)) => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub property: String,
    pub op: RelOp,
    pub value: Value,
}

/// Conjunction of property comparisons; no terms selects everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub terms: Vec<FilterTerm>,
}

impl Filter {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn and(mut self, property: &str, op: RelOp, value: impl Into<Value>) -> Self {
        self.terms.push(FilterTerm {
            property: property.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn is_open(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.terms.iter().all(|term| {
            let actual = record.get(&term.property).unwrap_or(&Value::Null);
            term.op.accepts(actual.compare(&term.value))
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "open");
        }
        for (index, term) in self.terms.iter().enumerate() {
            if index > 0 {
                write!(f, " & ")?;
            }
            write!(f, "{} {} {:?}", term.property, term.op.symbol(), term.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub property: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filter: Filter,
    #[serde(default)]
    pub ordering: Vec<OrderTerm>,
}

impl QuerySpec {
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.filter
            .terms
            .iter()
            .map(|term| term.property.as_str())
            .chain(self.ordering.iter().map(|term| term.property.as_str()))
    }
}

/// Half-open range of result positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub from: u64,
    pub to: Option<u64>,
}

impl Slice {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(from: u64, to: Option<u64>) -> Self {
        Self { from, to }
    }

    pub fn take(&self) -> Option<u64> {
        self.to.map(|to| to.saturating_sub(self.from))
    }
}

/// Cooperative cancellation hook polled by long running queries.
pub trait QueryController: Send + Sync {
    fn continue_check(&self) -> Result<()>;

    fn begin(&self) {}

    fn close(&self) {}
}

pub struct NoController;

impl QueryController for NoController {
    fn continue_check(&self) -> Result<()> {
        Ok(())
    }
}

pub struct TimeoutController {
    timeout: Duration,
    deadline: Instant,
}

impl TimeoutController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }
}

impl QueryController for TimeoutController {
    fn continue_check(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            Err(RepositoryError::FetchTimeout(format!(
                "query exceeded {} ms",
                self.timeout.as_millis()
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordLayout, ValueKind};
    use std::sync::Arc;

    #[test]
    fn filter_matches_conjunction() {
        let layout = Arc::new(
            RecordLayout::builder("Item")
                .key("id", ValueKind::Int)
                .property("qty", ValueKind::Long)
                .build()
                .unwrap(),
        );
        let mut record = Record::new(layout);
        record.set("id", 3).unwrap();
        record.set("qty", 10i64).unwrap();
        let filter = Filter {
            terms: vec![
                FilterTerm {
                    property: "id".into(),
                    op: RelOp::Ge,
                    value: Value::Int(3),
                },
                FilterTerm {
                    property: "qty".into(),
                    op: RelOp::Lt,
                    value: Value::Int(11),
                },
            ],
        };
        assert!(filter.matches(&record));
        assert_eq!(filter.to_string(), "id >= Int(3) & qty < Int(11)");
        assert!(Filter::default().matches(&record));
    }

    #[test]
    fn zero_timeout_fails_immediately() {
        let controller = TimeoutController::new(Duration::ZERO);
        assert!(matches!(
            controller.continue_check(),
            Err(RepositoryError::FetchTimeout(_))
        ));
    }
}

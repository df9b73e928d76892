//! Failure taxonomy shared by both ends of a session.
//!
//! [`RepositoryError`] is what local callers see. [`RemoteFailure`] is the form
//! an error takes on the wire; it keeps the variant and the cause chain so the
//! client can rebuild the same typed error the server raised.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("transaction is invalid due to reconnect")]
    TransactionInvalid,
    #[error("fetch failed: {message}")]
    Fetch {
        message: String,
        #[source]
        cause: Option<Box<RepositoryError>>,
    },
    #[error("fetch timed out: {0}")]
    FetchTimeout(String),
    #[error("fetch interrupted: {0}")]
    FetchInterrupted(String),
    #[error("no matching record: {0}")]
    FetchNone(String),
    #[error("persist failed: {message}")]
    Persist {
        message: String,
        #[source]
        cause: Option<Box<RepositoryError>>,
    },
    #[error("nothing to persist: {0}")]
    PersistNone(String),
    #[error("unique constraint violated: {0}")]
    UniqueConstraint(String),
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("no such element")]
    NoSuchElement,
    #[error("{0}")]
    Repository(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn fetch(message: impl Into<String>) -> Self {
        RepositoryError::Fetch {
            message: message.into(),
            cause: None,
        }
    }

    pub fn persist(message: impl Into<String>) -> Self {
        RepositoryError::Persist {
            message: message.into(),
            cause: None,
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        RepositoryError::IllegalState(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        RepositoryError::Unsupported(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RepositoryError::Protocol(message.into())
    }

    /// Programming and framing errors travel unwrapped through the fetch and
    /// persist narrowing.
    pub fn is_unchecked(&self) -> bool {
        matches!(
            self,
            RepositoryError::IllegalState(_)
                | RepositoryError::Unsupported(_)
                | RepositoryError::NoSuchElement
                | RepositoryError::Protocol(_)
        )
    }

    pub fn is_fetch(&self) -> bool {
        matches!(
            self,
            RepositoryError::Fetch { .. }
                | RepositoryError::FetchTimeout(_)
                | RepositoryError::FetchInterrupted(_)
                | RepositoryError::FetchNone(_)
        )
    }

    pub fn is_persist(&self) -> bool {
        matches!(
            self,
            RepositoryError::Persist { .. }
                | RepositoryError::PersistNone(_)
                | RepositoryError::UniqueConstraint(_)
                | RepositoryError::TransactionAborted(_)
        )
    }

    /// Narrows any error to the fetch family, keeping the original as cause.
    pub fn into_fetch(self) -> Self {
        if self.is_fetch() || self.is_unchecked() {
            return self;
        }
        RepositoryError::Fetch {
            message: self.to_string(),
            cause: Some(Box::new(self)),
        }
    }

    /// Narrows any error to the persist family, keeping the original as cause.
    pub fn into_persist(self) -> Self {
        if self.is_persist() || self.is_unchecked() {
            return self;
        }
        RepositoryError::Persist {
            message: self.to_string(),
            cause: Some(Box::new(self)),
        }
    }

    /// Unwraps one level of fetch or persist wrapping.
    pub fn into_cause(self) -> Self {
        match self {
            RepositoryError::Fetch {
                cause: Some(cause), ..
            }
            | RepositoryError::Persist {
                cause: Some(cause), ..
            } => *cause,
            other => other,
        }
    }

    pub fn cause(&self) -> Option<&RepositoryError> {
        match self {
            RepositoryError::Fetch { cause, .. } | RepositoryError::Persist { cause, .. } => {
                cause.as_deref()
            }
            _ => None,
        }
    }

    /// True when this error, or anything in its cause chain, reports a
    /// transaction invalidated by a reconnect.
    pub fn is_transaction_invalid(&self) -> bool {
        match self {
            RepositoryError::TransactionInvalid => true,
            other => other
                .cause()
                .map(RepositoryError::is_transaction_invalid)
                .unwrap_or(false),
        }
    }

    pub fn is_io(&self) -> bool {
        matches!(self, RepositoryError::Io(_))
    }

    pub fn to_remote(&self) -> RemoteFailure {
        RemoteFailure::from(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    TransactionInvalid,
    Fetch,
    FetchTimeout,
    FetchInterrupted,
    FetchNone,
    Persist,
    PersistNone,
    UniqueConstraint,
    TransactionAborted,
    Protocol,
    Unsupported,
    IllegalState,
    NoSuchElement,
    Repository,
    Io,
}

/// Serialized form of a [`RepositoryError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RemoteFailure>>,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn into_error(self) -> RepositoryError {
        let cause = self.cause.map(|cause| Box::new(cause.into_error()));
        let message = self.message;
        match self.kind {
            FailureKind::TransactionInvalid => RepositoryError::TransactionInvalid,
            FailureKind::Fetch => RepositoryError::Fetch { message, cause },
            FailureKind::FetchTimeout => RepositoryError::FetchTimeout(message),
            FailureKind::FetchInterrupted => RepositoryError::FetchInterrupted(message),
            FailureKind::FetchNone => RepositoryError::FetchNone(message),
            FailureKind::Persist => RepositoryError::Persist { message, cause },
            FailureKind::PersistNone => RepositoryError::PersistNone(message),
            FailureKind::UniqueConstraint => RepositoryError::UniqueConstraint(message),
            FailureKind::TransactionAborted => RepositoryError::TransactionAborted(message),
            FailureKind::Protocol => RepositoryError::Protocol(message),
            FailureKind::Unsupported => RepositoryError::Unsupported(message),
            FailureKind::IllegalState => RepositoryError::IllegalState(message),
            FailureKind::NoSuchElement => RepositoryError::NoSuchElement,
            FailureKind::Repository => RepositoryError::Repository(message),
            FailureKind::Io => RepositoryError::Io(std::io::Error::other(message)),
        }
    }
}

impl From<&RepositoryError> for RemoteFailure {
    fn from(err: &RepositoryError) -> Self {
        let (kind, message) = match err {
            RepositoryError::TransactionInvalid => {
                (FailureKind::TransactionInvalid, err.to_string())
            }
            RepositoryError::Fetch { message, .. } => (FailureKind::Fetch, message.clone()),
            RepositoryError::FetchTimeout(message) => (FailureKind::FetchTimeout, message.clone()),
            RepositoryError::FetchInterrupted(message) => {
                (FailureKind::FetchInterrupted, message.clone())
            }
            RepositoryError::FetchNone(message) => (FailureKind::FetchNone, message.clone()),
            RepositoryError::Persist { message, .. } => (FailureKind::Persist, message.clone()),
            RepositoryError::PersistNone(message) => (FailureKind::PersistNone, message.clone()),
            RepositoryError::UniqueConstraint(message) => {
                (FailureKind::UniqueConstraint, message.clone())
            }
            RepositoryError::TransactionAborted(message) => {
                (FailureKind::TransactionAborted, message.clone())
            }
            RepositoryError::Protocol(message) => (FailureKind::Protocol, message.clone()),
            RepositoryError::Unsupported(message) => (FailureKind::Unsupported, message.clone()),
            RepositoryError::IllegalState(message) => {
                (FailureKind::IllegalState, message.clone())
            }
            RepositoryError::NoSuchElement => (FailureKind::NoSuchElement, err.to_string()),
            RepositoryError::Repository(message) => (FailureKind::Repository, message.clone()),
            RepositoryError::Io(io) => (FailureKind::Io, io.to_string()),
            RepositoryError::Serialization(json) => (FailureKind::Repository, json.to_string()),
        };
        Self {
            kind,
            message,
            cause: err.cause().map(|cause| Box::new(RemoteFailure::from(cause))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_keeps_unchecked_errors_unwrapped() {
        let err = RepositoryError::illegal_state("bad").into_persist();
        assert!(matches!(err, RepositoryError::IllegalState(_)));
        let err = RepositoryError::NoSuchElement.into_fetch();
        assert!(matches!(err, RepositoryError::NoSuchElement));
    }

    #[test]
    fn narrowing_wraps_foreign_families() {
        let err = RepositoryError::TransactionInvalid.into_persist();
        assert!(err.is_persist());
        assert!(err.is_transaction_invalid());
        let err = RepositoryError::FetchTimeout("slow".into()).into_persist();
        assert!(matches!(err, RepositoryError::Persist { .. }));
        assert!(matches!(
            err.into_cause(),
            RepositoryError::FetchTimeout(_)
        ));
    }

    #[test]
    fn remote_failure_preserves_variant_and_cause_chain() {
        let err = RepositoryError::TransactionInvalid.into_fetch();
        let json = serde_json::to_string(&err.to_remote()).unwrap();
        let back: RemoteFailure = serde_json::from_str(&json).unwrap();
        let rebuilt = back.into_error();
        assert!(rebuilt.is_fetch());
        assert!(rebuilt.is_transaction_invalid());
    }

    #[test]
    fn io_errors_cross_as_io() {
        let err = RepositoryError::from(std::io::Error::other("reset"));
        let rebuilt = err.to_remote().into_error();
        assert!(rebuilt.is_io());
    }
}

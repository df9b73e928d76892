use super::ClientCore;
use crate::error::{RepositoryError, Result};
use crate::transport::Connector;
use crate::wire::{Request, SequenceOp, SequenceReply};
use parking_lot::RwLock;
use std::sync::Arc;

/// Named sequence on the server.
pub struct ClientSequence {
    core: Arc<ClientCore>,
    name: String,
    connector: RwLock<Arc<dyn Connector>>,
}

impl ClientSequence {
    pub(crate) fn bind(core: Arc<ClientCore>, name: &str, connector: Arc<dyn Connector>) -> Result<Self> {
        core.call_on::<()>(
            connector.as_ref(),
            &Request::SequenceFor {
                name: name.to_string(),
            },
        )?;
        Ok(Self {
            core,
            name: name.to_string(),
            connector: RwLock::new(connector),
        })
    }

    pub(crate) fn rebind(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.core.call_on::<()>(
            connector.as_ref(),
            &Request::SequenceFor {
                name: self.name.clone(),
            },
        )?;
        *self.connector.write() = connector;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_int(&self) -> Result<i32> {
        match self.call(SequenceOp::NextInt)? {
            SequenceReply::Int(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn next_long(&self) -> Result<i64> {
        match self.call(SequenceOp::NextLong)? {
            SequenceReply::Long(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn next_decimal(&self) -> Result<String> {
        match self.call(SequenceOp::NextDecimal)? {
            SequenceReply::Text(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn next_numerical(&self, radix: u32, min_length: usize) -> Result<String> {
        match self.call(SequenceOp::NextNumerical { radix, min_length })? {
            SequenceReply::Text(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn return_reserved_values(&self) -> Result<bool> {
        match self.call(SequenceOp::ReturnReservedValues)? {
            SequenceReply::Flag(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    fn call(&self, op: SequenceOp) -> Result<SequenceReply> {
        let connector = self.connector.read().clone();
        self.core
            .call_on(
                connector.as_ref(),
                &Request::Sequence {
                    name: self.name.clone(),
                    op,
                },
            )
            .map_err(RepositoryError::into_persist)
    }
}

fn unexpected(reply: SequenceReply) -> RepositoryError {
    RepositoryError::protocol(format!("unexpected sequence reply {reply:?}"))
}

//! One-byte op codes framing the streams exchanged on a pipe.

use crate::error::{RepositoryError, Result};

/// Outcome of an insert or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Succeeded and the record changed; the new state follows.
    Changed,
    /// Succeeded and the record is exactly what the caller sent.
    Unchanged,
    ChangeFailed,
}

impl ResultCode {
    pub const fn as_byte(self) -> u8 {
        match self {
            ResultCode::Changed => 0,
            ResultCode::Unchanged => 1,
            ResultCode::ChangeFailed => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ResultCode::Changed),
            1 => Ok(ResultCode::Unchanged),
            2 => Ok(ResultCode::ChangeFailed),
            other => Err(unknown("result code", other)),
        }
    }
}

/// Frames of a streamed query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFrame {
    Record,
    Exception,
    End,
    /// Written once the server holds the transaction, protocol version 1 only.
    Start,
}

impl CursorFrame {
    pub const fn as_byte(self) -> u8 {
        match self {
            CursorFrame::Record => 0,
            CursorFrame::Exception => 1,
            CursorFrame::End => 2,
            CursorFrame::Start => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(CursorFrame::Record),
            1 => Ok(CursorFrame::Exception),
            2 => Ok(CursorFrame::End),
            3 => Ok(CursorFrame::Start),
            other => Err(unknown("cursor frame", other)),
        }
    }
}

/// Items of a procedure call stream, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureOp {
    Serializable,
    StorableNewType,
    StorableExistingType,
    Throwable,
    Terminator,
    Start,
}

impl ProcedureOp {
    pub const fn as_byte(self) -> u8 {
        match self {
            ProcedureOp::Serializable => 0,
            ProcedureOp::StorableNewType => 1,
            ProcedureOp::StorableExistingType => 2,
            ProcedureOp::Throwable => 3,
            ProcedureOp::Terminator => 4,
            ProcedureOp::Start => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ProcedureOp::Serializable),
            1 => Ok(ProcedureOp::StorableNewType),
            2 => Ok(ProcedureOp::StorableExistingType),
            3 => Ok(ProcedureOp::Throwable),
            4 => Ok(ProcedureOp::Terminator),
            5 => Ok(ProcedureOp::Start),
            other => Err(unknown("procedure op", other)),
        }
    }
}

fn unknown(what: &str, byte: u8) -> RepositoryError {
    RepositoryError::protocol(format!("unknown {what} {byte}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_values_are_stable() {
        assert_eq!(ResultCode::Unchanged.as_byte(), 1);
        assert_eq!(CursorFrame::End.as_byte(), 2);
        assert_eq!(ProcedureOp::Terminator.as_byte(), 4);
        assert_eq!(ProcedureOp::from_byte(5).unwrap(), ProcedureOp::Start);
    }

    #[test]
    fn unknown_bytes_are_protocol_errors() {
        assert!(matches!(
            CursorFrame::from_byte(9),
            Err(RepositoryError::Protocol(_))
        ));
        assert!(matches!(
            ProcedureOp::from_byte(200),
            Err(RepositoryError::Protocol(_))
        ));
        assert!(ResultCode::from_byte(3).is_err());
    }
}

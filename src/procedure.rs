//! Items exchanged by remote procedure calls, and the per-direction state
//! that announces each record type once per run of same-typed records.

use crate::error::{RepositoryError, Result};
use crate::layout::RecordWriter;
use crate::record::{Record, RecordImage, RecordLayout};
use crate::wire::{Pipe, ProcedureOp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureItem {
    Record(Record),
    Payload(serde_json::Value),
}

impl ProcedureItem {
    pub fn payload<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(ProcedureItem::Payload(serde_json::to_value(value)?))
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            ProcedureItem::Record(record) => Some(record),
            ProcedureItem::Payload(_) => None,
        }
    }

    pub fn into_record(self) -> Result<Record> {
        match self {
            ProcedureItem::Record(record) => Ok(record),
            ProcedureItem::Payload(_) => Err(RepositoryError::illegal_state(
                "expected a record, received a payload",
            )),
        }
    }

    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            ProcedureItem::Payload(value) => Ok(serde_json::from_value(value)?),
            ProcedureItem::Record(record) => Err(RepositoryError::illegal_state(format!(
                "expected a payload, received a {} record",
                record.type_name()
            ))),
        }
    }
}

impl From<Record> for ProcedureItem {
    fn from(record: Record) -> Self {
        ProcedureItem::Record(record)
    }
}

impl From<serde_json::Value> for ProcedureItem {
    fn from(value: serde_json::Value) -> Self {
        ProcedureItem::Payload(value)
    }
}

/// Which image of a record travels: callers send insert images, replies send
/// load responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordRole {
    Request,
    Reply,
}

#[derive(Default)]
pub(crate) struct ItemSender {
    last_type: Option<String>,
    writer: Option<Arc<RecordWriter>>,
}

impl ItemSender {
    pub(crate) fn send<F>(
        &mut self,
        pipe: &mut Pipe,
        item: &ProcedureItem,
        role: RecordRole,
        writer_for: F,
    ) -> Result<()>
    where
        F: FnOnce(&Arc<RecordLayout>) -> Result<Arc<RecordWriter>>,
    {
        match item {
            ProcedureItem::Payload(value) => {
                pipe.write_byte(ProcedureOp::Serializable.as_byte())?;
                pipe.write_object(value)
            }
            ProcedureItem::Record(record) => {
                let cached = match (&self.last_type, &self.writer) {
                    (Some(last), Some(writer)) if last == record.type_name() => {
                        Some(writer.clone())
                    }
                    _ => None,
                };
                let writer = match cached {
                    Some(writer) => {
                        pipe.write_byte(ProcedureOp::StorableExistingType.as_byte())?;
                        writer
                    }
                    None => {
                        let writer = writer_for(record.layout())?;
                        pipe.write_byte(ProcedureOp::StorableNewType.as_byte())?;
                        pipe.write_object(record.type_name())?;
                        self.last_type = Some(record.type_name().to_string());
                        self.writer = Some(writer.clone());
                        writer
                    }
                };
                let image = match role {
                    RecordRole::Request => writer.for_insert(record),
                    RecordRole::Reply => writer.load_response(record),
                };
                pipe.write_object(&image)
            }
        }
    }

    /// Forgets the announced type so the next record carries it again.
    pub(crate) fn reset(&mut self) {
        self.last_type = None;
        self.writer = None;
    }
}

#[derive(Default)]
pub(crate) struct ItemReceiver {
    current: Option<Arc<RecordLayout>>,
}

impl ItemReceiver {
    pub(crate) fn receive_record<F>(
        &mut self,
        op: ProcedureOp,
        pipe: &mut Pipe,
        layout_for: F,
    ) -> Result<Record>
    where
        F: FnOnce(&str) -> Result<Arc<RecordLayout>>,
    {
        if op == ProcedureOp::StorableNewType {
            let type_name: String = pipe.read_object()?;
            self.current = Some(layout_for(&type_name)?);
        }
        let layout = self.current.clone().ok_or_else(|| {
            RepositoryError::protocol("record received before its type was announced")
        })?;
        let image: RecordImage = pipe.read_object()?;
        Ok(Record::from_image(layout, image))
    }
}

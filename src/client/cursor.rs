use crate::error::{RemoteFailure, RepositoryError, Result};
use crate::record::{Record, RecordImage, RecordLayout};
use crate::wire::{CursorFrame, Pipe};
use std::sync::Arc;

/// Records streamed by a server fetch. Holds at most one record read ahead.
pub struct ClientCursor {
    pipe: Option<Pipe>,
    layout: Arc<RecordLayout>,
    next: Option<Record>,
}

impl ClientCursor {
    pub(crate) fn new(pipe: Pipe, layout: Arc<RecordLayout>) -> Self {
        Self {
            pipe: Some(pipe),
            layout,
            next: None,
        }
    }

    /// Blocks until the server confirms it holds the transaction.
    pub(crate) fn await_start(&mut self) -> Result<()> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(RepositoryError::illegal_state("cursor is closed"));
        };
        let frame = pipe
            .read_byte()
            .and_then(CursorFrame::from_byte)
            .map_err(RepositoryError::into_fetch);
        match frame {
            Ok(CursorFrame::Start) => Ok(()),
            Ok(CursorFrame::Exception) => Err(self.read_failure()),
            Ok(other) => {
                self.close_quietly();
                Err(RepositoryError::protocol(format!(
                    "expected start marker, received {other:?}"
                )))
            }
            Err(err) => {
                self.close_quietly();
                Err(err)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_none() && self.next.is_none()
    }

    /// Repeated calls without `next` return the same answer and read nothing.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.next.is_some() {
            return Ok(true);
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(false);
        };
        let frame = match pipe.read_byte_or_eof() {
            Ok(Some(byte)) => CursorFrame::from_byte(byte),
            Ok(None) => {
                self.close_quietly();
                return Ok(false);
            }
            Err(err) => Err(err.into_fetch()),
        };
        match frame {
            Ok(CursorFrame::Record) => match pipe.read_object::<RecordImage>() {
                Ok(image) => {
                    self.next = Some(Record::from_image(self.layout.clone(), image));
                    Ok(true)
                }
                Err(err) => {
                    self.close_quietly();
                    Err(err.into_fetch())
                }
            },
            Ok(CursorFrame::End) => {
                self.close_quietly();
                Ok(false)
            }
            Ok(CursorFrame::Exception) => Err(self.read_failure()),
            Ok(CursorFrame::Start) => {
                self.close_quietly();
                Err(RepositoryError::protocol("start marker inside a record stream"))
            }
            Err(err) => {
                self.close_quietly();
                Err(err)
            }
        }
    }

    pub fn next_record(&mut self) -> Result<Record> {
        if self.has_next()? {
            self.next.take().ok_or(RepositoryError::NoSuchElement)
        } else {
            Err(RepositoryError::NoSuchElement)
        }
    }

    /// Skips up to `amount` records and reports how many were skipped.
    pub fn skip_next(&mut self, amount: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < amount && self.has_next()? {
            self.next = None;
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Drains the remaining records.
    pub fn to_vec(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while self.has_next()? {
            records.push(self.next_record()?);
        }
        Ok(records)
    }

    pub fn close(&mut self) -> Result<()> {
        self.next = None;
        match self.pipe.take() {
            Some(mut pipe) => pipe.close().map_err(RepositoryError::into_fetch),
            None => Ok(()),
        }
    }

    fn close_quietly(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.close();
        }
    }

    fn read_failure(&mut self) -> RepositoryError {
        let failure = match self.pipe.as_mut() {
            Some(pipe) => pipe.read_object::<RemoteFailure>(),
            None => Err(RepositoryError::illegal_state("cursor is closed")),
        };
        self.close_quietly();
        match failure {
            Ok(failure) => failure.into_error().into_fetch(),
            Err(err) => err.into_fetch(),
        }
    }
}

impl Iterator for ClientCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(self.next_record()),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for ClientCursor {
    fn drop(&mut self) {
        self.close_quietly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ValueKind;
    use crate::transport::channel_pair;

    fn layout() -> Arc<RecordLayout> {
        Arc::new(
            RecordLayout::builder("Item")
                .key("id", ValueKind::Int)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn has_next_is_idempotent_and_end_closes() {
        let layout = layout();
        let (left, right) = channel_pair();
        let mut server = Pipe::new(Box::new(left));
        let record = Record::new(layout.clone()).with("id", 4).unwrap();
        server.write_byte(CursorFrame::Record.as_byte()).unwrap();
        server.write_object(&record.image()).unwrap();
        server.write_byte(CursorFrame::End.as_byte()).unwrap();
        server.flush().unwrap();

        let mut cursor = ClientCursor::new(Pipe::new(Box::new(right)), layout);
        for _ in 0..3 {
            assert!(cursor.has_next().unwrap());
        }
        assert_eq!(cursor.next_record().unwrap().get_i32("id"), Some(4));
        assert!(!cursor.has_next().unwrap());
        assert!(!cursor.has_next().unwrap());
        assert!(cursor.is_closed());
        assert!(matches!(
            cursor.next_record(),
            Err(RepositoryError::NoSuchElement)
        ));
        cursor.close().unwrap();
    }

    #[test]
    fn unknown_frame_is_a_protocol_error() {
        let (left, right) = channel_pair();
        let mut server = Pipe::new(Box::new(left));
        server.write_byte(9).unwrap();
        server.flush().unwrap();
        let mut cursor = ClientCursor::new(Pipe::new(Box::new(right)), layout());
        assert!(matches!(cursor.has_next(), Err(RepositoryError::Protocol(_))));
        assert!(!cursor.has_next().unwrap());
    }

    #[test]
    fn exception_frame_surfaces_the_remote_error() {
        let (left, right) = channel_pair();
        let mut server = Pipe::new(Box::new(left));
        server.write_byte(CursorFrame::Exception.as_byte()).unwrap();
        server
            .write_object(&RepositoryError::FetchTimeout("slow".into()).to_remote())
            .unwrap();
        server.flush().unwrap();
        let mut cursor = ClientCursor::new(Pipe::new(Box::new(right)), layout());
        assert!(matches!(
            cursor.has_next(),
            Err(RepositoryError::FetchTimeout(_))
        ));
        assert!(cursor.is_closed());
    }
}

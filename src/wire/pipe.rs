use crate::config::{MAX_OBJECT_LEN, PIPE_WRITE_BUFFER};
use crate::error::{RemoteFailure, RepositoryError, Result};
use crate::transport::Channel;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io::{self, BufReader, Read, Write};

/// Typed, buffered view of one duplex channel.
///
/// Writes accumulate until [`Pipe::flush`]; pending output is pushed before
/// any blocking read so the peer never waits on bytes sitting in our buffer.
pub struct Pipe {
    inner: BufReader<Box<dyn Channel>>,
    pending: Vec<u8>,
    closed: bool,
}

impl Pipe {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            inner: BufReader::new(channel),
            pending: Vec::with_capacity(PIPE_WRITE_BUFFER),
            closed: false,
        }
    }

    pub fn peer(&self) -> String {
        self.inner.get_ref().peer()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::new(io::ErrorKind::NotConnected, "pipe is closed"))
        } else {
            Ok(())
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= PIPE_WRITE_BUFFER {
            self.push()?;
        }
        Ok(())
    }

    fn push(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let channel = self.inner.get_mut();
            channel.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.push()?;
        self.inner.get_mut().flush()?;
        Ok(())
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.pending.is_empty() {
            self.flush()?;
        }
        self.inner.read_exact(buf)?;
        Ok(())
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.put(&[byte])
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.take(&mut buf)?;
        Ok(buf[0])
    }

    /// Like [`Pipe::read_byte`] but a cleanly closed peer yields `None`.
    pub fn read_byte_or_eof(&mut self) -> Result<Option<u8>> {
        self.ensure_open()?;
        if !self.pending.is_empty() {
            self.flush()?;
        }
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_byte(u8::from(value))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RepositoryError::protocol(format!(
                "expected boolean, got {other}"
            ))),
        }
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_be_bytes())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.take(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.put(&value.to_be_bytes())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.take(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| *len <= MAX_OBJECT_LEN)
            .ok_or_else(|| {
                RepositoryError::protocol(format!("object of {} bytes is too large", bytes.len()))
            })?;
        self.write_u32(len)?;
        self.put(bytes)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_OBJECT_LEN {
            return Err(RepositoryError::protocol(format!(
                "object length {len} exceeds limit"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.take(&mut buf)?;
        Ok(buf)
    }

    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes)
    }

    pub fn read_object<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes either the null marker or a failure.
    pub fn write_throwable(&mut self, failure: Option<&RemoteFailure>) -> Result<()> {
        match failure {
            None => self.write_bool(false),
            Some(failure) => {
                self.write_bool(true)?;
                self.write_object(failure)
            }
        }
    }

    pub fn read_throwable(&mut self) -> Result<Option<RemoteFailure>> {
        if self.read_bool()? {
            Ok(Some(self.read_object()?))
        } else {
            Ok(None)
        }
    }

    /// Flushes what is pending and shuts the channel down. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.push().and_then(|_| self.inner.get_mut().flush());
        self.closed = true;
        self.pending.clear();
        let shutdown = self.inner.get_mut().shutdown();
        flushed?;
        shutdown?;
        Ok(())
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("peer", &self.peer())
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

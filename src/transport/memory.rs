//! In-process transport: paired byte queues and a connector that serves each
//! channel on its own worker thread.

use super::{Channel, Connector};
use crate::error::Result;
use crate::server::RemoteRepositoryServer;
use crate::wire::Pipe;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct QueueState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One direction of a channel. A bounded queue blocks writers while full,
/// the way a socket send buffer does.
#[derive(Default)]
struct ByteQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    space: Condvar,
    capacity: Option<usize>,
}

impl ByteQueue {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.map(|capacity| capacity.max(1)),
            ..Self::default()
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
        self.space.notify_all();
    }
}

pub struct MemoryChannel {
    incoming: Arc<ByteQueue>,
    outgoing: Arc<ByteQueue>,
    label: String,
}

/// Two connected channel ends.
pub fn channel_pair() -> (MemoryChannel, MemoryChannel) {
    paired(None)
}

/// Two connected channel ends, each direction holding at most `capacity`
/// unread bytes.
pub fn bounded_channel_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    paired(Some(capacity))
}

fn paired(capacity: Option<usize>) -> (MemoryChannel, MemoryChannel) {
    let forward = Arc::new(ByteQueue::new(capacity));
    let backward = Arc::new(ByteQueue::new(capacity));
    (
        MemoryChannel {
            incoming: backward.clone(),
            outgoing: forward.clone(),
            label: "memory:client".to_string(),
        },
        MemoryChannel {
            incoming: forward,
            outgoing: backward,
            label: "memory:server".to_string(),
        },
    )
}

impl Read for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.incoming.state.lock();
        while state.bytes.is_empty() && !state.closed {
            self.incoming.ready.wait(&mut state);
        }
        let count = buf.len().min(state.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(state.bytes.drain(..count)) {
            *slot = byte;
        }
        drop(state);
        if count > 0 {
            self.incoming.space.notify_all();
        }
        Ok(count)
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let queue = &self.outgoing;
        let mut state = queue.state.lock();
        let room = loop {
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "memory channel closed",
                ));
            }
            let room = match queue.capacity {
                Some(capacity) => capacity.saturating_sub(state.bytes.len()),
                None => buf.len(),
            };
            if room > 0 {
                break room;
            }
            queue.space.wait(&mut state);
        };
        let count = room.min(buf.len());
        state.bytes.extend(&buf[..count]);
        drop(state);
        queue.ready.notify_all();
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for MemoryChannel {
    fn shutdown(&mut self) -> io::Result<()> {
        self.outgoing.close();
        self.incoming.close();
        Ok(())
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Connects a client to a session living in the same process.
pub struct MemoryTransport {
    server: Arc<RemoteRepositoryServer>,
    closed: AtomicBool,
    calls: AtomicU64,
    capacity: Option<usize>,
}

impl MemoryTransport {
    pub fn new(server: Arc<RemoteRepositoryServer>) -> Arc<Self> {
        Self::build(server, None)
    }

    /// Channels buffer at most `capacity` bytes per direction, so a server
    /// streaming to a slow reader blocks mid-reply.
    pub fn with_capacity(server: Arc<RemoteRepositoryServer>, capacity: usize) -> Arc<Self> {
        Self::build(server, Some(capacity))
    }

    fn build(server: Arc<RemoteRepositoryServer>, capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            server,
            closed: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            capacity,
        })
    }

    pub fn server(&self) -> &Arc<RemoteRepositoryServer> {
        &self.server
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Tears the session down. Later opens fail with a not connected error.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                "event=memory_transport_close session={}",
                self.server.session_id()
            );
            self.server.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryTransport {
    fn open(&self) -> Result<Pipe> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory transport is closed",
            )
            .into());
        }
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let (client, server_end) = paired(self.capacity);
        let server = self.server.clone();
        thread::Builder::new()
            .name(format!("remora-call-{call}"))
            .spawn(move || server.serve(Pipe::new(Box::new(server_end))))?;
        debug!(
            "event=memory_transport_open session={} call={call}",
            self.server.session_id()
        );
        Ok(Pipe::new(Box::new(client)))
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.server.session_id())
    }
}

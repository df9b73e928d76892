use crate::config::SERVER_SHUTDOWN_GRACE;
use crate::net::{NetError, ProtocolError};
use log::{debug, error, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

struct AcceptLoopState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl AcceptLoopState {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark_stopped(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
        }
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration, name: &'static str) -> Result<(), NetError> {
        let guard = lock_or_poison(&self.done, "accept loop state")?;
        let (guard, _status) = self
            .condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .map_err(|_| {
                NetError::from(ProtocolError::Poisoned {
                    context: "accept loop state",
                })
            })?;
        if *guard {
            Ok(())
        } else {
            Err(NetError::from(ProtocolError::ShutdownTimeout { context: name }))
        }
    }
}

/// Join handles of the per-connection workers. Finished workers are pruned
/// as new ones arrive.
#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) -> Result<(), NetError> {
        let mut handles = lock_or_poison(&self.handles, "connection tracker handles")?;
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
        Ok(())
    }

    fn join_all(&self) -> Result<(), NetError> {
        let handles: Vec<_> = lock_or_poison(&self.handles, "connection tracker handles")?
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

struct ConnectionLimiter {
    active: AtomicUsize,
    limit: usize,
}

impl ConnectionLimiter {
    fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit,
        }
    }

    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |active| {
                (active < self.limit).then_some(active + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::Release);
    }
}

struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
}

impl ConnectionPermit {
    fn new(limiter: &Arc<ConnectionLimiter>) -> Option<Self> {
        limiter.try_acquire().then(|| Self {
            limiter: limiter.clone(),
        })
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

pub(crate) struct ServerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    state: Arc<AcceptLoopState>,
}

impl ServerHandle {
    /// Stops accepting, then waits for in-flight connections to finish.
    pub(crate) fn try_shutdown(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            self.state.wait_for_stop(timeout, self.name)?;
            if handle.join().is_err() {
                warn!("event=server_accept_loop_panic name={}", self.name);
            }
        }
        self.connections.join_all()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.try_shutdown(SERVER_SHUTDOWN_GRACE);
    }
}

/// Runs `handler` on its own thread for every accepted connection, at most
/// `max_connections` at a time. Connections over the limit are dropped.
pub(crate) fn spawn_listener<F>(
    name: &'static str,
    listener: TcpListener,
    max_connections: usize,
    handler: F,
) -> io::Result<ServerHandle>
where
    F: Fn(TcpStream, SocketAddr, Arc<AtomicBool>) -> Result<(), NetError> + Send + Sync + 'static,
{
    listener.set_nonblocking(true)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let connections = Arc::new(ConnectionTracker::default());
    let state = Arc::new(AcceptLoopState::new());
    let handler = Arc::new(handler);
    let limiter = Arc::new(ConnectionLimiter::new(max_connections.max(1)));

    let shutdown_flag = shutdown.clone();
    let tracker = connections.clone();
    let accept_state = state.clone();
    let join = thread::Builder::new()
        .name(format!("{name}-accept"))
        .spawn(move || {
            let mut accepted: u64 = 0;
            while !shutdown_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let Some(permit) = ConnectionPermit::new(&limiter) else {
                            warn!(
                                "event={name}_connection_rejected addr={addr} reason=too_many_connections limit={}",
                                limiter.limit
                            );
                            continue;
                        };
                        accepted += 1;
                        let handler = handler.clone();
                        let shutdown_token = shutdown_flag.clone();
                        let spawned = thread::Builder::new()
                            .name(format!("{name}-conn-{accepted}"))
                            .spawn(move || {
                                let _permit = permit;
                                if let Err(err) = handler(stream, addr, shutdown_token) {
                                    warn!("event={name}_connection_error addr={addr} error={err}");
                                }
                            });
                        match spawned {
                            Ok(connection) => {
                                if let Err(err) = tracker.track(connection) {
                                    warn!("event={name}_connection_tracking_failed error={err}");
                                }
                            }
                            Err(err) => {
                                warn!("event={name}_connection_spawn_failed addr={addr} error={err}")
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                    Err(err) => {
                        error!("event={name}_accept_error error={err}");
                        break;
                    }
                }
            }
            debug!("event={name}_accept_loop_stopped accepted={accepted}");
            accept_state.mark_stopped();
        })?;
    Ok(ServerHandle {
        name,
        shutdown,
        join: Some(join),
        connections,
        state,
    })
}

pub(crate) fn lock_or_poison<'a, T>(
    mutex: &'a Mutex<T>,
    context: &'static str,
) -> Result<MutexGuard<'a, T>, NetError> {
    mutex
        .lock()
        .map_err(|_| NetError::from(ProtocolError::Poisoned { context }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_caps_concurrent_permits() {
        let limiter = Arc::new(ConnectionLimiter::new(2));
        let first = ConnectionPermit::new(&limiter).unwrap();
        let _second = ConnectionPermit::new(&limiter).unwrap();
        assert!(ConnectionPermit::new(&limiter).is_none());
        drop(first);
        assert!(ConnectionPermit::new(&limiter).is_some());
    }
}

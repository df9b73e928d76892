use super::server::{self, ServerHandle};
use super::NetError;
use crate::config::{TcpServerConfig, SERVER_SHUTDOWN_GRACE};
use crate::server::RemoteRepositoryServer;
use crate::transport::TcpChannel;
use crate::wire::Pipe;
use log::{debug, info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REAPER_TICK: Duration = Duration::from_millis(10);
const REAPER_MAX_PERIOD: Duration = Duration::from_secs(1);

pub struct RepositoryNetworkServerHandle {
    inner: ServerHandle,
    reaper_stop: Arc<AtomicBool>,
    reaper: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
    session: Arc<RemoteRepositoryServer>,
}

impl RepositoryNetworkServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Arc<RemoteRepositoryServer> {
        &self.session
    }

    pub fn shutdown(&mut self) {
        if let Err(err) = self.try_shutdown(SERVER_SHUTDOWN_GRACE) {
            warn!("event=repository_server_shutdown_error error={err}");
        }
    }

    /// Closes the session, so running queries stop at their next check, and
    /// waits for the listener and its connections.
    pub fn try_shutdown(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.session.close();
        self.reaper_stop.store(true, Ordering::SeqCst);
        if let Some(reaper) = self.reaper.take() {
            if reaper.join().is_err() {
                warn!("event=repository_server_reaper_panic");
            }
        }
        self.inner.try_shutdown(timeout)
    }
}

impl Drop for RepositoryNetworkServerHandle {
    fn drop(&mut self) {
        let _ = self.try_shutdown(SERVER_SHUTDOWN_GRACE);
    }
}

pub struct RepositoryNetworkServer;

impl RepositoryNetworkServer {
    pub fn spawn(
        config: TcpServerConfig,
        session: Arc<RemoteRepositoryServer>,
    ) -> Result<RepositoryNetworkServerHandle, NetError> {
        let listener = TcpListener::bind(config.bind)?;
        let local_addr = listener.local_addr()?;
        info!(
            "event=repository_server_listen addr={local_addr} repository={} session={} max_connections={}",
            session.name(),
            session.session_id(),
            config.max_connections
        );
        let stream_timeout = config.stream_timeout;
        let serving = session.clone();
        let handler = move |stream: TcpStream,
                            addr: SocketAddr,
                            _shutdown: Arc<AtomicBool>|
              -> Result<(), NetError> {
            if let Err(err) = configure_server_stream(&stream, stream_timeout) {
                warn!(
                    "event=repository_server_stream_config_error addr={local_addr} peer={addr} error={err}"
                );
                return Ok(());
            }
            debug!("event=repository_server_accept addr={local_addr} peer={addr}");
            serving.serve(Pipe::new(Box::new(TcpChannel::new(stream))));
            Ok(())
        };
        let inner = server::spawn_listener(
            "repository_server",
            listener,
            config.max_connections,
            handler,
        )?;
        let reaper_stop = Arc::new(AtomicBool::new(false));
        let reaper = spawn_reaper(session.clone(), reaper_stop.clone())?;
        Ok(RepositoryNetworkServerHandle {
            inner,
            reaper_stop,
            reaper: Some(reaper),
            local_addr,
            session,
        })
    }
}

/// Sweeps idle client leases even while no calls arrive.
fn spawn_reaper(
    session: Arc<RemoteRepositoryServer>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let period = (session.client_idle_timeout() / 4).clamp(REAPER_TICK, REAPER_MAX_PERIOD);
    thread::Builder::new()
        .name("repository_server-reaper".into())
        .spawn(move || {
            let mut next_sweep = Instant::now() + period;
            let mut retired = 0usize;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(REAPER_TICK);
                if Instant::now() >= next_sweep {
                    retired += session.expire_idle_clients();
                    next_sweep = Instant::now() + period;
                }
            }
            debug!("event=repository_server_reaper_stopped retired={retired}");
        })
}

fn configure_server_stream(stream: &TcpStream, timeout: Duration) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)
}

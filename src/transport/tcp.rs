#![cfg(feature = "net")]

use super::{Channel, Connector};
use crate::config::TcpConnectorOptions;
use crate::error::{RepositoryError, Result};
use crate::wire::Pipe;
use log::{debug, info};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;

pub struct TcpChannel {
    stream: TcpStream,
    peer: String,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self { stream, peer }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Channel for TcpChannel {
    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Opens one TCP connection per call, retrying connection failures.
pub struct TcpConnector {
    host: String,
    port: u16,
    options: TcpConnectorOptions,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_options(host, port, TcpConnectorOptions::default())
    }

    pub fn with_options(host: impl Into<String>, port: u16, options: TcpConnectorOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
        }
    }

    pub fn to_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    fn connect(&self) -> Result<TcpStream> {
        let target = format!("{}:{}", self.host, self.port);
        let mut last_err = None;
        for addr in target.to_socket_addrs()? {
            debug!("event=tcp_connector_attempt peer={addr}");
            match TcpStream::connect_timeout(&addr, self.options.socket_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.options.socket_timeout))?;
                    stream.set_write_timeout(Some(self.options.socket_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("event=tcp_connector_error peer={addr} error={err}");
                    last_err = Some(err);
                }
            }
        }
        Err(RepositoryError::Io(last_err.unwrap_or_else(|| {
            io::Error::other(format!("unable to resolve {target}"))
        })))
    }
}

impl Connector for TcpConnector {
    fn open(&self) -> Result<Pipe> {
        let mut retry = self.options.retry_policy.handle();
        loop {
            match self.connect() {
                Ok(stream) => {
                    if retry.attempts() > 0 {
                        info!(
                            "event=tcp_connector_connected peer={}:{} attempts={}",
                            self.host,
                            self.port,
                            retry.attempts() + 1
                        );
                    }
                    return Ok(Pipe::new(Box::new(TcpChannel::new(stream))));
                }
                Err(err) => match retry.next_delay() {
                    Some(delay) => {
                        if !delay.is_zero() {
                            thread::sleep(delay);
                        }
                    }
                    None => return Err(err),
                },
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp:{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn refused_connection_exhausts_retries() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let connector = TcpConnector::with_options(
            "127.0.0.1",
            addr.port(),
            TcpConnectorOptions::new().retry_backoff(2, Duration::from_millis(1)),
        );
        assert!(connector.open().unwrap_err().is_io());
        assert_eq!(connector.describe(), format!("tcp:127.0.0.1:{}", addr.port()));
    }
}

//! TCP/TLS connection backend.
//!
//! [`TcpConnectionFactory`] opens plain or `rustls`-wrapped TCP connections
//! and hands them to the pool as [`TcpBackend`]s. The backend performs **no
//! protocol parsing**: callers speak the database wire protocol themselves
//! through `send`/`recv`, so there is no session state to reset on return.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use super::{ConnectionBackend, ConnectionFactory};
use crate::config::{ConnectTarget, TransportConfig};

// ── Transport ────────────────────────────────────────────────────────

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

// ── TcpBackend ───────────────────────────────────────────────────────

/// A [`ConnectionBackend`] over TCP, optionally TLS-encrypted.
pub struct TcpBackend {
    transport: Transport,
    closed: bool,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tls = matches!(self.transport, Transport::Tls(_));
        f.debug_struct("TcpBackend")
            .field("tls", &tls)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpBackend {
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            closed: false,
        }
    }

    pub fn tls(stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>) -> Self {
        Self {
            transport: Transport::Tls(Box::new(stream)),
            closed: false,
        }
    }

    fn tcp_stream(&self) -> &TcpStream {
        match &self.transport {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }

    fn ensure_open(&self) -> Result<(), String> {
        if self.closed {
            return Err("connection closed".to_string());
        }
        Ok(())
    }
}

impl ConnectionBackend for TcpBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        self.ensure_open()?;
        match &mut self.transport {
            Transport::Plain(stream) => stream
                .write_all(data)
                .map_err(|e| format!("tcp send: {e}"))?,
            Transport::Tls(stream) => stream
                .write_all(data)
                .map_err(|e| format!("tls send: {e}"))?,
        }
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        self.ensure_open()?;
        let mut buf = vec![0u8; max_bytes];
        let n = match &mut self.transport {
            Transport::Plain(stream) => stream
                .read(&mut buf)
                .map_err(|e| format!("tcp recv: {e}"))?,
            Transport::Tls(stream) => stream
                .read(&mut buf)
                .map_err(|e| format!("tls recv: {e}"))?,
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn ping(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let stream = self.tcp_stream();

        // Non-blocking peek so an idle, healthy socket answers at once.
        if stream.set_nonblocking(true).is_err() {
            return false;
        }

        let mut peek_buf = [0u8; 1];
        let alive = match stream.peek(&mut peek_buf) {
            Ok(0) => false, // EOF: peer closed the connection
            Ok(_) => true,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        };

        let _ = stream.set_nonblocking(false);
        alive
    }

    fn close(&mut self) -> Result<(), String> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Transport::Tls(stream) = &mut self.transport {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        match self.tcp_stream().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already went away.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(format!("tcp shutdown: {e}")),
        }
    }
}

// ── TlsConfig ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// TLS config trusting the Mozilla root certificate store.
    pub fn with_system_roots() -> Result<Self, String> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls protocol version error: {e}"))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsConfig {
    fn from(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Opens TCP (optionally TLS) connections to the pool's target.
pub struct TcpConnectionFactory {
    recv_timeout: Duration,
    connect_timeout: Duration,
    tls_config: Option<TlsConfig>,
}

impl TcpConnectionFactory {
    pub fn plain(recv_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            recv_timeout,
            connect_timeout,
            tls_config: None,
        }
    }

    pub fn with_tls(
        recv_timeout: Duration,
        connect_timeout: Duration,
        tls_config: TlsConfig,
    ) -> Self {
        Self {
            recv_timeout,
            connect_timeout,
            tls_config: Some(tls_config),
        }
    }

    /// Build a factory from file-level transport settings.
    pub fn from_transport(transport: &TransportConfig) -> Result<Self, String> {
        if transport.tls {
            Ok(Self::with_tls(
                transport.recv_timeout,
                transport.connect_timeout,
                TlsConfig::with_system_roots()?,
            ))
        } else {
            Ok(Self::plain(transport.recv_timeout, transport.connect_timeout))
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn ConnectionBackend>, String> {
        let addr_str = target.address();
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|e| format!("dns resolution failed for {addr_str}: {e}"))?
            .next()
            .ok_or_else(|| format!("no address found for {addr_str}"))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| format!("tcp connect to {addr_str}: {e}"))?;
        stream
            .set_read_timeout(Some(self.recv_timeout))
            .map_err(|e| format!("set recv timeout: {e}"))?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            host = %target.host,
            port = target.port,
            tls = self.tls_config.is_some(),
            "established tcp connection"
        );

        let Some(tls) = &self.tls_config else {
            return Ok(Box::new(TcpBackend::plain(stream)));
        };

        let server_name = rustls::pki_types::ServerName::try_from(target.host.as_str())
            .map_err(|e| format!("invalid tls server name '{}': {e}", target.host))?
            .to_owned();
        let tls_conn = rustls::ClientConnection::new(Arc::clone(&tls.client_config), server_name)
            .map_err(|e| format!("tls session creation: {e}"))?;
        Ok(Box::new(TcpBackend::tls(rustls::StreamOwned::new(tls_conn, stream))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// TCP echo server on a random port, served from a background thread.
    fn start_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn target_for(addr: std::net::SocketAddr) -> ConnectTarget {
        ConnectTarget::new(&addr.ip().to_string(), addr.port(), "db", "app")
    }

    fn factory() -> TcpConnectionFactory {
        TcpConnectionFactory::plain(Duration::from_secs(2), Duration::from_secs(2))
    }

    #[test]
    fn send_and_recv_roundtrip() {
        let addr = start_echo_server();
        let mut backend = factory().connect(&target_for(addr)).unwrap();

        assert_eq!(backend.send(b"hello pool").unwrap(), 10);
        assert_eq!(backend.recv(1024).unwrap(), b"hello pool");
    }

    #[test]
    fn ping_alive_connection() {
        let addr = start_echo_server();
        let mut backend = factory().connect(&target_for(addr)).unwrap();
        assert!(backend.ping());
    }

    #[test]
    fn ping_detects_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut backend = factory().connect(&target_for(addr)).unwrap();

        let (peer, _) = listener.accept().unwrap();
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));

        assert!(!backend.ping());
    }

    #[test]
    fn closed_backend_rejects_io() {
        let addr = start_echo_server();
        let mut backend = factory().connect(&target_for(addr)).unwrap();

        backend.close().unwrap();
        backend.close().unwrap();
        assert!(!backend.ping());
        assert!(backend.send(b"x").is_err());
        assert!(backend.recv(8).is_err());
    }

    #[test]
    fn reset_is_noop_for_passthrough() {
        let addr = start_echo_server();
        let mut backend = factory().connect(&target_for(addr)).unwrap();
        assert!(backend.reset().is_ok());
    }

    #[test]
    fn connect_refused_is_error() {
        // Bind then drop to find a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = factory().connect(&target_for(addr)).unwrap_err();
        assert!(err.contains("tcp connect"), "unexpected error: {err}");
    }

    #[test]
    fn unresolvable_host_is_error() {
        let target = ConnectTarget::new("nonexistent.invalid", 5432, "db", "app");
        assert!(factory().connect(&target).is_err());
    }

    #[test]
    fn from_transport_respects_tls_flag() {
        let plain = TcpConnectionFactory::from_transport(&TransportConfig::default()).unwrap();
        assert!(plain.tls_config.is_none());

        let tls = TcpConnectionFactory::from_transport(&TransportConfig {
            tls: true,
            ..TransportConfig::default()
        })
        .unwrap();
        assert!(tls.tls_config.is_some());
    }
}

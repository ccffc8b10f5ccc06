//! Non-blocking TLS session over a connected socket
//!
//! Every operation either makes progress or reports which readiness
//! direction it is waiting for. Waiting is never an error: the caller
//! re-registers interest and steps again.

use super::verify::{verify_hostname, CertNames};
use super::{HandshakeStatus, SessionState, TlsContext, TlsSide, TlsVersion};
use crate::error::{EngineError, Result, TlsErrorKind};
use crate::net::{IoOutcome, Want};
use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use std::io::{self, Read, Write};

/// TLS session bound to one socket
pub struct TlsSession<S = TcpStream> {
    conn: rustls::Connection,
    socket: S,
    side: TlsSide,
    verify_peer: bool,
    hostname: String,
    state: SessionState,
    version: TlsVersion,
    last_error: String,
}

impl<S: Read + Write> TlsSession<S> {
    /// Bind a client session to `socket`. `hostname` is sent as SNI and
    /// checked against the peer certificate.
    pub fn client(ctx: &TlsContext, socket: S, hostname: &str) -> Result<Self> {
        let config = ctx.client_config().ok_or_else(|| {
            EngineError::tls(TlsErrorKind::Config, "context has no client configuration")
        })?;
        let sni = hostname.strip_suffix('.').unwrap_or(hostname);
        let sni = sni
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(sni);
        let server_name = ServerName::try_from(sni.to_string()).map_err(|_| {
            EngineError::tls(TlsErrorKind::Config, format!("invalid server name: {}", hostname))
        })?;
        let conn = rustls::ClientConnection::new(config, server_name)?;
        Ok(Self::bind(
            rustls::Connection::Client(conn),
            socket,
            TlsSide::Client,
            ctx.verify_peer(),
            hostname,
        ))
    }

    /// Bind a server session to an accepted `socket`
    pub fn server(ctx: &TlsContext, socket: S) -> Result<Self> {
        let config = ctx.server_config().ok_or_else(|| {
            EngineError::tls(TlsErrorKind::Config, "context has no server configuration")
        })?;
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self::bind(
            rustls::Connection::Server(conn),
            socket,
            TlsSide::Server,
            false,
            "",
        ))
    }

    fn bind(conn: rustls::Connection, socket: S, side: TlsSide, verify_peer: bool, hostname: &str) -> Self {
        Self {
            conn,
            socket,
            side,
            verify_peer,
            hostname: hostname.to_string(),
            state: SessionState::Initialized,
            version: TlsVersion::Unknown,
            last_error: String::new(),
        }
    }

    /// Drive the handshake as far as the socket allows
    pub fn handshake(&mut self) -> Result<HandshakeStatus> {
        match self.state {
            SessionState::Established => return Ok(HandshakeStatus::Complete(self.version)),
            SessionState::Failed | SessionState::Closed => {
                return Err(EngineError::tls(TlsErrorKind::Handshake, "session is not usable"))
            }
            _ => {}
        }
        self.state = SessionState::Handshaking;

        loop {
            if let Some(want) = self.flush_tls()? {
                return Ok(HandshakeStatus::WouldBlock(want));
            }
            if !self.conn.is_handshaking() {
                break;
            }
            if !self.conn.wants_read() {
                return Ok(HandshakeStatus::WouldBlock(Want::Read));
            }
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => {
                    return Err(self.fail(TlsErrorKind::Handshake, "EOF was received during handshake"))
                }
                Ok(_) => self.process_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WouldBlock(Want::Read))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail_io(e)),
            }
        }

        self.version = TlsVersion::from_rustls(self.conn.protocol_version());
        if self.side == TlsSide::Client && self.verify_peer {
            self.check_peer_names()?;
        }
        self.state = SessionState::Established;
        tracing::debug!("TLS handshake complete with {} ({})", self.hostname, self.version);
        Ok(HandshakeStatus::Complete(self.version))
    }

    /// Read decrypted data. `Bytes(0)` means the peer closed the session
    /// cleanly; a transport close without close_notify is an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome> {
        if buf.is_empty() {
            return Ok(IoOutcome::Bytes(0));
        }
        let mut transport_eof = false;
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => {
                    self.state = SessionState::Closed;
                    return Ok(IoOutcome::Bytes(0));
                }
                Ok(n) => return Ok(IoOutcome::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.fail_io(e)),
            }
            if transport_eof {
                return Err(self.fail(TlsErrorKind::Io, "connection closed without close_notify"));
            }
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => {
                    transport_eof = true;
                    self.process_packets()?;
                }
                Ok(_) => self.process_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoOutcome::WouldBlock(Want::Read))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail_io(e)),
            }
        }
    }

    /// Queue `buf` for encryption and flush as much as possible
    pub fn write(&mut self, buf: &[u8]) -> Result<IoOutcome> {
        if self.flush_tls()?.is_some() && buf.is_empty() {
            return Ok(IoOutcome::WouldBlock(Want::Write));
        }
        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Err(self.fail_io(e)),
        };
        self.flush_tls()?;
        if n == 0 && !buf.is_empty() {
            return Ok(IoOutcome::WouldBlock(Want::Write));
        }
        Ok(IoOutcome::Bytes(n))
    }

    /// Send close_notify; pending output is flushed best-effort
    pub fn close(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Failed | SessionState::Closed) {
            return Ok(());
        }
        self.conn.send_close_notify();
        self.state = SessionState::Closed;
        self.flush_tls().map(|_| ())
    }

    /// Encrypted output is waiting for the socket to become writable
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn side(&self) -> TlsSide {
        self.side
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn last_error_string(&self) -> &str {
        &self.last_error
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn into_socket(self) -> S {
        self.socket
    }

    /// Write pending TLS records. Returns the direction to wait for when
    /// the socket cannot take more.
    fn flush_tls(&mut self) -> Result<Option<Want>> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Some(Want::Write)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail_io(e)),
            }
        }
        Ok(None)
    }

    fn process_packets(&mut self) -> Result<()> {
        if let Err(err) = self.conn.process_new_packets() {
            // try to get the alert out before giving up
            let _ = self.conn.write_tls(&mut self.socket);
            self.state = SessionState::Failed;
            self.last_error = err.to_string();
            return Err(err.into());
        }
        Ok(())
    }

    fn check_peer_names(&mut self) -> Result<()> {
        let leaf = self
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());
        let Some(leaf) = leaf else {
            return Err(self.fail(TlsErrorKind::Verification, "certificate not found"));
        };
        let names = match CertNames::from_der(&leaf) {
            Ok(names) => names,
            Err(msg) => return Err(self.fail(TlsErrorKind::Verification, msg)),
        };
        if !verify_hostname(&self.hostname, &names) {
            return Err(self.fail(TlsErrorKind::Verification, "hostname does not match"));
        }
        Ok(())
    }

    fn fail(&mut self, kind: TlsErrorKind, message: impl Into<String>) -> EngineError {
        let message = message.into();
        self.state = SessionState::Failed;
        self.last_error = message.clone();
        EngineError::tls(kind, message)
    }

    fn fail_io(&mut self, err: io::Error) -> EngineError {
        self.fail(TlsErrorKind::Io, err.to_string())
    }
}

impl<S> std::fmt::Debug for TlsSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("side", &self.side)
            .field("hostname", &self.hostname)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// One direction of an in-memory non-blocking pipe
    type Buf = Arc<parking_lot::Mutex<VecDeque<u8>>>;

    struct MemSocket {
        rx: Buf,
        tx: Buf,
        rx_closed: Arc<AtomicBool>,
    }

    fn pair() -> (MemSocket, MemSocket) {
        let a: Buf = Default::default();
        let b: Buf = Default::default();
        (
            MemSocket {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
                rx_closed: Default::default(),
            },
            MemSocket {
                rx: b,
                tx: a,
                rx_closed: Default::default(),
            },
        )
    }

    impl Read for MemSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut rx = self.rx.lock();
            if rx.is_empty() {
                if self.rx_closed.load(Ordering::SeqCst) {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(rx.len());
            for (dst, src) in buf.iter_mut().zip(rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for MemSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.lock().extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn server_context() -> TlsContext {
        TlsContext::server_from_pem(
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server.pem"),
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server.key"),
        )
        .unwrap()
    }

    fn client_context(verify_peer: bool) -> TlsContext {
        TlsContext::client(&TlsConfig {
            verify_peer,
            ca_certificate: Some(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/ca.pem").into()),
        })
        .unwrap()
    }

    /// Step both sides until neither makes progress
    fn drive(
        client: &mut TlsSession<MemSocket>,
        server: &mut TlsSession<MemSocket>,
    ) -> (Result<HandshakeStatus>, Result<HandshakeStatus>) {
        let mut last = (client.handshake(), server.handshake());
        for _ in 0..20 {
            let done = matches!(
                (&last.0, &last.1),
                (Ok(HandshakeStatus::Complete(_)), Ok(HandshakeStatus::Complete(_)))
            );
            if done || last.0.is_err() || last.1.is_err() {
                break;
            }
            last = (client.handshake(), server.handshake());
        }
        last
    }

    #[test]
    fn test_handshake_and_data_exchange() {
        let (c, s) = pair();
        let mut client = TlsSession::client(&client_context(true), c, "localhost").unwrap();
        let mut server = TlsSession::server(&server_context(), s).unwrap();

        // nothing from the server yet: the client waits for readable
        assert_eq!(
            client.handshake().unwrap(),
            HandshakeStatus::WouldBlock(Want::Read)
        );

        let (c, s) = drive(&mut client, &mut server);
        let version = match c.unwrap() {
            HandshakeStatus::Complete(v) => v,
            other => panic!("client not complete: {:?}", other),
        };
        assert!(matches!(s.unwrap(), HandshakeStatus::Complete(_)));
        assert!(matches!(version, TlsVersion::Tls12 | TlsVersion::Tls13));
        assert_eq!(client.state(), SessionState::Established);

        assert_eq!(client.write(b"ping").unwrap(), IoOutcome::Bytes(4));
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), IoOutcome::Bytes(4));
        assert_eq!(&buf[..4], b"ping");

        // no more data: waiting is not an error
        assert_eq!(server.read(&mut buf).unwrap(), IoOutcome::WouldBlock(Want::Read));

        client.close().unwrap();
        assert_eq!(server.read(&mut buf).unwrap(), IoOutcome::Bytes(0));
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[test]
    fn test_hostname_mismatch_fails_verification() {
        let (c, s) = pair();
        let mut client = TlsSession::client(&client_context(true), c, "wrong.example").unwrap();
        let mut server = TlsSession::server(&server_context(), s).unwrap();

        let (c, _) = drive(&mut client, &mut server);
        let err = c.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Tls {
                kind: TlsErrorKind::Verification,
                ..
            }
        ));
        assert_eq!(client.last_error_string(), "hostname does not match");
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[test]
    fn test_untrusted_chain_fails_verification() {
        let (c, s) = pair();
        let ctx = TlsContext::client(&TlsConfig::default()).unwrap();
        let mut client = TlsSession::client(&ctx, c, "localhost").unwrap();
        let mut server = TlsSession::server(&server_context(), s).unwrap();

        let (c, _) = drive(&mut client, &mut server);
        assert!(matches!(
            c.unwrap_err(),
            EngineError::Tls {
                kind: TlsErrorKind::Verification,
                ..
            }
        ));
    }

    #[test]
    fn test_verification_disabled_accepts_any_name() {
        let (c, s) = pair();
        let mut client = TlsSession::client(&client_context(false), c, "wrong.example").unwrap();
        let mut server = TlsSession::server(&server_context(), s).unwrap();

        let (c, s) = drive(&mut client, &mut server);
        assert!(matches!(c.unwrap(), HandshakeStatus::Complete(_)));
        assert!(matches!(s.unwrap(), HandshakeStatus::Complete(_)));
    }

    #[test]
    fn test_eof_without_close_notify_is_error() {
        let (c, s) = pair();
        let eof = Arc::clone(&c.rx_closed);
        let mut client = TlsSession::client(&client_context(true), c, "localhost").unwrap();
        let mut server = TlsSession::server(&server_context(), s).unwrap();
        let (c, _) = drive(&mut client, &mut server);
        assert!(c.is_ok());

        // the server vanishes without sending close_notify
        drop(server);
        eof.store(true, Ordering::SeqCst);

        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Tls {
                kind: TlsErrorKind::Io,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Failed);
    }
}

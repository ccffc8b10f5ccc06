//! Connection establishment
//!
//! This module turns a target URI into a connected [`Transport`]:
//! - [`ConnectCommand`] resolves the host, dials candidate addresses in
//!   order and skips addresses recently marked bad
//! - [`BackupConnectCommand`] races the other address family once the
//!   primary attempt has been pending for the backup delay
//! - the winning socket is handed to a [`ConnectionConsumer`], through a
//!   TLS handshake first when the target needs one

mod backup;
mod connect;
mod transport;

pub use backup::{BackupConnectCommand, BackupConnectInfo, BackupPolicy, RaceSide};
pub use connect::{ConnectCommand, ConnectTarget, Connection, ConnectionConsumer};
pub use transport::{IoOutcome, Transport};

use crate::config::NetworkConfig;
use crate::resolver::{AddressFamily, NameResolutionManager};
use mio::net::TcpStream;
use mio::Interest;
use socket2::{Domain, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Readiness direction an operation waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

impl Want {
    pub fn interest(&self) -> Interest {
        match self {
            Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
        }
    }
}

/// Opens non-blocking connections
pub trait Dialer: Send + Sync + std::fmt::Debug {
    /// Start a non-blocking connect. Completion is observed through
    /// writability and [`poll_established`].
    fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Dialer for real TCP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        Ok(stream)
    }
}

/// Progress of a non-blocking connect
#[derive(Debug)]
pub enum ConnectProgress {
    Established,
    Pending,
    Failed(io::Error),
}

/// Check whether a dialed socket has connected
pub fn poll_established(stream: &TcpStream) -> ConnectProgress {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectProgress::Established,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ConnectProgress::Pending,
        Err(e) => ConnectProgress::Failed(e),
    }
}

/// Address families usable on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl AddressFamilies {
    pub fn all() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }

    /// Families that are both enabled by config and have a working local
    /// stack
    pub fn probe(config: &NetworkConfig) -> Self {
        let families = Self {
            ipv4: !config.disable_ipv4 && host_supports(Domain::IPV4),
            ipv6: !config.disable_ipv6 && host_supports(Domain::IPV6),
        };
        tracing::debug!(
            "Address families: IPv4={} IPv6={}",
            families.ipv4,
            families.ipv6
        );
        families
    }

    pub fn allows(&self, addr: &IpAddr) -> bool {
        match AddressFamily::of(addr) {
            AddressFamily::Ipv4 => self.ipv4,
            AddressFamily::Ipv6 => self.ipv6,
        }
    }

    pub fn apply(&self, manager: &mut NameResolutionManager) {
        manager.set_ipv4(self.ipv4);
        manager.set_ipv6(self.ipv6);
    }
}

fn host_supports(domain: Domain) -> bool {
    let Ok(socket) = Socket::new(domain, Type::DGRAM, None) else {
        return false;
    };
    let local: SocketAddr = if domain == Domain::IPV6 {
        (Ipv6Addr::LOCALHOST, 0).into()
    } else {
        (Ipv4Addr::LOCALHOST, 0).into()
    };
    socket.bind(&local.into()).is_ok()
}

//! Uniform non-blocking byte transport
//!
//! Protocol clients read and write through [`Transport`] without caring
//! whether the connection is plain TCP or TLS.

use super::Want;
use crate::error::Result;
use crate::tls::{TlsSession, TlsVersion};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Outcome of a read or write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes transferred. A read of 0 is an orderly close.
    Bytes(usize),
    /// Nothing could be done until the socket is ready in this direction
    WouldBlock(Want),
}

/// A connected socket, optionally wrapped in TLS
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsSession<TcpStream>>),
}

impl Transport {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome> {
        match self {
            Self::Plain(stream) => loop {
                match stream.read(buf) {
                    Ok(n) => return Ok(IoOutcome::Bytes(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(IoOutcome::WouldBlock(Want::Read))
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Self::Tls(session) => session.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<IoOutcome> {
        match self {
            Self::Plain(stream) => loop {
                match stream.write(buf) {
                    Ok(n) => return Ok(IoOutcome::Bytes(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(IoOutcome::WouldBlock(Want::Write))
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Self::Tls(session) => session.write(buf),
        }
    }

    /// Orderly shutdown; TLS sends close_notify first
    pub fn close(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => match stream.shutdown(std::net::Shutdown::Write) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => Err(e.into()),
            },
            Self::Tls(session) => session.close(),
        }
    }

    pub fn socket(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(session) => session.socket(),
        }
    }

    /// Socket for (re)registration with the multiplexer
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(session) => session.socket_mut(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket().peer_addr()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn tls_version(&self) -> Option<TlsVersion> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(session) => Some(session.version()),
        }
    }
}

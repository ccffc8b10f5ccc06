//! Typed error hierarchy for gosh-reactor
//!
//! Every error type includes context about what went wrong and whether
//! the protocol client should retry the operation or abort it.

use crate::protocol::ResultCode;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the engine core
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connect, timeout, reset, etc.)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Name resolution failed for every enabled address family
    #[error("Name resolution for {hostname} failed: {message}")]
    NameResolution { hostname: String, message: String },

    /// TLS handshake, transport or verification error
    #[error("TLS error: {message}")]
    Tls { kind: TlsErrorKind, message: String },

    /// Protocol-level errors (bad URI, malformed persisted data)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Persistence file errors
    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Invalid input from the caller or configuration
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },

    /// Download group not found
    #[error("Download group not found: {0}")]
    NotFound(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset or aborted
    ConnectionReset,
    /// Connect or I/O timeout
    Timeout,
    /// Network or host unreachable
    Unreachable,
    /// Every candidate address failed
    AllAddressesFailed,
    /// Other socket error
    Other,
}

/// TLS error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    /// Peer certificate could not be verified or does not match the hostname
    Verification,
    /// Handshake failed at the protocol level (alert, bad message)
    Handshake,
    /// Transport error underneath the TLS session
    Io,
    /// Invalid TLS configuration (certificates, keys)
    Config,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid URI
    InvalidUrl,
    /// URI scheme this engine cannot connect to
    UnsupportedScheme,
    /// Malformed server statistics data
    InvalidServerStat,
}

/// What the owning protocol client should do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// Transient failure, the client may retry (with backoff)
    Retry,
    /// Permanent failure, must not be retried silently
    Abort,
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::NameResolution { .. } => true,
            Self::Tls { kind, .. } => matches!(kind, TlsErrorKind::Io),
            _ => false,
        }
    }

    /// Retry/abort classification consumed by protocol clients
    pub fn signal(&self) -> FailureSignal {
        if self.is_retryable() {
            FailureSignal::Retry
        } else {
            FailureSignal::Abort
        }
    }

    /// Result code recorded in the group's download result
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Network { kind, .. } => match kind {
                NetworkErrorKind::Timeout => ResultCode::TimeOut,
                NetworkErrorKind::AllAddressesFailed => ResultCode::AllMirrorsFailed,
                _ => ResultCode::NetworkProblem,
            },
            Self::NameResolution { .. } => ResultCode::NameResolveError,
            Self::Tls { kind, .. } => match kind {
                TlsErrorKind::Verification => ResultCode::TlsVerificationFailed,
                TlsErrorKind::Io => ResultCode::NetworkProblem,
                _ => ResultCode::TlsHandshakeFailed,
            },
            Self::Protocol { kind, .. } => match kind {
                ProtocolErrorKind::InvalidUrl | ProtocolErrorKind::UnsupportedScheme => {
                    ResultCode::ResourceNotFound
                }
                ProtocolErrorKind::InvalidServerStat => ResultCode::UnknownError,
            },
            Self::Shutdown => ResultCode::InProgress,
            _ => ResultCode::UnknownError,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::Unreachable
                | NetworkErrorKind::AllAddressesFailed
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a name resolution error
    pub fn name_resolution(hostname: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NameResolution {
            hostname: hostname.into(),
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self::Tls {
            kind,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

// ENETUNREACH, EHOSTUNREACH
#[cfg(any(target_os = "linux", target_os = "android"))]
const UNREACHABLE_ERRNOS: [i32; 2] = [101, 113];
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const UNREACHABLE_ERRNOS: [i32; 2] = [51, 65];
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const UNREACHABLE_ERRNOS: [i32; 0] = [];

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                NetworkErrorKind::ConnectionReset
            }
            ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            ErrorKind::AddrNotAvailable => NetworkErrorKind::Unreachable,
            _ => match err.raw_os_error() {
                Some(code) if UNREACHABLE_ERRNOS.contains(&code) => NetworkErrorKind::Unreachable,
                _ => NetworkErrorKind::Other,
            },
        };
        Self::network(kind, err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidUrl,
            message: err.to_string(),
        }
    }
}

impl From<rustls::Error> for EngineError {
    fn from(err: rustls::Error) -> Self {
        let kind = match err {
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                TlsErrorKind::Verification
            }
            rustls::Error::General(_) => TlsErrorKind::Config,
            _ => TlsErrorKind::Handshake,
        };
        Self::Tls {
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_and_abort_signals() {
        let refused = EngineError::network(NetworkErrorKind::ConnectionRefused, "refused");
        assert_eq!(refused.signal(), FailureSignal::Retry);

        let resolve = EngineError::name_resolution("example.test", "NXDOMAIN");
        assert_eq!(resolve.signal(), FailureSignal::Retry);

        let verify = EngineError::tls(TlsErrorKind::Verification, "hostname does not match");
        assert_eq!(verify.signal(), FailureSignal::Abort);
        assert_eq!(verify.result_code(), ResultCode::TlsVerificationFailed);

        let config = EngineError::invalid_input("max_concurrent_downloads", "Must be at least 1");
        assert_eq!(config.signal(), FailureSignal::Abort);
    }

    #[test]
    fn test_io_error_mapping() {
        let err: EngineError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(
            err,
            EngineError::Network {
                kind: NetworkErrorKind::ConnectionRefused,
                retryable: true,
                ..
            }
        ));

        let err: EngineError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.result_code(), ResultCode::TimeOut);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreachable_errno_mapping_on_linux() {
        let kind = |code: i32| match EngineError::from(std::io::Error::from_raw_os_error(code)) {
            EngineError::Network { kind, .. } => kind,
            other => panic!("unexpected error: {:?}", other),
        };
        assert_eq!(kind(101), NetworkErrorKind::Unreachable);
        assert_eq!(kind(113), NetworkErrorKind::Unreachable);
        // BSD numbers mean something else here
        assert_eq!(kind(51), NetworkErrorKind::Other);
        assert_eq!(kind(65), NetworkErrorKind::Other);
    }

    #[test]
    fn test_all_addresses_failed_classification() {
        let err = EngineError::network(NetworkErrorKind::AllAddressesFailed, "no address left");
        assert!(err.is_retryable());
        assert_eq!(err.result_code(), ResultCode::AllMirrorsFailed);
    }
}

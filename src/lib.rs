//! # gosh-reactor
//!
//! The scheduling and connection core of a multi-protocol download engine.
//!
//! ## Features
//!
//! - **Cooperative scheduler**: single-threaded task loop over a readiness
//!   multiplexer, with timers, forced refresh passes and routine tasks
//! - **Admission control**: bounded number of active download groups, FIFO
//!   promotion, per-group results and follow-up groups
//! - **Name resolution**: non-blocking lookups for IPv6 and IPv4 on helper
//!   threads, with a DNS cache that remembers bad addresses
//! - **Connection racing**: a backup connection over the other address
//!   family when the first attempt stalls
//! - **TLS**: rustls sessions driven over non-blocking sockets
//! - **Mirror selection**: in-order, feedback and adaptive URI selectors
//!   backed by persisted per-host server statistics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_reactor::{DownloadEngine, DownloadGroup, EngineConfig, GroupContext, GroupDriver};
//! use gosh_reactor::{Result, Task};
//! use std::sync::Arc;
//!
//! struct Fetch;
//!
//! impl GroupDriver for Fetch {
//!     fn create_initial_tasks(&mut self, _ctx: &GroupContext) -> Result<Vec<Box<dyn Task>>> {
//!         // protocol tasks for this group go here
//!         Ok(Vec::new())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = EngineConfig::default();
//!     let mut engine = DownloadEngine::new(config.clone())?;
//!     engine.add_group(DownloadGroup::new(
//!         Arc::new(config),
//!         vec!["https://example.com/file.iso".to_string()],
//!         Box::new(Fetch),
//!     ));
//!     engine.run()?;
//!
//!     let mut out = Vec::new();
//!     engine.groups().format_download_results(&mut out).ok();
//!     print!("{}", String::from_utf8_lossy(&out));
//!     Ok(())
//! }
//! ```

// Modules
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod net;
pub mod protocol;
pub mod resolver;
pub mod tls;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, NetworkConfig, TlsConfig, UriSelectorKind};
pub use engine::{
    DownloadEngine, EngineBuilder, Readiness, SchedulerHandle, SocketCheck, Step, Task, TaskCore,
    TaskId, TaskKind, TaskStatus,
};
pub use error::{
    EngineError, FailureSignal, NetworkErrorKind, ProtocolErrorKind, Result, TlsErrorKind,
};

// Group exports
pub use group::{
    DownloadGroup, DownloadHook, GroupContext, GroupDriver, GroupManager, PeerStat, ServerStat,
    ServerStatMan, UriSelector,
};

// Connection exports
pub use net::{
    AddressFamilies, ConnectCommand, ConnectTarget, Connection, ConnectionConsumer, Dialer,
    IoOutcome, TcpDialer, Transport,
};
pub use resolver::{DnsCache, NameResolutionManager, ResolveCommand, Resolve, SystemResolver};
pub use tls::{TlsContext, TlsHandshakeCommand, TlsSession};

// Result exports
pub use protocol::{DownloadResult, DownloadStat, GroupId, ResultCode};

//! Protocol types for gosh-reactor
//!
//! Types that cross the engine boundary:
//! - Group identifiers
//! - Download results and their classification
//! - Aggregated transfer statistics
//!
//! These types are serializable so they can be handed to an RPC layer
//! or a session file without conversion.

mod result;
mod types;

pub use result::{DownloadResult, DownloadStat, ResultCode, TransferStat, UriResult};
pub use types::GroupId;

pub(crate) use result::abbrev_size;

//! Shard-routed sessionizer for tracking-pixel log streams.
//!
//! Log lines arrive as url-encoded pixel hits, are validated and routed by
//! shard, and accumulate as compact binary event records in an embedded
//! ordered key-value store. Once a user has been idle past the configured
//! timeout, the user's key range is drained in a single pass, the session is
//! reconstructed, and a pluggable [`JoinTarget`] computes the output
//! envelope, which is queued back into the store under a reserved prefix for
//! downstream pickup.

pub mod codec;
pub mod config;
pub mod deadline;
pub mod error;
pub mod logging;
pub mod logjoin;
pub mod session;
pub mod shard;
pub mod stats;
pub mod store;
pub mod target;

pub use codec::{DecodedEvent, PixelParams};
pub use config::Config;
pub use deadline::DeadlineIndex;
pub use error::{JoinError, Result};
pub use logjoin::{LogJoin, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_STATS_PREFIX};
pub use session::{EventKind, SessionEnvelope, TrackedEvent, TrackedSession};
pub use shard::Shard;
pub use stats::JoinStats;
pub use store::{Cursor, SessionStore, Transaction};
pub use target::{JoinTarget, SummaryJoinTarget};

//! Append-only per-peer feeds.
//!
//! Each peer owns one feed per space. Records are addressed by
//! `(peer, seq)` with `seq` starting at zero and increasing by one per append.
//! Once appended, a record is immutable.
//!
//! Local writers use [`FeedStore::append`]. Replication delivers records at
//! a known position through [`FeedStore::insert`], which ignores records that
//! are already confirmed, so re-delivery is harmless.

mod memory_store;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_store;

pub use memory_store::MemoryFeedStore;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_store::SqliteFeedStore;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys::PeerId;
use crate::timeframe::Timeframe;

/// A single immutable feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Encoded envelope bytes.
    pub data: Vec<u8>,
    /// The writer's processed timeframe at the time of writing.
    /// Delivered to consumers out of band as the mutation's frontier.
    pub timeframe: Timeframe,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn new(data: Vec<u8>, timeframe: Timeframe) -> Self {
        Self {
            data,
            timeframe,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Trait for feed storage backends.
///
/// Implementations must be durable on return from [`append`](FeedStore::append)
/// and must never hand out sequence numbers out of order or twice.
pub trait FeedStore: Send + Sync {
    /// Append a record to `peer`'s feed, returning its sequence number.
    fn append(&self, peer: &PeerId, record: LogRecord) -> Result<u64>;

    /// Store a replicated record at position `seq` of `peer`'s feed.
    ///
    /// Returns `false` without touching the feed when `seq` is already
    /// confirmed, `true` when the record was appended. A `seq` past the end
    /// fails with [`EchoError::FeedGap`](crate::error::EchoError::FeedGap).
    fn insert(&self, peer: &PeerId, seq: u64, record: LogRecord) -> Result<bool>;

    /// Read the record at `seq`.
    ///
    /// Fails with [`EchoError::NotFound`](crate::error::EchoError::NotFound)
    /// when `seq` is beyond the end of the feed.
    fn read(&self, peer: &PeerId, seq: u64) -> Result<LogRecord>;

    /// Number of records in `peer`'s feed. Unknown peers have length zero.
    fn length(&self, peer: &PeerId) -> Result<u64>;

    /// All peers with at least one record, in sorted order.
    fn peers(&self) -> Result<Vec<PeerId>>;

    /// Timeframe of the last record in every feed.
    fn end_timeframe(&self) -> Result<Timeframe> {
        let mut timeframe = Timeframe::new();
        for peer in self.peers()? {
            let length = self.length(&peer)?;
            if length > 0 {
                timeframe.set(peer, length - 1);
            }
        }
        Ok(timeframe)
    }
}

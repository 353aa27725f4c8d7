//! In-memory feed store for tests and ephemeral spaces.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{FeedStore, LogRecord};
use crate::error::{EchoError, Result};
use crate::keys::PeerId;

/// In-memory feed storage.
///
/// Thread-safe via `RwLock`; data is lost when dropped. Cloning shares the
/// underlying feeds, which is how tests model two pipelines reading the same
/// replicated log.
#[derive(Debug, Default, Clone)]
pub struct MemoryFeedStore {
    feeds: Arc<RwLock<BTreeMap<PeerId, Vec<LogRecord>>>>,
}

impl MemoryFeedStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedStore for MemoryFeedStore {
    fn append(&self, peer: &PeerId, record: LogRecord) -> Result<u64> {
        let mut feeds = self.feeds.write().unwrap();
        let feed = feeds.entry(peer.clone()).or_default();
        feed.push(record);
        Ok(feed.len() as u64 - 1)
    }

    fn insert(&self, peer: &PeerId, seq: u64, record: LogRecord) -> Result<bool> {
        let mut feeds = self.feeds.write().unwrap();
        let feed = feeds.entry(peer.clone()).or_default();
        let length = feed.len() as u64;
        if seq < length {
            log::debug!("Record {}[{}] already confirmed", peer, seq);
            return Ok(false);
        }
        if seq > length {
            return Err(EchoError::FeedGap {
                peer: peer.clone(),
                seq,
                length,
            });
        }
        feed.push(record);
        Ok(true)
    }

    fn read(&self, peer: &PeerId, seq: u64) -> Result<LogRecord> {
        let feeds = self.feeds.read().unwrap();
        feeds
            .get(peer)
            .and_then(|feed| feed.get(seq as usize))
            .cloned()
            .ok_or_else(|| EchoError::NotFound {
                peer: peer.clone(),
                seq,
            })
    }

    fn length(&self, peer: &PeerId) -> Result<u64> {
        let feeds = self.feeds.read().unwrap();
        Ok(feeds.get(peer).map(|feed| feed.len() as u64).unwrap_or(0))
    }

    fn peers(&self) -> Result<Vec<PeerId>> {
        let feeds = self.feeds.read().unwrap();
        Ok(feeds
            .iter()
            .filter(|(_, feed)| !feed.is_empty())
            .map(|(peer, _)| peer.clone())
            .collect())
    }
}

//! Picks the next feed record to apply.
//!
//! Only records whose causal dependencies are already processed are eligible.
//! Among those, the smallest `(timeframe.total_messages(), peer, seq)` wins so
//! every replica applies concurrent records in the same order.

use crate::feed::LogRecord;
use crate::keys::PeerId;
use crate::timeframe::Timeframe;

/// The next unprocessed record of one feed.
#[derive(Debug, Clone)]
pub struct FeedHead {
    pub peer: PeerId,
    pub seq: u64,
    pub record: LogRecord,
}

impl FeedHead {
    fn ordering_key(&self) -> (u64, &PeerId, u64) {
        (self.record.timeframe.total_messages(), &self.peer, self.seq)
    }

    /// Whether everything this record depends on has been processed.
    pub fn is_ready(&self, processed: &Timeframe) -> bool {
        processed.covers(&self.record.timeframe)
    }
}

/// Index of the head to apply next, or `None` if no head is ready.
pub fn select_next(heads: &[FeedHead], processed: &Timeframe) -> Option<usize> {
    heads
        .iter()
        .enumerate()
        .filter(|(_, head)| head.is_ready(processed))
        .min_by(|(_, a), (_, b)| a.ordering_key().cmp(&b.ordering_key()))
        .map(|(index, _)| index)
}

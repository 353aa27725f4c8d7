//! Decides when a space should be snapshotted.

use std::sync::Mutex;

use crate::config::DEFAULT_SNAPSHOT_MESSAGE_LIMIT;
use crate::timeframe::Timeframe;

/// Permission to take one snapshot at `timeframe`.
///
/// Hand it back through [`SnapshotMonitor::complete`] or
/// [`SnapshotMonitor::abort`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct SnapshotTicket {
    timeframe: Timeframe,
}

impl SnapshotTicket {
    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    epoch: Timeframe,
    in_flight: Option<Timeframe>,
}

/// Triggers a snapshot once at least `limit` messages arrived since the
/// current epoch.
///
/// Only one snapshot may be in flight at a time: [`try_begin`](Self::try_begin)
/// checks and claims the slot under a single lock, so concurrent triggers for
/// the same frontier yield one ticket.
#[derive(Debug)]
pub struct SnapshotMonitor {
    limit: u64,
    state: Mutex<MonitorState>,
}

impl SnapshotMonitor {
    pub fn new(limit: u64) -> Self {
        Self::with_epoch(limit, Timeframe::new())
    }

    /// Start counting from an existing snapshot's timeframe.
    pub fn with_epoch(limit: u64, epoch: Timeframe) -> Self {
        Self {
            limit,
            state: Mutex::new(MonitorState {
                epoch,
                in_flight: None,
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Timeframe of the last completed snapshot.
    pub fn epoch(&self) -> Timeframe {
        self.state.lock().unwrap().epoch.clone()
    }

    /// Frontier of the snapshot currently being taken, if any.
    pub fn in_flight(&self) -> Option<Timeframe> {
        self.state.lock().unwrap().in_flight.clone()
    }

    /// Claim the snapshot slot if `current` is far enough past the epoch.
    pub fn try_begin(&self, current: &Timeframe) -> Option<SnapshotTicket> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.is_some() {
            return None;
        }
        let new_messages = current.new_messages(&state.epoch);
        if new_messages == 0 || new_messages < self.limit {
            return None;
        }
        log::debug!(
            "Snapshot due at {}: {} new messages since {}",
            current,
            new_messages,
            state.epoch
        );
        state.in_flight = Some(current.clone());
        Some(SnapshotTicket {
            timeframe: current.clone(),
        })
    }

    /// Mark the ticket's snapshot as stored; its timeframe becomes the new epoch.
    pub fn complete(&self, ticket: SnapshotTicket) {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.as_ref() == Some(&ticket.timeframe) {
            state.in_flight = None;
        }
        state.epoch.merge_with(&ticket.timeframe);
    }

    /// Release the slot without moving the epoch.
    pub fn abort(&self, ticket: SnapshotTicket) {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.as_ref() == Some(&ticket.timeframe) {
            state.in_flight = None;
        }
    }
}

impl Default for SnapshotMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_MESSAGE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PeerId;
    use std::sync::Arc;

    fn at(seq: u64) -> Timeframe {
        [(PeerId::from("a"), seq)].into_iter().collect()
    }

    #[test]
    fn test_triggers_at_limit() {
        let monitor = SnapshotMonitor::new(3);
        // a[1] covers two messages, a[2] three
        assert!(monitor.try_begin(&at(1)).is_none());
        assert!(monitor.try_begin(&at(2)).is_some());
    }

    #[test]
    fn test_nothing_new_never_triggers() {
        let monitor = SnapshotMonitor::with_epoch(0, at(4));
        assert!(monitor.try_begin(&at(4)).is_none());
        assert!(monitor.try_begin(&at(5)).is_some());
    }

    #[test]
    fn test_single_ticket_in_flight() {
        let monitor = SnapshotMonitor::new(1);
        let ticket = monitor.try_begin(&at(5)).unwrap();
        assert!(monitor.try_begin(&at(5)).is_none());
        assert!(monitor.try_begin(&at(6)).is_none());
        assert_eq!(monitor.in_flight(), Some(at(5)));

        monitor.complete(ticket);
        assert_eq!(monitor.epoch(), at(5));
        assert!(monitor.in_flight().is_none());
        assert!(monitor.try_begin(&at(5)).is_none());
        assert!(monitor.try_begin(&at(6)).is_some());
    }

    #[test]
    fn test_abort_keeps_epoch() {
        let monitor = SnapshotMonitor::new(1);
        let ticket = monitor.try_begin(&at(1)).unwrap();
        monitor.abort(ticket);
        assert!(monitor.epoch().is_empty());
        assert!(monitor.try_begin(&at(1)).is_some());
    }

    #[test]
    fn test_concurrent_triggers_yield_one_ticket() {
        let monitor = Arc::new(SnapshotMonitor::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || monitor.try_begin(&at(9)).is_some())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }

    #[test]
    fn test_default_limit() {
        assert_eq!(SnapshotMonitor::default().limit(), 10_000);
    }
}

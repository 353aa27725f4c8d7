//! Replication traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::wire::AdapterMessage;
use crate::keys::PeerId;

/// Observes peer and message traffic of an [`EchoNetworkAdapter`](super::EchoNetworkAdapter).
pub trait NetworkDataMonitor: Send + Sync {
    fn record_peer_connected(&self, peer_id: &PeerId);
    fn record_peer_disconnected(&self, peer_id: &PeerId);
    fn record_message_sent(&self, message: &AdapterMessage, duration: Duration);
    fn record_message_received(&self, message: &AdapterMessage);
    fn record_message_sending_failed(&self, message: &AdapterMessage);
}

/// Point-in-time totals from a [`CountingMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub connections: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub sends_failed: u64,
    /// Total time spent in successful sends, in microseconds.
    pub send_micros: u64,
}

/// Monitor that keeps running totals.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    connections: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    sends_failed: AtomicU64,
    send_micros: AtomicU64,
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            connections: self.connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            send_micros: self.send_micros.load(Ordering::Relaxed),
        }
    }
}

impl NetworkDataMonitor for CountingMonitor {
    fn record_peer_connected(&self, _peer_id: &PeerId) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_peer_disconnected(&self, _peer_id: &PeerId) {
        // Never below zero
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn record_message_sent(&self, message: &AdapterMessage, duration: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        self.send_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_message_received(&self, message: &AdapterMessage) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
    }

    fn record_message_sending_failed(&self, _message: &AdapterMessage) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SyncMessage;

    #[test]
    fn test_counts() {
        let monitor = CountingMonitor::new();
        let peer = PeerId::from("p");
        let message = AdapterMessage::new(peer.clone(), "d", &SyncMessage::Update(vec![1, 2]));

        monitor.record_peer_connected(&peer);
        monitor.record_message_sent(&message, Duration::from_micros(10));
        monitor.record_message_received(&message);
        monitor.record_message_sending_failed(&message);
        monitor.record_peer_disconnected(&peer);
        monitor.record_peer_disconnected(&peer);

        let stats = monitor.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, message.payload.len() as u64);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.sends_failed, 1);
        assert_eq!(stats.send_micros, 10);
    }
}

//! Per-peer replication state on top of transport connections.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_lite::future::yield_now;

use super::monitor::NetworkDataMonitor;
use super::transport::ReplicationExtension;
use super::wire::AdapterMessage;
use crate::config::EchoConfig;
use crate::error::{EchoError, Result};
use crate::keys::{ConnectionId, PeerId};
use crate::observer::{CallbackRegistry, EventCallback, SubscriptionId};

/// Replication state of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Never heard from.
    Unconnected,
    /// Sent its first message; announced but not yet answered.
    Candidate,
    /// Accepted by the document layer.
    Replicating,
    /// Every transport to the peer closed.
    Disconnected,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Candidate | PeerState::Replicating)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Unconnected => "unconnected",
            PeerState::Candidate => "candidate",
            PeerState::Replicating => "replicating",
            PeerState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Events emitted by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// First message from a peer, emitted once per peer id.
    PeerCandidate {
        peer_id: PeerId,
        connection_id: ConnectionId,
    },
    /// The last transport to the peer closed.
    PeerDisconnected { peer_id: PeerId },
}

/// A decoded inbound message, ready for the document layer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: ConnectionId,
    pub message: AdapterMessage,
    /// Whether this message turned its sender into a candidate.
    pub new_peer: bool,
}

struct ConnectionEntry {
    extension: Arc<dyn ReplicationExtension>,
    peer_id: Option<PeerId>,
}

struct PeerEntry {
    state: PeerState,
    /// Connection whose extension carries the peer's replication channel.
    owner: Option<ConnectionId>,
    connections: BTreeSet<ConnectionId>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            state: PeerState::Unconnected,
            owner: None,
            connections: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct AdapterState {
    closed: bool,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    peers: HashMap<PeerId, PeerEntry>,
}

/// Routes replication messages between local documents and remote peers.
///
/// A peer may be reachable over several transports at once. The adapter keeps
/// one logical channel per peer id, carried by the first connection the peer
/// spoke on, and counts the rest: the peer is only disconnected when its
/// last transport closes. If the owning transport closes first, the next
/// live one takes over.
pub struct EchoNetworkAdapter {
    peer_id: PeerId,
    state: Mutex<AdapterState>,
    events: CallbackRegistry<NetworkEvent>,
    monitor: Option<Arc<dyn NetworkDataMonitor>>,
    yield_budget: usize,
    since_yield: AtomicUsize,
}

impl EchoNetworkAdapter {
    pub fn new(peer_id: PeerId, config: &EchoConfig) -> Self {
        Self {
            peer_id,
            state: Mutex::new(AdapterState::default()),
            events: CallbackRegistry::new(),
            monitor: None,
            yield_budget: config.inbound_yield_budget.max(1),
            since_yield: AtomicUsize::new(0),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn NetworkDataMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Our own peer id, used as the sender of outgoing messages.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    // ==================== Connections ====================

    /// Register a freshly opened transport.
    pub fn connection_opened(&self, extension: Arc<dyn ReplicationExtension>) -> Result<()> {
        let connection_id = extension.connection_id().clone();
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(EchoError::Invariant("network adapter is closed".to_string()));
        }
        if state.connections.contains_key(&connection_id) {
            return Err(EchoError::Invariant(format!(
                "connection {} is already open",
                connection_id
            )));
        }

        state.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                extension,
                peer_id: None,
            },
        );
        log::debug!("Connection {} opened", connection_id);
        Ok(())
    }

    /// Decode a frame received on `connection_id`.
    ///
    /// Frames addressed to another peer are dropped and yield `None`.
    ///
    /// The executor gives no signal that it is saturated, so backpressure is
    /// approximated with a fixed budget: every `inbound_yield_budget`-th call
    /// yields once before decoding. A steady inbound stream therefore cannot
    /// starve other tasks, while a quiet connection never pays for the yield.
    pub async fn receive(
        &self,
        connection_id: &ConnectionId,
        frame: &[u8],
    ) -> Result<Option<InboundMessage>> {
        if self.since_yield.fetch_add(1, Ordering::Relaxed) + 1 >= self.yield_budget {
            self.since_yield.store(0, Ordering::Relaxed);
            yield_now().await;
        }

        let message = AdapterMessage::decode(frame)?;
        if let Some(target) = &message.target_id
            && target != &self.peer_id
        {
            log::debug!(
                "Dropping message for {} received on {}",
                target,
                connection_id
            );
            return Ok(None);
        }

        let new_peer = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(EchoError::Invariant("network adapter is closed".to_string()));
            }
            let Some(connection) = state.connections.get_mut(connection_id) else {
                return Err(EchoError::Invariant(format!(
                    "message on unknown connection {}",
                    connection_id
                )));
            };
            match &connection.peer_id {
                Some(peer_id) if peer_id != &message.sender_id => {
                    return Err(EchoError::Invariant(format!(
                        "connection {} belongs to {} but carried a message from {}",
                        connection_id, peer_id, message.sender_id
                    )));
                }
                Some(_) => {}
                None => connection.peer_id = Some(message.sender_id.clone()),
            }

            let peer = state
                .peers
                .entry(message.sender_id.clone())
                .or_insert_with(PeerEntry::new);
            peer.connections.insert(connection_id.clone());
            if peer.owner.is_none() {
                peer.owner = Some(connection_id.clone());
            }
            if peer.state.is_connected() {
                false
            } else {
                peer.state = PeerState::Candidate;
                true
            }
        };

        if new_peer {
            log::info!(
                "Peer {} is a candidate via {}",
                message.sender_id,
                connection_id
            );
            if let Some(monitor) = &self.monitor {
                monitor.record_peer_connected(&message.sender_id);
            }
            self.events.emit(&NetworkEvent::PeerCandidate {
                peer_id: message.sender_id.clone(),
                connection_id: connection_id.clone(),
            });
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_message_received(&message);
        }

        Ok(Some(InboundMessage {
            connection_id: connection_id.clone(),
            message,
            new_peer,
        }))
    }

    /// Move a candidate to `Replicating`.
    pub fn accept_peer(&self, peer_id: &PeerId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.peers.get_mut(peer_id) {
            Some(peer) if peer.state.is_connected() => {
                peer.state = PeerState::Replicating;
                Ok(())
            }
            _ => Err(EchoError::Invariant(format!(
                "peer {} is not connected",
                peer_id
            ))),
        }
    }

    /// Forget a closed transport.
    ///
    /// The peer is disconnected only if this was its last transport.
    pub fn connection_closed(&self, connection_id: &ConnectionId) -> Result<()> {
        let disconnected = {
            let mut state = self.state.lock().unwrap();
            let Some(connection) = state.connections.remove(connection_id) else {
                return Err(EchoError::Invariant(format!(
                    "connection {} is not open",
                    connection_id
                )));
            };
            log::debug!("Connection {} closed", connection_id);

            let Some(peer_id) = connection.peer_id else {
                return Ok(());
            };
            let Some(peer) = state.peers.get_mut(&peer_id) else {
                return Ok(());
            };

            peer.connections.remove(connection_id);
            if peer.connections.is_empty() {
                peer.state = PeerState::Disconnected;
                peer.owner = None;
                Some(peer_id)
            } else {
                if peer.owner.as_ref() == Some(connection_id) {
                    peer.owner = peer.connections.iter().next().cloned();
                    log::info!(
                        "Peer {} moved to connection {:?}",
                        peer_id,
                        peer.owner
                    );
                }
                None
            }
        };

        if let Some(peer_id) = disconnected {
            self.peer_disconnected(&peer_id);
        }
        Ok(())
    }

    fn peer_disconnected(&self, peer_id: &PeerId) {
        log::info!("Peer {} disconnected", peer_id);
        if let Some(monitor) = &self.monitor {
            monitor.record_peer_disconnected(peer_id);
        }
        self.events.emit(&NetworkEvent::PeerDisconnected {
            peer_id: peer_id.clone(),
        });
    }

    // ==================== Sending ====================

    /// Send `message` to its target peer over the peer's channel.
    ///
    /// Fails with an invariant error if the message has no target or no
    /// extension is registered for it.
    pub async fn send(&self, message: &AdapterMessage) -> Result<()> {
        let Some(target) = &message.target_id else {
            return Err(EchoError::Invariant(
                "outgoing message has no target peer".to_string(),
            ));
        };

        let extension = {
            let state = self.state.lock().unwrap();
            state
                .peers
                .get(target)
                .and_then(|peer| peer.owner.as_ref())
                .and_then(|owner| state.connections.get(owner))
                .map(|connection| Arc::clone(&connection.extension))
        };
        let Some(extension) = extension else {
            return Err(EchoError::Invariant(format!(
                "no extension registered for peer {}",
                target
            )));
        };

        self.send_via(extension.as_ref(), message).await
    }

    /// Send `message` on one specific connection, whoever is on the other end.
    pub async fn send_on_connection(
        &self,
        connection_id: &ConnectionId,
        message: &AdapterMessage,
    ) -> Result<()> {
        let extension = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .get(connection_id)
                .map(|connection| Arc::clone(&connection.extension))
        };
        let Some(extension) = extension else {
            return Err(EchoError::Invariant(format!(
                "connection {} is not open",
                connection_id
            )));
        };

        self.send_via(extension.as_ref(), message).await
    }

    async fn send_via(
        &self,
        extension: &dyn ReplicationExtension,
        message: &AdapterMessage,
    ) -> Result<()> {
        let start = Instant::now();
        match extension.send(&message.encode()).await {
            Ok(()) => {
                if let Some(monitor) = &self.monitor {
                    monitor.record_message_sent(message, start.elapsed());
                }
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Failed to send {} to {:?} on {}: {}",
                    message.document_id,
                    message.target_id,
                    extension.connection_id(),
                    e
                );
                if let Some(monitor) = &self.monitor {
                    monitor.record_message_sending_failed(message);
                }
                Err(e)
            }
        }
    }

    // ==================== Queries ====================

    pub fn peer_state(&self, peer_id: &PeerId) -> PeerState {
        let state = self.state.lock().unwrap();
        state
            .peers
            .get(peer_id)
            .map(|peer| peer.state)
            .unwrap_or(PeerState::Unconnected)
    }

    /// Peers that are candidates or replicating, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.state.lock().unwrap();
        let mut peers: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, peer)| peer.state.is_connected())
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of open transports to `peer_id`.
    pub fn connection_count(&self, peer_id: &PeerId) -> usize {
        let state = self.state.lock().unwrap();
        state
            .peers
            .get(peer_id)
            .map(|peer| peer.connections.len())
            .unwrap_or(0)
    }

    /// Ids of every open connection, sorted.
    pub fn open_connections(&self) -> Vec<ConnectionId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<ConnectionId> = state.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ==================== Lifecycle ====================

    pub fn subscribe(&self, callback: EventCallback<NetworkEvent>) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Drop every connection, disconnect every peer and unregister observers.
    pub fn close(&self) {
        let disconnected: Vec<PeerId> = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connections.clear();
            let mut peers: Vec<PeerId> = state
                .peers
                .iter_mut()
                .filter(|(_, peer)| peer.state.is_connected())
                .map(|(peer_id, peer)| {
                    peer.state = PeerState::Disconnected;
                    peer.owner = None;
                    peer.connections.clear();
                    peer_id.clone()
                })
                .collect();
            peers.sort();
            peers
        };

        for peer_id in &disconnected {
            self.peer_disconnected(peer_id);
        }
        self.events.clear();
        log::info!("Network adapter {} closed", self.peer_id);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl fmt::Debug for EchoNetworkAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoNetworkAdapter")
            .field("peer_id", &self.peer_id)
            .field("connected_peers", &self.connected_peers())
            .finish()
    }
}

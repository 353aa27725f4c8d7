//! Keeps a set of space documents in sync with every connected peer.
//!
//! The handshake follows the y-sync protocol:
//!
//! 1. When a connection opens, each side sends `SyncStep1` (its state vector)
//!    for every replicated document.
//! 2. A side receiving `SyncStep1` answers with `SyncStep2`: the diff the
//!    sender is missing, addressed to that peer.
//! 3. After that, local edits are broadcast as `Update` messages by
//!    [`DocumentReplicator::flush_local_updates`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::adapter::{EchoNetworkAdapter, InboundMessage};
use super::transport::ReplicationExtension;
use super::wire::{AdapterMessage, SyncMessage};
use crate::document::{SpaceDoc, UpdateOrigin};
use crate::error::Result;
use crate::keys::ConnectionId;

type Outbox = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// Bridges [`SpaceDoc`]s and an [`EchoNetworkAdapter`].
pub struct DocumentReplicator {
    adapter: Arc<EchoNetworkAdapter>,
    docs: RwLock<HashMap<String, Arc<SpaceDoc>>>,
    outbox: Outbox,
    subscriptions: Mutex<Vec<yrs::Subscription>>,
}

impl DocumentReplicator {
    pub fn new(adapter: Arc<EchoNetworkAdapter>) -> Self {
        Self {
            adapter,
            docs: RwLock::new(HashMap::new()),
            outbox: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<EchoNetworkAdapter> {
        &self.adapter
    }

    /// Start replicating `doc` under its document name.
    ///
    /// Local edits made from now on are queued for the next
    /// [`flush_local_updates`](Self::flush_local_updates).
    pub fn add_document(&self, doc: Arc<SpaceDoc>) -> Result<()> {
        let document_id = doc.doc_name().to_string();
        let outbox = Arc::clone(&self.outbox);
        let queued_id = document_id.clone();
        let subscription = doc.observe_local_updates(move |update| {
            outbox
                .lock()
                .unwrap()
                .push((queued_id.clone(), update.to_vec()));
        })?;

        self.subscriptions.lock().unwrap().push(subscription);
        self.docs.write().unwrap().insert(document_id.clone(), doc);
        log::debug!("Replicating document {}", document_id);
        Ok(())
    }

    pub fn document(&self, document_id: &str) -> Option<Arc<SpaceDoc>> {
        self.docs.read().unwrap().get(document_id).cloned()
    }

    /// Replicated document ids, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.docs.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn documents(&self) -> Vec<Arc<SpaceDoc>> {
        let docs = self.docs.read().unwrap();
        let mut docs: Vec<Arc<SpaceDoc>> = docs.values().cloned().collect();
        docs.sort_by(|a, b| a.doc_name().cmp(b.doc_name()));
        docs
    }

    /// Register a new transport and open the handshake on it.
    pub async fn on_connection_open(&self, extension: Arc<dyn ReplicationExtension>) -> Result<()> {
        let connection_id = extension.connection_id().clone();
        self.adapter.connection_opened(extension)?;

        for doc in self.documents() {
            let step1 = SyncMessage::SyncStep1(doc.encode_state_vector());
            let message = AdapterMessage::new(self.adapter.peer_id().clone(), doc.doc_name(), &step1);
            self.adapter.send_on_connection(&connection_id, &message).await?;
        }
        Ok(())
    }

    /// Handle one frame received on `connection_id`.
    pub async fn on_inbound(&self, connection_id: &ConnectionId, frame: &[u8]) -> Result<()> {
        let Some(inbound) = self.adapter.receive(connection_id, frame).await? else {
            return Ok(());
        };
        self.handle(inbound).await
    }

    async fn handle(&self, inbound: InboundMessage) -> Result<()> {
        let InboundMessage {
            message, new_peer, ..
        } = inbound;
        if new_peer {
            self.adapter.accept_peer(&message.sender_id)?;
        }

        let Some(doc) = self.document(&message.document_id) else {
            log::warn!(
                "Ignoring message from {} for unknown document {}",
                message.sender_id,
                message.document_id
            );
            return Ok(());
        };

        match message.sync_message()? {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = doc.encode_diff(&state_vector)?;
                let reply = AdapterMessage::new(
                    self.adapter.peer_id().clone(),
                    doc.doc_name(),
                    &SyncMessage::SyncStep2(diff),
                )
                .to(message.sender_id.clone());
                self.adapter.send(&reply).await?;
            }
            SyncMessage::SyncStep2(update) => {
                doc.apply_update(&update, UpdateOrigin::Sync)?;
            }
            SyncMessage::Update(update) => {
                doc.apply_update(&update, UpdateOrigin::Remote)?;
            }
        }
        Ok(())
    }

    /// Number of local updates waiting to be broadcast.
    pub fn pending_updates(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    /// Broadcast queued local updates to every connected peer.
    ///
    /// Returns the number of messages sent. A failed send is logged and
    /// skipped; the next handshake with that peer repairs the gap.
    pub async fn flush_local_updates(&self) -> Result<usize> {
        let updates: Vec<(String, Vec<u8>)> = self.outbox.lock().unwrap().drain(..).collect();
        if updates.is_empty() {
            return Ok(0);
        }

        let peers = self.adapter.connected_peers();
        let mut sent = 0;
        for (document_id, update) in &updates {
            let update = SyncMessage::Update(update.clone());
            for peer in &peers {
                let message = AdapterMessage::new(self.adapter.peer_id().clone(), document_id.as_str(), &update)
                    .to(peer.clone());
                match self.adapter.send(&message).await {
                    Ok(()) => sent += 1,
                    Err(e) => log::warn!("Update for {} not sent to {}: {}", document_id, peer, e),
                }
            }
        }
        Ok(sent)
    }

    pub fn on_connection_closed(&self, connection_id: &ConnectionId) -> Result<()> {
        self.adapter.connection_closed(connection_id)
    }

    /// Stop observing documents and close the adapter.
    pub fn close(&self) {
        self.subscriptions.lock().unwrap().clear();
        self.outbox.lock().unwrap().clear();
        self.adapter.close();
    }
}

impl std::fmt::Debug for DocumentReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentReplicator")
            .field("peer_id", self.adapter.peer_id())
            .field("documents", &self.document_ids())
            .finish()
    }
}

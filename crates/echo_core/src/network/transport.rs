//! Transport connections the network adapter sends through.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{EchoError, Result};
use crate::keys::ConnectionId;
use crate::storage::BoxFuture;

/// One byte-oriented connection to a remote peer.
///
/// Inbound frames are not read by the adapter itself: whoever owns the
/// transport hands them to [`EchoNetworkAdapter::receive`](super::EchoNetworkAdapter::receive).
pub trait ReplicationExtension: Send + Sync {
    fn connection_id(&self) -> &ConnectionId;

    /// Send one encoded frame.
    fn send<'a>(&'a self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// In-process connection for tests and local replication.
///
/// Frames sent on one end queue up in the other end's inbox until drained
/// with [`take_inbound`](Self::take_inbound).
#[derive(Debug, Clone)]
pub struct MemoryExtension {
    connection_id: ConnectionId,
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    outbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryExtension {
    /// Two connected ends, named `a` and `b`.
    pub fn pair(a: impl Into<ConnectionId>, b: impl Into<ConnectionId>) -> (Self, Self) {
        let a_inbox = Arc::new(Mutex::new(VecDeque::new()));
        let b_inbox = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let a = Self {
            connection_id: a.into(),
            inbox: Arc::clone(&a_inbox),
            outbox: Arc::clone(&b_inbox),
            closed: Arc::clone(&closed),
        };
        let b = Self {
            connection_id: b.into(),
            inbox: b_inbox,
            outbox: a_inbox,
            closed,
        };
        (a, b)
    }

    /// Frames received so far, oldest first.
    pub fn take_inbound(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().unwrap().drain(..).collect()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }

    /// Close both ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ReplicationExtension for MemoryExtension {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn send<'a>(&'a self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(EchoError::Remote(format!(
                    "connection {} is closed",
                    self.connection_id
                )));
            }
            self.outbox.lock().unwrap().push_back(frame.to_vec());
            Ok(())
        })
    }
}

/// Connection backed by an unbounded tokio channel.
///
/// The receiving half is returned from [`ChannelExtension::new`] for the
/// runtime integration to forward to the remote peer.
#[derive(Debug, Clone)]
pub struct ChannelExtension {
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelExtension {
    pub fn new(connection_id: impl Into<ConnectionId>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: connection_id.into(),
                sender,
            },
            receiver,
        )
    }
}

impl ReplicationExtension for ChannelExtension {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn send<'a>(&'a self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.sender.send(frame.to_vec()).map_err(|_| {
                EchoError::Remote(format!("connection {} receiver dropped", self.connection_id))
            })
        })
    }
}

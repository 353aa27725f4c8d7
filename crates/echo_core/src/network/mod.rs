//! Peer-to-peer replication of space documents.
//!
//! Layers, bottom up:
//!
//! - [`ReplicationExtension`]: one byte-oriented transport connection.
//! - [`AdapterMessage`] / [`SyncMessage`]: the y-sync wire format, framed with
//!   sender, optional target and document id.
//! - [`EchoNetworkAdapter`]: per-peer state (`Unconnected` → `Candidate` →
//!   `Replicating` → `Disconnected`) across any number of transports.
//! - [`DocumentReplicator`]: runs the handshake and broadcasts local edits.
//!
//! A [`NetworkDataMonitor`] can be attached to the adapter to observe traffic.

mod adapter;
mod monitor;
mod replicator;
mod transport;
mod wire;

pub use adapter::{EchoNetworkAdapter, InboundMessage, NetworkEvent, PeerState};
pub use monitor::{CountingMonitor, NetworkDataMonitor, NetworkStats};
pub use replicator::DocumentReplicator;
pub use transport::{ChannelExtension, MemoryExtension, ReplicationExtension};
pub use wire::{
    AdapterMessage, SyncMessage, read_var_byte_array, read_var_uint, write_var_byte_array,
    write_var_uint,
};

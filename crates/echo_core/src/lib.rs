#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]

/// Encode/decode services keyed by type name
pub mod codec;

/// Configuration options
pub mod config;

/// CRDT documents (root and linked docs, migration, update storage)
pub mod document;

/// Typed references
pub mod dxn;

/// Error (common error types)
pub mod error;

/// Per-peer append-only feeds
pub mod feed;

/// Identifier newtypes
pub mod keys;

/// Peer replication of documents
pub mod network;

/// Callback registries for change notifications
pub mod observer;

/// Feeds in, materialized objects out
pub mod pipeline;

/// Content-addressed space snapshots
pub mod snapshot;

/// Directory/file storage abstraction
pub mod storage;

/// Causal frontier (vector clock)
pub mod timeframe;

pub use error::{EchoError, Result};

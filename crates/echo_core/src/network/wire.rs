//! Wire format of replication messages.
//!
//! Every frame on a replication channel is an [`AdapterMessage`]:
//!
//! ```text
//! varByteArray(sender_id)
//! varUint(0 | 1) [varByteArray(target_id)]
//! varByteArray(document_id)
//! varByteArray(payload)
//! ```
//!
//! The payload is a y-sync message:
//!
//! - `varUint(0)`: sync message type
//!   - `varUint(0)`: SyncStep1, carries a state vector
//!   - `varUint(1)`: SyncStep2, carries the updates the receiver is missing
//!   - `varUint(2)`: Update, carries an incremental update
//!
//! Integers are varUints (7 bits per byte, MSB set on continuation) and byte
//! arrays are `varUint(length) + raw bytes`.

use crate::error::{EchoError, Result};
use crate::keys::PeerId;

// ===========================================================================
// VarUint encoding/decoding
// ===========================================================================

/// Append `num` as a varUint.
pub fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Returns (value, bytes_consumed), or `None` if the buffer is too short.
pub fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

pub fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Returns (data, bytes_consumed), or `None` if the buffer is too short.
pub fn read_var_byte_array(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let total = len_bytes.checked_add(usize::try_from(len).ok()?)?;
    if data.len() < total {
        return None;
    }
    Some((data[len_bytes..total].to_vec(), total))
}

/// Cursor over a frame being decoded.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn var_uint(&mut self, what: &str) -> Result<u64> {
        let (value, consumed) = read_var_uint(&self.data[self.offset..])
            .ok_or_else(|| truncated(what))?;
        self.offset += consumed;
        Ok(value)
    }

    fn bytes(&mut self, what: &str) -> Result<Vec<u8>> {
        let (value, consumed) = read_var_byte_array(&self.data[self.offset..])
            .ok_or_else(|| truncated(what))?;
        self.offset += consumed;
        Ok(value)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        String::from_utf8(self.bytes(what)?)
            .map_err(|_| EchoError::Remote(format!("{} is not valid UTF-8", what)))
    }

    fn is_done(&self) -> bool {
        self.offset >= self.data.len()
    }
}

fn truncated(what: &str) -> EchoError {
    EchoError::Remote(format!("truncated message: missing {}", what))
}

/// Message type bytes of the y-sync protocol.
mod msg_type {
    pub const SYNC: u64 = 0;
}

/// Sync sub-message types.
mod sync_type {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

/// A y-sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// The sender's state vector; the receiver answers with what's missing.
    SyncStep1(Vec<u8>),
    /// Updates the receiver was missing.
    SyncStep2(Vec<u8>),
    /// A live incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Format: `varUint(msgType) + varUint(syncType) + varByteArray(payload)`.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, update),
            SyncMessage::Update(update) => (sync_type::UPDATE, update),
        };
        log::debug!(
            "[Y-sync] Encoding {}, {} bytes",
            Self::kind_name(kind),
            payload.len()
        );
        let mut buf = Vec::with_capacity(2 + payload.len() + 5);
        write_var_uint(&mut buf, msg_type::SYNC);
        write_var_uint(&mut buf, kind);
        write_var_byte_array(&mut buf, payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let msg_type = reader.var_uint("message type")?;
        if msg_type != msg_type::SYNC {
            return Err(EchoError::Remote(format!(
                "unsupported message type {}",
                msg_type
            )));
        }

        let kind = reader.var_uint("sync type")?;
        let payload = reader.bytes("payload")?;
        log::debug!(
            "[Y-sync] Decoded {} with payload {} bytes",
            Self::kind_name(kind),
            payload.len()
        );

        match kind {
            sync_type::STEP1 => Ok(SyncMessage::SyncStep1(payload)),
            sync_type::STEP2 => Ok(SyncMessage::SyncStep2(payload)),
            sync_type::UPDATE => Ok(SyncMessage::Update(payload)),
            other => Err(EchoError::Remote(format!("unknown sync type {}", other))),
        }
    }

    fn kind_name(kind: u64) -> &'static str {
        match kind {
            sync_type::STEP1 => "SyncStep1",
            sync_type::STEP2 => "SyncStep2",
            sync_type::UPDATE => "Update",
            _ => "Unknown",
        }
    }
}

/// A frame exchanged between network adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterMessage {
    pub sender_id: PeerId,
    /// `None` for messages sent to whoever is on the other end of a connection.
    pub target_id: Option<PeerId>,
    pub document_id: String,
    /// An encoded [`SyncMessage`].
    pub payload: Vec<u8>,
}

impl AdapterMessage {
    pub fn new(sender_id: PeerId, document_id: impl Into<String>, message: &SyncMessage) -> Self {
        Self {
            sender_id,
            target_id: None,
            document_id: document_id.into(),
            payload: message.encode(),
        }
    }

    pub fn to(mut self, target_id: PeerId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn sync_message(&self) -> Result<SyncMessage> {
        SyncMessage::decode(&self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.sender_id.as_str().len() + self.document_id.len() + self.payload.len() + 16,
        );
        write_var_byte_array(&mut buf, self.sender_id.as_str().as_bytes());
        match &self.target_id {
            Some(target) => {
                write_var_uint(&mut buf, 1);
                write_var_byte_array(&mut buf, target.as_str().as_bytes());
            }
            None => write_var_uint(&mut buf, 0),
        }
        write_var_byte_array(&mut buf, self.document_id.as_bytes());
        write_var_byte_array(&mut buf, &self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let sender_id = PeerId::from(reader.string("sender id")?);
        let target_id = match reader.var_uint("target flag")? {
            0 => None,
            1 => Some(PeerId::from(reader.string("target id")?)),
            other => {
                return Err(EchoError::Remote(format!("invalid target flag {}", other)));
            }
        };
        let document_id = reader.string("document id")?;
        let payload = reader.bytes("payload")?;
        if !reader.is_done() {
            return Err(EchoError::Remote(format!(
                "{} trailing bytes after message",
                data.len() - reader.offset
            )));
        }

        Ok(Self {
            sender_id,
            target_id,
            document_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_boundaries() {
        for value in [0u64, 127, 128, 300, u32::MAX as u64, u64::MAX >> 1] {
            let mut buf = Vec::new();
            write_var_uint(&mut buf, value);
            assert_eq!(read_var_uint(&buf), Some((value, buf.len())));
        }
        assert_eq!(read_var_uint(&[0x80]), None);
    }

    #[test]
    fn test_sync_message_layout() {
        let encoded = SyncMessage::SyncStep1(vec![7, 8]).encode();
        assert_eq!(encoded, vec![0, 0, 2, 7, 8]);
        assert_eq!(
            SyncMessage::decode(&encoded).unwrap(),
            SyncMessage::SyncStep1(vec![7, 8])
        );
    }

    #[test]
    fn test_sync_message_rejects_unknown() {
        assert!(SyncMessage::decode(&[1, 0, 0]).is_err());
        assert!(SyncMessage::decode(&[0, 9, 0]).is_err());
        assert!(SyncMessage::decode(&[0, 2, 5, 1]).is_err());
    }

    #[test]
    fn test_adapter_message() {
        let message = AdapterMessage::new(
            PeerId::from("peer-a"),
            "root",
            &SyncMessage::Update(vec![1, 2, 3]),
        )
        .to(PeerId::from("peer-b"));
        let decoded = AdapterMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.sync_message().unwrap(),
            SyncMessage::Update(vec![1, 2, 3])
        );

        let untargeted = AdapterMessage::new(PeerId::from("a"), "d", &SyncMessage::SyncStep2(vec![]));
        assert_eq!(
            AdapterMessage::decode(&untargeted.encode()).unwrap().target_id,
            None
        );
    }

    #[test]
    fn test_adapter_message_rejects_garbage() {
        assert!(AdapterMessage::decode(&[]).is_err());
        let mut bytes = AdapterMessage::new(PeerId::from("a"), "d", &SyncMessage::Update(vec![1]))
            .encode();
        bytes.push(0);
        assert!(AdapterMessage::decode(&bytes).is_err());
    }
}

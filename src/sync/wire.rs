//! Anti-entropy wire format.
//!
//! All messages travel as opaque mesh payloads; the mesh frames them, the
//! codec here only lays out the body. Every message starts with a one-byte
//! type code followed by the sender's node id as a little-endian u32 at
//! bytes `[1..5)`. Remaining fields are little-endian and fixed-position
//! except the variable-length tails of bucket listings and value transfers.
//!
//! Malformed payloads decode to `None`; the sync manager drops them and
//! keeps going.

use crate::net::NodeId;
use bytes::BufMut;

pub const SYNC_INIT: u8 = 0x01;
pub const SYNC_REQ_NODE: u8 = 0x02;
pub const SYNC_REP_NODE: u8 = 0x03;
pub const SYNC_REQ_BUCKET: u8 = 0x04;
pub const SYNC_REP_BUCKET: u8 = 0x05;
pub const SYNC_GET_VAL: u8 = 0x06;
pub const SYNC_PUT_VAL: u8 = 0x07;

/// Children carried by a SYNC_REP_NODE reply.
pub const NODE_CHILDREN: usize = 16;

/// A decoded sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Gossip opener: the sender's Merkle root.
    Init { root: u64 },
    /// Ask for the 16 children of `(level, parent)`.
    ReqNode { level: u8, parent: u32 },
    /// The 16 child hashes of `(level, parent)`.
    RepNode {
        level: u8,
        parent: u32,
        children: [u64; NODE_CHILDREN],
    },
    /// Ask for the key listing of a divergent bucket.
    ReqBucket { bucket: u32 },
    /// Keys and byte-hashes in a bucket (tombstones included).
    RepBucket {
        bucket: u32,
        entries: Vec<(String, u64)>,
    },
    /// Ask for a key's value and metadata.
    GetVal { key: String },
    /// A key's metadata and value bytes (value empty for tombstones).
    PutVal {
        key: String,
        meta: Vec<u8>,
        value: Vec<u8>,
    },
}

/// A decoded message plus its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: NodeId,
    pub message: SyncMessage,
}

/// Encode a message from `sender` into a mesh payload.
pub fn encode(sender: NodeId, message: &SyncMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    match message {
        SyncMessage::Init { root } => {
            buf.put_u8(SYNC_INIT);
            buf.put_u32_le(sender);
            buf.put_u64_le(*root);
        }
        SyncMessage::ReqNode { level, parent } => {
            buf.put_u8(SYNC_REQ_NODE);
            buf.put_u32_le(sender);
            buf.put_u8(*level);
            buf.put_u32_le(*parent);
        }
        SyncMessage::RepNode {
            level,
            parent,
            children,
        } => {
            buf.put_u8(SYNC_REP_NODE);
            buf.put_u32_le(sender);
            buf.put_u8(*level);
            buf.put_bytes(0, 3);
            buf.put_u32_le(*parent);
            for child in children {
                buf.put_u64_le(*child);
            }
        }
        SyncMessage::ReqBucket { bucket } => {
            buf.put_u8(SYNC_REQ_BUCKET);
            buf.put_u32_le(sender);
            buf.put_u32_le(*bucket);
        }
        SyncMessage::RepBucket { bucket, entries } => {
            buf.put_u8(SYNC_REP_BUCKET);
            buf.put_u32_le(sender);
            buf.put_u32_le(*bucket);
            buf.put_u32_le(entries.len() as u32);
            for (key, hash) in entries {
                buf.put_u16_le(key.len() as u16);
                buf.put_slice(key.as_bytes());
                buf.put_u64_le(*hash);
            }
        }
        SyncMessage::GetVal { key } => {
            buf.put_u8(SYNC_GET_VAL);
            buf.put_u32_le(sender);
            buf.put_slice(key.as_bytes());
        }
        SyncMessage::PutVal { key, meta, value } => {
            buf.put_u8(SYNC_PUT_VAL);
            buf.put_u32_le(sender);
            buf.put_u16_le(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u16_le(meta.len() as u16);
            buf.put_slice(meta);
            buf.put_slice(value);
        }
    }
    buf
}

/// Decode a mesh payload. `None` for anything malformed.
pub fn decode(payload: &[u8]) -> Option<Envelope> {
    if payload.len() < 5 {
        return None;
    }
    let sender = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let body = &payload[5..];

    let message = match payload[0] {
        SYNC_INIT => SyncMessage::Init {
            root: read_u64(body, 0)?,
        },
        SYNC_REQ_NODE => SyncMessage::ReqNode {
            level: *body.first()?,
            parent: read_u32(body, 1)?,
        },
        SYNC_REP_NODE => {
            let level = *body.first()?;
            // Bytes 1..4 are padding.
            let parent = read_u32(body, 4)?;
            let mut children = [0u64; NODE_CHILDREN];
            for (i, child) in children.iter_mut().enumerate() {
                *child = read_u64(body, 8 + i * 8)?;
            }
            SyncMessage::RepNode {
                level,
                parent,
                children,
            }
        }
        SYNC_REQ_BUCKET => SyncMessage::ReqBucket {
            bucket: read_u32(body, 0)?,
        },
        SYNC_REP_BUCKET => {
            let bucket = read_u32(body, 0)?;
            let count = read_u32(body, 4)? as usize;
            let mut pos = 8;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let klen = read_u16(body, pos)? as usize;
                pos += 2;
                let key = read_str(body, pos, klen)?;
                pos += klen;
                let hash = read_u64(body, pos)?;
                pos += 8;
                entries.push((key, hash));
            }
            SyncMessage::RepBucket { bucket, entries }
        }
        SYNC_GET_VAL => SyncMessage::GetVal {
            key: String::from_utf8(body.to_vec()).ok()?,
        },
        SYNC_PUT_VAL => {
            let klen = read_u16(body, 0)? as usize;
            let mut pos = 2;
            let key = read_str(body, pos, klen)?;
            pos += klen;
            let mlen = read_u16(body, pos)? as usize;
            pos += 2;
            if pos + mlen > body.len() {
                return None;
            }
            let meta = body[pos..pos + mlen].to_vec();
            pos += mlen;
            let value = body[pos..].to_vec();
            SyncMessage::PutVal { key, meta, value }
        }
        _ => return None,
    };

    Some(Envelope { sender, message })
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(buf: &[u8], pos: usize) -> Option<u64> {
    let bytes = buf.get(pos..pos + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

fn read_str(buf: &[u8], pos: usize, len: usize) -> Option<String> {
    let bytes = buf.get(pos..pos + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

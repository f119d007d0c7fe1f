//! Document buffer.
//!
//! The engine stores every value as an opaque, value-semantic byte buffer
//! with an optional typed view: a buffer either holds a serialised JSON
//! document (object or array, canonically encoded with sorted object keys)
//! or raw binary bytes. The buffer's FNV-1a-64 byte-hash is its canonical
//! identity for replication, so canonical encoding matters: two nodes that
//! store the same document must produce the same bytes.
//!
//! Buffers are cheap to clone (`Arc`-backed) and copy-on-write on the
//! mutate path, so `get` can hand out clones without copying and a reader
//! never observes a half-mutated document.

use crate::engine::merkle::fnv1a_64;
use serde_json::{Map, Value};
use std::sync::Arc;

/// An immutable-by-default document buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocBuffer {
    bytes: Arc<Vec<u8>>,
}

impl Default for DocBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl DocBuffer {
    /// The empty buffer. Stored in place of a deleted value (tombstone).
    pub fn empty() -> Self {
        Self {
            bytes: Arc::new(Vec::new()),
        }
    }

    /// Adopt raw bytes without interpretation.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    /// Build a buffer from a request body.
    ///
    /// Bodies starting with `{` or `[` are parsed as JSON and stored
    /// canonically re-serialised; anything else (including JSON that fails
    /// to parse) is stored verbatim as binary.
    pub fn from_body(body: &[u8]) -> Self {
        if matches!(body.first(), Some(b'{') | Some(b'[')) {
            if let Ok(value) = serde_json::from_slice::<Value>(body) {
                return Self::from_value(&value);
            }
        }
        Self::from_bytes(body.to_vec())
    }

    /// Canonically encode a JSON value.
    pub fn from_value(value: &Value) -> Self {
        Self::from_bytes(serde_json::to_vec(value).unwrap_or_default())
    }

    /// Whether the buffer is empty (absent value or tombstone).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw byte view.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// FNV-1a-64 over the buffer bytes; the identity used by the Merkle
    /// summary and by bucket diffing.
    pub fn byte_hash(&self) -> u64 {
        fnv1a_64(&self.bytes)
    }

    /// Parse the buffer as JSON, if it holds a document.
    fn value(&self) -> Option<Value> {
        if self.bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.bytes).ok()
    }

    /// Read an integer field of the root object.
    ///
    /// Accepts integers encoded as floats for interop with JSON-only
    /// producers.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.value()?.get(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Read a float field of the root object.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.value()?.get(field)?.as_f64()
    }

    /// Read a bool field of the root object.
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.value()?.get(field)?.as_bool()
    }

    /// Read a string field of the root object.
    pub fn get_str(&self, field: &str) -> Option<String> {
        self.value()?
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Set an integer field in the root object.
    ///
    /// A buffer that does not currently hold a JSON object (empty,
    /// binary, or an array) is replaced by a fresh single-field object.
    pub fn set_i64(&mut self, field: &str, value: i64) {
        self.set_field(field, Value::from(value));
    }

    /// Set a string field in the root object.
    pub fn set_str(&mut self, field: &str, value: &str) {
        self.set_field(field, Value::from(value));
    }

    fn set_field(&mut self, field: &str, value: Value) {
        let mut object = match self.value() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        object.insert(field.to_owned(), value);
        *self = Self::from_value(&Value::Object(object));
    }

    /// Render the document as a JSON string, if it holds one.
    pub fn to_json_string(&self) -> Option<String> {
        let value = self.value()?;
        serde_json::to_string(&value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bodies_are_canonicalised() {
        let a = DocBuffer::from_body(b"{\"b\":2,\"a\":1}");
        let b = DocBuffer::from_body(b"{ \"a\" : 1, \"b\" : 2 }");
        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.byte_hash(), b.byte_hash());
    }

    #[test]
    fn non_json_bodies_are_stored_verbatim() {
        let buf = DocBuffer::from_body(b"\x00\x01binary");
        assert_eq!(buf.bytes(), b"\x00\x01binary");
        assert!(buf.get_i64("x").is_none());
    }

    #[test]
    fn malformed_json_falls_back_to_binary() {
        let buf = DocBuffer::from_body(b"{not json");
        assert_eq!(buf.bytes(), b"{not json");
    }

    #[test]
    fn typed_reads() {
        let buf = DocBuffer::from_body(b"{\"age\":20,\"name\":\"ada\",\"ok\":true,\"score\":0.5}");
        assert_eq!(buf.get_i64("age"), Some(20));
        assert_eq!(buf.get_str("name").as_deref(), Some("ada"));
        assert_eq!(buf.get_bool("ok"), Some(true));
        assert_eq!(buf.get_f64("score"), Some(0.5));
        assert_eq!(buf.get_i64("missing"), None);
    }

    #[test]
    fn json_rendering_round_trips() {
        let buf = DocBuffer::from_body(b"{\"b\":2,\"a\":1}");
        assert_eq!(buf.to_json_string().as_deref(), Some("{\"a\":1,\"b\":2}"));
        assert_eq!(DocBuffer::from_bytes(b"raw".to_vec()).to_json_string(), None);
    }

    #[test]
    fn integers_encoded_as_floats_are_accepted() {
        let buf = DocBuffer::from_body(b"{\"ts\":1700000000000001.0}");
        assert_eq!(buf.get_i64("ts"), Some(1_700_000_000_000_001));
    }

    #[test]
    fn set_field_is_copy_on_write() {
        let original = DocBuffer::from_body(b"{\"age\":20}");
        let mut patched = original.clone();
        patched.set_i64("age", 21);

        assert_eq!(original.get_i64("age"), Some(20));
        assert_eq!(patched.get_i64("age"), Some(21));
        assert_ne!(original.byte_hash(), patched.byte_hash());
    }

    #[test]
    fn set_on_empty_buffer_creates_an_object() {
        let mut buf = DocBuffer::empty();
        buf.set_str("status", "active");
        assert_eq!(buf.get_str("status").as_deref(), Some("active"));
    }

    #[test]
    fn empty_buffer_hash_differs_from_value_hash() {
        let tomb = DocBuffer::empty();
        let val = DocBuffer::from_body(b"{\"a\":1}");
        assert_ne!(tomb.byte_hash(), val.byte_hash());
    }
}

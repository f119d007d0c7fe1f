//! Durable storage: the write-ahead log.

pub mod wal;

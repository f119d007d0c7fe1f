//! Cluster control: the consistent-hash routing table.

pub mod ring;

//! Metis - a distributed store for large numbers of small and medium
//! immutable objects (images, static assets), served over HTTP.
//!
//! A deployment has two process kinds. **Storage** nodes
//! ([`storage`]) persist object bytes in packed append-only slice
//! files and speak a compact binary command protocol ([`wire`]).
//! **Manager** nodes ([`manager`]) own the placement index mapping
//! key ranges to storage replicas and front the HTTP/WebDAV traffic,
//! fanning commands out to replicas and resolving versions by
//! modification ordinal (last writer wins).
//!
//! Objects are immutable: every write appends, deletes are
//! tombstones, and a slice index can always be rebuilt from its data
//! file after a crash.

pub mod config;
pub mod manager;
pub mod storage;
pub mod tools;
pub mod types;
pub mod wire;

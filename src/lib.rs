//! UsenetSync - a private, versioned, encrypted filesystem on Usenet
//!
//! UsenetSync treats an NNTP article store as a write-once, immutable blob
//! substrate and layers on top of it:
//! - Versioned folder indexing with content-hash deltas
//! - Fixed-size encrypted segments with small-file packing and redundancy
//! - Fully obfuscated posting (random subjects, randomized message ids)
//! - Durable upload/download queues with resume across restarts
//! - Encrypted, signed core indexes published under three access tiers

pub mod config;
pub mod crypto;
pub mod download;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod publish;
pub mod segmenter;
pub mod store;
pub mod types;
pub mod upload;
pub mod wire;

pub use error::{Error, Result};

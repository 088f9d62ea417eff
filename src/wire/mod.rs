//! Wire layer
//!
//! The only component allowed to open sockets. Provides the NNTP protocol
//! client, TLS-wrapped connection pool with per-server reputation, yEnc
//! framing, rotated posting personas, and the retry policy. The article
//! transport trait is the seam between article formatting and the actual
//! substrate; tests run against the in-memory transport.

pub mod client;
pub mod headers;
pub mod nntp;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod yenc;

pub use client::{NntpTransport, WireClient};
pub use nntp::Credentials;
pub use pool::{ConnectionPool, ServerHealth};
pub use transport::{Article, ArticleTransport, MemoryTransport, PostOutcome};

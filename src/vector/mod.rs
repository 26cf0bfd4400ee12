//! In-memory vector search: the standalone server process, its client,
//! and the shared cosine index.

pub mod client;
pub mod index;
pub mod server;

pub use client::VectorClient;
pub use index::VectorIndex;

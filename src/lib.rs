// filemesh - peer-to-peer content-addressed encrypted file storage.
//
// Each node exposes the same key/value file interface over its local disk
// and over a mesh of connected peers. A store replicates an encrypted
// stream to every peer; a get falls back to broadcasting a query and
// draining whichever peer holds the file. Connections carry two kinds of
// frames on one TCP stream: discrete control messages and raw stream
// bodies, kept apart by a one-byte tag and a per-peer stream barrier.

// Core storage and crypto
pub mod crypto;       // AES-256-CTR streaming encryption, key and node-id generation
pub mod storage;      // Content-addressed on-disk layout and streaming file ops

// Network and P2P communication
pub mod protocol;     // Frame tags, transport records, message codec
pub mod transport;    // TCP connection lifecycle, read loop, stream barrier
pub mod server;       // File server: peer registry, event loop, store/get orchestration

// System configuration and utilities
pub mod cli;          // Command line argument parsing
pub mod config;       // TOML-backed configuration with defaults
pub mod error;        // Crate-wide error types
pub mod logging;      // Structured logging setup

pub use crypto::{copy_decrypt, copy_encrypt, new_encryption_key};
pub use error::{MeshError, MeshResult};
pub use protocol::{Message, Rpc};
pub use server::{FileServer, FileServerConfig};
pub use storage::{cas_path_transform, PathKey, Storage, StorageConfig};
pub use transport::{TcpPeer, TcpTransport, TcpTransportConfig};

/// Error types shared across the filemesh crate.
///
/// Every fallible operation in the library returns [`MeshResult`]. The
/// variants map to the failure classes the server distinguishes: only a
/// listener bind failure is fatal to a node, everything else is contained
/// at the connection or request level.
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// File system or socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The listener could not be bound; the server does not start.
    #[error("failed to bind listener on {addr}: {source}")]
    Listen { addr: String, source: io::Error },

    /// Message payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The pluggable handshake rejected a connection.
    #[error("handshake with {0} rejected")]
    Handshake(String),

    /// A message referenced a peer that is not in the registry.
    #[error("peer {0} is not registered")]
    PeerNotFound(String),

    /// The requested key is not held locally (and, for a network fetch,
    /// no peer produced it either).
    #[error("key {0} not found")]
    KeyNotFound(String),

    /// Invalid or unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level misuse or failure outside ordinary socket I/O.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result alias used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;

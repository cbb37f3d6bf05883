//! Error types for bridge operations.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by transport and channel operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error on a connection, listener, or service stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer broke a wire-protocol invariant; the transport is dead.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport has no live connection.
    #[error("transport is offline")]
    Offline,
}

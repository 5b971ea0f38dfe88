//! Error types for the key-value server
//!
//! Mirrors the shape of a typical ambient error enum: one variant per failure
//! class, each carrying a message and, where it wraps a lower-level error, a
//! `#[from]` source so `?` composes across module boundaries.

use thiserror::Error;

/// Top-level error type used across the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed input on the wire. Fatal to the connection that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Startup or runtime I/O failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// `--dir`/`--dbfilename`/`--replicaof` validation failures.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// On-disk snapshot could not be parsed.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn snapshot<S: Into<String>>(message: S) -> Self {
        Self::Snapshot(message.into())
    }
}

//! Error types for instrumental-core

use thiserror::Error;

/// Main error type for the instrumental-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Transport handle could not be created
    #[error("transport creation failed: {0}")]
    TransportCreation(String),

    /// Connection attempt failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for instrumental-core
pub type Result<T> = std::result::Result<T, Error>;

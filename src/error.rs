//! Error types for the traffic ranking system
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`TrafficError`] enum covers every failure the library can report:
//! - Input errors (unreadable file, malformed record)
//! - Configuration errors (zero queue capacity, too few processes)
//! - Protocol and transport errors between coordinator and workers
//! - Queue shutdown while a producer is still pushing
//!
//! # Example
//!
//! ```rust,ignore
//! use traffic_rank::{ingest, TrafficError};
//!
//! match ingest::read_events(path, format, policy).await {
//!     Ok(batch) => { /* dispatch */ },
//!     Err(TrafficError::InputUnavailable { path, .. }) => {
//!         eprintln!("cannot read {}", path.display());
//!     },
//!     Err(e) => eprintln!("unexpected error: {}", e),
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Traffic ranking error type
///
/// # Variants
///
/// * `InputUnavailable` - The input file is missing or unreadable
/// * `Parse` - A record could not be parsed into a traffic event
/// * `ConfigError` - Invalid configuration (e.g., fewer than two processes)
/// * `Protocol` - A peer sent a frame that does not match the expected sequence
/// * `Transport` - The underlying channel or socket failed
/// * `QueueClosed` - The bounded queue was closed while an item was being put
/// * `Other` - Catch-all for unexpected errors
#[derive(Error, Debug)]
pub enum TrafficError {
    /// Input file missing or unreadable
    #[error("Input unavailable: {}: {source}", .path.display())]
    InputUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed input record
    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Queue closed
    #[error("Queue is closed, not accepting new items")]
    QueueClosed,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for TrafficError {
    fn from(err: std::io::Error) -> Self {
        TrafficError::Transport(err.to_string())
    }
}

/// Result type alias using TrafficError
pub type Result<T> = std::result::Result<T, TrafficError>;

//! Error types for tarang-server
//!
//! # Error Recovery Strategies
//!
//! ## Fatal Errors (Abort Startup)
//!
//! - **`Config`**: The configuration file is missing a required attribute or
//!   is not well-formed XML. Fix the configuration and restart.
//! - **`Io`** during bind: the listening socket could not be created. Another
//!   process probably owns the port.
//!
//! ## Transient Errors (Retry or Skip)
//!
//! - **`Io`** on a client socket: sends are retried a bounded number of
//!   times; a persistently dead socket evicts the client, the server keeps
//!   running.
//! - **`Item`**: a buffer lookup missed (too early, too late, evicted, or
//!   rejected write). Callers recover by adjusting the requested timestamp
//!   or dropping the sample. Never fatal.
//!
//! ## Protocol Errors (Log and Continue)
//!
//! - **`Protocol`**: a malformed inbound message (bad header, CRC mismatch,
//!   undecodable body). The message is skipped; the connection is retained.

use thiserror::Error;

/// Outcome of a timestamped-buffer lookup or write that did not produce an
/// item. All variants are recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ItemError {
    /// The buffer holds no items, or no item matches the query.
    #[error("item not found")]
    NotFound,
    /// The requested time is newer than the latest stored item.
    #[error("item not available yet")]
    NotAvailableYet,
    /// The requested item has been overwritten by newer data.
    #[error("item not available anymore")]
    NotAvailableAnymore,
    /// Write rejected: timestamp did not increase.
    #[error("timestamp regression")]
    TimestampRegression,
    /// Write rejected: image format differs from the buffer's.
    #[error("image format mismatch")]
    InvalidFormat,
    /// The buffer was configured with zero capacity.
    #[error("buffer capacity is zero")]
    CapacityZero,
    /// The gap between the enclosing items is too large to interpolate.
    #[error("items too far apart to interpolate")]
    NonInterpolable,
}

/// Errors that can occur in tarang-server
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Item(#[from] ItemError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

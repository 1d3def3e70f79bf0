//! Error types shared across the crate
//!
//! ClientHello parsing and the persistent store get typed errors; everything
//! at the binary surface (startup, task plumbing) uses `anyhow`.

use thiserror::Error;

/// ClientHello parse error. The listener maps any of these to an empty
/// digest and lets the handshake proceed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Ja3Error {
    #[error("buffer too short: {0} bytes")]
    TooShort(usize),

    #[error("not a handshake record: 0x{0:02x}")]
    NotHandshake(u8),

    #[error("record truncated: declared {declared}, have {have}")]
    Truncated { declared: usize, have: usize },

    #[error("not a ClientHello: 0x{0:02x}")]
    NotClientHello(u8),

    #[error("malformed ClientHello at {0}")]
    Malformed(&'static str),
}

/// Persistent store error. Allow-list mutations surface these to the admin
/// API as HTTP 500; log-append failures are dropped on the request path.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

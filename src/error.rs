//! Error types for the leasing client and server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Errors that can occur while encoding, decoding, or running the protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message field violates the wire format.
    ///
    /// Raised by the codec for a bad op or htype, a wrong-length hardware
    /// address, an oversized text field, a bad cookie, or truncated options.
    #[error("Malformed message: {field}: {reason}")]
    MalformedMessage { field: &'static str, reason: String },

    /// A required option code is not present in the options list.
    #[error("Option {0} not found")]
    OptionNotFound(u8),

    /// The encoded options do not fit in the options region.
    #[error("Options need {size} bytes but the region holds {capacity}")]
    OptionsOverflow { size: usize, capacity: usize },

    /// An option could not be constructed (reserved code or content too long).
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// No unleased address became available within the allotted wait budget.
    #[error("No available addresses in pool")]
    PoolExhausted,

    /// The requested address is leased to a different owner.
    ///
    /// The server answers this with a NAK; it never leaves the accept loop.
    #[error("Address {address} is leased to another client")]
    OwnershipConflict { address: Ipv4Addr },

    /// A lease cannot be committed to an all-zero hardware address.
    #[error("Cannot lease {address} to an empty hardware address")]
    MissingOwner { address: Ipv4Addr },

    /// The requested address is not part of the pool.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// No correlated reply arrived before the deadline.
    #[error("Timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    /// The client gave up after exhausting its restart budget.
    #[error("Failed to acquire a lease after {attempts} attempt(s): {reason}")]
    AcquisitionFailed { attempts: u32, reason: String },

    /// The server answered a REQUEST with a NAK.
    #[error("Server {server} refused the request for {address}")]
    Nak { server: Ipv4Addr, address: Ipv4Addr },

    /// A renew or release was attempted without a bound lease.
    #[error("Client holds no lease")]
    NotBound,

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., pool_start > pool_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),
}

impl Error {
    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            field,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for leasing operations.
pub type Result<T> = std::result::Result<T, Error>;

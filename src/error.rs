//! Error types for the DHCP engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Inbound datagrams that fail
//! validation are reported as [`Error::Rejected`] internally and never
//! surface to the caller of the message handler as a fault.

use std::net::Ipv4Addr;

use crate::packet::Rejection;

/// Errors that can occur while running the DHCP engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An inbound datagram failed decoding or validation.
    ///
    /// The message handler drops such datagrams and reports them as not
    /// handled.
    #[error("Rejected datagram: {0}")]
    Rejected(#[from] Rejection),

    /// The IP address pool is exhausted.
    ///
    /// Every address in the pool is offered, bound, or quarantined after
    /// a DECLINE.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// The address is already offered to or bound by another client.
    #[error("Address {address} is held by client {holder}")]
    Conflict {
        /// The contested address.
        address: Ipv4Addr,
        /// The client currently holding the address.
        holder: String,
    },

    /// The address was declined by a client and is still quarantined.
    #[error("Address {0} was declined and is quarantined")]
    AddressDeclined(Ipv4Addr),

    /// Requested IP address is outside the configured pool.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// No active lease exists for the client at the given address.
    #[error("Client {client} holds no lease on {address}")]
    LeaseNotFound {
        /// The client that asked for the operation.
        client: String,
        /// The address named in the request.
        address: Ipv4Addr,
    },

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and at
    /// server construction. No server is created when this is returned.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The server is already attached to an event loop.
    #[error("Server is already attached to an event loop")]
    AlreadyAttached,

    /// The server is already running.
    #[error("Server is already running")]
    AlreadyRunning,
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for address handling.

use std::io;

use thiserror::Error;

use crate::address::AddressFamily;

/// Errors produced while parsing or resolving an address string.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The address string is longer than the parser accepts.
    #[error("{prefix}...: address too long ({len} bytes, max {max})")]
    TooLong {
        /// Leading characters of the rejected input.
        prefix: String,
        /// Length of the rejected input.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// No host was given and the lookup is not for bind intent.
    #[error("{address}: missing host")]
    EmptyHost {
        /// The offending address string.
        address: String,
    },

    /// The port token is not a decimal port number.
    #[error("{address}: invalid port {port:?}")]
    InvalidPort {
        /// The offending address string.
        address: String,
        /// The port token that failed to parse.
        port: String,
    },

    /// A host name was given where only IP literals are accepted.
    #[error("{address}: not a numeric IP address")]
    NotNumeric {
        /// The offending address string.
        address: String,
    },

    /// The platform resolver failed.
    #[error("{address}: {source}")]
    Resolve {
        /// The offending address string.
        address: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but nothing matched the family constraint.
    #[error("{address}: no {family} address")]
    NoCandidates {
        /// The offending address string.
        address: String,
        /// The family constraint that filtered every candidate.
        family: AddressFamily,
    },
}

/// Result type for address operations.
pub type AddressResult<T> = Result<T, AddressError>;

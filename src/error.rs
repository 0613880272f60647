//! Error types for IPbus communication with FIT electronics.
//!
//! Every error belongs to exactly one [`ErrorKind`]:
//!
//! | Kind | Meaning |
//! |------|---------|
//! | [`ErrorKind::Network`] | The target did not answer (timeout, unreachable host, socket failure) |
//! | [`ErrorKind::Bus`] | The answer is malformed or does not belong to the request |
//! | [`ErrorKind::Logic`] | The answer is well-formed but semantically wrong, or a local precondition failed |

use std::io;
use thiserror::Error;

/// Result type alias for IPbus operations.
pub type Result<T> = std::result::Result<T, FitError>;

/// Category of a [`FitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport timeout or unreachable host.
    Network,
    /// Malformed or mismatched response.
    Bus,
    /// Semantically invalid response or rejected request.
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "Network error"),
            ErrorKind::Bus => write!(f, "IPbus error"),
            ErrorKind::Logic => write!(f, "Logic error"),
        }
    }
}

/// Errors that can occur while talking to the board.
#[derive(Debug, Error)]
pub enum FitError {
    /// No response within the transport timeout.
    #[error("no response from target within timeout")]
    Timeout,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Response failed a protocol-level sanity check.
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// Description of the response error.
        reason: String,
    },

    /// Packet id of the response does not match the request.
    #[error("packet id mismatch: expected 0x{expected:04X}, received 0x{received:04X}")]
    PacketIdMismatch {
        /// Packet id sent.
        expected: u16,
        /// Packet id received.
        received: u16,
    },

    /// Transaction id of the response does not match the request.
    #[error("transaction id mismatch: expected 0x{expected:03X}, received 0x{received:03X}")]
    TransactionIdMismatch {
        /// Transaction id sent.
        expected: u16,
        /// Transaction id received.
        received: u16,
    },

    /// Response carries a different number of words than declared or requested.
    #[error("word count mismatch: expected {expected}, received {received}")]
    WordCountMismatch {
        /// Expected word count.
        expected: usize,
        /// Received word count.
        received: usize,
    },

    /// The device executed the transaction but reported a bus error.
    #[error("device reported info code 0x{info_code:X} at address 0x{address:08X}")]
    DeviceError {
        /// Info code from the transaction header.
        info_code: u8,
        /// Register address of the failed transaction.
        address: u32,
    },

    /// Well-formed response for a different kind of transaction.
    #[error("unexpected transaction type in response: expected {expected}, received {received}")]
    UnexpectedTransaction {
        /// Type id that was requested.
        expected: u8,
        /// Type id that came back.
        received: u8,
    },

    /// Invalid parameter rejected before anything was sent.
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// Target address does not match the dotted-quad grammar.
    #[error("{address}: invalid IP address")]
    InvalidAddress {
        /// Address as supplied.
        address: String,
    },
}

impl FitError {
    /// Returns the taxonomy category of this error.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::{ErrorKind, FitError};
    ///
    /// assert_eq!(FitError::Timeout.kind(), ErrorKind::Network);
    /// assert_eq!(FitError::invalid_response("short").kind(), ErrorKind::Bus);
    /// assert_eq!(FitError::invalid_parameter("bcid", "too big").kind(), ErrorKind::Logic);
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            FitError::Timeout | FitError::Io(_) => ErrorKind::Network,
            FitError::InvalidResponse { .. }
            | FitError::PacketIdMismatch { .. }
            | FitError::TransactionIdMismatch { .. }
            | FitError::WordCountMismatch { .. }
            | FitError::DeviceError { .. } => ErrorKind::Bus,
            FitError::UnexpectedTransaction { .. }
            | FitError::InvalidParameter { .. }
            | FitError::InvalidAddress { .. } => ErrorKind::Logic,
        }
    }

    /// Creates a new `InvalidResponse` error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::FitError;
    ///
    /// let err = FitError::invalid_parameter("bcid", "must not exceed 4095");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidAddress` error.
    pub fn invalid_address(address: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
        }
    }

    /// Creates a new `PacketIdMismatch` error.
    pub fn packet_id_mismatch(expected: u16, received: u16) -> Self {
        Self::PacketIdMismatch { expected, received }
    }

    /// Creates a new `WordCountMismatch` error.
    pub fn word_count_mismatch(expected: usize, received: usize) -> Self {
        Self::WordCountMismatch { expected, received }
    }
}

/// Errors raised while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read or written.
    #[error("settings I/O error: {0}")]
    Io(#[from] io::Error),

    /// Settings file is not valid TOML for [`Settings`](crate::Settings).
    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    /// A value parsed but is not usable.
    #[error("invalid setting '{field}': {reason}")]
    Validation {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

//! Error types for the DCE/RPC engine

use std::io;
use thiserror::Error;

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// PDU is truncated or its header disagrees with the buffer
    #[error("Malformed PDU at offset {offset}: {reason}")]
    MalformedPdu { offset: usize, reason: String },

    /// NDR stream is truncated or inconsistent
    #[error("Malformed NDR at offset {offset}: {reason}")]
    MalformedNdr { offset: usize, reason: String },

    /// Packet type tag not known to this implementation
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// No handler registered for the operation number
    #[error("Unsupported operation: opnum {0}")]
    UnsupportedOperation(u16),

    /// Fragment sequence for a call is inconsistent
    #[error("Fragment reassembly error: {0}")]
    Reassembly(String),

    /// Fragment stream ended before the last fragment arrived
    #[error("Call {call_id} ended without a last fragment")]
    IncompleteCall { call_id: u32 },

    /// The server refused the presentation context
    #[error("Bind rejected: result {result}, reason {reason}")]
    BindRejected { result: u16, reason: u16 },

    /// The server refused the association
    #[error("Bind refused with bind_nak, reason {reason}")]
    BindNak { reason: u16 },

    /// The server answered a call with a fault PDU
    #[error("RPC fault: status 0x{status:08x}")]
    Fault { status: u32 },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout occurred
    #[error("Operation timed out")]
    Timeout,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub(crate) fn malformed_pdu(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedPdu {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_ndr(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedNdr {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether the error came from decoding wire data
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedPdu { .. } | Error::MalformedNdr { .. } | Error::UnknownPacketType(_)
        )
    }
}

/// Win32 status codes returned in the WERROR slot of service responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WError {
    /// The operation completed successfully
    Success = 0,
    /// Access denied
    AccessDenied = 5,
    /// The parameter is incorrect
    InvalidParameter = 87,
    /// The information level is not supported
    InvalidLevel = 124,
    /// More entries are available
    MoreData = 234,
    /// The share name does not exist
    NetNameNotFound = 2310,
}

impl WError {
    /// Create from a raw u32 value, if known
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(WError::Success),
            5 => Some(WError::AccessDenied),
            87 => Some(WError::InvalidParameter),
            124 => Some(WError::InvalidLevel),
            234 => Some(WError::MoreData),
            2310 => Some(WError::NetNameNotFound),
            _ => None,
        }
    }

    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == WError::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_werror_from_u32() {
        assert_eq!(WError::from_u32(0), Some(WError::Success));
        assert_eq!(WError::from_u32(124), Some(WError::InvalidLevel));
        assert_eq!(WError::from_u32(2310), Some(WError::NetNameNotFound));
        assert_eq!(WError::from_u32(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_decode_error_classification() {
        assert!(Error::malformed_ndr(4, "short").is_decode_error());
        assert!(Error::UnknownPacketType(99).is_decode_error());
        assert!(!Error::Timeout.is_decode_error());
    }

    #[test]
    fn test_error_display_carries_offset() {
        let err = Error::malformed_pdu(16, "fragment length exceeds buffer");
        let display = format!("{}", err);
        assert!(display.contains("offset 16"));
        assert!(display.contains("fragment length"));
    }
}

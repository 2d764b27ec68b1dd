//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// USB/IP message carried an unknown OP or URB command code
    #[error("Unknown USB/IP command: {0:#010x}")]
    UnknownCommand(u32),

    /// USB/IP OP header carried an unexpected protocol version
    #[error("Unsupported USB/IP version: {0:#06x}")]
    UnsupportedVersion(u16),

    /// A fixed-width string field did not fit its wire slot
    #[error("Field '{field}' too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Management request exceeded the frame bound before its NUL terminator
    #[error("Request too large: {size} bytes (max {max})")]
    RequestTooLarge { size: usize, max: usize },

    /// Management request was not valid UTF-8 or had an empty path
    #[error("Malformed request: {0}")]
    MalformedRequest(&'static str),

    /// JSON encode/decode error from serde_json
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownCommand(0x8006);
        assert!(format!("{}", err).contains("0x00008006"));

        let err = ProtocolError::RequestTooLarge {
            size: 70_000,
            max: 65_536,
        };
        assert!(format!("{}", err).contains("70000"));
    }
}

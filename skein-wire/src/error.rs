//! Codec errors.

use skein_core::ClientError;
use thiserror::Error;

/// Result type for codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while encoding or decoding v0 frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Not enough bytes to decode the value at the cursor.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A structurally invalid value.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// The field or structure that was invalid.
        what: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Per-message checksum mismatch.
    #[error("crc mismatch at offset {offset}: wire {wire:#010x}, computed {computed:#010x}")]
    Crc {
        /// Offset of the corrupt message.
        offset: i64,
        /// Checksum carried on the wire.
        wire: u32,
        /// Checksum computed over the received bytes.
        computed: u32,
    },

    /// A compression codec failed, or an unsupported codec was requested.
    #[error("compression error: {reason}")]
    Compression {
        /// What went wrong.
        reason: String,
    },
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Crc {
                offset,
                wire,
                computed,
            } => Self::Crc {
                offset,
                wire,
                computed,
            },
            other => Self::Protocol {
                message: other.to_string(),
            },
        }
    }
}

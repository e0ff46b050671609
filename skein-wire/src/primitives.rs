//! Kafka protocol primitives.
//!
//! Strings carry an i16 length; byte blobs carry an i32 length; `-1` encodes
//! null for both. All integers are big-endian. Decoders check remaining
//! length before every read so a truncated frame surfaces as
//! `InsufficientData` instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// Writes an i16-length-prefixed string.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    // Safe cast: client ids and topic names are far below i16::MAX.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.put_i16(value.len() as i16);
    buf.put_slice(value.as_bytes());
}

/// Writes an i32-length-prefixed byte blob; `None` encodes as length `-1`.
pub fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            // Safe cast: blob sizes are bounded by the frame size limit.
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32(-1),
    }
}

fn check(buf: &Bytes, need: usize) -> WireResult<()> {
    if buf.remaining() < need {
        return Err(WireError::InsufficientData {
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

/// Reads an i16.
///
/// # Errors
/// `InsufficientData` if fewer than 2 bytes remain.
pub fn get_i16(buf: &mut Bytes) -> WireResult<i16> {
    check(buf, 2)?;
    Ok(buf.get_i16())
}

/// Reads an i32.
///
/// # Errors
/// `InsufficientData` if fewer than 4 bytes remain.
pub fn get_i32(buf: &mut Bytes) -> WireResult<i32> {
    check(buf, 4)?;
    Ok(buf.get_i32())
}

/// Reads an i64.
///
/// # Errors
/// `InsufficientData` if fewer than 8 bytes remain.
pub fn get_i64(buf: &mut Bytes) -> WireResult<i64> {
    check(buf, 8)?;
    Ok(buf.get_i64())
}

/// Reads an array length, rejecting negative counts.
///
/// # Errors
/// `InsufficientData` on a short buffer, `Malformed` on a negative count.
pub fn get_array_len(buf: &mut Bytes) -> WireResult<usize> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(WireError::Malformed {
            what: "array length",
            reason: "negative",
        });
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(len as usize)
}

/// Reads an i16-length-prefixed string.
///
/// # Errors
/// `InsufficientData` on a short buffer, `Malformed` on a negative length or
/// invalid UTF-8.
pub fn get_string(buf: &mut Bytes) -> WireResult<String> {
    let len = get_i16(buf)?;
    if len < 0 {
        return Err(WireError::Malformed {
            what: "string length",
            reason: "negative",
        });
    }
    #[allow(clippy::cast_sign_loss)]
    let len = len as usize;
    check(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed {
        what: "string",
        reason: "invalid utf-8",
    })
}

/// Reads `len` raw bytes as a zero-copy slice of the frame.
///
/// # Errors
/// `InsufficientData` if fewer than `len` bytes remain.
pub fn take_bytes(buf: &mut Bytes, len: usize) -> WireResult<Bytes> {
    check(buf, len)?;
    Ok(buf.split_to(len))
}

//! Frame and header layer.
//!
//! Every request and response travels as a big-endian i32 size followed by
//! that many payload bytes. Request payloads open with the v0 request header;
//! response payloads open with the echoed correlation id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};
use crate::primitives;

/// Size of the length prefix on every frame.
pub const FRAME_HEADER_BYTES: usize = 4;

/// Largest frame this client will produce or accept (100 MB, the Kafka
/// broker-side default).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// The v0 request APIs this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ApiKey {
    /// Append message sets to partitions.
    Produce = 0,
    /// Read message sets from partitions.
    Fetch = 1,
    /// Resolve offset sentinels (latest/earliest).
    ListOffsets = 2,
    /// Discover brokers and partition leaders.
    Metadata = 3,
}

impl ApiKey {
    /// Returns the wire value of this api key.
    #[must_use]
    pub const fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Begins a framed request: reserves the size prefix and writes the v0
/// request header. Finish with [`finish_request`].
pub fn begin_request(buf: &mut BytesMut, api_key: ApiKey, correlation_id: i32, client_id: &str) {
    buf.put_i32(0); // Size, backfilled by finish_request.
    buf.put_i16(api_key.as_i16());
    buf.put_i16(0); // api_version
    buf.put_i32(correlation_id);
    primitives::put_string(buf, client_id);
}

/// Backfills the size prefix of a request started at `start`.
///
/// # Errors
/// Returns `FrameTooLarge` if the payload exceeds [`MAX_FRAME_BYTES`].
///
/// # Panics
/// Panics if `start` is not the position handed out when the request began.
pub fn finish_request(buf: &mut BytesMut, start: usize) -> WireResult<()> {
    assert!(
        buf.len() >= start + FRAME_HEADER_BYTES,
        "finish_request before begin_request"
    );
    let payload = buf.len() - start - FRAME_HEADER_BYTES;
    if payload > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size: payload,
            max: MAX_FRAME_BYTES,
        });
    }
    // Safe cast: bounded by MAX_FRAME_BYTES which fits in i32.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let size = payload as i32;
    buf[start..start + FRAME_HEADER_BYTES].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

/// Decodes a response payload's header, returning the correlation id and
/// leaving the cursor at the response body.
///
/// # Errors
/// Returns `InsufficientData` if the payload is shorter than the header.
pub fn decode_response_header(payload: &mut Bytes) -> WireResult<i32> {
    if payload.remaining() < 4 {
        return Err(WireError::InsufficientData {
            need: 4,
            have: payload.remaining(),
        });
    }
    Ok(payload.get_i32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_framing_round_trip() {
        let mut buf = BytesMut::new();
        let start = buf.len();
        begin_request(&mut buf, ApiKey::Metadata, 7, "skein-test");
        buf.put_i32(0); // empty topic array
        finish_request(&mut buf, start).unwrap();

        let mut frame = buf.freeze();
        let size = frame.get_i32();
        assert_eq!(size as usize, frame.remaining());
        assert_eq!(frame.get_i16(), ApiKey::Metadata.as_i16());
        assert_eq!(frame.get_i16(), 0);
        assert_eq!(frame.get_i32(), 7);
    }

    #[test]
    fn test_response_header_short_payload() {
        let mut payload = Bytes::from_static(&[0, 0]);
        assert!(matches!(
            decode_response_header(&mut payload),
            Err(WireError::InsufficientData { need: 4, have: 2 })
        ));
    }
}

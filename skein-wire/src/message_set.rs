//! The v0 message-set format.
//!
//! A message set is a concatenation of entries with no outer length:
//!
//! ```text
//! ┌──────────┬──────────┬──────┬───────┬──────┬───────────┬─────────────┐
//! │ offset   │ size     │ crc  │ magic │ attr │ key       │ value       │
//! │ i64      │ i32      │ i32  │ i8    │ i8   │ i32 + N   │ i32 + N     │
//! └──────────┴──────────┴──────┴───────┴──────┴───────────┴─────────────┘
//!            └─ size counts from crc ──────────────────────────────────┘
//!                       └─ crc covers magic..end ───────────────────────┘
//! ```
//!
//! `size` is at least 14 (crc + magic + attr + the two length fields). A
//! trailing entry whose declared size runs past the set is a partial tail:
//! brokers cut fetch responses at a byte budget, so the tail is skipped and
//! re-fetched, not treated as corruption.

use std::io::{Read, Write};

use bytes::BufMut;

use crate::error::{WireError, WireResult};

/// Bytes of entry header before the message proper (offset + size).
pub const ENTRY_HEADER_BYTES: usize = 12;

/// Minimum `size` value: crc, magic, attributes, and two length fields.
pub const MESSAGE_OVERHEAD_BYTES: usize = 14;

/// Mask selecting the compression codec from the attribute byte.
pub const ATTRIBUTE_CODEC_MASK: i8 = 0b11;

/// One parsed message-set entry, borrowing key and value from the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage<'a> {
    /// Message offset within the partition.
    pub offset: i64,
    /// Attribute byte; low two bits are the compression codec.
    pub attributes: i8,
    /// Message key, if present.
    pub key: Option<&'a [u8]>,
    /// Message value, if present.
    pub value: Option<&'a [u8]>,
}

impl WireMessage<'_> {
    /// Returns the compression code from the attribute byte.
    #[must_use]
    pub const fn compression_code(&self) -> i8 {
        self.attributes & ATTRIBUTE_CODEC_MASK
    }
}

/// One parsed entry as byte spans into the set, for callers that need to
/// advance a cursor before borrowing the key and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpans {
    /// Message offset within the partition.
    pub offset: i64,
    /// Attribute byte; low two bits are the compression codec.
    pub attributes: i8,
    /// `(start, len)` of the key within the parsed slice, if present.
    pub key: Option<(usize, usize)>,
    /// `(start, len)` of the value within the parsed slice, if present.
    pub value: Option<(usize, usize)>,
}

impl EntrySpans {
    /// Returns the compression code from the attribute byte.
    #[must_use]
    pub const fn compression_code(&self) -> i8 {
        self.attributes & ATTRIBUTE_CODEC_MASK
    }
}

/// Reads the entry at the front of `data` as spans.
///
/// Returns `Ok(None)` when the set is exhausted or ends in a partial tail,
/// otherwise the entry and the number of bytes it consumed.
///
/// # Errors
/// `Crc` on a checksum mismatch (nothing is consumed; a retry re-reads the
/// same entry), `Malformed` on an impossible size, magic, or length field.
pub fn read_entry_spans(data: &[u8]) -> WireResult<Option<(EntrySpans, usize)>> {
    if data.len() < ENTRY_HEADER_BYTES {
        return Ok(None);
    }

    let offset = i64::from_be_bytes(data[0..8].try_into().expect("8-byte slice"));
    let size = i32::from_be_bytes(data[8..12].try_into().expect("4-byte slice"));
    if size < 0 {
        return Err(WireError::Malformed {
            what: "message size",
            reason: "negative",
        });
    }
    #[allow(clippy::cast_sign_loss)]
    let size = size as usize;
    if size < MESSAGE_OVERHEAD_BYTES {
        return Err(WireError::Malformed {
            what: "message size",
            reason: "below the 14-byte minimum",
        });
    }

    // Partial tail: the broker cut the set mid-entry.
    if data.len() < ENTRY_HEADER_BYTES + size {
        return Ok(None);
    }

    let wire_crc = u32::from_be_bytes(data[12..16].try_into().expect("4-byte slice"));
    let body_start = ENTRY_HEADER_BYTES + 4;
    let body = &data[body_start..ENTRY_HEADER_BYTES + size];
    let computed = crc32fast::hash(body);
    if computed != wire_crc {
        return Err(WireError::Crc {
            offset,
            wire: wire_crc,
            computed,
        });
    }

    #[allow(clippy::cast_possible_wrap)]
    let magic = body[0] as i8;
    if magic != 0 {
        return Err(WireError::Malformed {
            what: "magic byte",
            reason: "only v0 messages are supported",
        });
    }
    #[allow(clippy::cast_possible_wrap)]
    let attributes = body[1] as i8;

    let key_len = i32::from_be_bytes(body[2..6].try_into().expect("4-byte slice"));
    let (key, value_field_start) = if key_len < 0 {
        (None, 6)
    } else {
        #[allow(clippy::cast_sign_loss)]
        let key_len = key_len as usize;
        if key_len > size - MESSAGE_OVERHEAD_BYTES {
            return Err(WireError::Malformed {
                what: "key length",
                reason: "exceeds message size",
            });
        }
        (Some((body_start + 6, key_len)), 6 + key_len)
    };

    if body.len() < value_field_start + 4 {
        return Err(WireError::Malformed {
            what: "value length",
            reason: "truncated",
        });
    }
    let value_len = i32::from_be_bytes(
        body[value_field_start..value_field_start + 4]
            .try_into()
            .expect("4-byte slice"),
    );
    let value = if value_len < 0 {
        None
    } else {
        #[allow(clippy::cast_sign_loss)]
        let value_len = value_len as usize;
        if value_len > body.len() - value_field_start - 4 {
            return Err(WireError::Malformed {
                what: "value length",
                reason: "exceeds message size",
            });
        }
        Some((body_start + value_field_start + 4, value_len))
    };

    let spans = EntrySpans {
        offset,
        attributes,
        key,
        value,
    };
    Ok(Some((spans, ENTRY_HEADER_BYTES + size)))
}

/// Reads the entry at the front of `data` as borrowed slices.
///
/// # Errors
/// As [`read_entry_spans`].
pub fn read_entry(data: &[u8]) -> WireResult<Option<(WireMessage<'_>, usize)>> {
    let Some((spans, consumed)) = read_entry_spans(data)? else {
        return Ok(None);
    };
    let message = WireMessage {
        offset: spans.offset,
        attributes: spans.attributes,
        key: spans.key.map(|(start, len)| &data[start..start + len]),
        value: spans.value.map(|(start, len)| &data[start..start + len]),
    };
    Ok(Some((message, consumed)))
}

/// Scans a message set and returns the offset after the last complete entry,
/// or `None` when the set holds no complete entry.
///
/// The scan reads only the entry headers; checksums are verified later, when
/// the consumer parses each entry.
#[must_use]
pub fn next_offset_after(set: &[u8]) -> Option<i64> {
    let mut pos = 0;
    let mut last = None;

    while set.len() >= pos + ENTRY_HEADER_BYTES {
        let offset = i64::from_be_bytes(set[pos..pos + 8].try_into().expect("8-byte slice"));
        let size = i32::from_be_bytes(set[pos + 8..pos + 12].try_into().expect("4-byte slice"));
        if size < 0 {
            break;
        }
        #[allow(clippy::cast_sign_loss)]
        let size = size as usize;
        if set.len() < pos + ENTRY_HEADER_BYTES + size {
            break;
        }
        last = Some(offset);
        pos += ENTRY_HEADER_BYTES + size;
    }

    last.map(|offset| offset + 1)
}

/// Returns the encoded size of one entry with the given key and value.
#[must_use]
pub const fn encoded_len(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_BYTES + MESSAGE_OVERHEAD_BYTES + key_len + value_len
}

/// Appends one v0 entry to `buf`. Producers write offset 0; the broker
/// assigns real offsets on append.
pub fn write_entry(
    buf: &mut Vec<u8>,
    attributes: i8,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
) {
    let key_len = key.map_or(0, <[u8]>::len);
    let value_len = value.map_or(0, <[u8]>::len);

    let mut body = Vec::with_capacity(MESSAGE_OVERHEAD_BYTES - 4 + key_len + value_len);
    body.put_i8(0); // magic
    body.put_i8(attributes);
    match key {
        // Safe cast: record sizes are validated against the buffer capacity
        // before encoding.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Some(k) => {
            body.put_i32(k.len() as i32);
            body.extend_from_slice(k);
        }
        None => body.put_i32(-1),
    }
    match value {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Some(v) => {
            body.put_i32(v.len() as i32);
            body.extend_from_slice(v);
        }
        None => body.put_i32(-1),
    }

    buf.put_i64(0); // offset
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.put_i32((body.len() + 4) as i32);
    buf.put_u32(crc32fast::hash(&body));
    buf.extend_from_slice(&body);
}

/// Wraps a finished message set in a single gzip-compressed entry
/// (attribute code 1, null key, compressed set as the value).
///
/// # Errors
/// `Compression` if the deflate stream fails.
pub fn wrap_gzip(set: &[u8]) -> WireResult<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(set)
        .and_then(|()| encoder.finish())
        .map_err(|e| WireError::Compression {
            reason: e.to_string(),
        })
        .map(|compressed| {
            let mut wrapper = Vec::with_capacity(encoded_len(0, compressed.len()));
            write_entry(&mut wrapper, 1, None, Some(&compressed));
            wrapper
        })
}

/// Inflates a gzip wrapper value back into the inner message set.
///
/// `limit` bounds the inflated size, so a malicious frame cannot balloon
/// past the configured buffer capacity.
///
/// # Errors
/// `Compression` if the stream is invalid or inflates past `limit`.
pub fn inflate_gzip(value: &[u8], limit: usize) -> WireResult<Vec<u8>> {
    let mut inner = Vec::new();
    let mut decoder = flate2::read::GzDecoder::new(value).take(limit as u64 + 1);
    decoder
        .read_to_end(&mut inner)
        .map_err(|e| WireError::Compression {
            reason: e.to_string(),
        })?;
    if inner.len() > limit {
        return Err(WireError::Compression {
            reason: format!("inflated set exceeds {limit} bytes"),
        });
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(entries: &[(Option<&[u8]>, Option<&[u8]>)]) -> Vec<u8> {
        let mut set = Vec::new();
        for (key, value) in entries {
            write_entry(&mut set, 0, *key, *value);
        }
        set
    }

    #[test]
    fn test_entry_round_trip() {
        let set = set_of(&[(Some(b"k1"), Some(b"hello"))]);

        let (message, consumed) = read_entry(&set).unwrap().unwrap();
        assert_eq!(message.offset, 0);
        assert_eq!(message.key, Some(&b"k1"[..]));
        assert_eq!(message.value, Some(&b"hello"[..]));
        assert_eq!(consumed, set.len());
    }

    #[test]
    fn test_null_key_and_value() {
        let set = set_of(&[(None, None)]);
        let (message, _) = read_entry(&set).unwrap().unwrap();
        assert_eq!(message.key, None);
        assert_eq!(message.value, None);
    }

    #[test]
    fn test_partial_tail_is_skipped() {
        let mut set = set_of(&[(None, Some(b"full"))]);
        let full_len = set.len();
        // Append a second entry, then truncate it mid-message.
        write_entry(&mut set, 0, None, Some(b"cut off"));
        set.truncate(full_len + 20);

        let (_, consumed) = read_entry(&set).unwrap().unwrap();
        assert_eq!(read_entry(&set[consumed..]).unwrap(), None);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut set = set_of(&[(None, Some(b"payload"))]);
        let last = set.len() - 1;
        set[last] ^= 0xff;

        assert!(matches!(read_entry(&set), Err(WireError::Crc { .. })));
    }

    #[test]
    fn test_crc_passes_again_after_rewind() {
        let set = set_of(&[(Some(b"k"), Some(b"v"))]);
        // Same bytes parsed twice must validate twice.
        assert!(read_entry(&set).unwrap().is_some());
        assert!(read_entry(&set).unwrap().is_some());
    }

    #[test]
    fn test_undersized_message_rejected() {
        let mut set = Vec::new();
        set.put_i64(0);
        set.put_i32(5); // below the 14-byte minimum
        set.extend_from_slice(&[0u8; 5]);

        assert!(matches!(
            read_entry(&set),
            Err(WireError::Malformed {
                what: "message size",
                ..
            })
        ));
    }

    #[test]
    fn test_next_offset_scans_complete_entries() {
        // Hand-set offsets 17..=19 the way a broker would.
        let mut set = Vec::new();
        for offset in 17..20i64 {
            let mut entry = Vec::new();
            write_entry(&mut entry, 0, None, Some(b"m"));
            entry[0..8].copy_from_slice(&offset.to_be_bytes());
            set.extend_from_slice(&entry);
        }

        assert_eq!(next_offset_after(&set), Some(20));

        // A partial tail does not advance the offset.
        set.truncate(set.len() - 3);
        assert_eq!(next_offset_after(&set), Some(19));
    }

    #[test]
    fn test_next_offset_empty_set() {
        assert_eq!(next_offset_after(&[]), None);
        assert_eq!(next_offset_after(&[0u8; 11]), None);
    }

    #[test]
    fn test_gzip_wrapper_round_trip() {
        let inner = set_of(&[(None, Some(b"one")), (None, Some(b"two"))]);
        let wrapper = wrap_gzip(&inner).unwrap();

        let (message, consumed) = read_entry(&wrapper).unwrap().unwrap();
        assert_eq!(consumed, wrapper.len());
        assert_eq!(message.compression_code(), 1);

        let inflated = inflate_gzip(message.value.unwrap(), 1024 * 1024).unwrap();
        assert_eq!(inflated, inner);
    }

    #[test]
    fn test_gzip_inflate_respects_limit() {
        let inner = vec![0u8; 4096];
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&inner).unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(matches!(
            inflate_gzip(&compressed, 1024),
            Err(WireError::Compression { .. })
        ));
    }
}

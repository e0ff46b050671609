//! Kafka v0 wire codec for skein.
//!
//! This crate speaks the original (api version 0) Kafka protocol: Metadata,
//! Fetch, Produce, and ListOffsets request/response pairs over length-prefixed
//! TCP frames, plus the v0 message-set format with its per-message CRC32.
//!
//! # Wire Format
//!
//! ```text
//! Request:
//! ┌─────────────────┬───────────────────────────────────────────────┐
//! │  Size (4B, BE)  │  api_key │ api_version │ correlation │ client │
//! │                 │  i16     │ i16         │ i32         │ string │
//! │                 ├───────────────────────────────────────────────┤
//! │                 │  request body                                 │
//! └─────────────────┴───────────────────────────────────────────────┘
//!
//! Response:
//! ┌─────────────────┬───────────────────────────────────────────────┐
//! │  Size (4B, BE)  │  correlation_id (i32)  │  response body       │
//! └─────────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Request serializers are driven by already-sorted bundle snapshots, so one
//! call produces one framed RPC covering many partitions. Response decoders
//! hand message sets back as zero-copy `Bytes` slices; per-message parsing
//! happens against the consumer's own buffer via [`message_set::read_entry`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod frame;
pub mod message_set;
pub mod primitives;
pub mod request;
pub mod response;

pub use error::{WireError, WireResult};
pub use frame::{
    begin_request, decode_response_header, finish_request, ApiKey, FRAME_HEADER_BYTES,
    MAX_FRAME_BYTES,
};
pub use response::ErrorCode;

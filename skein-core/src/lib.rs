//! Skein Core - Error taxonomy and configuration for the skein Kafka client.
//!
//! This crate holds the pieces every other skein crate depends on: the
//! `ClientError` taxonomy, the `ClientConfig` knob surface, and the offset
//! sentinels. It deliberately contains no I/O and no protocol code - those
//! live in `skein-wire` and `skein-client`.
//!
//! # Design Principles
//!
//! - **Clone-able errors**: one broker failure fans out to many workers, so
//!   errors are plain data that can be injected into each of them.
//! - **Explicit knobs**: every timeout, retry count, and buffer size is a
//!   named configuration field with a validated range.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod error;

pub use config::{ClientConfig, Compression};
pub use error::{ClientError, NetworkErrorKind, Result, WorkerRole};

/// Offset sentinel: start from the newest message in the partition.
pub const OFFSET_LATEST: i64 = -1;

/// Offset sentinel: start from the oldest retained message in the partition.
pub const OFFSET_EARLIEST: i64 = -2;

//! Skein - a Kafka v0 client runtime.
//!
//! Skein multiplexes many logical consumers and producers over a small pool
//! of persistent broker connections, batches their per-partition requests
//! into single RPCs, and transparently recovers from broker failures and
//! leader migrations.
//!
//! # Architecture
//!
//! ```text
//! Consumer ──► PartitionQueue ──┐
//! Consumer ──► PartitionQueue ──┼─► RequestBundler ─► fetcher  ─┐
//!                               │    (consumer side)            │
//! Producer ──► PartitionQueue ──┼─► RequestBundler ─► pusher   ─┼─► TCP ─► broker
//!                               │    (producer side)            │
//!                               └──────────◄─────── receiver  ◄─┘
//!
//!              Client: metadata cache ── broker map ── brokerless workers
//! ```
//!
//! Each partition owns a fixed ring of preallocated buffers cycling between
//! free and filled lists; exhausting the ring is the back-pressure signal in
//! both directions. Each connection keeps an ordered in-flight request log,
//! so responses identify themselves by position on the wire.
//!
//! Failures split two ways: leader changes and TCP losses silently re-home
//! the affected workers through the client's connection manager; everything
//! else is injected into the owning worker and surfaces on its next call.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod buffer;
mod bundler;
mod client;
mod connection;
mod consumer;
mod metadata;
mod producer;
mod queue;

pub use client::Client;
pub use consumer::{Consumer, Message};
pub use producer::Producer;

pub use skein_core::{
    ClientConfig, ClientError, Compression, NetworkErrorKind, Result, WorkerRole,
    OFFSET_EARLIEST, OFFSET_LATEST,
};

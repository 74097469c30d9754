//! Real-time chunk buffering server.
//!
//! Chunkers move raw instrument data into per-type buffers held by the
//! [`DataManager`](data::DataManager); processing pipelines connect over TCP
//! and pull stream chunks together with the service data they were recorded
//! against.
//!
//! - [`chunker`]: producers and the thread manager that drives them
//! - [`data`]: stream and service buffers, requirements matching
//! - [`protocol`]: framed request/response codec
//! - [`server`] / [`client`]: the two ends of a pipeline connection
//! - [`archive`]: tagged blob files replayed by the archive chunker

pub mod archive;
pub mod chunker;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;
pub mod server;

pub use daq_pool::{AssociatedData, ChunkId, ChunkPhase, LockError, ReadHandle, WriteHandle};

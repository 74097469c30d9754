//! Producers that move raw data from devices into buffers.
//!
//! A chunker owns the logic for one kind of source (socket, file, archive,
//! synthetic generator). The [`ChunkerManager`](manager::ChunkerManager)
//! opens each chunker's device up front and then drives it on a dedicated
//! thread, calling [`Chunker::next`] until the chunker reports that its source
//! is exhausted or a stop is requested.
//!
//! Chunkers never block on buffer space: when [`ChunkWriter::writable`]
//! returns `None` the current unit of data must be read and discarded.

pub mod archive;
pub mod file;
pub mod generator;
pub mod manager;
pub mod registry;
pub mod udp;

pub use manager::ChunkerManager;
pub use registry::ChunkerRegistry;

use daq_pool::WriteHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::ChunkerRole;
use crate::data::DataManager;
use crate::error::AppResult;

/// Result of one [`Chunker::next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOutcome {
    /// A chunk was written and released.
    Written,
    /// Data arrived but no storage was available; it was discarded.
    Dropped,
    /// Nothing arrived this round.
    Idle,
    /// The source has no more data; the chunker thread exits.
    Exhausted,
}

/// A producer bound to one or more buffers.
pub trait Chunker: Send + 'static {
    /// The opened I/O source.
    type Device: Send + 'static;

    /// Buffer names this chunker writes into.
    fn data_types(&self) -> &[String];

    /// Open the source. Failure aborts manager start-up.
    fn new_device(&self) -> AppResult<Self::Device>;

    /// Read one logical unit from `device` and deposit it through `writer`.
    fn next(&mut self, device: &mut Self::Device, writer: &ChunkWriter) -> AppResult<NextOutcome>;
}

/// Object-safe view of a [`Chunker`] used by the registry and manager.
pub trait AnyChunker: Send {
    fn data_types(&self) -> &[String];

    /// Open the device and pair it with the chunker.
    fn open(self: Box<Self>) -> AppResult<Box<dyn OpenChunker>>;
}

/// A chunker whose device is open and ready to be driven.
pub trait OpenChunker: Send {
    fn step(&mut self, writer: &ChunkWriter) -> AppResult<NextOutcome>;
}

struct Opened<C: Chunker> {
    chunker: C,
    device: C::Device,
}

impl<C: Chunker> OpenChunker for Opened<C> {
    fn step(&mut self, writer: &ChunkWriter) -> AppResult<NextOutcome> {
        self.chunker.next(&mut self.device, writer)
    }
}

impl<C: Chunker> AnyChunker for C {
    fn data_types(&self) -> &[String] {
        Chunker::data_types(self)
    }

    fn open(self: Box<Self>) -> AppResult<Box<dyn OpenChunker>> {
        let device = self.new_device()?;
        Ok(Box::new(Opened {
            chunker: *self,
            device,
        }))
    }
}

/// A chunker's view of the data manager.
///
/// Routes writes to stream or service buffers depending on the chunker's role
/// and turns backpressure into `None` so the chunker can drop its data.
pub struct ChunkWriter {
    manager: Arc<DataManager>,
    role: ChunkerRole,
    label: String,
    dropped: AtomicU64,
}

impl ChunkWriter {
    pub fn new(manager: Arc<DataManager>, role: ChunkerRole, label: impl Into<String>) -> Self {
        Self {
            manager,
            role,
            label: label.into(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> ChunkerRole {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    /// Storage for `size` bytes of `data_type`, or `None` under backpressure.
    pub fn writable(&self, data_type: &str, size: usize) -> AppResult<Option<WriteHandle>> {
        let result = match self.role {
            ChunkerRole::Stream => self.manager.get_writable(data_type, size),
            ChunkerRole::Service => self.manager.get_service_writable(data_type, size),
        };
        match result {
            Ok(handle) => Ok(Some(handle)),
            Err(e) if e.is_backpressure() => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(chunker = %self.label, data_type, size, error = %e, "dropping data");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy `bytes` into a fresh chunk. Returns false if they were dropped.
    pub fn write(&self, data_type: &str, bytes: &[u8]) -> AppResult<bool> {
        match self.writable(data_type, bytes.len())? {
            Some(mut handle) => {
                handle.write(bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Units of data discarded for lack of storage.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

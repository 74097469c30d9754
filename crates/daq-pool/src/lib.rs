//! Lockable chunks for the stream and service data buffers.
//!
//! A [`LockableChunk`] owns one fixed-capacity block of memory together with a
//! small lock state machine. Buffers lend chunks out through RAII handles:
//!
//! - [`WriteHandle`]: exclusive access while a producer fills the chunk
//! - [`ReadHandle`]: shared access once the chunk holds valid data
//!
//! # State Machine
//!
//! ```text
//!            acquire_write              release (bytes written)
//!   Empty  ---------------->  Writing  ------------------------->  Active
//!     ^                          |                                  |  mark_served
//!     |   release (no bytes)     |                                  v
//!     +--------------------------+        last reader released    Served
//!     +-----------------------------------------------------------+
//! ```
//!
//! A chunk that is `Active` (never served) and loses its last reader stays
//! `Active`; its owner is told it went idle so it can be queued for serving
//! again. Eviction of unread data is allowed: `acquire_write` succeeds on an
//! `Active` chunk as long as no reader holds it.
//!
//! # Owner Notification
//!
//! Chunks never reach into their owning buffer directly. Instead the owner
//! registers a [`ChunkObserver`] and the handles invoke it on release, after
//! the chunk's own lock has been dropped. Owners may therefore take their
//! own locks inside the callbacks, but must never drop a handle while holding
//! a lock the callback needs.
//!
//! # Example
//!
//! ```
//! use daq_pool::{ChunkId, ChunkPhase, LockableChunk};
//!
//! let chunk = LockableChunk::detached(ChunkId(0), 64);
//!
//! let mut writer = chunk.acquire_write(16).unwrap();
//! writer.write(b"antenna samples!");
//! drop(writer);
//! assert_eq!(chunk.phase(), ChunkPhase::Active);
//!
//! let reader = chunk.acquire_read().unwrap();
//! assert_eq!(reader.data(), b"antenna samples!");
//! reader.mark_served();
//! drop(reader);
//! assert_eq!(chunk.phase(), ChunkPhase::Empty);
//! ```

pub mod handle;

pub use handle::{ReadHandle, WriteHandle};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::trace;

/// Identifier of a chunk within its owning buffer.
///
/// Stream buffers number chunks by allocation order; service buffers use the
/// version id of the data the chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to one version of a named service data set.
///
/// Stream chunks carry a manifest of these, snapshot when the chunk was
/// handed to its writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssociatedData {
    /// Service data type name (e.g. "antenna_positions")
    pub name: String,
    /// Version id current at write time
    pub version: u64,
}

impl AssociatedData {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Lock phase of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// No valid data, no locks held.
    Empty,
    /// One exclusive writer, zero readers.
    Writing,
    /// Valid data, not yet delivered to a requester.
    Active,
    /// Valid data that a reader has delivered; recycled once all readers leave.
    Served,
}

/// Errors raised by chunk lock transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("chunk {0} is locked")]
    Busy(ChunkId),

    #[error("requested {requested} bytes but chunk {id} holds only {capacity}")]
    ExceedsCapacity {
        id: ChunkId,
        requested: usize,
        capacity: usize,
    },

    #[error("chunk {id} is not readable while {phase:?}")]
    NotReadable { id: ChunkId, phase: ChunkPhase },
}

/// Callbacks from a chunk to the buffer that owns it.
///
/// Invoked without the chunk's internal lock held.
pub trait ChunkObserver: Send + Sync {
    /// A writer released the chunk with valid content.
    fn chunk_activated(&self, chunk: &Arc<LockableChunk>);

    /// The chunk holds no valid data any more: either the writer released it
    /// without writing, or the last reader of a served chunk let go.
    fn chunk_emptied(&self, chunk: &Arc<LockableChunk>);

    /// The last reader released a chunk that was never marked served.
    fn chunk_idle(&self, chunk: &Arc<LockableChunk>);
}

/// Observer used by chunks that have no owning buffer.
struct Detached;

impl ChunkObserver for Detached {
    fn chunk_activated(&self, _chunk: &Arc<LockableChunk>) {}
    fn chunk_emptied(&self, _chunk: &Arc<LockableChunk>) {}
    fn chunk_idle(&self, _chunk: &Arc<LockableChunk>) {}
}

/// The memory block behind a lockable chunk.
pub struct Chunk {
    pub(crate) data: Box<[u8]>,
    pub(crate) size: usize,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
        }
    }

    /// Valid bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

struct LockState {
    phase: ChunkPhase,
    readers: usize,
    size: usize,
    sequence: u64,
    associated: Vec<AssociatedData>,
}

/// A memory block plus its read/write lock state.
pub struct LockableChunk {
    id: ChunkId,
    capacity: usize,
    memory: Arc<RwLock<Chunk>>,
    state: Mutex<LockState>,
    observer: Weak<dyn ChunkObserver>,
}

impl fmt::Debug for LockableChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockableChunk")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("phase", &state.phase)
            .field("readers", &state.readers)
            .field("size", &state.size)
            .field("sequence", &state.sequence)
            .finish()
    }
}

enum ReadRelease {
    Shared,
    Emptied,
    Idle,
}

impl LockableChunk {
    /// Allocate a chunk of `capacity` bytes owned by `observer`.
    pub fn new(id: ChunkId, capacity: usize, observer: Weak<dyn ChunkObserver>) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity,
            memory: Arc::new(RwLock::new(Chunk::with_capacity(capacity))),
            state: Mutex::new(LockState {
                phase: ChunkPhase::Empty,
                readers: 0,
                size: 0,
                sequence: 0,
                associated: Vec::new(),
            }),
            observer,
        })
    }

    /// Allocate a chunk with no owner to notify.
    pub fn detached(id: ChunkId, capacity: usize) -> Arc<Self> {
        let observer: Weak<dyn ChunkObserver> = Weak::<Detached>::new();
        Self::new(id, capacity, observer)
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn phase(&self) -> ChunkPhase {
        self.state.lock().phase
    }

    /// Number of read handles currently outstanding.
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// Bytes of valid content (zero while empty or being written).
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        match state.phase {
            ChunkPhase::Active | ChunkPhase::Served => state.size,
            ChunkPhase::Empty | ChunkPhase::Writing => 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Service data manifest of the current content, or of the write in
    /// progress once its writer has called [`WriteHandle::associate`].
    pub fn associated(&self) -> Vec<AssociatedData> {
        self.state.lock().associated.clone()
    }

    /// True if the chunk holds readable content.
    pub fn is_readable(&self) -> bool {
        matches!(self.phase(), ChunkPhase::Active | ChunkPhase::Served)
    }

    /// Lock the chunk for writing `size` bytes.
    ///
    /// Succeeds from `Empty`, and from `Active` when no reader holds the chunk
    /// (eviction of unread data). Any previous content is discarded.
    pub fn acquire_write(self: &Arc<Self>, size: usize) -> Result<WriteHandle, LockError> {
        if size > self.capacity {
            return Err(LockError::ExceedsCapacity {
                id: self.id,
                requested: size,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock();
        if state.phase == ChunkPhase::Writing || state.readers > 0 {
            return Err(LockError::Busy(self.id));
        }
        let guard = self
            .memory
            .try_write_arc()
            .ok_or(LockError::Busy(self.id))?;

        state.phase = ChunkPhase::Writing;
        state.size = 0;
        state.sequence = 0;
        state.associated.clear();
        drop(state);

        trace!(chunk = %self.id, size, "chunk locked for write");
        Ok(WriteHandle::new(Arc::clone(self), guard, size))
    }

    /// Take a shared read lock. Fails while the chunk is empty or being written.
    pub fn acquire_read(self: &Arc<Self>) -> Result<ReadHandle, LockError> {
        let mut state = self.state.lock();
        match state.phase {
            ChunkPhase::Active | ChunkPhase::Served => {}
            phase => return Err(LockError::NotReadable { id: self.id, phase }),
        }
        let guard = self
            .memory
            .try_read_arc()
            .ok_or(LockError::Busy(self.id))?;
        state.readers += 1;

        Ok(ReadHandle::new(
            Arc::clone(self),
            guard,
            state.sequence,
            state.associated.clone(),
        ))
    }

    pub(crate) fn record_associated(&self, associated: &[AssociatedData]) {
        self.state.lock().associated = associated.to_vec();
    }

    pub(crate) fn mark_served(&self) {
        let mut state = self.state.lock();
        if state.phase == ChunkPhase::Active {
            state.phase = ChunkPhase::Served;
        }
    }

    pub(crate) fn finish_write(
        self: &Arc<Self>,
        size: usize,
        sequence: u64,
        associated: Vec<AssociatedData>,
    ) {
        let activated = {
            let mut state = self.state.lock();
            state.size = size;
            state.sequence = sequence;
            if size > 0 {
                state.phase = ChunkPhase::Active;
                state.associated = associated;
            } else {
                state.phase = ChunkPhase::Empty;
                state.associated.clear();
            }
            size > 0
        };

        trace!(chunk = %self.id, size, activated, "write lock released");
        if let Some(observer) = self.observer.upgrade() {
            if activated {
                observer.chunk_activated(self);
            } else {
                observer.chunk_emptied(self);
            }
        }
    }

    pub(crate) fn finish_read(self: &Arc<Self>) {
        let release = {
            let mut state = self.state.lock();
            state.readers = state.readers.saturating_sub(1);
            if state.readers > 0 {
                ReadRelease::Shared
            } else if state.phase == ChunkPhase::Served {
                state.phase = ChunkPhase::Empty;
                state.associated.clear();
                ReadRelease::Emptied
            } else {
                ReadRelease::Idle
            }
        };

        let Some(observer) = self.observer.upgrade() else {
            return;
        };
        match release {
            ReadRelease::Shared => {}
            ReadRelease::Emptied => observer.chunk_emptied(self),
            ReadRelease::Idle => observer.chunk_idle(self),
        }
    }
}

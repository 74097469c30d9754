//! RAII handles lending out chunk memory.
//!
//! Dropping a handle is the only way a chunk changes phase after it has been
//! locked, so callers must never keep a reference into chunk memory beyond the
//! handle's lifetime (the borrow checker enforces this for slices handed out
//! by [`WriteHandle::data_mut`] and [`ReadHandle::data`]).

use crate::{AssociatedData, Chunk, ChunkId, LockableChunk};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use std::fmt;
use std::sync::Arc;

/// Exclusive write access to a chunk.
///
/// The handle reserves `reserved` bytes of the chunk. Content becomes valid
/// as it is written; on drop the chunk is activated if any bytes were written
/// and the handle was not invalidated, otherwise it returns to `Empty`.
pub struct WriteHandle {
    chunk: Arc<LockableChunk>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Chunk>>,
    reserved: usize,
    filled: usize,
    valid: bool,
    sequence: u64,
    associated: Vec<AssociatedData>,
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle")
            .field("chunk", &self.chunk.id())
            .field("reserved", &self.reserved)
            .field("filled", &self.filled)
            .field("valid", &self.valid)
            .finish()
    }
}

impl WriteHandle {
    pub(crate) fn new(
        chunk: Arc<LockableChunk>,
        guard: ArcRwLockWriteGuard<RawRwLock, Chunk>,
        reserved: usize,
    ) -> Self {
        Self {
            chunk,
            guard: Some(guard),
            reserved,
            filled: 0,
            valid: true,
            sequence: 0,
            associated: Vec::new(),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Bytes reserved for this write.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn remaining(&self) -> usize {
        self.reserved - self.filled
    }

    fn region(&mut self) -> &mut [u8] {
        let reserved = self.reserved;
        match self.guard.as_mut() {
            Some(guard) => &mut guard.data[..reserved],
            None => &mut [],
        }
    }

    /// Append bytes, returning how many fit in the reservation.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let start = self.filled;
        let count = bytes.len().min(self.remaining());
        self.region()[start..start + count].copy_from_slice(&bytes[..count]);
        self.filled += count;
        count
    }

    /// The whole reserved region. Marks all reserved bytes as written.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.filled = self.reserved;
        self.region()
    }

    /// The unwritten tail of the reservation; follow with [`advance`](Self::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.filled;
        &mut self.region()[start..]
    }

    /// Mark `count` more bytes of the spare region as written.
    pub fn advance(&mut self, count: usize) {
        self.filled = (self.filled + count).min(self.reserved);
    }

    /// Shrink the valid content to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.filled = self.filled.min(len);
    }

    /// Discard the content; the chunk goes back to `Empty` on drop.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.filled > 0
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Record the service data versions this content depends on.
    pub fn associate(&mut self, associated: Vec<AssociatedData>) {
        self.chunk.record_associated(&associated);
        self.associated = associated;
    }

    pub fn associated(&self) -> &[AssociatedData] {
        &self.associated
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        let size = if self.valid { self.filled } else { 0 };
        if let Some(mut guard) = self.guard.take() {
            guard.size = size;
        }
        let associated = std::mem::take(&mut self.associated);
        self.chunk.finish_write(size, self.sequence, associated);
    }
}

/// Shared read access to an active chunk.
pub struct ReadHandle {
    chunk: Arc<LockableChunk>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Chunk>>,
    sequence: u64,
    associated: Vec<AssociatedData>,
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("chunk", &self.chunk.id())
            .field("size", &self.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl ReadHandle {
    pub(crate) fn new(
        chunk: Arc<LockableChunk>,
        guard: ArcRwLockReadGuard<RawRwLock, Chunk>,
        sequence: u64,
        associated: Vec<AssociatedData>,
    ) -> Self {
        Self {
            chunk,
            guard: Some(guard),
            sequence,
            associated,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Valid content of the chunk.
    pub fn data(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(guard) => guard.data(),
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.chunk.capacity()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn associated(&self) -> &[AssociatedData] {
        &self.associated
    }

    /// Record that this content has been delivered. Once the last reader
    /// releases, the chunk is recycled instead of queued for serving again.
    pub fn mark_served(&self) {
        self.chunk.mark_served();
    }

    pub fn chunk(&self) -> &Arc<LockableChunk> {
        &self.chunk
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.chunk.finish_read();
    }
}

//! Bounded pool of lockable chunks for one named stream type.
//!
//! Chunks are allocated lazily up to the buffer's byte limit and then recycled
//! for the buffer's lifetime. Every chunk is in exactly one of three places:
//!
//! - the **empty queue**, ready for a writer
//! - the **serve queue**, holding valid data in write-completion order
//! - checked out through a [`WriteHandle`] or [`ReadHandle`]
//!
//! Writers never block. When no chunk is free and no more memory may be
//! allocated, the oldest unread chunk is evicted; failing that the write is
//! rejected and the producer drops its data.
//!
//! # Locking
//!
//! Two buffer-level mutexes are always taken in the same order: `allocation`
//! before `queues`. Chunk release callbacks only take `queues`, so no handle
//! may be dropped while `queues` is held.

use daq_pool::{AssociatedData, ChunkId, ChunkObserver, LockableChunk, ReadHandle, WriteHandle};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::config::BufferLimits;
use crate::data::signal::ActivationSignal;
use crate::error::{AppResult, DaqError};

struct Allocation {
    chunks: Vec<Arc<LockableChunk>>,
    space_remaining: usize,
    next_sequence: u64,
}

#[derive(Default)]
struct Queues {
    empty: Vec<Arc<LockableChunk>>,
    serve: VecDeque<Arc<LockableChunk>>,
}

/// Counters describing how a buffer has coped with its load.
#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of a stream buffer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Writable chunks handed out
    pub written: u64,
    /// Unread chunks overwritten to make room
    pub evicted: u64,
    /// Write requests refused
    pub rejected: u64,
}

pub struct StreamDataBuffer {
    name: String,
    limits: BufferLimits,
    self_ref: Weak<StreamDataBuffer>,
    allocation: Mutex<Allocation>,
    queues: Mutex<Queues>,
    counters: Counters,
    signal: Arc<ActivationSignal>,
}

impl std::fmt::Debug for StreamDataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDataBuffer")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("serve_queue", &self.serve_queue_len())
            .field("empty_queue", &self.empty_queue_len())
            .finish()
    }
}

impl StreamDataBuffer {
    /// Create an empty buffer. No memory is allocated until the first write.
    pub fn new(
        name: impl Into<String>,
        limits: BufferLimits,
        signal: Arc<ActivationSignal>,
    ) -> AppResult<Arc<Self>> {
        let name = name.into();
        limits.check(&name)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            name,
            limits,
            self_ref: self_ref.clone(),
            allocation: Mutex::new(Allocation {
                chunks: Vec::new(),
                space_remaining: limits.max_bytes,
                next_sequence: 1,
            }),
            queues: Mutex::new(Queues::default()),
            counters: Counters::default(),
            signal,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Lock a chunk of at least `size` bytes for writing.
    pub fn get_writable(&self, size: usize) -> AppResult<WriteHandle> {
        self.get_writable_with(size, Vec::new())
    }

    /// Lock a chunk for writing and attach the service data manifest the
    /// content will depend on.
    ///
    /// Policy, in order: reuse an empty chunk large enough; allocate a new
    /// chunk if the byte budget allows; evict the oldest unread chunk large
    /// enough; otherwise fail with [`DaqError::BufferFull`].
    pub fn get_writable_with(
        &self,
        size: usize,
        associated: Vec<AssociatedData>,
    ) -> AppResult<WriteHandle> {
        if size == 0 {
            return Err(DaqError::EmptyChunkRequest(self.name.clone()));
        }
        if size > self.limits.max_chunk_bytes {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(DaqError::ChunkTooLarge {
                buffer: self.name.clone(),
                requested: size,
                max: self.limits.max_chunk_bytes,
            });
        }

        let mut allocation = self.allocation.lock();
        let sequence = allocation.next_sequence;

        let handle = match self.reuse_empty(size) {
            Some(handle) => Some(handle),
            None if size <= allocation.space_remaining => Some(self.allocate(&mut allocation, size)?),
            None => self.evict_oldest(size),
        };

        let Some(mut handle) = handle else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(DaqError::BufferFull {
                buffer: self.name.clone(),
                requested: size,
            });
        };

        allocation.next_sequence += 1;
        drop(allocation);

        handle.set_sequence(sequence);
        handle.associate(associated);
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        trace!(buffer = %self.name, chunk = %handle.id(), size, sequence, "chunk handed to writer");
        Ok(handle)
    }

    fn reuse_empty(&self, size: usize) -> Option<WriteHandle> {
        let mut queues = self.queues.lock();
        let position = queues.empty.iter().position(|c| c.capacity() >= size)?;
        let chunk = queues.empty.swap_remove(position);
        match chunk.acquire_write(size) {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!(buffer = %self.name, error = %e, "empty-queue chunk not writable");
                queues.empty.push(chunk);
                None
            }
        }
    }

    fn allocate(&self, allocation: &mut Allocation, size: usize) -> AppResult<WriteHandle> {
        let observer: Weak<dyn ChunkObserver> = self.self_ref.clone();
        let id = ChunkId(allocation.chunks.len() as u64);
        let chunk = LockableChunk::new(id, size, observer);
        let handle = chunk.acquire_write(size)?;

        allocation.space_remaining -= size;
        allocation.chunks.push(chunk);
        debug!(
            buffer = %self.name,
            chunk = %id,
            size,
            space_remaining = allocation.space_remaining,
            "allocated chunk"
        );
        Ok(handle)
    }

    fn evict_oldest(&self, size: usize) -> Option<WriteHandle> {
        let mut queues = self.queues.lock();
        let candidates: Vec<usize> = queues
            .serve
            .iter()
            .enumerate()
            .filter(|(_, c)| c.capacity() >= size)
            .map(|(i, _)| i)
            .collect();

        for position in candidates {
            let Ok(handle) = queues.serve[position].acquire_write(size) else {
                continue;
            };
            queues.serve.remove(position);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(
                buffer = %self.name,
                chunk = %handle.id(),
                "buffer full, evicting oldest unread chunk"
            );
            return Some(handle);
        }
        None
    }

    /// Take the oldest unread chunk with a read lock held.
    ///
    /// Mark the handle served once its content has been delivered; otherwise
    /// the chunk returns to the head of the serve queue when released.
    pub fn get_next(&self) -> Option<ReadHandle> {
        let mut queues = self.queues.lock();
        while let Some(chunk) = queues.serve.pop_front() {
            match chunk.acquire_read() {
                Ok(handle) => return Some(handle),
                Err(e) => debug!(buffer = %self.name, error = %e, "skipping unreadable chunk"),
            }
        }
        None
    }

    /// Bytes not yet committed to any chunk.
    pub fn space_remaining(&self) -> usize {
        self.allocation.lock().space_remaining
    }

    /// Total capacity of the chunks allocated so far.
    pub fn allocated_bytes(&self) -> usize {
        self.allocation
            .lock()
            .chunks
            .iter()
            .map(|c| c.capacity())
            .sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.allocation.lock().chunks.len()
    }

    pub fn serve_queue_len(&self) -> usize {
        self.queues.lock().serve.len()
    }

    pub fn empty_queue_len(&self) -> usize {
        self.queues.lock().empty.len()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.counters.written.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Service data versions named by chunks that hold, or are being filled
    /// with, data.
    pub fn referenced_service_versions(&self) -> Vec<AssociatedData> {
        self.allocation
            .lock()
            .chunks
            .iter()
            .flat_map(|c| c.associated())
            .collect()
    }
}

impl ChunkObserver for StreamDataBuffer {
    fn chunk_activated(&self, chunk: &Arc<LockableChunk>) {
        self.queues.lock().serve.push_back(Arc::clone(chunk));
        trace!(buffer = %self.name, chunk = %chunk.id(), "chunk queued for serving");
        self.signal.notify();
    }

    fn chunk_emptied(&self, chunk: &Arc<LockableChunk>) {
        self.queues.lock().empty.push(Arc::clone(chunk));
        trace!(buffer = %self.name, chunk = %chunk.id(), "chunk recycled");
    }

    fn chunk_idle(&self, chunk: &Arc<LockableChunk>) {
        self.queues.lock().serve.push_front(Arc::clone(chunk));
        trace!(buffer = %self.name, chunk = %chunk.id(), "unserved chunk requeued");
        self.signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_pool::ChunkPhase;
    use tracing_test::traced_test;

    fn buffer(max_bytes: usize, max_chunk_bytes: usize) -> Arc<StreamDataBuffer> {
        StreamDataBuffer::new(
            "T",
            BufferLimits::new(max_bytes, max_chunk_bytes),
            Arc::new(ActivationSignal::new()),
        )
        .unwrap()
    }

    fn write(buffer: &StreamDataBuffer, fill: u8, size: usize) -> AppResult<()> {
        let mut handle = buffer.get_writable(size)?;
        handle.data_mut().fill(fill);
        Ok(())
    }

    fn assert_accounting(buffer: &StreamDataBuffer) {
        assert_eq!(
            buffer.space_remaining() + buffer.allocated_bytes(),
            buffer.limits().max_bytes
        );
    }

    #[test]
    fn test_lazy_allocation() {
        let buffer = buffer(1024, 256);
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.space_remaining(), 1024);

        write(&buffer, 1, 100).unwrap();
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.space_remaining(), 924);
        assert_eq!(buffer.serve_queue_len(), 1);
        assert_accounting(&buffer);
    }

    #[test]
    fn test_fifo_order() {
        let buffer = buffer(1024, 256);
        for i in 1..=3 {
            write(&buffer, i, 16).unwrap();
        }
        for i in 1..=3 {
            let handle = buffer.get_next().unwrap();
            assert!(handle.data().iter().all(|&b| b == i));
            handle.mark_served();
        }
        assert!(buffer.get_next().is_none());
    }

    #[test]
    fn test_served_chunk_is_reused() {
        let buffer = buffer(1024, 256);
        write(&buffer, 1, 256).unwrap();
        let handle = buffer.get_next().unwrap();
        handle.mark_served();
        drop(handle);
        assert_eq!(buffer.empty_queue_len(), 1);

        write(&buffer, 2, 128).unwrap();
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.empty_queue_len(), 0);
        assert_eq!(buffer.get_next().unwrap().data(), &[2u8; 128][..]);
        assert_accounting(&buffer);
    }

    #[test]
    #[traced_test]
    fn test_oldest_chunk_evicted_when_full() {
        let buffer = buffer(1024, 256);
        for i in 1..=5 {
            write(&buffer, i, 256).unwrap();
            assert_accounting(&buffer);
        }

        assert_eq!(buffer.chunk_count(), 4);
        assert_eq!(buffer.stats().evicted, 1);

        let mut seen = Vec::new();
        while let Some(handle) = buffer.get_next() {
            seen.push(handle.data()[0]);
            handle.mark_served();
        }
        assert_eq!(seen, vec![2, 3, 4, 5]);
        assert!(logs_contain("evicting oldest unread chunk"));
    }

    #[test]
    fn test_chunk_too_large_always_rejected() {
        let buffer = buffer(1024, 256);
        assert!(matches!(
            buffer.get_writable(257),
            Err(DaqError::ChunkTooLarge { requested: 257, max: 256, .. })
        ));
        // Still rejected with the buffer otherwise empty
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.stats().rejected, 1);
    }

    #[test]
    fn test_zero_size_request() {
        let buffer = buffer(1024, 256);
        assert!(matches!(
            buffer.get_writable(0),
            Err(DaqError::EmptyChunkRequest(_))
        ));
    }

    #[test]
    fn test_full_when_everything_checked_out() {
        let buffer = buffer(512, 256);
        let _a = buffer.get_writable(256).unwrap();
        let _b = buffer.get_writable(256).unwrap();
        assert!(matches!(
            buffer.get_writable(256),
            Err(DaqError::BufferFull { requested: 256, .. })
        ));
    }

    #[test]
    fn test_read_chunk_not_evicted() {
        let buffer = buffer(256, 256);
        write(&buffer, 1, 256).unwrap();
        let reader = buffer.get_next().unwrap();

        assert!(buffer.get_writable(256).is_err());
        assert_eq!(reader.data()[0], 1);
    }

    #[test]
    fn test_unserved_chunk_returns_to_front() {
        let buffer = buffer(1024, 256);
        write(&buffer, 1, 8).unwrap();
        write(&buffer, 2, 8).unwrap();

        let first = buffer.get_next().unwrap();
        assert_eq!(first.data()[0], 1);
        drop(first);

        assert_eq!(buffer.serve_queue_len(), 2);
        let again = buffer.get_next().unwrap();
        assert_eq!(again.data()[0], 1);
        assert_eq!(again.chunk().phase(), ChunkPhase::Active);
    }

    #[test]
    fn test_discarded_write_returns_to_empty_queue() {
        let buffer = buffer(1024, 256);
        let mut handle = buffer.get_writable(64).unwrap();
        handle.invalidate();
        drop(handle);

        assert_eq!(buffer.serve_queue_len(), 0);
        assert_eq!(buffer.empty_queue_len(), 1);
        assert!(buffer.get_next().is_none());
    }

    #[test]
    fn test_sequence_and_manifest() {
        let buffer = buffer(1024, 256);
        write(&buffer, 1, 8).unwrap();
        let mut handle = buffer
            .get_writable_with(8, vec![AssociatedData::new("positions", 4)])
            .unwrap();
        handle.write(b"abcdefgh");
        drop(handle);

        assert_eq!(
            buffer.referenced_service_versions(),
            vec![AssociatedData::new("positions", 4)]
        );

        let first = buffer.get_next().unwrap();
        let second = buffer.get_next().unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(second.associated()[0].version, 4);
    }

    #[test]
    fn test_activation_notifies_signal() {
        let signal = Arc::new(ActivationSignal::new());
        let buffer =
            StreamDataBuffer::new("T", BufferLimits::new(64, 64), Arc::clone(&signal)).unwrap();
        let before = signal.generation();
        write(&buffer, 1, 8).unwrap();
        assert!(signal.generation() > before);
    }

    #[test]
    fn test_zero_sized_limits_rejected() {
        let result = StreamDataBuffer::new(
            "T",
            BufferLimits::new(0, 0),
            Arc::new(ActivationSignal::new()),
        );
        assert!(matches!(result, Err(DaqError::ZeroSizedBuffer(_))));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let buffer = buffer(4096, 64);
        let writers: Vec<_> = (0..4u8)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(mut handle) = buffer.get_writable(64) {
                            handle.data_mut().fill(w);
                        }
                    }
                })
            })
            .collect();
        let reader = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut served = 0;
                for _ in 0..2000 {
                    if let Some(handle) = buffer.get_next() {
                        let first = handle.data()[0];
                        assert!(handle.data().iter().all(|&b| b == first));
                        handle.mark_served();
                        served += 1;
                    }
                }
                served
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_accounting(&buffer);
        assert_eq!(
            buffer.serve_queue_len() + buffer.empty_queue_len(),
            buffer.chunk_count()
        );
    }
}

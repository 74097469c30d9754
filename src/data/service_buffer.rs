//! Versioned store for one named service data set.
//!
//! Every write creates a new version. When its writer releases, the version
//! becomes current; older versions stay readable until they are retired, and
//! a retired version that still has readers is freed when the last one lets
//! go. Service data is small and infrequent, so a full buffer rejects new
//! versions rather than evicting old ones.
//!
//! Readers get a [`ServiceReadHandle`], which cannot be marked served: a
//! served service chunk would be recycled when its last reader leaves,
//! taking the version with it.

use daq_pool::{ChunkId, ChunkObserver, ChunkPhase, LockableChunk, ReadHandle, WriteHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::BufferLimits;
use crate::error::{AppResult, DaqError};

/// Shared read access to one version of service data.
#[derive(Debug)]
pub struct ServiceReadHandle(ReadHandle);

impl ServiceReadHandle {
    pub fn version(&self) -> u64 {
        self.0.sequence()
    }

    pub fn data(&self) -> &[u8] {
        self.0.data()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct VersionTable {
    versions: BTreeMap<u64, Arc<LockableChunk>>,
    current: Option<u64>,
    next_version: u64,
    space_remaining: usize,
    /// Retired while still locked; freed on release
    retiring: BTreeSet<u64>,
}

impl VersionTable {
    fn free(&mut self, version: u64) {
        if let Some(chunk) = self.versions.remove(&version) {
            self.space_remaining += chunk.capacity();
        }
        self.retiring.remove(&version);
    }
}

pub struct ServiceDataBuffer {
    name: String,
    limits: BufferLimits,
    self_ref: Weak<ServiceDataBuffer>,
    table: Mutex<VersionTable>,
}

impl std::fmt::Debug for ServiceDataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDataBuffer")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("current", &self.current_version())
            .finish()
    }
}

impl ServiceDataBuffer {
    pub fn new(name: impl Into<String>, limits: BufferLimits) -> AppResult<Arc<Self>> {
        let name = name.into();
        limits.check(&name)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            name,
            limits,
            self_ref: self_ref.clone(),
            table: Mutex::new(VersionTable {
                versions: BTreeMap::new(),
                current: None,
                next_version: 1,
                space_remaining: limits.max_bytes,
                retiring: BTreeSet::new(),
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new version of `size` bytes for writing.
    ///
    /// The version id is the handle's sequence number. Nothing is evicted: if
    /// the unretired versions leave too little room, the write is refused.
    pub fn get_writable(&self, size: usize) -> AppResult<WriteHandle> {
        if size == 0 {
            return Err(DaqError::EmptyChunkRequest(self.name.clone()));
        }
        if size > self.limits.max_chunk_bytes {
            return Err(DaqError::ChunkTooLarge {
                buffer: self.name.clone(),
                requested: size,
                max: self.limits.max_chunk_bytes,
            });
        }

        let mut table = self.table.lock();
        if size > table.space_remaining {
            return Err(DaqError::ServiceBufferFull {
                buffer: self.name.clone(),
                requested: size,
                remaining: table.space_remaining,
            });
        }

        let version = table.next_version;
        let observer: Weak<dyn ChunkObserver> = self.self_ref.clone();
        let chunk = LockableChunk::new(ChunkId(version), size, observer);
        let mut handle = chunk.acquire_write(size)?;
        handle.set_sequence(version);

        table.next_version += 1;
        table.space_remaining -= size;
        table.versions.insert(version, chunk);
        debug!(buffer = %self.name, version, size, "opened service data version");
        Ok(handle)
    }

    /// Read lock on the current version, if one has been committed.
    pub fn get_current(&self) -> Option<ServiceReadHandle> {
        let table = self.table.lock();
        let chunk = table.versions.get(&table.current?)?;
        chunk.acquire_read().ok().map(ServiceReadHandle)
    }

    /// Read lock on a specific, unretired version.
    pub fn get_version(&self, version: u64) -> AppResult<ServiceReadHandle> {
        let table = self.table.lock();
        let unknown = || DaqError::UnknownVersion {
            name: self.name.clone(),
            version,
        };
        if table.retiring.contains(&version) {
            return Err(unknown());
        }
        let chunk = table.versions.get(&version).ok_or_else(unknown)?;
        chunk
            .acquire_read()
            .map(ServiceReadHandle)
            .map_err(|_| unknown())
    }

    pub fn current_version(&self) -> Option<u64> {
        self.table.lock().current
    }

    /// Unretired version ids, oldest first.
    pub fn versions(&self) -> Vec<u64> {
        let table = self.table.lock();
        table
            .versions
            .keys()
            .filter(|v| !table.retiring.contains(v))
            .copied()
            .collect()
    }

    pub fn space_remaining(&self) -> usize {
        self.table.lock().space_remaining
    }

    /// Release a historic version. Its memory is freed as soon as no reader
    /// or writer holds it.
    pub fn retire(&self, version: u64) -> AppResult<()> {
        let mut table = self.table.lock();
        if table.current == Some(version) {
            return Err(DaqError::RetireCurrent {
                name: self.name.clone(),
                version,
            });
        }
        let Some(chunk) = table.versions.get(&version) else {
            return Err(DaqError::UnknownVersion {
                name: self.name.clone(),
                version,
            });
        };

        if chunk.readers() > 0 || chunk.phase() == ChunkPhase::Writing {
            debug!(buffer = %self.name, version, "version retired, waiting for release");
            table.retiring.insert(version);
        } else {
            table.free(version);
            debug!(buffer = %self.name, version, "version retired");
        }
        Ok(())
    }

    /// Retire every historic version not in `referenced`. Returns the ids
    /// retired.
    pub fn retire_unreferenced(&self, referenced: &HashSet<u64>) -> Vec<u64> {
        let stale: Vec<u64> = {
            let table = self.table.lock();
            table
                .versions
                .iter()
                .filter(|(v, c)| {
                    Some(**v) != table.current
                        && !referenced.contains(v)
                        && !table.retiring.contains(v)
                        && c.phase() != ChunkPhase::Writing
                })
                .map(|(v, _)| *v)
                .collect()
        };
        stale
            .into_iter()
            .filter(|v| self.retire(*v).is_ok())
            .collect()
    }
}

impl ChunkObserver for ServiceDataBuffer {
    fn chunk_activated(&self, chunk: &Arc<LockableChunk>) {
        let version = chunk.id().0;
        let mut table = self.table.lock();
        if table.retiring.contains(&version) {
            table.free(version);
            return;
        }
        if !table.versions.contains_key(&version) {
            return;
        }
        if table.current.map_or(true, |current| version > current) {
            table.current = Some(version);
            info!(buffer = %self.name, version, size = chunk.size(), "service data updated");
        }
    }

    fn chunk_emptied(&self, chunk: &Arc<LockableChunk>) {
        let version = chunk.id().0;
        let mut table = self.table.lock();
        if table.current == Some(version) {
            warn!(buffer = %self.name, version, "current service data was marked served and dropped");
            table.current = None;
        }
        table.free(version);
        debug!(buffer = %self.name, version, "service data version discarded");
    }

    fn chunk_idle(&self, chunk: &Arc<LockableChunk>) {
        let version = chunk.id().0;
        let mut table = self.table.lock();
        if table.retiring.contains(&version) {
            table.free(version);
            debug!(buffer = %self.name, version, "retired version released");
        }
    }
}

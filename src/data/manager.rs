//! Central registry of stream and service buffers.
//!
//! The `DataManager` owns one buffer per data type name for the lifetime of
//! the process. Producers ask it for writable storage by type; consumers ask
//! it for the next chunk matching a [`DataRequirements`] set, optionally
//! waiting on the shared [`ActivationSignal`] until one arrives.

use daq_pool::{AssociatedData, ReadHandle, WriteHandle};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BufferSettings;
use crate::data::requirements::{DataRequirements, DataSpec};
use crate::data::service_buffer::{ServiceDataBuffer, ServiceReadHandle};
use crate::data::signal::ActivationSignal;
use crate::data::stream_buffer::StreamDataBuffer;
use crate::error::{AppResult, DaqError};

/// A stream chunk plus the service data it was written against.
#[derive(Debug)]
pub struct MatchedData {
    pub stream_name: String,
    pub stream: ReadHandle,
    /// One entry per required service type that has data
    pub services: Vec<(String, ServiceReadHandle)>,
}

impl MatchedData {
    /// Mark the stream chunk delivered so it is recycled on release.
    pub fn mark_served(&self) {
        self.stream.mark_served();
    }
}

pub struct DataManager {
    buffers: BufferSettings,
    streams: RwLock<HashMap<String, Arc<StreamDataBuffer>>>,
    services: RwLock<HashMap<String, Arc<ServiceDataBuffer>>>,
    signal: Arc<ActivationSignal>,
    /// Held shared while a stream chunk takes its service manifest and
    /// exclusively while unreferenced versions are retired, so no version is
    /// retired between being snapshot and being recorded on a chunk.
    manifest_gate: RwLock<()>,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("spec", &self.data_spec())
            .finish()
    }
}

impl DataManager {
    pub fn new(buffers: BufferSettings) -> Self {
        Self {
            buffers,
            streams: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            signal: Arc::new(ActivationSignal::new()),
            manifest_gate: RwLock::new(()),
        }
    }

    pub fn signal(&self) -> &Arc<ActivationSignal> {
        &self.signal
    }

    /// The stream buffer for `name`, created on first use.
    pub fn stream_buffer(&self, name: &str) -> AppResult<Arc<StreamDataBuffer>> {
        if let Some(buffer) = self.streams.read().get(name) {
            return Ok(Arc::clone(buffer));
        }

        let mut streams = self.streams.write();
        if let Some(buffer) = streams.get(name) {
            return Ok(Arc::clone(buffer));
        }
        let limits = self.buffers.stream_limits(name);
        let buffer = StreamDataBuffer::new(name, limits, Arc::clone(&self.signal))?;
        info!(
            buffer = name,
            max_bytes = limits.max_bytes,
            max_chunk_bytes = limits.max_chunk_bytes,
            "Created stream buffer"
        );
        streams.insert(name.to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    /// The service buffer for `name`, created on first use.
    pub fn service_buffer(&self, name: &str) -> AppResult<Arc<ServiceDataBuffer>> {
        if let Some(buffer) = self.services.read().get(name) {
            return Ok(Arc::clone(buffer));
        }

        let mut services = self.services.write();
        if let Some(buffer) = services.get(name) {
            return Ok(Arc::clone(buffer));
        }
        let limits = self.buffers.service_limits(name);
        let buffer = ServiceDataBuffer::new(name, limits)?;
        info!(
            buffer = name,
            max_bytes = limits.max_bytes,
            max_chunk_bytes = limits.max_chunk_bytes,
            "Created service buffer"
        );
        services.insert(name.to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    pub fn find_stream(&self, name: &str) -> Option<Arc<StreamDataBuffer>> {
        self.streams.read().get(name).cloned()
    }

    pub fn find_service(&self, name: &str) -> Option<Arc<ServiceDataBuffer>> {
        self.services.read().get(name).cloned()
    }

    /// Current version of every service data set that has one.
    pub fn current_service_versions(&self) -> Vec<AssociatedData> {
        let mut versions: Vec<AssociatedData> = self
            .services
            .read()
            .iter()
            .filter_map(|(name, buffer)| {
                buffer
                    .current_version()
                    .map(|version| AssociatedData::new(name.clone(), version))
            })
            .collect();
        versions.sort();
        versions
    }

    /// Writable storage in stream buffer `name`, tagged with the service data
    /// versions current right now.
    pub fn get_writable(&self, name: &str, size: usize) -> AppResult<WriteHandle> {
        let buffer = self.stream_buffer(name)?;
        let _gate = self.manifest_gate.read();
        buffer.get_writable_with(size, self.current_service_versions())
    }

    /// Writable storage for a new version of service data `name`.
    ///
    /// A full buffer first gives up the versions no resident stream chunk
    /// still names, then the write is tried once more.
    pub fn get_service_writable(&self, name: &str, size: usize) -> AppResult<WriteHandle> {
        let buffer = self.service_buffer(name)?;
        match buffer.get_writable(size) {
            Err(DaqError::ServiceBufferFull { .. })
                if self.retire_unreferenced_service_versions() > 0 =>
            {
                buffer.get_writable(size)
            }
            result => result,
        }
    }

    /// Union of all registered buffer types.
    pub fn data_spec(&self) -> DataSpec {
        let mut spec = DataSpec::new();
        for name in self.streams.read().keys() {
            spec.add_stream(name.clone());
        }
        for name in self.services.read().keys() {
            spec.add_service(name.clone());
        }
        spec
    }

    /// Fail if `requirements` name a type no buffer provides.
    pub fn verify(&self, requirements: &DataRequirements) -> AppResult<()> {
        match self.data_spec().missing(requirements).into_iter().next() {
            Some(name) => Err(DaqError::UnregisteredDataType(name)),
            None => Ok(()),
        }
    }

    /// The oldest unread chunk from the first required stream type that has
    /// one, with read locks on the service data it depends on.
    ///
    /// Service data is taken at the version recorded in the chunk's manifest
    /// when that version is still held, and at the current version otherwise.
    pub fn get_data_matching(&self, requirements: &DataRequirements) -> Option<MatchedData> {
        for name in requirements.streams() {
            let Some(buffer) = self.find_stream(name) else {
                continue;
            };
            let Some(stream) = buffer.get_next() else {
                continue;
            };

            let services = requirements
                .services()
                .iter()
                .filter_map(|service| {
                    let handle = self.service_handle(service, stream.associated())?;
                    Some((service.clone(), handle))
                })
                .collect();

            return Some(MatchedData {
                stream_name: name.clone(),
                stream,
                services,
            });
        }
        None
    }

    fn service_handle(&self, name: &str, manifest: &[AssociatedData]) -> Option<ServiceReadHandle> {
        let buffer = self.find_service(name)?;
        manifest
            .iter()
            .find(|entry| entry.name == name)
            .and_then(|entry| buffer.get_version(entry.version).ok())
            .or_else(|| buffer.get_current())
    }

    fn first_match(&self, options: &[DataRequirements]) -> Option<MatchedData> {
        options.iter().find_map(|reqs| self.get_data_matching(reqs))
    }

    /// Wait up to `timeout` for a chunk matching any of `options`, tried in
    /// order.
    pub async fn wait_for_data(
        &self,
        options: &[DataRequirements],
        timeout: Duration,
    ) -> Option<MatchedData> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(matched) = self.first_match(options) {
                return Some(matched);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(timeout_ms = timeout.as_millis() as u64, "no matching data before timeout");
                return None;
            }
        }
    }

    /// Blocking form of [`wait_for_data`](Self::wait_for_data) for pipeline
    /// threads.
    pub fn wait_for_data_blocking(
        &self,
        options: &[DataRequirements],
        timeout: Duration,
    ) -> Option<MatchedData> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.signal.generation();
            if let Some(matched) = self.first_match(options) {
                return Some(matched);
            }
            if !self.signal.wait_past(seen, deadline) {
                return None;
            }
        }
    }

    /// Retire service data versions that are neither current nor named by any
    /// resident stream chunk. Returns how many were retired.
    pub fn retire_unreferenced_service_versions(&self) -> usize {
        let _gate = self.manifest_gate.write();
        let mut referenced: HashMap<String, HashSet<u64>> = HashMap::new();
        for buffer in self.streams.read().values() {
            for entry in buffer.referenced_service_versions() {
                referenced.entry(entry.name).or_default().insert(entry.version);
            }
        }

        let empty = HashSet::new();
        let mut retired = 0;
        for (name, buffer) in self.services.read().iter() {
            let versions = buffer.retire_unreferenced(referenced.get(name).unwrap_or(&empty));
            if !versions.is_empty() {
                debug!(buffer = %name, ?versions, "retired unreferenced service data");
            }
            retired += versions.len();
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferLimits;

    fn manager() -> Arc<DataManager> {
        Arc::new(DataManager::new(BufferSettings::uniform(BufferLimits::new(
            1024, 256,
        ))))
    }

    fn write_stream(manager: &DataManager, name: &str, content: &[u8]) {
        let mut handle = manager.get_writable(name, content.len()).unwrap();
        handle.write(content);
    }

    fn write_service(manager: &DataManager, name: &str, content: &[u8]) -> u64 {
        let mut handle = manager.get_service_writable(name, content.len()).unwrap();
        handle.write(content);
        handle.sequence()
    }

    #[test]
    fn test_buffers_created_once() {
        let manager = manager();
        let a = manager.stream_buffer("T").unwrap();
        let b = manager.stream_buffer("T").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.find_stream("U").is_none());
        assert!(manager.find_service("T").is_none());
    }

    #[test]
    fn test_zero_sized_buffer_is_fatal() {
        let settings = BufferSettings::default().with_stream("T", BufferLimits::new(0, 0));
        let manager = DataManager::new(settings);
        let err = manager.stream_buffer("T").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_data_spec_and_verify() {
        let manager = manager();
        manager.stream_buffer("T").unwrap();
        manager.service_buffer("S").unwrap();

        let spec = manager.data_spec();
        assert!(spec.streams().contains("T"));
        assert!(spec.services().contains("S"));

        manager
            .verify(&DataRequirements::for_stream("T").with_service("S"))
            .unwrap();
        let err = manager
            .verify(&DataRequirements::for_stream("missing"))
            .unwrap_err();
        assert!(matches!(err, DaqError::UnregisteredDataType(ref name) if name == "missing"));
    }

    #[test]
    fn test_stream_chunk_carries_service_manifest() {
        let manager = manager();
        assert_eq!(write_service(&manager, "S", b"positions v1"), 1);
        write_stream(&manager, "T", b"visibilities");

        let reqs = DataRequirements::for_stream("T").with_service("S");
        let matched = manager.get_data_matching(&reqs).unwrap();
        assert_eq!(matched.stream_name, "T");
        assert_eq!(matched.stream.data(), b"visibilities");
        assert_eq!(matched.stream.associated(), &[AssociatedData::new("S", 1)]);
        assert_eq!(matched.services.len(), 1);
        assert_eq!(matched.services[0].1.data(), b"positions v1");
    }

    #[test]
    fn test_service_version_follows_manifest() {
        let manager = manager();
        write_service(&manager, "S", b"old");
        write_stream(&manager, "T", b"first");
        write_service(&manager, "S", b"new");

        let reqs = DataRequirements::for_stream("T").with_service("S");
        let matched = manager.get_data_matching(&reqs).unwrap();
        assert_eq!(matched.services[0].1.data(), b"old");
    }

    #[test]
    fn test_matching_tries_each_stream() {
        let manager = manager();
        manager.stream_buffer("A").unwrap();
        write_stream(&manager, "B", b"b-data");

        let reqs = DataRequirements::new().with_stream("A").with_stream("B");
        let matched = manager.get_data_matching(&reqs).unwrap();
        assert_eq!(matched.stream_name, "B");
        matched.mark_served();
        drop(matched);
        assert!(manager.get_data_matching(&reqs).is_none());
    }

    #[test]
    fn test_retire_unreferenced_versions() {
        let manager = manager();
        write_service(&manager, "S", b"v1");
        write_stream(&manager, "T", b"chunk");
        write_service(&manager, "S", b"v2");
        write_service(&manager, "S", b"v3");

        // v1 is referenced by the resident chunk, v3 is current
        assert_eq!(manager.retire_unreferenced_service_versions(), 1);
        let service = manager.find_service("S").unwrap();
        assert_eq!(service.versions(), vec![1, 3]);

        let matched = manager
            .get_data_matching(&DataRequirements::for_stream("T"))
            .unwrap();
        matched.mark_served();
        drop(matched);
        assert_eq!(manager.retire_unreferenced_service_versions(), 1);
        assert_eq!(service.versions(), vec![3]);
    }

    #[test]
    fn test_service_updates_without_stream_traffic() {
        let manager = manager();
        for i in 1..=20u8 {
            let mut handle = manager.get_service_writable("positions", 100).unwrap();
            handle.data_mut().fill(i);
        }

        let service = manager.find_service("positions").unwrap();
        assert_eq!(service.current_version(), Some(20));
        assert!(service.get_current().unwrap().data().iter().all(|&b| b == 20));
        assert!(service.versions().len() <= 10);
    }

    #[test]
    fn test_full_service_buffer_keeps_referenced_versions() {
        let manager = manager();
        for i in 1..=10u8 {
            write_service(&manager, "S", &[i; 100]);
            write_stream(&manager, "T", &[i]);
        }

        // Every version is named by a resident chunk, so nothing can go
        let err = manager.get_service_writable("S", 100).unwrap_err();
        assert!(matches!(err, DaqError::ServiceBufferFull { .. }));
        assert_eq!(manager.find_service("S").unwrap().current_version(), Some(10));
    }

    #[test]
    fn test_manifest_never_names_retired_version() {
        let manager = manager();
        write_service(&manager, "S", b"v1");

        let retirer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    write_service(&manager, "S", b"next");
                    manager.retire_unreferenced_service_versions();
                }
            })
        };

        let service = manager.find_service("S").unwrap();
        for _ in 0..200 {
            let handle = manager.get_writable("T", 1).unwrap();
            for entry in handle.associated() {
                assert!(service.get_version(entry.version).is_ok());
            }
            drop(handle);
        }
        retirer.join().unwrap();
    }

    #[test]
    fn test_marking_served_leaves_service_data_current() {
        let manager = manager();
        write_service(&manager, "S", b"positions");
        write_stream(&manager, "T", b"chunk");

        let reqs = DataRequirements::for_stream("T").with_service("S");
        let matched = manager.get_data_matching(&reqs).unwrap();
        assert_eq!(matched.services[0].1.version(), 1);
        matched.mark_served();
        drop(matched);

        let service = manager.find_service("S").unwrap();
        assert_eq!(service.current_version(), Some(1));
        assert_eq!(service.get_current().unwrap().data(), b"positions");
    }

    #[test]
    fn test_wait_blocking_times_out() {
        let manager = manager();
        manager.stream_buffer("T").unwrap();
        let started = Instant::now();
        let result = manager.wait_for_data_blocking(
            &[DataRequirements::for_stream("T")],
            Duration::from_millis(50),
        );
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_blocking_wakes_on_write() {
        let manager = manager();
        manager.stream_buffer("T").unwrap();

        let producer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                write_stream(&manager, "T", b"late");
            })
        };

        let matched = manager
            .wait_for_data_blocking(&[DataRequirements::for_stream("T")], Duration::from_secs(5))
            .unwrap();
        assert_eq!(matched.stream.data(), b"late");
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async_wakes_on_write() {
        let manager = manager();
        manager.stream_buffer("T").unwrap();

        let producer = {
            let manager = Arc::clone(&manager);
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(20));
                write_stream(&manager, "T", b"async");
            })
        };

        let matched = manager
            .wait_for_data(&[DataRequirements::for_stream("T")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(matched.stream.data(), b"async");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_async_times_out() {
        let manager = manager();
        let result = manager
            .wait_for_data(&[DataRequirements::for_stream("T")], Duration::from_millis(30))
            .await;
        assert!(result.is_none());
    }
}

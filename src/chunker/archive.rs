//! Replays a chunk archive into the buffers named by its records.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::archive::ArchiveReader;
use crate::chunker::{ChunkWriter, Chunker, NextOutcome};
use crate::config::ChunkerConfig;
use crate::error::{AppResult, DaqError};

/// Records whose type is not among `data_types` are skipped.
pub struct ArchiveChunker {
    label: String,
    data_types: Vec<String>,
    path: PathBuf,
    interval: Option<Duration>,
}

impl ArchiveChunker {
    pub fn from_config(config: &ChunkerConfig) -> AppResult<Self> {
        let path = config.path.clone().ok_or_else(|| {
            DaqError::Configuration(format!("archive chunker '{}' needs a path", config.label()))
        })?;
        Ok(Self {
            label: config.label(),
            data_types: config.data_types.clone(),
            path,
            interval: config.interval_ms.map(Duration::from_millis),
        })
    }
}

impl Chunker for ArchiveChunker {
    type Device = ArchiveReader<BufReader<File>>;

    fn data_types(&self) -> &[String] {
        &self.data_types
    }

    fn new_device(&self) -> AppResult<Self::Device> {
        let file = File::open(&self.path).map_err(|source| DaqError::Device {
            chunker: self.label.clone(),
            source,
        })?;
        let reader = ArchiveReader::open(BufReader::new(file))?;
        info!(
            chunker = %self.label,
            path = %self.path.display(),
            homogeneous = reader.is_homogeneous(),
            "archive opened"
        );
        Ok(reader)
    }

    fn next(&mut self, reader: &mut Self::Device, writer: &ChunkWriter) -> AppResult<NextOutcome> {
        let Some(record) = reader.next_record()? else {
            info!(chunker = %self.label, "archive replay finished");
            return Ok(NextOutcome::Exhausted);
        };

        if !self.data_types.contains(&record.type_name) {
            debug!(chunker = %self.label, type_name = %record.type_name, "skipping record");
            return Ok(NextOutcome::Idle);
        }
        if record.data.is_empty() {
            return Ok(NextOutcome::Idle);
        }

        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }
        Ok(match writer.write(&record.type_name, &record.data)? {
            true => NextOutcome::Written,
            false => NextOutcome::Dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::config::{BufferLimits, BufferSettings, ChunkerRole};
    use crate::data::{DataManager, DataRequirements};
    use std::sync::Arc;

    #[test]
    fn test_replays_declared_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.daq");
        let mut archive = ArchiveWriter::create(&path).unwrap();
        archive.write_record("T", b"first").unwrap();
        archive.write_record("other", b"ignored").unwrap();
        archive.write_record("T", b"second").unwrap();
        archive.finish().unwrap();

        let config = ChunkerConfig::new("archive", ["T"]).with_path(&path);
        let mut chunker = ArchiveChunker::from_config(&config).unwrap();
        let mut device = chunker.new_device().unwrap();
        let manager = Arc::new(DataManager::new(BufferSettings::uniform(
            BufferLimits::new(1024, 256),
        )));
        let writer = ChunkWriter::new(Arc::clone(&manager), ChunkerRole::Stream, "archive");

        let outcomes: Vec<NextOutcome> = (0..4)
            .map(|_| chunker.next(&mut device, &writer).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                NextOutcome::Written,
                NextOutcome::Idle,
                NextOutcome::Written,
                NextOutcome::Exhausted
            ]
        );

        let reqs = DataRequirements::for_stream("T");
        let first = manager.get_data_matching(&reqs).unwrap();
        assert_eq!(first.stream.data(), b"first");
        assert!(manager.find_stream("other").is_none());
    }

    #[test]
    fn test_corrupt_archive_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.daq");
        std::fs::write(&path, b"garbage, not an archive").unwrap();

        let config = ChunkerConfig::new("archive", ["T"]).with_path(&path);
        let chunker = ArchiveChunker::from_config(&config).unwrap();
        assert!(matches!(chunker.new_device(), Err(DaqError::Format(_))));
    }
}

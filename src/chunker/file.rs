//! Replays a raw file into a stream buffer in `chunk_size` units.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::chunker::{ChunkWriter, Chunker, NextOutcome};
use crate::config::ChunkerConfig;
use crate::error::{AppResult, DaqError};

pub struct FileChunker {
    label: String,
    data_types: Vec<String>,
    path: PathBuf,
    chunk_size: usize,
    interval: Option<Duration>,
    scratch: Vec<u8>,
}

impl FileChunker {
    pub fn from_config(config: &ChunkerConfig) -> AppResult<Self> {
        let path = config.path.clone().ok_or_else(|| {
            DaqError::Configuration(format!("file chunker '{}' needs a path", config.label()))
        })?;
        Ok(Self {
            label: config.label(),
            data_types: config.data_types.clone(),
            path,
            chunk_size: config.chunk_size,
            interval: config.interval_ms.map(Duration::from_millis),
            scratch: Vec::new(),
        })
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Chunker for FileChunker {
    type Device = BufReader<File>;

    fn data_types(&self) -> &[String] {
        &self.data_types
    }

    fn new_device(&self) -> AppResult<BufReader<File>> {
        let file = File::open(&self.path).map_err(|source| DaqError::Device {
            chunker: self.label.clone(),
            source,
        })?;
        info!(chunker = %self.label, path = %self.path.display(), "file chunker opened");
        Ok(BufReader::new(file))
    }

    fn next(
        &mut self,
        reader: &mut BufReader<File>,
        writer: &ChunkWriter,
    ) -> AppResult<NextOutcome> {
        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }

        let data_type = self.data_types.first().cloned().unwrap_or_default();
        let Some(mut handle) = writer.writable(&data_type, self.chunk_size)? else {
            self.scratch.resize(self.chunk_size, 0);
            return Ok(match read_full(reader, &mut self.scratch)? {
                0 => NextOutcome::Exhausted,
                _ => NextOutcome::Dropped,
            });
        };

        let read = read_full(reader, handle.spare_mut())?;
        handle.advance(read);
        if read == 0 {
            info!(chunker = %self.label, "end of file");
            return Ok(NextOutcome::Exhausted);
        }
        debug!(chunker = %self.label, bytes = read, "chunk read from file");
        Ok(NextOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferLimits, BufferSettings, ChunkerRole};
    use crate::data::{DataManager, DataRequirements};
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_reads_file_in_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let config = ChunkerConfig::new("file", ["T"])
            .with_path(file.path())
            .with_chunk_size(4);
        let mut chunker = FileChunker::from_config(&config).unwrap();
        let mut device = chunker.new_device().unwrap();
        let manager = Arc::new(DataManager::new(BufferSettings::uniform(
            BufferLimits::new(1024, 256),
        )));
        let writer = ChunkWriter::new(Arc::clone(&manager), ChunkerRole::Stream, "file");

        let mut outcomes = Vec::new();
        loop {
            let outcome = chunker.next(&mut device, &writer).unwrap();
            outcomes.push(outcome);
            if outcome == NextOutcome::Exhausted {
                break;
            }
        }
        assert_eq!(outcomes.len(), 4);

        let reqs = DataRequirements::for_stream("T");
        let mut chunks = Vec::new();
        while let Some(matched) = manager.get_data_matching(&reqs) {
            chunks.push(matched.stream.data().to_vec());
            matched.mark_served();
        }
        assert_eq!(chunks, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);
    }

    #[test]
    fn test_missing_file_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChunkerConfig::new("file", ["T"]).with_path(dir.path().join("absent.bin"));
        let chunker = FileChunker::from_config(&config).unwrap();
        assert!(matches!(
            chunker.new_device(),
            Err(DaqError::Device { .. })
        ));
    }

    #[test]
    fn test_requires_path() {
        assert!(FileChunker::from_config(&ChunkerConfig::new("file", ["T"])).is_err());
    }
}

//! Synthetic data source for demos and tests.
//!
//! Each chunk starts with its big-endian sequence counter followed by random
//! noise. One chunk is written to every declared data type per step.

use rand::RngCore;
use std::time::Duration;
use tracing::info;

use crate::chunker::{ChunkWriter, Chunker, NextOutcome};
use crate::config::ChunkerConfig;
use crate::error::AppResult;

const COUNTER_BYTES: usize = std::mem::size_of::<u64>();

pub struct GeneratorChunker {
    label: String,
    data_types: Vec<String>,
    chunk_size: usize,
    interval: Option<Duration>,
    count: Option<u64>,
}

/// Generator state: how many steps have been taken.
#[derive(Debug, Default)]
pub struct Counter {
    emitted: u64,
}

impl Counter {
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl GeneratorChunker {
    pub fn from_config(config: &ChunkerConfig) -> AppResult<Self> {
        Ok(Self {
            label: config.label(),
            data_types: config.data_types.clone(),
            chunk_size: config.chunk_size,
            interval: config.interval_ms.map(Duration::from_millis),
            count: config.count,
        })
    }

    fn fill(counter: u64, chunk: &mut [u8]) {
        let header = counter.to_be_bytes();
        let split = COUNTER_BYTES.min(chunk.len());
        chunk[..split].copy_from_slice(&header[..split]);
        rand::thread_rng().fill_bytes(&mut chunk[split..]);
    }
}

impl Chunker for GeneratorChunker {
    type Device = Counter;

    fn data_types(&self) -> &[String] {
        &self.data_types
    }

    fn new_device(&self) -> AppResult<Counter> {
        info!(
            chunker = %self.label,
            chunk_size = self.chunk_size,
            count = ?self.count,
            "generator started"
        );
        Ok(Counter::default())
    }

    fn next(&mut self, counter: &mut Counter, writer: &ChunkWriter) -> AppResult<NextOutcome> {
        if self.count.is_some_and(|count| counter.emitted >= count) {
            return Ok(NextOutcome::Exhausted);
        }
        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }

        counter.emitted += 1;
        let mut outcome = NextOutcome::Dropped;
        for data_type in &self.data_types {
            if let Some(mut handle) = writer.writable(data_type, self.chunk_size)? {
                Self::fill(counter.emitted, handle.data_mut());
                outcome = NextOutcome::Written;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferLimits, BufferSettings, ChunkerRole};
    use crate::data::{DataManager, DataRequirements};
    use std::sync::Arc;

    fn run(config: ChunkerConfig) -> (Arc<DataManager>, Vec<NextOutcome>) {
        let mut chunker = GeneratorChunker::from_config(&config).unwrap();
        let mut counter = chunker.new_device().unwrap();
        let manager = Arc::new(DataManager::new(BufferSettings::uniform(
            BufferLimits::new(1024, 256),
        )));
        let writer = ChunkWriter::new(Arc::clone(&manager), ChunkerRole::Stream, "gen");
        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let outcome = chunker.next(&mut counter, &writer).unwrap();
            outcomes.push(outcome);
            if outcome == NextOutcome::Exhausted {
                break;
            }
        }
        (manager, outcomes)
    }

    #[test]
    fn test_counted_generator_stops() {
        let (manager, outcomes) = run(
            ChunkerConfig::new("generator", ["T"])
                .with_chunk_size(32)
                .with_count(3),
        );
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.last(), Some(&NextOutcome::Exhausted));

        let reqs = DataRequirements::for_stream("T");
        for expected in 1..=3u64 {
            let matched = manager.get_data_matching(&reqs).unwrap();
            let header: [u8; 8] = matched.stream.data()[..8].try_into().unwrap();
            assert_eq!(u64::from_be_bytes(header), expected);
            assert_eq!(matched.stream.len(), 32);
            matched.mark_served();
        }
    }

    #[test]
    fn test_writes_every_data_type() {
        let (manager, _) = run(
            ChunkerConfig::new("generator", ["A", "B"])
                .with_chunk_size(16)
                .with_count(1),
        );
        assert_eq!(manager.find_stream("A").unwrap().serve_queue_len(), 1);
        assert_eq!(manager.find_stream("B").unwrap().serve_queue_len(), 1);
    }

    #[test]
    fn test_short_chunks_hold_partial_counter() {
        let mut chunk = [0u8; 3];
        GeneratorChunker::fill(0x0102_0304_0506_0708, &mut chunk);
        assert_eq!(chunk, [0x01, 0x02, 0x03]);
    }
}

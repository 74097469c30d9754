//! Name-to-constructor table for chunker kinds.
//!
//! The registry is an ordinary value built at start-up and handed to the
//! [`ChunkerManager`](super::ChunkerManager); tests can build one holding only
//! the kinds they need.

use std::collections::HashMap;

use crate::chunker::archive::ArchiveChunker;
use crate::chunker::file::FileChunker;
use crate::chunker::generator::GeneratorChunker;
use crate::chunker::udp::UdpChunker;
use crate::chunker::{AnyChunker, Chunker};
use crate::config::ChunkerConfig;
use crate::error::{AppResult, DaqError};

type ChunkerFactory =
    Box<dyn Fn(&ChunkerConfig) -> AppResult<Box<dyn AnyChunker>> + Send + Sync>;

pub struct ChunkerRegistry {
    factories: HashMap<String, ChunkerFactory>,
}

impl Default for ChunkerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ChunkerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the `udp`, `file`, `archive` and `generator` kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("udp", UdpChunker::from_config);
        registry.register("file", FileChunker::from_config);
        registry.register("archive", ArchiveChunker::from_config);
        registry.register("generator", GeneratorChunker::from_config);
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<C, F>(&mut self, kind: impl Into<String>, factory: F)
    where
        C: Chunker,
        F: Fn(&ChunkerConfig) -> AppResult<C> + Send + Sync + 'static,
    {
        self.factories.insert(
            kind.into(),
            Box::new(move |config| Ok(Box::new(factory(config)?) as Box<dyn AnyChunker>)),
        );
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn create(&self, config: &ChunkerConfig) -> AppResult<Box<dyn AnyChunker>> {
        self.factories
            .get(&config.kind)
            .ok_or_else(|| DaqError::UnknownChunker(config.kind.clone()))
            .and_then(|factory| factory(config))
    }
}

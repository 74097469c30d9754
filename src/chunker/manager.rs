//! Binds registered chunkers to buffers and runs each on its own thread.
//!
//! Registration validates endpoints eagerly: two chunkers on the same
//! `host:port` is a configuration error raised by the second `add_*` call.
//! [`ChunkerManager::init`] creates every target buffer and opens every
//! device before any thread starts, so a device that fails to open aborts the
//! whole start-up and nothing is left half running.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use crate::chunker::{AnyChunker, ChunkWriter, ChunkerRegistry, NextOutcome, OpenChunker};
use crate::config::{ChunkerConfig, ChunkerRole, Settings};
use crate::data::DataManager;
use crate::error::{AppResult, DaqError};

struct Registered {
    label: String,
    role: ChunkerRole,
    chunker: Box<dyn AnyChunker>,
}

struct Running {
    label: String,
    thread: JoinHandle<()>,
}

pub struct ChunkerManager {
    registry: ChunkerRegistry,
    pending: Vec<Registered>,
    endpoints: HashSet<(String, u16)>,
    running: Vec<Running>,
    stop: Arc<AtomicBool>,
}

impl ChunkerManager {
    pub fn new(registry: ChunkerRegistry) -> Self {
        Self {
            registry,
            pending: Vec::new(),
            endpoints: HashSet::new(),
            running: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A manager with every chunker from `settings` registered.
    pub fn from_settings(registry: ChunkerRegistry, settings: &Settings) -> AppResult<Self> {
        let mut manager = Self::new(registry);
        for config in &settings.chunkers {
            manager.add_chunker(config.clone())?;
        }
        Ok(manager)
    }

    /// Register a chunker feeding stream buffers.
    pub fn add_stream_chunker(&mut self, config: ChunkerConfig) -> AppResult<()> {
        self.register(ChunkerConfig {
            role: ChunkerRole::Stream,
            ..config
        })
    }

    /// Register a chunker feeding service buffers.
    pub fn add_service_chunker(&mut self, config: ChunkerConfig) -> AppResult<()> {
        self.register(ChunkerConfig {
            role: ChunkerRole::Service,
            ..config
        })
    }

    /// Register a chunker according to its configured role.
    pub fn add_chunker(&mut self, config: ChunkerConfig) -> AppResult<()> {
        self.register(config)
    }

    fn register(&mut self, config: ChunkerConfig) -> AppResult<()> {
        if config.data_types.is_empty() {
            return Err(DaqError::Configuration(format!(
                "chunker '{}' does not declare any data types",
                config.label()
            )));
        }
        let endpoint = config.endpoint();
        if let Some((host, port)) = &endpoint {
            if self.endpoints.contains(&(host.clone(), *port)) {
                return Err(DaqError::EndpointInUse {
                    host: host.clone(),
                    port: *port,
                });
            }
        }

        let chunker = self.registry.create(&config)?;
        if let Some(endpoint) = endpoint {
            self.endpoints.insert(endpoint);
        }
        info!(
            chunker = %config.label(),
            kind = %config.kind,
            role = ?config.role,
            data_types = ?config.data_types,
            "Registered chunker"
        );
        self.pending.push(Registered {
            label: config.label(),
            role: config.role,
            chunker,
        });
        Ok(())
    }

    /// Chunkers registered but not yet started.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Threads still running.
    pub fn running_count(&self) -> usize {
        self.running
            .iter()
            .filter(|r| !r.thread.is_finished())
            .count()
    }

    /// Create target buffers, open all devices and start one thread per
    /// chunker.
    pub fn init(&mut self, data: Arc<DataManager>) -> AppResult<()> {
        for registered in &self.pending {
            for data_type in registered.chunker.data_types() {
                match registered.role {
                    ChunkerRole::Stream => data.stream_buffer(data_type).map(drop)?,
                    ChunkerRole::Service => data.service_buffer(data_type).map(drop)?,
                }
            }
        }

        let mut opened: Vec<(String, ChunkerRole, Box<dyn OpenChunker>)> = Vec::new();
        for registered in std::mem::take(&mut self.pending) {
            let device = registered.chunker.open()?;
            opened.push((registered.label, registered.role, device));
        }

        self.stop.store(false, Ordering::SeqCst);
        for (label, role, chunker) in opened {
            let writer = ChunkWriter::new(Arc::clone(&data), role, label.clone());
            let stop = Arc::clone(&self.stop);
            let thread = std::thread::Builder::new()
                .name(format!("chunker-{}", label))
                .spawn(move || run_chunker(chunker, writer, stop))?;
            self.running.push(Running { label, thread });
        }
        info!(count = self.running.len(), "Chunkers started");
        Ok(())
    }

    /// Signal every chunker thread to stop and wait for them.
    ///
    /// A chunk being written when the stop is requested is completed first.
    pub fn stop(&mut self) -> AppResult<()> {
        if self.running.is_empty() {
            return Ok(());
        }
        self.stop.store(true, Ordering::SeqCst);

        let mut errors = Vec::new();
        for running in self.running.drain(..) {
            if running.thread.join().is_err() {
                error!(chunker = %running.label, "chunker thread panicked");
                errors.push(DaqError::Configuration(format!(
                    "chunker '{}' panicked",
                    running.label
                )));
            }
        }
        info!("Chunkers stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Drop for ChunkerManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "chunker shutdown failed");
        }
    }
}

fn run_chunker(mut chunker: Box<dyn OpenChunker>, writer: ChunkWriter, stop: Arc<AtomicBool>) {
    info!(chunker = %writer.label(), "chunker thread started");
    while !stop.load(Ordering::Relaxed) {
        match chunker.step(&writer) {
            Ok(NextOutcome::Exhausted) => {
                info!(chunker = %writer.label(), "source exhausted");
                break;
            }
            Ok(outcome) => debug!(chunker = %writer.label(), ?outcome, "step"),
            Err(e) => {
                error!(chunker = %writer.label(), error = %e, "chunker failed");
                break;
            }
        }
    }
    info!(
        chunker = %writer.label(),
        dropped = writer.dropped(),
        "chunker thread exiting"
    );
}

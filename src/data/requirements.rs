//! Declarative descriptions of the data a pipeline needs and a server provides.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// The named data types one pipeline needs in order to run.
///
/// Equality and hashing ignore insertion order; [`fingerprint`](Self::fingerprint)
/// gives the same content-addressed id for equal requirement sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRequirements {
    streams: BTreeSet<String>,
    services: BTreeSet<String>,
}

impl DataRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requirements naming a single stream type.
    pub fn for_stream(name: impl Into<String>) -> Self {
        Self::new().with_stream(name)
    }

    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.streams.insert(name.into());
        self
    }

    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.services.insert(name.into());
        self
    }

    pub fn add_stream(&mut self, name: impl Into<String>) {
        self.streams.insert(name.into());
    }

    pub fn add_service(&mut self, name: impl Into<String>) {
        self.services.insert(name.into());
    }

    pub fn streams(&self) -> &BTreeSet<String> {
        &self.streams
    }

    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.services.is_empty()
    }

    /// Hex SHA-256 over the sorted stream and service names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for name in &self.streams {
            hasher.update(b"stream\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }
        for name in &self.services {
            hasher.update(b"service\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Display for DataRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        write!(
            f,
            "streams[{}] services[{}]",
            join(&self.streams),
            join(&self.services)
        )
    }
}

/// The data types a server can provide: the union of its buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpec {
    streams: BTreeSet<String>,
    services: BTreeSet<String>,
}

impl DataSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&mut self, name: impl Into<String>) {
        self.streams.insert(name.into());
    }

    pub fn add_service(&mut self, name: impl Into<String>) {
        self.services.insert(name.into());
    }

    pub fn streams(&self) -> &BTreeSet<String> {
        &self.streams
    }

    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    pub fn provides(&self, name: &str) -> bool {
        self.streams.contains(name) || self.services.contains(name)
    }

    /// Names required by `requirements` that are not provided here.
    pub fn missing(&self, requirements: &DataRequirements) -> Vec<String> {
        requirements
            .streams()
            .iter()
            .filter(|name| !self.streams.contains(*name))
            .chain(
                requirements
                    .services()
                    .iter()
                    .filter(|name| !self.services.contains(*name)),
            )
            .cloned()
            .collect()
    }

    /// True if every type named in `requirements` is provided.
    pub fn is_compatible(&self, requirements: &DataRequirements) -> bool {
        self.missing(requirements).is_empty()
    }

    pub fn merge(&mut self, other: &DataSpec) {
        self.streams.extend(other.streams.iter().cloned());
        self.services.extend(other.services.iter().cloned());
    }
}

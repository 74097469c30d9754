//! UDP packet chunker.
//!
//! Binds `host:port` and gathers `packets_per_chunk` datagrams of up to
//! `packet_size` bytes into each chunk, so one chunk holds one correlator
//! integration. The socket uses a short read timeout so the chunker thread
//! notices stop requests while the link is quiet.
//!
//! When no storage is available the chunk's worth of packets is still read
//! off the socket and discarded; the network read path never stalls.

use std::io;
use std::net::UdpSocket;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunker::{ChunkWriter, Chunker, NextOutcome};
use crate::config::ChunkerConfig;
use crate::error::{AppResult, DaqError};

/// Read timeout used to poll for stop requests.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest datagram accepted when `packet_size` is not configured.
const MAX_DATAGRAM_SIZE: usize = 65536;

pub struct UdpChunker {
    label: String,
    data_types: Vec<String>,
    host: String,
    port: u16,
    packet_size: usize,
    packets_per_chunk: usize,
    scratch: Vec<u8>,
}

impl UdpChunker {
    pub fn from_config(config: &ChunkerConfig) -> AppResult<Self> {
        let (host, port) = config.endpoint().ok_or_else(|| {
            DaqError::Configuration(format!("udp chunker '{}' needs a port", config.label()))
        })?;
        let packet_size = config.packet_size.unwrap_or(MAX_DATAGRAM_SIZE);
        let packets_per_chunk = config.packets_per_chunk.unwrap_or(1);
        if packet_size == 0 || packets_per_chunk == 0 {
            return Err(DaqError::Configuration(format!(
                "udp chunker '{}': packet_size and packets_per_chunk must be > 0",
                config.label()
            )));
        }

        Ok(Self {
            label: config.label(),
            data_types: config.data_types.clone(),
            host,
            port,
            packet_size,
            packets_per_chunk,
            scratch: vec![0u8; packet_size],
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.packet_size * self.packets_per_chunk
    }

    fn data_type(&self) -> &str {
        self.data_types.first().map(String::as_str).unwrap_or_default()
    }

    /// Receive one datagram, `None` on read timeout.
    fn recv(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Chunker for UdpChunker {
    type Device = UdpSocket;

    fn data_types(&self) -> &[String] {
        &self.data_types
    }

    fn new_device(&self) -> AppResult<UdpSocket> {
        let open = || -> io::Result<UdpSocket> {
            let socket = UdpSocket::bind((self.host.as_str(), self.port))?;
            socket.set_read_timeout(Some(READ_TIMEOUT))?;
            Ok(socket)
        };
        let socket = open().map_err(|source| DaqError::Device {
            chunker: self.label.clone(),
            source,
        })?;
        info!(
            chunker = %self.label,
            addr = %format!("{}:{}", self.host, self.port),
            chunk_size = self.chunk_size(),
            "UDP chunker bound"
        );
        Ok(socket)
    }

    fn next(&mut self, socket: &mut UdpSocket, writer: &ChunkWriter) -> AppResult<NextOutcome> {
        // Wait for the first packet before taking a chunk.
        let Some(first) = Self::recv(socket, &mut self.scratch)? else {
            return Ok(NextOutcome::Idle);
        };

        let chunk_size = self.chunk_size();
        let data_type = self.data_type().to_string();
        let Some(mut handle) = writer.writable(&data_type, chunk_size)? else {
            for _ in 1..self.packets_per_chunk {
                if Self::recv(socket, &mut self.scratch)?.is_none() {
                    break;
                }
            }
            return Ok(NextOutcome::Dropped);
        };

        handle.write(&self.scratch[..first]);
        for received in 1..self.packets_per_chunk {
            let slot = self.packet_size.min(handle.remaining());
            match Self::recv(socket, &mut handle.spare_mut()[..slot])? {
                Some(len) => handle.advance(len),
                None => {
                    warn!(
                        chunker = %self.label,
                        received,
                        expected = self.packets_per_chunk,
                        "incomplete chunk discarded"
                    );
                    handle.invalidate();
                    return Ok(NextOutcome::Dropped);
                }
            }
        }

        debug!(chunker = %self.label, chunk = %handle.id(), bytes = handle.len(), "chunk received");
        Ok(NextOutcome::Written)
    }
}

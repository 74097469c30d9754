//! One client connection's request/response cycle.
//!
//! ```text
//! Connected -> AwaitingRequest -> Serving -> AwaitingRequest -> ... -> Closed
//! ```
//!
//! Malformed requests are answered with `Error` and the session carries on.
//! A protocol version mismatch, an oversized frame or an I/O failure closes
//! the session.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::data::{DataManager, DataRequirements};
use crate::error::{AppResult, DaqError};
use crate::protocol::{
    read_frame, write_frame, Frame, ServerRequest, ServerResponse, ServiceDataEntry,
    ServiceVersionQuery, StreamDataResponse, PROTOCOL_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    AwaitingRequest,
    Serving,
    Closed,
}

/// What to do after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterReply {
    Continue,
    Close,
}

pub struct Session<S> {
    stream: S,
    peer: String,
    data: Arc<DataManager>,
    wait_timeout: Duration,
    state: SessionState,
    requests: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        data: Arc<DataManager>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            peer: peer.into(),
            data,
            wait_timeout,
            state: SessionState::Connected,
            requests: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve requests until the peer disconnects, the session fails, or
    /// `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        info!(peer = %self.peer, "session opened");
        let result = self.serve(&mut shutdown).await;
        self.state = SessionState::Closed;
        match &result {
            Ok(()) => info!(peer = %self.peer, requests = self.requests, "session closed"),
            Err(e) => warn!(peer = %self.peer, error = %e, "session closed with error"),
        }
        result
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> AppResult<()> {
        loop {
            self.state = SessionState::AwaitingRequest;
            if *shutdown.borrow() {
                return Ok(());
            }
            let frame = tokio::select! {
                frame = read_frame(&mut self.stream) => frame?,
                _ = shutdown.changed() => return Ok(()),
            };
            let Some(frame) = frame else {
                return Ok(());
            };

            self.state = SessionState::Serving;
            self.requests += 1;
            let (response, after) = self.dispatch(frame).await;
            write_frame(&mut self.stream, &response.encode()?).await?;

            if after == AfterReply::Close {
                return Err(DaqError::Handshake(format!(
                    "client {} closed after failed handshake",
                    self.peer
                )));
            }
        }
    }

    async fn dispatch(&self, frame: Frame) -> (ServerResponse, AfterReply) {
        let request = match ServerRequest::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "malformed request");
                return (ServerResponse::error(e.to_string()), AfterReply::Continue);
            }
        };

        match request {
            ServerRequest::Acknowledge { version } if version == PROTOCOL_VERSION => (
                ServerResponse::Acknowledge {
                    version: PROTOCOL_VERSION,
                },
                AfterReply::Continue,
            ),
            ServerRequest::Acknowledge { version } => (
                ServerResponse::error(format!(
                    "protocol version {} not supported (server speaks {})",
                    version, PROTOCOL_VERSION
                )),
                AfterReply::Close,
            ),
            ServerRequest::StreamData(options) => {
                (self.serve_stream(&options).await, AfterReply::Continue)
            }
            ServerRequest::ServiceData(queries) => {
                (self.serve_service(&queries), AfterReply::Continue)
            }
        }
    }

    async fn serve_stream(&self, options: &[DataRequirements]) -> ServerResponse {
        if options.is_empty() {
            return ServerResponse::error("stream data request lists no options");
        }

        let spec = self.data.data_spec();
        let compatible: Vec<DataRequirements> = options
            .iter()
            .filter(|reqs| !reqs.streams().is_empty() && spec.is_compatible(reqs))
            .cloned()
            .collect();
        if compatible.is_empty() {
            let missing: Vec<String> = options.iter().flat_map(|reqs| spec.missing(reqs)).collect();
            return ServerResponse::error(format!(
                "no requested option is served here (missing: {})",
                missing.join(", ")
            ));
        }

        let Some(matched) = self.data.wait_for_data(&compatible, self.wait_timeout).await else {
            return ServerResponse::error(format!(
                "no matching data within {} ms",
                self.wait_timeout.as_millis()
            ));
        };

        let response = StreamDataResponse {
            stream_name: matched.stream_name.clone(),
            version: matched.stream.sequence(),
            payload: Bytes::copy_from_slice(matched.stream.data()),
            associated: matched.stream.associated().to_vec(),
        };
        matched.mark_served();
        drop(matched);

        self.data.retire_unreferenced_service_versions();
        debug!(
            peer = %self.peer,
            stream = %response.stream_name,
            version = response.version,
            bytes = response.payload.len(),
            "served stream chunk"
        );
        ServerResponse::StreamData(response)
    }

    fn serve_service(&self, queries: &[ServiceVersionQuery]) -> ServerResponse {
        let mut entries = Vec::new();
        for query in queries {
            let Some(buffer) = self.data.find_service(&query.name) else {
                return ServerResponse::error(
                    DaqError::UnknownDataType(query.name.clone()).to_string(),
                );
            };
            let Some(current) = buffer.get_current() else {
                continue;
            };
            if current.version() == query.known_version {
                continue;
            }
            entries.push(ServiceDataEntry {
                name: query.name.clone(),
                version: current.version(),
                payload: Bytes::copy_from_slice(current.data()),
            });
        }
        ServerResponse::ServiceData(entries)
    }
}

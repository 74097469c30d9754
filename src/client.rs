//! Pipeline-side connection to the data server.
//!
//! The client keeps the newest copy of every service data set it has seen
//! and only asks the server for a service again when a stream chunk names a
//! version it does not hold.

use std::collections::HashMap;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::data::DataRequirements;
use crate::error::{AppResult, DaqError};
use crate::protocol::{
    read_frame, write_frame, ServerRequest, ServerResponse, ServiceDataEntry,
    ServiceVersionQuery, StreamDataResponse, NO_VERSION, PROTOCOL_VERSION,
};

/// A stream chunk with the service data versions it was written against.
#[derive(Debug, Clone)]
pub struct ClientData {
    pub stream: StreamDataResponse,
    pub services: Vec<ServiceDataEntry>,
}

pub struct DataClient {
    stream: TcpStream,
    service_cache: HashMap<String, ServiceDataEntry>,
}

impl DataClient {
    /// Connect and perform the version handshake.
    pub async fn connect(addr: impl ToSocketAddrs) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            service_cache: HashMap::new(),
        };
        client.acknowledge().await?;
        Ok(client)
    }

    pub async fn acknowledge(&mut self) -> AppResult<()> {
        let request = ServerRequest::Acknowledge {
            version: PROTOCOL_VERSION,
        };
        match self.round_trip(&request).await {
            Ok(ServerResponse::Acknowledge { version }) if version == PROTOCOL_VERSION => {
                info!(version, "connected to data server");
                Ok(())
            }
            Ok(ServerResponse::Acknowledge { version }) => Err(DaqError::Handshake(format!(
                "server speaks protocol version {}, expected {}",
                version, PROTOCOL_VERSION
            ))),
            Ok(other) => Err(DaqError::Handshake(format!(
                "unexpected {:?} reply to acknowledge",
                other.tag()
            ))),
            Err(DaqError::Remote(msg)) => Err(DaqError::Handshake(msg)),
            Err(e) => Err(e),
        }
    }

    /// Request the next chunk matching the first option with data.
    pub async fn request_stream(
        &mut self,
        options: &[DataRequirements],
    ) -> AppResult<StreamDataResponse> {
        let request = ServerRequest::StreamData(options.to_vec());
        match self.round_trip(&request).await? {
            ServerResponse::StreamData(data) => Ok(data),
            other => Err(unexpected("stream data", &other)),
        }
    }

    /// Ask for service data sets; entries the server omits are unchanged.
    pub async fn request_service(
        &mut self,
        queries: &[ServiceVersionQuery],
    ) -> AppResult<Vec<ServiceDataEntry>> {
        let request = ServerRequest::ServiceData(queries.to_vec());
        match self.round_trip(&request).await? {
            ServerResponse::ServiceData(entries) => Ok(entries),
            other => Err(unexpected("service data", &other)),
        }
    }

    /// Next stream chunk plus the service data it references, refreshing
    /// cached service data that is stale.
    pub async fn next_data(&mut self, options: &[DataRequirements]) -> AppResult<ClientData> {
        let stream = self.request_stream(options).await?;

        let stale: Vec<ServiceVersionQuery> = stream
            .associated
            .iter()
            .filter(|entry| {
                self.service_cache
                    .get(&entry.name)
                    .map_or(true, |cached| cached.version != entry.version)
            })
            .map(|entry| {
                let known = self
                    .service_cache
                    .get(&entry.name)
                    .map_or(NO_VERSION, |cached| cached.version);
                ServiceVersionQuery::new(entry.name.clone(), known)
            })
            .collect();

        if !stale.is_empty() {
            debug!(count = stale.len(), "refreshing service data");
            for entry in self.request_service(&stale).await? {
                self.service_cache.insert(entry.name.clone(), entry);
            }
        }

        let services = stream
            .associated
            .iter()
            .filter_map(|entry| self.service_cache.get(&entry.name).cloned())
            .collect();
        Ok(ClientData { stream, services })
    }

    pub fn cached_service(&self, name: &str) -> Option<&ServiceDataEntry> {
        self.service_cache.get(name)
    }

    async fn round_trip(&mut self, request: &ServerRequest) -> AppResult<ServerResponse> {
        write_frame(&mut self.stream, &request.encode()?).await?;
        let frame = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| DaqError::Protocol("connection closed by server".to_string()))?;
        match ServerResponse::decode(frame)? {
            ServerResponse::Error(msg) => Err(DaqError::Remote(msg)),
            response => Ok(response),
        }
    }
}

fn unexpected(expected: &str, got: &ServerResponse) -> DaqError {
    DaqError::Protocol(format!("expected {} reply, got {:?}", expected, got.tag()))
}

//! Request/response messages exchanged between pipelines and the server.
//!
//! One request is in flight per connection; every request is answered with
//! exactly one response.
//!
//! | Tag | Request                          | Response                              |
//! |-----|----------------------------------|---------------------------------------|
//! | 0   | `Acknowledge { version }`        | `Acknowledge { version }`             |
//! | 1   | `StreamData(options)`            | `StreamData(chunk + manifest)`        |
//! | 2   | `ServiceData(name, known)`       | `ServiceData(name, version, payload)` |
//! | 3   | -                                | `Error(message)`                      |

pub mod frame;

pub use frame::{read_frame, write_frame, Frame, MessageTag, MAX_FRAME_SIZE};

use bytes::{BufMut, Bytes};
use daq_pool::AssociatedData;

use crate::data::DataRequirements;
use crate::error::{AppResult, DaqError};
use frame::{
    begin_frame, expect_end, finish_frame, get_blob, get_string, get_u16, get_u64, put_blob,
    put_count, put_string,
};

/// Protocol version exchanged in `Acknowledge`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Version id meaning "nothing known yet".
pub const NO_VERSION: u64 = 0;

/// A client's current knowledge of one service data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceVersionQuery {
    pub name: String,
    pub known_version: u64,
}

impl ServiceVersionQuery {
    pub fn new(name: impl Into<String>, known_version: u64) -> Self {
        Self {
            name: name.into(),
            known_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Acknowledge { version: u16 },
    /// Options tried in order; the first with data is served.
    StreamData(Vec<DataRequirements>),
    ServiceData(Vec<ServiceVersionQuery>),
}

/// One served stream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataResponse {
    pub stream_name: String,
    /// Sequence number of the chunk within its stream
    pub version: u64,
    pub payload: Bytes,
    /// Service data versions the chunk was written against
    pub associated: Vec<AssociatedData>,
}

/// Current content of one service data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDataEntry {
    pub name: String,
    pub version: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    Acknowledge { version: u16 },
    StreamData(StreamDataResponse),
    /// Only entries whose version differs from the client's are included.
    ServiceData(Vec<ServiceDataEntry>),
    Error(String),
}

impl ServerRequest {
    pub fn tag(&self) -> MessageTag {
        match self {
            ServerRequest::Acknowledge { .. } => MessageTag::Acknowledge,
            ServerRequest::StreamData(_) => MessageTag::StreamData,
            ServerRequest::ServiceData(_) => MessageTag::ServiceData,
        }
    }

    /// Encode as a complete frame.
    pub fn encode(&self) -> AppResult<Bytes> {
        let mut buf = begin_frame(self.tag(), 64);
        match self {
            ServerRequest::Acknowledge { version } => buf.put_u16(*version),
            ServerRequest::StreamData(options) => {
                put_count(&mut buf, options.len())?;
                for reqs in options {
                    put_count(&mut buf, reqs.streams().len())?;
                    for name in reqs.streams() {
                        put_string(&mut buf, name)?;
                    }
                    put_count(&mut buf, reqs.services().len())?;
                    for name in reqs.services() {
                        put_string(&mut buf, name)?;
                    }
                }
            }
            ServerRequest::ServiceData(queries) => {
                put_count(&mut buf, queries.len())?;
                for query in queries {
                    put_string(&mut buf, &query.name)?;
                    buf.put_u64(query.known_version);
                }
            }
        }
        finish_frame(buf)
    }

    pub fn decode(frame: Frame) -> AppResult<Self> {
        let mut payload = frame.payload.clone();
        let request = match frame.message_tag()? {
            MessageTag::Acknowledge => ServerRequest::Acknowledge {
                version: get_u16(&mut payload, "acknowledge version")?,
            },
            MessageTag::StreamData => {
                let count = get_u16(&mut payload, "option count")?;
                let mut options = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let mut reqs = DataRequirements::new();
                    for _ in 0..get_u16(&mut payload, "stream count")? {
                        reqs.add_stream(get_string(&mut payload, "stream name")?);
                    }
                    for _ in 0..get_u16(&mut payload, "service count")? {
                        reqs.add_service(get_string(&mut payload, "service name")?);
                    }
                    options.push(reqs);
                }
                ServerRequest::StreamData(options)
            }
            MessageTag::ServiceData => {
                let count = get_u16(&mut payload, "query count")?;
                let mut queries = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let name = get_string(&mut payload, "service name")?;
                    let known_version = get_u64(&mut payload, "known version")?;
                    queries.push(ServiceVersionQuery {
                        name,
                        known_version,
                    });
                }
                ServerRequest::ServiceData(queries)
            }
            MessageTag::Error => {
                return Err(DaqError::Protocol(
                    "Error is not a valid request".to_string(),
                ));
            }
        };
        expect_end(&payload, "request")?;
        Ok(request)
    }
}

impl ServerResponse {
    pub fn tag(&self) -> MessageTag {
        match self {
            ServerResponse::Acknowledge { .. } => MessageTag::Acknowledge,
            ServerResponse::StreamData(_) => MessageTag::StreamData,
            ServerResponse::ServiceData(_) => MessageTag::ServiceData,
            ServerResponse::Error(_) => MessageTag::Error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerResponse::Error(message.into())
    }

    /// Encode as a complete frame.
    pub fn encode(&self) -> AppResult<Bytes> {
        match self {
            ServerResponse::Acknowledge { version } => {
                let mut buf = begin_frame(self.tag(), 2);
                buf.put_u16(*version);
                finish_frame(buf)
            }
            ServerResponse::StreamData(data) => {
                let mut buf = begin_frame(self.tag(), 64 + data.payload.len());
                put_string(&mut buf, &data.stream_name)?;
                buf.put_u64(data.version);
                put_blob(&mut buf, &data.payload)?;
                put_count(&mut buf, data.associated.len())?;
                for entry in &data.associated {
                    put_string(&mut buf, &entry.name)?;
                    buf.put_u64(entry.version);
                }
                finish_frame(buf)
            }
            ServerResponse::ServiceData(entries) => {
                let size: usize = entries.iter().map(|e| 32 + e.payload.len()).sum();
                let mut buf = begin_frame(self.tag(), size);
                put_count(&mut buf, entries.len())?;
                for entry in entries {
                    put_string(&mut buf, &entry.name)?;
                    buf.put_u64(entry.version);
                    put_blob(&mut buf, &entry.payload)?;
                }
                finish_frame(buf)
            }
            ServerResponse::Error(message) => {
                let mut buf = begin_frame(self.tag(), message.len());
                buf.put_slice(message.as_bytes());
                finish_frame(buf)
            }
        }
    }

    pub fn decode(frame: Frame) -> AppResult<Self> {
        let mut payload = frame.payload.clone();
        let response = match frame.message_tag()? {
            MessageTag::Acknowledge => ServerResponse::Acknowledge {
                version: get_u16(&mut payload, "acknowledge version")?,
            },
            MessageTag::StreamData => {
                let stream_name = get_string(&mut payload, "stream name")?;
                let version = get_u64(&mut payload, "stream version")?;
                let data = get_blob(&mut payload, "stream payload")?;
                let count = get_u16(&mut payload, "manifest count")?;
                let mut associated = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let name = get_string(&mut payload, "manifest name")?;
                    let version = get_u64(&mut payload, "manifest version")?;
                    associated.push(AssociatedData::new(name, version));
                }
                ServerResponse::StreamData(StreamDataResponse {
                    stream_name,
                    version,
                    payload: data,
                    associated,
                })
            }
            MessageTag::ServiceData => {
                let count = get_u16(&mut payload, "entry count")?;
                let mut entries = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    entries.push(ServiceDataEntry {
                        name: get_string(&mut payload, "service name")?,
                        version: get_u64(&mut payload, "service version")?,
                        payload: get_blob(&mut payload, "service payload")?,
                    });
                }
                ServerResponse::ServiceData(entries)
            }
            MessageTag::Error => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                return Ok(ServerResponse::Error(message));
            }
        };
        expect_end(&payload, "response")?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(bytes: Bytes) -> Frame {
        Frame {
            tag: bytes[4],
            payload: bytes.slice(frame::HEADER_LEN..),
        }
    }

    #[test]
    fn test_stream_request_round_trip() {
        let request = ServerRequest::StreamData(vec![
            DataRequirements::for_stream("visibilities").with_service("positions"),
            DataRequirements::new().with_stream("beams").with_stream("visibilities"),
        ]);
        let decoded = ServerRequest::decode(frame_of(request.encode().unwrap())).unwrap();

        let ServerRequest::StreamData(options) = &decoded else {
            panic!("expected stream request, got {:?}", decoded);
        };
        let ServerRequest::StreamData(original) = &request else {
            unreachable!()
        };
        let fingerprints = |opts: &[DataRequirements]| {
            opts.iter().map(|r| r.fingerprint()).collect::<Vec<_>>()
        };
        assert_eq!(fingerprints(options), fingerprints(original));
    }

    #[test]
    fn test_service_request_round_trip() {
        let request = ServerRequest::ServiceData(vec![
            ServiceVersionQuery::new("positions", 3),
            ServiceVersionQuery::new("flags", NO_VERSION),
        ]);
        assert_eq!(
            ServerRequest::decode(frame_of(request.encode().unwrap())).unwrap(),
            request
        );
    }

    #[test]
    fn test_stream_response_round_trip() {
        let response = ServerResponse::StreamData(StreamDataResponse {
            stream_name: "visibilities".into(),
            version: 17,
            payload: Bytes::from_static(b"correlator output"),
            associated: vec![AssociatedData::new("positions", 2)],
        });
        assert_eq!(
            ServerResponse::decode(frame_of(response.encode().unwrap())).unwrap(),
            response
        );
    }

    #[test]
    fn test_empty_service_response() {
        let response = ServerResponse::ServiceData(Vec::new());
        let bytes = response.encode().unwrap();
        assert_eq!(bytes.len(), frame::HEADER_LEN + 2);
        assert_eq!(ServerResponse::decode(frame_of(bytes)).unwrap(), response);
    }

    #[test]
    fn test_error_response() {
        let response = ServerResponse::error("no data");
        assert_eq!(
            ServerResponse::decode(frame_of(response.encode().unwrap())).unwrap(),
            response
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Frame {
            tag: MessageTag::Acknowledge as u8,
            payload: Bytes::from_static(&[0, 1, 0xFF]),
        };
        assert!(matches!(
            ServerRequest::decode(frame),
            Err(DaqError::Protocol(ref msg)) if msg.contains("trailing")
        ));
    }

    #[test]
    fn test_error_tag_is_not_a_request() {
        let frame = Frame {
            tag: MessageTag::Error as u8,
            payload: Bytes::new(),
        };
        assert!(ServerRequest::decode(frame).is_err());
    }
}

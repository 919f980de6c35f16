//! Wire types for the data-client boundary.
//!
//! Every message is framed as a u32 little-endian header length followed by
//! the header bytes; stream and service payloads follow the header raw, sized
//! by the `size` fields it declares. Strings are u32-length-prefixed UTF-8.

use crate::buffer::VersionId;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::DataRequirements;
use chrono::Utc;

/// Request discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Liveness probe.
    Acknowledge = 0,
    /// Fetch the next stream chunk plus associated service versions.
    StreamData = 1,
    /// Fetch current service values by name.
    ServiceData = 2,
}

impl RequestType {
    /// Parses a request discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Acknowledge),
            1 => Some(RequestType::StreamData),
            2 => Some(RequestType::ServiceData),
            _ => None,
        }
    }
}

/// Response discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    /// Liveness reply.
    Ack = 0,
    /// Request failed; carries a message.
    Error = 1,
    /// Stream chunk header; payload follows.
    StreamData = 2,
    /// Service item headers; payloads follow in order.
    ServiceData = 3,
}

impl ResponseType {
    /// Parses a response discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseType::Ack),
            1 => Some(ResponseType::Error),
            2 => Some(ResponseType::StreamData),
            3 => Some(ResponseType::ServiceData),
            _ => None,
        }
    }
}

/// A request for the next available chunk of one of the named stream types,
/// with the service types whose versions the server should report alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataRequest {
    /// Acceptable stream data type names.
    pub stream_names: Vec<String>,
    /// Service data type names to report versions for.
    pub service_names: Vec<String>,
}

impl From<&DataRequirements> for StreamDataRequest {
    fn from(requirements: &DataRequirements) -> Self {
        Self {
            stream_names: requirements.stream().iter().cloned().collect(),
            service_names: requirements.service().iter().cloned().collect(),
        }
    }
}

/// A request for the current value of each named service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDataRequest {
    /// Service data type names to fetch.
    pub names: Vec<String>,
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    /// Liveness probe.
    Acknowledge,
    /// Stream fetch.
    StreamData(StreamDataRequest),
    /// Service fetch.
    ServiceData(ServiceDataRequest),
}

impl ServerRequest {
    /// Encodes the request with its frame length prefix.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            ServerRequest::Acknowledge => {
                body.push(RequestType::Acknowledge as u8);
            }
            ServerRequest::StreamData(req) => {
                body.push(RequestType::StreamData as u8);
                put_string_list(&mut body, &req.stream_names);
                put_string_list(&mut body, &req.service_names);
            }
            ServerRequest::ServiceData(req) => {
                body.push(RequestType::ServiceData as u8);
                put_string_list(&mut body, &req.names);
            }
        }
        frame(body)
    }

    /// Decodes a request from one frame body.
    pub fn decode(data: &[u8]) -> PipelineResult<Self> {
        let mut reader = Reader::new(data);
        let discriminant = reader.u8()?;
        let request_type = RequestType::from_u8(discriminant)
            .ok_or_else(|| PipelineError::Protocol(format!("invalid request type {discriminant}")))?;
        let request = match request_type {
            RequestType::Acknowledge => ServerRequest::Acknowledge,
            RequestType::StreamData => ServerRequest::StreamData(StreamDataRequest {
                stream_names: reader.string_list()?,
                service_names: reader.string_list()?,
            }),
            RequestType::ServiceData => ServerRequest::ServiceData(ServiceDataRequest {
                names: reader.string_list()?,
            }),
        };
        reader.finish()?;
        Ok(request)
    }
}

/// Liveness reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    /// Server wall-clock time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl AckResponse {
    /// An acknowledge stamped with the current time.
    pub fn now() -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        }
    }
}

/// A service data type associated with a stream response, identified by name
/// and current version so the client can validate its cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedData {
    /// Service data type name.
    pub name: String,
    /// Current version on the server.
    pub version: VersionId,
}

/// Header of a stream chunk response. `size` payload bytes follow the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataHeader {
    /// Stream data type name.
    pub name: String,
    /// Version stamped at commit time.
    pub version: VersionId,
    /// Payload length in bytes.
    pub size: u64,
    /// Versions of the associated service data.
    pub associated: Vec<AssociatedData>,
}

/// One service item in a service response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDataItem {
    /// Service data type name.
    pub name: String,
    /// Version stamped at commit time.
    pub version: VersionId,
    /// Payload length in bytes.
    pub size: u64,
}

/// Header of a service response. Payloads follow the frame in item order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDataHeader {
    /// Items in payload order.
    pub items: Vec<ServiceDataItem>,
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    /// Liveness reply.
    Ack(AckResponse),
    /// Request failed.
    Error(String),
    /// Stream chunk header.
    StreamData(StreamDataHeader),
    /// Service item headers.
    ServiceData(ServiceDataHeader),
}

impl ServerResponse {
    /// Encodes the response header with its frame length prefix. Payload
    /// bytes, if any, are written separately after the frame.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            ServerResponse::Ack(ack) => {
                body.push(ResponseType::Ack as u8);
                body.extend_from_slice(&ack.timestamp_ms.to_le_bytes());
            }
            ServerResponse::Error(message) => {
                body.push(ResponseType::Error as u8);
                put_string(&mut body, message);
            }
            ServerResponse::StreamData(header) => {
                body.push(ResponseType::StreamData as u8);
                put_string(&mut body, &header.name);
                body.extend_from_slice(&header.version.to_le_bytes());
                body.extend_from_slice(&header.size.to_le_bytes());
                body.extend_from_slice(&(header.associated.len() as u32).to_le_bytes());
                for associated in &header.associated {
                    put_string(&mut body, &associated.name);
                    body.extend_from_slice(&associated.version.to_le_bytes());
                }
            }
            ServerResponse::ServiceData(header) => {
                body.push(ResponseType::ServiceData as u8);
                body.extend_from_slice(&(header.items.len() as u32).to_le_bytes());
                for item in &header.items {
                    put_string(&mut body, &item.name);
                    body.extend_from_slice(&item.version.to_le_bytes());
                    body.extend_from_slice(&item.size.to_le_bytes());
                }
            }
        }
        frame(body)
    }

    /// Decodes a response from one frame body.
    pub fn decode(data: &[u8]) -> PipelineResult<Self> {
        let mut reader = Reader::new(data);
        let discriminant = reader.u8()?;
        let response_type = ResponseType::from_u8(discriminant).ok_or_else(|| {
            PipelineError::Protocol(format!("invalid response type {discriminant}"))
        })?;
        let response = match response_type {
            ResponseType::Ack => ServerResponse::Ack(AckResponse {
                timestamp_ms: reader.u64()?,
            }),
            ResponseType::Error => ServerResponse::Error(reader.string()?),
            ResponseType::StreamData => {
                let name = reader.string()?;
                let version = reader.u64()?;
                let size = reader.u64()?;
                let count = reader.u32()? as usize;
                let mut associated = Vec::with_capacity(count.min(MAX_LIST_LEN));
                for _ in 0..count {
                    associated.push(AssociatedData {
                        name: reader.string()?,
                        version: reader.u64()?,
                    });
                }
                ServerResponse::StreamData(StreamDataHeader {
                    name,
                    version,
                    size,
                    associated,
                })
            }
            ResponseType::ServiceData => {
                let count = reader.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(MAX_LIST_LEN));
                for _ in 0..count {
                    items.push(ServiceDataItem {
                        name: reader.string()?,
                        version: reader.u64()?,
                        size: reader.u64()?,
                    });
                }
                ServerResponse::ServiceData(ServiceDataHeader { items })
            }
        };
        reader.finish()?;
        Ok(response)
    }
}

/// Upper bound on a decoded frame body; anything larger is malformed. Bounds
/// protocol headers only, not the raw payloads that follow them.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Upper bound on a declared stream or service payload, sized for raw
/// instrument chunks.
pub const MAX_PAYLOAD_LEN: u64 = 256 * 1024 * 1024;

const MAX_LIST_LEN: usize = 4096;

fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_string_list(buf: &mut Vec<u8>, list: &[String]) {
    buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
    for s in list {
        put_string(buf, s);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> PipelineResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(PipelineError::Protocol(format!(
                "truncated message: wanted {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.data.len()
            ))),
        }
    }

    fn u8(&mut self) -> PipelineResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> PipelineResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> PipelineResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn string(&mut self) -> PipelineResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| PipelineError::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    fn string_list(&mut self) -> PipelineResult<Vec<String>> {
        let count = self.u32()? as usize;
        let mut list = Vec::with_capacity(count.min(MAX_LIST_LEN));
        for _ in 0..count {
            list.push(self.string()?);
        }
        Ok(list)
    }

    fn finish(&self) -> PipelineResult<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(PipelineError::Protocol(format!(
                "{} trailing bytes after message",
                self.data.len() - self.pos
            )))
        }
    }
}

/// Splits a framed buffer into its body, validating the length prefix.
pub fn read_frame(data: &[u8]) -> PipelineResult<&[u8]> {
    if data.len() < 4 {
        return Err(PipelineError::Protocol(
            "frame shorter than its length prefix".to_string(),
        ));
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + len {
        return Err(PipelineError::Protocol(format!(
            "frame declares {} bytes but only {} are present",
            len,
            data.len() - 4
        )));
    }
    Ok(&data[4..4 + len])
}

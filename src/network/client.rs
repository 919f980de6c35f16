//! Remote data client: fetches stream chunks and service data from a
//! [`DataServer`](crate::network::server::DataServer) over synchronous,
//! timeout-bounded TCP.
//!
//! Service data is cached by version. A stream response reports the current
//! version of each associated service type; only the types whose version
//! differs from the cached copy trigger a follow-up service fetch on the same
//! connection.

use crate::buffer::VersionId;
use crate::client::DataClient;
use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult, TransportError};
use crate::network::protocol::{
    AckResponse, ServerRequest, ServerResponse, ServiceDataRequest, StreamDataRequest,
    MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
use crate::pipeline::{DataRequirements, DeliveredChunk, DeliveredData};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct CachedService {
    version: VersionId,
    bytes: Bytes,
}

/// [`DataClient`] backed by a remote data server.
///
/// Connections are per-cycle: each requirement set opens one connection,
/// issues a stream request and at most one follow-up service request on it,
/// then drops it. Transport and protocol failures are logged and yield an
/// incomplete delivered map rather than stopping the driver.
pub struct RemoteDataClient {
    server_addr: String,
    requirements: Vec<DataRequirements>,
    connect_timeout: Duration,
    read_timeout: Duration,
    cache: HashMap<String, CachedService>,
    service_fetches: u64,
}

impl RemoteDataClient {
    /// Creates a client for `server_addr` (`host:port`) serving the given
    /// requirement sets.
    pub fn new(
        server_addr: impl Into<String>,
        requirements: Vec<DataRequirements>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            requirements,
            connect_timeout,
            read_timeout,
            cache: HashMap::new(),
            service_fetches: 0,
        }
    }

    /// Creates a client using the configured network section.
    pub fn from_settings(settings: &Settings, requirements: Vec<DataRequirements>) -> Self {
        Self::new(
            format!("{}:{}", settings.network.host, settings.network.port),
            requirements,
            Duration::from_millis(settings.network.connect_timeout_ms),
            Duration::from_millis(settings.network.read_timeout_ms),
        )
    }

    /// Number of service data payloads fetched over the wire so far. Does not
    /// count cache hits.
    pub fn service_fetch_count(&self) -> u64 {
        self.service_fetches
    }

    /// Liveness probe: connects, sends an acknowledge request and returns the
    /// server's reply.
    pub fn acknowledge(&self) -> PipelineResult<AckResponse> {
        let mut stream = self.connect()?;
        send_request(&mut stream, &ServerRequest::Acknowledge)?;
        match self.read_response(&mut stream)? {
            ServerResponse::Ack(ack) => Ok(ack),
            ServerResponse::Error(message) => Err(PipelineError::Protocol(message)),
            other => Err(unexpected_response("acknowledge", &other)),
        }
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addrs = self
            .server_addr
            .to_socket_addrs()
            .map_err(TransportError::Connect)?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.read_timeout))
                        .map_err(TransportError::Connect)?;
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransportError::Connect(last_err.unwrap_or_else(|| {
            std::io::Error::other(format!("'{}' resolved to no addresses", self.server_addr))
        })))
    }

    /// Reads exactly `buf.len()` bytes, accumulating across short reads until
    /// the configured timeout elapses.
    fn read_exact_timed(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), TransportError> {
        let started = Instant::now();
        let mut received = 0;
        while received < buf.len() {
            match stream.read(&mut buf[received..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => received += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        expected: buf.len(),
                        received,
                    });
                }
                Err(e) => return Err(TransportError::Read(e)),
            }
            if received < buf.len() && started.elapsed() >= self.read_timeout {
                return Err(TransportError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    expected: buf.len(),
                    received,
                });
            }
        }
        Ok(())
    }

    fn read_response(&self, stream: &mut TcpStream) -> PipelineResult<ServerResponse> {
        let mut len_buf = [0u8; 4];
        self.read_exact_timed(stream, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(PipelineError::Protocol(format!(
                "response frame of {len} bytes exceeds limit"
            )));
        }
        let mut body = vec![0u8; len as usize];
        self.read_exact_timed(stream, &mut body)?;
        ServerResponse::decode(&body)
    }

    fn read_payload(&self, stream: &mut TcpStream, size: u64) -> PipelineResult<Bytes> {
        // Payloads are bounded separately from header frames; slot capacities
        // routinely exceed MAX_FRAME_LEN.
        if size > MAX_PAYLOAD_LEN {
            return Err(PipelineError::Protocol(format!(
                "payload of {size} bytes exceeds limit"
            )));
        }
        let mut payload = vec![0u8; size as usize];
        self.read_exact_timed(stream, &mut payload)?;
        Ok(Bytes::from(payload))
    }

    /// One requirement set's fetch: stream request, cache validation against
    /// the reported service versions, follow-up service request for the stale
    /// entries only.
    fn fetch(
        &mut self,
        requirements: &DataRequirements,
        delivered: &mut DeliveredData,
    ) -> PipelineResult<()> {
        let mut stream = self.connect()?;

        // A requirement set with no stream types is a plain service fetch.
        if requirements.stream().is_empty() {
            let names: Vec<String> = requirements.service().iter().cloned().collect();
            return self.fetch_service(&mut stream, names, delivered);
        }

        let request = ServerRequest::StreamData(StreamDataRequest::from(requirements));
        send_request(&mut stream, &request)?;

        let header = match self.read_response(&mut stream)? {
            ServerResponse::StreamData(header) => header,
            ServerResponse::Error(message) => {
                debug!(%message, "No stream data from server this cycle");
                return Ok(());
            }
            other => return Err(unexpected_response("stream data", &other)),
        };

        // The stream payload always follows the header, before any follow-up
        // request may be issued on the connection.
        let payload = self.read_payload(&mut stream, header.size)?;

        let mut stale = Vec::new();
        for associated in &header.associated {
            match self.cache.get(&associated.name) {
                Some(cached) if cached.version == associated.version => {
                    debug!(
                        name = %associated.name,
                        version = associated.version,
                        "Service data cache hit"
                    );
                    delivered.insert(
                        associated.name.clone(),
                        DeliveredChunk::Remote {
                            bytes: cached.bytes.clone(),
                            version: cached.version,
                        },
                    );
                }
                _ => stale.push(associated.name.clone()),
            }
        }
        if !stale.is_empty() {
            self.fetch_service(&mut stream, stale, delivered)?;
        }

        delivered.insert(
            header.name,
            DeliveredChunk::Remote {
                bytes: payload,
                version: header.version,
            },
        );
        Ok(())
    }

    fn fetch_service(
        &mut self,
        stream: &mut TcpStream,
        names: Vec<String>,
        delivered: &mut DeliveredData,
    ) -> PipelineResult<()> {
        send_request(
            stream,
            &ServerRequest::ServiceData(ServiceDataRequest { names }),
        )?;
        let header = match self.read_response(stream)? {
            ServerResponse::ServiceData(header) => header,
            ServerResponse::Error(message) => {
                debug!(%message, "Service data fetch failed");
                return Ok(());
            }
            other => return Err(unexpected_response("service data", &other)),
        };

        for item in header.items {
            let bytes = self.read_payload(stream, item.size)?;
            self.service_fetches += 1;
            debug!(
                name = %item.name,
                version = item.version,
                size = item.size,
                "Fetched service data"
            );
            self.cache.insert(
                item.name.clone(),
                CachedService {
                    version: item.version,
                    bytes: bytes.clone(),
                },
            );
            delivered.insert(
                item.name,
                DeliveredChunk::Remote {
                    bytes,
                    version: item.version,
                },
            );
        }
        Ok(())
    }
}

impl DataClient for RemoteDataClient {
    fn data_requirements(&self) -> &[DataRequirements] {
        &self.requirements
    }

    fn get_data(&mut self) -> PipelineResult<DeliveredData> {
        let mut delivered = DeliveredData::new();
        // The requirement sets are parked while fetching so `fetch` can
        // borrow the cache mutably without cloning them every cycle.
        let requirements = std::mem::take(&mut self.requirements);
        let mut fatal = None;
        for req in &requirements {
            match self.fetch(req, &mut delivered) {
                Ok(()) => {}
                // A failed exchange leaves this requirement set unsatisfied
                // for the cycle; the driver decides what an empty cycle means.
                Err(PipelineError::Transport(e)) => {
                    warn!(error = %e, "Transport failure fetching data");
                }
                Err(PipelineError::Protocol(e)) => {
                    warn!(error = %e, "Protocol failure fetching data");
                }
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        self.requirements = requirements;
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(delivered)
    }
}

fn send_request(stream: &mut TcpStream, request: &ServerRequest) -> Result<(), TransportError> {
    stream
        .write_all(&request.encode_frame())
        .map_err(TransportError::Write)
}

fn unexpected_response(context: &str, response: &ServerResponse) -> PipelineError {
    PipelineError::Protocol(format!(
        "unexpected response to {context} request: {response:?}"
    ))
}

//! Server side of the data-client bridge.
//!
//! Accepts TCP connections and serves buffer contents: stream requests get
//! the next available chunk plus the current versions of the associated
//! service types; service requests get the retained current values. One
//! spawned task per session.

use crate::buffer::{BufferRegistry, DataBuffer, ReadHandle};
use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::network::protocol::{
    AckResponse, AssociatedData, ServerRequest, ServerResponse, ServiceDataHeader,
    ServiceDataItem, ServiceDataRequest, StreamDataHeader, StreamDataRequest, MAX_FRAME_LEN,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Serves buffer contents over the request/response boundary.
pub struct DataServer {
    listener: TcpListener,
    registry: Arc<BufferRegistry>,
    /// Bound on how long a stream request waits for fresh data.
    stream_wait: Duration,
    /// Idle sessions are closed after this long without a request.
    session_idle: Duration,
}

impl DataServer {
    /// Binds the listener and returns the server.
    pub async fn bind(
        addr: &str,
        registry: Arc<BufferRegistry>,
        stream_wait: Duration,
        session_idle: Duration,
    ) -> PipelineResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Data server listening on {}", addr);
        Ok(Self {
            listener,
            registry,
            stream_wait,
            session_idle,
        })
    }

    /// Binds using the configured network section.
    pub async fn from_settings(
        settings: &Settings,
        registry: Arc<BufferRegistry>,
    ) -> PipelineResult<Self> {
        let addr = format!("{}:{}", settings.network.host, settings.network.port);
        Self::bind(
            &addr,
            registry,
            Duration::from_millis(settings.dispatch.stream_wait_ms),
            Duration::from_millis(settings.network.read_timeout_ms.saturating_mul(4)),
        )
        .await
    }

    /// The bound address; useful when the port was configured as 0.
    pub fn local_addr(&self) -> PipelineResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self) -> PipelineResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let stream_wait = self.stream_wait;
                    let session_idle = self.session_idle;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_session(socket, addr, registry, stream_wait, session_idle).await
                        {
                            warn!(client = %addr, error = %e, "Session error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Accept error"),
            }
        }
    }
}

async fn handle_session(
    mut socket: TcpStream,
    addr: SocketAddr,
    registry: Arc<BufferRegistry>,
    stream_wait: Duration,
    session_idle: Duration,
) -> PipelineResult<()> {
    info!(client = %addr, "Client connected");

    loop {
        let frame_len = match timeout(session_idle, socket.read_u32_le()).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!(client = %addr, "Client disconnected");
                break;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                info!(client = %addr, "Session idle, closing");
                break;
            }
        };
        if frame_len > MAX_FRAME_LEN {
            write_response(
                &mut socket,
                &ServerResponse::Error(format!("frame of {frame_len} bytes exceeds limit")),
            )
            .await?;
            break;
        }

        let mut body = vec![0u8; frame_len as usize];
        socket.read_exact(&mut body).await?;

        match ServerRequest::decode(&body) {
            Ok(request) => {
                process_request(&mut socket, &registry, stream_wait, request).await?;
            }
            Err(e) => {
                warn!(client = %addr, error = %e, "Malformed request");
                write_response(&mut socket, &ServerResponse::Error(e.to_string())).await?;
            }
        }
    }

    Ok(())
}

async fn process_request(
    socket: &mut TcpStream,
    registry: &Arc<BufferRegistry>,
    stream_wait: Duration,
    request: ServerRequest,
) -> PipelineResult<()> {
    match request {
        ServerRequest::Acknowledge => {
            write_response(socket, &ServerResponse::Ack(AckResponse::now())).await
        }
        ServerRequest::StreamData(request) => {
            serve_stream_data(socket, registry, stream_wait, request).await
        }
        ServerRequest::ServiceData(request) => {
            serve_service_data(socket, registry, request).await
        }
    }
}

async fn serve_stream_data(
    socket: &mut TcpStream,
    registry: &Arc<BufferRegistry>,
    stream_wait: Duration,
    request: StreamDataRequest,
) -> PipelineResult<()> {
    // Resolve every requested name up front so a typo fails loudly instead
    // of looking like missing data.
    for name in request.stream_names.iter().chain(&request.service_names) {
        if registry.get(name).is_none() {
            write_response(
                socket,
                &ServerResponse::Error(format!("unknown data type '{name}'")),
            )
            .await?;
            return Ok(());
        }
    }

    // First pass without blocking; then one bounded wait on the first
    // requested type if nothing was available.
    let mut chunk = None;
    for name in &request.stream_names {
        if let Some(buffer) = registry.get(name) {
            if let Some(handle) = buffer.acquire_current() {
                chunk = Some(handle);
                break;
            }
        }
    }
    if chunk.is_none() && !request.stream_names.is_empty() {
        let buffers: Vec<Arc<DataBuffer>> = request
            .stream_names
            .iter()
            .filter_map(|name| registry.get(name).cloned())
            .collect();
        if !buffers.is_empty() {
            // The wait blocks the thread, so keep it off the runtime.
            chunk = tokio::task::spawn_blocking(move || wait_any_current(&buffers, stream_wait))
                .await
                .map_err(|e| PipelineError::Dispatch(e.to_string()))?;
        }
    }

    let Some(handle) = chunk else {
        write_response(
            socket,
            &ServerResponse::Error("no stream data available".to_string()),
        )
        .await?;
        return Ok(());
    };

    let mut associated = Vec::with_capacity(request.service_names.len());
    for name in &request.service_names {
        if let Some(buffer) = registry.get(name) {
            if let Some(version) = buffer.current_version() {
                associated.push(AssociatedData {
                    name: name.clone(),
                    version,
                });
            }
        }
    }

    let header = StreamDataHeader {
        name: handle.type_name().to_string(),
        version: handle.version(),
        size: handle.len() as u64,
        associated,
    };
    debug!(
        name = %header.name,
        version = header.version,
        size = header.size,
        "Serving stream data"
    );
    write_response(socket, &ServerResponse::StreamData(header)).await?;
    socket.write_all(handle.data()).await?;
    // Dropping the handle here consumes the chunk.
    Ok(())
}

async fn serve_service_data(
    socket: &mut TcpStream,
    registry: &Arc<BufferRegistry>,
    request: ServiceDataRequest,
) -> PipelineResult<()> {
    let mut handles = Vec::with_capacity(request.names.len());
    for name in &request.names {
        let Some(buffer) = registry.get(name) else {
            write_response(
                socket,
                &ServerResponse::Error(format!("unknown data type '{name}'")),
            )
            .await?;
            return Ok(());
        };
        if let Some(handle) = buffer.acquire_current() {
            handles.push(handle);
        }
    }

    let items = handles
        .iter()
        .map(|handle| ServiceDataItem {
            name: handle.type_name().to_string(),
            version: handle.version(),
            size: handle.len() as u64,
        })
        .collect();
    write_response(socket, &ServerResponse::ServiceData(ServiceDataHeader { items })).await?;
    for handle in &handles {
        socket.write_all(handle.data()).await?;
    }
    Ok(())
}

async fn write_response(socket: &mut TcpStream, response: &ServerResponse) -> PipelineResult<()> {
    socket.write_all(&response.encode_frame()).await?;
    Ok(())
}

const WAIT_POLL_SLICE: Duration = Duration::from_millis(10);

/// Bounded wait for a chunk on any of the given buffers. Sleeps on the first
/// buffer's condvar in short slices and polls the rest between wakeups, so a
/// commit to any requested type ends the wait.
fn wait_any_current(buffers: &[Arc<DataBuffer>], timeout: Duration) -> Option<ReadHandle> {
    let deadline = Instant::now() + timeout;
    loop {
        for buffer in buffers {
            if let Some(handle) = buffer.acquire_current() {
                return Some(handle);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let slice = (deadline - now).min(WAIT_POLL_SLICE);
        if let Some(handle) = buffers[0].wait_current(slice) {
            return Some(handle);
        }
    }
}

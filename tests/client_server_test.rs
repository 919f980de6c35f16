//! Data server and remote client exercised over a real socket, including the
//! version-validated service data cache.

use rust_pipeline::buffer::{BufferRegistry, DataBuffer, RetentionPolicy};
use rust_pipeline::client::DataClient;
use rust_pipeline::network::client::RemoteDataClient;
use rust_pipeline::network::server::DataServer;
use rust_pipeline::pipeline::{DataRequirements, DeliveredData};
use std::sync::Arc;
use std::time::Duration;

fn commit(buffer: &Arc<DataBuffer>, payload: &[u8]) {
    let mut handle = buffer.acquire_writable(payload.len()).expect("writable");
    handle.bytes_mut().copy_from_slice(payload);
    handle.commit();
}

async fn start_server(registry: Arc<BufferRegistry>) -> std::net::SocketAddr {
    let server = DataServer::bind(
        "127.0.0.1:0",
        registry,
        Duration::from_millis(200),
        Duration::from_secs(5),
    )
    .await
    .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());
    addr
}

/// Runs one blocking fetch cycle off the runtime.
async fn cycle(mut client: RemoteDataClient) -> (RemoteDataClient, DeliveredData) {
    tokio::task::spawn_blocking(move || {
        let delivered = client.get_data().expect("cycle");
        (client, delivered)
    })
    .await
    .expect("join")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_client_caches_service_data_by_version() {
    let vis = DataBuffer::new("visibilities", RetentionPolicy::Stream, 4, 64);
    let ant = DataBuffer::new("antennas", RetentionPolicy::Service, 1, 64);
    let mut registry = BufferRegistry::new();
    registry.insert(Arc::clone(&vis));
    registry.insert(Arc::clone(&ant));
    let addr = start_server(Arc::new(registry)).await;

    commit(&ant, b"antenna-layout-v1");
    commit(&vis, b"chunk-1");

    let requirements = vec![DataRequirements::new()
        .with_stream("visibilities")
        .with_service("antennas")];
    let client = RemoteDataClient::new(
        addr.to_string(),
        requirements,
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    let (client, delivered) = cycle(client).await;
    assert_eq!(
        delivered.get("visibilities").expect("stream").data(),
        b"chunk-1"
    );
    assert_eq!(
        delivered.get("antennas").expect("service").data(),
        b"antenna-layout-v1"
    );
    assert_eq!(client.service_fetch_count(), 1);

    // Unchanged service version: the cached copy is reused, the stream chunk
    // is transmitted regardless.
    commit(&vis, b"chunk-2");
    let (client, delivered) = cycle(client).await;
    assert_eq!(
        delivered.get("visibilities").expect("stream").data(),
        b"chunk-2"
    );
    assert_eq!(delivered.get("antennas").expect("service").version(), 1);
    assert_eq!(client.service_fetch_count(), 1, "no redundant service fetch");

    // New service version: exactly one follow-up fetch.
    commit(&ant, b"antenna-layout-v2");
    commit(&vis, b"chunk-3");
    let (client, delivered) = cycle(client).await;
    assert_eq!(
        delivered.get("antennas").expect("service").data(),
        b"antenna-layout-v2"
    );
    assert_eq!(delivered.get("antennas").expect("service").version(), 2);
    assert_eq!(client.service_fetch_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_megabyte_payloads_are_delivered() {
    // Slot capacity well beyond the header frame bound: payloads must not be
    // rejected by the header limit.
    let vis = DataBuffer::new("visibilities", RetentionPolicy::Stream, 2, 2 * 1024 * 1024);
    let mut registry = BufferRegistry::new();
    registry.insert(Arc::clone(&vis));
    let addr = start_server(Arc::new(registry)).await;

    let payload = vec![0x5Au8; 2 * 1024 * 1024];
    commit(&vis, &payload);

    let client = RemoteDataClient::new(
        addr.to_string(),
        vec![DataRequirements::new().with_stream("visibilities")],
        Duration::from_secs(2),
        Duration::from_secs(2),
    );
    let (_client, delivered) = cycle(client).await;

    let chunk = delivered.get("visibilities").expect("stream");
    assert_eq!(chunk.len(), payload.len());
    assert_eq!(chunk.data(), payload.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_request_served_from_any_requested_type() {
    let alpha = DataBuffer::new("alpha", RetentionPolicy::Stream, 2, 64);
    let beta = DataBuffer::new("beta", RetentionPolicy::Stream, 2, 64);
    let mut registry = BufferRegistry::new();
    registry.insert(Arc::clone(&alpha));
    registry.insert(Arc::clone(&beta));

    let server = DataServer::bind(
        "127.0.0.1:0",
        Arc::new(registry),
        Duration::from_millis(500),
        Duration::from_secs(5),
    )
    .await
    .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());

    // Data arrives on the second requested name while the server is waiting.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        commit(&beta, b"late");
    });

    let client = RemoteDataClient::new(
        addr.to_string(),
        vec![DataRequirements::new()
            .with_stream("alpha")
            .with_stream("beta")],
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let started = std::time::Instant::now();
    let (_client, delivered) = cycle(client).await;

    assert_eq!(delivered.get("beta").expect("late chunk").data(), b"late");
    assert!(
        started.elapsed() < Duration::from_millis(450),
        "wait ends as soon as any requested type commits"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acknowledge_probe_reports_server_time() {
    let addr = start_server(Arc::new(BufferRegistry::new())).await;
    let client = RemoteDataClient::new(
        addr.to_string(),
        vec![],
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    let ack = tokio::task::spawn_blocking(move || client.acknowledge())
        .await
        .expect("join")
        .expect("ack");
    assert!(ack.timestamp_ms > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_data_type_yields_empty_cycle() {
    let addr = start_server(Arc::new(BufferRegistry::new())).await;
    let client = RemoteDataClient::new(
        addr.to_string(),
        vec![DataRequirements::new().with_stream("wibble")],
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    let (client, delivered) = cycle(client).await;
    assert!(delivered.is_empty());
    assert_eq!(client.service_fetch_count(), 0);
}

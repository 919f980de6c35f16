//! Ingestion over a real socket: length-prefixed chunks land in a buffer in
//! commit order.

use rust_pipeline::buffer::{DataBuffer, RetentionPolicy};
use rust_pipeline::receiver::{Receiver, ReceiverStatus, TcpChunkSource};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn write_chunk(socket: &mut TcpStream, payload: &[u8]) {
    socket
        .write_u32_le(payload.len() as u32)
        .await
        .expect("length prefix");
    socket.write_all(payload).await.expect("payload");
}

async fn serve_chunks(listener: TcpListener, chunks: Vec<Vec<u8>>) {
    let (mut socket, _) = listener.accept().await.expect("accept");
    for chunk in chunks {
        write_chunk(&mut socket, &chunk).await;
    }
    socket.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn receiver_ingests_framed_chunks_until_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let producer = tokio::spawn(serve_chunks(
        listener,
        vec![b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec()],
    ));

    let buffer = DataBuffer::new("visibilities", RetentionPolicy::Stream, 8, 64);
    let source = TcpChunkSource::connect(&addr.to_string())
        .await
        .expect("connect");
    let report = Receiver::new(Arc::clone(&buffer), Box::new(source))
        .spawn()
        .join()
        .await;
    producer.await.expect("producer");

    assert!(matches!(report.status, ReceiverStatus::SourceClosed));
    assert_eq!(report.committed, 3);
    assert_eq!(report.dropped, 0);

    let current = buffer.acquire_current().expect("latest chunk current");
    assert_eq!(current.data(), b"charlie");
    assert_eq!(current.version(), 3);
}

#[tokio::test]
async fn service_buffer_retains_latest_ingested_value() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let producer = tokio::spawn(serve_chunks(
        listener,
        vec![b"calibration-1".to_vec(), b"calibration-2".to_vec()],
    ));

    // One slot: the second commit rewrites the retained value in place.
    let buffer = DataBuffer::new("calibration", RetentionPolicy::Service, 1, 64);
    let source = TcpChunkSource::connect(&addr.to_string())
        .await
        .expect("connect");
    let report = Receiver::new(Arc::clone(&buffer), Box::new(source))
        .spawn()
        .join()
        .await;
    producer.await.expect("producer");

    assert_eq!(report.committed, 2);
    let current = buffer.acquire_current().expect("retained value");
    assert_eq!(current.data(), b"calibration-2");
    assert_eq!(current.version(), 2);
}

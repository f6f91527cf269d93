//! Framing composition checks: messages written with the head writers parse
//! back identically, and bodies pumped through the framed stream arrive
//! byte for byte.

use interpose::message::{
    parse_request_line, read_response_head, write_request_head, BodyMode, Headers, HttpVersion,
    Request,
};
use interpose::stream::FramedStream;
use interpose::{body, BufferPool};
use tokio::io::{duplex, AsyncWriteExt};
use url::Url;

#[tokio::test]
async fn request_head_write_then_parse_round_trips() {
    let uri = Url::parse("http://example.test/search?q=rust").unwrap();
    let mut headers = Headers::new();
    headers.push("Host", "example.test");
    headers.push("Accept", "*/*");
    let request = Request::new(
        "GET".into(),
        "http://example.test/search?q=rust".into(),
        uri,
        HttpVersion::HTTP_11,
        headers,
    );

    let (mut tx, rx) = duplex(1024);
    write_request_head(&mut tx, &request, false).await.unwrap();
    drop(tx);

    let mut framed = FramedStream::new(rx, 1024);
    let line = framed.read_line().await.unwrap();
    let (method, target, version) = parse_request_line(&line).unwrap();
    assert_eq!(method, "GET");
    assert_eq!(target, "/search?q=rust");
    assert_eq!(version, HttpVersion::HTTP_11);

    let parsed = Headers::read_from(&mut framed).await.unwrap();
    assert_eq!(parsed.get("Host"), Some("example.test"));
    assert_eq!(parsed.get("Accept"), Some("*/*"));
    assert_eq!(parsed.len(), 2);
}

#[tokio::test]
async fn response_head_parses_off_the_wire() {
    let (mut tx, rx) = duplex(1024);
    tx.write_all(b"HTTP/1.1 301 Moved Permanently\r\nLocation: /elsewhere\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    drop(tx);

    let mut framed = FramedStream::new(rx, 1024);
    let response = read_response_head(&mut framed).await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.reason, "Moved Permanently");
    assert_eq!(response.headers.get("Location"), Some("/elsewhere"));
    assert_eq!(response.body_mode("GET"), BodyMode::None);
}

/// Pumping a body through the proxy's framing yields byte-for-byte equality
/// at the destination, for identity and chunked framings alike.
#[tokio::test]
async fn pumped_bodies_arrive_byte_for_byte() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    // identity framing
    let (mut tx, rx) = duplex(64 * 1024);
    tx.write_all(&payload).await.unwrap();
    drop(tx);
    let mut src = FramedStream::new(rx, 2048);
    let mut dst = Vec::new();
    let copied = body::pump(
        &mut src,
        &mut dst,
        BodyMode::Length(payload.len() as u64),
        &mut |_: &[u8]| {},
    )
    .await
    .unwrap();
    assert_eq!(copied, payload.len() as u64);
    assert_eq!(dst, payload);

    // chunked framing, then de-chunked read on the far side
    let (mut tx, rx) = duplex(64 * 1024);
    let mut wire = Vec::new();
    for chunk in payload.chunks(1000) {
        wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\n\r\n");
    tx.write_all(&wire).await.unwrap();
    drop(tx);

    let mut src = FramedStream::new(rx, 2048);
    let mut relayed = Vec::new();
    let copied = body::pump(&mut src, &mut relayed, BodyMode::Chunked, &mut |_: &[u8]| {})
        .await
        .unwrap();
    assert_eq!(copied, payload.len() as u64);
    // the relayed wire bytes decode back to the original payload
    let (mut tx2, rx2) = duplex(64 * 1024);
    tx2.write_all(&relayed).await.unwrap();
    drop(tx2);
    let mut dechunk = FramedStream::new(rx2, 2048);
    let decoded = body::read_to_vec(&mut dechunk, BodyMode::Chunked).await.unwrap();
    assert_eq!(decoded, payload);
}

#[tokio::test]
async fn buffer_pool_survives_concurrent_leases() {
    let pool = BufferPool::new(4096);
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = std::sync::Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let mut lease = pool.lease();
                lease[0] = 1;
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

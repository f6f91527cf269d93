//! Transparent-endpoint exercises: SNI-driven TLS termination and the
//! plaintext fallthrough.

use interpose::{Endpoint, ProxyConfig, ProxyContext, TransparentEndpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_proxy(ctx: Arc<ProxyContext>, endpoint: Endpoint) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let ctx = Arc::clone(&ctx);
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let _ = interpose::handle_client(stream, ctx, endpoint).await;
            });
        }
    });
    addr
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// TLS transparent interception: the client's SNI picks the minted leaf,
/// the request is decrypted, forwarded over TLS, and re-encrypted back.
#[tokio::test]
async fn transparent_tls_terminates_on_sni() {
    use rcgen::{CertificateParams, DnType, SanType};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "origin");
    params.subject_alt_names = vec![SanType::IpAddress("127.0.0.1".parse().unwrap())];
    let origin_cert = rcgen::Certificate::from_params(params).unwrap();
    let origin_der = origin_cert.serialize_der().unwrap();
    let origin_key = origin_cert.serialize_private_key_der();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(origin_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(origin_key)),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (stream, _) = origin.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let head = read_head(&mut tls).await;
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndata")
            .await
            .unwrap();
        tls.shutdown().await.ok();
        head
    });

    let config = ProxyConfig::default();
    let upstream_tls = interpose::tls::upstream_client_config(
        config.supported_tls_protocols,
        &[CertificateDer::from(origin_der)],
    )
    .unwrap();
    let ctx = Arc::new(ProxyContext::with_upstream_tls(config, upstream_tls).unwrap());

    let endpoint = Endpoint::Transparent(Arc::new(TransparentEndpoint::new("fallback.test")));
    let proxy = spawn_proxy(Arc::clone(&ctx), endpoint).await;

    // client trusts the proxy CA and asks for site.test via SNI
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(ctx.certs.ca_certificate_der().to_vec()))
        .unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(proxy).await.unwrap();
    let name = ServerName::try_from("site.test").unwrap();
    let mut tls_client = connector.connect(name, tcp).await.unwrap();

    tls_client
        .write_all(format!("GET /t HTTP/1.1\r\nHost: {}\r\n\r\n", origin_addr).as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut tls_client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", head);
    let mut body = vec![0u8; 4];
    tls_client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"data");

    let origin_head = origin_task.await.unwrap();
    assert!(origin_head.starts_with("GET /t HTTP/1.1\r\n"), "got: {}", origin_head);
}

/// Plain bytes on a TLS-enabled transparent endpoint fall through to
/// plaintext proxying driven by the Host header.
#[tokio::test]
async fn transparent_plaintext_fallthrough() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain")
            .await
            .unwrap();
        head
    });

    let ctx = Arc::new(ProxyContext::new(ProxyConfig::default()).unwrap());
    let endpoint = Endpoint::Transparent(Arc::new(TransparentEndpoint::new("fallback.test")));
    let proxy = spawn_proxy(ctx, endpoint).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("GET /p HTTP/1.1\r\nHost: {}\r\n\r\n", origin_addr).as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", head);
    let mut body = vec![0u8; 5];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"plain");

    let origin_head = origin_task.await.unwrap();
    assert!(origin_head.starts_with("GET /p HTTP/1.1\r\n"), "got: {}", origin_head);
    assert!(origin_head.contains("Accept-Encoding: gzip,deflate"));
}

//! TLS handshake inspection and upstream TLS configuration.
//!
//! ClientHello/ServerHello classification works over the framed stream's
//! buffered lookahead only; nothing is consumed, so a later handshake or
//! splice observes the identical bytes.

use crate::config::TlsProtocols;
use crate::error::ProxyError;
use crate::stream::FramedStream;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tls_parser::{TlsMessage, TlsMessageHandshake};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;

/// What the first TLS record of a client handshake revealed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientHelloInfo {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub versions: Vec<u16>,
}

/// What the first TLS record of a server handshake revealed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerHelloInfo {
    pub version: u16,
    pub cipher: u16,
}

/// Non-consuming ClientHello classification.
///
/// Returns `None` when the buffered bytes do not start a TLS handshake
/// record. When the record is TLS but too large for the lookahead window,
/// the tunnel is still classified as TLS with an empty info.
pub async fn client_hello<S>(
    framed: &mut FramedStream<S>,
) -> Result<Option<ClientHelloInfo>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let window = match peek_handshake_record(framed).await? {
        Some(window) => window,
        None => return Ok(None),
    };

    let mut info = ClientHelloInfo::default();
    if let Ok((_, record)) = tls_parser::parse_tls_plaintext(window) {
        if let Some(TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello))) =
            record.msg.first()
        {
            if let Some(ext_data) = hello.ext {
                if let Ok((_, extensions)) = tls_parser::parse_tls_extensions(ext_data) {
                    for ext in extensions {
                        match ext {
                            tls_parser::TlsExtension::SNI(names) => {
                                for (kind, data) in names {
                                    if kind == tls_parser::SNIType::HostName {
                                        if let Ok(name) = std::str::from_utf8(data) {
                                            info.sni = Some(name.to_string());
                                            break;
                                        }
                                    }
                                }
                            }
                            tls_parser::TlsExtension::ALPN(protocols) => {
                                info.alpn = protocols
                                    .iter()
                                    .filter_map(|p| std::str::from_utf8(p).ok())
                                    .map(str::to_string)
                                    .collect();
                            }
                            tls_parser::TlsExtension::SupportedVersions(versions) => {
                                info.versions = versions.iter().map(|v| v.0).collect();
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    } else {
        debug!("TLS record larger than lookahead window, classifying without SNI");
    }
    Ok(Some(info))
}

/// Non-consuming ServerHello classification on an outbound stream.
pub async fn server_hello<S>(
    framed: &mut FramedStream<S>,
) -> Result<Option<ServerHelloInfo>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let window = match peek_handshake_record(framed).await? {
        Some(window) => window,
        None => return Ok(None),
    };

    if let Ok((_, record)) = tls_parser::parse_tls_plaintext(window) {
        if let Some(TlsMessage::Handshake(TlsMessageHandshake::ServerHello(hello))) =
            record.msg.first()
        {
            return Ok(Some(ServerHelloInfo {
                version: hello.version.0,
                cipher: hello.cipher.0,
            }));
        }
    }
    // handshake record that did not parse fully; report the record version
    let version = u16::from_be_bytes([window[1], window[2]]);
    Ok(Some(ServerHelloInfo { version, cipher: 0 }))
}

/// Buffer the first TLS record if one is present. `None` for non-TLS bytes.
async fn peek_handshake_record<S>(
    framed: &mut FramedStream<S>,
) -> Result<Option<&[u8]>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = framed.fill_lookahead(TLS_RECORD_HEADER_LEN).await?;
    if head.len() < TLS_RECORD_HEADER_LEN
        || head[0] != TLS_HANDSHAKE_CONTENT_TYPE
        || !(head[1] == 0x03 || head[1] == 0x02)
    {
        return Ok(None);
    }
    let record_len = u16::from_be_bytes([head[3], head[4]]) as usize;
    let window = framed
        .fill_lookahead(TLS_RECORD_HEADER_LEN + record_len)
        .await?;
    Ok(Some(window))
}

/// Build the client config used for upstream TLS origination: webpki roots,
/// hostname verification, HTTP/1.1 ALPN.
pub fn upstream_client_config(
    protocols: TlsProtocols,
    extra_roots: &[CertificateDer<'static>],
) -> Result<Arc<ClientConfig>, ProxyError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
    for root in extra_roots {
        root_store
            .add(root.clone())
            .map_err(|e| ProxyError::Certificate(format!("invalid extra root: {}", e)))?;
    }

    let mut config = ClientConfig::builder_with_protocol_versions(&protocols.versions())
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

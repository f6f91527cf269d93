//! Transparent-endpoint handler.
//!
//! Traffic arrives origin-directed (NAT/iptables redirect), so there is no
//! CONNECT preamble: peek for a ClientHello, derive the certificate name
//! from SNI (falling back to the endpoint's configured default), terminate
//! TLS, and enter the session loop with the implicit host.

use crate::config::TransparentEndpoint;
use crate::error::ProxyError;
use crate::session_loop::{self, LoopMode};
use crate::stream::{BoxedStream, FramedStream, PrefixedStream};
use crate::tls;
use crate::ProxyContext;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Handle one accepted client on a transparent endpoint.
pub(crate) async fn handle_transparent<S>(
    stream: S,
    ctx: Arc<ProxyContext>,
    endpoint: Arc<TransparentEndpoint>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client = FramedStream::new(Box::new(stream) as BoxedStream, ctx.config.buffer_size);

    if endpoint.tls_enabled {
        if let Some(hello) = tls::client_hello(&mut client).await? {
            let name = hello
                .sni
                .clone()
                .unwrap_or_else(|| endpoint.default_sni_name.clone());
            debug!(sni = ?hello.sni, name = %name, "transparent TLS client");

            let server_config = match &endpoint.generic_certificate {
                Some(config) => Arc::clone(config),
                None => ctx.certs.server_config(&name).await?,
            };
            let acceptor = TlsAcceptor::from(server_config);
            let (stream, leftover) = client.into_parts();
            let tls_stream = match acceptor.accept(PrefixedStream::new(stream, leftover)).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(name = %name, error = %error, "transparent TLS handshake failed");
                    return Err(ProxyError::TlsHandshakeFailed(error.to_string()));
                }
            };
            let client =
                FramedStream::new(Box::new(tls_stream) as BoxedStream, ctx.config.buffer_size);

            session_loop::run(
                ctx,
                client,
                LoopMode::Transparent {
                    tls: true,
                    implicit_host: Some(name),
                },
                None,
            )
            .await;
            return Ok(());
        }
        debug!("no ClientHello on TLS-enabled transparent endpoint, continuing in plaintext");
    }

    session_loop::run(
        ctx,
        client,
        LoopMode::Transparent {
            tls: false,
            implicit_host: Some(endpoint.default_sni_name.clone()),
        },
        None,
    )
    .await;
    Ok(())
}

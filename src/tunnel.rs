//! Explicit-endpoint handler: the `CONNECT` state machine.
//!
//! A freshly accepted client either opens a tunnel with `CONNECT` or sends
//! an ordinary absolute-URL request. Tunnels are classified by a
//! non-consuming ClientHello peek and then either blind-spliced (excluded
//! host or non-TLS payload) or TLS-terminated with a minted leaf and handed
//! to the session loop. A decrypted tunnel that does not look like HTTP
//! falls back to a TLS-bridged splice.

use crate::config::ExplicitEndpoint;
use crate::error::ProxyError;
use crate::factory::ConnectionTarget;
use crate::hooks::Direction;
use crate::message::{parse_request_line, Headers, HttpVersion, Request};
use crate::relay;
use crate::session::ConnectRequest;
use crate::session_loop::{self, LoopMode};
use crate::stream::{BoxedStream, FramedStream, PrefixedStream};
use crate::tls;
use crate::ProxyContext;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use url::Url;

/// Handle one accepted client on an explicit endpoint.
pub(crate) async fn handle_explicit<S>(
    stream: S,
    ctx: Arc<ProxyContext>,
    endpoint: Arc<ExplicitEndpoint>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client = FramedStream::new(Box::new(stream) as BoxedStream, ctx.config.buffer_size);

    let line = client.read_line().await?;
    if line.is_empty() {
        // client connected and went away; close silently
        return Ok(());
    }
    let (method, _, _) = parse_request_line(&line)?;

    if method != "CONNECT" {
        session_loop::run(ctx, client, LoopMode::PlainExplicit, Some(line)).await;
        return Ok(());
    }

    handle_connect(client, ctx, endpoint, &line).await
}

async fn handle_connect(
    mut client: FramedStream<BoxedStream>,
    ctx: Arc<ProxyContext>,
    endpoint: Arc<ExplicitEndpoint>,
    line: &str,
) -> Result<(), ProxyError> {
    let (method, target, version) = parse_request_line(line)?;
    let (host, port) = parse_authority(&target, 443)?;
    let headers = Headers::read_from(&mut client).await?;

    let uri = Url::parse(&format!("http://{}:{}", host, port)).map_err(|e| {
        ProxyError::MalformedFraming(format!("bad CONNECT target {}: {}", target, e))
    })?;
    let request = Request::new(method, target, uri, version, headers);
    let mut connect = ConnectRequest::new(request, host.clone(), port);
    connect.excluded = endpoint.is_excluded(&host);

    info!(host = %host, port, excluded = connect.excluded, "CONNECT received");

    ctx.hooks.tunnel_connect_request(&mut connect).await?;

    let accepted = ctx
        .authorizer
        .authorize(&connect.request, &mut client)
        .await
        .map_err(ProxyError::HookFailure)?;
    if !accepted {
        debug!(host = %host, "tunnel authorisation denied, challenge written");
        ctx.hooks.tunnel_connect_response(&mut connect).await?;
        return Ok(());
    }

    let established = format!("{} 200 Connection Established\r\n\r\n", version);
    client.write_all(established.as_bytes()).await?;
    client.flush().await?;

    connect.client_hello = tls::client_hello(&mut client).await?;
    connect.is_tls = connect.client_hello.is_some();
    ctx.hooks.tunnel_connect_response(&mut connect).await?;

    if connect.excluded || !connect.is_tls {
        return blind_splice(&ctx, client, connect, version).await;
    }

    // decryption path: the tunnel's effective URI becomes https
    connect.request.uri = Url::parse(&format!("https://{}:{}", host, port))
        .map_err(|e| ProxyError::MalformedFraming(format!("bad tunnel host {}: {}", host, e)))?;

    let server_config = match &endpoint.generic_certificate {
        Some(config) => Arc::clone(config),
        None => ctx.certs.server_config(&host).await?,
    };
    let acceptor = TlsAcceptor::from(server_config);
    let (stream, leftover) = client.into_parts();
    let tls_stream = match acceptor.accept(PrefixedStream::new(stream, leftover)).await {
        Ok(stream) => stream,
        Err(error) => {
            // silent close on the client side of CONNECT
            debug!(host = %host, error = %error, "client TLS handshake failed");
            return Ok(());
        }
    };
    let mut client = FramedStream::new(Box::new(tls_stream) as BoxedStream, ctx.config.buffer_size);

    if !looks_like_http_method(&mut client).await? {
        // some protocols tunnel non-HTTP over 443; bridge the decrypted
        // bytes to the origin over a fresh TLS connection
        debug!(host = %host, "tunnel payload is not HTTP, bridging without interception");
        let target = ConnectionTarget::new(host.clone(), port, version, true);
        let outbound = ctx.factory.acquire(&target, ctx.config.buffer_size).await?;
        let (client_stream, client_pending) = client.into_parts();
        let (upstream_stream, upstream_pending) = outbound.into_framed().into_parts();
        relay::splice(
            client_stream,
            client_pending,
            upstream_stream,
            upstream_pending,
            Arc::clone(&ctx.hooks),
            Arc::clone(&ctx.buffers),
        )
        .await?;
        return Ok(());
    }

    session_loop::run(ctx, client, LoopMode::DecryptedTunnel { host, port }, None).await;
    Ok(())
}

/// Relay the tunnel verbatim: raw TCP to the origin, no TLS handshake on
/// either side of this proxy.
async fn blind_splice(
    ctx: &Arc<ProxyContext>,
    mut client: FramedStream<BoxedStream>,
    mut connect: ConnectRequest,
    version: HttpVersion,
) -> Result<(), ProxyError> {
    let target = ConnectionTarget::raw(connect.host.clone(), connect.port, version);
    let mut outbound = ctx.factory.acquire(&target, ctx.config.buffer_size).await?;

    if connect.is_tls {
        // forward the peeked ClientHello so the origin answers, then stash
        // its ServerHello on the connect record
        let pending = client.take_buffered();
        if !pending.is_empty() {
            ctx.hooks.observe(Direction::Sent, &pending);
            outbound.framed_mut().write_all(&pending).await?;
            outbound.framed_mut().flush().await?;
        }
        connect.server_hello = tls::server_hello(outbound.framed_mut()).await?;
        debug!(
            host = %connect.host,
            server_hello = connect.server_hello.is_some(),
            "raw TLS tunnel established"
        );
    }

    let (client_stream, client_pending) = client.into_parts();
    let (upstream_stream, upstream_pending) = outbound.into_framed().into_parts();
    relay::splice(
        client_stream,
        client_pending,
        upstream_stream,
        upstream_pending,
        Arc::clone(&ctx.hooks),
        Arc::clone(&ctx.buffers),
    )
    .await?;
    Ok(())
}

/// Probe whether decrypted tunnel bytes look like an HTTP request: at least
/// three leading ASCII letters followed by a space, within the first ten
/// bytes. EOF and early non-letters are not HTTP.
async fn looks_like_http_method<S>(framed: &mut FramedStream<S>) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let window = framed.fill_lookahead(10).await?;
    for (i, &byte) in window.iter().take(10).enumerate() {
        if byte == b' ' {
            return Ok(i >= 3);
        }
        if !byte.is_ascii_alphabetic() {
            return Ok(false);
        }
    }
    Ok(false)
}

/// Split `host:port`, tolerating bracketed IPv6 literals. The port defaults
/// when the target carries none.
fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let strip = |h: &str| h.trim_matches(|c| c == '[' || c == ']').to_string();

    let mut parts = authority.rsplitn(2, ':');
    let first = parts.next().unwrap_or_default();
    match parts.next() {
        Some(host) if !host.is_empty() => {
            let port: u16 = first.parse().map_err(|_| {
                ProxyError::MalformedFraming(format!("bad CONNECT port: {}", first))
            })?;
            if port == 0 {
                return Err(ProxyError::MalformedFraming("CONNECT port is zero".into()));
            }
            Ok((strip(host), port))
        }
        Some(_) => Err(ProxyError::MalformedFraming(format!(
            "bad CONNECT target: {}",
            authority
        ))),
        None if !first.is_empty() => Ok((strip(first), default_port)),
        None => Err(ProxyError::MalformedFraming("empty CONNECT target".into())),
    }
}

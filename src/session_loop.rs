//! Keep-alive request loop over one accepted client.
//!
//! Each iteration completes a full request/response exchange or exits. At
//! most one outbound connection is held across iterations; it is reused only
//! while its identity matches the next request's target. The client stream
//! is never closed between iterations, only on loop exit.
//!
//! Failure policy: every iteration catches, reports through the exception
//! reporter, and terminates the loop; resource release happens on all exit
//! paths.

use crate::body;
use crate::codec;
use crate::error::ProxyError;
use crate::factory::{self, ConnectionTarget, OutboundConnection};
use crate::hooks::Direction;
use crate::message::{
    parse_request_line, read_response_head, write_request_head, write_response_head, BodyMode,
    Headers, Request, Response,
};
use crate::relay;
use crate::session::Session;
use crate::stream::{BoxedStream, FramedStream};
use crate::ProxyContext;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// How client traffic reached the loop; decides effective-URI assembly.
#[derive(Debug, Clone)]
pub enum LoopMode {
    /// Explicit endpoint without CONNECT: absolute URLs on the request line.
    PlainExplicit,
    /// Explicit CONNECT tunnel after TLS decryption.
    DecryptedTunnel { host: String, port: u16 },
    /// Transparent endpoint traffic, TLS-terminated or plaintext.
    Transparent {
        tls: bool,
        implicit_host: Option<String>,
    },
}

enum ExchangeEnd {
    KeepAlive {
        client: FramedStream<BoxedStream>,
        outbound: Option<OutboundConnection>,
    },
    Closed {
        outbound: Option<OutboundConnection>,
    },
}

enum ResponseOutcome {
    Disposed,
    ReRequest,
    Completed {
        client_keep_alive: bool,
        origin_reusable: bool,
    },
}

/// Run exchanges until the client closes, an error disposes the session, or
/// an exchange takes the connection over (websocket, splice).
pub(crate) async fn run(
    ctx: Arc<ProxyContext>,
    mut client: FramedStream<BoxedStream>,
    mode: LoopMode,
    mut first_line: Option<String>,
) {
    let mut held: Option<OutboundConnection> = None;

    loop {
        let line = match first_line.take() {
            Some(line) => line,
            None => match client.read_line().await {
                Ok(line) => line,
                Err(error) => {
                    ctx.hooks.report(&error);
                    break;
                }
            },
        };
        if line.is_empty() {
            debug!("client closed, session loop ends");
            break;
        }

        match run_exchange(&ctx, client, held.take(), &mode, line).await {
            Ok(ExchangeEnd::KeepAlive {
                client: returned,
                outbound,
            }) => {
                client = returned;
                held = outbound;
            }
            Ok(ExchangeEnd::Closed { outbound }) => {
                if let Some(conn) = outbound {
                    ctx.factory.release(conn, true).await;
                }
                return;
            }
            Err(error) => {
                ctx.hooks.report(&error);
                return;
            }
        }
    }

    if let Some(conn) = held {
        ctx.factory.release(conn, true).await;
    }
}

async fn run_exchange(
    ctx: &Arc<ProxyContext>,
    mut client: FramedStream<BoxedStream>,
    held: Option<OutboundConnection>,
    mode: &LoopMode,
    start_line: String,
) -> Result<ExchangeEnd, ProxyError> {
    let (method, target, version) = parse_request_line(&start_line)?;
    let headers = Headers::read_from(&mut client).await?;
    let uri = effective_uri(mode, &target, &headers)?;
    let request = Request::new(method, target, uri, version, headers);

    debug!(
        method = %request.method,
        uri = %request.uri,
        "request received"
    );

    // plain explicit requests authorise before anything goes upstream
    if matches!(mode, LoopMode::PlainExplicit) {
        let accepted = ctx
            .authorizer
            .authorize(&request, &mut client)
            .await
            .map_err(ProxyError::HookFailure)?;
        if !accepted {
            debug!("proxy authorisation denied, challenge written");
            if let Some(conn) = held {
                ctx.factory.release(conn, true).await;
            }
            return Ok(ExchangeEnd::Closed { outbound: None });
        }
    }

    let mut session = Session::new(request, client);
    normalise_request(&mut session.request);

    // the body must be replayable across an auth round trip
    if ctx.config.enable_windows_auth && session.request.body_mode() != BodyMode::None {
        session.read_request_body().await?;
    }

    ctx.hooks.before_request(&mut session).await?;
    if session.request.cancel {
        debug!("exchange cancelled by hook");
        if let Some(conn) = held {
            ctx.factory.release(conn, true).await;
        }
        return Ok(ExchangeEnd::Closed { outbound: None });
    }
    session.request.locked = true;

    // reuse the held connection only while its identity still matches
    let target = connection_target(&session.request);
    let wanted = ctx.factory.identity_for(&target);
    if let Some(conn) = held {
        if conn.identity() == &wanted {
            session.outbound = Some(conn);
        } else {
            debug!("held connection identity mismatch, releasing");
            ctx.factory.release(conn, true).await;
        }
    }
    if session.outbound.is_none() {
        match ctx.factory.acquire(&target, ctx.config.buffer_size).await {
            Ok(conn) => session.outbound = Some(conn),
            Err(error) => {
                if matches!(error, ProxyError::UpstreamUnreachable { .. })
                    && !session.response_emitted
                {
                    let _ = factory::write_bad_gateway(
                        &mut session.client,
                        session.request.version,
                        &error.to_string(),
                    )
                    .await;
                }
                return Err(error);
            }
        }
    }

    // upgrade takes the connection over entirely
    if session.request.is_websocket_upgrade() {
        return websocket_exchange(ctx, session).await;
    }

    loop {
        send_request(ctx, &mut session).await?;
        match handle_response(ctx, &mut session).await? {
            ResponseOutcome::Disposed => {
                return Ok(ExchangeEnd::Closed { outbound: None });
            }
            ResponseOutcome::ReRequest => {
                debug!("hook requested re-request, reusing outbound connection");
                session.response = Response::default();
                session.response_head_received = false;
            }
            ResponseOutcome::Completed {
                client_keep_alive,
                origin_reusable,
            } => {
                session.client.flush().await?;
                let (client, outbound) = session.into_client();
                let outbound = match outbound {
                    Some(conn) if origin_reusable => Some(conn),
                    Some(conn) => {
                        ctx.factory.release(conn, false).await;
                        None
                    }
                    None => None,
                };
                if client_keep_alive {
                    return Ok(ExchangeEnd::KeepAlive { client, outbound });
                }
                return Ok(ExchangeEnd::Closed { outbound });
            }
        }
    }
}

/// Strip proxy-only headers and pin the encodings this proxy can decode.
fn normalise_request(request: &mut Request) {
    // the only decodings available when a hook inspects the body
    request.headers.set("Accept-Encoding", "gzip,deflate");
    request.headers.remove("Proxy-Connection");
    request.headers.remove("Proxy-Authorization");
    if request.headers.get("Host").is_none() {
        let mut host = request.uri.host_str().unwrap_or_default().to_string();
        if let Some(port) = request.uri.port() {
            host = format!("{}:{}", host, port);
        }
        request.headers.push("Host", host);
    }
}

fn connection_target(request: &Request) -> ConnectionTarget {
    let mut target = ConnectionTarget::new(
        request.host(),
        request.port(),
        request.version,
        request.is_tls(),
    );
    target.upstream_override = request.upstream_override.clone();
    target
}

fn effective_uri(mode: &LoopMode, target: &str, headers: &Headers) -> Result<Url, ProxyError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Url::parse(target)
            .map_err(|e| ProxyError::MalformedFraming(format!("bad request URL {}: {}", target, e)));
    }
    let path = origin_form(target);
    let assembled = match mode {
        LoopMode::PlainExplicit => {
            return Err(ProxyError::MalformedFraming(format!(
                "explicit proxy requests must use absolute URLs, got {}",
                target
            )))
        }
        LoopMode::DecryptedTunnel { host, port } => {
            let authority = match headers.get("Host") {
                Some(h) if h.contains(':') || *port == 443 => h.to_string(),
                Some(h) => format!("{}:{}", h, port),
                None => format!("{}:{}", host, port),
            };
            format!("https://{}{}", authority, path)
        }
        LoopMode::Transparent { tls, implicit_host } => {
            let scheme = if *tls { "https" } else { "http" };
            let authority = headers
                .get("Host")
                .map(str::to_string)
                .or_else(|| implicit_host.clone())
                .ok_or_else(|| {
                    ProxyError::MalformedFraming(
                        "transparent request without Host header or implicit host".into(),
                    )
                })?;
            format!("{}://{}{}", scheme, authority, path)
        }
    };
    Url::parse(&assembled)
        .map_err(|e| ProxyError::MalformedFraming(format!("bad request target {}: {}", target, e)))
}

fn origin_form(target: &str) -> &str {
    if target.starts_with('/') {
        target
    } else {
        "/"
    }
}

async fn send_request(ctx: &Arc<ProxyContext>, session: &mut Session) -> Result<(), ProxyError> {
    // a materialised body is re-framed as identity; chunked re-send of
    // hook-supplied bodies is not supported
    let materialised = if session.request.body_read {
        let body = session.request.body.clone().unwrap_or_default();
        let encoded = match session.request.headers.get("Content-Encoding") {
            Some(encoding) => codec::compress(encoding, &body)?,
            None => body.to_vec(),
        };
        session.request.headers.remove("Transfer-Encoding");
        session
            .request
            .headers
            .set("Content-Length", encoded.len().to_string());
        Some(encoded)
    } else {
        None
    };

    let absolute_form = session
        .outbound
        .as_ref()
        .map(|c| c.uses_absolute_form())
        .unwrap_or(false);
    {
        let outbound = session
            .outbound
            .as_mut()
            .ok_or_else(|| ProxyError::Http("request send without outbound connection".into()))?;
        write_request_head(outbound.framed_mut(), &session.request, absolute_form).await?;
        outbound.framed_mut().flush().await?;
    }

    if session.request.expects_continue() {
        let outbound = session.outbound.as_mut().unwrap();
        let interim = read_response_head(outbound.framed_mut()).await?;
        match interim.status {
            100 => {
                debug!("origin accepted 100-continue");
                if ctx.config.enable_100_continue {
                    let line = format!("{} 100 Continue\r\n\r\n", session.request.version);
                    session.client.write_all(line.as_bytes()).await?;
                    session.client.flush().await?;
                }
                session.response.got_continue = true;
            }
            417 => {
                debug!("origin rejected expectation, skipping request body");
                session.response = interim;
                session.response.expectation_failed = true;
                session.response_head_received = true;
                return Ok(());
            }
            status => {
                debug!(status, "origin answered before the request body");
                session.response = interim;
                session.response_head_received = true;
                return Ok(());
            }
        }
    }

    if let Some(body) = materialised {
        if !body.is_empty() {
            ctx.hooks.observe(Direction::Sent, &body);
            let outbound = session.outbound.as_mut().unwrap();
            outbound.framed_mut().write_all(&body).await?;
        }
    } else {
        let mode = session.request.body_mode();
        if mode != BodyMode::None && !session.request_body_sent {
            let Session {
                client, outbound, ..
            } = session;
            let outbound = outbound.as_mut().unwrap();
            let hooks = &ctx.hooks;
            body::pump(client, outbound.framed_mut(), mode, &mut |chunk| {
                hooks.observe(Direction::Sent, chunk)
            })
            .await?;
        }
    }
    session.request_body_sent = true;

    let outbound = session.outbound.as_mut().unwrap();
    outbound.framed_mut().flush().await?;
    Ok(())
}

async fn handle_response(
    ctx: &Arc<ProxyContext>,
    session: &mut Session,
) -> Result<ResponseOutcome, ProxyError> {
    if !session.response_head_received {
        let got_continue = session.response.got_continue;
        let outbound = session
            .outbound
            .as_mut()
            .ok_or_else(|| ProxyError::Http("response receive without outbound".into()))?;
        let mut response = read_response_head(outbound.framed_mut()).await?;
        // an unsolicited interim 100 is skipped, the real response follows
        while response.status == 100 {
            debug!("skipping unsolicited 100 Continue");
            response = read_response_head(outbound.framed_mut()).await?;
        }
        session.response = response;
        session.response.got_continue = got_continue;
        session.response_head_received = true;
    }

    if ctx.config.enable_windows_auth && session.response.status == 401 {
        let disposed = ctx
            .challenger
            .handle_unauthorized(session)
            .await
            .map_err(ProxyError::HookFailure)?;
        if disposed {
            debug!("auth challenger disposed the session");
            session.outbound.take();
            return Ok(ResponseOutcome::Disposed);
        }
    }

    session.response.re_request = false;
    if !session.response.locked {
        ctx.hooks.before_response(session).await?;
    }
    if session.response.re_request {
        return Ok(ResponseOutcome::ReRequest);
    }
    session.response.locked = true;

    if let Err(error) = write_client_response(ctx, session).await {
        // dispose both sides on any I/O failure past this point
        warn!(error = %error, "response relay failed, disposing session");
        session.outbound.take();
        return Err(ProxyError::Http(error.to_string()));
    }

    let client_keep_alive = session
        .response
        .keep_alive(&session.request.method, session.request.version);
    let origin_reusable = origin_reusable(&session.response, &session.request.method);
    Ok(ResponseOutcome::Completed {
        client_keep_alive,
        origin_reusable,
    })
}

fn origin_reusable(response: &Response, request_method: &str) -> bool {
    if response.body_mode(request_method) == BodyMode::UntilClose {
        return false;
    }
    if response.headers.contains_token("Connection", "close") {
        return false;
    }
    match response.version {
        Some(version) if !version.keep_alive_default() => {
            response.headers.contains_token("Connection", "keep-alive")
        }
        Some(_) => true,
        None => false,
    }
}

async fn write_client_response(
    ctx: &Arc<ProxyContext>,
    session: &mut Session,
) -> Result<(), ProxyError> {
    if session.response.body_read {
        let body = session.response.body.clone().unwrap_or_default();
        let encoded = match session.response.headers.get("Content-Encoding") {
            Some(encoding) => codec::compress(encoding, &body)?,
            None => body.to_vec(),
        };
        let chunked = session.response.is_chunked();
        if chunked {
            // chunked framing must not carry a length
            session.response.headers.remove("Content-Length");
        } else {
            session
                .response
                .headers
                .set("Content-Length", encoded.len().to_string());
        }
        fix_hop_by_hop(&mut session.response, &session.request);
        session.response_emitted = true;
        write_response_head(&mut session.client, &session.response, session.request.version)
            .await?;
        ctx.hooks.observe(Direction::Received, &encoded);
        if chunked {
            body::write_single_chunk(&mut session.client, &encoded).await?;
        } else if !encoded.is_empty() {
            session.client.write_all(&encoded).await?;
        }
    } else {
        let mode = session.response.body_mode(&session.request.method);
        fix_hop_by_hop(&mut session.response, &session.request);
        session.response_emitted = true;
        write_response_head(&mut session.client, &session.response, session.request.version)
            .await?;
        if mode != BodyMode::None {
            let Session {
                client, outbound, ..
            } = session;
            let outbound = outbound
                .as_mut()
                .ok_or_else(|| ProxyError::Http("response stream without outbound".into()))?;
            let hooks = &ctx.hooks;
            body::pump(outbound.framed_mut(), client, mode, &mut |chunk| {
                hooks.observe(Direction::Received, chunk)
            })
            .await?;
        }
    }
    session.client.flush().await?;
    Ok(())
}

fn fix_hop_by_hop(response: &mut Response, request: &Request) {
    response.headers.remove("Proxy-Connection");
    if !response.keep_alive(&request.method, request.version) {
        response.headers.set("Connection", "close");
    }
}

async fn websocket_exchange(
    ctx: &Arc<ProxyContext>,
    mut session: Session,
) -> Result<ExchangeEnd, ProxyError> {
    debug!(uri = %session.request.uri, "websocket upgrade requested");

    {
        let outbound = session
            .outbound
            .as_mut()
            .ok_or_else(|| ProxyError::Http("upgrade without outbound connection".into()))?;
        // start line and headers go upstream verbatim
        write_request_head(outbound.framed_mut(), &session.request, false).await?;
        outbound.framed_mut().flush().await?;
        session.response = read_response_head(outbound.framed_mut()).await?;
        session.response_head_received = true;
    }

    if !session.response.locked {
        ctx.hooks.before_response(&mut session).await?;
    }
    session.response.locked = true;
    session.response_emitted = true;
    write_response_head(&mut session.client, &session.response, session.request.version).await?;
    session.client.flush().await?;

    debug!(
        status = session.response.status,
        "upgrade handshake forwarded, entering raw relay"
    );
    let (client, outbound) = session.into_client();
    let outbound = outbound.expect("outbound present for upgrade");
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
    Ok(ExchangeEnd::Closed { outbound: None })
}

//! Per-exchange session state.
//!
//! A [`Session`] aggregates one request, one response, the accepted client's
//! framed stream, and (once acquired) the outbound connection. It lives for
//! exactly one request/response pair; the loop takes the client stream and
//! any held outbound connection back before the next iteration.
//!
//! Hooks receive `&mut Session` and use the body helpers to materialise and
//! substitute bodies; compressed bodies are transparently decoded on read
//! and re-encoded on send.

use crate::body;
use crate::codec;
use crate::error::ProxyError;
use crate::factory::OutboundConnection;
use crate::message::{Request, Response};
use crate::stream::{BoxedStream, FramedStream};
use crate::tls::{ClientHelloInfo, ServerHelloInfo};

/// One intercepted request/response exchange.
pub struct Session {
    pub request: Request,
    pub response: Response,
    pub(crate) client: FramedStream<BoxedStream>,
    pub(crate) outbound: Option<OutboundConnection>,
    /// Response status line and headers have been read from the outbound.
    pub(crate) response_head_received: bool,
    /// Response status line has been written to the client.
    pub(crate) response_emitted: bool,
    /// The request body already went upstream; a re-request must not try to
    /// stream it from the client again.
    pub(crate) request_body_sent: bool,
}

impl Session {
    pub(crate) fn new(request: Request, client: FramedStream<BoxedStream>) -> Self {
        Self {
            request,
            response: Response::default(),
            client,
            outbound: None,
            response_head_received: false,
            response_emitted: false,
            request_body_sent: false,
        }
    }

    pub(crate) fn into_client(self) -> (FramedStream<BoxedStream>, Option<OutboundConnection>) {
        (self.client, self.outbound)
    }

    /// Read the request body into memory, decoding any `Content-Encoding`
    /// this proxy understands. Idempotent; later sends re-frame the body as
    /// identity with a recomputed `Content-Length`.
    pub async fn read_request_body(&mut self) -> Result<&[u8], ProxyError> {
        if !self.request.body_read {
            let mode = self.request.body_mode();
            let raw = body::read_to_vec(&mut self.client, mode).await?;
            let decoded = match self.request.headers.get("Content-Encoding") {
                Some(encoding) => codec::decompress(encoding, &raw)?,
                None => raw,
            };
            self.request.body = Some(decoded.into());
            self.request.body_read = true;
        }
        Ok(self.request.body.as_deref().unwrap_or(&[]))
    }

    /// Substitute the request body. Only effective before the first outbound
    /// write of this exchange.
    pub fn set_request_body(&mut self, bytes: Vec<u8>) {
        self.request.set_body(bytes);
    }

    /// Read the response body into memory, decoding any `Content-Encoding`
    /// this proxy understands. Valid once the response head is available to
    /// the before-response hook.
    pub async fn read_response_body(&mut self) -> Result<&[u8], ProxyError> {
        if !self.response.body_read {
            if !self.response_head_received {
                return Err(ProxyError::Http(
                    "response body requested before the response head".into(),
                ));
            }
            let mode = self.response.body_mode(&self.request.method);
            let outbound = self.outbound.as_mut().ok_or_else(|| {
                ProxyError::Http("response body requested without an outbound connection".into())
            })?;
            let raw = body::read_to_vec(outbound.framed_mut(), mode).await?;
            let decoded = match self.response.headers.get("Content-Encoding") {
                Some(encoding) => codec::decompress(encoding, &raw)?,
                None => raw,
            };
            self.response.body = Some(decoded.into());
            self.response.body_read = true;
        }
        Ok(self.response.body.as_deref().unwrap_or(&[]))
    }

    /// Substitute the response body.
    pub fn set_response_body(&mut self, bytes: Vec<u8>) {
        self.response.set_body(bytes);
    }
}

/// The `CONNECT` exchange presented to the tunnel hooks.
///
/// Carries the peeked ClientHello once the tunnel has been classified, and
/// the ServerHello when decryption is bypassed and the raw handshake was
/// forwarded.
#[derive(Debug)]
pub struct ConnectRequest {
    pub request: Request,
    pub host: String,
    pub port: u16,
    /// Matched the endpoint's exclusion decision; hooks may observe it.
    pub excluded: bool,
    /// A TLS ClientHello was peeked on the tunnel.
    pub is_tls: bool,
    pub client_hello: Option<ClientHelloInfo>,
    pub server_hello: Option<ServerHelloInfo>,
}

impl ConnectRequest {
    pub(crate) fn new(request: Request, host: String, port: u16) -> Self {
        Self {
            request,
            host,
            port,
            excluded: false,
            is_tls: false,
            client_hello: None,
            server_hello: None,
        }
    }
}

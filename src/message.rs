//! HTTP/1.x message model and wire parsing.
//!
//! Start-lines and header blocks are parsed off a [`FramedStream`] line by
//! line. Duplicate headers are preserved in order; folded continuation lines
//! are joined to the previous header. The writer side emits canonical CRLF
//! framing.

use crate::config::UpstreamProxy;
use crate::error::ProxyError;
use crate::stream::FramedStream;
use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::Url;

/// HTTP version from a start line (`HTTP/<major>.<minor>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    pub fn parse(text: &str) -> Result<Self, ProxyError> {
        let digits = text
            .strip_prefix("HTTP/")
            .ok_or_else(|| ProxyError::MalformedFraming(format!("bad HTTP version: {}", text)))?;
        let (major, minor) = digits
            .split_once('.')
            .ok_or_else(|| ProxyError::MalformedFraming(format!("bad HTTP version: {}", text)))?;
        if major.len() != 1 || minor.len() != 1 {
            return Err(ProxyError::MalformedFraming(format!(
                "bad HTTP version: {}",
                text
            )));
        }
        match (
            major.chars().next().unwrap().to_digit(10),
            minor.chars().next().unwrap().to_digit(10),
        ) {
            (Some(ma), Some(mi)) => Ok(Self {
                major: ma as u8,
                minor: mi as u8,
            }),
            _ => Err(ProxyError::MalformedFraming(format!(
                "bad HTTP version: {}",
                text
            ))),
        }
    }

    /// Keep-alive is the default from HTTP/1.1 onward.
    pub fn keep_alive_default(self) -> bool {
        (self.major, self.minor) >= (1, 1)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Ordered header set. Duplicates are preserved; lookups are
/// case-insensitive and return the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    /// Remove every occurrence of `name`. Returns true if any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// True when any `name` header contains `token` in its comma list.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read a header block off the stream, up to and including the blank
    /// line. Continuation lines (leading whitespace) fold into the previous
    /// header.
    pub async fn read_from<S>(framed: &mut FramedStream<S>) -> Result<Self, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut headers = Headers::new();
        loop {
            let line = framed.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.entries.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => {
                        return Err(ProxyError::MalformedFraming(
                            "continuation line before any header".into(),
                        ))
                    }
                }
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProxyError::MalformedFraming(format!("malformed header line: {}", line))
            })?;
            headers.push(name.trim(), value.trim());
        }
    }

    /// Write every header line; does not write the terminating blank line.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        for (name, value) in &self.entries {
            w.write_all(name.as_bytes()).await?;
            w.write_all(b": ").await?;
            w.write_all(value.as_bytes()).await?;
            w.write_all(b"\r\n").await?;
        }
        Ok(())
    }
}

/// Transfer framing of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Length(u64),
    Chunked,
    /// Valid only for responses without length or chunking.
    UntilClose,
}

/// Parse `METHOD target HTTP/x.y`.
pub fn parse_request_line(line: &str) -> Result<(String, String, HttpVersion), ProxyError> {
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(ProxyError::MalformedFraming(format!(
                "bad request line: {}",
                line
            )))
        }
    };
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ProxyError::MalformedFraming(format!(
            "bad method: {}",
            method
        )));
    }
    Ok((
        method.to_string(),
        target.to_string(),
        HttpVersion::parse(version)?,
    ))
}

/// Parse `HTTP/x.y <code> [reason]`.
pub fn parse_status_line(line: &str) -> Result<(HttpVersion, u16, String), ProxyError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedFraming("empty status line".into()))?;
    let status = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedFraming(format!("bad status line: {}", line)))?;
    let reason = parts.next().unwrap_or("").to_string();
    let status = status
        .parse::<u16>()
        .map_err(|_| ProxyError::MalformedFraming(format!("bad status code: {}", status)))?;
    Ok((HttpVersion::parse(version)?, status, reason))
}

/// One intercepted client request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// Request-target exactly as received on the wire.
    pub original_target: String,
    /// Effective absolute URI.
    pub uri: Url,
    pub version: HttpVersion,
    pub headers: Headers,
    /// Present only when a hook (or the auth pre-buffer) read the body.
    pub body: Option<Bytes>,
    pub body_read: bool,
    /// Set by a hook to abandon the exchange before it is sent upstream.
    pub cancel: bool,
    /// Once locked, the start line and headers must not change.
    pub locked: bool,
    /// Hook-selected upstream proxy for this exchange only.
    pub upstream_override: Option<UpstreamProxy>,
}

impl Request {
    pub fn new(
        method: String,
        original_target: String,
        uri: Url,
        version: HttpVersion,
        headers: Headers,
    ) -> Self {
        Self {
            method,
            original_target,
            uri,
            version,
            headers,
            body: None,
            body_read: false,
            cancel: false,
            locked: false,
            upstream_override: None,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.contains_token("Transfer-Encoding", "chunked")
    }

    pub fn body_mode(&self) -> BodyMode {
        if self.is_chunked() {
            return BodyMode::Chunked;
        }
        match self.content_length() {
            Some(0) | None => BodyMode::None,
            Some(n) => BodyMode::Length(n),
        }
    }

    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("Expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.contains_token("Connection", "upgrade")
            && self
                .headers
                .get("Upgrade")
                .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }

    pub fn host(&self) -> &str {
        self.uri.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.uri.port_or_known_default().unwrap_or(80)
    }

    pub fn is_tls(&self) -> bool {
        self.uri.scheme() == "https"
    }

    /// Substitute the body. Marks it materialised so the send path re-frames
    /// it as identity with a recomputed `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
        self.body_read = true;
    }

    /// Request-target for the outbound wire: absolute-form when talking to
    /// an upstream proxy in the clear, origin-form otherwise.
    pub fn outbound_target(&self, absolute_form: bool) -> String {
        if absolute_form {
            return self.uri.as_str().to_string();
        }
        let mut target = self.uri.path().to_string();
        if let Some(q) = self.uri.query() {
            target.push('?');
            target.push_str(q);
        }
        target
    }
}

/// One origin response.
#[derive(Debug, Default)]
pub struct Response {
    pub version: Option<HttpVersion>,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub body_read: bool,
    /// Once locked, the before-response hook is no longer consulted.
    pub locked: bool,
    /// Set by a hook to re-send the (possibly modified) request.
    pub re_request: bool,
    /// Interim `100 Continue` observed for this exchange.
    pub got_continue: bool,
    /// `417 Expectation Failed` short-circuited the body send.
    pub expectation_failed: bool,
}

impl Response {
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.contains_token("Transfer-Encoding", "chunked")
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn body_mode(&self, request_method: &str) -> BodyMode {
        if request_method.eq_ignore_ascii_case("HEAD")
            || self.is_informational()
            || self.status == 204
            || self.status == 304
        {
            return BodyMode::None;
        }
        if self.is_chunked() {
            return BodyMode::Chunked;
        }
        match self.content_length() {
            Some(0) => BodyMode::None,
            Some(n) => BodyMode::Length(n),
            None => BodyMode::UntilClose,
        }
    }

    /// Whether the client connection survives this exchange.
    pub fn keep_alive(&self, request_method: &str, request_version: HttpVersion) -> bool {
        if self.headers.contains_token("Connection", "close") {
            return false;
        }
        if self.body_mode(request_method) == BodyMode::UntilClose {
            return false;
        }
        let version = self.version.unwrap_or(request_version);
        if !version.keep_alive_default() || !request_version.keep_alive_default() {
            return self.headers.contains_token("Connection", "keep-alive");
        }
        true
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
        self.body_read = true;
    }
}

/// Read a response head (status line plus headers) off an outbound stream.
pub async fn read_response_head<S>(framed: &mut FramedStream<S>) -> Result<Response, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = framed.read_line().await?;
    if line.is_empty() {
        return Err(ProxyError::Http(
            "upstream closed before sending a response".into(),
        ));
    }
    let (version, status, reason) = parse_status_line(&line)?;
    let headers = Headers::read_from(framed).await?;
    Ok(Response {
        version: Some(version),
        status,
        reason,
        headers,
        ..Response::default()
    })
}

/// Write a request head: start line, headers, terminating blank line.
pub async fn write_request_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    request: &Request,
    absolute_form: bool,
) -> std::io::Result<()> {
    let line = format!(
        "{} {} {}\r\n",
        request.method,
        request.outbound_target(absolute_form),
        request.version
    );
    w.write_all(line.as_bytes()).await?;
    request.headers.write_to(w).await?;
    w.write_all(b"\r\n").await
}

/// Write a response head: status line, headers, terminating blank line.
pub async fn write_response_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    response: &Response,
    fallback_version: HttpVersion,
) -> std::io::Result<()> {
    let line = format!(
        "{} {} {}\r\n",
        response.version.unwrap_or(fallback_version),
        response.status,
        response.reason
    );
    w.write_all(line.as_bytes()).await?;
    response.headers.write_to(w).await?;
    w.write_all(b"\r\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn parses_request_line() {
        let (method, target, version) =
            parse_request_line("GET http://example.test/hello HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "http://example.test/hello");
        assert_eq!(version, HttpVersion::HTTP_11);
    }

    #[test]
    fn rejects_lowercase_method() {
        assert!(matches!(
            parse_request_line("get / HTTP/1.1"),
            Err(ProxyError::MalformedFraming(_))
        ));
    }

    #[test]
    fn rejects_extra_request_line_fields() {
        assert!(parse_request_line("GET / HTTP/1.1 junk").is_err());
        assert!(parse_request_line("GET /").is_err());
    }

    #[test]
    fn version_must_be_single_digits() {
        assert!(HttpVersion::parse("HTTP/1.1").is_ok());
        assert!(HttpVersion::parse("HTTP/11").is_err());
        assert!(HttpVersion::parse("HTTP/1.12").is_err());
        assert!(HttpVersion::parse("SPDY/1.0").is_err());
    }

    #[test]
    fn parses_status_line_with_and_without_reason() {
        let (v, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(v, HttpVersion::HTTP_11);
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");

        let (_, status, reason) = parse_status_line("HTTP/1.1 204").unwrap();
        assert_eq!(status, 204);
        assert_eq!(reason, "");

        let (_, _, reason) = parse_status_line("HTTP/1.0 404 Not Found").unwrap();
        assert_eq!(reason, "Not Found");
    }

    #[tokio::test]
    async fn header_block_preserves_duplicates_and_folds() {
        let (mut tx, rx) = duplex(512);
        tx.write_all(
            b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\nX-Long: first\r\n second part\r\n\r\n",
        )
        .await
        .unwrap();
        drop(tx);

        let mut framed = FramedStream::new(rx, 1024);
        let headers = Headers::read_from(&mut framed).await.unwrap();
        let cookies: Vec<_> = headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(headers.get("x-long"), Some("first second part"));
    }

    #[test]
    fn contains_token_splits_comma_lists() {
        let mut headers = Headers::new();
        headers.push("Connection", "keep-alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("Connection", "keep-alive"));
        assert!(!headers.contains_token("Connection", "close"));
    }

    #[test]
    fn request_semantic_fields() {
        let uri = Url::parse("https://api.test/v1").unwrap();
        let mut headers = Headers::new();
        headers.push("Content-Length", "12");
        headers.push("Expect", "100-continue");
        headers.push("Connection", "Upgrade");
        headers.push("Upgrade", "websocket");
        let request = Request::new(
            "PUT".into(),
            "/v1".into(),
            uri,
            HttpVersion::HTTP_11,
            headers,
        );
        assert_eq!(request.body_mode(), BodyMode::Length(12));
        assert!(request.expects_continue());
        assert!(request.is_websocket_upgrade());
        assert!(request.is_tls());
        assert_eq!(request.port(), 443);
    }

    #[test]
    fn chunked_takes_precedence_over_length() {
        let uri = Url::parse("http://h.test/").unwrap();
        let mut headers = Headers::new();
        headers.push("Transfer-Encoding", "chunked");
        headers.push("Content-Length", "5");
        let request = Request::new("POST".into(), "/".into(), uri, HttpVersion::HTTP_11, headers);
        assert_eq!(request.body_mode(), BodyMode::Chunked);
    }

    #[test]
    fn response_body_mode_rules() {
        let mut response = Response {
            version: Some(HttpVersion::HTTP_11),
            status: 200,
            ..Response::default()
        };
        assert_eq!(response.body_mode("GET"), BodyMode::UntilClose);
        assert_eq!(response.body_mode("HEAD"), BodyMode::None);

        response.status = 304;
        assert_eq!(response.body_mode("GET"), BodyMode::None);

        response.status = 200;
        response.headers.push("Content-Length", "0");
        assert_eq!(response.body_mode("GET"), BodyMode::None);
    }

    #[test]
    fn keep_alive_rules() {
        let mut response = Response {
            version: Some(HttpVersion::HTTP_11),
            status: 200,
            ..Response::default()
        };
        response.headers.push("Content-Length", "3");
        assert!(response.keep_alive("GET", HttpVersion::HTTP_11));

        response.headers.set("Connection", "close");
        assert!(!response.keep_alive("GET", HttpVersion::HTTP_11));

        let mut old = Response {
            version: Some(HttpVersion::HTTP_10),
            status: 200,
            ..Response::default()
        };
        old.headers.push("Content-Length", "3");
        assert!(!old.keep_alive("GET", HttpVersion::HTTP_10));
        old.headers.push("Connection", "keep-alive");
        assert!(old.keep_alive("GET", HttpVersion::HTTP_10));
    }

    #[test]
    fn outbound_target_forms() {
        let uri = Url::parse("http://example.test/hello?x=1").unwrap();
        let request = Request::new(
            "GET".into(),
            "http://example.test/hello?x=1".into(),
            uri,
            HttpVersion::HTTP_11,
            Headers::new(),
        );
        assert_eq!(request.outbound_target(false), "/hello?x=1");
        assert_eq!(
            request.outbound_target(true),
            "http://example.test/hello?x=1"
        );
    }
}

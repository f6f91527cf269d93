//! Buffered framed stream over a duplex byte stream.
//!
//! [`FramedStream`] is the single read buffer the whole core frames through:
//! CRLF line reading, bounded non-consuming lookahead for TLS record and HTTP
//! method sniffing, and exact-length body transfer. No byte that has been
//! peeked is ever lost; a subsequent read or copy observes the same bytes.

use crate::error::ProxyError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Object-safe duplex stream; everything the core moves bytes through.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased duplex stream (plain TCP or a TLS wrap of it).
pub type BoxedStream = Box<dyn AsyncStream>;

/// Duplex stream with a fixed-size read buffer.
pub struct FramedStream<S = BoxedStream> {
    stream: S,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(stream: S, buffer_size: usize) -> Self {
        Self {
            stream,
            buf: vec![0u8; buffer_size.max(512)],
            start: 0,
            end: 0,
        }
    }

    /// Count of buffered but unconsumed bytes.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    /// The buffered window.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// One read into free buffer space. Returns 0 on EOF or full buffer.
    async fn fill(&mut self) -> std::io::Result<usize> {
        self.compact();
        if self.end == self.buf.len() {
            return Ok(0);
        }
        let n = self.stream.read(&mut self.buf[self.end..]).await?;
        self.end += n;
        Ok(n)
    }

    /// Buffer at least `want` bytes without consuming them, stopping early on
    /// EOF or when the buffer is full. Returns the buffered window.
    pub async fn fill_lookahead(&mut self, want: usize) -> Result<&[u8], ProxyError> {
        let want = want.min(self.buf.len());
        while self.available() < want {
            self.compact();
            if self.end == self.buf.len() {
                break;
            }
            let n = self.stream.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                break;
            }
            self.end += n;
        }
        Ok(self.buffered())
    }

    /// Peek the byte at `offset` within the buffered window, or `None` when
    /// the stream ends before `offset` is reachable.
    pub async fn peek_byte(&mut self, offset: usize) -> Result<Option<u8>, ProxyError> {
        let window = self.fill_lookahead(offset + 1).await?;
        Ok(window.get(offset).copied())
    }

    /// Read one CRLF-terminated line, excluding the terminator.
    ///
    /// Returns an empty string on clean EOF before any byte. A line longer
    /// than the buffer is [`ProxyError::MalformedFraming`].
    pub async fn read_line(&mut self) -> Result<String, ProxyError> {
        loop {
            let window = &self.buf[self.start..self.end];
            if let Some(pos) = find_crlf(window) {
                let line = std::str::from_utf8(&window[..pos])
                    .map_err(|_| {
                        ProxyError::MalformedFraming("header line is not valid UTF-8".into())
                    })?
                    .to_string();
                self.start += pos + 2;
                return Ok(line);
            }
            self.compact();
            if self.end == self.buf.len() {
                return Err(ProxyError::MalformedFraming(
                    "line exceeds buffer capacity without CRLF".into(),
                ));
            }
            let n = self.stream.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                if self.available() == 0 {
                    return Ok(String::new());
                }
                return Err(ProxyError::ClientAborted);
            }
            self.end += n;
        }
    }

    /// Read exactly `n` bytes into a fresh vector.
    pub async fn read_exact_buf(&mut self, n: usize) -> Result<Vec<u8>, ProxyError> {
        let mut out = Vec::with_capacity(n.min(64 * 1024));
        while out.len() < n {
            if self.available() == 0 {
                self.start = 0;
                self.end = 0;
                let m = self.stream.read(&mut self.buf[..]).await?;
                if m == 0 {
                    return Err(ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended inside a framed body",
                    )));
                }
                self.end = m;
            }
            let take = self.available().min(n - out.len());
            out.extend_from_slice(&self.buf[self.start..self.start + take]);
            self.start += take;
        }
        Ok(out)
    }

    /// Copy exactly `n` bytes to `dst`, invoking `observe` per chunk.
    pub async fn copy_to<W, F>(
        &mut self,
        dst: &mut W,
        mut n: u64,
        observe: &mut F,
    ) -> Result<u64, ProxyError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(&[u8]),
    {
        let mut copied = 0u64;
        while n > 0 {
            if self.available() == 0 && self.fill().await? == 0 {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a framed body",
                )));
            }
            let take = (self.available() as u64).min(n) as usize;
            let chunk = &self.buf[self.start..self.start + take];
            observe(chunk);
            dst.write_all(chunk).await?;
            self.start += take;
            n -= take as u64;
            copied += take as u64;
        }
        Ok(copied)
    }

    /// Copy until EOF, invoking `observe` per chunk. Close-delimited bodies.
    pub async fn copy_until_eof<W, F>(
        &mut self,
        dst: &mut W,
        observe: &mut F,
    ) -> Result<u64, ProxyError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(&[u8]),
    {
        let mut copied = 0u64;
        loop {
            if self.available() == 0 && self.fill().await? == 0 {
                return Ok(copied);
            }
            let chunk = &self.buf[self.start..self.end];
            observe(chunk);
            dst.write_all(chunk).await?;
            copied += chunk.len() as u64;
            self.start = self.end;
        }
    }

    /// Read until EOF into a fresh vector.
    pub async fn read_to_end_buf(&mut self) -> Result<Vec<u8>, ProxyError> {
        let mut out = Vec::new();
        loop {
            if self.available() == 0 && self.fill().await? == 0 {
                return Ok(out);
            }
            out.extend_from_slice(self.buffered());
            self.start = self.end;
        }
    }

    /// Drain and return the buffered bytes.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        let out = self.buf[self.start..self.end].to_vec();
        self.start = 0;
        self.end = 0;
        out
    }

    /// Split into the inner stream and any unconsumed buffered bytes.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let leftover = self.buf[self.start..self.end].to_vec();
        (self.stream, leftover)
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for FramedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

fn find_crlf(window: &[u8]) -> Option<usize> {
    window.windows(2).position(|w| w == b"\r\n")
}

/// Replays already-buffered bytes in front of the inner stream.
///
/// Used at the decrypt boundary: the ClientHello sits in the framed buffer
/// after peeking, and the TLS acceptor must consume those exact bytes first.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

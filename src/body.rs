//! Body transfer between client and origin.
//!
//! Three framings: identity with a known length, chunked, and close-delimited
//! (HTTP/1.0 responses only). Observers see every copied data byte in order;
//! chunk framing bytes are re-emitted verbatim but not observed.

use crate::error::ProxyError;
use crate::message::BodyMode;
use crate::stream::FramedStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Stream a body from `src` to `dst` preserving the original framing.
/// Returns the number of body data bytes moved (chunk framing excluded).
pub async fn pump<S, W, F>(
    src: &mut FramedStream<S>,
    dst: &mut W,
    mode: BodyMode,
    observe: &mut F,
) -> Result<u64, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    match mode {
        BodyMode::None => Ok(0),
        BodyMode::Length(n) => src.copy_to(dst, n, observe).await,
        BodyMode::Chunked => pump_chunked(src, dst, observe).await,
        BodyMode::UntilClose => src.copy_until_eof(dst, observe).await,
    }
}

async fn pump_chunked<S, W, F>(
    src: &mut FramedStream<S>,
    dst: &mut W,
    observe: &mut F,
) -> Result<u64, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut total = 0u64;
    loop {
        let size_line = src.read_line().await?;
        let size = parse_chunk_size(&size_line)?;
        dst.write_all(size_line.as_bytes()).await?;
        dst.write_all(b"\r\n").await?;

        if size == 0 {
            // trailers up to and including the blank line
            loop {
                let trailer = src.read_line().await?;
                dst.write_all(trailer.as_bytes()).await?;
                dst.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    return Ok(total);
                }
            }
        }

        total += src.copy_to(dst, size, observe).await?;
        let terminator = src.read_line().await?;
        if !terminator.is_empty() {
            return Err(ProxyError::MalformedFraming(
                "chunk data not terminated by CRLF".into(),
            ));
        }
        dst.write_all(b"\r\n").await?;
    }
}

/// Read a body into memory per its framing. Chunked bodies are de-chunked.
pub async fn read_to_vec<S>(
    src: &mut FramedStream<S>,
    mode: BodyMode,
) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match mode {
        BodyMode::None => Ok(Vec::new()),
        BodyMode::Length(n) => src.read_exact_buf(n as usize).await,
        BodyMode::UntilClose => src.read_to_end_buf().await,
        BodyMode::Chunked => {
            let mut out = Vec::new();
            loop {
                let size_line = src.read_line().await?;
                let size = parse_chunk_size(&size_line)?;
                if size == 0 {
                    loop {
                        if src.read_line().await?.is_empty() {
                            return Ok(out);
                        }
                    }
                }
                out.extend_from_slice(&src.read_exact_buf(size as usize).await?);
                if !src.read_line().await?.is_empty() {
                    return Err(ProxyError::MalformedFraming(
                        "chunk data not terminated by CRLF".into(),
                    ));
                }
            }
        }
    }
}

/// Write `body` as a single chunk plus terminator. Used when a
/// hook-materialised response keeps its `Transfer-Encoding: chunked`.
pub async fn write_single_chunk<W: AsyncWrite + Unpin>(
    dst: &mut W,
    body: &[u8],
) -> std::io::Result<()> {
    if !body.is_empty() {
        dst.write_all(format!("{:x}\r\n", body.len()).as_bytes()).await?;
        dst.write_all(body).await?;
        dst.write_all(b"\r\n").await?;
    }
    dst.write_all(b"0\r\n\r\n").await
}

fn parse_chunk_size(line: &str) -> Result<u64, ProxyError> {
    // chunk extensions after ';' are tolerated and ignored
    let size_text = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| ProxyError::MalformedFraming(format!("invalid chunk size: {:?}", line)))
}

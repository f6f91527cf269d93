//! Raw bidirectional relay (blind splice).
//!
//! Two half-duplex pumps run concurrently. EOF on one side shuts down the
//! peer's write side; any error cancels both pumps. Observers see every
//! chunk in byte order per direction.

use crate::buffer::BufferPool;
use crate::error::ProxyError;
use crate::hooks::{Direction, HookSet};
use crate::stream::BoxedStream;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Splice two streams together until either side closes.
///
/// `client_pending` and `upstream_pending` are bytes already consumed from
/// the respective side's framed buffer; they are forwarded to the peer
/// before live pumping begins. Returns `(bytes client→upstream,
/// bytes upstream→client)`.
pub async fn splice(
    client: BoxedStream,
    client_pending: Vec<u8>,
    upstream: BoxedStream,
    upstream_pending: Vec<u8>,
    hooks: Arc<HookSet>,
    buffers: Arc<BufferPool>,
) -> Result<(u64, u64), ProxyError> {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let up = pump(
        client_read,
        upstream_write,
        client_pending,
        Direction::Sent,
        Arc::clone(&hooks),
        Arc::clone(&buffers),
    );
    let down = pump(
        upstream_read,
        client_write,
        upstream_pending,
        Direction::Received,
        hooks,
        buffers,
    );

    let (sent, received) = tokio::try_join!(up, down)?;
    debug!(sent, received, "relay completed");
    Ok((sent, received))
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    pending: Vec<u8>,
    direction: Direction,
    hooks: Arc<HookSet>,
    buffers: Arc<BufferPool>,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    if !pending.is_empty() {
        hooks.observe(direction, &pending);
        dst.write_all(&pending).await?;
        total += pending.len() as u64;
    }

    let mut lease = buffers.lease();
    loop {
        let n = src.read(&mut lease[..]).await?;
        if n == 0 {
            let _ = dst.shutdown().await;
            return Ok(total);
        }
        hooks.observe(direction, &lease[..n]);
        dst.write_all(&lease[..n]).await?;
        total += n as u64;
    }
}

//! Bidirectional byte relay (§4.7).
//!
//! Once a tunnel's handshake succeeds, the engine stops parsing and hands
//! both sockets here. Each direction is copied by its own task, and each
//! direction terminates strictly on its own EOF/error/idle-timeout — never
//! because the other direction finished. A read that returns EOF half-closes
//! the peer's write side (or fully closes it, if the underlying transport has
//! no half-close — TLS streams are such a case). An idle duplex with no bytes
//! in either direction for [`IDLE_TIMEOUT`] is torn down.

use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// §4.8: idle timeout on the full duplex, independent of the per-read
/// rolling deadline used during negotiation.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Copy `a <-> b` concurrently, returning `(bytes_a_to_b, bytes_b_to_a)`.
/// Each direction runs to its own completion; one direction finishing (a
/// normal half-close) must never cut the other direction short while it
/// still has bytes to move (§4.7).
pub async fn relay<A, B>(a: A, b: B, buffer_size: usize) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let fwd = tokio::spawn(async move { copy_half(&mut ar, &mut bw, buffer_size).await });
    let back = tokio::spawn(async move { copy_half(&mut br, &mut aw, buffer_size).await });

    let (fwd_result, back_result) = tokio::join!(fwd, back);

    let bytes_a_to_b = fwd_result.map_err(|e| Error::RelayIo(std::io::Error::other(e)))??;
    let bytes_b_to_a = back_result.map_err(|e| Error::RelayIo(std::io::Error::other(e)))??;

    debug!(
        "relay closed: a->b {} bytes, b->a {} bytes",
        bytes_a_to_b, bytes_b_to_a
    );

    Ok((bytes_a_to_b, bytes_b_to_a))
}

/// Copies `reader -> writer` on its own until EOF or [`IDLE_TIMEOUT`] of
/// silence on *this* direction — never stopped by the sibling direction
/// finishing. Flushes after every chunk so interactive protocols see low
/// latency.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let read_result = tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await;

        let n = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::RelayIo(e)),
            Err(_elapsed) => {
                let _ = writer.shutdown().await;
                return Err(Error::IdleTimeout);
            }
        };

        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await.map_err(Error::RelayIo)?;
        writer.flush().await.map_err(Error::RelayIo)?;
        total += n as u64;
    }
}

//! Full-duplex stream relay

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes both ways until either direction ends, then close both streams.
///
/// Either side reaching EOF or failing tears the pair down. No buffering
/// beyond the copy buffers, so the slower transport sets the pace.
pub async fn pipe<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        res = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = res {
                debug!("Pipe a->b ended: {}", e);
            }
        }
        res = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = res {
                debug!("Pipe b->a ended: {}", e);
            }
        }
    }

    // Either side may already be gone.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

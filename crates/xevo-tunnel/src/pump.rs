//! Full-duplex byte pump with per-direction accounting
//!
//! Copies two byte streams into each other concurrently and returns only
//! after both directions have ended. A clean EOF in one direction half
//! closes the peer's write side and lets the other direction run on; an I/O
//! error tears both directions down so neither copier blocks forever.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy buffer size per direction
const COPY_BUF: usize = 8192;

/// Marker trait for anything the pump can carry
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<bytestream>")
    }
}

/// Owned trait object for one side of a pump
pub type BoxedStream = Box<dyn ByteStream>;

/// Pump bytes between `a` and `b` in both directions.
///
/// Returns `(bytes_a_to_b, bytes_b_to_a, first_error)` once both directions
/// have terminated. Clean EOF propagates as a half close only; errors close
/// both streams.
pub async fn pump_streams<A, B>(a: A, b: B) -> (u64, u64, Option<io::Error>)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let teardown = CancellationToken::new();

    let a_to_b = copy_direction(&mut a_read, &mut b_write, teardown.clone());
    let b_to_a = copy_direction(&mut b_read, &mut a_write, teardown.clone());
    let ((sent, err_ab), (received, err_ba)) = tokio::join!(a_to_b, b_to_a);

    (sent, received, err_ab.or(err_ba))
}

/// Copy one direction to its own EOF or error.
///
/// On error the shared token is cancelled, which unblocks the sibling
/// direction; on clean EOF only the destination write side is shut down.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    teardown: CancellationToken,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    let error = loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(e),
            },
            () = teardown.cancelled() => break None,
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        total += n as u64;
    };
    if error.is_some() {
        teardown.cancel();
    }
    let _ = writer.shutdown().await;
    (total, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pump_both_directions() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump_streams(a, b));

        a_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(a_peer);
        drop(b_peer);
        let (sent, received, error) = pump.await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(received, 2);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_half_close_does_not_end_other_direction() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump_streams(a, b));

        // Close the a-side writer; the b-to-a direction must keep flowing.
        a_peer.write_all(b"done").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"done");

        // Response direction still alive after the forward EOF.
        b_peer.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(b_peer);
        let (sent, received, error) = pump.await.unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 8);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_byte_counts_match_scenario() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump_streams(a, b));

        // Echo five bytes each way, then close both ends.
        a_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_peer.read_exact(&mut buf).await.unwrap();
        b_peer.write_all(&buf).await.unwrap();
        a_peer.read_exact(&mut buf).await.unwrap();

        drop(a_peer);
        drop(b_peer);
        let (sent, received, _) = pump.await.unwrap();
        assert_eq!((sent, received), (5, 5));
    }
}

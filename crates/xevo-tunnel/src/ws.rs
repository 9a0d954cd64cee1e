//! WebSocket byte-stream adapter
//!
//! Presents a reliable ordered byte stream over a WebSocket connection so
//! the SSH layer can run on top of it. Writes become binary messages; reads
//! concatenate incoming binary frames. Control frames are handled by the
//! WebSocket layer itself and never surface here.

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Byte-stream view of a WebSocket connection
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established WebSocket connection
    #[must_use]
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

fn ws_to_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.read_buf = data.into();
                }
                Some(Ok(Message::Text(text))) => {
                    this.read_buf = text.into_bytes().into();
                }
                // Ping/pong are answered inside tungstenite.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_to_io_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(ws_to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_close(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            // Shutting down an already-closed socket is not an error here.
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_to_io_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    /// Build a connected client/server WebSocket pair over an in-memory pipe.
    async fn ws_pair() -> (
        WsStream<tokio::io::DuplexStream>,
        WsStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client =
            WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server =
            WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        (WsStream::new(client), WsStream::new(server))
    }

    #[tokio::test]
    async fn test_bytes_cross_the_adapter() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"ssh handshake bytes").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 19];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ssh handshake bytes");
    }

    #[tokio::test]
    async fn test_reads_concatenate_frames() {
        let (mut client, mut server) = ws_pair().await;

        // Three separate writes become three frames; one read may span them.
        client.write_all(b"ab").await.unwrap();
        client.write_all(b"cd").await.unwrap();
        client.write_all(b"ef").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn test_shutdown_surfaces_as_eof() {
        let (mut client, mut server) = ws_pair().await;

        // Shut down concurrently; the close handshake needs the peer to read.
        tokio::spawn(async move {
            client.write_all(b"bye").await.unwrap();
            let _ = client.shutdown().await;
        });

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }

    #[tokio::test]
    async fn test_large_transfer() {
        let (mut client, mut server) = ws_pair().await;

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        writer.await.unwrap();
    }
}

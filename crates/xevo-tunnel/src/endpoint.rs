//! Channel endpoints
//!
//! Stubs bind a local acceptor and hand out byte streams per external
//! connection; skeletons dial the local target a channel is destined for.
//! Every variant collapses to the same `BoxedStream` so the pump and the
//! relay never care which transport is underneath.

use crate::descriptor::{EndpointDescriptor, EndpointRole, EndpointType};
use crate::error::{Result, TunnelError};
use crate::pump::BoxedStream;
use crate::stats::ConnStats;
use crate::switchboard::{LoopListener, Switchboard};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// In-memory pipe capacity between a channel and the SOCKS5 server
const SOCKS_PIPE: usize = 64 * 1024;

/// Shared endpoint environment: which optional facilities this process has
#[derive(Clone)]
pub struct EndpointEnv {
    /// Loopback switchboard; `None` when the loop protocol is disabled
    pub switchboard: Option<Arc<Switchboard>>,
    /// Whether channels may be routed into the in-process SOCKS5 server
    pub socks5: bool,
    /// Connection statistics
    pub stats: Arc<ConnStats>,
}

/// Where an accepted stub connection came from, for channel-open metadata
#[derive(Debug, Clone)]
pub struct Originator {
    /// Peer host, or a placeholder for non-network stubs
    pub host: String,
    /// Peer port, zero when not applicable
    pub port: u32,
}

impl Originator {
    fn local(kind: &str) -> Self {
        Self {
            host: kind.to_string(),
            port: 0,
        }
    }
}

/// Bound stub endpoint producing accepted connections
#[derive(Debug)]
pub enum Stub {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener; unlinks the path on drop
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
    /// Loopback name registration
    Loop(LoopListener),
    /// Process stdin/stdout; yields exactly one connection
    Stdio(Option<StdioStream>),
}

impl Stub {
    /// Bind the acceptor described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns `Prohibited` for role/type combinations that cannot be a
    /// stub, `FeatureNotEnabled` when the loop switchboard is off, and a
    /// connection error when the underlying bind fails.
    pub async fn bind(descriptor: &EndpointDescriptor, env: &EndpointEnv) -> Result<Self> {
        if descriptor.role != EndpointRole::Stub {
            return Err(TunnelError::prohibited(format!(
                "cannot listen on {descriptor}: not a stub"
            )));
        }
        descriptor.validate()?;
        match descriptor.kind {
            EndpointType::Tcp => {
                let listener = TcpListener::bind(&descriptor.path).await.map_err(|e| {
                    TunnelError::connection_msg(format!("bind {}: {e}", descriptor.path))
                })?;
                tracing::debug!(addr = %descriptor.path, "stub listener bound");
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            EndpointType::Unix => {
                let path = std::path::PathBuf::from(&descriptor.path);
                let listener = tokio::net::UnixListener::bind(&path).map_err(|e| {
                    TunnelError::connection_msg(format!("bind {}: {e}", descriptor.path))
                })?;
                Ok(Self::Unix(listener, path))
            }
            #[cfg(not(unix))]
            EndpointType::Unix => Err(TunnelError::prohibited(
                "unix endpoints are not supported on this platform",
            )),
            EndpointType::Loop => {
                let board = env
                    .switchboard
                    .as_ref()
                    .ok_or_else(|| TunnelError::feature_not_enabled("Loop protocol"))?;
                Ok(Self::Loop(board.register(&descriptor.path)?))
            }
            EndpointType::Stdio => Ok(Self::Stdio(Some(StdioStream::new()))),
            EndpointType::Socks => Err(TunnelError::prohibited("socks endpoint cannot be a stub")),
        }
    }

    /// Accept the next external connection.
    ///
    /// Returns `Ok(None)` when the stub is exhausted (stdio after its single
    /// shot, loop after deregistration).
    ///
    /// # Errors
    ///
    /// Returns a connection error when the underlying accept fails.
    pub async fn accept(&mut self) -> Result<Option<(BoxedStream, Originator)>> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let originator = Originator {
                    host: peer.ip().to_string(),
                    port: u32::from(peer.port()),
                };
                Ok(Some((Box::new(stream), originator)))
            }
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Some((Box::new(stream), Originator::local("unix"))))
            }
            Self::Loop(listener) => Ok(listener
                .accept()
                .await
                .map(|stream| (Box::new(stream) as BoxedStream, Originator::local("loop")))),
            Self::Stdio(slot) => Ok(slot
                .take()
                .map(|stream| (Box::new(stream) as BoxedStream, Originator::local("stdio")))),
        }
    }

    /// The local address for logs, where the variant has one
    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }
}

#[cfg(unix)]
impl Drop for Stub {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Dial the local target described by a skeleton descriptor.
///
/// Does not return until the target is confirmed reachable, so callers can
/// refuse the remote channel open when the local side is dead instead of
/// accepting and failing afterwards.
///
/// # Errors
///
/// Returns `Prohibited` for non-skeleton descriptors and forbidden types,
/// `FeatureNotEnabled` when socks/loop are disabled, `Unreachable` when the
/// target cannot be dialed within `dial_timeout`, and `NotFound` for
/// unregistered loop names.
pub async fn dial_skeleton(
    descriptor: &EndpointDescriptor,
    env: &EndpointEnv,
    dial_timeout: Duration,
) -> Result<BoxedStream> {
    if descriptor.role != EndpointRole::Skeleton {
        return Err(TunnelError::prohibited(format!(
            "cannot dial {descriptor}: not a skeleton"
        )));
    }
    descriptor.validate()?;
    match descriptor.kind {
        EndpointType::Tcp => {
            let stream = timeout(dial_timeout, TcpStream::connect(&descriptor.path))
                .await
                .map_err(|_| {
                    TunnelError::unreachable(descriptor.to_string(), "connect timed out")
                })?
                .map_err(|e| TunnelError::unreachable(descriptor.to_string(), e.to_string()))?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        EndpointType::Unix => {
            let stream = timeout(
                dial_timeout,
                tokio::net::UnixStream::connect(&descriptor.path),
            )
            .await
            .map_err(|_| TunnelError::unreachable(descriptor.to_string(), "connect timed out"))?
            .map_err(|e| TunnelError::unreachable(descriptor.to_string(), e.to_string()))?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        EndpointType::Unix => Err(TunnelError::prohibited(
            "unix endpoints are not supported on this platform",
        )),
        EndpointType::Loop => {
            let board = env
                .switchboard
                .as_ref()
                .ok_or_else(|| TunnelError::feature_not_enabled("Loop protocol"))?;
            Ok(Box::new(board.dial(&descriptor.path).await?))
        }
        EndpointType::Socks => {
            if !env.socks5 {
                return Err(TunnelError::feature_not_enabled("SOCKS5"));
            }
            Ok(serve_socks())
        }
        EndpointType::Stdio => Err(TunnelError::prohibited(
            "stdio endpoint cannot be a skeleton",
        )),
    }
}

/// Route a stream into the in-process SOCKS5 server.
///
/// The near half of a duplex pipe is returned for the pump; the far half is
/// served by the SOCKS5 state machine on its own task.
fn serve_socks() -> BoxedStream {
    let (near, far) = tokio::io::duplex(SOCKS_PIPE);
    tokio::spawn(async move {
        let config = Arc::new(fast_socks5::server::Config::<fast_socks5::server::DenyAuthentication>::default());
        let socket = fast_socks5::server::Socks5Socket::new(far, config);
        match socket.upgrade_to_socks5().await {
            Ok(_) => tracing::debug!("socks stream finished"),
            Err(e) => tracing::debug!(error = %e, "socks stream ended"),
        }
    });
    Box::new(near)
}

/// Process stdin/stdout presented as one bidirectional stream
#[derive(Debug)]
pub struct StdioStream {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl StdioStream {
    /// Capture the process's stdin and stdout
    #[must_use]
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioStream {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdout).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EndpointRole;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn env(switchboard: bool, socks5: bool) -> EndpointEnv {
        EndpointEnv {
            switchboard: switchboard.then(|| Arc::new(Switchboard::new())),
            socks5,
            stats: Arc::new(ConnStats::new()),
        }
    }

    fn tcp(role: EndpointRole, addr: &str) -> EndpointDescriptor {
        EndpointDescriptor::tcp(role, addr)
    }

    #[tokio::test]
    async fn test_tcp_stub_accepts() {
        let env = env(false, false);
        let mut stub = Stub::bind(&tcp(EndpointRole::Stub, "127.0.0.1:0"), &env)
            .await
            .unwrap();
        let addr = stub.local_addr().unwrap();

        let mut external = TcpStream::connect(addr).await.unwrap();
        let (mut accepted, originator) = stub.accept().await.unwrap().unwrap();
        assert_eq!(originator.host, "127.0.0.1");

        external.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tcp_skeleton_dials() {
        let env = env(false, false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let descriptor = tcp(EndpointRole::Skeleton, &addr.to_string());
        let dial = dial_skeleton(&descriptor, &env, Duration::from_secs(5));
        let (accept, stream) = tokio::join!(listener.accept(), dial);
        accept.unwrap();
        stream.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_skeleton_unreachable() {
        let env = env(false, false);
        // Port 1 on localhost is assumed closed.
        let descriptor = tcp(EndpointRole::Skeleton, "127.0.0.1:1");
        let err = dial_skeleton(&descriptor, &env, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_socks_skeleton_requires_flag() {
        let env_off = env(false, false);
        let descriptor =
            EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Socks, "");
        let err = dial_skeleton(&descriptor, &env_off, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::FeatureNotEnabled { .. }));

        let env_on = env(false, true);
        assert!(dial_skeleton(&descriptor, &env_on, Duration::from_secs(5))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_loop_skeleton_requires_switchboard() {
        let env_off = env(false, false);
        let descriptor = EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Loop, "db");
        let err = dial_skeleton(&descriptor, &env_off, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::FeatureNotEnabled { .. }));
    }

    #[tokio::test]
    async fn test_loop_stub_and_skeleton_rendezvous() {
        let env = env(true, false);
        let stub_desc = EndpointDescriptor::new(EndpointRole::Stub, EndpointType::Loop, "db");
        let skel_desc = EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Loop, "db");

        let mut stub = Stub::bind(&stub_desc, &env).await.unwrap();
        let mut dialed = dial_skeleton(&skel_desc, &env, Duration::from_secs(5))
            .await
            .unwrap();
        let (mut accepted, _) = stub.accept().await.unwrap().unwrap();

        dialed.write_all(b"loop").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"loop");
    }

    #[tokio::test]
    async fn test_skeleton_dial_rejects_stub_descriptor() {
        let env = env(false, false);
        let descriptor = tcp(EndpointRole::Stub, "127.0.0.1:1");
        let err = dial_skeleton(&descriptor, &env, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Prohibited { .. }));
    }

    #[tokio::test]
    async fn test_stub_bind_rejects_socks() {
        let env = env(false, true);
        let descriptor = EndpointDescriptor {
            role: EndpointRole::Stub,
            kind: EndpointType::Socks,
            path: String::new(),
        };
        assert!(Stub::bind(&descriptor, &env).await.is_err());
    }

    #[tokio::test]
    async fn test_address_in_use_surfaces() {
        let env = env(false, false);
        let first = Stub::bind(&tcp(EndpointRole::Stub, "127.0.0.1:0"), &env)
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();
        let err = Stub::bind(&tcp(EndpointRole::Stub, &addr.to_string()), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connection { .. }));
    }
}

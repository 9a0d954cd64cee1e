//! Client-side SSH session handlers
//!
//! The handler verifies the server host key and serves reverse-direction
//! channel opens; the opener carries forward-stub connections into new
//! channels on the shared SSH handle.

use crate::descriptor::{EndpointDescriptor, EndpointRole, EndpointType};
use crate::endpoint::{dial_skeleton, EndpointEnv, Originator};
use crate::error::{Result, TunnelError};
use crate::pump::{pump_streams, BoxedStream};
use crate::relay::ChannelOpener;
use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::Channel;
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-connection client handler
pub(crate) struct ClientHandler {
    /// Pinned server fingerprint; any other key fails the handshake
    expected_fingerprint: Option<String>,
    env: EndpointEnv,
    dial_timeout: Duration,
    cancel: CancellationToken,
}

impl ClientHandler {
    pub(crate) fn new(
        expected_fingerprint: Option<String>,
        env: EndpointEnv,
        dial_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            expected_fingerprint,
            env,
            dial_timeout,
            cancel,
        }
    }

    /// Policy for reverse-direction channel opens arriving from the server
    fn authorize_channel(descriptor: &EndpointDescriptor) -> Result<()> {
        if descriptor.role != EndpointRole::Skeleton {
            return Err(TunnelError::prohibited("role must be skeleton"));
        }
        descriptor.validate()?;
        if descriptor.kind == EndpointType::Stdio {
            return Err(TunnelError::prohibited("stdio skeleton not supported"));
        }
        Ok(())
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected_fingerprint {
            Some(expected) if expected != &fingerprint => {
                tracing::warn!(
                    got = %fingerprint,
                    expected = %expected,
                    "server host key fingerprint mismatch"
                );
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                tracing::info!(%fingerprint, "server fingerprint");
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        mut channel: Channel<Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let descriptor: EndpointDescriptor = match serde_json::from_str(connected_address) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                tracing::debug!("unknown-channel-type: bad JSON endpoint descriptor");
                tokio::spawn(async move {
                    let _ = channel.close().await;
                });
                return Ok(());
            }
        };
        tracing::debug!(endpoint = %descriptor, "reverse channel open");

        if let Err(e) = Self::authorize_channel(&descriptor) {
            tracing::info!(endpoint = %descriptor, reason = %e, "reverse channel rejected");
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Ok(());
        }

        let env = self.env.clone();
        let dial_timeout = self.dial_timeout;
        let cancel = self.cancel.child_token();
        let originator = format!("{originator_address}:{originator_port}");
        tokio::spawn(async move {
            // The SSH layer has already confirmed this channel, so a failed
            // local dial closes it instead of rejecting the open.
            let local = match dial_skeleton(&descriptor, &env, dial_timeout).await {
                Ok(local) => local,
                Err(e) => {
                    tracing::info!(endpoint = %descriptor, reason = %e, "connect-failed");
                    let _ = channel.close().await;
                    return;
                }
            };
            let stats = Arc::clone(&env.stats);
            let conn = stats.open();
            let channel_stream: BoxedStream = Box::new(channel.into_stream());
            tokio::select! {
                (sent, received, error) = pump_streams(channel_stream, local) => {
                    match error {
                        Some(e) => tracing::debug!(
                            conn, sent, received, error = %e,
                            "reverse channel ended with error"
                        ),
                        None => tracing::debug!(
                            conn, sent, received, peer = %originator,
                            "reverse channel closed"
                        ),
                    }
                }
                () = cancel.cancelled() => {
                    tracing::debug!(conn, "reverse channel aborted by teardown");
                }
            }
            stats.close();
        });
        Ok(())
    }
}

/// Opens forward channels over the shared client handle
pub(crate) struct ClientChannelOpener {
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
}

impl ClientChannelOpener {
    pub(crate) fn new(handle: Arc<Mutex<client::Handle<ClientHandler>>>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ChannelOpener for ClientChannelOpener {
    async fn open_channel(
        &self,
        skeleton: &EndpointDescriptor,
        originator: &Originator,
    ) -> Result<BoxedStream> {
        let payload = serde_json::to_string(skeleton)
            .map_err(|e| TunnelError::protocol(format!("descriptor encode: {e}")))?;
        let channel = {
            let mut handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(payload, 0, originator.host.clone(), originator.port)
                .await
        }
        .map_err(|e| TunnelError::connection_msg(format!("channel open rejected: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }
}

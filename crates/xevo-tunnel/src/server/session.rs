//! Server-side SSH session core
//!
//! Drives one upgraded transport from handshake to teardown: password
//! authentication, the single configuration request, reverse stub bring-up,
//! and inbound channel opens. Errors local to one channel reject that
//! channel only; errors on the control stream end the session and everything
//! multiplexed over it.

use crate::auth::User;
use crate::codec::{self, SessionConfigRequest};
use crate::descriptor::{EndpointDescriptor, EndpointRole, EndpointType};
use crate::endpoint::{dial_skeleton, Originator};
use crate::error::{Result, TunnelError};
use crate::pump::{pump_streams, BoxedStream};
use crate::relay::{spawn_stub, ChannelOpener};
use crate::server::{Server, CONFIG_TIMEOUT};
use crate::ws::WsStream;
use crate::BUILD_VERSION;
use async_trait::async_trait;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, MethodSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Run one tunnel session over a freshly upgraded connection
pub(crate) async fn run_session(
    server: Arc<Server>,
    upgraded: TokioIo<Upgraded>,
    peer: SocketAddr,
) {
    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let transport = WsStream::new(ws);

    let id = server.stats().next_session();
    let cancel = server.cancel_token().child_token();
    tracing::debug!(session = id, %peer, "ssh handshake");

    let handler = SessionHandler::new(Arc::clone(&server), peer, id, cancel.clone());
    let mut session = match russh::server::run_stream(server.ssh_config(), transport, handler).await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(session = id, %peer, error = %e, "handshake failed");
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        result = &mut session => {
            match result {
                Ok(()) => tracing::debug!(session = id, "session closed"),
                Err(e) => tracing::debug!(session = id, error = %e, "session ended"),
            }
        }
        () = cancel.cancelled() => {
            let _ = session
                .handle()
                .disconnect(Disconnect::ByApplication, "server shutting down".into(), "".into())
                .await;
            tracing::debug!(session = id, "session cancelled");
        }
    }

    // Everything keyed to this session dies with it: reverse stubs, pumps,
    // and the config watchdog.
    cancel.cancel();
}

/// Per-connection handler carrying the handshake-to-config state
pub(crate) struct SessionHandler {
    server: Arc<Server>,
    peer: SocketAddr,
    id: u64,
    cancel: CancellationToken,
    /// User attached by the password callback, consumed by the config step
    user: Option<Arc<User>>,
    /// Set once the configuration request has been acknowledged
    configured: Arc<AtomicBool>,
    /// Channel the config subsystem request arrived on
    config_channel: Option<ChannelId>,
    /// Accumulated config frame bytes
    config_buf: Vec<u8>,
}

impl SessionHandler {
    pub(crate) fn new(
        server: Arc<Server>,
        peer: SocketAddr,
        id: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            server,
            peer,
            id,
            cancel,
            user: None,
            configured: Arc::new(AtomicBool::new(false)),
            config_channel: None,
            config_buf: Vec::new(),
        }
    }

    /// Reply failure on the config channel and schedule session teardown
    fn fail_config(&self, channel: ChannelId, session: &mut Session, message: &str) {
        tracing::info!(session = self.id, %message, "config rejected");
        let mut reply = vec![1u8];
        reply.extend_from_slice(message.as_bytes());
        session.data(channel, CryptoVec::from_slice(&reply));

        let mut handle = session.handle();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "configuration rejected".into(), "".into())
                .await;
            cancel.cancel();
        });
    }

    /// Validate, authorize and apply one decoded configuration request
    async fn process_config(
        &mut self,
        channel: ChannelId,
        config: SessionConfigRequest,
        session: &mut Session,
    ) {
        if config.version != BUILD_VERSION {
            let version = if config.version.is_empty() {
                "<unknown>"
            } else {
                config.version.as_str()
            };
            tracing::info!(
                session = self.id,
                client = version,
                server = BUILD_VERSION,
                "client version differs from server version"
            );
        }

        for chd in &config.channels {
            if let Err(e) = chd.validate() {
                self.fail_config(channel, session, &format!("invalid route '{chd}': {e}"));
                return;
            }
            if chd.reverse && !self.server.options().reverse {
                self.fail_config(
                    channel,
                    session,
                    "Reverse port forwarding not enabled on server",
                );
                return;
            }
            if chd.reverse && chd.stub.kind == EndpointType::Stdio {
                self.fail_config(channel, session, "stdio stub not supported on server");
                return;
            }
            if let Some(user) = &self.user {
                let route = chd.to_string();
                if !user.has_access(&route) {
                    self.fail_config(channel, session, &format!("access to '{route}' denied"));
                    return;
                }
            }
        }

        // Bring up reverse stubs keyed to this live connection. Any bind
        // failure fails the whole config before it is acknowledged.
        let env = self.server.endpoint_env();
        let opener: Arc<dyn ChannelOpener> = Arc::new(ServerChannelOpener {
            handle: session.handle(),
        });
        for (index, chd) in config.channels.iter().enumerate() {
            if chd.reverse {
                tracing::debug!(session = self.id, route = index, spec = %chd, "reverse route");
                if let Err(e) = spawn_stub(
                    index,
                    chd.clone(),
                    &env,
                    Arc::clone(&opener),
                    self.cancel.child_token(),
                )
                .await
                {
                    self.fail_config(
                        channel,
                        session,
                        &format!("unable to start stub listener {chd}: {e}"),
                    );
                    return;
                }
            } else {
                tracing::debug!(
                    session = self.id,
                    route = index,
                    spec = %chd,
                    "forward route; channels open on demand"
                );
            }
        }

        self.configured.store(true, Ordering::SeqCst);
        session.data(channel, CryptoVec::from_slice(&[0u8]));
        tracing::info!(session = self.id, peer = %self.peer, routes = config.channels.len(), "session configured");
    }

    /// Check one inbound channel-open descriptor against policy.
    ///
    /// The error message names the rejection class without internal detail.
    fn authorize_channel(&self, descriptor: &EndpointDescriptor) -> Result<()> {
        if descriptor.role != EndpointRole::Skeleton {
            return Err(TunnelError::prohibited("role must be skeleton"));
        }
        descriptor.validate()?;
        match descriptor.kind {
            EndpointType::Stdio => Err(TunnelError::prohibited(
                "server-side stdio not supported",
            )),
            EndpointType::Socks if !self.server.options().socks5 => {
                Err(TunnelError::feature_not_enabled("SOCKS5"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> std::result::Result<Auth, Self::Error> {
        if self.server.users().is_empty() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            })
        }
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        // No configured users means authentication is disabled.
        if self.server.users().is_empty() {
            return Ok(Auth::Accept);
        }
        match self.server.users().get(user) {
            Some(known) if known.verify_password(password) => {
                tracing::debug!(session = self.id, user = %user, "password accepted");
                self.user = Some(known);
                Ok(Auth::Accept)
            }
            _ => {
                tracing::debug!(session = self.id, user = %user, "login failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_succeeded(
        &mut self,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        // The configuration request must arrive promptly or the session dies.
        let configured = Arc::clone(&self.configured);
        let mut handle = session.handle();
        let cancel = self.cancel.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(CONFIG_TIMEOUT) => {
                    if !configured.load(Ordering::SeqCst) {
                        tracing::info!(session = id, "no config request within timeout");
                        let _ = handle
                            .disconnect(
                                Disconnect::ByApplication,
                                "config request timed out".into(),
                                "".into(),
                            )
                            .await;
                        cancel.cancel();
                    }
                }
                () = cancel.cancelled() => {}
            }
        });
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // Control requests ride session channels; data is routed through the
        // handler callbacks below.
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let configured = self.configured.load(Ordering::SeqCst);
        match name {
            "config" if self.config_channel.is_none() && !configured => {
                self.config_channel = Some(channel);
                session.channel_success(channel);
            }
            "ping" if configured => {
                session.channel_success(channel);
            }
            other => {
                tracing::debug!(session = self.id, request = %other, "unexpected control request");
                session.channel_failure(channel);
                // Before configuration the first request must be the config;
                // anything else ends the session.
                if !configured {
                    let mut handle = session.handle();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let _ = handle
                            .disconnect(
                                Disconnect::ByApplication,
                                "expecting config request".into(),
                                "".into(),
                            )
                            .await;
                        cancel.cancel();
                    });
                }
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.config_channel != Some(channel) || self.configured.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.config_buf.extend_from_slice(data);
        match codec::try_deframe(&self.config_buf) {
            Ok(None) => {}
            Ok(Some((start, end))) => {
                let decoded = SessionConfigRequest::decode(&self.config_buf[start..end]);
                match decoded {
                    Ok(config) => self.process_config(channel, config, session).await,
                    Err(e) => {
                        self.fail_config(channel, session, &format!("invalid config: {e}"));
                    }
                }
                self.config_buf.clear();
            }
            Err(e) => {
                self.fail_config(channel, session, &format!("invalid config: {e}"));
            }
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        _port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        if !self.configured.load(Ordering::SeqCst) {
            tracing::debug!(session = self.id, "channel open before configuration");
            return Ok(false);
        }
        let descriptor: EndpointDescriptor = match serde_json::from_str(host_to_connect) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                tracing::debug!(
                    session = self.id,
                    "unknown-channel-type: bad JSON endpoint descriptor"
                );
                return Ok(false);
            }
        };
        tracing::debug!(session = self.id, endpoint = %descriptor, "channel open request");

        if let Err(e) = self.authorize_channel(&descriptor) {
            tracing::info!(session = self.id, endpoint = %descriptor, reason = %e, "channel rejected");
            return Ok(false);
        }

        // The local target must be reachable before the open is accepted, so
        // the peer never sees an accepted channel die on a failed dial.
        let env = self.server.endpoint_env();
        let local = match dial_skeleton(&descriptor, &env, self.server.options().dial_timeout).await
        {
            Ok(local) => local,
            Err(e) => {
                tracing::info!(
                    session = self.id,
                    endpoint = %descriptor,
                    reason = %e,
                    "connect-failed: channel rejected"
                );
                return Ok(false);
            }
        };

        let id = self.id;
        let stats = Arc::clone(self.server.stats());
        let conn = stats.open();
        let cancel = self.cancel.child_token();
        let originator = format!("{originator_address}:{originator_port}");
        tokio::spawn(async move {
            let channel_stream: BoxedStream = Box::new(channel.into_stream());
            tokio::select! {
                (sent, received, error) = pump_streams(channel_stream, local) => {
                    match error {
                        Some(e) => tracing::debug!(
                            session = id, conn, sent, received, error = %e,
                            "channel ended with error"
                        ),
                        None => tracing::debug!(
                            session = id, conn, sent, received, peer = %originator,
                            "channel closed"
                        ),
                    }
                }
                () = cancel.cancelled() => {
                    tracing::debug!(session = id, conn, "channel aborted by session teardown");
                }
            }
            stats.close();
        });
        Ok(true)
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // The handler dying means the session is gone; reap its children.
        self.cancel.cancel();
    }
}

/// Opens reverse channels to the client over the live server handle
struct ServerChannelOpener {
    handle: russh::server::Handle,
}

#[async_trait]
impl ChannelOpener for ServerChannelOpener {
    async fn open_channel(
        &self,
        skeleton: &EndpointDescriptor,
        originator: &Originator,
    ) -> Result<BoxedStream> {
        let payload = serde_json::to_string(skeleton)
            .map_err(|e| TunnelError::protocol(format!("descriptor encode: {e}")))?;
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(payload, 0, originator.host.clone(), originator.port)
            .await
            .map_err(|e| TunnelError::connection_msg(format!("channel open: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }
}

//! Tunnel client
//!
//! Dials the server's HTTP endpoint, upgrades to the tunnel subprotocol,
//! runs the SSH client handshake, sends the configuration request, and then
//! serves its side of every route: forward stubs open channels on demand,
//! reverse channel opens from the server dial local targets.

mod session;

use crate::auth::parse_auth;
use crate::codec::{self, SessionConfigRequest};
use crate::config::ClientOptions;
use crate::endpoint::EndpointEnv;
use crate::error::{Result, TunnelError};
use crate::relay::{spawn_stub, ChannelOpener};
use crate::stats::ConnStats;
use crate::switchboard::Switchboard;
use crate::ws::WsStream;
use crate::{BUILD_VERSION, PROTOCOL_VERSION};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

use session::{ClientChannelOpener, ClientHandler};

/// How long the client waits for the configuration acknowledgement
const CONFIG_REPLY_TIMEOUT: Duration = Duration::from_secs(15);
/// How long one ping may go unanswered before the session is declared dead
const PING_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A tunnel client for one server and one set of routes
pub struct Client {
    opts: ClientOptions,
    switchboard: Arc<Switchboard>,
    stats: Arc<ConnStats>,
    cancel: CancellationToken,
}

impl Client {
    /// Build a client from options.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the options do not validate.
    pub fn new(opts: ClientOptions) -> Result<Self> {
        opts.validate().map_err(TunnelError::config)?;
        Ok(Self {
            opts,
            switchboard: Arc::new(Switchboard::new()),
            stats: Arc::new(ConnStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Request shutdown; the live session and all stubs are torn down
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Connection statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<ConnStats> {
        &self.stats
    }

    /// Connect, configure, and serve routes until the session ends.
    ///
    /// Returns `Ok(())` only after a requested shutdown; a lost transport or
    /// a rejected configuration is an error.
    ///
    /// # Errors
    ///
    /// Returns `Auth` when credentials or the pinned fingerprint are
    /// rejected, `Config`/`Denied` when the server refuses the route list,
    /// and `TransportLost` when the control connection dies.
    pub async fn run(&self) -> Result<()> {
        let session_cancel = self.cancel.child_token();
        let result = self.run_session(&session_cancel).await;
        // Everything spawned for this session dies with it.
        session_cancel.cancel();
        result
    }

    async fn run_session(&self, cancel: &CancellationToken) -> Result<()> {
        let url = self.opts.websocket_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::config(format!("invalid server URL '{url}': {e}")))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL_VERSION));

        tracing::info!(server = %url, "connecting");
        let (ws, response) = connect_async(request).await.map_err(map_ws_error)?;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if negotiated != Some(PROTOCOL_VERSION) {
            return Err(TunnelError::protocol(format!(
                "server did not accept protocol {PROTOCOL_VERSION}"
            )));
        }

        let transport = WsStream::new(ws);
        let env = EndpointEnv {
            switchboard: Some(Arc::clone(&self.switchboard)),
            socks5: true,
            stats: Arc::clone(&self.stats),
        };
        let handler = ClientHandler::new(
            self.opts.fingerprint.clone(),
            env.clone(),
            self.opts.dial_timeout,
            cancel.clone(),
        );

        let ssh_config = Arc::new(russh::client::Config::default());

        tracing::debug!("ssh handshake");
        let mut handle = russh::client::connect_stream(ssh_config, transport, handler)
            .await
            .map_err(|e| TunnelError::auth(format!("handshake failed: {e}")))?;

        let (user, pass) = match &self.opts.auth {
            Some(auth) => parse_auth(auth),
            None => (String::new(), String::new()),
        };
        let authed = handle
            .authenticate_password(user, pass)
            .await
            .map_err(|e| TunnelError::auth(format!("authentication failed: {e}")))?;
        if !authed {
            return Err(TunnelError::auth("authentication rejected by server"));
        }

        self.send_config(&mut handle).await?;
        tracing::info!("connected");

        // Forward stubs; a failed bind is a startup error, not a soft one.
        let handle = Arc::new(Mutex::new(handle));
        let opener: Arc<dyn ChannelOpener> =
            Arc::new(ClientChannelOpener::new(Arc::clone(&handle)));
        for (index, chd) in self.opts.routes.iter().enumerate() {
            if chd.reverse {
                tracing::debug!(route = index, spec = %chd, "reverse route; served by the peer");
                continue;
            }
            spawn_stub(
                index,
                chd.clone(),
                &env,
                Arc::clone(&opener),
                cancel.child_token(),
            )
            .await?;
        }

        // Hold the session open, probing liveness with ping control requests,
        // until the transport dies or we are shut down.
        let result = tokio::select! {
            () = cancel.cancelled() => Ok(()),
            err = ping_loop(Arc::clone(&handle), self.opts.keepalive) => Err(err),
        };
        if result.is_ok() {
            let _ = handle
                .lock()
                .await
                .disconnect(Disconnect::ByApplication, "client shutting down".into(), "".into())
                .await;
        }
        result
    }

    /// Send the configuration request and wait for the acknowledgement
    async fn send_config(
        &self,
        handle: &mut russh::client::Handle<ClientHandler>,
    ) -> Result<()> {
        let config = SessionConfigRequest {
            version: BUILD_VERSION.to_string(),
            channels: self.opts.routes.clone(),
        };
        let payload = codec::frame(&config.encode());

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::transport_lost(format!("config channel: {e}")))?;
        channel
            .request_subsystem(true, "config")
            .await
            .map_err(|e| TunnelError::transport_lost(format!("config request: {e}")))?;

        let exchange = async {
            let mut sent = false;
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Success) if !sent => {
                        channel
                            .data(&payload[..])
                            .await
                            .map_err(|e| TunnelError::transport_lost(format!("config send: {e}")))?;
                        sent = true;
                    }
                    Some(ChannelMsg::Failure) => {
                        return Err(TunnelError::config("server refused config request"));
                    }
                    Some(ChannelMsg::Data { data }) => return parse_config_reply(&data),
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                        return Err(TunnelError::transport_lost(
                            "connection closed during configuration",
                        ));
                    }
                    Some(_) => {}
                }
            }
        };
        tokio::time::timeout(CONFIG_REPLY_TIMEOUT, exchange)
            .await
            .map_err(|_| TunnelError::Timeout)?
    }
}

/// Send `ping` control requests forever; resolves with the first failure
async fn ping_loop(
    handle: Arc<Mutex<russh::client::Handle<ClientHandler>>>,
    keepalive: Duration,
) -> TunnelError {
    let mut interval = tokio::time::interval(keepalive);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = ping(&handle).await {
            tracing::debug!(error = %e, "ping failed");
            return e;
        }
        tracing::trace!("ping answered");
    }
}

/// One liveness probe: a `ping` control request that must be answered
async fn ping(handle: &Arc<Mutex<russh::client::Handle<ClientHandler>>>) -> Result<()> {
    let mut channel = {
        let mut handle = handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::transport_lost(format!("ping channel: {e}")))?
    };
    channel
        .request_subsystem(true, "ping")
        .await
        .map_err(|e| TunnelError::transport_lost(format!("ping send: {e}")))?;
    let reply = async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(TunnelError::protocol("ping refused by server"));
                }
                Some(_) => {}
                None => return Err(TunnelError::transport_lost("connection closed")),
            }
        }
    };
    tokio::time::timeout(PING_REPLY_TIMEOUT, reply)
        .await
        .map_err(|_| TunnelError::Timeout)??;
    let _ = channel.close().await;
    Ok(())
}

/// Decode the single-byte-status configuration reply
fn parse_config_reply(data: &[u8]) -> Result<()> {
    match data.split_first() {
        Some((0, _)) => Ok(()),
        Some((_, detail)) => Err(TunnelError::config(
            String::from_utf8_lossy(detail).into_owned(),
        )),
        None => Err(TunnelError::protocol("empty config reply")),
    }
}

fn map_ws_error(err: WsError) -> TunnelError {
    match err {
        WsError::Http(response) => TunnelError::connection_msg(format!(
            "server rejected connection: HTTP {}",
            response.status()
        )),
        WsError::Io(e) => TunnelError::Connection { source: e },
        other => TunnelError::connection_msg(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_reply() {
        assert!(parse_config_reply(&[0]).is_ok());
        assert!(parse_config_reply(&[0, b'x']).is_ok());

        let err = parse_config_reply(b"\x01Reverse port forwarding not enabled on server")
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Reverse port forwarding not enabled on server"));

        assert!(parse_config_reply(&[]).is_err());
    }
}

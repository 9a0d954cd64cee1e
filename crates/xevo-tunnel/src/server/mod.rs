//! Tunnel server
//!
//! Listens on one HTTP port. Requests carrying the expected WebSocket
//! subprotocol are upgraded and driven through the SSH session core; every
//! other request falls through to the configured reverse proxy or to the
//! built-in health and version endpoints.

mod http;
mod session;

use crate::auth::{parse_auth, User, UserIndex};
use crate::config::ServerOptions;
use crate::endpoint::EndpointEnv;
use crate::error::{Result, TunnelError};
use crate::stats::ConnStats;
use crate::switchboard::Switchboard;
use crate::BUILD_VERSION;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How long a session may take to present its configuration request
pub(crate) const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// Reverse proxy client type for non-tunnel requests
type ProxyClient = Client<HttpConnector, Incoming>;

/// A running tunnel server
pub struct Server {
    opts: ServerOptions,
    users: Arc<UserIndex>,
    switchboard: Option<Arc<Switchboard>>,
    stats: Arc<ConnStats>,
    ssh_config: Arc<russh::server::Config>,
    fingerprint: String,
    proxy: Option<(http::ProxyTarget, ProxyClient)>,
    cancel: CancellationToken,
}

impl Server {
    /// Build a server from options.
    ///
    /// Loads the user database, derives the host key from the configured
    /// seed, and prepares the optional SOCKS5, loopback and reverse proxy
    /// facilities.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid options, unreadable
    /// credential files, or malformed proxy URLs; these abort startup.
    pub fn new(opts: ServerOptions) -> Result<Self> {
        opts.validate().map_err(TunnelError::config)?;

        let users = Arc::new(UserIndex::new());
        if let Some(path) = &opts.auth_file {
            users.load_file(path)?;
        }
        if let Some(auth) = &opts.auth {
            let (name, pass) = parse_auth(auth);
            users.add(User::allow_all(name, pass)?);
        }

        let key = host_key(&opts.key_seed);
        let fingerprint = key
            .clone_public_key()
            .map_err(|e| TunnelError::config(format!("host key error: {e}")))?
            .fingerprint();

        let ssh_config = Arc::new(russh::server::Config {
            methods: MethodSet::NONE | MethodSet::PASSWORD,
            keys: vec![key],
            auth_rejection_time: Duration::from_secs(1),
            ..Default::default()
        });

        let proxy = match &opts.proxy {
            Some(url) => {
                let target = http::ProxyTarget::parse(url)?;
                let client = Client::builder(TokioExecutor::new()).build_http();
                tracing::info!(proxy = %url, "reverse proxy enabled");
                Some((target, client))
            }
            None => None,
        };

        let switchboard = if opts.no_loop {
            tracing::info!("loop server disabled");
            None
        } else {
            Some(Arc::new(Switchboard::new()))
        };
        if opts.socks5 {
            tracing::info!("SOCKS5 server enabled");
        }
        if opts.reverse {
            tracing::info!("reverse tunnelling enabled");
        }
        if !users.is_empty() {
            tracing::info!(users = users.len(), "user authentication enabled");
        }
        tracing::info!(fingerprint = %fingerprint, "host key ready");

        Ok(Self {
            opts,
            users,
            switchboard,
            stats: Arc::new(ConnStats::new()),
            ssh_config,
            fingerprint,
            proxy,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the HTTP listener and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns a connection error when the listen address cannot be bound.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.opts.host, self.opts.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::connection_msg(format!("listen on {addr}: {e}")))?;
        tracing::info!(addr = %listener.local_addr()?, version = BUILD_VERSION, "listening");
        self.serve(listener).await
    }

    /// Serve an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the accept loop fails fatally.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(self);
                    tokio::spawn(http::serve_connection(server, stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Request shutdown: every session, stub and pump is cancelled
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The host key fingerprint clients may pin
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Connection statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<ConnStats> {
        &self.stats
    }

    /// Add a user with an explicit allow-list at runtime
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a pattern does not compile.
    pub fn add_user(&self, name: &str, pass: &str, patterns: &[&str]) -> Result<()> {
        self.users.add(User::new(name, pass, patterns)?);
        Ok(())
    }

    /// Remove a user at runtime
    pub fn delete_user(&self, name: &str) {
        self.users.remove(name);
    }

    pub(crate) fn endpoint_env(&self) -> EndpointEnv {
        EndpointEnv {
            switchboard: self.switchboard.clone(),
            socks5: self.opts.socks5,
            stats: Arc::clone(&self.stats),
        }
    }

    pub(crate) fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub(crate) fn users(&self) -> &Arc<UserIndex> {
        &self.users
    }

    pub(crate) fn ssh_config(&self) -> Arc<russh::server::Config> {
        Arc::clone(&self.ssh_config)
    }

    pub(crate) fn proxy(&self) -> Option<&(http::ProxyTarget, ProxyClient)> {
        self.proxy.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn spawn_session(
        self: &Arc<Self>,
        upgraded: hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>,
        peer: SocketAddr,
    ) {
        let server = Arc::clone(self);
        tokio::spawn(session::run_session(server, upgraded, peer));
    }
}

/// Derive the SSH host key from a seed string.
///
/// The same seed always yields the same Ed25519 key, giving clients a stable
/// fingerprint to pin. An empty seed produces a fresh random key.
fn host_key(seed: &str) -> KeyPair {
    let mut rng = if seed.is_empty() {
        ChaCha20Rng::from_entropy()
    } else {
        let digest = Sha256::digest(seed.as_bytes());
        ChaCha20Rng::from_seed(digest.into())
    };
    let secret: [u8; 32] = rng.gen();
    KeyPair::Ed25519(ed25519_dalek::SigningKey::from_bytes(&secret))
}

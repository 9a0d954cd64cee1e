//! Configuration types for the tunnel server and client

use crate::descriptor::ChannelDescriptor;
use std::path::PathBuf;
use std::time::Duration;

/// Default bind host for the server
fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_keepalive() -> Duration {
    Duration::from_secs(25)
}

const fn default_dial_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Server-side options, normally populated from CLI flags
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bind host for the HTTP listener
    pub host: String,
    /// Bind port for the HTTP listener
    pub port: u16,
    /// Seed for the deterministic host key; empty means a random key
    pub key_seed: String,
    /// Inline `user:pass` credential granting access to every route
    pub auth: Option<String>,
    /// Credentials file, one `name:pass:regex[,regex]` per line
    pub auth_file: Option<PathBuf>,
    /// Reverse proxy target for non-tunnel HTTP requests
    pub proxy: Option<String>,
    /// Allow channels into the in-process SOCKS5 server
    pub socks5: bool,
    /// Allow reverse tunnel routes
    pub reverse: bool,
    /// Disable the loopback switchboard
    pub no_loop: bool,
    /// Peer-side dial timeout for skeleton targets
    pub dial_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            key_seed: String::new(),
            auth: None,
            auth_file: None,
            proxy: None,
            socks5: false,
            reverse: false,
            no_loop: false,
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl ServerOptions {
    /// Create options with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns an error string if the proxy URL is malformed or the inline
    /// auth flag is not `user:pass`.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if let Some(proxy) = &self.proxy {
            let uri: http::Uri = proxy
                .parse()
                .map_err(|e| format!("invalid proxy URL '{proxy}': {e}"))?;
            if uri.authority().is_none() {
                return Err(format!("proxy URL '{proxy}' is missing a host"));
            }
            match uri.scheme_str() {
                Some("http") => {}
                Some(other) => return Err(format!("proxy scheme '{other}' is not supported")),
                None => return Err(format!("proxy URL '{proxy}' is missing a scheme")),
            }
        }
        if let Some(auth) = &self.auth {
            if auth.split_once(':').map_or(true, |(user, _)| user.is_empty()) {
                return Err("auth must be user:pass".to_string());
            }
        }
        Ok(())
    }
}

/// Client-side options, normally populated from CLI flags
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server URL, `http(s)://` or `ws(s)://`
    pub server: String,
    /// Optional `user:pass` credentials
    pub auth: Option<String>,
    /// Pinned server host key fingerprint; connection fails on mismatch
    pub fingerprint: Option<String>,
    /// Interval between `ping` control requests probing session liveness
    pub keepalive: Duration,
    /// Local dial timeout for reverse-route skeleton targets
    pub dial_timeout: Duration,
    /// The routes to request, in order
    pub routes: Vec<ChannelDescriptor>,
}

impl ClientOptions {
    /// Create options for the given server with no routes yet
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            auth: None,
            fingerprint: None,
            keepalive: default_keepalive(),
            dial_timeout: default_dial_timeout(),
            routes: Vec::new(),
        }
    }

    /// Append a route
    #[must_use]
    pub fn with_route(mut self, route: ChannelDescriptor) -> Self {
        self.routes.push(route);
        self
    }

    /// Set credentials
    #[must_use]
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns an error string if the server URL scheme is unsupported, no
    /// routes are configured, or any route is self-inconsistent.
    pub fn validate(&self) -> Result<(), String> {
        const SCHEMES: [&str; 4] = ["http://", "https://", "ws://", "wss://"];
        if !SCHEMES.iter().any(|s| self.server.starts_with(s)) {
            return Err(format!(
                "server URL '{}' must start with http(s):// or ws(s)://",
                self.server
            ));
        }
        if self.routes.is_empty() {
            return Err("at least one route is required".to_string());
        }
        for (i, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .map_err(|e| format!("routes[{i}]: {e}"))?;
        }
        Ok(())
    }

    /// The server URL with an `ws(s)://` scheme as the WebSocket dial target
    #[must_use]
    pub fn websocket_url(&self) -> String {
        if let Some(rest) = self.server.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = self.server.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            self.server.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_route;

    #[test]
    fn test_server_defaults() {
        let opts = ServerOptions::default();
        assert_eq!(opts.host, "0.0.0.0");
        assert_eq!(opts.port, 8080);
        assert!(!opts.reverse);
        assert!(!opts.socks5);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_server_proxy_validation() {
        let mut opts = ServerOptions::default();
        opts.proxy = Some("http://upstream:3000".to_string());
        assert!(opts.validate().is_ok());

        opts.proxy = Some("not a url".to_string());
        assert!(opts.validate().is_err());

        opts.proxy = Some("ftp://upstream".to_string());
        assert!(opts.validate().is_err());

        opts.proxy = Some("/just/a/path".to_string());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_server_auth_validation() {
        let mut opts = ServerOptions::default();
        opts.auth = Some("alice:secret".to_string());
        assert!(opts.validate().is_ok());

        opts.auth = Some("nopassword".to_string());
        assert!(opts.validate().is_err());

        opts.auth = Some(":pass".to_string());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_client_validation() {
        let opts = ClientOptions::new("http://localhost:8080")
            .with_route(parse_route("3000:127.0.0.1:80").unwrap());
        assert!(opts.validate().is_ok());

        let opts = ClientOptions::new("gopher://localhost")
            .with_route(parse_route("3000").unwrap());
        assert!(opts.validate().is_err());

        let opts = ClientOptions::new("http://localhost:8080");
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_websocket_url() {
        let opts = ClientOptions::new("http://example.com:8080");
        assert_eq!(opts.websocket_url(), "ws://example.com:8080");

        let opts = ClientOptions::new("https://example.com");
        assert_eq!(opts.websocket_url(), "wss://example.com");

        let opts = ClientOptions::new("wss://example.com/path");
        assert_eq!(opts.websocket_url(), "wss://example.com/path");
    }
}

//! CLI argument definitions for the `chisel` entry point.
//!
//! `chisel server` runs the tunnel server on one HTTP port; `chisel client`
//! connects to a server and requests one or more routes. Route grammar and
//! flag semantics are documented on the subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tunnel arbitrary TCP streams over one WebSocket connection
#[derive(Parser)]
#[command(name = "chisel", version, about = "TCP tunnel over WebSocket + SSH")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short = 'v', long = "debug", global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the tunnel server
    Server {
        /// Bind host for the HTTP listener
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port for the HTTP listener
        #[arg(long, short, default_value_t = 8080)]
        port: u16,

        /// Seed for the host key; the same seed gives a stable fingerprint
        #[arg(long, default_value = "")]
        key: String,

        /// Credentials file, one name:pass:regex[,regex...] per line
        #[arg(long)]
        authfile: Option<PathBuf>,

        /// Inline user:pass credential allowed to reach every route
        #[arg(long)]
        auth: Option<String>,

        /// Forward non-tunnel requests to this HTTP URL
        #[arg(long)]
        proxy: Option<String>,

        /// Allow channels into the in-process SOCKS5 server
        #[arg(long)]
        socks5: bool,

        /// Allow clients to request reverse routes
        #[arg(long)]
        reverse: bool,

        /// Disable the in-process loopback switchboard
        #[arg(long = "no-loop")]
        no_loop: bool,
    },

    /// Connect to a tunnel server and request routes
    Client {
        /// Credentials as user:pass
        #[arg(long)]
        auth: Option<String>,

        /// Pinned server host key fingerprint; mismatches abort
        #[arg(long)]
        fingerprint: Option<String>,

        /// Keepalive probe interval in seconds
        #[arg(long, default_value_t = 25)]
        keepalive: u64,

        /// Server URL, e.g. http://tunnel.example.com:8080
        server: String,

        /// Routes: [R:][local-bind:]local-port:remote-host:remote-port,
        /// with socks, stdio, loop:<name> or unix:<path> in place of
        /// host:port on either side
        #[arg(required = true)]
        routes: Vec<String>,
    },
}

//! xevo-tunnel - multiplexed TCP tunneling over a WebSocket-framed SSH transport
//!
//! A client opens one long-lived connection to a server through an HTTP(S)
//! upgrade to a WebSocket, then multiplexes any number of application byte
//! streams over SSH channels running inside the binary WebSocket frames:
//!
//! - **Forward routes** - local stub listeners whose accepted connections
//!   are carried to targets reachable from the server
//! - **Reverse routes** - server-side stub listeners whose connections are
//!   carried back to targets reachable from the client
//! - **Endpoint variants** - TCP, Unix sockets, an in-process SOCKS5 server,
//!   stdin/stdout, and a named in-process loopback
//!
//! # Architecture
//!
//! ```text
//! external caller -> stub listener -> SSH channel over WebSocket
//!                                          |
//!                                          v
//!                              skeleton endpoint -> dialed target
//! ```
//!
//! The session core on each side owns the SSH connection; every stub
//! listener, accepted connection, channel, and copy direction runs as its
//! own task under the session's cancellation token.
//!
//! # Example
//!
//! ```rust,no_run
//! use xevo_tunnel::{parse_route, Client, ClientOptions};
//!
//! # async fn example() -> xevo_tunnel::Result<()> {
//! let opts = ClientOptions::new("http://tunnel.example.com:8080")
//!     .with_auth("alice:secret")
//!     .with_route(parse_route("2000:127.0.0.1:22")?);
//! let client = Client::new(opts)?;
//! client.run().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod pump;
pub mod relay;
pub mod server;
pub mod stats;
pub mod switchboard;
pub mod ws;

// Re-export main types at crate root
pub use auth::{parse_auth, User, UserIndex};
pub use client::Client;
pub use codec::SessionConfigRequest;
pub use config::{ClientOptions, ServerOptions};
pub use descriptor::{
    parse_route, ChannelDescriptor, EndpointDescriptor, EndpointRole, EndpointType,
};
pub use error::{Result, TunnelError};
pub use pump::{pump_streams, BoxedStream, ByteStream};
pub use relay::ChannelOpener;
pub use server::Server;
pub use stats::ConnStats;
pub use switchboard::{LoopListener, Switchboard};
pub use ws::WsStream;

/// WebSocket subprotocol spoken by this build; peers must match exactly
pub const PROTOCOL_VERSION: &str = "xevo-chisel-v3";

/// Subprotocol prefix shared by all revisions; a matching prefix with a
/// different version is logged and falls through to plain HTTP handling
pub const PROTOCOL_PREFIX: &str = "xevo-chisel-";

/// Build version reported by `/version` and the configuration request
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

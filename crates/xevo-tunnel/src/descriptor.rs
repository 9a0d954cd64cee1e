//! Endpoint and route descriptors
//!
//! A route pairs a *stub* endpoint (the side that accepts external
//! connections) with a *skeleton* endpoint (the side that dials the local
//! target once a channel reaches it). Descriptors carry a role, an endpoint
//! type, and a type-specific path, and have three representations: the
//! in-memory structs here, a JSON form used as channel-open extra data, and
//! the compact textual form used for access control matching and logs.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a route an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Role not yet assigned
    #[default]
    Unknown,
    /// Bind side; accepts external connections and initiates channel opens
    Stub,
    /// Dial side; receives channel opens and connects to the local target
    Skeleton,
}

impl EndpointRole {
    /// Convert to wire format byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Stub => 1,
            Self::Skeleton => 2,
        }
    }

    /// Parse from wire format byte
    ///
    /// # Errors
    ///
    /// Returns a protocol error for any byte other than 0, 1 or 2.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Stub),
            2 => Ok(Self::Skeleton),
            _ => Err(TunnelError::protocol(format!(
                "unknown endpoint role: {byte}"
            ))),
        }
    }
}

/// Transport variant of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// TCP listener or dialer; path is `host:port`
    Tcp,
    /// Unix domain socket; path is a filesystem path
    Unix,
    /// In-process SOCKS5 server; skeleton only, empty path
    Socks,
    /// Process stdin/stdout as a single-shot stream; stub only, empty path
    Stdio,
    /// In-process named rendezvous; path is the loop name
    Loop,
}

impl EndpointType {
    /// The token used for this type in wire and textual forms
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Socks => "socks",
            Self::Stdio => "stdio",
            Self::Loop => "loop",
        }
    }

    /// Parse from a wire or textual token
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unrecognized tokens.
    pub fn from_token(token: &str) -> Result<Self> {
        match token {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            "socks" => Ok(Self::Socks),
            "stdio" => Ok(Self::Stdio),
            "loop" => Ok(Self::Loop),
            _ => Err(TunnelError::protocol(format!(
                "unknown endpoint type: {token}"
            ))),
        }
    }
}

/// One side of a route: role, transport type, and type-specific path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Stub or skeleton
    pub role: EndpointRole,
    /// Transport variant
    #[serde(rename = "type")]
    pub kind: EndpointType,
    /// `host:port` for tcp, filesystem path for unix, loop name for loop,
    /// empty for socks and stdio
    #[serde(default)]
    pub path: String,
}

impl EndpointDescriptor {
    /// Create a descriptor
    #[must_use]
    pub fn new(role: EndpointRole, kind: EndpointType, path: impl Into<String>) -> Self {
        Self {
            role,
            kind,
            path: path.into(),
        }
    }

    /// Shorthand for a TCP descriptor
    #[must_use]
    pub fn tcp(role: EndpointRole, addr: impl Into<String>) -> Self {
        Self::new(role, EndpointType::Tcp, addr)
    }

    /// Validate the role/type/path combination
    ///
    /// # Errors
    ///
    /// Returns `Prohibited` for combinations the protocol never allows
    /// (socks stub, stdio skeleton) and `Protocol` for missing or spurious
    /// paths.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            EndpointType::Tcp | EndpointType::Unix | EndpointType::Loop => {
                if self.path.is_empty() {
                    return Err(TunnelError::protocol(format!(
                        "{} endpoint requires a path",
                        self.kind.token()
                    )));
                }
            }
            EndpointType::Socks => {
                if self.role == EndpointRole::Stub {
                    return Err(TunnelError::prohibited("socks endpoint cannot be a stub"));
                }
                if !self.path.is_empty() {
                    return Err(TunnelError::protocol("socks endpoint takes no path"));
                }
            }
            EndpointType::Stdio => {
                if self.role == EndpointRole::Skeleton {
                    return Err(TunnelError::prohibited(
                        "stdio endpoint cannot be a skeleton",
                    ));
                }
                if !self.path.is_empty() {
                    return Err(TunnelError::protocol("stdio endpoint takes no path"));
                }
            }
        }
        Ok(())
    }

    /// Parse the compact textual form back into a descriptor
    ///
    /// The textual form does not carry the role, so the caller supplies it.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the text does not name a known endpoint
    /// type or omits a required path.
    pub fn parse_text(text: &str, role: EndpointRole) -> Result<Self> {
        let (kind, path) = match text.split_once(':') {
            None => (EndpointType::from_token(text)?, String::new()),
            Some((token, rest)) => match EndpointType::from_token(token) {
                Ok(kind) => (kind, rest.to_string()),
                // A bare host:port renders without the tcp prefix when parsed
                // from route specs; tolerate it here.
                Err(_) => (EndpointType::Tcp, text.to_string()),
            },
        };
        let descriptor = Self::new(role, kind, path);
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind.token())
        } else {
            write!(f, "{}:{}", self.kind.token(), self.path)
        }
    }
}

/// One configured route: a stub/skeleton pair plus direction
///
/// `reverse == false` runs the stub on the client and the skeleton on the
/// server; `reverse == true` swaps the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// True when the stub runs on the server side
    pub reverse: bool,
    /// The accepting side
    pub stub: EndpointDescriptor,
    /// The dialing side
    pub skeleton: EndpointDescriptor,
}

impl ChannelDescriptor {
    /// Create a route descriptor, assigning the stub/skeleton roles
    #[must_use]
    pub fn new(reverse: bool, mut stub: EndpointDescriptor, mut skeleton: EndpointDescriptor) -> Self {
        stub.role = EndpointRole::Stub;
        skeleton.role = EndpointRole::Skeleton;
        Self {
            reverse,
            stub,
            skeleton,
        }
    }

    /// Validate both endpoints and their pairing
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint is invalid or the roles are not
    /// stub/skeleton respectively.
    pub fn validate(&self) -> Result<()> {
        if self.stub.role != EndpointRole::Stub {
            return Err(TunnelError::protocol("stub endpoint must have stub role"));
        }
        if self.skeleton.role != EndpointRole::Skeleton {
            return Err(TunnelError::protocol(
                "skeleton endpoint must have skeleton role",
            ));
        }
        self.stub.validate()?;
        self.skeleton.validate()
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            write!(f, "R:{}:{}", self.stub, self.skeleton)
        } else {
            write!(f, "{}:{}", self.stub, self.skeleton)
        }
    }
}

/// Default local bind address for stub listeners parsed from route specs
const DEFAULT_STUB_HOST: &str = "0.0.0.0";
/// Default remote host when a route spec names only ports
const DEFAULT_SKELETON_HOST: &str = "127.0.0.1";
/// Default local port for a bare `socks` route
const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Parse one CLI route specification into a channel descriptor.
///
/// Accepted grammar, with `R:` prefix marking a reverse route:
///
/// ```text
/// <port>                              local <port> to 127.0.0.1:<port>
/// <port>:<host>:<port>                local port to remote host:port
/// <bind>:<port>:<host>:<port>         explicit local bind address
/// socks | <port>:socks                local port (default 1080) to SOCKS5
/// stdio:<host>:<port>                 stdin/stdout to remote host:port
/// <port>:loop:<name>                  local port to loop name
/// loop:<name>:<host>:<port>           loop listener to remote host:port
/// <port>:unix:<path>                  local port to unix socket
/// unix:<path>:<host>:<port>           unix listener to remote host:port
/// ```
///
/// # Errors
///
/// Returns a configuration error when the spec does not match the grammar.
pub fn parse_route(spec: &str) -> Result<ChannelDescriptor> {
    let bad = |detail: &str| TunnelError::config(format!("invalid route '{spec}': {detail}"));

    let (reverse, rest) = match spec.strip_prefix("R:") {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    if rest.is_empty() {
        return Err(bad("empty route"));
    }
    let mut tokens: Vec<&str> = rest.split(':').collect();

    // Single-token shorthands first.
    if tokens.len() == 1 {
        let chd = match tokens[0] {
            "socks" => ChannelDescriptor::new(
                reverse,
                EndpointDescriptor::tcp(
                    EndpointRole::Stub,
                    format!("{DEFAULT_STUB_HOST}:{DEFAULT_SOCKS_PORT}"),
                ),
                EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Socks, ""),
            ),
            port => {
                let port: u16 = port.parse().map_err(|_| bad("expected a port number"))?;
                ChannelDescriptor::new(
                    reverse,
                    EndpointDescriptor::tcp(EndpointRole::Stub, format!("{DEFAULT_STUB_HOST}:{port}")),
                    EndpointDescriptor::tcp(
                        EndpointRole::Skeleton,
                        format!("{DEFAULT_SKELETON_HOST}:{port}"),
                    ),
                )
            }
        };
        chd.validate()?;
        return Ok(chd);
    }

    // Consume the skeleton side from the back of the token list.
    let skeleton = match tokens.as_slice() {
        [.., "socks"] => {
            tokens.truncate(tokens.len() - 1);
            EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Socks, "")
        }
        [.., "loop", name] => {
            let name = (*name).to_string();
            tokens.truncate(tokens.len() - 2);
            EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Loop, name)
        }
        [.., "unix", path] => {
            let path = (*path).to_string();
            tokens.truncate(tokens.len() - 2);
            EndpointDescriptor::new(EndpointRole::Skeleton, EndpointType::Unix, path)
        }
        [.., host, port] if port.parse::<u16>().is_ok() => {
            let addr = format!("{host}:{port}");
            tokens.truncate(tokens.len() - 2);
            EndpointDescriptor::tcp(EndpointRole::Skeleton, addr)
        }
        _ => return Err(bad("cannot parse remote side")),
    };

    // What remains is the stub side.
    let stub = match tokens.as_slice() {
        [] => {
            // No explicit local side; reuse the remote port where one exists.
            let port = match skeleton.kind {
                EndpointType::Socks => DEFAULT_SOCKS_PORT,
                EndpointType::Tcp => skeleton
                    .path
                    .rsplit_once(':')
                    .and_then(|(_, p)| p.parse().ok())
                    .ok_or_else(|| bad("cannot derive local port"))?,
                _ => return Err(bad("local side required for this route")),
            };
            EndpointDescriptor::tcp(EndpointRole::Stub, format!("{DEFAULT_STUB_HOST}:{port}"))
        }
        ["stdio"] => EndpointDescriptor::new(EndpointRole::Stub, EndpointType::Stdio, ""),
        ["loop", name] => EndpointDescriptor::new(EndpointRole::Stub, EndpointType::Loop, *name),
        ["unix", path] => EndpointDescriptor::new(EndpointRole::Stub, EndpointType::Unix, *path),
        [port] if port.parse::<u16>().is_ok() => {
            EndpointDescriptor::tcp(EndpointRole::Stub, format!("{DEFAULT_STUB_HOST}:{port}"))
        }
        [host, port] if port.parse::<u16>().is_ok() => {
            EndpointDescriptor::tcp(EndpointRole::Stub, format!("{host}:{port}"))
        }
        _ => return Err(bad("cannot parse local side")),
    };

    let chd = ChannelDescriptor::new(reverse, stub, skeleton);
    chd.validate()?;
    Ok(chd)
}

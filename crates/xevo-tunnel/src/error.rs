//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur while establishing or serving tunnels
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Protocol-level error (malformed request, decode failure)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation
        message: String,
    },

    /// Authentication failure (bad credentials, fingerprint mismatch)
    #[error("Authentication error: {reason}")]
    Auth {
        /// Reason for the authentication failure
        reason: String,
    },

    /// Configuration rejected or invalid
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },

    /// A route was refused by server policy
    #[error("{message}")]
    Denied {
        /// Human-readable denial, safe to surface to the peer
        message: String,
    },

    /// The requested endpoint kind is disabled in this process
    #[error("{feature} is not enabled")]
    FeatureNotEnabled {
        /// Name of the disabled feature
        feature: String,
    },

    /// Role/type combination not permitted
    #[error("Prohibited: {message}")]
    Prohibited {
        /// What was attempted
        message: String,
    },

    /// Local dial target could not be reached
    #[error("Unreachable: {target}: {detail}")]
    Unreachable {
        /// The dialed target, in endpoint textual form
        target: String,
        /// Underlying failure detail
        detail: String,
    },

    /// Loopback name has no registered listener
    #[error("No listener registered at loop name '{name}'")]
    NotFound {
        /// The loop name that was dialed
        name: String,
    },

    /// Connection-level I/O error
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The control transport was lost
    #[error("Transport lost: {detail}")]
    TransportLost {
        /// What was observed when the transport died
        detail: String,
    },
}

impl TunnelError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new authentication error
    #[must_use]
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new route denial
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self::Denied {
            message: message.into(),
        }
    }

    /// Create a new disabled-feature error
    #[must_use]
    pub fn feature_not_enabled(feature: impl Into<String>) -> Self {
        Self::FeatureNotEnabled {
            feature: feature.into(),
        }
    }

    /// Create a new prohibited-combination error
    #[must_use]
    pub fn prohibited(message: impl Into<String>) -> Self {
        Self::Prohibited {
            message: message.into(),
        }
    }

    /// Create a new unreachable-target error
    #[must_use]
    pub fn unreachable(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Unreachable {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::error::Error>(err: E) -> Self {
        Self::Connection {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }

    /// Create a new transport-lost error
    #[must_use]
    pub fn transport_lost(detail: impl Into<String>) -> Self {
        Self::TransportLost {
            detail: detail.into(),
        }
    }

    /// True for errors that reject a single channel without ending the session
    #[must_use]
    pub fn is_channel_local(&self) -> bool {
        matches!(
            self,
            Self::FeatureNotEnabled { .. }
                | Self::Prohibited { .. }
                | Self::Unreachable { .. }
                | Self::NotFound { .. }
        )
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

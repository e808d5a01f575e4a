use std::fmt;
use thiserror::Error;

/// The UART endpoint that service discovery could not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEndpoint {
    Service,
    Tx,
    Rx,
}

impl fmt::Display for MissingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => f.write_str("UART service"),
            Self::Tx => f.write_str("TX characteristic"),
            Self::Rx => f.write_str("RX characteristic"),
        }
    }
}

/// Failures of a single command exchange.
///
/// A response line that matches no known marker is not an error: it is
/// treated as payload so newer firmware output stays readable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("not connected: no active write characteristic")]
    NotConnected,

    #[error("device is busy: a session is already active")]
    AlreadyConnected,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("service discovery failed: {0} not found")]
    ServiceDiscoveryFailed(MissingEndpoint),

    #[error("subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("link lost before the exchange completed")]
    LinkLost,

    #[error("no response for {0} ms")]
    Timeout(u64),

    #[error("session cancelled")]
    Cancelled,

    #[error("device has not been time-synced")]
    NotSynced,

    #[error("exchange ended without a result")]
    Incomplete,

    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

impl SessionError {
    /// Short text surfaced to the dashboard instead of the error itself.
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyConnected => "Busy: a command is already running".to_string(),
            Self::NotConnected | Self::ConnectFailed(_) | Self::LinkLost => {
                format!("Not connected ({})", self)
            }
            other => other.to_string(),
        }
    }
}

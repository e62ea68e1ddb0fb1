use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single framed exchange on one connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Peer closed the stream (EOF at any point of a frame).
    #[error("connection closed by peer")]
    Closed,
    /// Transport failure other than a clean close. Treated like `Closed`.
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("no complete message within {0:?}")]
    Timeout(Duration),
    /// Garbled header, unknown type code, bad payload encoding or an
    /// unexpected message where a specific kind was required.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Framing was lost (e.g. an oversized length field). Nothing after it
    /// can be parsed, so the connection is as good as closed.
    #[error("framing lost: {0}")]
    Corrupt(String),
}

impl ChannelError {
    /// True when the connection is gone for good and should be dropped.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed | ChannelError::Io(_) | ChannelError::Corrupt(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ChannelError::Protocol(msg.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("label {0:?} is already in use")]
    DuplicateLabel(String),
    #[error("no agent labelled {0:?}")]
    NotFound(String),
    #[error("labels must not be empty")]
    EmptyLabel,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("handshake label is not valid UTF-8")]
    InvalidLabel(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error)]
pub enum FocusError {
    #[error("no agent is focused")]
    NoFocus,
    /// The focused connection is no longer in the registry.
    #[error("focused agent {0:?} is gone")]
    Lost(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl FocusError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            FocusError::Lost(_) => true,
            FocusError::Channel(err) => err.is_disconnect(),
            FocusError::NoFocus | FocusError::Registry(_) => false,
        }
    }
}

/// Operator input that cannot be turned into a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Syntax error in command.")]
    Syntax,
    #[error("Invalid arguments!")]
    InvalidArguments,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be between 1 and 8 bytes, got {value}")]
    HeaderWidth { field: &'static str, value: usize },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("max frame size must be at least 1 byte")]
    ZeroFrameLimit,
}

/// Conditions that stop the controller.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("no agents left to focus, restart the controller")]
    NoAgents,
    #[error("operator console I/O failed: {0}")]
    Console(#[from] io::Error),
}

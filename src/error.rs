//! Control-channel error types.
//!
//! # Propagation
//!
//! Errors raised while a connection is being served never cross the
//! connection boundary. The connection task logs them and disconnects:
//!
//! | Variant               | Scope               | Connection outcome          |
//! |-----------------------|---------------------|-----------------------------|
//! | `HandshakeTimeout`    | handshake stage     | disconnect                  |
//! | `IdleReadTimeout`     | any state           | disconnect                  |
//! | `ProtocolParse`       | codec               | disconnect                  |
//! | `UnsupportedVersion`  | hello exchange      | disconnect                  |
//! | `DeviceError`         | handshake stage     | disconnect                  |
//! | `IllegalStateMessage` | state machine       | disconnect                  |
//! | `RoleProtocol`        | role negotiation    | disconnect (hard violation) |
//! | `DuplicateIdentity`   | activation          | disconnect, no cleanup      |
//! | `Io`                  | socket              | disconnect                  |
//!
//! Soft role mismatches during active operation are handled inside the
//! switch (role reassertion) and never surface as an `OfError`.

use std::io;

use thiserror::Error;

use crate::codec::MessageType;
use crate::protocol::ChannelState;

/// Control-channel errors.
#[derive(Error, Debug)]
pub enum OfError {
    /// The handshake did not reach a completed state in time.
    #[error("Handshake timed out in state {0:?}")]
    HandshakeTimeout(ChannelState),

    /// Nothing was read from the device for longer than the read timeout.
    #[error("Read idle timeout")]
    IdleReadTimeout,

    /// Framing or body decoding failed.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// The device offered no OpenFlow version we speak.
    #[error("Unsupported OpenFlow version 0x{0:02x}")]
    UnsupportedVersion(u8),

    /// The device answered a handshake request with an error message.
    #[error("Switch error during handshake: {0}")]
    DeviceError(String),

    /// A message type that is not valid for the current handshake state.
    #[error("Switch should never send {msg_type:?} in state {state:?}")]
    IllegalStateMessage {
        /// State the connection was in.
        state: ChannelState,
        /// Offending message type.
        msg_type: MessageType,
    },

    /// Role reply or error inconsistent with any pending request.
    #[error("Role protocol error: {0}")]
    RoleProtocol(String),

    /// Another live connection already presented this datapath id.
    #[error("Duplicate datapath id {0}")]
    DuplicateIdentity(String),

    /// The device is not connected.
    #[error("Switch {0} is not connected")]
    NotConnected(String),

    /// A pending reply was discarded before it completed.
    #[error("Reply dropped before completion")]
    ReplyDropped,

    /// A multi-part reply exceeded the accumulator bounds.
    #[error("Stats reply overflow: {0}")]
    StatsOverflow(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// TLS material could not be loaded or applied.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl OfError {
    /// Whether this error is a benign peer disconnect (reset, broken pipe, EOF).
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            OfError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias for control-channel operations
pub type Result<T> = std::result::Result<T, OfError>;

impl From<toml::de::Error> for OfError {
    fn from(err: toml::de::Error) -> Self {
        OfError::Config(err.to_string())
    }
}

impl From<rustls::Error> for OfError {
    fn from(err: rustls::Error) -> Self {
        OfError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_disconnect() {
        let reset = OfError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_benign_disconnect());

        let other = OfError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!other.is_benign_disconnect());
        assert!(!OfError::IdleReadTimeout.is_benign_disconnect());
    }

    #[test]
    fn test_illegal_state_display() {
        let err = OfError::IllegalStateMessage {
            state: ChannelState::WaitHello,
            msg_type: MessageType::FeaturesReply,
        };
        let text = err.to_string();
        assert!(text.contains("FeaturesReply"));
        assert!(text.contains("WaitHello"));
    }
}

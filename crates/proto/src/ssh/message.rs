//! SSH message numbers used by the client engine.
//!
//! Only messages the engine itself produces or consumes are listed. Key
//! exchange method messages (30-49) never reach the engine because the
//! transport collaborator runs the cryptographic exchange.
//!
//! Number 60 is method-specific in the authentication protocol: it is
//! `PK_OK` for public key, `PASSWD_CHANGEREQ` for password and
//! `INFO_REQUEST` for keyboard-interactive. The enum names it once and the
//! interpretation is left to the running authentication method.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::ChannelData as u8, 94);
//! assert_eq!(MessageType::peek(&[94, 0, 0, 0, 1]), Some(MessageType::ChannelData));
//! ```

macro_rules! message_types {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $name:literal,)*) => {
        /// Message numbers (RFC 4250 Section 4.1).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($(#[$doc])* $variant = $value,)*
        }

        impl MessageType {
            /// Converts a byte to a message type.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(MessageType::$variant),)*
                    _ => None,
                }
            }

            /// Returns the RFC name, e.g. `SSH_MSG_CHANNEL_DATA`.
            pub fn name(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $name,)*
                }
            }
        }
    };
}

message_types! {
    /// Terminates the connection.
    Disconnect = 1 => "SSH_MSG_DISCONNECT",
    /// Padding or liveness traffic; always skipped.
    Ignore = 2 => "SSH_MSG_IGNORE",
    /// Peer did not understand a message.
    Unimplemented = 3 => "SSH_MSG_UNIMPLEMENTED",
    /// Debug text; skipped.
    Debug = 4 => "SSH_MSG_DEBUG",
    /// Requests a service such as `ssh-userauth`.
    ServiceRequest = 5 => "SSH_MSG_SERVICE_REQUEST",
    /// Service accepted.
    ServiceAccept = 6 => "SSH_MSG_SERVICE_ACCEPT",
    /// Algorithm negotiation.
    KexInit = 20 => "SSH_MSG_KEXINIT",
    /// Switch to the new keys.
    NewKeys = 21 => "SSH_MSG_NEWKEYS",
    /// Authentication request.
    UserauthRequest = 50 => "SSH_MSG_USERAUTH_REQUEST",
    /// Authentication failure, carries the methods that can continue.
    UserauthFailure = 51 => "SSH_MSG_USERAUTH_FAILURE",
    /// Authentication success.
    UserauthSuccess = 52 => "SSH_MSG_USERAUTH_SUCCESS",
    /// Text to show before authentication.
    UserauthBanner = 53 => "SSH_MSG_USERAUTH_BANNER",
    /// Method-specific reply (PK_OK, PASSWD_CHANGEREQ, INFO_REQUEST).
    UserauthInfoRequest = 60 => "SSH_MSG_USERAUTH_INFO_REQUEST",
    /// Keyboard-interactive responses.
    UserauthInfoResponse = 61 => "SSH_MSG_USERAUTH_INFO_RESPONSE",
    /// Connection-wide request.
    GlobalRequest = 80 => "SSH_MSG_GLOBAL_REQUEST",
    /// Global request accepted.
    RequestSuccess = 81 => "SSH_MSG_REQUEST_SUCCESS",
    /// Global request refused.
    RequestFailure = 82 => "SSH_MSG_REQUEST_FAILURE",
    /// Opens a channel.
    ChannelOpen = 90 => "SSH_MSG_CHANNEL_OPEN",
    /// Channel open accepted.
    ChannelOpenConfirmation = 91 => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Channel open refused.
    ChannelOpenFailure = 92 => "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grants more window.
    ChannelWindowAdjust = 93 => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Stream 0 data.
    ChannelData = 94 => "SSH_MSG_CHANNEL_DATA",
    /// Extended stream data (stderr is stream 1).
    ChannelExtendedData = 95 => "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// No more data in this direction.
    ChannelEof = 96 => "SSH_MSG_CHANNEL_EOF",
    /// Channel close.
    ChannelClose = 97 => "SSH_MSG_CHANNEL_CLOSE",
    /// Channel-specific request.
    ChannelRequest = 98 => "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request accepted.
    ChannelSuccess = 99 => "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request refused.
    ChannelFailure = 100 => "SSH_MSG_CHANNEL_FAILURE",
}

impl MessageType {
    /// Reads the message number of a payload.
    pub fn peek(payload: &[u8]) -> Option<Self> {
        payload.first().copied().and_then(Self::from_u8)
    }

    /// True for messages addressed to a specific channel.
    pub fn is_channel_message(&self) -> bool {
        (*self as u8) >= MessageType::ChannelOpenConfirmation as u8
            && (*self as u8) <= MessageType::ChannelFailure as u8
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// MAC error
    MacError = 5,
    /// Compression error
    CompressionError = 6,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Protocol version not supported
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Normal shutdown by application
    ByApplication = 11,
    /// Too many connections
    TooManyConnections = 12,
    /// Authentication cancelled by user
    AuthCancelledByUser = 13,
    /// No more authentication methods available
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name
    IllegalUserName = 15,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(31), None);
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_peek_empty_payload() {
        assert_eq!(MessageType::peek(&[]), None);
    }

    #[test]
    fn test_channel_message_range() {
        assert!(MessageType::ChannelData.is_channel_message());
        assert!(MessageType::ChannelFailure.is_channel_message());
        assert!(!MessageType::ChannelOpen.is_channel_message());
        assert!(!MessageType::GlobalRequest.is_channel_message());
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(
            format!("{}", MessageType::ChannelEof),
            "SSH_MSG_CHANNEL_EOF(96)"
        );
    }
}

//! Error types for tether
//!
//! Low-level failures arrive as flat numeric codes ([`ErrorCode`]). They are
//! folded into [`TetherError`], a closed taxonomy whose variants carry the
//! originating code and a human-readable message.

use std::fmt;
use thiserror::Error;

/// Flat numeric error codes used across the engine.
///
/// The values match the codes historically exposed by C SSH client libraries
/// so that numbers reported by logs and callers stay meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// No socket or socket failure
    SocketNone = -1,
    /// Failed to receive the remote banner
    BannerRecv = -2,
    /// Failed to send the local banner
    BannerSend = -3,
    /// Packet MAC did not verify
    InvalidMac = -4,
    /// Key exchange negotiation failed
    KexFailure = -5,
    /// Allocation failure
    Alloc = -6,
    /// Socket send failure
    SocketSend = -7,
    /// Key exchange failed after negotiation
    KeyExchangeFailure = -8,
    /// Timed out
    Timeout = -9,
    /// Host key could not be initialised
    HostkeyInit = -10,
    /// Host key signature failed
    HostkeySign = -11,
    /// Decryption failure
    Decrypt = -12,
    /// Remote side disconnected
    SocketDisconnect = -13,
    /// Protocol violation
    Proto = -14,
    /// Password expired
    PasswordExpired = -15,
    /// Local file error
    File = -16,
    /// No authentication method available
    MethodNone = -17,
    /// Authentication failed
    AuthenticationFailed = -18,
    /// Public key could not be verified
    PublickeyUnverified = -19,
    /// Channel message out of order
    ChannelOutOfOrder = -20,
    /// Channel failure
    ChannelFailure = -21,
    /// Channel request denied
    ChannelRequestDenied = -22,
    /// Unknown channel
    ChannelUnknown = -23,
    /// Channel window exceeded
    ChannelWindowExceeded = -24,
    /// Channel packet size exceeded
    ChannelPacketExceeded = -25,
    /// Channel closed
    ChannelClosed = -26,
    /// EOF already sent on channel
    ChannelEofSent = -27,
    /// SCP protocol error
    ScpProtocol = -28,
    /// Zlib failure
    Zlib = -29,
    /// Socket timed out
    SocketTimeout = -30,
    /// SFTP protocol error; the remote status is reported separately
    SftpProtocol = -31,
    /// Global request denied
    RequestDenied = -32,
    /// Method not supported
    MethodNotSupported = -33,
    /// Invalid argument
    Inval = -34,
    /// Invalid poll type
    InvalidPollType = -35,
    /// Public key subsystem protocol error
    PublickeyProtocol = -36,
    /// Operation would block
    Eagain = -37,
    /// Output buffer too small
    BufferTooSmall = -38,
    /// API misuse
    BadUse = -39,
    /// Compression failure
    Compress = -40,
    /// Index out of boundary
    OutOfBoundary = -41,
    /// Agent protocol error
    AgentProtocol = -42,
    /// Socket receive failure
    SocketRecv = -43,
    /// Encryption failure
    Encrypt = -44,
    /// Bad socket
    BadSocket = -45,
    /// Known-hosts error
    KnownHosts = -46,
    /// Channel window full
    ChannelWindowFull = -47,
    /// Key file authentication failed
    KeyfileAuthFailed = -48,
    /// Random generator failure
    RandGen = -49,
    /// Userauth banner missing
    MissingUserauthBanner = -50,
    /// Algorithm unsupported
    AlgoUnsupported = -51,
    /// Stands in for a code outside this table; the value itself is kept
    /// by [`TetherError::raw_code`]
    Unmapped = i32::MIN,
}

impl ErrorCode {
    /// Converts a raw code into an [`ErrorCode`].
    ///
    /// Returns `None` for values outside the known table.
    pub fn from_raw(code: i32) -> Option<Self> {
        use ErrorCode::*;
        let known = match code {
            0 => ErrorCode::None,
            -1 => SocketNone,
            -2 => BannerRecv,
            -3 => BannerSend,
            -4 => InvalidMac,
            -5 => KexFailure,
            -6 => Alloc,
            -7 => SocketSend,
            -8 => KeyExchangeFailure,
            -9 => Timeout,
            -10 => HostkeyInit,
            -11 => HostkeySign,
            -12 => Decrypt,
            -13 => SocketDisconnect,
            -14 => Proto,
            -15 => PasswordExpired,
            -16 => File,
            -17 => MethodNone,
            -18 => AuthenticationFailed,
            -19 => PublickeyUnverified,
            -20 => ChannelOutOfOrder,
            -21 => ChannelFailure,
            -22 => ChannelRequestDenied,
            -23 => ChannelUnknown,
            -24 => ChannelWindowExceeded,
            -25 => ChannelPacketExceeded,
            -26 => ChannelClosed,
            -27 => ChannelEofSent,
            -28 => ScpProtocol,
            -29 => Zlib,
            -30 => SocketTimeout,
            -31 => SftpProtocol,
            -32 => RequestDenied,
            -33 => MethodNotSupported,
            -34 => Inval,
            -35 => InvalidPollType,
            -36 => PublickeyProtocol,
            -37 => Eagain,
            -38 => BufferTooSmall,
            -39 => BadUse,
            -40 => Compress,
            -41 => OutOfBoundary,
            -42 => AgentProtocol,
            -43 => SocketRecv,
            -44 => Encrypt,
            -45 => BadSocket,
            -46 => KnownHosts,
            -47 => ChannelWindowFull,
            -48 => KeyfileAuthFailed,
            -49 => RandGen,
            -50 => MissingUserauthBanner,
            -51 => AlgoUnsupported,
            _ => return Option::None,
        };
        Some(known)
    }

    /// Returns the raw numeric value.
    pub fn raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.raw())
    }
}

/// Agent failure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFailure {
    /// Could not reach the agent
    Connection,
    /// Agent replied with something unexpected
    Protocol,
    /// Listing identities failed
    ListIdentities,
    /// Agent refused or failed to sign
    Sign,
}

/// Channel failure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFailure {
    /// Message arrived in a state that does not accept it
    OutOfOrder,
    /// Channel open or operation failed
    Failure,
    /// Channel request denied by the server
    RequestDenied,
    /// No channel with that id
    Unknown,
    /// Peer sent more data than the window allows
    WindowExceeded,
    /// Peer sent a packet larger than advertised
    PacketExceeded,
    /// Channel already closed
    Closed,
    /// EOF already sent
    EofSent,
}

/// Known-hosts failure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostsFailure {
    /// Entry could not be parsed or encoded
    Format,
    /// Entry to delete is not in the store
    EntryNotFound,
    /// Reading or writing the trust file failed
    File,
}

/// Transport I/O failure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Sending failed
    Send,
    /// Receiving failed
    Recv,
    /// Peer disconnected or the connection is gone
    Disconnect,
    /// Socket-level failure (missing or unusable socket)
    Socket,
}

/// Machine-checkable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Blocking wait expired
    Timeout,
    /// Authentication rejected
    AuthenticationFailed,
    /// Agent failure
    Agent(AgentFailure),
    /// Protocol violation
    ProtocolViolation,
    /// Channel failure
    Channel(ChannelFailure),
    /// SCP protocol failure
    ScpProtocol,
    /// SFTP server rejected an operation
    SftpProtocol,
    /// Known-hosts failure
    KnownHosts(KnownHostsFailure),
    /// Transport I/O failure
    TransportIo(TransportFailure),
    /// Output buffer too small
    BufferTooSmall,
    /// Method or algorithm not supported
    MethodNotSupported,
    /// Invalid argument
    InvalidArgument,
    /// Invalid use of the API
    InvalidUse,
    /// Compression failure
    Compression,
    /// Encryption failure
    Encryption,
    /// Unrecognised code
    Unknown,
}

/// Unified error type for all tether operations
#[derive(Debug, Error)]
pub enum TetherError {
    /// Blocking wait expired
    #[error("timed out: {message}")]
    Timeout {
        /// Originating code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Authentication {
        /// Originating code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// Agent failure
    #[error("agent error ({kind:?}): {message}")]
    Agent {
        /// Variant
        kind: AgentFailure,
        /// Description
        message: String,
    },

    /// Protocol violation
    #[error("protocol error: {message}")]
    Protocol {
        /// Originating code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// Channel failure
    #[error("channel error ({kind:?}): {message}")]
    Channel {
        /// Variant
        kind: ChannelFailure,
        /// Description
        message: String,
    },

    /// SCP protocol failure
    #[error("SCP protocol error: {message}")]
    Scp {
        /// Description
        message: String,
    },

    /// SFTP server rejected an operation
    #[error("SFTP protocol error (status {status}): {message}")]
    Sftp {
        /// Remote SFTP status code
        status: u32,
        /// Description
        message: String,
    },

    /// Known-hosts failure
    #[error("known hosts error ({kind:?}): {message}")]
    KnownHosts {
        /// Variant
        kind: KnownHostsFailure,
        /// Description
        message: String,
    },

    /// Transport I/O failure
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        /// Variant
        kind: TransportFailure,
        /// Description
        message: String,
    },

    /// Output buffer too small
    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// Method or algorithm not supported
    #[error("method not supported: {message}")]
    MethodNotSupported {
        /// Description
        message: String,
    },

    /// Invalid argument
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description
        message: String,
    },

    /// Invalid use of the API
    #[error("invalid use: {message}")]
    InvalidUse {
        /// Description
        message: String,
    },

    /// Compression failure
    #[error("compression error: {message}")]
    Compression {
        /// Originating code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// Encryption failure
    #[error("encryption error: {message}")]
    Encryption {
        /// Originating code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// Unrecognised code
    #[error("unknown error code {code}: {message}")]
    Unknown {
        /// Raw code
        code: i32,
        /// Description
        message: String,
    },
}

impl TetherError {
    /// Builds the error for a known code.
    ///
    /// `ErrorCode::None` and `ErrorCode::Eagain` are not failures; asking for
    /// them still yields a failure (`InvalidUse`) rather than a silent success.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        use ErrorCode as C;
        let message = message.into();
        match code {
            C::None | C::Eagain => TetherError::InvalidUse {
                message: format!("{} is not a failure: {}", code, message),
            },
            C::Unmapped => TetherError::Unknown {
                code: code.raw(),
                message,
            },
            C::Timeout | C::SocketTimeout => TetherError::Timeout { code, message },
            C::AuthenticationFailed
            | C::PasswordExpired
            | C::PublickeyUnverified
            | C::MethodNone
            | C::KeyfileAuthFailed
            | C::MissingUserauthBanner => TetherError::Authentication { code, message },
            C::AgentProtocol => TetherError::Agent {
                kind: AgentFailure::Protocol,
                message,
            },
            C::BannerRecv
            | C::BannerSend
            | C::KexFailure
            | C::KeyExchangeFailure
            | C::HostkeyInit
            | C::HostkeySign
            | C::Proto
            | C::PublickeyProtocol
            | C::RequestDenied
            | C::Alloc
            | C::RandGen => TetherError::Protocol { code, message },
            C::ChannelOutOfOrder => channel(ChannelFailure::OutOfOrder, message),
            C::ChannelFailure | C::ChannelWindowFull => channel(ChannelFailure::Failure, message),
            C::ChannelRequestDenied => channel(ChannelFailure::RequestDenied, message),
            C::ChannelUnknown => channel(ChannelFailure::Unknown, message),
            C::ChannelWindowExceeded => channel(ChannelFailure::WindowExceeded, message),
            C::ChannelPacketExceeded => channel(ChannelFailure::PacketExceeded, message),
            C::ChannelClosed => channel(ChannelFailure::Closed, message),
            C::ChannelEofSent => channel(ChannelFailure::EofSent, message),
            C::ScpProtocol => TetherError::Scp { message },
            C::SftpProtocol => TetherError::Sftp { status: 0, message },
            C::KnownHosts => TetherError::KnownHosts {
                kind: KnownHostsFailure::Format,
                message,
            },
            C::File => TetherError::KnownHosts {
                kind: KnownHostsFailure::File,
                message,
            },
            C::SocketNone | C::BadSocket => transport(TransportFailure::Socket, message),
            C::SocketSend => transport(TransportFailure::Send, message),
            C::SocketRecv => transport(TransportFailure::Recv, message),
            C::SocketDisconnect => transport(TransportFailure::Disconnect, message),
            C::BufferTooSmall => TetherError::BufferTooSmall {
                required: 0,
                available: 0,
            },
            C::MethodNotSupported | C::AlgoUnsupported => {
                TetherError::MethodNotSupported { message }
            }
            C::Inval | C::InvalidPollType | C::OutOfBoundary => {
                TetherError::InvalidArgument { message }
            }
            C::BadUse => TetherError::InvalidUse { message },
            C::Zlib | C::Compress => TetherError::Compression { code, message },
            C::InvalidMac | C::Decrypt | C::Encrypt => TetherError::Encryption { code, message },
        }
    }

    /// Builds the error for a raw code, falling back to [`TetherError::Unknown`].
    pub fn from_raw(code: i32, message: impl Into<String>) -> Self {
        match ErrorCode::from_raw(code) {
            Some(known) => Self::from_code(known, message),
            None => TetherError::Unknown {
                code,
                message: message.into(),
            },
        }
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        TetherError::Protocol {
            code: ErrorCode::Proto,
            message: message.into(),
        }
    }

    /// Shorthand for API misuse.
    pub fn invalid_use(message: impl Into<String>) -> Self {
        TetherError::InvalidUse {
            message: message.into(),
        }
    }

    /// Shorthand for a bad argument.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TetherError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for a channel failure.
    pub fn channel(kind: ChannelFailure, message: impl Into<String>) -> Self {
        channel(kind, message.into())
    }

    /// Shorthand for a transport failure.
    pub fn transport(kind: TransportFailure, message: impl Into<String>) -> Self {
        transport(kind, message.into())
    }

    /// Error returned once the owning session is gone or disconnected.
    pub fn connection_closed() -> Self {
        transport(TransportFailure::Disconnect, "connection closed".to_string())
    }

    /// Returns the machine-checkable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::Timeout { .. } => ErrorKind::Timeout,
            TetherError::Authentication { .. } => ErrorKind::AuthenticationFailed,
            TetherError::Agent { kind, .. } => ErrorKind::Agent(*kind),
            TetherError::Protocol { .. } => ErrorKind::ProtocolViolation,
            TetherError::Channel { kind, .. } => ErrorKind::Channel(*kind),
            TetherError::Scp { .. } => ErrorKind::ScpProtocol,
            TetherError::Sftp { .. } => ErrorKind::SftpProtocol,
            TetherError::KnownHosts { kind, .. } => ErrorKind::KnownHosts(*kind),
            TetherError::Transport { kind, .. } => ErrorKind::TransportIo(*kind),
            TetherError::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            TetherError::MethodNotSupported { .. } => ErrorKind::MethodNotSupported,
            TetherError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            TetherError::InvalidUse { .. } => ErrorKind::InvalidUse,
            TetherError::Compression { .. } => ErrorKind::Compression,
            TetherError::Encryption { .. } => ErrorKind::Encryption,
            TetherError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Returns the flat code this error reports as.
    pub fn code(&self) -> ErrorCode {
        match self {
            TetherError::Timeout { code, .. }
            | TetherError::Authentication { code, .. }
            | TetherError::Protocol { code, .. }
            | TetherError::Compression { code, .. }
            | TetherError::Encryption { code, .. } => *code,
            TetherError::Agent { .. } => ErrorCode::AgentProtocol,
            TetherError::Channel { kind, .. } => match kind {
                ChannelFailure::OutOfOrder => ErrorCode::ChannelOutOfOrder,
                ChannelFailure::Failure => ErrorCode::ChannelFailure,
                ChannelFailure::RequestDenied => ErrorCode::ChannelRequestDenied,
                ChannelFailure::Unknown => ErrorCode::ChannelUnknown,
                ChannelFailure::WindowExceeded => ErrorCode::ChannelWindowExceeded,
                ChannelFailure::PacketExceeded => ErrorCode::ChannelPacketExceeded,
                ChannelFailure::Closed => ErrorCode::ChannelClosed,
                ChannelFailure::EofSent => ErrorCode::ChannelEofSent,
            },
            TetherError::Scp { .. } => ErrorCode::ScpProtocol,
            TetherError::Sftp { .. } => ErrorCode::SftpProtocol,
            TetherError::KnownHosts { kind, .. } => match kind {
                KnownHostsFailure::File => ErrorCode::File,
                _ => ErrorCode::KnownHosts,
            },
            TetherError::Transport { kind, .. } => match kind {
                TransportFailure::Send => ErrorCode::SocketSend,
                TransportFailure::Recv => ErrorCode::SocketRecv,
                TransportFailure::Disconnect => ErrorCode::SocketDisconnect,
                TransportFailure::Socket => ErrorCode::BadSocket,
            },
            TetherError::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            TetherError::MethodNotSupported { .. } => ErrorCode::MethodNotSupported,
            TetherError::InvalidArgument { .. } => ErrorCode::Inval,
            TetherError::InvalidUse { .. } => ErrorCode::BadUse,
            TetherError::Unknown { .. } => ErrorCode::Unmapped,
        }
    }

    /// Returns the raw code, including codes outside the known table.
    pub fn raw_code(&self) -> i32 {
        match self {
            TetherError::Unknown { code, .. } => *code,
            other => other.code().raw(),
        }
    }

    /// Remote SFTP status code, for SFTP rejections.
    pub fn sftp_status(&self) -> Option<u32> {
        match self {
            TetherError::Sftp { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the human-readable description without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            TetherError::Timeout { message, .. }
            | TetherError::Authentication { message, .. }
            | TetherError::Agent { message, .. }
            | TetherError::Protocol { message, .. }
            | TetherError::Channel { message, .. }
            | TetherError::Scp { message }
            | TetherError::Sftp { message, .. }
            | TetherError::KnownHosts { message, .. }
            | TetherError::Transport { message, .. }
            | TetherError::MethodNotSupported { message }
            | TetherError::InvalidArgument { message }
            | TetherError::InvalidUse { message }
            | TetherError::Compression { message, .. }
            | TetherError::Encryption { message, .. }
            | TetherError::Unknown { message, .. } => message.clone(),
            TetherError::BufferTooSmall { .. } => self.to_string(),
        }
    }

    /// True when the error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::Transport { .. }
                | TetherError::Encryption { .. }
                | TetherError::Compression { .. }
        ) || matches!(
            self,
            TetherError::Protocol { code, .. } if *code != ErrorCode::RequestDenied
        )
    }
}

fn channel(kind: ChannelFailure, message: String) -> TetherError {
    TetherError::Channel { kind, message }
}

fn transport(kind: TransportFailure, message: String) -> TetherError {
    TetherError::Transport { kind, message }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut => {
                return TetherError::Timeout {
                    code: ErrorCode::SocketTimeout,
                    message: err.to_string(),
                }
            }
            Io::UnexpectedEof | Io::ConnectionReset | Io::ConnectionAborted => {
                TransportFailure::Disconnect
            }
            Io::NotConnected | Io::AddrNotAvailable | Io::ConnectionRefused => {
                TransportFailure::Socket
            }
            Io::BrokenPipe | Io::WriteZero => TransportFailure::Send,
            _ => TransportFailure::Recv,
        };
        transport(kind, err.to_string())
    }
}

/// Interprets a raw return code.
///
/// Non-negative values and `EAGAIN` pass through unchanged; every other code
/// becomes the matching [`TetherError`], and codes outside the table become
/// [`TetherError::Unknown`].
pub fn check_code(rc: i32) -> TetherResult<i32> {
    if rc >= 0 || rc == ErrorCode::Eagain.raw() {
        return Ok(rc);
    }
    Err(TetherError::from_raw(rc, format!("operation failed with code {}", rc)))
}

/// Result type for tether operations
pub type TetherResult<T> = Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::invalid_use("channel already started");
        assert_eq!(err.to_string(), "invalid use: channel already started");

        let err = TetherError::Sftp {
            status: 2,
            message: "No such file".to_string(),
        };
        assert_eq!(err.to_string(), "SFTP protocol error (status 2): No such file");
    }

    #[test]
    fn test_check_code_passes_success_and_eagain() {
        assert_eq!(check_code(0).unwrap(), 0);
        assert_eq!(check_code(42).unwrap(), 42);
        assert_eq!(check_code(ErrorCode::Eagain.raw()).unwrap(), -37);
    }

    #[test]
    fn test_check_code_unknown_is_not_success() {
        let err = check_code(-9999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.raw_code(), -9999);
        assert_eq!(err.code(), ErrorCode::Unmapped);
        assert_ne!(err.code(), ErrorCode::SocketNone);
        assert_eq!(ErrorCode::from_raw(ErrorCode::Unmapped.raw()), None);
    }

    #[test]
    fn test_every_known_code_maps_to_a_failure() {
        for raw in -51..0 {
            if raw == ErrorCode::Eagain.raw() {
                continue;
            }
            let err = check_code(raw).unwrap_err();
            assert_ne!(err.kind(), ErrorKind::Unknown, "code {}", raw);
        }
    }

    #[test]
    fn test_code_table_kinds() {
        let cases = [
            (ErrorCode::SocketSend, ErrorKind::TransportIo(TransportFailure::Send)),
            (ErrorCode::SocketRecv, ErrorKind::TransportIo(TransportFailure::Recv)),
            (ErrorCode::Timeout, ErrorKind::Timeout),
            (ErrorCode::AuthenticationFailed, ErrorKind::AuthenticationFailed),
            (ErrorCode::PasswordExpired, ErrorKind::AuthenticationFailed),
            (ErrorCode::ChannelEofSent, ErrorKind::Channel(ChannelFailure::EofSent)),
            (ErrorCode::ChannelClosed, ErrorKind::Channel(ChannelFailure::Closed)),
            (ErrorCode::SftpProtocol, ErrorKind::SftpProtocol),
            (ErrorCode::ScpProtocol, ErrorKind::ScpProtocol),
            (ErrorCode::KnownHosts, ErrorKind::KnownHosts(KnownHostsFailure::Format)),
            (ErrorCode::BufferTooSmall, ErrorKind::BufferTooSmall),
            (ErrorCode::MethodNotSupported, ErrorKind::MethodNotSupported),
            (ErrorCode::Zlib, ErrorKind::Compression),
            (ErrorCode::Encrypt, ErrorKind::Encryption),
            (ErrorCode::AgentProtocol, ErrorKind::Agent(AgentFailure::Protocol)),
        ];
        for (code, kind) in cases {
            let err = TetherError::from_code(code, "x");
            assert_eq!(err.kind(), kind, "{}", code);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: TetherError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::TransportIo(TransportFailure::Send));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_result_type() {
        fn example() -> TetherResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}

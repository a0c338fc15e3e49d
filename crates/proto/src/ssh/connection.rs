//! SSH connection protocol messages (RFC 4254).
//!
//! Codecs for everything the client sends or receives after authentication:
//! - Channel open / confirmation / failure
//! - Channel-addressed traffic ([`ChannelMessage`])
//! - Channel requests: pty-req, window-change, env, exec, shell, subsystem,
//!   agent forwarding, exit-status, exit-signal
//! - Global requests: tcpip-forward, cancel-tcpip-forward, keepalive
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::connection::{ChannelMessage, ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.sender_channel(), 0);
//!
//! let eof = ChannelMessage::Eof { recipient: 3 };
//! assert_eq!(ChannelMessage::parse(&eof.to_bytes()).unwrap().recipient(), 3);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use tether_platform::{TetherError, TetherResult};

/// Default local window advertised for new channels (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size advertised for new channels (32 KB).
pub const DEFAULT_PACKET_SIZE: u32 = 32768;

/// Largest window the engine will advertise (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Extended data type for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel opened by the server for a listener.
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type; only ever received, and refused.
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let w = Writer::message(MessageType::ChannelOpen as u8)
            .string(self.channel_type.name())
            .u32(self.sender_channel)
            .u32(self.initial_window_size)
            .u32(self.maximum_packet_size);

        let w = match &self.channel_type {
            ChannelType::Session | ChannelType::Other(_) => w,
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => w
                .string(host)
                .u32(*port)
                .string(originator_address)
                .u32(*originator_port),
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => w
                .string(connected_address)
                .u32(*connected_port)
                .string(originator_address)
                .u32(*originator_port),
        };
        w.finish()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = Reader::expect(data, MessageType::ChannelOpen as u8)?;
        let name = r.utf8()?;
        let sender_channel = r.u32()?;
        let initial_window_size = r.u32()?;
        let maximum_packet_size = r.u32()?;

        let channel_type = match name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.utf8()?,
                port: r.u32()?,
                originator_address: r.utf8()?,
                originator_port: r.u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.utf8()?,
                connected_port: r.u32()?,
                originator_address: r.utf8()?,
                originator_port: r.u32()?,
            },
            _ => ChannelType::Other(name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window_size: u32,
    /// Peer's maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Writer::message(MessageType::ChannelOpenConfirmation as u8)
            .u32(self.recipient_channel)
            .u32(self.sender_channel)
            .u32(self.initial_window_size)
            .u32(self.maximum_packet_size)
            .finish()
    }

    fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        Ok(Self {
            recipient_channel: r.u32()?,
            sender_channel: r.u32()?,
            initial_window_size: r.u32()?,
            maximum_packet_size: r.u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel number
    pub recipient_channel: u32,
    /// Raw reason code
    pub reason_code: u32,
    /// Free-form description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a refusal for a peer-initiated open.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason, description: &str) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Writer::message(MessageType::ChannelOpenFailure as u8)
            .u32(self.recipient_channel)
            .u32(self.reason_code)
            .string(&self.description)
            .string("")
            .finish()
    }

    /// Human-readable reason.
    pub fn reason(&self) -> String {
        let reason = ChannelOpenFailureReason::from_u32(self.reason_code)
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| format!("reason {}", self.reason_code));
        if self.description.is_empty() {
            reason
        } else {
            format!("{}: {}", reason, self.description)
        }
    }

    fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        let recipient_channel = r.u32()?;
        let reason_code = r.u32()?;
        let description = if r.remaining() > 0 { r.string()? } else { String::new() };
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// Terminal geometry for pty-req and window-change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtyDimensions {
    /// Width in characters
    pub width_chars: u32,
    /// Height in rows
    pub height_rows: u32,
    /// Width in pixels
    pub width_pixels: u32,
    /// Height in pixels
    pub height_pixels: u32,
}

impl PtyDimensions {
    /// Character-cell geometry with no pixel size.
    pub fn chars(width: u32, height: u32) -> Self {
        Self {
            width_chars: width,
            height_rows: height,
            ..Self::default()
        }
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "vt100")
        term: String,
        /// Geometry
        dimensions: PtyDimensions,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Terminal resize
    WindowChange {
        /// Geometry
        dimensions: PtyDimensions,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command line
        command: String,
    },
    /// Interactive shell
    Shell,
    /// Named subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Agent forwarding
    AuthAgent,
    /// Remote process exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Remote process killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Request the engine does not interpret
    Other {
        /// Request name
        name: String,
        /// Raw request-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::AuthAgent => "auth-agent-req@openssh.com",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }

    /// Builds the start request for `process_startup(request, message)`.
    pub fn startup(request: &str, message: Option<&str>) -> Self {
        match (request, message) {
            ("shell", _) => ChannelRequestType::Shell,
            ("exec", Some(command)) => ChannelRequestType::Exec {
                command: command.to_string(),
            },
            ("subsystem", Some(name)) => ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            (name, message) => {
                let data = match message {
                    Some(m) => Writer::new().string(m).finish(),
                    None => Vec::new(),
                };
                ChannelRequestType::Other {
                    name: name.to_string(),
                    data,
                }
            }
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Request type and data
    pub request_type: ChannelRequestType,
    /// Want reply flag
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Creates a channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let w = Writer::message(MessageType::ChannelRequest as u8)
            .u32(self.recipient_channel)
            .string(self.request_type.name())
            .bool(self.want_reply);

        let geometry = |w: Writer, d: &PtyDimensions| {
            w.u32(d.width_chars)
                .u32(d.height_rows)
                .u32(d.width_pixels)
                .u32(d.height_pixels)
        };

        let w = match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                dimensions,
                modes,
            } => geometry(w.string(term), dimensions).bytes(modes),
            ChannelRequestType::WindowChange { dimensions } => geometry(w, dimensions),
            ChannelRequestType::Env { name, value } => w.string(name).string(value),
            ChannelRequestType::Exec { command } => w.string(command),
            ChannelRequestType::Shell | ChannelRequestType::AuthAgent => w,
            ChannelRequestType::Subsystem { name } => w.string(name),
            ChannelRequestType::ExitStatus { exit_status } => w.u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => w
                .string(signal_name)
                .bool(*core_dumped)
                .string(error_message)
                .string(language_tag),
            ChannelRequestType::Other { data, .. } => w.raw(data),
        };
        w.finish()
    }

    fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        let recipient_channel = r.u32()?;
        let name = r.utf8()?;
        let want_reply = r.bool()?;

        let request_type = match name.as_str() {
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.string()?,
                core_dumped: r.bool()?,
                error_message: r.string()?,
                language_tag: r.string()?,
            },
            "exec" => ChannelRequestType::Exec { command: r.string()? },
            "subsystem" => ChannelRequestType::Subsystem { name: r.string()? },
            "env" => ChannelRequestType::Env {
                name: r.string()?,
                value: r.string()?,
            },
            "shell" => ChannelRequestType::Shell,
            _ => ChannelRequestType::Other {
                name,
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// Traffic addressed to one channel by its recipient number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Open accepted
    OpenConfirmation(ChannelOpenConfirmation),
    /// Open refused
    OpenFailure(ChannelOpenFailure),
    /// Peer grants more window
    WindowAdjust {
        /// Recipient channel number
        recipient: u32,
        /// Bytes added
        bytes_to_add: u32,
    },
    /// Stream 0 data
    Data {
        /// Recipient channel number
        recipient: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// Extended stream data
    ExtendedData {
        /// Recipient channel number
        recipient: u32,
        /// Stream type (1 = stderr)
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// No more data from the sender
    Eof {
        /// Recipient channel number
        recipient: u32,
    },
    /// Channel close
    Close {
        /// Recipient channel number
        recipient: u32,
    },
    /// Channel request
    Request(ChannelRequest),
    /// Channel request accepted
    Success {
        /// Recipient channel number
        recipient: u32,
    },
    /// Channel request refused
    Failure {
        /// Recipient channel number
        recipient: u32,
    },
}

impl ChannelMessage {
    /// Channel this message is addressed to.
    pub fn recipient(&self) -> u32 {
        match self {
            ChannelMessage::OpenConfirmation(c) => c.recipient_channel,
            ChannelMessage::OpenFailure(f) => f.recipient_channel,
            ChannelMessage::Request(r) => r.recipient_channel,
            ChannelMessage::WindowAdjust { recipient, .. }
            | ChannelMessage::Data { recipient, .. }
            | ChannelMessage::ExtendedData { recipient, .. }
            | ChannelMessage::Eof { recipient }
            | ChannelMessage::Close { recipient }
            | ChannelMessage::Success { recipient }
            | ChannelMessage::Failure { recipient } => *recipient,
        }
    }

    /// Parses a channel-addressed payload.
    pub fn parse(payload: &[u8]) -> TetherResult<Self> {
        let mut r = Reader::new(payload);
        let msg = r.u8()?;
        let kind = MessageType::from_u8(msg)
            .filter(MessageType::is_channel_message)
            .ok_or_else(|| TetherError::protocol(format!("message {} is not channel traffic", msg)))?;

        Ok(match kind {
            MessageType::ChannelOpenConfirmation => {
                ChannelMessage::OpenConfirmation(ChannelOpenConfirmation::read(&mut r)?)
            }
            MessageType::ChannelOpenFailure => {
                ChannelMessage::OpenFailure(ChannelOpenFailure::read(&mut r)?)
            }
            MessageType::ChannelWindowAdjust => ChannelMessage::WindowAdjust {
                recipient: r.u32()?,
                bytes_to_add: r.u32()?,
            },
            MessageType::ChannelData => ChannelMessage::Data {
                recipient: r.u32()?,
                data: r.bytes()?.to_vec(),
            },
            MessageType::ChannelExtendedData => ChannelMessage::ExtendedData {
                recipient: r.u32()?,
                data_type: r.u32()?,
                data: r.bytes()?.to_vec(),
            },
            MessageType::ChannelEof => ChannelMessage::Eof { recipient: r.u32()? },
            MessageType::ChannelClose => ChannelMessage::Close { recipient: r.u32()? },
            MessageType::ChannelRequest => ChannelMessage::Request(ChannelRequest::read(&mut r)?),
            MessageType::ChannelSuccess => ChannelMessage::Success { recipient: r.u32()? },
            _ => ChannelMessage::Failure { recipient: r.u32()? },
        })
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ChannelMessage::OpenConfirmation(c) => c.to_bytes(),
            ChannelMessage::OpenFailure(f) => f.to_bytes(),
            ChannelMessage::Request(r) => r.to_bytes(),
            ChannelMessage::WindowAdjust {
                recipient,
                bytes_to_add,
            } => Writer::message(MessageType::ChannelWindowAdjust as u8)
                .u32(*recipient)
                .u32(*bytes_to_add)
                .finish(),
            ChannelMessage::Data { recipient, data } => {
                Writer::message(MessageType::ChannelData as u8)
                    .u32(*recipient)
                    .bytes(data)
                    .finish()
            }
            ChannelMessage::ExtendedData {
                recipient,
                data_type,
                data,
            } => Writer::message(MessageType::ChannelExtendedData as u8)
                .u32(*recipient)
                .u32(*data_type)
                .bytes(data)
                .finish(),
            ChannelMessage::Eof { recipient } => simple(MessageType::ChannelEof, *recipient),
            ChannelMessage::Close { recipient } => simple(MessageType::ChannelClose, *recipient),
            ChannelMessage::Success { recipient } => simple(MessageType::ChannelSuccess, *recipient),
            ChannelMessage::Failure { recipient } => simple(MessageType::ChannelFailure, *recipient),
        }
    }
}

fn simple(kind: MessageType, recipient: u32) -> Vec<u8> {
    Writer::message(kind as u8).u32(recipient).finish()
}

/// SSH_MSG_GLOBAL_REQUEST kinds the client sends (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    /// Ask the server to listen and forward connections
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind; 0 lets the server choose
        port: u32,
    },
    /// Stop a previous forward
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// Liveness check
    Keepalive,
}

impl GlobalRequest {
    /// Request name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            GlobalRequest::TcpipForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequest::Keepalive => "keepalive@openssh.com",
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self, want_reply: bool) -> Vec<u8> {
        let w = Writer::message(MessageType::GlobalRequest as u8)
            .string(self.name())
            .bool(want_reply);
        let w = match self {
            GlobalRequest::TcpipForward { address, port }
            | GlobalRequest::CancelTcpipForward { address, port } => w.string(address).u32(*port),
            GlobalRequest::Keepalive => w,
        };
        w.finish()
    }
}

/// Parses an inbound SSH_MSG_GLOBAL_REQUEST into its name and want-reply flag.
pub fn parse_global_request(payload: &[u8]) -> TetherResult<(String, bool)> {
    let mut r = Reader::expect(payload, MessageType::GlobalRequest as u8)?;
    Ok((r.string()?, r.bool()?))
}

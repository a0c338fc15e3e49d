//! SSH client protocol engine.
//!
//! This module implements the client side of RFC 4252 and RFC 4254 on top
//! of a transport collaborator that performs the cryptographic key exchange
//! and packet protection.
//!
//! # Architecture
//!
//! The engine is layered:
//!
//! 1. **Wire** ([`wire`], [`message`]) - SSH encoding helpers and message numbers
//! 2. **Transport seam** ([`transport`], [`kex`]) - the collaborator trait and algorithm negotiation
//! 3. **Session** ([`session`], [`auth`]) - handshake, authentication, keepalive
//! 4. **Connection** ([`connection`], [`channel`], [`listener`]) - channels and forwarding
//! 5. **Subsystems** ([`scp`], [`sftp`]) - file transfer
//! 6. **Trust** ([`known_hosts`], [`agent`]) - host key store and agent client
//!
//! # Non-blocking contract
//!
//! Stateful operations return [`nonblocking::Progress`]. `WouldBlock` is a
//! control-flow signal, not an error: the object keeps every bit of progress
//! and the caller repeats the same call once the transport is readable or
//! writable, as reported by [`session::Session::block_directions`].
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod agent;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod kex;
pub mod known_hosts;
pub mod listener;
pub mod message;
pub mod nonblocking;
pub mod scp;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod wire;

// Re-export main types
pub use agent::{Agent, AgentConnector, AgentIdentity, AgentStream, UnixAgentConnector};
pub use auth::{IdentitySigner, KeyDecoder, KeyboardInteractivePrompt, Prompt};
pub use channel::{Channel, ExitSignal, ExtendedData, STREAM_DATA, STREAM_STDERR};
pub use connection::{PtyDimensions, DEFAULT_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
pub use kex::{MethodPreferences, MethodType};
pub use known_hosts::{KnownHostCheck, KnownHostEntry, KnownHosts};
pub use listener::Listener;
pub use message::{DisconnectReason, MessageType};
pub use nonblocking::{find_eol, retry_would_block, write_all_resumable, BlockDirections, Progress};
pub use scp::ScpFileStat;
pub use session::{Session, SessionConfig, SessionFlag, SessionState};
pub use sftp::{Sftp, SftpAttributes, SftpHandle};
pub use transport::{HashType, HostKey, HostKeyType, KexContext, KexOutcome, Transport};

//! Non-blocking SSH client protocol engine for the tether workspace.
//!
//! The engine sits between a caller and an encrypted transport. It owns the
//! session, channel and subsystem state machines and multiplexes one
//! connection into independent logical streams:
//!
//! - **Sessions** - handshake, authentication, method preferences, keepalive
//! - **Channels** - shell, exec, subsystem and TCP/IP tunnels with flow control
//! - **Listeners** - remote port forwarding
//! - **SCP** and **SFTP** - file transfer over a channel
//! - **Known hosts** and **agent** - host key trust and delegated signing
//!
//! Every operation that may wait on the transport returns a
//! [`ssh::nonblocking::Progress`]. In non-blocking mode a `WouldBlock`
//! result keeps all progress made so far; repeat the same call once the
//! transport is ready.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client engine
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex::MethodType;
//! use tether_proto::ssh::session::{Session, SessionState};
//!
//! let session = Session::new();
//! session.set_blocking(false);
//! session.method_pref(MethodType::CryptCs, "aes256-ctr,aes128-ctr");
//! assert_eq!(session.state(), SessionState::Unconnected);
//! ```
//!
//! # References
//!
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - SFTP version 3

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;

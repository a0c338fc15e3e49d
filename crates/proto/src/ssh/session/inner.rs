//! Shared session state, the outbound queue and the inbound packet pump.
//!
//! Every handle (session, channel, listener, SFTP, agent) reaches this state
//! through one `Arc<Mutex<SessionInner>>`. Operations are written as step
//! functions returning [`Step`]; [`SessionInner::run`] turns a step function
//! into the public would-block contract, waiting on the transport when the
//! session is in blocking mode.

use super::config::{SessionConfig, SessionState};
use super::keepalive::KeepaliveState;
use super::userauth::AuthProgress;
use crate::ssh::channel::{ChannelState, PendingOpen};
use crate::ssh::connection::{parse_global_request, ChannelMessage, GlobalRequest};
use crate::ssh::kex::{negotiate, KexInit, NegotiatedMethods};
use crate::ssh::listener::{ForwardProgress, ListenerState};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::nonblocking::{BlockDirections, Halt, Progress, Step};
use crate::ssh::scp::ScpProgress;
use crate::ssh::sftp::SftpBoot;
use crate::ssh::transport::{is_would_block, HashType, HostKey, KexContext, Transport};
use crate::ssh::wire::{Reader, Writer};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_platform::{ErrorCode, TetherError, TetherResult, TransportFailure};
use tracing::{debug, info, trace, warn};

/// Shared handle to session state.
pub(crate) type SharedSession = Arc<Mutex<SessionInner>>;

/// Non-owning back-reference held by dependents.
pub(crate) type WeakSession = Weak<Mutex<SessionInner>>;

/// Resolves a back-reference, failing once the session is gone.
pub(crate) fn upgrade(session: &WeakSession) -> TetherResult<SharedSession> {
    session.upgrade().ok_or_else(TetherError::connection_closed)
}

/// Outstanding global request awaiting a reply, matched in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlobalKind {
    Keepalive,
    Forward,
}

enum HandshakeStep {
    Start,
    Banner { client: KexInit },
    SendKexInit { client: KexInit },
    RecvKexInit { client: KexInit, client_bytes: Vec<u8> },
    KeyExchange(Box<KexContext>),
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    transport: Option<Box<dyn Transport>>,
    pub(crate) state: SessionState,
    handshake: HandshakeStep,
    pub(crate) negotiated: Option<NegotiatedMethods>,
    pub(crate) remote_banner: Option<String>,
    pub(crate) host_key: Option<HostKey>,
    pub(crate) session_id: Vec<u8>,
    outbound: VecDeque<Vec<u8>>,
    disconnect_queued: bool,
    pub(crate) block_directions: BlockDirections,
    pub(crate) last_error: Option<(ErrorCode, String)>,
    pub(crate) auth: AuthProgress,
    pub(crate) keepalive: KeepaliveState,
    pub(crate) channels: HashMap<u32, ChannelState>,
    next_channel_id: u32,
    pub(crate) pending_open: Option<PendingOpen>,
    pub(crate) listeners: HashMap<u32, ListenerState>,
    next_listener_id: u32,
    pub(crate) pending_forward: Option<ForwardProgress>,
    outstanding_global: VecDeque<GlobalKind>,
    pub(crate) scp: Option<ScpProgress>,
    pub(crate) sftp_boot: Option<SftpBoot>,
    /// Channel of the running SFTP subsystem
    pub(crate) sftp_channel: Option<u32>,
}

impl SessionInner {
    pub(crate) fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
            state: SessionState::Unconnected,
            handshake: HandshakeStep::Start,
            negotiated: None,
            remote_banner: None,
            host_key: None,
            session_id: Vec::new(),
            outbound: VecDeque::new(),
            disconnect_queued: false,
            block_directions: BlockDirections::None,
            last_error: None,
            auth: AuthProgress::default(),
            keepalive: KeepaliveState::default(),
            channels: HashMap::new(),
            next_channel_id: 0,
            pending_open: None,
            listeners: HashMap::new(),
            next_listener_id: 0,
            pending_forward: None,
            outstanding_global: VecDeque::new(),
            scp: None,
            sftp_boot: None,
            sftp_channel: None,
        }
    }

    pub(crate) fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Drives a step function under the would-block contract.
    ///
    /// In blocking mode the transport is waited on until the step completes
    /// or the configured timeout, measured from this call, expires.
    pub(crate) fn run<T, F>(&mut self, mut op: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut SessionInner) -> Step<T>,
    {
        let started = Instant::now();
        loop {
            match op(self) {
                Ok(value) => {
                    self.block_directions = BlockDirections::None;
                    return Ok(Progress::Complete(value));
                }
                Err(Halt::Fail(err)) => {
                    self.block_directions = BlockDirections::None;
                    return Err(self.record(err));
                }
                Err(Halt::Block(dirs)) => {
                    self.block_directions = dirs;
                    if !self.config.blocking {
                        return Ok(Progress::WouldBlock(dirs));
                    }
                    let timeout = match self.config.timeout_ms {
                        0 => None,
                        ms => {
                            let limit = Duration::from_millis(ms);
                            match limit.checked_sub(started.elapsed()) {
                                Some(left) if !left.is_zero() => Some(left),
                                _ => return Err(self.record(timeout_error())),
                            }
                        }
                    };
                    match self.io(dirs, |t| t.wait(dirs, timeout)) {
                        Ok(true) | Err(Halt::Block(_)) => continue,
                        Ok(false) => return Err(self.record(timeout_error())),
                        Err(Halt::Fail(err)) => return Err(self.record(err)),
                    }
                }
            }
        }
    }

    /// Stores a failure as the session's last error and hands it back.
    pub(crate) fn record(&mut self, err: TetherError) -> TetherError {
        debug!(code = err.raw_code(), error = %err, "operation failed");
        self.last_error = Some((err.code(), err.message()));
        err
    }

    fn io<T, F>(&mut self, dirs: BlockDirections, f: F) -> Step<T>
    where
        F: FnOnce(&mut dyn Transport) -> io::Result<T>,
    {
        let transport = self.transport.as_deref_mut().ok_or_else(no_transport)?;
        match f(transport) {
            Ok(value) => Ok(value),
            Err(e) if is_would_block(&e) => Err(Halt::Block(dirs)),
            Err(e) => {
                warn!(error = %e, "transport failure");
                self.state = SessionState::Disconnected;
                Err(Halt::Fail(e.into()))
            }
        }
    }

    pub(crate) fn require_ready(&self) -> Step<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Disconnected => Err(TetherError::connection_closed().into()),
            _ => Err(TetherError::invalid_use("session handshake has not completed").into()),
        }
    }

    /// Queues a payload behind everything already queued.
    ///
    /// Once queued a payload counts as sent; callers record that before
    /// flushing so a retry never queues it twice.
    pub(crate) fn queue(&mut self, payload: Vec<u8>) {
        self.outbound.push_back(payload);
    }

    /// Sends queued payloads in order.
    pub(crate) fn flush(&mut self) -> Step<()> {
        while let Some(payload) = self.outbound.pop_front() {
            if let Err(halt) = self.io(BlockDirections::Outbound, |t| t.send(&payload)) {
                if matches!(halt, Halt::Block(_)) {
                    self.outbound.push_front(payload);
                }
                return Err(halt);
            }
            trace!(msg = ?MessageType::peek(&payload), len = payload.len(), "sent");
        }
        Ok(())
    }

    /// Flushes, treating a full transport as success; the data stays queued.
    pub(crate) fn flush_lazy(&mut self) -> Step<()> {
        match self.flush() {
            Err(Halt::Block(_)) => Ok(()),
            other => other,
        }
    }

    /// Receives one payload and handles connection-level traffic.
    ///
    /// Returns the payload when it belongs to the running operation
    /// (service, authentication, key exchange).
    pub(crate) fn pump(&mut self) -> Step<Option<Vec<u8>>> {
        let outbound_blocked = match self.flush() {
            Ok(()) => false,
            Err(Halt::Block(_)) => true,
            Err(fail) => return Err(fail),
        };
        let payload = match self.io(BlockDirections::Inbound, |t| t.receive()) {
            Ok(payload) => payload,
            Err(Halt::Block(_)) if outbound_blocked => return Err(Halt::Block(BlockDirections::Both)),
            Err(halt) => return Err(halt),
        };
        self.dispatch(payload)
    }

    /// Pumps one packet for an operation that expects no unclaimed traffic.
    pub(crate) fn pump_connection(&mut self) -> Step<()> {
        if let Some(payload) = self.pump()? {
            warn!(msg = ?MessageType::peek(&payload), "dropping unexpected message");
        }
        Ok(())
    }

    /// Handles whatever is already readable without waiting for more.
    pub(crate) fn drain(&mut self) -> Step<()> {
        loop {
            match self.pump_connection() {
                Ok(()) => continue,
                Err(Halt::Block(_)) => return Ok(()),
                Err(fail) => return Err(fail),
            }
        }
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> Step<Option<Vec<u8>>> {
        let Some(&msg) = payload.first() else {
            return Err(TetherError::protocol("received an empty payload").into());
        };
        trace!(msg, len = payload.len(), "received");

        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                let mut r = Reader::new(&payload[1..]);
                let reason = r.u32().unwrap_or(0);
                let description = r.string().unwrap_or_default();
                info!(reason, %description, "server disconnected");
                self.state = SessionState::Disconnected;
                Err(TetherError::transport(
                    TransportFailure::Disconnect,
                    format!("server disconnected (reason {}): {}", reason, description),
                )
                .into())
            }
            Some(MessageType::Ignore | MessageType::Debug | MessageType::Unimplemented) => Ok(None),
            Some(MessageType::GlobalRequest) => {
                let (name, want_reply) = parse_global_request(&payload)?;
                debug!(request = %name, want_reply, "refusing global request");
                if want_reply {
                    self.queue(vec![MessageType::RequestFailure as u8]);
                }
                Ok(None)
            }
            Some(MessageType::RequestSuccess | MessageType::RequestFailure) => {
                let success = msg == MessageType::RequestSuccess as u8;
                self.global_reply(success, &payload[1..]);
                Ok(None)
            }
            Some(MessageType::ChannelOpen) => {
                self.inbound_open(&payload)?;
                Ok(None)
            }
            Some(kind) if kind.is_channel_message() => {
                let message = ChannelMessage::parse(&payload)?;
                self.channel_dispatch(message)?;
                Ok(None)
            }
            _ => Ok(Some(payload)),
        }
    }

    /// Queues a global request; replies are matched to it in order.
    pub(crate) fn send_global(&mut self, request: &GlobalRequest, want_reply: bool, kind: GlobalKind) {
        self.queue(request.to_bytes(want_reply));
        if want_reply {
            self.outstanding_global.push_back(kind);
        }
    }

    fn global_reply(&mut self, success: bool, body: &[u8]) {
        match self.outstanding_global.pop_front() {
            Some(GlobalKind::Keepalive) => self.keepalive.answered(),
            Some(GlobalKind::Forward) => {
                let port = Reader::new(body).u32().ok();
                match self.pending_forward.as_mut() {
                    Some(forward) => forward.reply = Some(if success { Ok(port) } else { Err(()) }),
                    None => debug!("forward reply after the request was abandoned"),
                }
            }
            None => warn!(success, "global reply with no outstanding request"),
        }
    }

    pub(crate) fn allocate_channel_id(&mut self) -> u32 {
        loop {
            let id = self.next_channel_id;
            self.next_channel_id = self.next_channel_id.wrapping_add(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn allocate_listener_id(&mut self) -> u32 {
        let id = self.next_listener_id;
        self.next_listener_id = self.next_listener_id.wrapping_add(1);
        id
    }

    /// Runs the handshake from wherever it stopped.
    pub(crate) fn handshake(&mut self) -> Step<()> {
        match self.state {
            SessionState::Ready => {
                return Err(TetherError::invalid_use("handshake already completed").into())
            }
            SessionState::Disconnected => return Err(TetherError::connection_closed().into()),
            _ => {}
        }
        if self.transport.is_none() {
            return Err(no_transport().into());
        }

        if let HandshakeStep::Start = self.handshake {
            // Preferences are checked before any I/O so a bad list can be fixed.
            let client = self.config.preferences.kexinit(self.config.compress)?;
            self.handshake = HandshakeStep::Banner { client };
            self.state = SessionState::Handshaking;
            debug!("handshake started");
        }

        let result = self.handshake_steps();
        if let Err(Halt::Fail(_)) = result {
            self.state = SessionState::Disconnected;
        }
        result
    }

    fn handshake_steps(&mut self) -> Step<()> {
        loop {
            match std::mem::replace(&mut self.handshake, HandshakeStep::Start) {
                HandshakeStep::Start => return Ok(()),
                HandshakeStep::Banner { client } => {
                    let ours = self.config.banner.clone();
                    let remote = match self.io(BlockDirections::Both, |t| t.exchange_banner(&ours)) {
                        Ok(remote) => remote,
                        Err(halt) => {
                            self.handshake = HandshakeStep::Banner { client };
                            return Err(halt);
                        }
                    };
                    let remote = remote.trim_end().to_string();
                    if !(remote.starts_with("SSH-2.0-") || remote.starts_with("SSH-1.99-")) {
                        return Err(TetherError::Protocol {
                            code: ErrorCode::BannerRecv,
                            message: format!("unsupported server identification '{}'", remote),
                        }
                        .into());
                    }
                    debug!(remote = %remote, "banner exchanged");
                    self.remote_banner = Some(remote);
                    self.handshake = HandshakeStep::SendKexInit { client };
                }
                HandshakeStep::SendKexInit { client } => {
                    let client_bytes = client.to_bytes();
                    self.queue(client_bytes.clone());
                    self.handshake = HandshakeStep::RecvKexInit {
                        client,
                        client_bytes,
                    };
                }
                HandshakeStep::RecvKexInit {
                    client,
                    client_bytes,
                } => {
                    let payload = match self.pump() {
                        Ok(Some(payload)) => payload,
                        Ok(None) => {
                            self.handshake = HandshakeStep::RecvKexInit {
                                client,
                                client_bytes,
                            };
                            continue;
                        }
                        Err(halt) => {
                            self.handshake = HandshakeStep::RecvKexInit {
                                client,
                                client_bytes,
                            };
                            return Err(halt);
                        }
                    };
                    if MessageType::peek(&payload) != Some(MessageType::KexInit) {
                        return Err(TetherError::protocol(format!(
                            "expected KEXINIT, got message {}",
                            payload[0]
                        ))
                        .into());
                    }
                    let server = KexInit::from_bytes(&payload)?;
                    let methods = negotiate(&client, &server)?;
                    let ctx = KexContext {
                        client_banner: self.config.banner.clone(),
                        server_banner: self.remote_banner.clone().unwrap_or_default(),
                        client_kexinit: client_bytes,
                        server_kexinit: payload,
                        methods,
                    };
                    self.handshake = HandshakeStep::KeyExchange(Box::new(ctx));
                }
                HandshakeStep::KeyExchange(ctx) => {
                    let outcome = match self
                        .flush()
                        .and_then(|_| self.io(BlockDirections::Both, |t| t.key_exchange(&ctx)))
                    {
                        Ok(outcome) => outcome,
                        Err(halt) => {
                            self.handshake = HandshakeStep::KeyExchange(ctx);
                            return Err(halt);
                        }
                    };
                    let host_key = HostKey::from_blob(outcome.host_key);
                    info!(
                        server = self.remote_banner.as_deref().unwrap_or(""),
                        host_key = host_key.name(),
                        sha256 = %host_key.fingerprint(HashType::Sha256),
                        "handshake complete"
                    );
                    self.host_key = Some(host_key);
                    self.session_id = outcome.session_id;
                    self.negotiated = Some(ctx.methods);
                    self.state = SessionState::Ready;
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> Step<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        if self.transport.is_none() {
            self.state = SessionState::Disconnected;
            return Ok(());
        }
        if !self.disconnect_queued {
            self.queue(
                Writer::message(MessageType::Disconnect as u8)
                    .u32(reason as u32)
                    .string(description)
                    .string("")
                    .finish(),
            );
            self.disconnect_queued = true;
        }
        self.flush()?;
        if let Some(transport) = self.transport.as_deref_mut() {
            if let Err(e) = transport.shutdown() {
                debug!(error = %e, "transport shutdown failed");
            }
        }
        self.state = SessionState::Disconnected;
        info!(?reason, "disconnected");
        Ok(())
    }
}

fn no_transport() -> TetherError {
    TetherError::transport(TransportFailure::Socket, "no transport set")
}

fn timeout_error() -> TetherError {
    TetherError::Timeout {
        code: ErrorCode::Timeout,
        message: "timed out waiting for the transport".to_string(),
    }
}

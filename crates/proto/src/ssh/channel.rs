//! SSH channels.
//!
//! A [`Channel`] is a handle: the per-channel state machine lives in the
//! session so that traffic for every channel can be dispatched by whichever
//! operation happens to read it. Handles hold a weak reference to the session
//! and fail with a connection-closed error once it is gone.
//!
//! Flow control follows RFC 4254 Section 5.2. Inbound data is limited by the
//! window we advertised; consumed bytes are credited back with
//! WINDOW_ADJUST once less than half of the window is left. Outbound writes
//! are limited by the peer's window and maximum packet size.

use crate::ssh::connection::{
    ChannelMessage, ChannelOpen, ChannelRequest, ChannelRequestType, ChannelType, PtyDimensions,
    EXTENDED_DATA_STDERR,
};
use crate::ssh::nonblocking::{find_eol, Halt, Progress, Step};
use crate::ssh::session::inner::{upgrade, SessionInner, WeakSession};
use std::collections::VecDeque;
use std::io;
use tether_platform::{ChannelFailure, ErrorKind, TetherError, TetherResult, TransportFailure};
use tracing::{debug, trace, warn};

/// Stream id of the regular data stream.
pub const STREAM_DATA: u32 = 0;

/// Stream id of stderr.
pub const STREAM_STDERR: u32 = EXTENDED_DATA_STDERR;

/// What to do with inbound extended data (stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendedData {
    /// Buffer it separately; read with [`Channel::read_stderr`]
    #[default]
    Normal,
    /// Discard it, crediting the window immediately
    Ignore,
    /// Append it to the regular data stream
    Merge,
}

/// How the remote process was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub signal: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message from the server
    pub message: String,
    /// Language tag of the message
    pub language: String,
}

/// Kind of channel being opened; only one open may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenKind {
    Session,
    DirectTcpip,
    Scp,
    Sftp,
}

#[derive(Debug)]
pub(crate) struct PendingOpen {
    kind: OpenKind,
    local_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenState {
    Opening,
    Open,
    Refused(String),
}

/// Progress of a one-shot message (EOF, CLOSE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Once {
    NotSent,
    Queued,
    Sent,
}

pub(crate) struct ChannelState {
    local_id: u32,
    remote_id: u32,
    open: OpenState,
    local_window: u32,
    local_window_initial: u32,
    local_packet: u32,
    unacked: u32,
    remote_window: u32,
    remote_packet: u32,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    eof_received: bool,
    close_received: bool,
    eof: Once,
    close: Once,
    exit_status: Option<i32>,
    exit_signal: Option<ExitSignal>,
    request: Option<String>,
    reply: Option<bool>,
    started: bool,
    extended: ExtendedData,
}

impl ChannelState {
    fn opening(local_id: u32, window: u32, packet: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            open: OpenState::Opening,
            local_window: window,
            local_window_initial: window,
            local_packet: packet,
            unacked: 0,
            remote_window: 0,
            remote_packet: 0,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            eof_received: false,
            close_received: false,
            eof: Once::NotSent,
            close: Once::NotSent,
            exit_status: None,
            exit_signal: None,
            request: None,
            reply: None,
            started: false,
            extended: ExtendedData::Normal,
        }
    }

    /// State for a channel the server opened and we accepted.
    pub(crate) fn accepted(local_id: u32, open: &ChannelOpen, window: u32, packet: u32) -> Self {
        let mut state = Self::opening(local_id, window, packet);
        state.remote_id = open.sender_channel();
        state.remote_window = open.initial_window_size();
        state.remote_packet = open.maximum_packet_size();
        state.open = OpenState::Open;
        state
    }

    fn writable(&self) -> TetherResult<()> {
        if self.close != Once::NotSent || self.close_received {
            return Err(TetherError::channel(ChannelFailure::Closed, "channel is closed"));
        }
        Ok(())
    }

    fn buffer(&mut self, stream: u32) -> TetherResult<&mut VecDeque<u8>> {
        match stream {
            STREAM_DATA => Ok(&mut self.stdout),
            STREAM_STDERR => Ok(&mut self.stderr),
            other => Err(TetherError::invalid_argument(format!("unknown stream {}", other))),
        }
    }

    fn receive(&mut self, data_type: Option<u32>, data: Vec<u8>) -> TetherResult<()> {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if len > self.local_packet {
            return Err(TetherError::channel(
                ChannelFailure::PacketExceeded,
                format!(
                    "channel {}: {} bytes exceed the {} byte packet limit",
                    self.local_id, len, self.local_packet
                ),
            ));
        }
        if len > self.local_window {
            return Err(TetherError::channel(
                ChannelFailure::WindowExceeded,
                format!(
                    "channel {}: {} bytes exceed the {} byte window",
                    self.local_id, len, self.local_window
                ),
            ));
        }
        self.local_window -= len;

        if self.eof_received {
            warn!(channel = self.local_id, len, "data after EOF dropped");
            self.unacked += len;
            return Ok(());
        }
        match (data_type, self.extended) {
            (None, _) | (Some(EXTENDED_DATA_STDERR), ExtendedData::Merge) => {
                self.stdout.extend(data)
            }
            (Some(EXTENDED_DATA_STDERR), ExtendedData::Normal) => self.stderr.extend(data),
            (Some(other), _) => {
                trace!(channel = self.local_id, data_type = other, len, "extended data discarded");
                self.unacked += len;
            }
        }
        Ok(())
    }

    fn request_reply(&mut self, success: bool) {
        if self.request.is_some() {
            self.reply = Some(success);
        } else {
            warn!(channel = self.local_id, success, "request reply with nothing pending");
        }
    }

    /// WINDOW_ADJUST returning consumed bytes, once the window is below half.
    fn window_credit(&mut self) -> Option<Vec<u8>> {
        if self.unacked == 0
            || self.local_window >= self.local_window_initial / 2
            || self.close != Once::NotSent
            || self.close_received
        {
            return None;
        }
        let bytes_to_add = self.unacked;
        self.local_window = self.local_window.saturating_add(bytes_to_add);
        self.unacked = 0;
        trace!(channel = self.local_id, bytes_to_add, "window adjust");
        Some(
            ChannelMessage::WindowAdjust {
                recipient: self.remote_id,
                bytes_to_add,
            }
            .to_bytes(),
        )
    }
}

fn unknown_channel(id: u32) -> TetherError {
    TetherError::channel(ChannelFailure::Unknown, format!("no channel {}", id))
}

impl SessionInner {
    fn channel_mut(&mut self, id: u32) -> Step<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| unknown_channel(id).into())
    }

    /// Routes channel-addressed traffic to its channel.
    pub(crate) fn channel_dispatch(&mut self, message: ChannelMessage) -> Step<()> {
        let id = message.recipient();
        let Some(ch) = self.channels.get_mut(&id) else {
            warn!(channel = id, "message for unknown channel dropped");
            return Ok(());
        };

        let mut reply = None;
        match message {
            ChannelMessage::OpenConfirmation(confirm) => {
                if ch.open == OpenState::Opening {
                    ch.remote_id = confirm.sender_channel;
                    ch.remote_window = confirm.initial_window_size;
                    ch.remote_packet = confirm.maximum_packet_size;
                    ch.open = OpenState::Open;
                    debug!(channel = id, remote = ch.remote_id, "channel open confirmed");
                } else {
                    warn!(channel = id, "unexpected open confirmation");
                }
            }
            ChannelMessage::OpenFailure(failure) => {
                if ch.open == OpenState::Opening {
                    debug!(channel = id, reason = failure.reason_code, "channel open refused");
                    ch.open = OpenState::Refused(failure.reason());
                }
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                ch.remote_window = ch.remote_window.saturating_add(bytes_to_add);
            }
            ChannelMessage::Data { data, .. } => {
                ch.receive(None, data)?;
                reply = ch.window_credit();
            }
            ChannelMessage::ExtendedData {
                data_type, data, ..
            } => {
                ch.receive(Some(data_type), data)?;
                reply = ch.window_credit();
            }
            ChannelMessage::Eof { .. } => {
                debug!(channel = id, "remote EOF");
                ch.eof_received = true;
            }
            ChannelMessage::Close { .. } => {
                debug!(channel = id, "remote close");
                ch.eof_received = true;
                ch.close_received = true;
            }
            ChannelMessage::Request(request) => match request.request_type {
                ChannelRequestType::ExitStatus { exit_status } => {
                    ch.exit_status = Some(exit_status as i32);
                }
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    language_tag,
                } => {
                    ch.exit_signal = Some(ExitSignal {
                        signal: signal_name,
                        core_dumped,
                        message: error_message,
                        language: language_tag,
                    });
                }
                other => {
                    debug!(channel = id, request = other.name(), "refusing channel request");
                    if request.want_reply {
                        reply = Some(
                            ChannelMessage::Failure {
                                recipient: ch.remote_id,
                            }
                            .to_bytes(),
                        );
                    }
                }
            },
            ChannelMessage::Success { .. } => ch.request_reply(true),
            ChannelMessage::Failure { .. } => ch.request_reply(false),
        }

        if let Some(payload) = reply {
            self.queue(payload);
        }
        Ok(())
    }

    /// Opens a channel, resuming an open of the same kind.
    pub(crate) fn open_channel<F>(&mut self, kind: OpenKind, channel_type: F) -> Step<u32>
    where
        F: FnOnce() -> ChannelType,
    {
        let id = match &self.pending_open {
            Some(pending) if pending.kind != kind => {
                return Err(TetherError::invalid_use(format!(
                    "a {:?} channel open is in progress",
                    pending.kind
                ))
                .into())
            }
            Some(pending) => pending.local_id,
            None => {
                self.require_ready()?;
                let id = self.allocate_channel_id();
                let (window, packet) = (self.config.window_size, self.config.packet_size);
                self.channels
                    .insert(id, ChannelState::opening(id, window, packet));
                let open = ChannelOpen::new(channel_type(), id, window, packet);
                debug!(channel = id, kind = open.channel_type().name(), "opening channel");
                self.queue(open.to_bytes());
                self.pending_open = Some(PendingOpen { kind, local_id: id });
                id
            }
        };

        let result = self.await_open(id);
        if !matches!(result, Err(Halt::Block(_))) {
            self.pending_open = None;
            if result.is_err() {
                self.channels.remove(&id);
            }
        }
        result.map(|_| id)
    }

    fn await_open(&mut self, id: u32) -> Step<()> {
        loop {
            match &self.channel_mut(id)?.open {
                OpenState::Open => return Ok(()),
                OpenState::Refused(reason) => {
                    return Err(TetherError::channel(
                        ChannelFailure::Failure,
                        format!("channel open refused: {}", reason),
                    )
                    .into())
                }
                OpenState::Opening => {}
            }
            self.pump_connection()?;
        }
    }

    /// Sends a request and, when `want_reply`, waits for the answer.
    pub(crate) fn channel_request(
        &mut self,
        id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> Step<()> {
        let ch = self.channel_mut(id)?;
        ch.writable()?;
        let name = request.name().to_string();
        match ch.request.clone() {
            Some(pending) if pending != name => {
                return Err(TetherError::invalid_use(format!(
                    "channel request '{}' is in progress",
                    pending
                ))
                .into())
            }
            Some(_) => {}
            None => {
                let payload = ChannelRequest::new(ch.remote_id, request, want_reply).to_bytes();
                debug!(channel = id, request = %name, want_reply, "channel request");
                if want_reply {
                    ch.request = Some(name.clone());
                    ch.reply = None;
                }
                self.queue(payload);
                if !want_reply {
                    return self.flush_lazy();
                }
            }
        }

        loop {
            let ch = self.channel_mut(id)?;
            if let Some(accepted) = ch.reply.take() {
                ch.request = None;
                if accepted {
                    // A terminal carries stderr on the normal stream.
                    if name == "pty-req" && ch.extended == ExtendedData::Normal {
                        ch.extended = ExtendedData::Merge;
                    }
                    return Ok(());
                }
                return Err(TetherError::channel(
                    ChannelFailure::RequestDenied,
                    "channel request denied",
                )
                .into());
            }
            if ch.close_received {
                ch.request = None;
                return Err(TetherError::channel(
                    ChannelFailure::Closed,
                    "channel closed while a request was pending",
                )
                .into());
            }
            self.pump_connection()?;
        }
    }

    /// Starts the remote process; only once per channel.
    pub(crate) fn channel_start(&mut self, id: u32, request: ChannelRequestType) -> Step<()> {
        let ch = self.channel_mut(id)?;
        if ch.started && ch.request.as_deref() != Some(request.name()) {
            return Err(TetherError::invalid_use("channel process already started").into());
        }
        let result = self.channel_request(id, request, true);
        if let Some(ch) = self.channels.get_mut(&id) {
            // Started once the request is on its way, unless the peer denied it.
            ch.started = match &result {
                Ok(()) | Err(Halt::Block(_)) => true,
                Err(Halt::Fail(TetherError::Channel {
                    kind: ChannelFailure::RequestDenied,
                    ..
                })) => false,
                Err(Halt::Fail(_)) => ch.started,
            };
        }
        result
    }

    pub(crate) fn channel_setenv(&mut self, id: u32, name: &str, value: &str) -> Step<()> {
        if self.channel_mut(id)?.started {
            return Err(TetherError::invalid_use(
                "environment must be set before the process starts",
            )
            .into());
        }
        let request = ChannelRequestType::Env {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.channel_request(id, request, true)
    }

    pub(crate) fn channel_read(&mut self, id: u32, stream: u32, buf: &mut [u8]) -> Step<usize> {
        loop {
            let ch = self.channel_mut(id)?;
            let queue = ch.buffer(stream)?;
            if !queue.is_empty() && !buf.is_empty() {
                let n = buf.len().min(queue.len());
                for (dst, src) in buf.iter_mut().zip(queue.drain(..n)) {
                    *dst = src;
                }
                ch.unacked += n as u32;
                if let Some(adjust) = ch.window_credit() {
                    self.queue(adjust);
                    self.flush_lazy()?;
                }
                return Ok(n);
            }
            if buf.is_empty() || ch.eof_received || ch.close_received {
                return Ok(0);
            }
            self.require_ready()?;
            self.pump_connection()?;
        }
    }

    /// Reads one line from the data stream, without its terminator.
    pub(crate) fn channel_read_line(&mut self, id: u32, max: usize) -> Step<Vec<u8>> {
        loop {
            let ch = self.channel_mut(id)?;
            let buffered = ch.stdout.make_contiguous();
            if let Some((len, sep)) = find_eol(buffered, 0) {
                let line = buffered[..len].to_vec();
                ch.stdout.drain(..len + sep);
                ch.unacked += (len + sep) as u32;
                if let Some(adjust) = ch.window_credit() {
                    self.queue(adjust);
                }
                return Ok(line);
            }
            if ch.stdout.len() > max {
                return Err(TetherError::Scp {
                    message: format!("line longer than {} bytes", max),
                }
                .into());
            }
            if ch.eof_received || ch.close_received {
                return Err(TetherError::Scp {
                    message: "channel ended in the middle of a line".to_string(),
                }
                .into());
            }
            self.require_ready()?;
            self.pump_connection()?;
        }
    }

    pub(crate) fn channel_write(&mut self, id: u32, stream: u32, data: &[u8]) -> Step<usize> {
        {
            let ch = self.channel_mut(id)?;
            ch.writable()?;
            if ch.eof != Once::NotSent {
                return Err(TetherError::channel(
                    ChannelFailure::EofSent,
                    "EOF already sent on this channel",
                )
                .into());
            }
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.require_ready()?;
        self.flush()?;

        loop {
            let ch = self.channel_mut(id)?;
            if ch.close_received {
                return Err(TetherError::channel(
                    ChannelFailure::Closed,
                    "channel closed by the server",
                )
                .into());
            }
            if ch.remote_window > 0 {
                let limit = ch.remote_window.min(ch.remote_packet.max(1)) as usize;
                let n = data.len().min(limit);
                ch.remote_window -= n as u32;
                let recipient = ch.remote_id;
                let message = if stream == STREAM_DATA {
                    ChannelMessage::Data {
                        recipient,
                        data: data[..n].to_vec(),
                    }
                } else {
                    ChannelMessage::ExtendedData {
                        recipient,
                        data_type: stream,
                        data: data[..n].to_vec(),
                    }
                };
                self.queue(message.to_bytes());
                self.flush_lazy()?;
                return Ok(n);
            }
            self.pump_connection()?;
        }
    }

    /// Writes all of `data`, keeping the offset in `sent` across retries.
    pub(crate) fn channel_write_all(&mut self, id: u32, data: &[u8], sent: &mut usize) -> Step<()> {
        while *sent < data.len() {
            *sent += self.channel_write(id, STREAM_DATA, &data[*sent..])?;
        }
        self.flush()
    }

    pub(crate) fn channel_send_eof(&mut self, id: u32) -> Step<()> {
        let ch = self.channel_mut(id)?;
        match ch.eof {
            Once::Sent => {
                return Err(TetherError::channel(
                    ChannelFailure::EofSent,
                    "EOF already sent on this channel",
                )
                .into())
            }
            Once::NotSent => {
                ch.writable()?;
                let payload = ChannelMessage::Eof {
                    recipient: ch.remote_id,
                }
                .to_bytes();
                ch.eof = Once::Queued;
                self.queue(payload);
                debug!(channel = id, "EOF sent");
            }
            Once::Queued => {}
        }
        self.flush()?;
        self.channel_mut(id)?.eof = Once::Sent;
        Ok(())
    }

    pub(crate) fn channel_wait_eof(&mut self, id: u32) -> Step<()> {
        loop {
            let ch = self.channel_mut(id)?;
            if ch.eof_received || ch.close_received {
                return Ok(());
            }
            self.require_ready()?;
            self.pump_connection()?;
        }
    }

    pub(crate) fn channel_close(&mut self, id: u32) -> Step<()> {
        let ch = self.channel_mut(id)?;
        match ch.close {
            Once::Sent => {
                return Err(TetherError::channel(
                    ChannelFailure::Closed,
                    "channel already closed",
                )
                .into())
            }
            Once::NotSent => {
                let payload = ChannelMessage::Close {
                    recipient: ch.remote_id,
                }
                .to_bytes();
                ch.close = Once::Queued;
                self.queue(payload);
                debug!(channel = id, "close sent");
            }
            Once::Queued => {}
        }
        self.flush()?;
        self.channel_mut(id)?.close = Once::Sent;
        Ok(())
    }

    pub(crate) fn channel_wait_closed(&mut self, id: u32) -> Step<()> {
        if self.channel_mut(id)?.close == Once::NotSent {
            return Err(TetherError::invalid_use("close() must be called before wait_closed()").into());
        }
        self.flush()?;
        loop {
            if self.channel_mut(id)?.close_received {
                return Ok(());
            }
            self.require_ready()?;
            self.pump_connection()?;
        }
    }

    pub(crate) fn channel_flush_stream(&mut self, id: u32, stream: u32) -> Step<usize> {
        let ch = self.channel_mut(id)?;
        let queue = ch.buffer(stream)?;
        let discarded = queue.len();
        queue.clear();
        ch.unacked += discarded as u32;
        if let Some(adjust) = ch.window_credit() {
            self.queue(adjust);
            self.flush_lazy()?;
        }
        Ok(discarded)
    }

    /// Forgets a channel, sending CLOSE first unless it already went out.
    pub(crate) fn channel_release(&mut self, id: u32) {
        let Some(ch) = self.channels.remove(&id) else {
            return;
        };
        // A peer that closed first still waits for our CLOSE.
        if ch.open == OpenState::Open && ch.close == Once::NotSent && self.require_ready().is_ok()
        {
            self.queue(
                ChannelMessage::Close {
                    recipient: ch.remote_id,
                }
                .to_bytes(),
            );
            if let Err(Halt::Fail(err)) = self.flush_lazy() {
                debug!(channel = id, error = %err, "close on release failed");
            }
        }
        debug!(channel = id, "channel released");
    }
}

/// A logical stream multiplexed over the session.
///
/// Every I/O method follows the would-block contract: a
/// [`Progress::WouldBlock`] result keeps all progress and the same call can
/// be repeated once the transport is ready.
pub struct Channel {
    session: WeakSession,
    id: u32,
}

impl Channel {
    pub(crate) fn new(session: WeakSession, id: u32) -> Self {
        Self { session, id }
    }

    /// Local channel number.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn drive<T, F>(&self, mut op: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut SessionInner, u32) -> Step<T>,
    {
        let session = upgrade(&self.session)?;
        let mut inner = session.lock();
        let id = self.id;
        inner.run(|s| op(s, id))
    }

    fn inspect<T, F>(&self, f: F) -> TetherResult<T>
    where
        F: FnOnce(&ChannelState) -> T,
    {
        let session = upgrade(&self.session)?;
        let inner = session.lock();
        inner
            .channels
            .get(&self.id)
            .map(f)
            .ok_or_else(|| unknown_channel(self.id))
    }

    /// Runs a command.
    pub fn exec(&mut self, command: &str) -> TetherResult<Progress<()>> {
        self.process_startup("exec", Some(command))
    }

    /// Starts the user's shell.
    pub fn shell(&mut self) -> TetherResult<Progress<()>> {
        self.process_startup("shell", None)
    }

    /// Starts a subsystem such as `sftp`.
    pub fn subsystem(&mut self, name: &str) -> TetherResult<Progress<()>> {
        self.process_startup("subsystem", Some(name))
    }

    /// Sends a start request by name. Only one start is allowed per channel.
    pub fn process_startup(
        &mut self,
        request: &str,
        message: Option<&str>,
    ) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_start(id, ChannelRequestType::startup(request, message)))
    }

    /// Sets an environment variable for the process; must precede the start.
    pub fn setenv(&mut self, name: &str, value: &str) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_setenv(id, name, value))
    }

    /// Requests a pseudo-terminal.
    pub fn request_pty(
        &mut self,
        term: &str,
        modes: Option<&[u8]>,
        dimensions: Option<PtyDimensions>,
    ) -> TetherResult<Progress<()>> {
        let request = ChannelRequestType::PtyReq {
            term: term.to_string(),
            dimensions: dimensions.unwrap_or(PtyDimensions::chars(80, 24)),
            modes: modes.map(<[u8]>::to_vec).unwrap_or_default(),
        };
        self.drive(|s, id| s.channel_request(id, request.clone(), true))
    }

    /// Tells the server the terminal was resized.
    pub fn request_pty_size(&mut self, width: u32, height: u32) -> TetherResult<Progress<()>> {
        let request = ChannelRequestType::WindowChange {
            dimensions: PtyDimensions::chars(width, height),
        };
        self.drive(|s, id| s.channel_request(id, request.clone(), false))
    }

    /// Requests agent forwarding.
    pub fn request_auth_agent(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_request(id, ChannelRequestType::AuthAgent, true))
    }

    /// Reads from the data stream. `Complete(0)` means EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> TetherResult<Progress<usize>> {
        self.read_ex(STREAM_DATA, buf)
    }

    /// Reads from stderr. `Complete(0)` means EOF.
    pub fn read_stderr(&mut self, buf: &mut [u8]) -> TetherResult<Progress<usize>> {
        self.read_ex(STREAM_STDERR, buf)
    }

    /// Reads from a stream by id.
    pub fn read_ex(&mut self, stream: u32, buf: &mut [u8]) -> TetherResult<Progress<usize>> {
        self.drive(|s, id| s.channel_read(id, stream, buf))
    }

    /// Writes to the data stream, returning the bytes accepted.
    pub fn write(&mut self, data: &[u8]) -> TetherResult<Progress<usize>> {
        self.write_ex(STREAM_DATA, data)
    }

    /// Writes to stderr.
    pub fn write_stderr(&mut self, data: &[u8]) -> TetherResult<Progress<usize>> {
        self.write_ex(STREAM_STDERR, data)
    }

    /// Writes to a stream by id. Accepted bytes are committed.
    pub fn write_ex(&mut self, stream: u32, data: &[u8]) -> TetherResult<Progress<usize>> {
        self.drive(|s, id| s.channel_write(id, stream, data))
    }

    /// Discards buffered inbound data of one stream, returning how much.
    pub fn flush_ex(&mut self, stream: u32) -> TetherResult<Progress<usize>> {
        self.drive(|s, id| s.channel_flush_stream(id, stream))
    }

    /// Discards buffered stderr.
    pub fn flush_stderr(&mut self) -> TetherResult<Progress<usize>> {
        self.flush_ex(STREAM_STDERR)
    }

    /// Chooses how stderr is delivered.
    pub fn handle_extended_data(&mut self, mode: ExtendedData) -> TetherResult<()> {
        let session = upgrade(&self.session)?;
        let mut inner = session.lock();
        let ch = inner
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| unknown_channel(self.id))?;
        ch.extended = mode;
        if mode != ExtendedData::Normal {
            let moved = std::mem::take(&mut ch.stderr);
            if mode == ExtendedData::Merge {
                ch.stdout.extend(moved);
            } else {
                ch.unacked += moved.len() as u32;
            }
        }
        Ok(())
    }

    /// Tells the server no more data will be sent.
    pub fn send_eof(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_send_eof(id))
    }

    /// Waits for the server's EOF.
    pub fn wait_eof(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_wait_eof(id))
    }

    /// True once the server sent EOF and the data stream is drained.
    pub fn eof(&self) -> TetherResult<bool> {
        self.inspect(|ch| (ch.eof_received || ch.close_received) && ch.stdout.is_empty())
    }

    /// Sends CLOSE. Follow with [`Channel::wait_closed`].
    pub fn close(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_close(id))
    }

    /// Waits for the server's CLOSE.
    pub fn wait_closed(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|s, id| s.channel_wait_closed(id))
    }

    /// Exit status of the remote process, if reported.
    pub fn exit_status(&self) -> TetherResult<Option<i32>> {
        self.inspect(|ch| ch.exit_status)
    }

    /// Signal that ended the remote process, if reported.
    pub fn exit_signal(&self) -> TetherResult<Option<ExitSignal>> {
        self.inspect(|ch| ch.exit_signal.clone())
    }

    /// Inbound window: bytes the server may still send, and the initial size.
    pub fn window_read(&self) -> TetherResult<(u32, u32)> {
        self.inspect(|ch| (ch.local_window, ch.local_window_initial))
    }

    /// Outbound window: bytes we may still send.
    pub fn window_write(&self) -> TetherResult<u32> {
        self.inspect(|ch| ch.remote_window)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.lock().channel_release(self.id);
        }
    }
}

/// Converts a would-block aware result into `std::io` terms.
pub(crate) fn into_io<T>(result: TetherResult<Progress<T>>) -> io::Result<T> {
    match result {
        Ok(Progress::Complete(value)) => Ok(value),
        Ok(Progress::WouldBlock(_)) => Err(io::ErrorKind::WouldBlock.into()),
        Err(err) => {
            let kind = match err.kind() {
                ErrorKind::Timeout => io::ErrorKind::TimedOut,
                ErrorKind::TransportIo(TransportFailure::Disconnect) => {
                    io::ErrorKind::ConnectionAborted
                }
                ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
                _ => io::ErrorKind::Other,
            };
            Err(io::Error::new(kind, err))
        }
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        into_io(Channel::read(self, buf))
    }
}

impl io::Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        into_io(Channel::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        into_io(self.drive(|s, _| s.flush()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_state(window: u32, packet: u32) -> ChannelState {
        let open = ChannelOpen::new(ChannelType::Session, 9, 1000, 100);
        ChannelState::accepted(1, &open, window, packet)
    }

    #[test]
    fn test_accepted_takes_peer_limits() {
        let ch = open_state(64, 32);
        assert_eq!(ch.remote_id, 9);
        assert_eq!(ch.remote_window, 1000);
        assert_eq!(ch.remote_packet, 100);
        assert_eq!(ch.open, OpenState::Open);
    }

    #[test]
    fn test_receive_over_window() {
        let mut ch = open_state(10, 32);
        ch.receive(None, vec![0; 8]).unwrap();
        let err = ch.receive(None, vec![0; 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Channel(ChannelFailure::WindowExceeded));
    }

    #[test]
    fn test_receive_over_packet_size() {
        let mut ch = open_state(1000, 16);
        let err = ch.receive(None, vec![0; 17]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Channel(ChannelFailure::PacketExceeded));
    }

    #[test]
    fn test_window_credit_after_half_consumed() {
        let mut ch = open_state(100, 100);
        ch.receive(None, vec![1; 40]).unwrap();
        ch.unacked = 40;
        assert!(ch.window_credit().is_none());
        ch.receive(None, vec![1; 20]).unwrap();
        ch.unacked = 60;
        let adjust = ch.window_credit().unwrap();
        assert_eq!(
            ChannelMessage::parse(&adjust).unwrap(),
            ChannelMessage::WindowAdjust {
                recipient: 9,
                bytes_to_add: 60
            }
        );
        assert_eq!(ch.local_window, 100);
    }

    #[test]
    fn test_extended_data_modes() {
        let mut ch = open_state(100, 100);
        ch.receive(Some(STREAM_STDERR), b"err".to_vec()).unwrap();
        assert_eq!(ch.stderr.len(), 3);

        ch.extended = ExtendedData::Merge;
        ch.receive(Some(STREAM_STDERR), b"more".to_vec()).unwrap();
        assert_eq!(ch.stdout.len(), 4);

        ch.extended = ExtendedData::Ignore;
        ch.receive(Some(STREAM_STDERR), b"gone".to_vec()).unwrap();
        assert_eq!(ch.unacked, 4);
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let mut ch = open_state(100, 100);
        assert_eq!(
            ch.buffer(7).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_into_io_maps_would_block() {
        let err = into_io::<usize>(Ok(Progress::WouldBlock(
            crate::ssh::nonblocking::BlockDirections::Inbound,
        )))
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}

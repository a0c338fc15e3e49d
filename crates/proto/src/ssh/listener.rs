//! Remote port forwarding (RFC 4254 Section 7.1).
//!
//! [`Session::forward_listen`](crate::ssh::session::Session::forward_listen)
//! asks the server to listen on a port. Connections to it arrive as
//! `forwarded-tcpip` channel opens, which are queued on the matching
//! [`Listener`] until accepted.

use crate::ssh::channel::{Channel, ChannelState};
use crate::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelType, GlobalRequest,
};
use crate::ssh::nonblocking::{Halt, Progress, Step};
use crate::ssh::session::inner::{upgrade, GlobalKind, SessionInner, WeakSession};
use std::collections::VecDeque;
use tether_platform::{ChannelFailure, TetherError, TetherResult};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct ListenerState {
    host: String,
    port: u32,
    queue_max: usize,
    queue: VecDeque<u32>,
}

#[derive(Debug)]
pub(crate) struct ForwardProgress {
    host: String,
    port: u32,
    queue_max: usize,
    /// Bound port on success (when the server reports one)
    pub(crate) reply: Option<Result<Option<u32>, ()>>,
}

impl SessionInner {
    /// Handles a CHANNEL_OPEN from the server.
    pub(crate) fn inbound_open(&mut self, payload: &[u8]) -> Step<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let refuse = |reason, text: &str| {
            ChannelOpenFailure::new(open.sender_channel(), reason, text).to_bytes()
        };

        let ChannelType::ForwardedTcpip {
            connected_address,
            connected_port,
            ..
        } = open.channel_type()
        else {
            debug!(kind = open.channel_type().name(), "refusing channel open");
            let failure = refuse(
                ChannelOpenFailureReason::UnknownChannelType,
                "unsupported channel type",
            );
            self.queue(failure);
            return Ok(());
        };

        let target = self.listeners.iter().find_map(|(id, l)| {
            let host_matches = l.host.is_empty() || l.host == *connected_address;
            (l.port == *connected_port && host_matches).then_some(*id)
        });
        let Some(listener_id) = target else {
            warn!(port = connected_port, "forwarded connection for unknown listener");
            let failure = refuse(
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "no listener for that port",
            );
            self.queue(failure);
            return Ok(());
        };

        let full = self
            .listeners
            .get(&listener_id)
            .map_or(true, |l| l.queue.len() >= l.queue_max);
        if full {
            debug!(port = connected_port, "listener queue full");
            let failure = refuse(ChannelOpenFailureReason::ResourceShortage, "queue full");
            self.queue(failure);
            return Ok(());
        }

        let id = self.allocate_channel_id();
        let (window, packet) = (self.config.window_size, self.config.packet_size);
        self.channels
            .insert(id, ChannelState::accepted(id, &open, window, packet));
        self.queue(
            ChannelOpenConfirmation {
                recipient_channel: open.sender_channel(),
                sender_channel: id,
                initial_window_size: window,
                maximum_packet_size: packet,
            }
            .to_bytes(),
        );
        if let Some(listener) = self.listeners.get_mut(&listener_id) {
            listener.queue.push_back(id);
        }
        debug!(channel = id, port = connected_port, "forwarded connection queued");
        Ok(())
    }

    pub(crate) fn forward_listen(&mut self, host: &str, port: u32, queue_max: usize) -> Step<(u32, u32)> {
        match &self.pending_forward {
            Some(p) if p.host != host || p.port != port => {
                return Err(TetherError::invalid_use(format!(
                    "forward request for {}:{} is in progress",
                    p.host, p.port
                ))
                .into())
            }
            Some(_) => {}
            None => {
                self.require_ready()?;
                let request = GlobalRequest::TcpipForward {
                    address: host.to_string(),
                    port,
                };
                self.send_global(&request, true, GlobalKind::Forward);
                self.pending_forward = Some(ForwardProgress {
                    host: host.to_string(),
                    port,
                    queue_max,
                    reply: None,
                });
            }
        }

        let result = self.await_forward();
        if !matches!(result, Err(Halt::Block(_))) {
            self.pending_forward = None;
        }
        result
    }

    fn await_forward(&mut self) -> Step<(u32, u32)> {
        loop {
            let Some(forward) = self.pending_forward.as_mut() else {
                return Err(TetherError::invalid_use("no forward request pending").into());
            };
            match forward.reply.take() {
                Some(Ok(reported)) => {
                    let bound = match (forward.port, reported) {
                        (0, Some(port)) => port,
                        (port, _) => port,
                    };
                    let state = ListenerState {
                        host: forward.host.clone(),
                        port: bound,
                        queue_max: forward.queue_max,
                        queue: VecDeque::new(),
                    };
                    let id = self.allocate_listener_id();
                    info!(host = %state.host, port = bound, "remote forward established");
                    self.listeners.insert(id, state);
                    return Ok((id, bound));
                }
                Some(Err(())) => {
                    return Err(TetherError::channel(
                        ChannelFailure::RequestDenied,
                        "server refused the port forward",
                    )
                    .into())
                }
                None => self.pump_connection()?,
            }
        }
    }

    fn listener_accept(&mut self, listener_id: u32) -> Step<u32> {
        loop {
            let listener = self.listeners.get_mut(&listener_id).ok_or_else(|| {
                TetherError::invalid_use("listener has been cancelled")
            })?;
            if let Some(id) = listener.queue.pop_front() {
                return Ok(id);
            }
            self.require_ready()?;
            self.pump_connection()?;
        }
    }

    /// Stops forwarding and refuses anything still queued.
    fn listener_cancel(&mut self, listener_id: u32) -> Step<()> {
        let Some(listener) = self.listeners.remove(&listener_id) else {
            return Ok(());
        };
        for id in listener.queue {
            self.channel_release(id);
        }
        if self.require_ready().is_ok() {
            let request = GlobalRequest::CancelTcpipForward {
                address: listener.host,
                port: listener.port,
            };
            self.send_global(&request, false, GlobalKind::Forward);
            debug!(port = listener.port, "remote forward cancelled");
        }
        self.flush()
    }
}

/// A port the server listens on for us.
pub struct Listener {
    session: WeakSession,
    id: u32,
    port: u32,
}

impl Listener {
    pub(crate) fn new(session: WeakSession, id: u32, port: u32) -> Self {
        Self { session, id, port }
    }

    /// Port the server bound.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Yields the next forwarded connection as a channel.
    pub fn accept(&mut self) -> TetherResult<Progress<Channel>> {
        let session = upgrade(&self.session)?;
        let id = self.id;
        let progress = session.lock().run(|s| s.listener_accept(id))?;
        Ok(progress.map(|channel_id| Channel::new(self.session.clone(), channel_id)))
    }

    /// Asks the server to stop listening.
    pub fn cancel(&mut self) -> TetherResult<Progress<()>> {
        let session = upgrade(&self.session)?;
        let id = self.id;
        let progress = session.lock().run(|s| s.listener_cancel(id));
        progress
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let mut inner = session.lock();
            if let Err(Halt::Fail(err)) = inner.listener_cancel(self.id) {
                debug!(error = %err, "cancel on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("port", &self.port)
            .finish()
    }
}

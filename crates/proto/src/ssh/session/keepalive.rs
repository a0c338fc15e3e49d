//! SSH keep-alive messages.
//!
//! Keepalives are `keepalive@openssh.com` global requests. Nothing runs in the
//! background: the caller invokes [`Session::keepalive_send`] periodically and
//! uses the returned number of seconds to schedule the next call.
//!
//! [`Session::keepalive_send`]: super::Session::keepalive_send

use super::inner::{GlobalKind, SessionInner};
use crate::ssh::connection::GlobalRequest;
use crate::ssh::nonblocking::Step;
use std::time::{Duration, Instant};
use tether_platform::{ErrorCode, TetherError};
use tracing::{debug, warn};

/// Keepalives that may go unanswered before the connection is declared dead.
pub const MAX_UNANSWERED_KEEPALIVES: u32 = 3;

#[derive(Debug, Default)]
pub(crate) struct KeepaliveState {
    want_reply: bool,
    interval: u32,
    last_sent: Option<Instant>,
    unanswered: u32,
}

impl KeepaliveState {
    pub(crate) fn configure(&mut self, want_reply: bool, interval_secs: u32) {
        // An interval of 1 would fire on every call; treat it as 2.
        self.interval = if interval_secs == 1 { 2 } else { interval_secs };
        self.want_reply = want_reply;
        self.unanswered = 0;
        self.last_sent = None;
    }

    pub(crate) fn answered(&mut self) {
        self.unanswered = 0;
    }

    /// Seconds until the next keepalive is due; 0 when one is due now.
    fn due_in(&self, now: Instant) -> u32 {
        match self.last_sent {
            None => 0,
            Some(sent) => {
                let next = sent + Duration::from_secs(u64::from(self.interval));
                next.saturating_duration_since(now).as_secs() as u32
            }
        }
    }
}

impl SessionInner {
    /// Sends a keepalive if one is due and returns seconds until the next one.
    pub(crate) fn keepalive_send(&mut self) -> Step<u32> {
        if self.keepalive.interval == 0 {
            return Ok(0);
        }
        self.require_ready()?;
        // Replies are consumed by the pump; take whatever already arrived.
        self.drain()?;

        let now = Instant::now();
        let due_in = self.keepalive.due_in(now);
        if due_in > 0 {
            return Ok(due_in);
        }

        if self.keepalive.want_reply && self.keepalive.unanswered >= MAX_UNANSWERED_KEEPALIVES {
            warn!(
                unanswered = self.keepalive.unanswered,
                "keepalives unanswered, giving up"
            );
            self.state = super::SessionState::Disconnected;
            return Err(TetherError::Timeout {
                code: ErrorCode::SocketTimeout,
                message: format!(
                    "{} keepalives went unanswered",
                    self.keepalive.unanswered
                ),
            }
            .into());
        }

        let want_reply = self.keepalive.want_reply;
        self.send_global(&GlobalRequest::Keepalive, want_reply, GlobalKind::Keepalive);
        if want_reply {
            self.keepalive.unanswered += 1;
        }
        self.keepalive.last_sent = Some(now);
        debug!(want_reply, "keepalive sent");
        self.flush_lazy()?;
        Ok(self.keepalive.interval)
    }
}

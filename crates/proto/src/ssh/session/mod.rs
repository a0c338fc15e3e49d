//! SSH session: the connection every channel, listener and SFTP subsystem
//! runs over.
//!
//! A [`Session`] owns the transport and all per-connection state: handshake
//! progress, authentication, method preferences, keepalive and the last
//! error. Dependents (channels, listeners, SFTP, agent) hold a non-owning
//! back-reference and fail with a connection-closed error once the session
//! is dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_proto::ssh::nonblocking::Progress;
//! use tether_proto::ssh::session::Session;
//! use tether_proto::ssh::transport::Transport;
//! use tether_platform::TetherResult;
//!
//! fn run(transport: Box<dyn Transport>) -> TetherResult<()> {
//!     let session = Session::new();
//!     session.set_transport(transport);
//!     session.handshake()?;
//!     session.userauth_password("alice", "secret")?;
//!
//!     let Progress::Complete(mut channel) = session.channel_session()? else {
//!         unreachable!("blocking sessions never report WouldBlock");
//!     };
//!     channel.exec("uname -a")?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub(crate) mod inner;
pub mod keepalive;
mod userauth;

pub use config::{SessionConfig, SessionFlag, SessionState};
pub use keepalive::MAX_UNANSWERED_KEEPALIVES;

use crate::ssh::agent::Agent;
use crate::ssh::auth::{IdentitySigner, KeyboardInteractivePrompt};
use crate::ssh::channel::{Channel, OpenKind};
use crate::ssh::connection::ChannelType;
use crate::ssh::kex::MethodType;
use crate::ssh::known_hosts::KnownHosts;
use crate::ssh::listener::Listener;
use crate::ssh::message::DisconnectReason;
use crate::ssh::nonblocking::{BlockDirections, Progress, Step};
use crate::ssh::scp::ScpFileStat;
use crate::ssh::sftp::Sftp;
use crate::ssh::transport::{HashType, HostKey, Transport};
use inner::{SessionInner, SharedSession};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tether_platform::{ErrorCode, ErrorKind, TetherError, TetherResult};
use tracing::debug;

/// An SSH client connection.
pub struct Session {
    inner: SharedSession,
}

impl Session {
    /// Creates a session with default settings (blocking, no timeout).
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// Creates a session from a prepared configuration.
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner::new(config))),
        }
    }

    fn drive<T, F>(&self, op: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut SessionInner) -> Step<T>,
    {
        self.inner.lock().run(op)
    }

    fn record(&self, err: TetherError) -> TetherError {
        self.inner.lock().record(err)
    }

    fn weak(&self) -> inner::WeakSession {
        Arc::downgrade(&self.inner)
    }

    /// Attaches the transport collaborator. Must precede [`Session::handshake`].
    pub fn set_transport(&self, transport: Box<dyn Transport>) {
        self.inner.lock().set_transport(transport);
    }

    /// Runs banner exchange, algorithm negotiation and key exchange.
    pub fn handshake(&self) -> TetherResult<Progress<()>> {
        self.drive(|s| s.handshake())
    }

    /// Switches between blocking and non-blocking operation.
    pub fn set_blocking(&self, blocking: bool) {
        self.inner.lock().config.blocking = blocking;
    }

    /// Whether operations wait for the transport.
    pub fn is_blocking(&self) -> bool {
        self.inner.lock().config.blocking
    }

    /// Sets the blocking-mode timeout in milliseconds; 0 waits forever.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.lock().config.timeout_ms = timeout_ms;
    }

    /// Blocking-mode timeout in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.inner.lock().config.timeout_ms
    }

    /// Sets a session flag.
    pub fn flag(&self, flag: SessionFlag, value: bool) {
        let mut inner = self.inner.lock();
        match flag {
            SessionFlag::Sigpipe => inner.config.sigpipe = value,
            SessionFlag::Compress => inner.config.compress = value,
        }
        debug!(?flag, value, "session flag set");
    }

    /// Sets the preference list for one method category.
    ///
    /// Names are checked when the handshake starts.
    pub fn method_pref(&self, method: MethodType, prefs: &str) {
        self.inner.lock().config.preferences.set(method, prefs);
    }

    /// Algorithm negotiated for `method`; `None` before the handshake.
    pub fn methods(&self, method: MethodType) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .negotiated
            .as_ref()
            .and_then(|m| m.get(method))
            .map(str::to_string)
    }

    /// Algorithms this engine can offer for `method`.
    pub fn supported_algs(&self, method: MethodType) -> Vec<&'static str> {
        method.supported().to_vec()
    }

    /// Sets our identification string, sent during the handshake.
    pub fn set_banner(&self, banner: &str) {
        self.inner.lock().config.banner = banner.to_string();
    }

    /// The server's identification string.
    pub fn banner(&self) -> Option<String> {
        self.inner.lock().remote_banner.clone()
    }

    /// Server host key from the key exchange.
    pub fn host_key(&self) -> Option<HostKey> {
        self.inner.lock().host_key.clone()
    }

    /// Digest of the server host key.
    pub fn host_key_hash(&self, hash: HashType) -> Option<Vec<u8>> {
        self.inner.lock().host_key.as_ref().map(|key| key.hash(hash))
    }

    /// Sends DISCONNECT and shuts the transport down.
    pub fn disconnect(&self, reason: DisconnectReason, description: &str) -> TetherResult<Progress<()>> {
        self.drive(|s| s.disconnect(reason, description))
    }

    /// Connection state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Directions the last operation was waiting on.
    pub fn block_directions(&self) -> BlockDirections {
        self.inner.lock().block_directions
    }

    /// Code and message of the most recent failure.
    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.inner.lock().last_error.clone()
    }

    /// Numeric code of the most recent failure, 0 when there was none.
    pub fn last_errno(&self) -> i32 {
        self.inner
            .lock()
            .last_error
            .as_ref()
            .map_or(0, |(code, _)| code.raw())
    }

    /// Lists the methods the server accepts for `user`.
    ///
    /// Returns `None` when the server let the user in without credentials.
    pub fn userauth_list(&self, user: &str) -> TetherResult<Progress<Option<Vec<String>>>> {
        self.drive(|s| s.userauth_list(user))
    }

    /// Whether authentication has succeeded.
    pub fn userauth_authenticated(&self) -> bool {
        self.inner.lock().auth.authenticated
    }

    /// Banner text the server sent during authentication.
    pub fn userauth_banner(&self) -> Option<String> {
        self.inner.lock().auth.banner.clone()
    }

    /// Password authentication.
    pub fn userauth_password(&self, user: &str, password: &str) -> TetherResult<Progress<()>> {
        self.drive(|s| s.userauth_password(user, password))
    }

    /// Public key authentication with a caller-held signer.
    pub fn userauth_publickey(
        &self,
        user: &str,
        signer: &dyn IdentitySigner,
    ) -> TetherResult<Progress<()>> {
        self.drive(|s| s.userauth_publickey(user, signer))
    }

    /// Public key authentication with keys read from files.
    pub fn userauth_publickey_fromfile(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> TetherResult<Progress<()>> {
        self.drive(|s| s.userauth_publickey_fromfile(user, public_key, private_key, passphrase))
    }

    /// Public key authentication with keys held in memory.
    pub fn userauth_publickey_frommemory(
        &self,
        user: &str,
        public_key: Option<&[u8]>,
        private_key: &[u8],
        passphrase: Option<&str>,
    ) -> TetherResult<Progress<()>> {
        self.drive(|s| s.userauth_publickey_frommemory(user, public_key, private_key, passphrase))
    }

    /// Keyboard-interactive authentication; `prompt` answers each challenge.
    pub fn userauth_keyboard_interactive(
        &self,
        user: &str,
        prompt: &mut dyn KeyboardInteractivePrompt,
    ) -> TetherResult<Progress<()>> {
        self.drive(|s| s.userauth_keyboard_interactive(user, &mut *prompt))
    }

    /// Tries each identity held by the agent until one is accepted.
    ///
    /// Rejected identities are remembered across would-block retries.
    pub fn userauth_agent(&self, user: &str) -> TetherResult<Progress<()>> {
        let mut agent = self.agent_init();
        let identities = agent
            .connect()
            .and_then(|_| agent.list_identities())
            .and_then(|_| agent.get_identities())
            .map_err(|e| self.record(e))?;

        loop {
            let next = self.inner.lock().auth.agent_tried;
            let Some(identity) = identities.get(next) else {
                self.inner.lock().auth.agent_tried = 0;
                return Err(self.record(TetherError::Authentication {
                    code: ErrorCode::AuthenticationFailed,
                    message: format!(
                        "none of the {} agent identities was accepted",
                        identities.len()
                    ),
                }));
            };
            match agent.userauth(user, identity) {
                Ok(progress) => return Ok(progress),
                Err(err) if err.kind() == ErrorKind::AuthenticationFailed => {
                    debug!(comment = %identity.comment, "agent identity rejected");
                    self.inner.lock().auth.agent_tried += 1;
                }
                Err(err) => {
                    self.inner.lock().auth.agent_tried = 0;
                    return Err(err);
                }
            }
        }
    }

    /// Configures keepalives; an interval of 0 disables them.
    pub fn keepalive_config(&self, want_reply: bool, interval_secs: u32) {
        self.inner.lock().keepalive.configure(want_reply, interval_secs);
    }

    /// Sends a keepalive if due; returns seconds until the next one is due.
    pub fn keepalive_send(&self) -> TetherResult<u32> {
        let progress = self.drive(|s| s.keepalive_send())?;
        Ok(progress.complete().unwrap_or(0))
    }

    /// Opens a session channel for a shell, command or subsystem.
    pub fn channel_session(&self) -> TetherResult<Progress<Channel>> {
        let progress = self.drive(|s| s.open_channel(OpenKind::Session, || ChannelType::Session))?;
        Ok(progress.map(|id| Channel::new(self.weak(), id)))
    }

    /// Opens a tunnel to `host:port` through the server.
    pub fn channel_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        shost: &str,
        sport: u32,
    ) -> TetherResult<Progress<Channel>> {
        let progress = self.drive(|s| {
            s.open_channel(OpenKind::DirectTcpip, || ChannelType::DirectTcpip {
                host: host.to_string(),
                port,
                originator_address: shost.to_string(),
                originator_port: sport,
            })
        })?;
        Ok(progress.map(|id| Channel::new(self.weak(), id)))
    }

    /// Asks the server to listen on `host:port`. Port 0 lets it choose.
    pub fn forward_listen(
        &self,
        host: &str,
        port: u32,
        queue_maxsize: usize,
    ) -> TetherResult<Progress<Listener>> {
        let progress = self.drive(|s| s.forward_listen(host, port, queue_maxsize))?;
        Ok(progress.map(|(id, bound)| Listener::new(self.weak(), id, bound)))
    }

    /// Starts an SCP download; read the file contents from the channel.
    pub fn scp_recv(&self, path: &str) -> TetherResult<Progress<(Channel, ScpFileStat)>> {
        self.scp_receive(path, false)
    }

    /// Like [`Session::scp_recv`], also reporting access and modify times.
    pub fn scp_recv2(&self, path: &str) -> TetherResult<Progress<(Channel, ScpFileStat)>> {
        self.scp_receive(path, true)
    }

    fn scp_receive(&self, path: &str, times: bool) -> TetherResult<Progress<(Channel, ScpFileStat)>> {
        let progress = self.drive(|s| s.scp_recv(path, times))?;
        Ok(progress.map(|(id, stat)| (Channel::new(self.weak(), id), stat)))
    }

    /// Starts an SCP upload of `size` bytes; write them to the channel.
    ///
    /// `times` is `(mtime, atime)` in seconds since the epoch.
    pub fn scp_send(
        &self,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> TetherResult<Progress<Channel>> {
        let progress = self.drive(|s| s.scp_send(path, mode, size, times))?;
        Ok(progress.map(|id| Channel::new(self.weak(), id)))
    }

    /// Starts the SFTP subsystem. Only one may run per session.
    pub fn sftp_init(&self) -> TetherResult<Progress<Sftp>> {
        let progress = self.drive(|s| s.sftp_startup())?;
        Ok(progress.map(|start| Sftp::new(self.weak(), start)))
    }

    /// Creates an agent client bound to this session.
    pub fn agent_init(&self) -> Agent {
        Agent::new(self.weak())
    }

    /// Creates an empty known-hosts store.
    pub fn knownhost_init(&self) -> KnownHosts {
        KnownHosts::new()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("blocking", &inner.config.blocking)
            .field("authenticated", &inner.auth.authenticated)
            .field("channels", &inner.channels.len())
            .finish()
    }
}

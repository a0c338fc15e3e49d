//! Session configuration.

use crate::ssh::auth::KeyDecoder;
use crate::ssh::connection::{DEFAULT_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use crate::ssh::kex::{MethodPreferences, MethodType};
use crate::ssh::transport::DEFAULT_BANNER;
use std::sync::Arc;
use tether_platform::{TetherError, TetherResult};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake attempted yet
    Unconnected,
    /// Handshake in progress
    Handshaking,
    /// Keys established; authentication and channels allowed
    Ready,
    /// Connection ended
    Disconnected,
}

/// Boolean session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SessionFlag {
    /// Let SIGPIPE through instead of suppressing it on socket writes
    Sigpipe = 1,
    /// Offer zlib compression during negotiation
    Compress = 2,
}

impl TryFrom<i32> for SessionFlag {
    type Error = TetherError;

    fn try_from(value: i32) -> TetherResult<Self> {
        match value {
            1 => Ok(SessionFlag::Sigpipe),
            2 => Ok(SessionFlag::Compress),
            other => Err(TetherError::MethodNotSupported {
                message: format!("unknown session flag {}", other),
            }),
        }
    }
}

/// Session configuration.
///
/// Everything here can also be changed at runtime through the setters on
/// [`Session`](super::Session).
pub struct SessionConfig {
    /// Wait for readiness inside each operation instead of returning
    /// `WouldBlock`.
    pub blocking: bool,
    /// Timeout for blocking waits in milliseconds; 0 waits forever.
    pub timeout_ms: u64,
    /// Identification string sent during the banner exchange.
    pub banner: String,
    /// Per-category algorithm preferences.
    pub preferences: MethodPreferences,
    /// Leave SIGPIPE enabled for the transport.
    pub sigpipe: bool,
    /// Offer compression.
    pub compress: bool,
    /// Window advertised for new channels.
    pub window_size: u32,
    /// Maximum packet size advertised for new channels.
    pub packet_size: u32,
    /// Private key decoder used by the file and memory public key strategies.
    pub key_decoder: Option<Arc<dyn KeyDecoder>>,
}

impl SessionConfig {
    /// Switches blocking mode.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Sets the blocking timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the identification banner.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = banner.to_string();
        self
    }

    /// Sets one preference list.
    pub fn with_method_pref(mut self, method: MethodType, prefs: &str) -> Self {
        self.preferences.set(method, prefs);
        self
    }

    /// Sets the window and packet size for new channels.
    pub fn with_channel_limits(mut self, window_size: u32, packet_size: u32) -> Self {
        self.window_size = window_size;
        self.packet_size = packet_size;
        self
    }

    /// Installs a private key decoder.
    pub fn with_key_decoder(mut self, decoder: Arc<dyn KeyDecoder>) -> Self {
        self.key_decoder = Some(decoder);
        self
    }
}

// Manual Debug implementation because KeyDecoder is not Debug
impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("blocking", &self.blocking)
            .field("timeout_ms", &self.timeout_ms)
            .field("banner", &self.banner)
            .field("preferences", &self.preferences)
            .field("sigpipe", &self.sigpipe)
            .field("compress", &self.compress)
            .field("window_size", &self.window_size)
            .field("packet_size", &self.packet_size)
            .field("key_decoder", &self.key_decoder.as_ref().map(|_| "<decoder>"))
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            blocking: true,
            timeout_ms: 0,
            banner: DEFAULT_BANNER.to_string(),
            preferences: MethodPreferences::default(),
            sigpipe: false,
            compress: false,
            window_size: DEFAULT_WINDOW_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
            key_decoder: None,
        }
    }
}

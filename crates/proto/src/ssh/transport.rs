//! Transport collaborator interface.
//!
//! The engine does not frame, encrypt or poll sockets. It drives a
//! [`Transport`] that:
//!
//! 1. exchanges identification banners,
//! 2. runs the cryptographic key exchange for methods the engine negotiated,
//! 3. sends and receives whole decrypted message payloads,
//! 4. waits for readiness when the engine runs in blocking mode.
//!
//! Every method may report `io::ErrorKind::WouldBlock`; the engine turns that
//! into a would-block result for the caller (or a wait, in blocking mode).
//! Any other I/O error is a transport failure.

use crate::ssh::kex::{MethodType, NegotiatedMethods};
use crate::ssh::nonblocking::BlockDirections;
use crate::ssh::wire::Reader;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io;
use std::time::Duration;

/// Banner sent when the caller does not set one.
pub const DEFAULT_BANNER: &str = concat!("SSH-2.0-tether_", env!("CARGO_PKG_VERSION"));

/// Inputs to the delegated key exchange.
#[derive(Debug, Clone)]
pub struct KexContext {
    /// Our identification string
    pub client_banner: String,
    /// Server identification string
    pub server_banner: String,
    /// Our KEXINIT payload
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload
    pub server_kexinit: Vec<u8>,
    /// Algorithms chosen per category
    pub methods: NegotiatedMethods,
}

impl KexContext {
    /// Shorthand for one negotiated algorithm.
    pub fn method(&self, method: MethodType) -> Option<&str> {
        self.methods.get(method)
    }
}

/// Result of the delegated key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexOutcome {
    /// Server host key blob (SSH wire format)
    pub host_key: Vec<u8>,
    /// Exchange hash of the first key exchange
    pub session_id: Vec<u8>,
}

/// Byte-oriented duplex connection carrying decrypted message payloads.
///
/// Implementations are resumable: after `WouldBlock` the engine calls the same
/// method again with the same arguments.
pub trait Transport: Send {
    /// Sends our banner and returns the server's identification line.
    fn exchange_banner(&mut self, ours: &str) -> io::Result<String>;

    /// Runs the key exchange after KEXINIT negotiation, through NEWKEYS.
    fn key_exchange(&mut self, ctx: &KexContext) -> io::Result<KexOutcome>;

    /// Sends one payload. Either the whole payload is accepted or none of it.
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Receives one payload. `UnexpectedEof` means the peer closed.
    fn receive(&mut self) -> io::Result<Vec<u8>>;

    /// Waits until the connection is ready in the given directions.
    ///
    /// Returns `false` when the timeout expired first.
    fn wait(&mut self, directions: BlockDirections, timeout: Option<Duration>) -> io::Result<bool>;

    /// Closes the connection.
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Key algorithm family of a host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyType {
    /// ssh-rsa
    Rsa,
    /// ssh-dss
    Dss,
    /// ecdsa-sha2-nistp256
    Ecdsa256,
    /// ecdsa-sha2-nistp384
    Ecdsa384,
    /// ecdsa-sha2-nistp521
    Ecdsa521,
    /// ssh-ed25519
    Ed25519,
    /// Anything else
    Unknown,
}

impl HostKeyType {
    /// Maps a key type name to its family.
    pub fn from_name(name: &str) -> Self {
        match name {
            "ssh-rsa" => HostKeyType::Rsa,
            "ssh-dss" => HostKeyType::Dss,
            "ecdsa-sha2-nistp256" => HostKeyType::Ecdsa256,
            "ecdsa-sha2-nistp384" => HostKeyType::Ecdsa384,
            "ecdsa-sha2-nistp521" => HostKeyType::Ecdsa521,
            "ssh-ed25519" => HostKeyType::Ed25519,
            _ => HostKeyType::Unknown,
        }
    }
}

/// Fingerprint algorithm for [`HostKey::hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// 20-byte SHA-1
    Sha1,
    /// 32-byte SHA-256
    Sha256,
}

/// Server host key as received during key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    blob: Vec<u8>,
    name: String,
}

impl HostKey {
    /// Wraps a host key blob, reading the type name from its first field.
    pub fn from_blob(blob: Vec<u8>) -> Self {
        let name = Reader::new(&blob).string().unwrap_or_default();
        Self { blob, name }
    }

    /// Key blob in SSH wire format.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Key type name, e.g. `ssh-ed25519`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key family.
    pub fn key_type(&self) -> HostKeyType {
        HostKeyType::from_name(&self.name)
    }

    /// Fingerprint of the blob.
    pub fn hash(&self, hash: HashType) -> Vec<u8> {
        match hash {
            HashType::Sha1 => Sha1::digest(&self.blob).to_vec(),
            HashType::Sha256 => Sha256::digest(&self.blob).to_vec(),
        }
    }

    /// Fingerprint as lowercase hex.
    pub fn fingerprint(&self, hash: HashType) -> String {
        hex::encode(self.hash(hash))
    }
}

/// Maps a transport I/O error, keeping would-block distinct.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

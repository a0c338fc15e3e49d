//! SSH agent client.
//!
//! Talks to an external key-holding process over a local side channel
//! (`SSH_AUTH_SOCK` by default). Private keys never leave the agent: the
//! client lists public identities and asks the agent to sign
//! authentication data.
//!
//! The side channel is a short local exchange and is driven to completion
//! on every call; only the session half of [`Agent::userauth`] follows the
//! would-block contract.

use crate::ssh::auth::IdentitySigner;
use crate::ssh::nonblocking::Progress;
use crate::ssh::session::inner::{upgrade, WeakSession};
use crate::ssh::wire::{Reader, Writer};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_platform::{AgentFailure, TetherError, TetherResult};
use tracing::{debug, info};

/// Environment variable naming the agent socket.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

const AGENT_FAILURE: u8 = 5;
const REQUEST_IDENTITIES: u8 = 11;
const IDENTITIES_ANSWER: u8 = 12;
const SIGN_REQUEST: u8 = 13;
const SIGN_RESPONSE: u8 = 14;

/// Sign request flags selecting the RSA signature hash (RFC 8332).
const RSA_SHA2_256: u32 = 2;
const RSA_SHA2_512: u32 = 4;

/// Largest agent reply accepted.
const MAX_REPLY: usize = 256 * 1024;

fn agent_error(kind: AgentFailure, message: impl Into<String>) -> TetherError {
    TetherError::Agent {
        kind,
        message: message.into(),
    }
}

/// Byte stream to a running agent.
pub trait AgentStream: Read + Write + Send {}

impl<T: Read + Write + Send> AgentStream for T {}

/// Opens agent streams.
pub trait AgentConnector: Send + Sync {
    /// Connects to the agent at `path`.
    fn connect(&self, path: &Path) -> io::Result<Box<dyn AgentStream>>;
}

/// Connects over a Unix domain socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixAgentConnector;

impl AgentConnector for UnixAgentConnector {
    #[cfg(unix)]
    fn connect(&self, path: &Path) -> io::Result<Box<dyn AgentStream>> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    fn connect(&self, path: &Path) -> io::Result<Box<dyn AgentStream>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no agent transport for {}", path.display()),
        ))
    }
}

/// A public key held by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Public key blob in SSH wire format
    pub blob: Vec<u8>,
    /// Comment the key was added with
    pub comment: String,
    /// Position in the listing it came from
    pub index: usize,
}

impl AgentIdentity {
    /// Key type named by the blob, e.g. `ssh-ed25519`.
    pub fn key_type(&self) -> TetherResult<String> {
        Reader::new(&self.blob).string()
    }
}

type SharedStream = Mutex<Box<dyn AgentStream>>;

/// Sends one request frame and reads the reply payload.
fn request(stream: &SharedStream, payload: &[u8]) -> TetherResult<Vec<u8>> {
    let io_error = |e: io::Error| agent_error(AgentFailure::Connection, e.to_string());
    let mut stream = stream.lock();
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).map_err(io_error)?;
    stream.flush().map_err(io_error)?;

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).map_err(io_error)?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_REPLY {
        return Err(agent_error(
            AgentFailure::Protocol,
            format!("agent reply of {} bytes", len),
        ));
    }
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).map_err(io_error)?;
    Ok(reply)
}

/// Sign request flags for a signature algorithm; plain key types need none.
fn sign_flags(algorithm: &str) -> u32 {
    match algorithm {
        "rsa-sha2-256" => RSA_SHA2_256,
        "rsa-sha2-512" => RSA_SHA2_512,
        _ => 0,
    }
}

fn sign_with(
    stream: &SharedStream,
    identity: &AgentIdentity,
    algorithm: &str,
    data: &[u8],
) -> TetherResult<Vec<u8>> {
    let flags = sign_flags(algorithm);
    let payload = Writer::message(SIGN_REQUEST)
        .bytes(&identity.blob)
        .bytes(data)
        .u32(flags)
        .finish();
    let reply = request(stream, &payload)?;
    match reply[0] {
        SIGN_RESPONSE => {
            let signature = Reader::new(&reply[1..])
                .bytes()
                .map_err(|e| agent_error(AgentFailure::Protocol, e.message()))?;
            debug!(comment = %identity.comment, algorithm, "agent signed");
            Ok(signature.to_vec())
        }
        AGENT_FAILURE => Err(agent_error(
            AgentFailure::Sign,
            format!("agent refused to sign with '{}'", identity.comment),
        )),
        other => Err(agent_error(
            AgentFailure::Protocol,
            format!("unexpected reply {} to sign request", other),
        )),
    }
}

/// Signs through the agent on behalf of one identity.
pub(crate) struct AgentSigner<'a> {
    stream: &'a SharedStream,
    identity: &'a AgentIdentity,
    algorithm: String,
}

impl<'a> AgentSigner<'a> {
    fn new(stream: &'a SharedStream, identity: &'a AgentIdentity) -> TetherResult<Self> {
        let key_type = identity
            .key_type()
            .map_err(|e| agent_error(AgentFailure::Protocol, e.message()))?;
        // RSA keys authenticate with SHA-256 signatures, never SHA-1.
        let algorithm = match key_type.as_str() {
            "ssh-rsa" => "rsa-sha2-256".to_string(),
            _ => key_type,
        };
        Ok(Self {
            stream,
            identity,
            algorithm,
        })
    }
}

impl IdentitySigner for AgentSigner<'_> {
    fn algorithm(&self) -> &str {
        &self.algorithm
    }

    fn public_key(&self) -> &[u8] {
        &self.identity.blob
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>> {
        sign_with(self.stream, self.identity, &self.algorithm, data)
    }
}

/// Connection to an SSH agent, created by `Session::agent_init`.
pub struct Agent {
    session: WeakSession,
    connector: Arc<dyn AgentConnector>,
    identity_path: Option<PathBuf>,
    stream: Option<SharedStream>,
    identities: Vec<AgentIdentity>,
}

impl Agent {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self {
            session,
            connector: Arc::new(UnixAgentConnector),
            identity_path: None,
            stream: None,
            identities: Vec::new(),
        }
    }

    /// Replaces how the agent is reached. Takes effect on the next connect.
    pub fn set_connector(&mut self, connector: Arc<dyn AgentConnector>) {
        self.connector = connector;
    }

    /// Uses `path` instead of `SSH_AUTH_SOCK`.
    pub fn set_identity_path<P: AsRef<Path>>(&mut self, path: P) {
        self.identity_path = Some(path.as_ref().to_path_buf());
    }

    /// Socket path that [`Agent::connect`] will use.
    pub fn get_identity_path(&self) -> Option<PathBuf> {
        self.identity_path
            .clone()
            .or_else(|| std::env::var_os(AUTH_SOCK_ENV).map(PathBuf::from))
    }

    /// Whether a side channel is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the side channel. Connecting again replaces the old stream.
    pub fn connect(&mut self) -> TetherResult<()> {
        let path = self.get_identity_path().ok_or_else(|| {
            agent_error(
                AgentFailure::Connection,
                format!("{} is not set and no identity path was given", AUTH_SOCK_ENV),
            )
        })?;
        let stream = self.connector.connect(&path).map_err(|e| {
            agent_error(
                AgentFailure::Connection,
                format!("unable to connect to agent at {}: {}", path.display(), e),
            )
        })?;
        self.stream = Some(Mutex::new(stream));
        self.identities.clear();
        debug!(path = %path.display(), "agent connected");
        Ok(())
    }

    /// Closes the side channel and forgets the identity snapshot.
    pub fn disconnect(&mut self) -> TetherResult<()> {
        self.stream = None;
        self.identities.clear();
        Ok(())
    }

    fn stream(&self) -> TetherResult<&SharedStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| agent_error(AgentFailure::Connection, "agent is not connected"))
    }

    /// Fetches a fresh identity snapshot from the agent.
    pub fn list_identities(&mut self) -> TetherResult<()> {
        let reply = request(self.stream()?, &[REQUEST_IDENTITIES])?;
        match reply[0] {
            IDENTITIES_ANSWER => {}
            AGENT_FAILURE => {
                return Err(agent_error(
                    AgentFailure::ListIdentities,
                    "agent refused to list identities",
                ))
            }
            other => {
                return Err(agent_error(
                    AgentFailure::Protocol,
                    format!("unexpected reply {} to identity request", other),
                ))
            }
        }

        let malformed = |e: TetherError| agent_error(AgentFailure::ListIdentities, e.message());
        let mut r = Reader::new(&reply[1..]);
        let count = r.u32().map_err(malformed)? as usize;
        let mut identities = Vec::with_capacity(count.min(64));
        for index in 0..count {
            let blob = r.bytes().map_err(malformed)?.to_vec();
            let comment = r.string().map_err(malformed)?;
            identities.push(AgentIdentity {
                blob,
                comment,
                index,
            });
        }
        debug!(count, "agent identities listed");
        self.identities = identities;
        Ok(())
    }

    /// The identity snapshot from the last [`Agent::list_identities`].
    pub fn get_identities(&self) -> TetherResult<Vec<AgentIdentity>> {
        self.stream()?;
        Ok(self.identities.clone())
    }

    /// Has the agent sign `data` with `identity`, using the key's own
    /// algorithm.
    pub fn sign(&self, identity: &AgentIdentity, data: &[u8]) -> TetherResult<Vec<u8>> {
        let algorithm = identity
            .key_type()
            .map_err(|e| agent_error(AgentFailure::Protocol, e.message()))?;
        sign_with(self.stream()?, identity, &algorithm, data)
    }

    /// Authenticates the session as `user` with one agent identity.
    pub fn userauth(
        &self,
        user: &str,
        identity: &AgentIdentity,
    ) -> TetherResult<Progress<()>> {
        let signer = AgentSigner::new(self.stream()?, identity)?;
        let session = upgrade(&self.session)?;
        let progress = session.lock().run(|s| s.userauth_publickey(user, &signer));
        if let Ok(Progress::Complete(())) = progress {
            info!(user, comment = %identity.comment, "authenticated with agent identity");
        }
        progress
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("identity_path", &self.identity_path)
            .field("connected", &self.stream.is_some())
            .field("identities", &self.identities.len())
            .finish()
    }
}

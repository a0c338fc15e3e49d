//! SFTP (SSH File Transfer Protocol) client, version 3.
//!
//! # Architecture
//!
//! SFTP runs as an SSH subsystem over an SSH channel:
//! 1. Open SSH channel
//! 2. Request "sftp" subsystem
//! 3. Exchange SFTP protocol messages
//!
//! # Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                               |
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |                               |
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |                               |
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |                               |
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |                               |
//!   |-- SSH_FXP_READ -------------->|
//!   |<- SSH_FXP_DATA ---------------|
//!   |                               |
//!   |-- SSH_FXP_CLOSE ------------->|
//!   |<- SSH_FXP_STATUS -------------|
//! ```
//!
//! Requests carry increasing ids. Responses are matched by id, so replies
//! for other objects that arrive first are stashed until asked for. The
//! [`Sftp`] object and every [`SftpHandle`] each have one request slot: a
//! blocked request is resumed by repeating the same call, and a different
//! request on the same object fails with an invalid-use error until it
//! completes.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_proto::ssh::sftp::{FileOpenFlags, FileMode};
//! use tether_proto::ssh::session::Session;
//! use tether_proto::ssh::nonblocking::Progress;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let session = Session::new();
//! let Progress::Complete(sftp) = session.sftp_init()? else { return Ok(()) };
//! let flags = FileOpenFlags::READ;
//! if let Progress::Complete(mut file) = sftp.open("/etc/motd", flags, FileMode::DEFAULT_FILE)? {
//!     let mut buf = [0u8; 1024];
//!     let _ = file.read(&mut buf)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - Most common version

pub mod handle;
pub mod message;
pub mod types;

pub use handle::SftpHandle;
pub use message::{SftpMessageType, MAX_DATA, SFTP_VERSION};
pub use types::{
    AttrFlags, DirEntry, FileMode, FileOpenFlags, FileType, OpenType, RenameFlags,
    SftpAttributes, SftpStatVfs, SftpStatus,
};

use crate::ssh::channel::{OpenKind, STREAM_DATA};
use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::nonblocking::{Halt, Progress, Step};
use crate::ssh::session::inner::{upgrade, SessionInner, WeakSession};
use crate::ssh::wire::{Reader, Writer};
use message::{init_packet, sftp_protocol, PacketBuffer, Request, Response, Version};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tether_platform::{ChannelFailure, TetherError, TetherResult};
use tracing::{debug, info, trace};

const POSIX_RENAME: &str = "posix-rename@openssh.com";
const STATVFS: &str = "statvfs@openssh.com";
pub(crate) const FSTATVFS: &str = "fstatvfs@openssh.com";
pub(crate) const FSYNC: &str = "fsync@openssh.com";

/// Chunk read from the channel per receive.
const RECV_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootStep {
    Open,
    Subsystem,
    Init,
    Version,
}

/// Subsystem startup in progress.
#[derive(Debug)]
pub(crate) struct SftpBoot {
    step: BootStep,
    channel: u32,
    sent: usize,
    inbound: PacketBuffer,
}

/// A started subsystem, ready to become an [`Sftp`].
#[derive(Debug)]
pub(crate) struct SftpStart {
    channel: u32,
    version: Version,
    inbound: PacketBuffer,
}

impl SessionInner {
    /// Opens the channel, starts the subsystem and negotiates the version.
    pub(crate) fn sftp_startup(&mut self) -> Step<SftpStart> {
        if self.sftp_boot.is_none() {
            if self.sftp_channel.is_some() {
                return Err(TetherError::invalid_use("an SFTP subsystem is already running").into());
            }
            self.require_ready()?;
            self.sftp_boot = Some(SftpBoot {
                step: BootStep::Open,
                channel: 0,
                sent: 0,
                inbound: PacketBuffer::default(),
            });
        }

        let result = self.sftp_boot_steps();
        match &result {
            Err(Halt::Block(_)) => {}
            Ok(start) => {
                self.sftp_boot = None;
                self.sftp_channel = Some(start.channel);
            }
            Err(Halt::Fail(_)) => {
                if let Some(boot) = self.sftp_boot.take() {
                    if boot.step != BootStep::Open {
                        self.channel_release(boot.channel);
                    }
                }
            }
        }
        result
    }

    fn boot_progress(&mut self) -> Step<&mut SftpBoot> {
        self.sftp_boot
            .as_mut()
            .ok_or_else(|| TetherError::invalid_use("no SFTP startup in progress").into())
    }

    fn sftp_boot_steps(&mut self) -> Step<SftpStart> {
        loop {
            let (step, id) = {
                let boot = self.boot_progress()?;
                (boot.step, boot.channel)
            };
            match step {
                BootStep::Open => {
                    let id = self.open_channel(OpenKind::Sftp, || ChannelType::Session)?;
                    let boot = self.boot_progress()?;
                    boot.channel = id;
                    boot.step = BootStep::Subsystem;
                }
                BootStep::Subsystem => {
                    let request = ChannelRequestType::Subsystem {
                        name: "sftp".to_string(),
                    };
                    self.channel_start(id, request)?;
                    self.boot_progress()?.step = BootStep::Init;
                }
                BootStep::Init => {
                    let mut sent = self.boot_progress()?.sent;
                    let written = self.channel_write_all(id, &init_packet(), &mut sent);
                    self.boot_progress()?.sent = sent;
                    written?;
                    debug!(channel = id, "SSH_FXP_INIT sent");
                    self.boot_progress()?.step = BootStep::Version;
                }
                BootStep::Version => {
                    if let Some(packet) = self.boot_progress()?.inbound.next_packet()? {
                        let version = Version::parse(&packet)?;
                        let boot = self.boot_progress()?;
                        let inbound = std::mem::take(&mut boot.inbound);
                        return Ok(SftpStart {
                            channel: id,
                            version,
                            inbound,
                        });
                    }
                    let mut buf = vec![0u8; RECV_CHUNK];
                    let n = self.channel_read(id, STREAM_DATA, &mut buf)?;
                    if n == 0 {
                        return Err(closed_during("startup").into());
                    }
                    self.boot_progress()?.inbound.extend(&buf[..n]);
                }
            }
        }
    }
}

fn closed_during(what: &str) -> TetherError {
    TetherError::channel(
        ChannelFailure::Closed,
        format!("SFTP channel closed by the server during {}", what),
    )
}

/// An issued request awaiting its response.
#[derive(Debug)]
pub(crate) struct Pending {
    request: Request,
    id: u32,
}

/// Request and response bookkeeping shared by an [`Sftp`] and its handles.
#[derive(Debug)]
pub(crate) struct SftpState {
    next_id: u32,
    inbound: PacketBuffer,
    /// Responses that arrived before anyone asked for them
    stash: HashMap<u32, Vec<u8>>,
    /// Requests whose responses nobody will collect
    discard: HashSet<u32>,
    /// Framed requests not yet fully written to the channel
    outbound: VecDeque<Vec<u8>>,
    out_sent: usize,
    last_status: u32,
    /// Slot for operations on the [`Sftp`] object itself
    pending: Option<Pending>,
}

impl SftpState {
    fn new(inbound: PacketBuffer) -> Self {
        Self {
            next_id: 1,
            inbound,
            stash: HashMap::new(),
            discard: HashSet::new(),
            outbound: VecDeque::new(),
            out_sent: 0,
            last_status: 0,
            pending: None,
        }
    }

    /// Queues a request whose response is dropped on arrival.
    pub(crate) fn fire_and_forget(&mut self, request: &Request) {
        let id = self.allocate_id();
        self.outbound.push_back(request.to_bytes(id));
        self.discard.insert(id);
    }

    /// Stops waiting for whatever `slot` holds.
    pub(crate) fn abandon(&mut self, slot: &mut Option<Pending>) {
        if let Some(pending) = slot.take() {
            if self.stash.remove(&pending.id).is_none() {
                self.discard.insert(pending.id);
            }
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Issues `request` through `slot` once and waits for its response.
    ///
    /// With `strict` a retry must repeat the same request; otherwise only the
    /// message type has to match.
    pub(crate) fn exchange(
        &mut self,
        inner: &mut SessionInner,
        channel: u32,
        slot: &mut Option<Pending>,
        request: Request,
        strict: bool,
    ) -> Step<Response> {
        let id = match slot {
            Some(p) if p.request.msg_type != request.msg_type || (strict && p.request != request) => {
                return Err(TetherError::invalid_use(format!(
                    "an SFTP {:?} request is in progress",
                    p.request.msg_type
                ))
                .into())
            }
            Some(p) => p.id,
            None => {
                let id = self.allocate_id();
                trace!(request_id = id, kind = ?request.msg_type, "SFTP request queued");
                self.outbound.push_back(request.to_bytes(id));
                *slot = Some(Pending { request, id });
                id
            }
        };

        let result = self.await_response(inner, channel, id);
        match &result {
            Err(Halt::Block(_)) => {}
            Ok(_) => *slot = None,
            Err(Halt::Fail(_)) => {
                *slot = None;
                self.discard.insert(id);
            }
        }
        result
    }

    fn await_response(&mut self, inner: &mut SessionInner, channel: u32, id: u32) -> Step<Response> {
        loop {
            self.flush_requests(inner, channel)?;
            if let Some(packet) = self.stash.remove(&id) {
                return Ok(Response::parse(&packet)?);
            }
            self.receive(inner, channel)?;
        }
    }

    /// Writes queued requests in order; a partial write resumes mid-packet.
    pub(crate) fn flush_requests(&mut self, inner: &mut SessionInner, channel: u32) -> Step<()> {
        while let Some(packet) = self.outbound.front() {
            let mut sent = self.out_sent;
            let written = inner.channel_write_all(channel, packet, &mut sent);
            self.out_sent = sent;
            written?;
            self.outbound.pop_front();
            self.out_sent = 0;
        }
        Ok(())
    }

    fn receive(&mut self, inner: &mut SessionInner, channel: u32) -> Step<()> {
        let mut buf = vec![0u8; RECV_CHUNK];
        let n = inner.channel_read(channel, STREAM_DATA, &mut buf)?;
        if n == 0 {
            return Err(closed_during("a request").into());
        }
        self.inbound.extend(&buf[..n]);
        while let Some(packet) = self.inbound.next_packet()? {
            let id = Response::id(&packet)?;
            if self.discard.remove(&id) {
                trace!(request_id = id, "dropping response to an abandoned request");
                continue;
            }
            self.stash.insert(id, packet);
        }
        Ok(())
    }

    /// Turns a non-OK status into an error and remembers its code.
    pub(crate) fn failure(&mut self, code: u32, message: &str, what: &str) -> TetherError {
        self.last_status = code;
        let text = if message.is_empty() {
            SftpStatus::from_u32(code).map_or("unknown status", |s| s.message())
        } else {
            message
        };
        debug!(status = code, operation = what, "SFTP request failed");
        TetherError::Sftp {
            status: code,
            message: format!("{} failed: {}", what, text),
        }
    }

    pub(crate) fn expect_ok(&mut self, response: Response, what: &str) -> TetherResult<()> {
        match response {
            Response::Status { code: 0, .. } => {
                self.last_status = 0;
                Ok(())
            }
            Response::Status { code, message } => Err(self.failure(code, &message, what)),
            other => Err(unexpected(&other, what)),
        }
    }

    pub(crate) fn expect_attrs(&mut self, response: Response, what: &str) -> TetherResult<SftpAttributes> {
        match response {
            Response::Attrs(attrs) => Ok(attrs),
            Response::Status { code, message } => Err(self.failure(code, &message, what)),
            other => Err(unexpected(&other, what)),
        }
    }

    pub(crate) fn expect_statvfs(&mut self, response: Response, what: &str) -> TetherResult<SftpStatVfs> {
        match response {
            Response::ExtendedReply(data) => SftpStatVfs::read(&mut Reader::new(&data)),
            Response::Status { code, message } => Err(self.failure(code, &message, what)),
            other => Err(unexpected(&other, what)),
        }
    }

    pub(crate) fn expect_handle(&mut self, response: Response, what: &str) -> TetherResult<Vec<u8>> {
        match response {
            Response::Handle(handle) => Ok(handle),
            Response::Status { code, message } => Err(self.failure(code, &message, what)),
            other => Err(unexpected(&other, what)),
        }
    }

    fn expect_name(&mut self, response: Response, what: &str) -> TetherResult<String> {
        match response {
            Response::Name(entries) => entries
                .into_iter()
                .next()
                .map(|entry| entry.name)
                .ok_or_else(|| sftp_protocol(format!("{} returned no names", what))),
            Response::Status { code, message } => Err(self.failure(code, &message, what)),
            other => Err(unexpected(&other, what)),
        }
    }
}

pub(crate) fn unexpected(response: &Response, what: &str) -> TetherError {
    sftp_protocol(format!("unexpected reply to {}: {:?}", what, response))
}

/// State reachable from the [`Sftp`] object and every handle it opened.
pub(crate) struct SftpShared {
    pub(crate) session: WeakSession,
    pub(crate) channel: u32,
    version: u32,
    extensions: Vec<(String, String)>,
    pub(crate) state: Mutex<SftpState>,
}

impl SftpShared {
    /// Runs a step with the SFTP state and the session locked, in that order.
    pub(crate) fn drive<T, F>(&self, mut op: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut SftpState, &mut SessionInner) -> Step<T>,
    {
        let mut state = self.state.lock();
        let session = upgrade(&self.session)?;
        let mut inner = session.lock();
        let progress = inner.run(|s| op(&mut *state, s));
        progress
    }

    fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|(name, _)| name == extension)
    }
}

impl Drop for SftpShared {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let mut inner = session.lock();
            inner.channel_release(self.channel);
            inner.sftp_channel = None;
        }
        debug!(channel = self.channel, "SFTP subsystem released");
    }
}

/// An SFTP subsystem running on its own channel.
pub struct Sftp {
    shared: Arc<SftpShared>,
}

impl Sftp {
    pub(crate) fn new(session: WeakSession, start: SftpStart) -> Self {
        info!(
            channel = start.channel,
            version = start.version.version,
            extensions = start.version.extensions.len(),
            "SFTP subsystem started"
        );
        Self {
            shared: Arc::new(SftpShared {
                session,
                channel: start.channel,
                version: start.version.version,
                extensions: start.version.extensions,
                state: Mutex::new(SftpState::new(start.inbound)),
            }),
        }
    }

    /// Protocol version the server answered with.
    pub fn version(&self) -> u32 {
        self.shared.version
    }

    /// Extensions the server advertised, as name and data pairs.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.shared.extensions
    }

    /// Status code of the last SFTP failure, 0 when the last request succeeded.
    pub fn last_error(&self) -> u32 {
        self.shared.state.lock().last_status
    }

    fn call<T, F>(&self, request: Request, mut finish: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut SftpState, Response) -> TetherResult<T>,
    {
        let channel = self.shared.channel;
        self.shared.drive(|state, inner| {
            let mut slot = state.pending.take();
            let result = state.exchange(inner, channel, &mut slot, request.clone(), true);
            state.pending = slot;
            Ok(finish(state, result?)?)
        })
    }

    /// Opens a file.
    pub fn open(&self, path: &str, flags: u32, mode: u32) -> TetherResult<Progress<SftpHandle>> {
        self.open_ex(path, flags, mode, OpenType::File)
    }

    /// Opens a directory.
    pub fn opendir(&self, path: &str) -> TetherResult<Progress<SftpHandle>> {
        self.open_ex(path, 0, 0, OpenType::Dir)
    }

    /// Opens a file or a directory.
    pub fn open_ex(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
        kind: OpenType,
    ) -> TetherResult<Progress<SftpHandle>> {
        let request = match kind {
            OpenType::File => {
                let attrs = SftpAttributes::new().with_permissions(mode);
                Request::new(
                    SftpMessageType::Open,
                    attrs.write(Writer::new().string(path).u32(flags)),
                )
            }
            OpenType::Dir => Request::path(SftpMessageType::OpenDir, path),
        };
        let what = match kind {
            OpenType::File => "open",
            OpenType::Dir => "opendir",
        };
        let progress = self.call(request, |state, response| state.expect_handle(response, what))?;
        Ok(progress.map(|handle| {
            debug!(path, ?kind, "SFTP handle opened");
            SftpHandle::new(Arc::clone(&self.shared), handle, kind, path)
        }))
    }

    /// Attributes of `path`, following symbolic links.
    pub fn stat(&self, path: &str) -> TetherResult<Progress<SftpAttributes>> {
        self.call(Request::path(SftpMessageType::Stat, path), |state, response| {
            state.expect_attrs(response, "stat")
        })
    }

    /// Attributes of `path` itself.
    pub fn lstat(&self, path: &str) -> TetherResult<Progress<SftpAttributes>> {
        self.call(Request::path(SftpMessageType::LStat, path), |state, response| {
            state.expect_attrs(response, "lstat")
        })
    }

    /// Changes the attributes named in `attrs.flags`.
    pub fn setstat(&self, path: &str, attrs: &SftpAttributes) -> TetherResult<Progress<()>> {
        let request = Request::new(SftpMessageType::SetStat, attrs.write(Writer::new().string(path)));
        self.call(request, |state, response| state.expect_ok(response, "setstat"))
    }

    /// Canonical absolute form of `path`.
    ///
    /// A result longer than `max_len` bytes fails with a buffer-too-small
    /// error.
    pub fn realpath(&self, path: &str, max_len: usize) -> TetherResult<Progress<String>> {
        self.call(Request::path(SftpMessageType::RealPath, path), |state, response| {
            let name = state.expect_name(response, "realpath")?;
            if name.len() > max_len {
                return Err(TetherError::BufferTooSmall {
                    required: name.len(),
                    available: max_len,
                });
            }
            Ok(name)
        })
    }

    /// Creates a symbolic link at `path` pointing to `target`.
    pub fn symlink(&self, path: &str, target: &str) -> TetherResult<Progress<()>> {
        let request = Request::new(
            SftpMessageType::Symlink,
            Writer::new().string(path).string(target),
        );
        self.call(request, |state, response| state.expect_ok(response, "symlink"))
    }

    /// Target of the symbolic link at `path`.
    pub fn readlink(&self, path: &str) -> TetherResult<Progress<String>> {
        self.call(Request::path(SftpMessageType::ReadLink, path), |state, response| {
            state.expect_name(response, "readlink")
        })
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> TetherResult<Progress<()>> {
        let attrs = SftpAttributes::new().with_permissions(mode);
        let request = Request::new(SftpMessageType::MkDir, attrs.write(Writer::new().string(path)));
        self.call(request, |state, response| state.expect_ok(response, "mkdir"))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> TetherResult<Progress<()>> {
        self.call(Request::path(SftpMessageType::RmDir, path), |state, response| {
            state.expect_ok(response, "rmdir")
        })
    }

    /// Removes a file.
    pub fn unlink(&self, path: &str) -> TetherResult<Progress<()>> {
        self.call(Request::path(SftpMessageType::Remove, path), |state, response| {
            state.expect_ok(response, "unlink")
        })
    }

    /// Renames, replacing an existing target where the server allows it.
    pub fn rename(&self, src: &str, dst: &str) -> TetherResult<Progress<()>> {
        self.rename_ex(
            src,
            dst,
            RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE,
        )
    }

    /// Renames with explicit [`RenameFlags`].
    ///
    /// Version 3 has no rename flags; OVERWRITE is honoured through
    /// `posix-rename@openssh.com` when the server offers it.
    pub fn rename_ex(&self, src: &str, dst: &str, flags: u32) -> TetherResult<Progress<()>> {
        let paths = Writer::new().string(src).string(dst);
        let request = if flags & RenameFlags::OVERWRITE != 0 && self.shared.supports(POSIX_RENAME) {
            Request::extended(POSIX_RENAME, paths)
        } else {
            Request::new(SftpMessageType::Rename, paths)
        };
        self.call(request, |state, response| state.expect_ok(response, "rename"))
    }

    /// File system statistics for the file system holding `path`.
    pub fn statvfs(&self, path: &str) -> TetherResult<Progress<SftpStatVfs>> {
        let request = Request::extended(STATVFS, Writer::new().string(path));
        self.call(request, |state, response| state.expect_statvfs(response, "statvfs"))
    }
}

impl std::fmt::Debug for Sftp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sftp")
            .field("channel", &self.shared.channel)
            .field("version", &self.shared.version)
            .finish()
    }
}

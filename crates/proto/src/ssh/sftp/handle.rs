//! Open SFTP files and directories.

use super::message::{Request, Response, SftpMessageType, MAX_DATA};
use super::types::{DirEntry, OpenType, SftpAttributes, SftpStatVfs, SftpStatus};
use super::{unexpected, Pending, SftpShared, SftpState, FSTATVFS, FSYNC};
use crate::ssh::channel::into_io;
use crate::ssh::nonblocking::{Halt, Progress, Step};
use crate::ssh::session::inner::SessionInner;
use crate::ssh::wire::Writer;
use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tether_platform::{TetherError, TetherResult};
use tracing::debug;

/// Per-handle protocol state.
#[derive(Debug)]
struct HandleState {
    handle: Vec<u8>,
    kind: OpenType,
    path: String,
    open: bool,
    offset: u64,
    attrs: Option<SftpAttributes>,
    /// Data received beyond what the caller's buffer held
    leftover: Vec<u8>,
    entries: VecDeque<DirEntry>,
    dir_eof: bool,
    /// Set by a rewind; the next readdir reopens the directory
    reopen: bool,
    pending: Option<Pending>,
    /// Length requested by the READ or WRITE in `pending`
    inflight: usize,
}

impl HandleState {
    fn check_open(&self) -> Step<()> {
        if self.open {
            Ok(())
        } else {
            Err(TetherError::invalid_use("SFTP handle not valid: already closed").into())
        }
    }

    fn exchange(
        &mut self,
        state: &mut SftpState,
        inner: &mut SessionInner,
        channel: u32,
        request: Request,
    ) -> Step<Response> {
        state.exchange(inner, channel, &mut self.pending, request, false)
    }

    fn read(&mut self, state: &mut SftpState, inner: &mut SessionInner, channel: u32, buf: &mut [u8]) -> Step<usize> {
        self.check_open()?;
        if self.kind != OpenType::File {
            return Err(TetherError::invalid_use("read on a directory handle").into());
        }
        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_none() {
            self.inflight = buf.len().min(MAX_DATA);
        }
        let body = Writer::new()
            .bytes(&self.handle)
            .u64(self.offset)
            .u32(self.inflight as u32);
        let request = Request::new(SftpMessageType::Read, body);
        match self.exchange(state, inner, channel, request)? {
            Response::Data(data) => {
                self.offset += data.len() as u64;
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.leftover.extend_from_slice(&data[n..]);
                Ok(n)
            }
            Response::Status { code, .. } if code == SftpStatus::Eof as u32 => Ok(0),
            Response::Status { code, message } => Err(state.failure(code, &message, "read").into()),
            other => Err(unexpected(&other, "read").into()),
        }
    }

    fn write(&mut self, state: &mut SftpState, inner: &mut SessionInner, channel: u32, data: &[u8]) -> Step<usize> {
        self.check_open()?;
        if self.kind != OpenType::File {
            return Err(TetherError::invalid_use("write on a directory handle").into());
        }
        if data.is_empty() {
            return Ok(0);
        }
        if self.pending.is_none() {
            self.inflight = data.len().min(MAX_DATA);
        }
        let chunk = &data[..self.inflight.min(data.len())];
        let body = Writer::new().bytes(&self.handle).u64(self.offset).bytes(chunk);
        let response = self.exchange(state, inner, channel, Request::new(SftpMessageType::Write, body))?;
        state.expect_ok(response, "write")?;
        self.offset += self.inflight as u64;
        Ok(self.inflight)
    }

    fn readdir(&mut self, state: &mut SftpState, inner: &mut SessionInner, channel: u32) -> Step<Option<DirEntry>> {
        self.check_open()?;
        if self.kind != OpenType::Dir {
            return Err(TetherError::invalid_use("readdir on a file handle").into());
        }
        if self.reopen {
            // READDIR has no rewind; a fresh handle starts at the top.
            let request = Request::path(SftpMessageType::OpenDir, &self.path);
            let response = self.exchange(state, inner, channel, request)?;
            let handle = state.expect_handle(response, "opendir")?;
            let stale = std::mem::replace(&mut self.handle, handle);
            state.fire_and_forget(&Request::handle(SftpMessageType::Close, &stale));
            self.reopen = false;
            debug!(path = %self.path, "directory reopened for rewind");
        }
        loop {
            if let Some(entry) = self.entries.pop_front() {
                return Ok(Some(entry));
            }
            if self.dir_eof {
                return Ok(None);
            }
            let request = Request::handle(SftpMessageType::ReadDir, &self.handle);
            match self.exchange(state, inner, channel, request)? {
                Response::Name(entries) => self.entries.extend(entries),
                Response::Status { code, .. } if code == SftpStatus::Eof as u32 => {
                    self.dir_eof = true;
                }
                Response::Status { code, message } => {
                    return Err(state.failure(code, &message, "readdir").into())
                }
                other => return Err(unexpected(&other, "readdir").into()),
            }
        }
    }

    fn seek(&mut self, offset: u64) -> TetherResult<()> {
        if !self.open {
            return Err(TetherError::invalid_use("SFTP handle not valid: already closed"));
        }
        if self.pending.is_some() {
            return Err(TetherError::invalid_use("cannot seek while a request is in progress"));
        }
        self.offset = offset;
        self.leftover.clear();
        if self.kind == OpenType::Dir && offset == 0 {
            self.entries.clear();
            self.dir_eof = false;
            self.reopen = true;
        }
        Ok(())
    }
}

/// An open remote file or directory.
///
/// Every operation after [`close`](SftpHandle::close) fails with an
/// invalid-use error. Dropping an open handle closes it on the server
/// without waiting for the reply.
pub struct SftpHandle {
    sftp: Arc<SftpShared>,
    state: HandleState,
}

impl SftpHandle {
    pub(crate) fn new(sftp: Arc<SftpShared>, handle: Vec<u8>, kind: OpenType, path: &str) -> Self {
        Self {
            sftp,
            state: HandleState {
                handle,
                kind,
                path: path.to_string(),
                open: true,
                offset: 0,
                attrs: None,
                leftover: Vec::new(),
                entries: VecDeque::new(),
                dir_eof: false,
                reopen: false,
                pending: None,
                inflight: 0,
            },
        }
    }

    fn drive<T, F>(&mut self, mut op: F) -> TetherResult<Progress<T>>
    where
        F: FnMut(&mut HandleState, &mut SftpState, &mut SessionInner, u32) -> Step<T>,
    {
        let Self { sftp, state: handle } = self;
        let channel = sftp.channel;
        sftp.drive(|state, inner| op(&mut *handle, state, inner, channel))
    }

    /// Path the handle was opened with.
    pub fn path(&self) -> &str {
        &self.state.path
    }

    /// File or directory.
    pub fn kind(&self) -> OpenType {
        self.state.kind
    }

    /// False once closed.
    pub fn is_open(&self) -> bool {
        self.state.open
    }

    /// Attributes from the last successful [`fstat`](SftpHandle::fstat).
    pub fn cached_attrs(&self) -> Option<SftpAttributes> {
        self.state.attrs
    }

    /// Reads from the current offset; `Complete(0)` is end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> TetherResult<Progress<usize>> {
        self.drive(|h, state, inner, channel| h.read(state, inner, channel, &mut *buf))
    }

    /// Writes at the current offset.
    ///
    /// At most [`MAX_DATA`] bytes go out per call. Retrying after
    /// would-block completes the request already sent and reports its length.
    pub fn write(&mut self, data: &[u8]) -> TetherResult<Progress<usize>> {
        self.drive(|h, state, inner, channel| h.write(state, inner, channel, data))
    }

    /// Next directory entry, `None` at the end.
    pub fn readdir(&mut self) -> TetherResult<Progress<Option<DirEntry>>> {
        self.drive(|h, state, inner, channel| h.readdir(state, inner, channel))
    }

    /// Attributes of the open file.
    pub fn fstat(&mut self) -> TetherResult<Progress<SftpAttributes>> {
        self.drive(|h, state, inner, channel| {
            h.check_open()?;
            let request = Request::handle(SftpMessageType::FStat, &h.handle);
            let response = h.exchange(state, inner, channel, request)?;
            let attrs = state.expect_attrs(response, "fstat")?;
            h.attrs = Some(attrs);
            Ok(attrs)
        })
    }

    /// Changes the attributes named in `attrs.flags`.
    pub fn fsetstat(&mut self, attrs: &SftpAttributes) -> TetherResult<Progress<()>> {
        self.drive(|h, state, inner, channel| {
            h.check_open()?;
            let body = attrs.write(Writer::new().bytes(&h.handle));
            let response = h.exchange(state, inner, channel, Request::new(SftpMessageType::FSetStat, body))?;
            Ok(state.expect_ok(response, "fsetstat")?)
        })
    }

    /// File system statistics (`fstatvfs@openssh.com`).
    pub fn fstatvfs(&mut self) -> TetherResult<Progress<SftpStatVfs>> {
        self.drive(|h, state, inner, channel| {
            h.check_open()?;
            let request = Request::extended(FSTATVFS, Writer::new().bytes(&h.handle));
            let response = h.exchange(state, inner, channel, request)?;
            Ok(state.expect_statvfs(response, "fstatvfs")?)
        })
    }

    /// Flushes the file to stable storage (`fsync@openssh.com`).
    pub fn fsync(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|h, state, inner, channel| {
            h.check_open()?;
            let request = Request::extended(FSYNC, Writer::new().bytes(&h.handle));
            let response = h.exchange(state, inner, channel, request)?;
            Ok(state.expect_ok(response, "fsync")?)
        })
    }

    /// Moves the offset used by the next read or write.
    pub fn seek(&mut self, offset: u64) -> TetherResult<()> {
        self.state.seek(offset)
    }

    /// Offset of the next read or write.
    pub fn tell(&self) -> u64 {
        self.state.offset
    }

    /// Back to the start.
    ///
    /// A directory is reopened on the next [`readdir`](SftpHandle::readdir)
    /// and listed again from the top.
    pub fn rewind(&mut self) -> TetherResult<()> {
        self.state.seek(0)
    }

    /// Closes the handle on the server.
    pub fn close(&mut self) -> TetherResult<Progress<()>> {
        self.drive(|h, state, inner, channel| {
            h.check_open()?;
            let request = Request::handle(SftpMessageType::Close, &h.handle);
            let response = match h.exchange(state, inner, channel, request) {
                Err(Halt::Block(dirs)) => return Err(Halt::Block(dirs)),
                other => other,
            };
            h.open = false;
            debug!(path = %h.path, "SFTP handle closed");
            Ok(state.expect_ok(response?, "close")?)
        })
    }
}

impl Drop for SftpHandle {
    fn drop(&mut self) {
        if !self.state.open {
            return;
        }
        let mut state = self.sftp.state.lock();
        state.abandon(&mut self.state.pending);
        state.fire_and_forget(&Request::handle(SftpMessageType::Close, &self.state.handle));
        if let Some(session) = self.sftp.session.upgrade() {
            let mut inner = session.lock();
            if let Err(Halt::Fail(err)) =
                state.flush_requests(&mut inner, self.sftp.channel)
            {
                debug!(error = %err, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for SftpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpHandle")
            .field("path", &self.state.path)
            .field("kind", &self.state.kind)
            .field("open", &self.state.open)
            .field("offset", &self.state.offset)
            .finish()
    }
}

impl io::Read for SftpHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        into_io(SftpHandle::read(self, buf))
    }
}

impl io::Write for SftpHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        into_io(SftpHandle::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for SftpHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.state.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let attrs = into_io(self.fstat())?;
                attrs.size.checked_add_signed(delta)
            }
        };
        let offset = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        self.state
            .seek(offset)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: OpenType) -> HandleState {
        HandleState {
            handle: b"h1".to_vec(),
            kind,
            path: "/tmp/x".to_string(),
            open: true,
            offset: 0,
            attrs: None,
            leftover: Vec::new(),
            entries: VecDeque::new(),
            dir_eof: false,
            reopen: false,
            pending: None,
            inflight: 0,
        }
    }

    #[test]
    fn test_seek_clears_leftover() {
        let mut handle = state(OpenType::File);
        handle.leftover = vec![1, 2, 3];
        handle.seek(10).unwrap();
        assert_eq!(handle.offset, 10);
        assert!(handle.leftover.is_empty());
    }

    #[test]
    fn test_rewind_restarts_directory_listing() {
        let mut handle = state(OpenType::Dir);
        handle.dir_eof = true;
        handle.entries.push_back(DirEntry {
            name: "stale".to_string(),
            longentry: String::new(),
            attrs: SftpAttributes::new(),
        });
        handle.seek(0).unwrap();
        assert!(!handle.dir_eof);
        assert!(handle.entries.is_empty());
        assert!(handle.reopen);
    }

    #[test]
    fn test_closed_handle_rejects_seek() {
        let mut handle = state(OpenType::File);
        handle.open = false;
        assert!(handle.seek(0).is_err());
        assert!(handle.check_open().is_err());
    }
}

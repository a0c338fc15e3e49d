//! SFTP protocol messages.
//!
//! Defines SFTP message types, packet framing and response parsing.

use super::types::{DirEntry, SftpAttributes};
use crate::ssh::wire::{Reader, Writer};
use tether_platform::{TetherError, TetherResult};

/// SFTP protocol version (v3).
pub const SFTP_VERSION: u32 = 3;

/// Most data carried by one READ or WRITE request.
pub const MAX_DATA: usize = 30000;

/// Largest inbound packet accepted.
pub(crate) const MAX_PACKET: usize = 256 * 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get file attributes (no follow symlinks)
    LStat = 7,
    /// SSH_FXP_FSTAT - Get file attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set file attributes
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set file attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link
    Symlink = 20,

    // Response messages
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,

    // Extended messages
    /// SSH_FXP_EXTENDED - Extended request
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY - Extended response
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

/// A request before it is given an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub(crate) msg_type: SftpMessageType,
    pub(crate) body: Vec<u8>,
}

impl Request {
    pub(crate) fn new(msg_type: SftpMessageType, body: Writer) -> Self {
        Self {
            msg_type,
            body: body.finish(),
        }
    }

    /// Request carrying a single path.
    pub(crate) fn path(msg_type: SftpMessageType, path: &str) -> Self {
        Self::new(msg_type, Writer::new().string(path))
    }

    /// Request carrying a single handle.
    pub(crate) fn handle(msg_type: SftpMessageType, handle: &[u8]) -> Self {
        Self::new(msg_type, Writer::new().bytes(handle))
    }

    /// `SSH_FXP_EXTENDED` for a named extension.
    pub(crate) fn extended(name: &str, body: Writer) -> Self {
        let w = Writer::new().string(name).raw(&body.finish());
        Self::new(SftpMessageType::Extended, w)
    }

    /// Serializes with the request id.
    ///
    /// Format:
    /// ```text
    /// uint32    length
    /// byte      type
    /// uint32    request-id
    /// byte[n]   body
    /// ```
    pub(crate) fn to_bytes(&self, id: u32) -> Vec<u8> {
        let length = (self.body.len() + 5) as u32;
        Writer::new()
            .u32(length)
            .u8(self.msg_type as u8)
            .u32(id)
            .raw(&self.body)
            .finish()
    }
}

/// `SSH_FXP_INIT` asking for version 3.
pub(crate) fn init_packet() -> Vec<u8> {
    Writer::new()
        .u32(5)
        .u8(SftpMessageType::Init as u8)
        .u32(SFTP_VERSION)
        .finish()
}

/// Server version and advertised extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Version {
    pub(crate) version: u32,
    pub(crate) extensions: Vec<(String, String)>,
}

impl Version {
    /// Parses an `SSH_FXP_VERSION` packet (without its length).
    pub(crate) fn parse(packet: &[u8]) -> TetherResult<Self> {
        let mut r = Reader::new(packet);
        let msg = r.u8()?;
        if msg != SftpMessageType::Version as u8 {
            return Err(sftp_protocol(format!("expected SSH_FXP_VERSION, got {}", msg)));
        }
        let version = r.u32()?;
        let mut extensions = Vec::new();
        while r.remaining() > 0 {
            let name = r.string()?;
            let data = r.string()?;
            extensions.push((name, data));
        }
        Ok(Self {
            version,
            extensions,
        })
    }
}

/// A server response, already matched to its request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Response {
    Status { code: u32, message: String },
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Name(Vec<DirEntry>),
    Attrs(SftpAttributes),
    ExtendedReply(Vec<u8>),
}

impl Response {
    /// Request id of a packet (without its length).
    pub(crate) fn id(packet: &[u8]) -> TetherResult<u32> {
        let mut r = Reader::new(packet);
        r.u8()?;
        r.u32()
    }

    /// Parses a response packet (without its length).
    pub(crate) fn parse(packet: &[u8]) -> TetherResult<Self> {
        let mut r = Reader::new(packet);
        let msg = r.u8()?;
        let _id = r.u32()?;
        let response = match SftpMessageType::from_u8(msg) {
            Some(SftpMessageType::Status) => {
                let code = r.u32()?;
                // Version 3 servers may omit the message and language tag.
                let message = if r.remaining() > 0 { r.string()? } else { String::new() };
                Response::Status { code, message }
            }
            Some(SftpMessageType::Handle) => Response::Handle(r.bytes()?.to_vec()),
            Some(SftpMessageType::Data) => Response::Data(r.bytes()?.to_vec()),
            Some(SftpMessageType::Name) => {
                let count = r.u32()? as usize;
                if count > r.remaining() / 12 {
                    return Err(sftp_protocol(format!("name count {} exceeds packet", count)));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = r.string()?;
                    let longentry = r.string()?;
                    let attrs = SftpAttributes::read(&mut r)?;
                    entries.push(DirEntry {
                        name,
                        longentry,
                        attrs,
                    });
                }
                Response::Name(entries)
            }
            Some(SftpMessageType::Attrs) => Response::Attrs(SftpAttributes::read(&mut r)?),
            Some(SftpMessageType::ExtendedReply) => Response::ExtendedReply(r.rest().to_vec()),
            _ => return Err(sftp_protocol(format!("unexpected SFTP response type {}", msg))),
        };
        Ok(response)
    }
}

/// Reassembles length-prefixed packets from channel data.
#[derive(Debug, Default)]
pub(crate) struct PacketBuffer {
    buf: Vec<u8>,
}

impl PacketBuffer {
    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Removes and returns the next complete packet, without its length.
    pub(crate) fn next_packet(&mut self) -> TetherResult<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 || length > MAX_PACKET {
            return Err(sftp_protocol(format!("invalid SFTP packet length {}", length)));
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }
        let packet = self.buf[4..4 + length].to_vec();
        self.buf.drain(..4 + length);
        Ok(Some(packet))
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

pub(crate) fn sftp_protocol(message: impl Into<String>) -> TetherError {
    TetherError::Sftp {
        status: 0,
        message: message.into(),
    }
}

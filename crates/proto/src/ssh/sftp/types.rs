//! SFTP data types and structures.

use crate::ssh::wire::{Reader, Writer};
use tether_platform::TetherResult;

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SftpStatus {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
    /// SSH_FX_INVALID_HANDLE
    InvalidHandle = 9,
    /// SSH_FX_NO_SUCH_PATH
    NoSuchPath = 10,
    /// SSH_FX_FILE_ALREADY_EXISTS
    FileAlreadyExists = 11,
    /// SSH_FX_WRITE_PROTECT
    WriteProtect = 12,
    /// SSH_FX_NO_MEDIA
    NoMedia = 13,
    /// SSH_FX_NO_SPACE_ON_FILESYSTEM
    NoSpaceOnFilesystem = 14,
    /// SSH_FX_QUOTA_EXCEEDED
    QuotaExceeded = 15,
    /// SSH_FX_UNKNOWN_PRINCIPAL
    UnknownPrincipal = 16,
    /// SSH_FX_LOCK_CONFLICT
    LockConflict = 17,
    /// SSH_FX_DIR_NOT_EMPTY
    DirNotEmpty = 18,
    /// SSH_FX_NOT_A_DIRECTORY
    NotADirectory = 19,
    /// SSH_FX_INVALID_FILENAME
    InvalidFilename = 20,
    /// SSH_FX_LINK_LOOP
    LinkLoop = 21,
}

impl SftpStatus {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        use SftpStatus::*;
        Some(match value {
            0 => Ok,
            1 => Eof,
            2 => NoSuchFile,
            3 => PermissionDenied,
            4 => Failure,
            5 => BadMessage,
            6 => NoConnection,
            7 => ConnectionLost,
            8 => OpUnsupported,
            9 => InvalidHandle,
            10 => NoSuchPath,
            11 => FileAlreadyExists,
            12 => WriteProtect,
            13 => NoMedia,
            14 => NoSpaceOnFilesystem,
            15 => QuotaExceeded,
            16 => UnknownPrincipal,
            17 => LockConflict,
            18 => DirNotEmpty,
            19 => NotADirectory,
            20 => InvalidFilename,
            21 => LinkLoop,
            _ => return None,
        })
    }

    /// Returns error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
            Self::InvalidHandle => "Invalid handle",
            Self::NoSuchPath => "No such path",
            Self::FileAlreadyExists => "File already exists",
            Self::WriteProtect => "Write protected",
            Self::NoMedia => "No media",
            Self::NoSpaceOnFilesystem => "No space left on filesystem",
            Self::QuotaExceeded => "Quota exceeded",
            Self::UnknownPrincipal => "Unknown principal",
            Self::LockConflict => "Lock conflict",
            Self::DirNotEmpty => "Directory not empty",
            Self::NotADirectory => "Not a directory",
            Self::InvalidFilename => "Invalid filename",
            Self::LinkLoop => "Too many symbolic links",
        }
    }
}

/// File type flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

/// File open flags (SSH_FXF_*).
#[derive(Debug, Clone, Copy)]
pub struct FileOpenFlags(pub u32);

impl FileOpenFlags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: u32 = 0x00000001;
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: u32 = 0x00000004;
    /// SSH_FXF_CREAT - Create if doesn't exist
    pub const CREAT: u32 = 0x00000008;
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNC: u32 = 0x00000010;
    /// SSH_FXF_EXCL - Fail if file exists
    pub const EXCL: u32 = 0x00000020;
}

/// Rename flags for [`Sftp::rename_ex`](super::Sftp::rename_ex).
#[derive(Debug, Clone, Copy)]
pub struct RenameFlags(pub u32);

impl RenameFlags {
    /// Replace an existing target
    pub const OVERWRITE: u32 = 0x00000001;
    /// Rename atomically
    pub const ATOMIC: u32 = 0x00000002;
    /// Use the server's native rename semantics
    pub const NATIVE: u32 = 0x00000004;
}

/// What [`Sftp::open_ex`](super::Sftp::open_ex) opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenType {
    /// A file, via SSH_FXP_OPEN
    File,
    /// A directory, via SSH_FXP_OPENDIR
    Dir,
}

/// File mode bits, including the file type in the high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// File type mask
    pub const TYPE_MASK: u32 = 0o170000;
    /// Regular file
    pub const REGULAR: u32 = 0o100000;
    /// Directory
    pub const DIRECTORY: u32 = 0o040000;
    /// Symbolic link
    pub const SYMLINK: u32 = 0o120000;

    /// Owner read
    pub const USER_READ: u32 = 0o400;
    /// Owner write
    pub const USER_WRITE: u32 = 0o200;
    /// Owner execute
    pub const USER_EXEC: u32 = 0o100;
    /// Group read
    pub const GROUP_READ: u32 = 0o040;
    /// Group write
    pub const GROUP_WRITE: u32 = 0o020;
    /// Group execute
    pub const GROUP_EXEC: u32 = 0o010;
    /// Others read
    pub const OTHER_READ: u32 = 0o004;
    /// Others write
    pub const OTHER_WRITE: u32 = 0o002;
    /// Others execute
    pub const OTHER_EXEC: u32 = 0o001;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;
}

/// File attribute flags.
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags(pub u32);

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x00000001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x00000002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x00000004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x00000008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x80000000;
}

/// File attributes.
///
/// `flags` names the fields that carry values; the others are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SftpAttributes {
    /// Valid fields (`AttrFlags`)
    pub flags: u32,
    /// File size in bytes
    pub size: u64,
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
    /// Permissions, including the file type bits
    pub permissions: u32,
    /// Access time (Unix timestamp)
    pub atime: u64,
    /// Modification time (Unix timestamp)
    pub mtime: u64,
}

impl SftpAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self.flags |= AttrFlags::SIZE;
        self
    }

    /// Sets owner and group.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.flags |= AttrFlags::UIDGID;
        self
    }

    /// Sets the permission bits.
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self.flags |= AttrFlags::PERMISSIONS;
        self
    }

    /// Sets access and modification times.
    pub fn with_times(mut self, atime: u64, mtime: u64) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self.flags |= AttrFlags::ACMODTIME;
        self
    }

    /// Type encoded in the permission bits.
    pub fn file_type(&self) -> FileType {
        if self.flags & AttrFlags::PERMISSIONS == 0 {
            return FileType::Unknown;
        }
        match self.permissions & FileMode::TYPE_MASK {
            FileMode::REGULAR => FileType::Regular,
            FileMode::DIRECTORY => FileType::Directory,
            FileMode::SYMLINK => FileType::Symlink,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// True for regular files.
    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    /// Appends the wire form to `w`.
    pub(crate) fn write(&self, w: Writer) -> Writer {
        let flags = self.flags & !AttrFlags::EXTENDED;
        let mut w = w.u32(flags);
        if flags & AttrFlags::SIZE != 0 {
            w = w.u64(self.size);
        }
        if flags & AttrFlags::UIDGID != 0 {
            w = w.u32(self.uid).u32(self.gid);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            w = w.u32(self.permissions);
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            w = w.u32(wire_time(self.atime)).u32(wire_time(self.mtime));
        }
        w
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.write(Writer::new()).finish()
    }

    /// Reads attributes, skipping extended pairs.
    pub(crate) fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        let flags = r.u32()?;
        let mut attrs = Self {
            flags: flags & !AttrFlags::EXTENDED,
            ..Self::default()
        };
        if flags & AttrFlags::SIZE != 0 {
            attrs.size = r.u64()?;
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = r.u32()?;
            attrs.gid = r.u32()?;
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = r.u32()?;
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = u64::from(r.u32()?);
            attrs.mtime = u64::from(r.u32()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = r.u32()?;
            for _ in 0..count {
                r.bytes()?;
                r.bytes()?;
            }
        }
        Ok(attrs)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        Self::read(&mut Reader::new(data))
    }
}

/// Version 3 carries 32-bit times.
fn wire_time(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// One directory entry from `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name
    pub name: String,
    /// `ls -l` style line from the server
    pub longentry: String,
    /// Attributes
    pub attrs: SftpAttributes,
}

/// File system statistics (`statvfs@openssh.com`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SftpStatVfs {
    /// File system block size
    pub bsize: u64,
    /// Fundamental block size
    pub frsize: u64,
    /// Blocks, in units of `frsize`
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks for unprivileged users
    pub bavail: u64,
    /// Inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Free inodes for unprivileged users
    pub favail: u64,
    /// File system id
    pub fsid: u64,
    /// Mount flags
    pub flag: u64,
    /// Maximum file name length
    pub namemax: u64,
}

impl SftpStatVfs {
    pub(crate) fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        Ok(Self {
            bsize: r.u64()?,
            frsize: r.u64()?,
            blocks: r.u64()?,
            bfree: r.u64()?,
            bavail: r.u64()?,
            files: r.u64()?,
            ffree: r.u64()?,
            favail: r.u64()?,
            fsid: r.u64()?,
            flag: r.u64()?,
            namemax: r.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        assert_eq!(SftpStatus::from_u32(0), Some(SftpStatus::Ok));
        assert_eq!(SftpStatus::from_u32(2), Some(SftpStatus::NoSuchFile));
        assert_eq!(SftpStatus::from_u32(21), Some(SftpStatus::LinkLoop));
        assert_eq!(SftpStatus::from_u32(22), None);
    }

    #[test]
    fn test_attributes_only_write_flagged_fields() {
        let attrs = SftpAttributes::new()
            .with_size(1024)
            .with_permissions(FileMode::REGULAR | 0o644);

        let bytes = attrs.to_bytes();
        // flags + size + permissions
        assert_eq!(bytes.len(), 4 + 8 + 4);

        let parsed = SftpAttributes::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, attrs);
        assert!(parsed.is_file());
        assert_eq!(parsed.uid, 0);
    }

    #[test]
    fn test_attributes_skip_extended_pairs() {
        let bytes = Writer::new()
            .u32(AttrFlags::PERMISSIONS | AttrFlags::EXTENDED)
            .u32(FileMode::DIRECTORY | 0o755)
            .u32(1)
            .string("vendor@example.com")
            .string("value")
            .u32(42)
            .finish();
        let mut r = Reader::new(&bytes);
        let attrs = SftpAttributes::read(&mut r).unwrap();
        assert!(attrs.is_dir());
        assert_eq!(attrs.flags, AttrFlags::PERMISSIONS);
        assert_eq!(r.u32().unwrap(), 42);
    }

    #[test]
    fn test_file_type_without_permissions() {
        assert_eq!(SftpAttributes::new().with_size(1).file_type(), FileType::Unknown);
    }

    #[test]
    fn test_truncated_attributes() {
        let bytes = Writer::new().u32(AttrFlags::SIZE).u32(7).finish();
        assert!(SftpAttributes::from_bytes(&bytes).is_err());
    }
}

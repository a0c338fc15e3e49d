//! The would-block retry contract.
//!
//! Every resumable operation returns `TetherResult<Progress<T>>`. A
//! [`Progress::WouldBlock`] result is not a failure: progress made so far is
//! kept in the object the operation was called on, and calling the same
//! operation again continues from there. The directions tell the caller which
//! readiness to wait for before retrying.
//!
//! In blocking mode the session performs that wait itself, so callers only
//! ever see [`Progress::Complete`].
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::nonblocking::{retry_would_block, BlockDirections, Progress};
//!
//! let mut attempts = 0;
//! let value = retry_would_block(
//!     || {
//!         attempts += 1;
//!         Ok(if attempts < 3 {
//!             Progress::WouldBlock(BlockDirections::Inbound)
//!         } else {
//!             Progress::Complete(attempts)
//!         })
//!     },
//!     |_| Ok(()),
//! )
//! .unwrap();
//! assert_eq!(value, 3);
//! ```

use tether_platform::{TetherError, TetherResult, TransportFailure};

/// Directions the caller must wait on before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDirections {
    /// Not blocked
    #[default]
    None,
    /// Waiting to read
    Inbound,
    /// Waiting to write
    Outbound,
    /// Waiting on both
    Both,
}

impl BlockDirections {
    /// True when reading is awaited.
    pub fn inbound(self) -> bool {
        matches!(self, BlockDirections::Inbound | BlockDirections::Both)
    }

    /// True when writing is awaited.
    pub fn outbound(self) -> bool {
        matches!(self, BlockDirections::Outbound | BlockDirections::Both)
    }

    /// Combines two sets of directions.
    pub fn union(self, other: BlockDirections) -> BlockDirections {
        match (self.inbound() || other.inbound(), self.outbound() || other.outbound()) {
            (true, true) => BlockDirections::Both,
            (true, false) => BlockDirections::Inbound,
            (false, true) => BlockDirections::Outbound,
            (false, false) => BlockDirections::None,
        }
    }
}

/// Outcome of one call to a resumable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Progress<T> {
    /// The operation finished
    Complete(T),
    /// Retry after the transport is ready in these directions
    WouldBlock(BlockDirections),
}

impl<T> Progress<T> {
    /// Maps the completed value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Progress<U> {
        match self {
            Progress::Complete(value) => Progress::Complete(f(value)),
            Progress::WouldBlock(dirs) => Progress::WouldBlock(dirs),
        }
    }

    /// True when the operation finished.
    pub fn is_complete(&self) -> bool {
        matches!(self, Progress::Complete(_))
    }

    /// The completed value, if any.
    pub fn complete(self) -> Option<T> {
        match self {
            Progress::Complete(value) => Some(value),
            Progress::WouldBlock(_) => None,
        }
    }

    /// The directions to wait on, if blocked.
    pub fn would_block(&self) -> Option<BlockDirections> {
        match self {
            Progress::Complete(_) => None,
            Progress::WouldBlock(dirs) => Some(*dirs),
        }
    }
}

/// Internal stop reason of a state machine step.
#[derive(Debug)]
pub(crate) enum Halt {
    /// Transport cannot progress now
    Block(BlockDirections),
    /// Operation failed
    Fail(TetherError),
}

impl From<TetherError> for Halt {
    fn from(err: TetherError) -> Self {
        Halt::Fail(err)
    }
}

/// Result of one internal step.
pub(crate) type Step<T> = Result<T, Halt>;

/// Runs an operation to completion, calling `poll` each time it would block.
///
/// Failures from either closure are returned unchanged.
pub fn retry_would_block<T, F, P>(mut op: F, mut poll: P) -> TetherResult<T>
where
    F: FnMut() -> TetherResult<Progress<T>>,
    P: FnMut(BlockDirections) -> TetherResult<()>,
{
    loop {
        match op()? {
            Progress::Complete(value) => return Ok(value),
            Progress::WouldBlock(dirs) => poll(dirs)?,
        }
    }
}

/// Writes all of `data` through a resumable writer.
///
/// Each call passes only the bytes not yet accepted, so nothing is written
/// twice however often the writer blocks.
pub fn write_all_resumable<F, P>(mut write: F, mut poll: P, data: &[u8]) -> TetherResult<()>
where
    F: FnMut(&[u8]) -> TetherResult<Progress<usize>>,
    P: FnMut(BlockDirections) -> TetherResult<()>,
{
    let mut offset = 0;
    while offset < data.len() {
        match write(&data[offset..])? {
            Progress::Complete(0) => {
                return Err(TetherError::transport(
                    TransportFailure::Send,
                    "writer accepted no bytes",
                ))
            }
            Progress::Complete(n) => offset += n,
            Progress::WouldBlock(dirs) => poll(dirs)?,
        }
    }
    Ok(())
}

/// Finds the end of the line starting at `pos`.
///
/// Returns the line length and the separator length (1 for `\n`, 2 for
/// `\r\n`), or `None` when no `\n` follows. A lone `\r` is not a separator.
pub fn find_eol(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let tail = buf.get(pos..)?;
    let newline = tail.iter().position(|&b| b == b'\n')?;
    if newline > 0 && tail[newline - 1] == b'\r' {
        Some((newline - 1, 2))
    } else {
        Some((newline, 1))
    }
}

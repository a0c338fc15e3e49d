//! # Tether Platform
//!
//! Shared error taxonomy for the tether SSH engine.
//!
//! This crate provides:
//! - The closed table of low-level numeric codes ([`ErrorCode`])
//! - The unified error type (`TetherError`, `TetherResult`) with one variant per failure kind
//! - [`check_code`], which interprets a raw return code without ever defaulting to success
//!
//! # Examples
//!
//! ```
//! use tether_platform::{check_code, ErrorKind, TetherResult};
//!
//! fn example_function() -> TetherResult<i32> {
//!     check_code(7)
//! }
//!
//! # fn main() -> TetherResult<()> {
//! assert_eq!(example_function()?, 7);
//! let err = check_code(-9999).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Unknown);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{
    check_code, AgentFailure, ChannelFailure, ErrorCode, ErrorKind, KnownHostsFailure,
    TetherError, TetherResult, TransportFailure,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

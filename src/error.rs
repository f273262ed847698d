//! Error types.
//!
//! Shared error enums for the whole crate. Wiring failures keep the small
//! integer codes of the connection protocol so they can be logged and
//! matched the way config authors know them.

use std::path::PathBuf;
use std::{error, fmt, io};

use ash::vk;

use crate::token::Token;

/// Failure modes of `connect()`, with their protocol codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    NoSuchDestNode,
    NoSuchDestConnector,
    DestDoesNotRead,
    DestInconsistent,
    NoSuchSrcNode,
    NoSuchSrcConnector,
    SrcDoesNotWrite,
    ChannelsDoNotMatch,
    FormatDoesNotMatch,
}

impl WireError {
    pub fn code(self) -> i32 {
        match self {
            WireError::NoSuchDestNode => 1,
            WireError::NoSuchDestConnector => 2,
            WireError::DestDoesNotRead => 3,
            WireError::DestInconsistent => 4,
            WireError::NoSuchSrcNode => 7,
            WireError::NoSuchSrcConnector => 8,
            WireError::SrcDoesNotWrite => 9,
            WireError::ChannelsDoNotMatch => 10,
            WireError::FormatDoesNotMatch => 11,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            WireError::NoSuchDestNode => "no such destination node",
            WireError::NoSuchDestConnector => "no such destination connector",
            WireError::DestDoesNotRead => "destination does not read",
            WireError::DestInconsistent => "destination inconsistent",
            WireError::NoSuchSrcNode => "no such source node",
            WireError::NoSuchSrcConnector => "no such source connector",
            WireError::SrcDoesNotWrite => "source does not write",
            WireError::ChannelsDoNotMatch => "channels do not match",
            WireError::FormatDoesNotMatch => "format does not match",
        };
        f.write_str(s)
    }
}

impl error::Error for WireError {}

#[derive(Debug)]
pub enum Error {
    Wire(WireError),
    /// Fixed-capacity storage (modules, nodes, params pool) ran out.
    Capacity(&'static str),
    NoSuchClass(Token),
    NoSuchModule { name: Token, inst: Token },
    NoSuchParam(Token),
    UnknownParamType(Token),
    /// A config field that is no valid token (empty or over eight bytes).
    BadToken(String),
    /// A param value that does not parse as its declared type.
    BadValue(Token),
    InvalidFormat(Token),
    /// The graph has no sink module to pull from.
    NoSink,
    /// A run flag requires a phase that has not executed yet.
    PhaseOrder(&'static str),
    /// Arena exhausted its logical address range.
    OutOfMemory(&'static str),
    Config { file: PathBuf, line: u32 },
    Loader(String),
    Io(io::Error),
    Vk(vk::Result),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Wire(e) => write!(f, "connection failed: {} (error {})", e, e.code()),
            Error::Capacity(what) => write!(f, "capacity exceeded: {}", what),
            Error::NoSuchClass(name) => write!(f, "no module class '{}'", name),
            Error::NoSuchModule { name, inst } => {
                write!(f, "no module '{}' instance '{}'", name, inst)
            }
            Error::NoSuchParam(name) => write!(f, "no such parameter '{}'", name),
            Error::UnknownParamType(t) => write!(f, "unknown param type '{}'", t),
            Error::BadToken(s) => write!(f, "invalid token '{}'", s),
            Error::BadValue(p) => write!(f, "malformed value for parameter '{}'", p),
            Error::InvalidFormat(t) => write!(f, "unsupported pixel format '{}'", t),
            Error::NoSink => write!(f, "graph has no sink module"),
            Error::PhaseOrder(what) => write!(f, "invalid phase order: {}", what),
            Error::OutOfMemory(which) => write!(f, "arena out of memory: {}", which),
            Error::Config { file, line } => {
                write!(f, "config parse failed at {}:{}", file.display(), line)
            }
            Error::Loader(msg) => write!(f, "vulkan loader: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Vk(r) => write!(f, "vulkan error: {:?}", r),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Error {
        Error::Wire(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<vk::Result> for Error {
    fn from(r: vk::Result) -> Error {
        Error::Vk(r)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_codes() {
        assert_eq!(WireError::NoSuchDestNode.code(), 1);
        assert_eq!(WireError::SrcDoesNotWrite.code(), 9);
        assert_eq!(WireError::ChannelsDoNotMatch.code(), 10);
        assert_eq!(WireError::FormatDoesNotMatch.code(), 11);
        assert_eq!(
            WireError::ChannelsDoNotMatch.to_string(),
            "channels do not match"
        );
    }
}

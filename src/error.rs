//! Crate-wide error and result types.

use std::fmt;
use std::io;

/// Result alias used throughout codetoy.
pub type Result<T> = std::result::Result<T, Error>;

/// All fatal errors the library can produce.
///
/// These correspond to the abort-the-whole-unmarshal error kinds of the
/// wire format. Non-fatal conditions (a solver corpus pair with mismatched
/// bytecode lengths, a cipher call on fewer than two words) are never
/// represented here - they are counted or silently tolerated by the
/// caller-visible APIs that can encounter them.
#[derive(Debug)]
pub enum Error {
    /// An underlying I/O operation failed, including a short read.
    Io(io::Error),
    /// The byte source yielded fewer bytes than requested.
    TruncatedStream,
    /// A tag byte (with `FLAG_REF` masked off) is not a known variant.
    UnknownTag(u8),
    /// A `REF` tag's index was out of range or pointed at an unfilled slot.
    InvalidReference(u32),
    /// Unmarshal recursion exceeded the 2000-frame depth limit.
    DepthExceeded,
    /// A declared size was negative or exceeded `0x7FFFFFFF`.
    SizeOutOfRange,
    /// A string tag's payload was not valid UTF-8.
    Utf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::TruncatedStream => write!(f, "truncated stream"),
            Error::UnknownTag(b) => write!(f, "invalid marshal code: {b:#04x}"),
            Error::InvalidReference(idx) => write!(f, "bad marshal data (invalid reference: {idx})"),
            Error::DepthExceeded => write!(f, "max marshal stack depth exceeded"),
            Error::SizeOutOfRange => write!(f, "bad marshal data (size out of range)"),
            Error::Utf8 => write!(f, "bad marshal data (invalid utf-8)"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

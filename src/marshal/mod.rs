//! The tagged-value marshal codec.
//!
//! A stream of tagged values: one tag byte (bit 7 = `FLAG_REF`, low seven
//! bits identify the variant) followed by that variant's payload. The
//! codec is reference-preserving (a per-top-level-call reference table
//! resolves back-pointers) and the `CODE` tag's reader is pluggable - see
//! [`reader::CodeHandler`] - so that an encrypted module's envelope can be
//! decrypted transparently mid-stream (see [`crate::envelope`]).

pub mod code;
pub mod reader;
pub mod value;
pub mod writer;

pub use code::CodeObject;
pub use reader::{CodeHandler, Config, Reader};
pub use value::{StringKind, Value};
pub use writer::Writer;

/// Bit 7 of a tag byte: set when the value is (or may be) referenced later.
pub const FLAG_REF: u8 = 0x80;

/// Largest declared size the format allows.
pub const SIZE32_MAX: i32 = 0x7FFF_FFFF;

/// Maximum unmarshal recursion depth.
pub const MAX_DEPTH: usize = 2000;

pub const TAG_NULL: u8 = b'0';
pub const TAG_NONE: u8 = b'N';
pub const TAG_FALSE: u8 = b'F';
pub const TAG_TRUE: u8 = b'T';
pub const TAG_STOPITER: u8 = b'S';
pub const TAG_ELLIPSIS: u8 = b'.';
pub const TAG_INT: u8 = b'i';
pub const TAG_INT64: u8 = b'I';
pub const TAG_FLOAT: u8 = b'f';
pub const TAG_BINARY_FLOAT: u8 = b'g';
pub const TAG_COMPLEX: u8 = b'x';
pub const TAG_BINARY_COMPLEX: u8 = b'y';
pub const TAG_LONG: u8 = b'l';
pub const TAG_STRING: u8 = b's';
pub const TAG_INTERNED: u8 = b't';
pub const TAG_REF: u8 = b'r';
pub const TAG_TUPLE: u8 = b'(';
pub const TAG_LIST: u8 = b'[';
pub const TAG_DICT: u8 = b'{';
pub const TAG_CODE: u8 = b'c';
pub const TAG_UNICODE: u8 = b'u';
pub const TAG_UNKNOWN: u8 = b'?';
pub const TAG_SET: u8 = b'<';
pub const TAG_FROZENSET: u8 = b'>';
pub const TAG_ASCII: u8 = b'a';
pub const TAG_ASCII_INTERNED: u8 = b'A';
pub const TAG_SMALL_TUPLE: u8 = b')';
pub const TAG_SHORT_ASCII: u8 = b'z';
pub const TAG_SHORT_ASCII_INTERNED: u8 = b'Z';

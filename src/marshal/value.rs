//! The tagged value union.

use std::rc::Rc;

use crate::marshal::code::CodeObject;

/// Distinguishes the six string tag variants that share one decode path
/// but must round-trip to the exact tag byte they were read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// `TYPE_UNICODE` ('u') - `r_long` size, UTF-8 surrogatepass decode.
    Unicode,
    /// `TYPE_INTERNED` ('t') - same decode as Unicode, interned.
    Interned,
    /// `TYPE_ASCII` ('a') - `r_long` size, strict UTF-8 decode.
    Ascii,
    /// `TYPE_ASCII_INTERNED` ('A').
    AsciiInterned,
    /// `TYPE_SHORT_ASCII` ('z') - one-byte size, strict UTF-8 decode.
    ShortAscii,
    /// `TYPE_SHORT_ASCII_INTERNED` ('Z').
    ShortAsciiInterned,
}

impl StringKind {
    /// Whether this kind's wire format uses a one-byte (`SHORT_ASCII*`)
    /// rather than four-byte size prefix.
    pub fn is_short(self) -> bool {
        matches!(self, StringKind::ShortAscii | StringKind::ShortAsciiInterned)
    }

    /// Whether this kind marks the string as interned.
    pub fn is_interned(self) -> bool {
        matches!(
            self,
            StringKind::Interned | StringKind::AsciiInterned | StringKind::ShortAsciiInterned
        )
    }
}

/// A single marshalled value.
///
/// Referenceable variants (everything except the singletons) are wrapped
/// in [`Rc`] by their containers so that [`crate::marshal::reader::Reader`]'s
/// reference table can share a single allocation across every back-pointer
/// to it.
#[derive(Debug)]
pub enum Value {
    /// `TYPE_NULL` - the marshal "uninitialized slot" sentinel, distinct
    /// from `None`. Never produced by well-formed compiled modules but
    /// part of the wire format.
    Null,
    /// `TYPE_NONE`.
    None,
    /// `TYPE_TRUE`.
    True,
    /// `TYPE_FALSE`.
    False,
    /// `TYPE_STOPITER`.
    StopIteration,
    /// `TYPE_ELLIPSIS`.
    Ellipsis,
    /// `TYPE_INT` - signed 32-bit.
    Int32(i32),
    /// `TYPE_INT64` - signed 64-bit.
    Int64(i64),
    /// `TYPE_LONG` - arbitrary precision, stored as sign + 15-bit-per-digit
    /// little-endian magnitude exactly as the wire format encodes it.
    Long { sign: i8, digits: Vec<u16> },
    /// `TYPE_FLOAT` - decimal text representation.
    Float(String),
    /// `TYPE_BINARY_FLOAT` - native `f64`.
    BinaryFloat(f64),
    /// `TYPE_COMPLEX` - decimal text (real, imag).
    Complex(String, String),
    /// `TYPE_BINARY_COMPLEX` - native `(f64, f64)`.
    BinaryComplex(f64, f64),
    /// `TYPE_STRING` - an undecoded byte string.
    Bytes(Vec<u8>),
    /// One of the six unicode/ascii string tags; see [`StringKind`].
    Str(String, StringKind),
    /// `TYPE_TUPLE`.
    Tuple(Vec<Rc<Value>>),
    /// `TYPE_SMALL_TUPLE`.
    SmallTuple(Vec<Rc<Value>>),
    /// `TYPE_SET`.
    Set(Vec<Rc<Value>>),
    /// `TYPE_FROZENSET`.
    FrozenSet(Vec<Rc<Value>>),
    /// `TYPE_CODE`.
    Code(Rc<CodeObject>),
}

impl Value {
    /// Whether this variant may carry `FLAG_REF` and therefore participate
    /// in the reference table. Singletons are never referenced, and
    /// neither are plain 32/64-bit ints - real marshal never sets
    /// `FLAG_REF` on `TYPE_INT`/`TYPE_INT64`, only on the variable-size
    /// and container kinds (tuples, code, strings, longs, floats, complex,
    /// byte strings, sets, frozensets).
    pub fn is_referenceable(&self) -> bool {
        !matches!(
            self,
            Value::Null
                | Value::None
                | Value::True
                | Value::False
                | Value::StopIteration
                | Value::Ellipsis
                | Value::Int32(_)
                | Value::Int64(_)
        )
    }

    /// View this value as tuple/small-tuple elements, if it is one.
    pub fn as_tuple_items(&self) -> Option<&[Rc<Value>]> {
        match self {
            Value::Tuple(items) | Value::SmallTuple(items) => Some(items),
            _ => None,
        }
    }

    /// View this value as a decoded string, if it is one (any [`StringKind`]).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s, _) => Some(s),
            _ => None,
        }
    }

    /// View this value as raw bytes, if it is a `TYPE_STRING` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// View this value as a code object, if it is one.
    pub fn as_code(&self) -> Option<&Rc<CodeObject>> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }
}

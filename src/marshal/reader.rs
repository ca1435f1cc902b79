//! The unmarshaller (read path of L3).

use std::io::Read;
use std::rc::Rc;

use log::trace;

use crate::marshal::code::CodeObject;
use crate::marshal::value::{StringKind, Value};
use crate::marshal::writer::Writer;
use crate::marshal::{
    FLAG_REF, MAX_DEPTH, SIZE32_MAX, TAG_ASCII, TAG_ASCII_INTERNED, TAG_BINARY_COMPLEX,
    TAG_BINARY_FLOAT, TAG_CODE, TAG_COMPLEX, TAG_DICT, TAG_ELLIPSIS, TAG_FALSE, TAG_FLOAT,
    TAG_FROZENSET, TAG_INT, TAG_INT64, TAG_INTERNED, TAG_LIST, TAG_LONG, TAG_NONE, TAG_NULL,
    TAG_REF, TAG_SET, TAG_SHORT_ASCII, TAG_SHORT_ASCII_INTERNED, TAG_SMALL_TUPLE, TAG_STOPITER,
    TAG_STRING, TAG_TRUE, TAG_TUPLE, TAG_UNICODE, TAG_UNKNOWN,
};
use crate::opcode::OpcodeMap;
use crate::utils::{bytesa, bytesv, le_u32, u8 as read_byte};
use crate::{Error, Result};

/// The CODE tag's reader/writer is replaceable per-unmarshaller.
/// Implementors own the full read-or-write of everything that follows the
/// tag byte, including the reserve-before-children reference bookkeeping
/// code objects require.
pub trait CodeHandler {
    /// Read a code object. Called immediately after the `TYPE_CODE` tag
    /// byte (and its `FLAG_REF` bit) has been consumed by [`Reader`].
    fn load_code(&self, r: &mut Reader<'_>) -> Result<Rc<CodeObject>>;

    /// Write a code object, including its own tag byte.
    fn dump_code(&self, w: &mut Writer<'_>, code: &CodeObject) -> Result<()>;
}

/// Per-child-unmarshaller-invariant configuration: the installed CODE
/// dispatch and, if a solver table is available, the opcode map used to
/// rewrite instruction streams inline while loading. Cloning is cheap (two
/// `Rc` bumps) and children created while decrypting a nested envelope
/// copy this verbatim.
#[derive(Clone)]
pub struct Config {
    pub code_handler: Rc<dyn CodeHandler>,
    pub opcode_map: Option<Rc<OpcodeMap>>,
}

/// The unmarshaller. Holds the byte source, the per-call reference table,
/// the active-frame `FLAG_REF` stack, and the recursion depth counter.
///
/// The byte source is type-erased (`&mut dyn Read`) rather than generic so
/// that [`CodeHandler`] - which must hand a `Reader` to caller-supplied
/// trait objects - stays object-safe.
pub struct Reader<'a> {
    src: &'a mut dyn Read,
    config: Config,
    refs: Vec<Option<Rc<Value>>>,
    flags: Vec<u8>,
    depth: usize,
}

impl<'a> Reader<'a> {
    /// Construct a fresh top-level unmarshaller over `src`.
    pub fn new(src: &'a mut dyn Read, config: Config) -> Self {
        Self {
            src,
            config,
            refs: Vec::new(),
            flags: Vec::new(),
            depth: 0,
        }
    }

    /// Construct a child unmarshaller for a decrypted envelope's plaintext:
    /// a fresh reference table (the envelope is an independently
    /// marshalled sub-document), the parent's depth (so the
    /// shared 2000-frame budget isn't reset, only its table is), and one
    /// zero flag entry pushed so the plaintext's first value - read via
    /// `load_code` directly, never through a tag byte - isn't mistakenly
    /// reference-tracked.
    pub fn for_envelope(src: &'a mut dyn Read, config: Config, depth: usize) -> Self {
        Self {
            src,
            config,
            refs: Vec::new(),
            flags: vec![0],
            depth,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Read a signed 32-bit little-endian integer (`r_long`).
    pub fn r_long(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(bytesa::<4, _>(self.src)?))
    }

    /// Read `r_long` as a raw `u32`, used for envelope `rand`/`length`
    /// fields where the value is never meaningfully signed.
    pub fn r_long_u32(&mut self) -> Result<u32> {
        le_u32(self.src)
    }

    /// Read a signed 64-bit little-endian integer (`r_long64`).
    pub fn r_long64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(bytesa::<8, _>(self.src)?))
    }

    /// Read exactly `n` raw bytes (used by the encrypted-CODE handler for
    /// the envelope ciphertext).
    pub fn read_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        bytesv(self.src, n)
    }

    fn read_size(&mut self) -> Result<usize> {
        let n = self.r_long()?;
        if n < 0 || n > SIZE32_MAX {
            return Err(Error::SizeOutOfRange);
        }
        Ok(n as usize)
    }

    /// Reserve a reference-table slot *before* a referenceable, possibly
    /// self-referential value's children are read (tuples, code). Returns
    /// `None` when the current frame's tag had `FLAG_REF` clear, meaning
    /// no reservation is needed.
    pub fn reserve_ref(&mut self) -> Option<usize> {
        if *self.flags.last().unwrap_or(&0) != 0 {
            let idx = self.refs.len();
            self.refs.push(None);
            trace!("reserve_ref -> {idx}");
            Some(idx)
        } else {
            None
        }
    }

    /// Fill a slot reserved by [`Self::reserve_ref`]. No-op if `idx` is `None`.
    pub fn fill_ref(&mut self, idx: Option<usize>, value: Rc<Value>) {
        if let Some(i) = idx {
            trace!("fill_ref {i}");
            self.refs[i] = Some(value);
        }
    }

    /// Append-after reference bookkeeping for scalar loaders: `r_ref` in
    /// the original. A no-op when the current frame's tag had `FLAG_REF`
    /// clear.
    fn push_ref(&mut self, value: Rc<Value>) -> Rc<Value> {
        if *self.flags.last().unwrap_or(&0) != 0 {
            trace!("push_ref -> {}", self.refs.len());
            self.refs.push(Some(value.clone()));
        }
        value
    }

    fn resolve_ref(&self, idx: u32) -> Result<Rc<Value>> {
        trace!("resolve_ref {idx}");
        match self.refs.get(idx as usize) {
            Some(Some(v)) => Ok(v.clone()),
            _ => Err(Error::InvalidReference(idx)),
        }
    }

    /// Read one complete tagged value (`r_object`/`load`).
    pub fn read_value(&mut self) -> Result<Rc<Value>> {
        let byte = read_byte(self.src)?;
        let flag = byte & FLAG_REF;
        let tag = byte & !FLAG_REF;

        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(Error::DepthExceeded);
        }
        self.flags.push(flag);

        let result = self.dispatch(tag);

        self.flags.pop();
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, tag: u8) -> Result<Rc<Value>> {
        trace!("dispatch tag={:#04x} ({})", tag, tag as char);
        match tag {
            TAG_NULL => Ok(Rc::new(Value::Null)),
            TAG_NONE => Ok(Rc::new(Value::None)),
            TAG_TRUE => Ok(Rc::new(Value::True)),
            TAG_FALSE => Ok(Rc::new(Value::False)),
            TAG_STOPITER => Ok(Rc::new(Value::StopIteration)),
            TAG_ELLIPSIS => Ok(Rc::new(Value::Ellipsis)),
            TAG_INT => {
                let v = self.r_long()?;
                Ok(self.push_ref(Rc::new(Value::Int32(v))))
            }
            TAG_INT64 => {
                let v = self.r_long64()?;
                Ok(self.push_ref(Rc::new(Value::Int64(v))))
            }
            TAG_FLOAT => {
                let n = read_byte(self.src)? as usize;
                let s = self.decode_utf8(self.read_raw(n)?)?;
                Ok(self.push_ref(Rc::new(Value::Float(s))))
            }
            TAG_BINARY_FLOAT => {
                let b = bytesa::<8, _>(self.src)?;
                Ok(self.push_ref(Rc::new(Value::BinaryFloat(f64::from_le_bytes(b)))))
            }
            TAG_COMPLEX => {
                let n = read_byte(self.src)? as usize;
                let real = self.decode_utf8(self.read_raw(n)?)?;
                let n = read_byte(self.src)? as usize;
                let imag = self.decode_utf8(self.read_raw(n)?)?;
                Ok(self.push_ref(Rc::new(Value::Complex(real, imag))))
            }
            TAG_BINARY_COMPLEX => {
                let real = f64::from_le_bytes(bytesa::<8, _>(self.src)?);
                let imag = f64::from_le_bytes(bytesa::<8, _>(self.src)?);
                Ok(self.push_ref(Rc::new(Value::BinaryComplex(real, imag))))
            }
            TAG_LONG => self.load_long(),
            TAG_STRING => {
                let n = self.read_size()?;
                let b = self.read_raw(n)?;
                Ok(self.push_ref(Rc::new(Value::Bytes(b))))
            }
            TAG_INTERNED => self.load_string_value(StringKind::Interned),
            TAG_UNICODE => self.load_string_value(StringKind::Unicode),
            TAG_ASCII => self.load_string_value(StringKind::Ascii),
            TAG_ASCII_INTERNED => self.load_string_value(StringKind::AsciiInterned),
            TAG_SHORT_ASCII => self.load_string_value(StringKind::ShortAscii),
            TAG_SHORT_ASCII_INTERNED => self.load_string_value(StringKind::ShortAsciiInterned),
            TAG_REF => {
                let idx = self.r_long_u32()?;
                self.resolve_ref(idx)
            }
            TAG_TUPLE => self.load_tuple(false),
            TAG_SMALL_TUPLE => self.load_tuple(true),
            TAG_SET => self.load_set(),
            TAG_FROZENSET => self.load_frozenset(),
            TAG_CODE => {
                let handler = self.config.code_handler.clone();
                let code = handler.load_code(self)?;
                Ok(Rc::new(Value::Code(code)))
            }
            TAG_LIST | TAG_DICT | TAG_UNKNOWN => Err(Error::UnknownTag(tag)),
            other => Err(Error::UnknownTag(other)),
        }
    }

    fn decode_utf8(&self, bytes: Vec<u8>) -> Result<String> {
        String::from_utf8(bytes).map_err(|_| Error::Utf8)
    }

    fn load_long(&mut self) -> Result<Rc<Value>> {
        let n = self.r_long()?;
        let (sign, count): (i8, i64) = match n.cmp(&0) {
            std::cmp::Ordering::Equal => (0, 0),
            std::cmp::Ordering::Less => (-1, -(n as i64)),
            std::cmp::Ordering::Greater => (1, n as i64),
        };
        if count > SIZE32_MAX as i64 {
            return Err(Error::SizeOutOfRange);
        }
        let mut digits = Vec::with_capacity(count as usize);
        for _ in 0..count {
            digits.push(u16::from_le_bytes(bytesa::<2, _>(self.src)?));
        }
        Ok(self.push_ref(Rc::new(Value::Long { sign, digits })))
    }

    fn load_string_value(&mut self, kind: StringKind) -> Result<Rc<Value>> {
        let n = if kind.is_short() {
            read_byte(self.src)? as usize
        } else {
            self.read_size()?
        };
        let bytes = self.read_raw(n)?;
        let s = self.decode_utf8(bytes)?;
        Ok(self.push_ref(Rc::new(Value::Str(s, kind))))
    }

    fn load_tuple(&mut self, small: bool) -> Result<Rc<Value>> {
        // Reservation happens before children are read for both tuple
        // variants so a self-referential tuple can resolve.
        let idx = self.reserve_ref();
        let n = if small {
            read_byte(self.src)? as usize
        } else {
            self.read_size()?
        };
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.read_value()?);
        }
        let value = Rc::new(if small {
            Value::SmallTuple(items)
        } else {
            Value::Tuple(items)
        });
        self.fill_ref(idx, value.clone());
        Ok(value)
    }

    fn load_set(&mut self) -> Result<Rc<Value>> {
        let n = self.read_size()?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.read_value()?);
        }
        Ok(self.push_ref(Rc::new(Value::Set(items))))
    }

    fn load_frozenset(&mut self) -> Result<Rc<Value>> {
        let n = self.read_size()?;
        if n == 0 {
            return Ok(self.push_ref(Rc::new(Value::FrozenSet(Vec::new()))));
        }
        let idx = self.reserve_ref();
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.read_value()?);
        }
        let value = Rc::new(Value::FrozenSet(items));
        self.fill_ref(idx, value.clone());
        Ok(value)
    }
}

/// The default (unencrypted) CODE handler: reads the standard code-object
/// layout directly from the current byte source.
#[derive(Debug, Default)]
pub struct PlainCodeHandler;

impl CodeHandler for PlainCodeHandler {
    fn load_code(&self, r: &mut Reader<'_>) -> Result<Rc<CodeObject>> {
        read_code_fields(r)
    }

    fn dump_code(&self, w: &mut Writer<'_>, code: &CodeObject) -> Result<()> {
        w.write_code_tag_and_fields(code)
    }
}

/// Read the standard code-object field layout, shared by
/// [`PlainCodeHandler`] and, after decryption, by the encrypted handler
/// in [`crate::envelope`].
pub fn read_code_fields(r: &mut Reader<'_>) -> Result<Rc<CodeObject>> {
    let idx = r.reserve_ref();

    let argcount = r.r_long()?;
    let kwonlyargcount = r.r_long()?;
    let nlocals = r.r_long()?;
    let stacksize = r.r_long()?;
    let flags = r.r_long()?;

    let code = r.read_value()?;
    let consts = r.read_value()?;
    let names = r.read_value()?;
    let varnames = r.read_value()?;
    let freevars = r.read_value()?;
    let cellvars = r.read_value()?;
    let filename = r.read_value()?;
    let name = r.read_value()?;
    let firstlineno = r.r_long()?;
    let lnotab = r.read_value()?;

    let mut bytecode = code.as_bytes().ok_or(Error::UnknownTag(TAG_CODE))?.to_vec();
    if let Some(map) = r.config().opcode_map.clone() {
        let mut i = 0;
        while i < bytecode.len() {
            bytecode[i] = map.get(bytecode[i]);
            i += 2;
        }
    }
    let consts = sequence_items(&consts)?;
    let names = sequence_items(&names)?;
    let varnames = sequence_items(&varnames)?;
    let freevars = sequence_items(&freevars)?;
    let cellvars = sequence_items(&cellvars)?;
    let lnotab = lnotab.as_bytes().ok_or(Error::UnknownTag(TAG_STRING))?.to_vec();

    let obj = Rc::new(CodeObject {
        argcount,
        kwonlyargcount,
        nlocals,
        stacksize,
        flags,
        bytecode,
        consts,
        names,
        varnames,
        freevars,
        cellvars,
        filename,
        name,
        firstlineno,
        lnotab,
    });

    r.fill_ref(idx, Rc::new(Value::Code(obj.clone())));
    Ok(obj)
}

fn sequence_items(v: &Rc<Value>) -> Result<Vec<Rc<Value>>> {
    v.as_tuple_items()
        .map(|items| items.to_vec())
        .ok_or(Error::UnknownTag(TAG_TUPLE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn plain_config() -> Config {
        Config {
            code_handler: Rc::new(PlainCodeHandler),
            opcode_map: None,
        }
    }

    /// `Value` has no derived equality (code objects hold `Rc<CodeObject>`,
    /// which isn't meaningfully comparable structurally) so round-trip
    /// tests compare values with a small recursive matcher instead.
    fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::None, Value::None) => true,
            (Value::True, Value::True) => true,
            (Value::False, Value::False) => true,
            (Value::StopIteration, Value::StopIteration) => true,
            (Value::Ellipsis, Value::Ellipsis) => true,
            (Value::Int32(x), Value::Int32(y)) => x == y,
            (Value::Int64(x), Value::Int64(y)) => x == y,
            (Value::Long { sign: sa, digits: da }, Value::Long { sign: sb, digits: db }) => {
                sa == sb && da == db
            }
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::BinaryFloat(x), Value::BinaryFloat(y)) => x == y,
            (Value::Complex(ra, ia), Value::Complex(rb, ib)) => ra == rb && ia == ib,
            (Value::BinaryComplex(ra, ia), Value::BinaryComplex(rb, ib)) => ra == rb && ia == ib,
            (Value::Bytes(x), Value::Bytes(y)) => x == y,
            (Value::Str(x, _), Value::Str(y, _)) => x == y,
            (a, b) if a.as_tuple_items().is_some() && b.as_tuple_items().is_some() => {
                let (xs, ys) = (a.as_tuple_items().unwrap(), b.as_tuple_items().unwrap());
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
            }
            (Value::Set(xs), Value::Set(ys)) | (Value::FrozenSet(xs), Value::FrozenSet(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
            }
            _ => false,
        }
    }

    #[test]
    fn reference_free_value_round_trips() {
        let original = Rc::new(Value::Tuple(vec![
            Rc::new(Value::Int32(7)),
            Rc::new(Value::Str("hello".to_string(), StringKind::ShortAscii)),
            Rc::new(Value::BinaryFloat(1.5)),
        ]));

        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes, plain_config());
        writer.write_value(&original).unwrap();

        let mut cursor = Cursor::new(bytes);
        let mut reader = Reader::new(&mut cursor, plain_config());
        let decoded = reader.read_value().unwrap();

        assert!(values_equal(&original, &decoded));
    }

    #[test]
    fn shared_reference_round_trips_and_preserves_sharing() {
        let shared = Rc::new(Value::Str("abcdefghij".repeat(10), StringKind::Unicode));
        let original = Rc::new(Value::Tuple(vec![shared.clone(), shared.clone()]));

        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes, plain_config());
        writer.write_value(&original).unwrap();

        // The second occurrence of the same allocation is a bare TAG_REF
        // byte followed by a little-endian u32 index 0.
        let tail = &bytes[bytes.len() - 5..];
        assert_eq!(tail[0], TAG_REF);
        assert_eq!(&tail[1..5], &0u32.to_le_bytes());

        let mut cursor = Cursor::new(bytes);
        let mut reader = Reader::new(&mut cursor, plain_config());
        let decoded = reader.read_value().unwrap();

        let items = decoded.as_tuple_items().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].as_str().is_some());
        assert_eq!(items[0].as_str(), items[1].as_str());
    }

    #[test]
    fn sequence_items_rejects_non_tuple_value() {
        let not_a_tuple = Rc::new(Value::Int32(42));
        assert!(sequence_items(&not_a_tuple).is_err());
    }
}

//! The marshaller (write path of L3).

use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use log::trace;

use crate::marshal::code::CodeObject;
use crate::marshal::reader::Config;
use crate::marshal::value::{StringKind, Value};
use crate::marshal::{
    FLAG_REF, TAG_ASCII, TAG_ASCII_INTERNED, TAG_BINARY_COMPLEX, TAG_BINARY_FLOAT, TAG_CODE,
    TAG_COMPLEX, TAG_ELLIPSIS, TAG_FALSE, TAG_FLOAT, TAG_FROZENSET, TAG_INT, TAG_INT64,
    TAG_INTERNED, TAG_LONG, TAG_NONE, TAG_NULL, TAG_REF, TAG_SET, TAG_SHORT_ASCII,
    TAG_SHORT_ASCII_INTERNED, TAG_SMALL_TUPLE, TAG_STOPITER, TAG_STRING, TAG_TRUE, TAG_TUPLE,
    TAG_UNICODE,
};
use crate::utils::{w_le_u16, w_le_u32, w_u8};
use crate::Result;

/// The marshaller. Mirrors [`super::reader::Reader`]'s reference
/// bookkeeping: the first time a referenceable value is written its tag
/// byte gets `FLAG_REF` and it is assigned the next reference index;
/// every later occurrence (by pointer identity) writes a bare `TYPE_REF`.
pub struct Writer<'a> {
    dst: &'a mut dyn Write,
    config: Config,
    seen: HashMap<usize, u32>,
    next_ref: u32,
}

impl<'a> Writer<'a> {
    pub fn new(dst: &'a mut dyn Write, config: Config) -> Self {
        Self {
            dst,
            config,
            seen: HashMap::new(),
            next_ref: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write exactly `bytes` with no framing (used by the encrypted-CODE
    /// handler to emit a pre-built ciphertext envelope).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.dst.write_all(bytes)?;
        Ok(())
    }

    /// Write one raw byte (used by the encrypted-CODE handler for the
    /// envelope's own tag byte, which it emits itself rather than through
    /// [`Self::write_value`]).
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        w_u8(self.dst, v)
    }

    pub fn w_long(&mut self, v: i32) -> Result<()> {
        self.dst.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn w_long_u32(&mut self, v: u32) -> Result<()> {
        w_le_u32(self.dst, v)
    }

    pub fn w_long64(&mut self, v: i64) -> Result<()> {
        self.dst.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// Look up (or assign) the reference index for a referenceable value,
    /// identified by the address of its owning `Rc` allocation. Returns
    /// `Some(existing_index)` if this is a repeat occurrence; `None` the
    /// first time a pointer is seen (its index has already been recorded
    /// for next time).
    fn ref_lookup_or_insert(&mut self, ptr: usize) -> Option<u32> {
        if let Some(&idx) = self.seen.get(&ptr) {
            trace!("ref_lookup_or_insert {ptr:#x} -> hit, idx={idx}");
            return Some(idx);
        }
        let idx = self.next_ref;
        self.next_ref += 1;
        self.seen.insert(ptr, idx);
        trace!("ref_lookup_or_insert {ptr:#x} -> new, idx={idx}");
        None
    }

    /// Write one complete tagged value.
    pub fn write_value(&mut self, value: &Rc<Value>) -> Result<()> {
        let ptr = Rc::as_ptr(value) as usize;
        trace!("write_value ptr={ptr:#x} referenceable={}", value.is_referenceable());
        if value.is_referenceable() {
            if let Some(idx) = self.ref_lookup_or_insert(ptr) {
                w_u8(self.dst, TAG_REF)?;
                return self.w_long_u32(idx);
            }
        }
        self.dispatch(value)
    }

    fn tag_byte(&self, value: &Value, tag: u8) -> u8 {
        if value.is_referenceable() {
            tag | FLAG_REF
        } else {
            tag
        }
    }

    fn dispatch(&mut self, value: &Rc<Value>) -> Result<()> {
        match value.as_ref() {
            Value::Null => w_u8(self.dst, TAG_NULL),
            Value::None => w_u8(self.dst, TAG_NONE),
            Value::True => w_u8(self.dst, TAG_TRUE),
            Value::False => w_u8(self.dst, TAG_FALSE),
            Value::StopIteration => w_u8(self.dst, TAG_STOPITER),
            Value::Ellipsis => w_u8(self.dst, TAG_ELLIPSIS),
            Value::Int32(v) => {
                w_u8(self.dst, self.tag_byte(value, TAG_INT))?;
                self.w_long(*v)
            }
            Value::Int64(v) => {
                w_u8(self.dst, self.tag_byte(value, TAG_INT64))?;
                self.w_long64(*v)
            }
            Value::Float(s) => {
                w_u8(self.dst, self.tag_byte(value, TAG_FLOAT))?;
                w_u8(self.dst, s.len() as u8)?;
                self.write_raw(s.as_bytes())
            }
            Value::BinaryFloat(f) => {
                w_u8(self.dst, self.tag_byte(value, TAG_BINARY_FLOAT))?;
                self.write_raw(&f.to_le_bytes())
            }
            Value::Complex(real, imag) => {
                w_u8(self.dst, self.tag_byte(value, TAG_COMPLEX))?;
                w_u8(self.dst, real.len() as u8)?;
                self.write_raw(real.as_bytes())?;
                w_u8(self.dst, imag.len() as u8)?;
                self.write_raw(imag.as_bytes())
            }
            Value::BinaryComplex(real, imag) => {
                w_u8(self.dst, self.tag_byte(value, TAG_BINARY_COMPLEX))?;
                self.write_raw(&real.to_le_bytes())?;
                self.write_raw(&imag.to_le_bytes())
            }
            Value::Long { sign, digits } => {
                w_u8(self.dst, self.tag_byte(value, TAG_LONG))?;
                let n = *sign as i32 * digits.len() as i32;
                self.w_long(n)?;
                for d in digits {
                    w_le_u16(self.dst, *d)?;
                }
                Ok(())
            }
            Value::Bytes(b) => {
                w_u8(self.dst, self.tag_byte(value, TAG_STRING))?;
                self.w_long(b.len() as i32)?;
                self.write_raw(b)
            }
            Value::Str(s, kind) => self.write_string(value, s, *kind),
            Value::Tuple(items) => self.write_sequence(value, items, TAG_TUPLE, false),
            Value::SmallTuple(items) => self.write_sequence(value, items, TAG_SMALL_TUPLE, true),
            Value::Set(items) => self.write_sequence(value, items, TAG_SET, false),
            Value::FrozenSet(items) => self.write_sequence(value, items, TAG_FROZENSET, false),
            Value::Code(code) => {
                let handler = self.config.code_handler.clone();
                handler.dump_code(self, code)
            }
        }
    }

    fn write_string(&mut self, value: &Rc<Value>, s: &str, kind: StringKind) -> Result<()> {
        let tag = match kind {
            StringKind::Unicode => TAG_UNICODE,
            StringKind::Interned => TAG_INTERNED,
            StringKind::Ascii => TAG_ASCII,
            StringKind::AsciiInterned => TAG_ASCII_INTERNED,
            StringKind::ShortAscii => TAG_SHORT_ASCII,
            StringKind::ShortAsciiInterned => TAG_SHORT_ASCII_INTERNED,
        };
        w_u8(self.dst, self.tag_byte(value, tag))?;
        let bytes = s.as_bytes();
        if kind.is_short() {
            w_u8(self.dst, bytes.len() as u8)?;
        } else {
            self.w_long(bytes.len() as i32)?;
        }
        self.write_raw(bytes)
    }

    fn write_sequence(
        &mut self,
        value: &Rc<Value>,
        items: &[Rc<Value>],
        tag: u8,
        small: bool,
    ) -> Result<()> {
        w_u8(self.dst, self.tag_byte(value, tag))?;
        if small {
            w_u8(self.dst, items.len() as u8)?;
        } else {
            self.w_long(items.len() as i32)?;
        }
        for item in items {
            self.write_value(item)?;
        }
        Ok(())
    }

    /// Write the standard (unencrypted) code-object tag and field layout.
    /// Shared by [`super::reader::PlainCodeHandler`] and, before
    /// encryption, by the encrypted handler in [`crate::envelope`].
    pub fn write_code_tag_and_fields(&mut self, code: &CodeObject) -> Result<()> {
        w_u8(self.dst, TAG_CODE | FLAG_REF)?;
        self.write_code_fields(code)
    }

    /// Write just the CODE field layout, without a leading tag byte. The
    /// encrypted handler writes this into a scratch buffer that becomes
    /// the envelope plaintext, whose own tag byte replaces this one.
    pub fn write_code_fields(&mut self, code: &CodeObject) -> Result<()> {
        self.w_long(code.argcount)?;
        self.w_long(code.kwonlyargcount)?;
        self.w_long(code.nlocals)?;
        self.w_long(code.stacksize)?;
        self.w_long(code.flags)?;

        let bytecode = Rc::new(Value::Bytes(code.bytecode.clone()));
        self.write_value(&bytecode)?;
        self.write_items_as_tuple(&code.consts)?;
        self.write_items_as_tuple(&code.names)?;
        self.write_items_as_tuple(&code.varnames)?;
        self.write_items_as_tuple(&code.freevars)?;
        self.write_items_as_tuple(&code.cellvars)?;
        self.write_value(&code.filename)?;
        self.write_value(&code.name)?;
        self.w_long(code.firstlineno)?;

        let lnotab = Rc::new(Value::Bytes(code.lnotab.clone()));
        self.write_value(&lnotab)
    }

    fn write_items_as_tuple(&mut self, items: &[Rc<Value>]) -> Result<()> {
        // CPython's marshal writer picks SMALL_TUPLE purely by element
        // count (< 256), independent of which variant the tuple was
        // originally read as - so the wrapper tuple's own identity isn't
        // preserved on round-trip, only its contents and order.
        let wrapper = if items.len() < 256 {
            Rc::new(Value::SmallTuple(items.to_vec()))
        } else {
            Rc::new(Value::Tuple(items.to_vec()))
        };
        self.write_value(&wrapper)
    }
}

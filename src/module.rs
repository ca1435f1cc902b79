//! Top-level compiled-module file layout and constant-rewriting helpers.

use std::io::{Read, Write};
use std::rc::Rc;

use crate::marshal::reader::Config;
use crate::marshal::{CodeObject, Reader, Value, Writer};
use crate::utils::bytesa;
use crate::{Error, Result};

/// Size of the opaque module header preceding the marshalled code object.
/// Preserved byte-for-byte; this crate never interprets its contents.
pub const HEADER_LEN: usize = 12;

/// A compiled-module file: an opaque header followed by one marshalled
/// top-level code object.
pub struct Module {
    pub header: [u8; HEADER_LEN],
    pub code: Rc<CodeObject>,
}

impl Module {
    pub fn new(header: [u8; HEADER_LEN], code: Rc<CodeObject>) -> Self {
        Self { header, code }
    }

    /// Read the header and top-level value. `config` selects the CODE
    /// dispatch (plain or encrypted) used for the whole tree.
    pub fn load<R: Read>(r: &mut R, config: Config) -> Result<Self> {
        let header = bytesa::<HEADER_LEN, R>(r)?;
        let mut reader = Reader::new(r, config);
        let value = reader.read_value()?;
        let code = value
            .as_code()
            .ok_or(Error::UnknownTag(b'c'))?
            .clone();
        Ok(Self { header, code })
    }

    /// Write the header and re-marshal the top-level code object.
    pub fn dump<W: Write>(&self, w: &mut W, config: Config) -> Result<()> {
        w.write_all(&self.header)?;
        let mut writer = Writer::new(w, config);
        writer.write_value(&Rc::new(Value::Code(self.code.clone())))
    }
}

/// Recursively replace every string constant equal to `old` with `new`
/// throughout a code tree, including inside nested code objects and
/// tuples of constants. Used to patch the integrity-hash string a
/// compiled module embeds in its own constants.
pub fn rewrite_const(code: &CodeObject, old: &str, new: &str) -> CodeObject {
    let consts = code
        .consts
        .iter()
        .map(|v| rewrite_const_value(v, old, new))
        .collect();

    CodeObject {
        argcount: code.argcount,
        kwonlyargcount: code.kwonlyargcount,
        nlocals: code.nlocals,
        stacksize: code.stacksize,
        flags: code.flags,
        bytecode: code.bytecode.clone(),
        consts,
        names: code.names.clone(),
        varnames: code.varnames.clone(),
        freevars: code.freevars.clone(),
        cellvars: code.cellvars.clone(),
        filename: code.filename.clone(),
        name: code.name.clone(),
        firstlineno: code.firstlineno,
        lnotab: code.lnotab.clone(),
    }
}

fn rewrite_const_value(value: &Rc<Value>, old: &str, new: &str) -> Rc<Value> {
    match value.as_ref() {
        Value::Str(s, kind) if s == old => Rc::new(Value::Str(new.to_string(), *kind)),
        Value::Code(c) => Rc::new(Value::Code(Rc::new(rewrite_const(c, old, new)))),
        Value::Tuple(items) => Rc::new(Value::Tuple(
            items.iter().map(|v| rewrite_const_value(v, old, new)).collect(),
        )),
        Value::SmallTuple(items) => Rc::new(Value::SmallTuple(
            items.iter().map(|v| rewrite_const_value(v, old, new)).collect(),
        )),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::StringKind;
    use std::io::Cursor;

    fn leaf_code(consts: Vec<Rc<Value>>) -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: 0,
            bytecode: vec![0x64, 0x00, 0x53, 0x00],
            consts,
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: Rc::new(Value::Str("mod.py".into(), StringKind::Ascii)),
            name: Rc::new(Value::Str("<module>".into(), StringKind::Ascii)),
            firstlineno: 1,
            lnotab: Vec::new(),
        }
    }

    #[test]
    fn rewrites_matching_hash_constant() {
        let code = leaf_code(vec![Rc::new(Value::Str(
            "deadbeef".into(),
            StringKind::Ascii,
        ))]);
        let rewritten = rewrite_const(&code, "deadbeef", "cafef00d");
        assert_eq!(rewritten.consts[0].as_str(), Some("cafef00d"));
    }

    #[test]
    fn recurses_into_nested_code_and_tuples() {
        let inner = leaf_code(vec![Rc::new(Value::Str("deadbeef".into(), StringKind::Ascii))]);
        let outer = leaf_code(vec![
            Rc::new(Value::Code(Rc::new(inner))),
            Rc::new(Value::Tuple(vec![Rc::new(Value::Str(
                "deadbeef".into(),
                StringKind::Ascii,
            ))])),
        ]);

        let rewritten = rewrite_const(&outer, "deadbeef", "cafef00d");
        let nested = rewritten.consts[0].as_code().unwrap();
        assert_eq!(nested.consts[0].as_str(), Some("cafef00d"));

        let tuple_items = rewritten.consts[1].as_tuple_items().unwrap();
        assert_eq!(tuple_items[0].as_str(), Some("cafef00d"));
    }

    #[test]
    fn header_round_trips_opaque() {
        use crate::marshal::reader::PlainCodeHandler;
        use std::rc::Rc as StdRc;

        let header = *b"abcdefghijkl";
        let code = StdRc::new(leaf_code(Vec::new()));
        let module = Module::new(header, code);

        let config = Config {
            code_handler: StdRc::new(PlainCodeHandler),
            opcode_map: None,
        };

        let mut buf = Vec::new();
        module.dump(&mut buf, config.clone()).unwrap();

        let mut cursor = Cursor::new(buf);
        let loaded = Module::load(&mut cursor, config).unwrap();
        assert_eq!(loaded.header, header);
        assert_eq!(loaded.code.bytecode, module.code.bytecode);
    }
}

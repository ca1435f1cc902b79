//! In-place opcode rewriting using a sanitized [`OpcodeMap`].

use std::rc::Rc;

use crate::marshal::{CodeObject, Value};
use crate::opcode::map::OpcodeMap;

/// Produce a copy of `code` with every opcode-position byte in its own
/// bytecode, and in every nested code constant's bytecode, translated
/// through `map`. Operand bytes and every other field are copied
/// verbatim.
pub fn rewrite_code(code: &CodeObject, map: &OpcodeMap) -> CodeObject {
    let mut bytecode = code.bytecode.clone();
    let mut i = 0;
    while i < bytecode.len() {
        bytecode[i] = map.get(bytecode[i]);
        i += 2;
    }

    let consts = code
        .consts
        .iter()
        .map(|v| rewrite_value(v, map))
        .collect();

    CodeObject {
        argcount: code.argcount,
        kwonlyargcount: code.kwonlyargcount,
        nlocals: code.nlocals,
        stacksize: code.stacksize,
        flags: code.flags,
        bytecode,
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

fn rewrite_value(value: &Rc<Value>, map: &OpcodeMap) -> Rc<Value> {
    match value.as_ref() {
        Value::Code(code) => Rc::new(Value::Code(Rc::new(rewrite_code(code, map)))),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn code_with_bytecode(bytecode: Vec<u8>, consts: Vec<Rc<Value>>) -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: 0,
            bytecode,
            consts,
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: Rc::new(Value::None),
            name: Rc::new(Value::None),
            firstlineno: 0,
            lnotab: Vec::new(),
        }
    }

    #[test]
    fn rewrites_opcode_positions_only() {
        let mut entries = BTreeMap::new();
        entries.insert(0xFC, 0x9C);
        let map = OpcodeMap::from_entries(entries);

        let code = code_with_bytecode(vec![0xFC, 0xFC, 0x01, 0x00], Vec::new());
        let rewritten = rewrite_code(&code, &map);

        // Position 0 (opcode) translated; position 1 (operand) untouched
        // even though its byte value also appears in the map.
        assert_eq!(rewritten.bytecode, vec![0x9C, 0xFC, 0x01, 0x00]);
    }

    #[test]
    fn recurses_into_nested_code_constants() {
        let mut entries = BTreeMap::new();
        entries.insert(0xFC, 0x9C);
        let map = OpcodeMap::from_entries(entries);

        let inner = code_with_bytecode(vec![0xFC, 0x00], Vec::new());
        let outer = code_with_bytecode(
            vec![0x64, 0x00],
            vec![Rc::new(Value::Code(Rc::new(inner)))],
        );

        let rewritten = rewrite_code(&outer, &map);
        let inner_rewritten = rewritten.consts[0].as_code().unwrap();
        assert_eq!(inner_rewritten.bytecode, vec![0x9C, 0x00]);
    }

    #[test]
    fn unmapped_bytes_pass_through() {
        let map = OpcodeMap::new();
        let code = code_with_bytecode(vec![0x42, 0x00], Vec::new());
        let rewritten = rewrite_code(&code, &map);
        assert_eq!(rewritten.bytecode, vec![0x42, 0x00]);
    }
}

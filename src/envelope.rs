//! L4 - the encrypted-CODE handler: glue between the marshal codec (L3)
//! and the key derivation / cipher layers (L1, L2).
//!
//! Installed as the active [`CodeHandler`] on a [`Config`] for modules
//! whose CODE payloads are replaced by an envelope of `(rand, length,
//! ciphertext)` rather than the plain field layout.

use std::io::Cursor;
use std::rc::Rc;

use log::debug;

use crate::cipher;
use crate::marshal::code::CodeObject;
use crate::marshal::reader::{read_code_fields, CodeHandler, Config, Reader};
use crate::marshal::writer::Writer;
use crate::marshal::{FLAG_REF, TAG_CODE};
use crate::opcode::OpcodeMap;
use crate::rng::derive_subkeys;
use crate::Result;

/// Decrypts (and, with an [`OpcodeMap`] installed, rewrites) CODE
/// envelopes transparently as the marshal codec encounters them.
///
/// Two constructors: [`Self::new`] for plain decrypt/re-encrypt, and
/// [`Self::with_opcode_map`] when instruction streams should be
/// normalized to stock numbering as each code object is loaded.
pub struct EncryptedCodeHandler {
    opcode_map: Option<Rc<OpcodeMap>>,
}

impl EncryptedCodeHandler {
    pub fn new() -> Self {
        Self { opcode_map: None }
    }

    pub fn with_opcode_map(opcode_map: Rc<OpcodeMap>) -> Self {
        Self {
            opcode_map: Some(opcode_map),
        }
    }
}

impl Default for EncryptedCodeHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn padded_len(length: u32) -> u32 {
    (length + 15) & !15
}

fn bytes_to_words_le(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn words_to_bytes_le(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

impl CodeHandler for EncryptedCodeHandler {
    fn load_code(&self, r: &mut Reader<'_>) -> Result<Rc<CodeObject>> {
        let rand = r.r_long_u32()?;
        let length = r.r_long_u32()?;
        debug!("decrypting code envelope rand={rand:#010x} length={length}");

        let ciphertext = r.read_raw(padded_len(length) as usize)?;
        let mut words = bytes_to_words_le(&ciphertext);
        let subkeys = derive_subkeys(rand, length);
        cipher::decipher(&mut words, &subkeys);

        let mut plaintext = words_to_bytes_le(&words);
        plaintext.truncate(length as usize);

        let mut cursor = Cursor::new(plaintext);
        // The handler's own `opcode_map` field, not the ambient `Reader`'s
        // `Config`, decides whether this envelope's bytecode gets
        // rewritten: `new()` is decrypt-only (its field is always `None`)
        // and must stay that way even if the surrounding `Config` happens
        // to carry a table for some other purpose, or a corpus built from
        // a "decrypt only" pass would silently end up rewritten.
        let config = Config {
            code_handler: r.config().code_handler.clone(),
            opcode_map: self.opcode_map.clone(),
        };
        debug!("handing off to nested reader for decrypted envelope plaintext");
        let mut nested = Reader::for_envelope(&mut cursor, config, r.depth());
        // The envelope's plaintext has no leading 'c' tag byte - it
        // stands in for the tag and payload both - so `load_code` is
        // invoked directly rather than going through `read_value`.
        read_code_fields(&mut nested)
    }

    fn dump_code(&self, w: &mut Writer<'_>, code: &CodeObject) -> Result<()> {
        let mut plaintext = Vec::new();
        {
            let config = Config {
                code_handler: w.config().code_handler.clone(),
                opcode_map: w.config().opcode_map.clone(),
            };
            let mut scratch = Writer::new(&mut plaintext, config);
            scratch.write_code_fields(code)?;
        }

        let length = plaintext.len() as u32;
        let padded = padded_len(length) as usize;
        plaintext.resize(padded, 0);

        // rand = 0 yields deterministic output; the format tolerates any
        // constant here.
        let rand = 0u32;
        debug!("encrypting code envelope rand={rand:#010x} length={length}");
        let subkeys = derive_subkeys(rand, length);
        let mut words = bytes_to_words_le(&plaintext);
        cipher::encipher(&mut words, &subkeys);
        let ciphertext = words_to_bytes_le(&words);

        w.write_u8(TAG_CODE | FLAG_REF)?;
        w.w_long_u32(rand)?;
        w.w_long_u32(length)?;
        w.write_raw(&ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::value::{StringKind, Value};

    fn sample_code() -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: 0,
            bytecode: vec![0x64, 0x00, 0x53, 0x00],
            consts: vec![Rc::new(Value::None)],
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: Rc::new(Value::Str("mod.py".to_string(), StringKind::ShortAscii)),
            name: Rc::new(Value::Str("f".to_string(), StringKind::ShortAscii)),
            firstlineno: 1,
            lnotab: Vec::new(),
        }
    }

    fn config_with(handler: Rc<dyn CodeHandler>) -> Config {
        Config {
            code_handler: handler,
            opcode_map: None,
        }
    }

    #[test]
    fn encrypted_round_trip_preserves_bytecode_and_constants() {
        let code = sample_code();
        let handler: Rc<dyn CodeHandler> = Rc::new(EncryptedCodeHandler::new());

        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes, config_with(handler.clone()));
        handler.dump_code(&mut writer, &code).unwrap();

        let mut cursor = Cursor::new(bytes);
        let mut reader = Reader::new(&mut cursor, config_with(handler));
        let value = reader.read_value().unwrap();
        let decoded = value.as_code().unwrap();

        assert_eq!(decoded.bytecode, code.bytecode);
        assert_eq!(decoded.consts.len(), code.consts.len());
        assert_eq!(decoded.name_str(), Some("f"));
    }
}

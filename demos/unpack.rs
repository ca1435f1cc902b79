use std::fs::{self, File};
use std::io::Cursor;
use std::rc::Rc;

use codetoy::envelope::EncryptedCodeHandler;
use codetoy::marshal::reader::PlainCodeHandler;
use codetoy::module::Module;
use codetoy::opcode::OpcodeMap;
use codetoy::{Config, Result};

fn main() -> Result<()> {
    let path = std::env::args().nth(1).expect("usage: unpack <module.pyc>");
    let bytes = fs::read(&path)?;

    let opcode_map = File::open("opcodes.map")
        .ok()
        .and_then(|f| OpcodeMap::load(f).ok())
        .map(Rc::new);

    // Installing the map on the handler itself (rather than relying on the
    // ambient Config) rewrites every code object's bytecode to stock
    // numbering inline, as each envelope is decrypted - so the loaded tree
    // below is already normalized; no separate rewrite pass is needed.
    let code_handler: Rc<dyn codetoy::CodeHandler> = match &opcode_map {
        Some(map) => Rc::new(EncryptedCodeHandler::with_opcode_map(map.clone())),
        None => Rc::new(EncryptedCodeHandler::new()),
    };
    let config = Config {
        code_handler,
        opcode_map: opcode_map.clone(),
    };

    let mut cursor = Cursor::new(bytes);
    let module = Module::load(&mut cursor, config)?;

    println!(
        "top-level code object: {} ({} bytes of bytecode, {} consts)",
        module.code.name_str().unwrap_or("<unknown>"),
        module.code.bytecode.len(),
        module.code.consts.len(),
    );

    if opcode_map.is_none() {
        return Ok(());
    }

    let plain_config = Config {
        code_handler: Rc::new(PlainCodeHandler),
        opcode_map: None,
    };
    let mut out = Vec::new();
    module.dump(&mut out, plain_config)?;

    println!("wrote {} bytes of decoded, stock-numbered module", out.len());
    Ok(())
}

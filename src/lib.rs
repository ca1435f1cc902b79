//! **codetoy** - unmarshal, decrypt, and rewrite obfuscated compiled-bytecode
//! modules.
//!
//! # Layers
//! | Module | Responsibility |
//! |--------|-----------------|
//! | [`rng`]     | LCG mixer + MT19937 → per-module subkey derivation |
//! | [`cipher`]  | XXTEA (Corrected Block TEA) over 32-bit word arrays |
//! | [`marshal`] | Reference-preserving tagged-value codec, pluggable CODE dispatch |
//! | [`envelope`]| The encrypted-CODE handler: glues `marshal` to `cipher`/`rng` |
//! | [`opcode`]  | Opcode-permutation solver, sanitized table, rewriter |
//! | [`module`]  | Top-level compiled-module file layout and constant patching |

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod marshal;
pub mod module;
pub mod opcode;
pub mod rng;
mod utils;

pub use error::{Error, Result};
pub use marshal::{CodeHandler, CodeObject, Config, Reader, StringKind, Value, Writer};
pub use module::Module;

//! The opcode-permutation solver and rewriter.
//!
//! [`Corpus`] accumulates a per-position histogram over paired
//! obfuscated/stock code objects and [`Corpus::sanitize`] collapses it to
//! an [`OpcodeMap`]; [`rewrite_code`] applies one to a code tree.

pub mod corpus;
pub mod map;
pub mod rewrite;

pub use corpus::Corpus;
pub use map::OpcodeMap;
pub use rewrite::rewrite_code;

//! Histogram accumulation over paired obfuscated/stock code objects.

use std::collections::BTreeMap;

use log::warn;

use crate::marshal::CodeObject;
use crate::opcode::map::OpcodeMap;

/// Accumulates per-position opcode correspondences across a corpus of
/// (obfuscated, stock) code-object pairs known to share the same source.
///
/// Call [`Self::add_pair`] once per top-level pair; it recurses into
/// nested code constants itself, so callers do not need to walk the tree.
///
/// Each obfuscated byte's counts are kept as a small `Vec<(u8, u64)>`
/// rather than a map keyed by stock byte: it's scanned linearly on both
/// update and `sanitize()`, which preserves first-seen order among stock
/// bytes when breaking ties - a sorted map would instead tie-break by
/// numeric value.
pub struct Corpus {
    histogram: Vec<Vec<(u8, u64)>>,
    length_mismatches: u64,
    matched: u64,
}

impl Default for Corpus {
    fn default() -> Self {
        Self::new()
    }
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            histogram: (0..256).map(|_| Vec::new()).collect(),
            length_mismatches: 0,
            matched: 0,
        }
    }

    /// Non-fatal bytecode-length-mismatch occurrences, counted rather
    /// than surfaced as an error.
    pub fn length_mismatches(&self) -> u64 {
        self.length_mismatches
    }

    /// Fold one paired code object (and, recursively, its nested code
    /// constants matched positionally) into the histogram.
    pub fn add_pair(&mut self, obfuscated: &CodeObject, stock: &CodeObject) {
        self.matched += 1;
        if obfuscated.bytecode.len() != stock.bytecode.len() {
            self.length_mismatches += 1;
        } else {
            self.add_bytecode_pair(&obfuscated.bytecode, &stock.bytecode);
        }

        for (a, b) in obfuscated.nested_code_consts().zip(stock.nested_code_consts()) {
            self.add_pair(a, b);
        }
    }

    fn add_bytecode_pair(&mut self, a: &[u8], b: &[u8]) {
        // Wordcode layout: opcodes sit at even byte offsets, operands at
        // odd ones. Only opcode positions contribute to the histogram.
        let mut i = 0;
        while i < a.len() {
            let counts = &mut self.histogram[a[i] as usize];
            match counts.iter_mut().find(|(j, _)| *j == b[i]) {
                Some((_, count)) => *count += 1,
                None => counts.push((b[i], 1)),
            }
            i += 2;
        }
    }

    /// Produce the sanitized map: for each obfuscated byte with any
    /// histogram signal, the stock byte it most often aligned with,
    /// excluding the identity mapping and breaking ties by first-seen.
    pub fn sanitize(&self) -> OpcodeMap {
        let mut entries = BTreeMap::new();
        for (k, counts) in self.histogram.iter().enumerate() {
            let k = k as u8;
            let mut best: Option<(u8, u64)> = None;
            for &(j, count) in counts {
                if j == k {
                    continue;
                }
                match best {
                    Some((_, best_count)) if count <= best_count => {}
                    _ => best = Some((j, count)),
                }
            }
            if let Some((j, _)) = best {
                entries.insert(k, j);
            }
        }
        OpcodeMap::from_entries(entries)
    }
}

impl Drop for Corpus {
    fn drop(&mut self) {
        warn!(
            "opcode corpus stats: matched={}, length_mismatches={}",
            self.matched, self.length_mismatches
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn code_with_bytecode(bytecode: Vec<u8>) -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: 0,
            bytecode,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: Rc::new(crate::marshal::Value::None),
            name: Rc::new(crate::marshal::Value::None),
            firstlineno: 0,
            lnotab: Vec::new(),
        }
    }

    /// Two pairs whose obfuscated/stock bytecodes agree at opcode
    /// positions 0 and 2 produce `map[0xFC] = 0x9C`.
    #[test]
    fn solver_produces_expected_mapping() {
        let obf = code_with_bytecode(vec![0xFC, 0x00, 0xFC, 0x01]);
        let stock = code_with_bytecode(vec![0x9C, 0x00, 0x9C, 0x01]);

        let mut corpus = Corpus::new();
        corpus.add_pair(&obf, &stock);
        corpus.add_pair(&obf, &stock);

        let map = corpus.sanitize();
        assert_eq!(map.get(0xFC), 0x9C);
    }

    /// Adding more correctly-paired code objects never decreases the
    /// number of correctly-mapped opcodes.
    #[test]
    fn more_pairs_never_decreases_coverage() {
        let obf = code_with_bytecode(vec![0xFC, 0x00, 0xAA, 0x00]);
        let stock = code_with_bytecode(vec![0x9C, 0x00, 0xBB, 0x00]);

        let mut corpus = Corpus::new();
        let before = corpus.sanitize().len();
        corpus.add_pair(&obf, &stock);
        let after_one = corpus.sanitize().len();
        corpus.add_pair(&obf, &stock);
        let after_two = corpus.sanitize().len();

        assert!(after_one >= before);
        assert!(after_two >= after_one);
    }

    /// Sanitization never maps a byte to itself.
    #[test]
    fn sanitization_excludes_identity() {
        let obf = code_with_bytecode(vec![0x10, 0x00, 0x10, 0x00]);
        let stock = code_with_bytecode(vec![0x10, 0x00, 0x20, 0x00]);

        let mut corpus = Corpus::new();
        corpus.add_pair(&obf, &stock);
        corpus.add_pair(&obf, &stock);
        corpus.add_pair(&obf, &stock);

        let map = corpus.sanitize();
        assert!(!map.is_empty());
        for (k, v) in map.entries() {
            assert_ne!(k, v, "no key should map to itself");
        }
    }

    #[test]
    fn length_mismatch_is_counted_not_fatal() {
        let obf = code_with_bytecode(vec![0x01, 0x00]);
        let stock = code_with_bytecode(vec![0x01, 0x00, 0x02, 0x00]);

        let mut corpus = Corpus::new();
        corpus.add_pair(&obf, &stock);
        assert_eq!(corpus.length_mismatches(), 1);
    }
}

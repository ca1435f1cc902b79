//! `OpcodeMap` - the sanitized, persistent byte→byte permutation table.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};

use crate::{Error, Result};

/// A partial mapping from obfuscated opcode byte to stock opcode byte.
/// Bytes absent from the map pass through unchanged (identity).
#[derive(Debug, Clone, Default)]
pub struct OpcodeMap {
    entries: BTreeMap<u8, u8>,
}

impl OpcodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<u8, u8>) -> Self {
        Self { entries }
    }

    /// Translate `obfuscated`, or return it unchanged if unmapped.
    pub fn get(&self, obfuscated: u8) -> u8 {
        self.entries.get(&obfuscated).copied().unwrap_or(obfuscated)
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist as `name = hexvalue`-style text, one `obfuscated = stock`
    /// hex-byte pair per line, keys in ascending order - the same keyed
    /// text-table shape this crate's key-file parsing idiom already uses.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        for (k, v) in &self.entries {
            writeln!(w, "{k:02x} = {v:02x}")?;
        }
        Ok(())
    }

    /// Load a table written by [`Self::save`]. Lines beginning with `;`
    /// and blank lines are ignored, matching the crate's other key-file
    /// readers.
    pub fn load<R: Read>(r: R) -> Result<Self> {
        let buf = BufReader::new(r);
        let mut entries = BTreeMap::new();
        for line in buf.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let k = parse_hex_byte(k.trim())?;
            let v = parse_hex_byte(v.trim())?;
            entries.insert(k, v);
        }
        Ok(Self { entries })
    }
}

fn parse_hex_byte(s: &str) -> Result<u8> {
    u8::from_str_radix(s, 16).map_err(|_| Error::SizeOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text_format() {
        let mut entries = BTreeMap::new();
        entries.insert(0xFC, 0x9C);
        entries.insert(0x01, 0x02);
        let map = OpcodeMap::from_entries(entries);

        let mut buf = Vec::new();
        map.save(&mut buf).unwrap();
        let loaded = OpcodeMap::load(&buf[..]).unwrap();

        assert_eq!(loaded.get(0xFC), 0x9C);
        assert_eq!(loaded.get(0x01), 0x02);
    }

    #[test]
    fn unmapped_bytes_are_identity() {
        let map = OpcodeMap::new();
        assert_eq!(map.get(0x42), 0x42);
    }
}

//! Rodata literal pool
//!
//! Immutable literals (strings, constant lists and maps, C format strings)
//! are encoded once into the read-only section and referenced by symbol.
//! Identical content is interned to a single symbol.
//!
//! Universal value layout: a count word (a double whose integer value is N)
//! at offset 0, then N key/value pairs of doubles; entry i's key sits at
//! `8 + 16·i`, its value at `16 + 16·i`, and the whole block occupies
//! `8 + 16·N` bytes.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RodataPool {
    bytes: Vec<u8>,
    symbols: HashMap<String, u64>,
    interned: HashMap<Vec<u8>, String>,
    next_id: usize,
}

/// Encode key/value pairs in the universal map layout.
pub fn encode_pairs(pairs: &[(f64, f64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 16 * pairs.len());
    out.extend_from_slice(&(pairs.len() as f64).to_le_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(&k.to_le_bytes());
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Encode a string: sequential indices from 0 mapping to code points.
pub fn encode_string(s: &str) -> Vec<u8> {
    let pairs: Vec<(f64, f64)> = s
        .chars()
        .enumerate()
        .map(|(i, c)| (i as f64, c as u32 as f64))
        .collect();
    encode_pairs(&pairs)
}

/// Encode a list: sequential indices from 0 mapping to the elements.
pub fn encode_list(items: &[f64]) -> Vec<u8> {
    let pairs: Vec<(f64, f64)> = items.iter().enumerate().map(|(i, v)| (i as f64, *v)).collect();
    encode_pairs(&pairs)
}

/// Decode the value column of a universal block (tests and diagnostics).
pub fn decode_values(bytes: &[u8]) -> Vec<f64> {
    let n = f64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
    (0..n)
        .map(|i| {
            let at = 16 + 16 * i;
            f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
        })
        .collect()
}

impl RodataPool {
    pub fn new() -> Self {
        RodataPool::default()
    }

    fn intern(&mut self, prefix: &str, content: Vec<u8>, align: usize) -> String {
        if let Some(sym) = self.interned.get(&content) {
            return sym.clone();
        }
        while !self.bytes.len().is_multiple_of(align) {
            self.bytes.push(0);
        }
        let sym = format!("{}{}", prefix, self.next_id);
        self.next_id += 1;
        self.symbols.insert(sym.clone(), self.bytes.len() as u64);
        self.bytes.extend_from_slice(&content);
        self.interned.insert(content, sym.clone());
        sym
    }

    /// A string literal in the universal layout.
    pub fn string(&mut self, s: &str) -> String {
        self.intern("str", encode_string(s), 8)
    }

    /// A null-terminated C string (format strings, C-context literals).
    pub fn cstr(&mut self, s: &str) -> String {
        let mut content = s.as_bytes().to_vec();
        content.push(0);
        self.intern("cstr", content, 1)
    }

    /// A constant list in the universal layout.
    pub fn list(&mut self, items: &[f64]) -> String {
        self.intern("lst", encode_list(items), 8)
    }

    /// A constant map in the universal layout.
    pub fn map(&mut self, pairs: &[(f64, f64)]) -> String {
        self.intern("map", encode_pairs(pairs), 8)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn take(&mut self) -> (Vec<u8>, HashMap<String, u64>) {
        (std::mem::take(&mut self.bytes), std::mem::take(&mut self.symbols))
    }

    pub fn offset_of(&self, sym: &str) -> Option<u64> {
        self.symbols.get(sym).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let bytes = encode_string("Hi");
        assert_eq!(bytes.len(), 8 + 16 * 2);
        assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 2.0);
        // key 0, value 'H'
        assert_eq!(f64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0.0);
        assert_eq!(f64::from_le_bytes(bytes[16..24].try_into().unwrap()), 'H' as u32 as f64);
        // key 1, value 'i'
        assert_eq!(f64::from_le_bytes(bytes[24..32].try_into().unwrap()), 1.0);
        assert_eq!(f64::from_le_bytes(bytes[32..40].try_into().unwrap()), 'i' as u32 as f64);
    }

    #[test]
    fn test_string_decode_roundtrip() {
        let bytes = encode_string("flap");
        let vals = decode_values(&bytes);
        let back: String = vals.iter().map(|v| char::from_u32(*v as u32).unwrap()).collect();
        assert_eq!(back, "flap");
    }

    #[test]
    fn test_list_roundtrip_order() {
        let bytes = encode_list(&[10.0, 20.0, 30.0]);
        assert_eq!(decode_values(&bytes), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_interning_dedups() {
        let mut pool = RodataPool::new();
        let a = pool.string("same");
        let b = pool.string("same");
        let c = pool.string("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.bytes().len(), 2 * (8 + 16 * 4) + /* padding */ 0);
    }

    #[test]
    fn test_cstr_nul_terminated() {
        let mut pool = RodataPool::new();
        let sym = pool.cstr("%ld");
        let off = pool.offset_of(&sym).unwrap() as usize;
        assert_eq!(&pool.bytes()[off..off + 4], b"%ld\0");
    }

    #[test]
    fn test_alignment_of_value_blocks() {
        let mut pool = RodataPool::new();
        pool.cstr("x"); // 2 bytes, throws off alignment
        let sym = pool.list(&[1.0]);
        assert_eq!(pool.offset_of(&sym).unwrap() % 8, 0);
    }
}

//! Symbol table and patch resolution
//!
//! During emission every call, rodata reference, or data reference to a not
//! yet-placed address is recorded as a patch. After all sections are sized
//! and the writer assigns base addresses, [`resolve_patches`] rewrites the
//! text bytes; a symbol found nowhere is an `UnresolvedSymbol` error, and a
//! successful resolution leaves no patch unapplied.

use super::emitter::{Emitter, Patch};
use crate::error::{CompileError, ErrorKind, Result, Span};
use flap_object::{ImportSym, Layout};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Text-relative offsets of functions we emitted.
    pub text: HashMap<String, u64>,
    /// Rodata-relative offsets of literals.
    pub rodata: HashMap<String, u64>,
    /// Data-relative offsets of mutable globals.
    pub data: HashMap<String, u64>,
    /// External symbols in first-use order.
    pub imports: Vec<ImportSym>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn define_text(&mut self, name: &str, offset: u64) {
        self.text.insert(name.to_string(), offset);
    }

    pub fn define_data(&mut self, name: &str, offset: u64) {
        self.data.insert(name.to_string(), offset);
    }

    pub fn set_rodata(&mut self, symbols: HashMap<String, u64>) {
        self.rodata = symbols;
    }

    /// Record an external dependency; idempotent per symbol.
    pub fn import(&mut self, name: &str, lib: &str) {
        if !self.imports.iter().any(|i| i.name == name) {
            self.imports.push(ImportSym { name: name.to_string(), lib: lib.to_string() });
        }
    }

    /// Shared objects needed, deduplicated in first-use order.
    pub fn needed_libs(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for imp in &self.imports {
            if !out.contains(&imp.lib) {
                out.push(imp.lib.clone());
            }
        }
        out
    }
}

/// Rewrite every patch site against final addresses. The patch list must
/// come out empty of unresolved entries; any leftover aborts compilation.
pub fn resolve_patches(
    code: &mut [u8],
    patches: &[Patch],
    emitter: &dyn Emitter,
    symbols: &SymbolTable,
    layout: &Layout,
) -> Result<()> {
    for patch in patches {
        let target = if let Some(off) = symbols.text.get(&patch.sym) {
            layout.text_addr + off
        } else if let Some(off) = symbols.rodata.get(&patch.sym) {
            layout.rodata_addr + off
        } else if let Some(off) = symbols.data.get(&patch.sym) {
            layout.data_addr + off
        } else if let Some(addr) = layout.stubs.get(&patch.sym) {
            *addr
        } else {
            return Err(CompileError::new(
                ErrorKind::UnresolvedSymbol,
                Span::default(),
                format!("no definition or import stub for symbol '{}'", patch.sym),
            ));
        };
        let place = layout.text_addr + patch.at as u64;
        emitter.apply_patch(code, patch, target, place);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emitter::{PatchKind, Reg};
    use crate::codegen::x86_64::X86_64Emitter;

    #[test]
    fn test_import_dedup_and_needed() {
        let mut syms = SymbolTable::new();
        syms.import("malloc", "libc.so.6");
        syms.import("printf", "libc.so.6");
        syms.import("malloc", "libc.so.6");
        syms.import("pthread_create", "libpthread.so.0");
        assert_eq!(syms.imports.len(), 3);
        assert_eq!(syms.needed_libs(), vec!["libc.so.6".to_string(), "libpthread.so.0".to_string()]);
    }

    #[test]
    fn test_resolution_against_each_section() {
        let mut em = X86_64Emitter::new(false);
        em.call_symbol("local_fn");
        em.lea_symbol(Reg::Arg0, "str0");
        em.lea_symbol(Reg::Arg1, "flap_meta");
        em.call_symbol("malloc");
        let (mut code, patches) = em.take();

        let mut syms = SymbolTable::new();
        syms.define_text("local_fn", 0x100);
        syms.rodata.insert("str0".to_string(), 0x40);
        syms.define_data("flap_meta", 0);
        syms.import("malloc", "libc.so.6");

        let mut stubs = HashMap::new();
        stubs.insert("malloc".to_string(), 0x400800u64);
        let layout = Layout {
            text_addr: 0x401000,
            rodata_addr: 0x402000,
            data_addr: 0x403000,
            stubs,
        };
        resolve_patches(&mut code, &patches, &em, &syms, &layout).unwrap();

        // call local_fn: target 0x401100, place 0x401000, disp = 0x100 - 5
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp as i64, 0x100 - 5);
    }

    #[test]
    fn test_unresolved_symbol_aborts() {
        let mut em = X86_64Emitter::new(false);
        em.call_symbol("ghost");
        let (mut code, patches) = em.take();
        let syms = SymbolTable::new();
        let layout = Layout {
            text_addr: 0x401000,
            rodata_addr: 0x402000,
            data_addr: 0x403000,
            stubs: HashMap::new(),
        };
        let err = resolve_patches(&mut code, &patches, &em, &syms, &layout).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedSymbol);
        assert_eq!(patches[0].kind, PatchKind::Call);
    }
}

//! Compiler configuration
//!
//! Carries everything the driver decides before compilation starts: the
//! target, FFI manifests, and arena sizing. Built with the `with_*` chain
//! so external tooling can extend a default configuration piecemeal.

use crate::error::Result;
use crate::ffi::{FfiConstant, FfiDecl, FfiManifest};
use flap_object::{Arch, Os, Target};
use std::collections::HashMap;
use std::path::Path;

/// Initial arena capacity in bytes; doubles on overflow.
pub const DEFAULT_ARENA_CAPACITY: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub target: Target,
    /// C functions callable from Flap code, keyed by Flap-visible name.
    foreign: HashMap<String, FfiDecl>,
    /// Integer constants from manifests.
    constants: HashMap<String, f64>,
    /// Initial capacity of the base arena.
    pub arena_capacity: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: host_target(),
            foreign: HashMap::new(),
            constants: HashMap::new(),
            arena_capacity: DEFAULT_ARENA_CAPACITY,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_arena_capacity(mut self, bytes: u64) -> Self {
        self.arena_capacity = bytes.max(4096);
        self
    }

    /// Load an FFI manifest file and register its functions and constants.
    pub fn with_manifest(mut self, path: &Path) -> Result<Self> {
        let manifest = FfiManifest::load(path)?;
        self.add_manifest(manifest);
        Ok(self)
    }

    pub fn add_manifest(&mut self, manifest: FfiManifest) {
        for decl in manifest.functions {
            self.foreign.insert(decl.name.clone(), decl);
        }
        for FfiConstant { name, value } in manifest.constants {
            self.constants.insert(name, value);
        }
    }

    /// Declared C function by Flap-visible name.
    pub fn foreign(&self, name: &str) -> Option<&FfiDecl> {
        self.foreign.get(name)
    }

    /// Declared C function by link symbol.
    pub fn foreign_by_symbol(&self, symbol: &str) -> Option<&FfiDecl> {
        self.foreign.values().find(|d| d.symbol == symbol)
    }

    /// Manifest constant by name.
    pub fn constant(&self, name: &str) -> Option<f64> {
        self.constants.get(name).copied()
    }
}

/// Target matching the machine the compiler runs on; the writer set caps
/// what is expressible (Mach-O implies ARM64, PE implies x86-64).
pub fn host_target() -> Target {
    let arch = if cfg!(target_arch = "aarch64") {
        Arch::Arm64
    } else if cfg!(target_arch = "riscv64") {
        Arch::Riscv64
    } else {
        Arch::Amd64
    };
    let os = if cfg!(target_os = "macos") {
        Os::Darwin
    } else if cfg!(target_os = "windows") {
        Os::Windows
    } else {
        Os::Linux
    };
    // Unsupported writer combinations fall back to ELF output.
    let target = Target::new(arch, os);
    if target.validate().is_ok() {
        target
    } else {
        Target::new(arch, Os::Linux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::FfiManifest;

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert!(config.target.validate().is_ok());
        assert_eq!(config.arena_capacity, DEFAULT_ARENA_CAPACITY);
        assert!(config.foreign("pow").is_none());
    }

    #[test]
    fn test_manifest_registration() {
        let mut config = CompilerConfig::new();
        let manifest = FfiManifest::parse(
            "[library]\nname = \"m\"\n[[function]]\nname = \"pow\"\nargs = [\"float64\", \"float64\"]\nret = \"float64\"\n[[constant]]\nname = \"HUGE\"\nvalue = 1e300\n",
        )
        .unwrap();
        config.add_manifest(manifest);
        assert!(config.foreign("pow").is_some());
        assert_eq!(config.constant("HUGE"), Some(1e300));
        assert!(config.foreign_by_symbol("pow").is_some());
    }

    #[test]
    fn test_arena_capacity_floor() {
        let config = CompilerConfig::new().with_arena_capacity(16);
        assert_eq!(config.arena_capacity, 4096);
    }
}

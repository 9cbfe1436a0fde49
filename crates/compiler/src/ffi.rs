//! FFI manifests
//!
//! The compiler does not parse C headers itself; it consumes TOML manifests
//! declaring the C functions and integer constants a library provides:
//!
//! ```toml
//! [library]
//! name = "m"
//! soname = "libm.so.6"
//! dll = "msvcrt.dll"
//! dylib = "/usr/lib/libSystem.B.dylib"
//!
//! [[function]]
//! name = "pow"
//! args = ["float64", "float64"]
//! ret = "float64"
//!
//! [[constant]]
//! name = "RAND_MAX"
//! value = 2147483647
//! ```
//!
//! `symbol` defaults to `name`. Argument and return types use the
//! contextual type keywords of [`crate::types::ValueType::from_name`];
//! calls to a declared function marshal per §C-ABI rules in codegen.

use crate::error::{CompileError, ErrorKind, Result, Span};
use crate::types::ValueType;
use serde::Deserialize;
use std::path::Path;

/// A C function signature usable from Flap code.
#[derive(Debug, Clone, PartialEq)]
pub struct FfiDecl {
    /// Name used in Flap source.
    pub name: String,
    /// Link symbol.
    pub symbol: String,
    pub args: Vec<ValueType>,
    pub ret: ValueType,
    /// Library the symbol comes from, per target OS convention.
    pub lib: FfiLib,
}

/// Per-format providing library names.
#[derive(Debug, Clone, PartialEq)]
pub struct FfiLib {
    pub soname: String,
    pub dylib: String,
    pub dll: String,
}

impl FfiLib {
    /// Library carrying the C runtime itself; always implicitly available.
    pub fn libc() -> FfiLib {
        FfiLib {
            soname: "libc.so.6".to_string(),
            dylib: "/usr/lib/libSystem.B.dylib".to_string(),
            dll: "msvcrt.dll".to_string(),
        }
    }
}

/// A named integer constant from a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct FfiConstant {
    pub name: String,
    pub value: f64,
}

// ---- raw TOML shapes ----

#[derive(Debug, Deserialize)]
struct RawManifest {
    library: RawLibrary,
    #[serde(default, rename = "function")]
    functions: Vec<RawFunction>,
    #[serde(default, rename = "constant")]
    constants: Vec<RawConstant>,
}

#[derive(Debug, Deserialize)]
struct RawLibrary {
    name: String,
    soname: Option<String>,
    dylib: Option<String>,
    dll: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    symbol: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    ret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConstant {
    name: String,
    value: f64,
}

/// Parsed manifest contents.
#[derive(Debug, Clone, Default)]
pub struct FfiManifest {
    pub functions: Vec<FfiDecl>,
    pub constants: Vec<FfiConstant>,
}

impl FfiManifest {
    pub fn load(path: &Path) -> Result<FfiManifest> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::new(
                ErrorKind::Internal,
                Span::default(),
                format!("cannot read FFI manifest {}: {}", path.display(), e),
            )
            .with_file(path)
        })?;
        FfiManifest::parse(&text).map_err(|e| e.with_file(path))
    }

    pub fn parse(text: &str) -> Result<FfiManifest> {
        let raw: RawManifest = toml::from_str(text).map_err(|e| {
            CompileError::new(
                ErrorKind::Parse,
                Span::default(),
                format!("invalid FFI manifest: {}", e),
            )
        })?;

        let lib = FfiLib {
            soname: raw
                .library
                .soname
                .unwrap_or_else(|| format!("lib{}.so", raw.library.name)),
            dylib: raw
                .library
                .dylib
                .unwrap_or_else(|| format!("/usr/lib/lib{}.dylib", raw.library.name)),
            dll: raw.library.dll.unwrap_or_else(|| format!("{}.dll", raw.library.name)),
        };

        let mut functions = Vec::new();
        for f in raw.functions {
            let mut args = Vec::new();
            for a in &f.args {
                args.push(parse_type(a)?);
            }
            let ret = match &f.ret {
                Some(name) => parse_type(name)?,
                None => ValueType::Unknown,
            };
            functions.push(FfiDecl {
                symbol: f.symbol.unwrap_or_else(|| f.name.clone()),
                name: f.name,
                args,
                ret,
                lib: lib.clone(),
            });
        }

        let constants = raw
            .constants
            .into_iter()
            .map(|c| FfiConstant { name: c.name, value: c.value })
            .collect();

        Ok(FfiManifest { functions, constants })
    }
}

fn parse_type(name: &str) -> Result<ValueType> {
    ValueType::from_name(name).ok_or_else(|| {
        CompileError::new(
            ErrorKind::Parse,
            Span::default(),
            format!("unknown C type '{}' in FFI manifest", name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[library]
name = "m"
soname = "libm.so.6"

[[function]]
name = "pow"
args = ["float64", "float64"]
ret = "float64"

[[function]]
name = "c_abs"
symbol = "abs"
args = ["int32"]
ret = "int32"

[[constant]]
name = "RAND_MAX"
value = 2147483647
"#;

    #[test]
    fn test_parse_manifest() {
        let m = FfiManifest::parse(MANIFEST).unwrap();
        assert_eq!(m.functions.len(), 2);
        let pow = &m.functions[0];
        assert_eq!(pow.name, "pow");
        assert_eq!(pow.symbol, "pow");
        assert_eq!(pow.args, vec![ValueType::CFloat64, ValueType::CFloat64]);
        assert_eq!(pow.ret, ValueType::CFloat64);
        assert_eq!(pow.lib.soname, "libm.so.6");

        let abs = &m.functions[1];
        assert_eq!(abs.name, "c_abs");
        assert_eq!(abs.symbol, "abs");
    }

    #[test]
    fn test_constants() {
        let m = FfiManifest::parse(MANIFEST).unwrap();
        assert_eq!(m.constants.len(), 1);
        assert_eq!(m.constants[0].name, "RAND_MAX");
        assert_eq!(m.constants[0].value, 2147483647.0);
    }

    #[test]
    fn test_default_library_names() {
        let m = FfiManifest::parse("[library]\nname = \"foo\"\n").unwrap();
        assert!(m.functions.is_empty());
        let m2 = FfiManifest::parse(
            "[library]\nname = \"foo\"\n[[function]]\nname = \"bar\"\n",
        )
        .unwrap();
        assert_eq!(m2.functions[0].lib.soname, "libfoo.so");
        assert_eq!(m2.functions[0].lib.dll, "foo.dll");
        assert_eq!(m2.functions[0].ret, ValueType::Unknown);
    }

    #[test]
    fn test_bad_type_rejected() {
        let text = "[library]\nname = \"x\"\n[[function]]\nname = \"f\"\nargs = [\"quux\"]\n";
        assert!(FfiManifest::parse(text).is_err());
    }
}

//! Flap Compiler Library
//!
//! A direct, single-pass compiler for the Flap programming language: source
//! text lowers straight to native machine code and a self-contained
//! executable (ELF, Mach-O, or PE) with no intermediate representation,
//! external assembler, or linker.
//!
//! The pipeline is strictly one pass: source → tokens → AST → (in one walk)
//! machine code + rodata + patch list → binary image. The resolver runs as
//! a pre-pass on the AST computing per-function stack layouts and capture
//! sets before emission begins.
//!
//! # Extending the compiler
//!
//! C functions become callable by registering FFI manifests on
//! [`CompilerConfig`]:
//!
//! ```rust,ignore
//! use flapc::{CompilerConfig, compile_file};
//!
//! let config = CompilerConfig::new()
//!     .with_manifest(Path::new("curses.toml"))?
//!     .with_target(Target::parse("arm64-linux")?);
//! compile_file(&input, &output, &config)?;
//! ```

pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod config;
pub mod error;
pub mod ffi;
pub mod imports;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod types;

pub use config::CompilerConfig;
pub use error::{CompileError, ErrorKind};
pub use ffi::{FfiDecl, FfiManifest};
pub use flap_object::{Arch, Os, Target};
pub use parser::Parser;
pub use resolver::{ResolvedProgram, Resolver};
pub use types::ValueType;

use error::Result;
use flap_object::Image;
use std::path::Path;
use tracing::debug;

/// Compile Flap source text to final executable bytes.
pub fn compile_source(source: &str, file: &Path, config: &CompilerConfig) -> Result<Vec<u8>> {
    let mut parser = Parser::new(source).map_err(|e| e.with_file(file))?;
    let mut program = parser.parse().map_err(|e| e.with_file(file))?;
    program.file = file.to_path_buf();
    debug!(stmts = program.stmts.len(), imports = program.imports.len(), "parsed");

    let mut program = imports::resolve_imports(program, file, parser.next_id())?;
    let resolved = resolver::resolve(&mut program, config).map_err(|e| e.with_file(file))?;
    debug!(frames = resolved.frames.len(), "resolved");

    let mut module =
        codegen::generate(&program, &resolved, config).map_err(|e| e.with_file(file))?;
    debug!(
        text = module.text.len(),
        rodata = module.rodata.len(),
        patches = module.patches.len(),
        "emitted"
    );

    // Size the sections, then fix every patch against final addresses.
    let mut image = Image {
        target: module.target,
        text: module.text.clone(),
        rodata: module.rodata.clone(),
        data: module.data.clone(),
        symbols: module.symbols.text.clone(),
        entry: "flap_start".to_string(),
        imports: module.symbols.imports.clone(),
        needed: module.symbols.needed_libs(),
    };
    let layout = flap_object::layout_for(&image)
        .map_err(|e| object_error(e).with_file(file))?;
    codegen::resolve_module(&mut module, &layout).map_err(|e| e.with_file(file))?;
    image.text = module.text;

    let bytes = flap_object::write(&image, &layout)
        .map_err(|e| object_error(e).with_file(file))?;
    debug!(bytes = bytes.len(), "wrote image");
    Ok(bytes)
}

/// Compile a `.flap` file to an executable on disk, marked executable on
/// Unix-family hosts.
pub fn compile_file(input: &Path, output: &Path, config: &CompilerConfig) -> Result<()> {
    let source = std::fs::read_to_string(input).map_err(|e| {
        CompileError::internal(format!("cannot read {}: {}", input.display(), e))
            .with_file(input)
    })?;
    let bytes = compile_source(&source, input, config)?;
    std::fs::write(output, &bytes).map_err(|e| {
        CompileError::internal(format!("cannot write {}: {}", output.display(), e))
            .with_file(input)
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(output, perms).map_err(|e| {
            CompileError::internal(format!("cannot chmod {}: {}", output.display(), e))
        })?;
    }
    Ok(())
}

fn object_error(e: flap_object::ObjectError) -> CompileError {
    use flap_object::ObjectError;
    match e {
        ObjectError::NoEntry(sym) => CompileError::new(
            ErrorKind::UnresolvedSymbol,
            error::Span::default(),
            format!("entry symbol '{}' not defined", sym),
        ),
        other => CompileError::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn compile(source: &str, target: &str) -> Result<Vec<u8>> {
        let config = CompilerConfig::default().with_target(Target::parse(target).unwrap());
        compile_source(source, &PathBuf::from("test.flap"), &config)
    }

    #[test]
    fn test_hello_world_elf() {
        let bytes = compile(r#"println("Hello, World!")"#, "amd64-linux").unwrap();
        assert_eq!(&bytes[..4], &[0x7f, b'E', b'L', b'F']);
        // The literal rode along
        let needle: Vec<u8> = {
            // universal layout: count then (idx, codepoint) pairs
            let mut v = (13f64).to_le_bytes().to_vec();
            v.extend_from_slice(&0f64.to_le_bytes());
            v.extend_from_slice(&('H' as u32 as f64).to_le_bytes());
            v
        };
        assert!(bytes.windows(needle.len()).any(|w| w == needle.as_slice()));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let src = "sum := 0\n@ i in 0..<5 { sum <- sum + i }\nprintln(sum)";
        let a = compile(src, "amd64-linux").unwrap();
        let b = compile(src, "amd64-linux").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_all_targets_build_hello() {
        for target in ["amd64-linux", "arm64-linux", "riscv64-linux", "arm64-darwin", "amd64-windows"] {
            let bytes = compile(r#"println("hi")"#, target);
            assert!(bytes.is_ok(), "target {} failed: {:?}", target, bytes.err());
        }
    }

    #[test]
    fn test_shadow_error_source_position() {
        let err = compile("x = 1\nfn = () => { x := 2 }", "amd64-linux").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Shadow);
        assert!(err.to_string().contains("ShadowError"));
        assert!(err.to_string().starts_with("test.flap:2:"));
    }

    #[test]
    fn test_scenarios_compile() {
        // Representative programs over every language corner must all
        // reach binary form
        let programs = [
            "sum := 0\n@ i in 0..<5 { sum <- sum + i }\nprintln(sum)",
            "x := 10 / 0\nsafe := x or! 99\nprintln(safe)",
            "a, b, c = [10, 20, 30]\nprintln(a); println(b); println(c)",
            "out := [0, 0, 0, 0]\n@@ i in 0..<4 { out[i] <- i * i }\nprintln(out[0]); println(out[1]); println(out[2]); println(out[3])",
            r#"code = 2
name = code { 1 -> "one" 2 -> "two" ~> "many" }
println(name)"#,
            "f = (a, rest...) => a + #rest\nprintln(f(1, 2, 3))",
            r#"greet = name => f"hello {name}!"
println(greet("flap"))"#,
            "defer println(2)\nprintln(1)",
            "arena { tmp = [1, 2] + [3]\nprintln(#tmp) }",
            "m = { 1: 10, 2: 20 }\nprintln(m[2])",
            "xs = [1, 2, 3]\nprintln(xs^)\nprintln(#((xs)_))",
            "n = 0b1010 &b 0x6\nprintln(n <<<b 1)",
        ];
        for src in programs {
            let out = compile(src, "amd64-linux");
            assert!(out.is_ok(), "failed to compile:\n{}\n{:?}", src, out.err());
        }
    }

    #[test]
    fn test_ffi_manifest_call_compiles() {
        let manifest = FfiManifest::parse(
            "[library]\nname = \"m\"\nsoname = \"libm.so.6\"\n[[function]]\nname = \"sqrt\"\nargs = [\"float64\"]\nret = \"float64\"\n",
        )
        .unwrap();
        let mut config = CompilerConfig::default()
            .with_target(Target::parse("amd64-linux").unwrap());
        config.add_manifest(manifest);
        let bytes =
            compile_source("println(sqrt(16))", &PathBuf::from("t.flap"), &config).unwrap();
        assert!(bytes.windows(9).any(|w| w == b"libm.so.6"));
    }
}

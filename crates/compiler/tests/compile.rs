//! End-to-end compilation tests: drive the library the way the CLI does,
//! write real binaries into a temp directory, and inspect the images.

use flapc::{CompilerConfig, ErrorKind, Target, compile_file, compile_source};
use std::path::PathBuf;

fn config(target: &str) -> CompilerConfig {
    CompilerConfig::default().with_target(Target::parse(target).unwrap())
}

#[test]
fn test_compile_file_writes_executable() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hello.flap");
    let output = dir.path().join("hello");
    std::fs::write(&input, "println(\"Hello, World!\")\n").unwrap();

    compile_file(&input, &output, &config("amd64-linux")).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(&bytes[..4], &[0x7f, b'E', b'L', b'F']);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&output).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "output not marked executable");
    }
}

#[test]
fn test_binary_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("prog.flap");
    std::fs::write(
        &input,
        "total := 0\n@ i in 1..=10 { total <- total + i }\nprintln(total)\n",
    )
    .unwrap();

    let out_a = dir.path().join("a");
    let out_b = dir.path().join("b");
    compile_file(&input, &out_a, &config("amd64-linux")).unwrap();
    compile_file(&input, &out_b, &config("amd64-linux")).unwrap();
    assert_eq!(std::fs::read(&out_a).unwrap(), std::fs::read(&out_b).unwrap());
}

#[test]
fn test_imports_compile_into_one_binary() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("util.flap"), "double = x => x * 2\n").unwrap();
    let input = dir.path().join("main.flap");
    std::fs::write(&input, "import \"util.flap\"\nprintln(double(21))\n").unwrap();
    let output = dir.path().join("main");
    compile_file(&input, &output, &config("amd64-linux")).unwrap();
    assert!(std::fs::metadata(&output).unwrap().len() > 0);
}

#[test]
fn test_macho_output_signed() {
    let bytes = compile_source(
        "println(\"mac\")",
        &PathBuf::from("t.flap"),
        &config("arm64-darwin"),
    )
    .unwrap();
    assert_eq!(
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        0xfeed_facf
    );
    // Embedded ad-hoc signature SuperBlob magic, big-endian, near the end
    let sig_magic = 0xfade_0cc0u32.to_be_bytes();
    assert!(bytes.windows(4).any(|w| w == sig_magic));
}

#[test]
fn test_pe_output_console_image() {
    let bytes = compile_source(
        "println(\"win\")",
        &PathBuf::from("t.flap"),
        &config("amd64-windows"),
    )
    .unwrap();
    assert_eq!(&bytes[0..2], b"MZ");
    assert!(bytes.windows(11).any(|w| w == b"msvcrt.dll\0"));
    assert!(bytes.windows(13).any(|w| w == b"kernel32.dll\0"));
}

#[test]
fn test_error_format_file_line_col() {
    let err = compile_source(
        "x = 1\nx <- 2\n",
        &PathBuf::from("bad.flap"),
        &config("amd64-linux"),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Immutable);
    let msg = err.to_string();
    assert!(msg.starts_with("bad.flap:2:1: Immutable:"), "got: {}", msg);
}

#[test]
fn test_first_error_aborts() {
    // Both statements are bad; only the first is reported
    let err = compile_source(
        "ghost <- 1\nphantom <- 2\n",
        &PathBuf::from("bad.flap"),
        &config("amd64-linux"),
    )
    .unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_parallel_program_links_pthread() {
    let bytes = compile_source(
        "out := [0, 0, 0, 0]\n@@ i in 0..<4 { out[i] <- i * i }\nprintln(out[3])\n",
        &PathBuf::from("t.flap"),
        &config("amd64-linux"),
    )
    .unwrap();
    assert!(bytes.windows(16).any(|w| w == b"libpthread.so.0\0"));
    assert!(bytes.windows(15).any(|w| w == b"pthread_create\0"));
}

#[test]
fn test_riscv_interp_path() {
    let bytes = compile_source(
        "println(1)",
        &PathBuf::from("t.flap"),
        &config("riscv64-linux"),
    )
    .unwrap();
    assert!(bytes
        .windows(b"/lib/ld-linux-riscv64-lp64d.so.1".len())
        .any(|w| w == b"/lib/ld-linux-riscv64-lp64d.so.1"));
}

#[test]
fn test_unsupported_target_rejected() {
    assert!(Target::parse("riscv64-darwin").is_err());
    assert!(Target::parse("arm64-windows").is_err());
}

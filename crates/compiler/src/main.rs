//! Flap Compiler CLI
//!
//! `flapc [-o OUTPUT] [--target ARCH-OS] INPUT.flap` — compile a Flap
//! program to a self-contained native executable. Targets take the form
//! `arch-os` over {amd64, arm64, riscv64} × {linux, darwin, windows}.
//! Exit code 0 on success, nonzero on error; diagnostics go to stderr as
//! `FILE:LINE:COL: KIND: MESSAGE`.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use flapc::{CompilerConfig, Target};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "flapc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flap compiler - compile .flap programs to native executables", long_about = None)]
struct Cli {
    /// Input .flap source file
    #[arg(required_unless_present = "completions")]
    input: Option<PathBuf>,

    /// Output executable path (defaults to input filename without .flap)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target as arch-os, e.g. amd64-linux, arm64-darwin, riscv64-linux
    #[arg(short, long, value_name = "ARCH-OS")]
    target: Option<String>,

    /// External FFI manifest file(s) to load
    #[arg(long = "ffi-manifest", value_name = "PATH")]
    ffi_manifests: Vec<PathBuf>,

    /// Initial arena capacity in bytes
    #[arg(long, value_name = "BYTES")]
    arena_capacity: Option<u64>,

    /// Verbose compilation tracing (also via FLAPC_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Generate shell completion script and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "flapc", &mut io::stdout());
        return;
    }

    init_tracing(cli.verbose);

    let input = cli.input.expect("clap enforces input presence");
    let output = cli.output.unwrap_or_else(|| {
        // Default: input filename without the .flap extension
        let stem = input.file_stem().unwrap_or_default();
        PathBuf::from(stem)
    });

    let mut config = CompilerConfig::default();
    if let Some(target) = &cli.target {
        match Target::parse(target) {
            Ok(t) => config = config.with_target(t),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(2);
            }
        }
    }
    if let Some(bytes) = cli.arena_capacity {
        config = config.with_arena_capacity(bytes);
    }
    for manifest in &cli.ffi_manifests {
        config = match config.with_manifest(manifest) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        };
    }

    if let Err(e) = flapc::compile_file(&input, &output, &config) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::try_from_env("FLAPC_LOG").unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_env("FLAPC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

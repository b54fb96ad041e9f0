//! The `opal` binary: file runner and REPL
//!
//! Exit codes follow the sysexits convention: 64 for usage problems (and
//! `opal help`), 65 for compile errors, 70 for runtime errors.

mod repl;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use opal_config::VmConfig;
use opal_runtime::{read_program, serialize, write_program, Vm};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

/// The Opal interpreter
#[derive(Parser)]
#[command(name = "opal", version, about = "The Opal interpreter")]
struct Cli {
    /// Script or bytecode file to run; omit to start the REPL
    path: Option<PathBuf>,

    /// Write compiled bytecode next to the source before running
    #[arg(long)]
    serialise: bool,

    /// Silence `print` output (test harness support)
    #[arg(long)]
    suppress_print: bool,

    /// Emit WebAssembly binary instead of running
    #[arg(long)]
    wasm: bool,

    /// Emit WebAssembly text instead of running
    #[arg(long)]
    wat: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if cli.path.as_deref() == Some(Path::new("help")) {
        print_usage();
        return Ok(ExitCode::from(EX_USAGE));
    }

    if cli.wasm || cli.wat {
        eprintln!(
            "{} no WebAssembly back-end is bundled in this build",
            "error:".red().bold()
        );
        return Ok(ExitCode::from(EX_USAGE));
    }

    let config = VmConfig {
        suppress_print: cli.suppress_print,
        ..load_project_config()
    };

    match cli.path {
        Some(path) => run_file(&path, config, cli.serialise),
        None => {
            repl::run(config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_usage() {
    println!("opal {}", opal_runtime::VERSION);
    println!();
    println!("Usage: opal [OPTIONS] [PATH]");
    println!();
    println!("  opal            start the REPL");
    println!("  opal <path>     run a source (.opal) or bytecode (.opb) file");
    println!("  opal help       show this message");
    println!();
    println!("Options:");
    println!("  --serialise       write compiled bytecode next to the source");
    println!("  --suppress-print  silence print output");
    println!("  --wasm, --wat     request WebAssembly emission (needs a back-end build)");
}

/// Interpreter options from `opal.toml` in the working directory, if any
fn load_project_config() -> VmConfig {
    let Ok(text) = fs::read_to_string("opal.toml") else {
        return VmConfig::default();
    };
    match VmConfig::from_toml_str(&text) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{} opal.toml: {}", "warning:".yellow().bold(), error);
            VmConfig::default()
        }
    }
}

fn run_file(path: &Path, config: VmConfig, serialise: bool) -> anyhow::Result<ExitCode> {
    let bytes =
        fs::read(path).with_context(|| format!("could not read {}", path.display()))?;

    let mut vm = Vm::new(config);

    // Bytecode files skip compilation entirely
    if serialize::is_bytecode(&bytes) {
        let loaded = match read_program(vm.heap_mut(), &bytes) {
            Ok(loaded) => loaded,
            Err(error) => {
                eprintln!("{} {}", "error:".red().bold(), error);
                return Ok(ExitCode::from(EX_DATAERR));
            }
        };
        return match vm.execute(loaded.function) {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(error) => {
                eprintln!("{}", error);
                Ok(ExitCode::from(EX_SOFTWARE))
            }
        };
    }

    let source = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?;

    let function = match vm.compile(&source) {
        Ok(function) => function,
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error);
            }
            return Ok(ExitCode::from(EX_DATAERR));
        }
    };

    if serialise {
        let out_path = path.with_extension("opb");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match write_program(vm.heap(), function, &source, &name) {
            Ok(bytes) => fs::write(&out_path, bytes)
                .with_context(|| format!("could not write {}", out_path.display()))?,
            Err(error) => {
                eprintln!("{} {}", "error:".red().bold(), error);
                return Ok(ExitCode::from(EX_SOFTWARE));
            }
        }
    }

    match vm.execute(function) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(error) => {
            eprintln!("{}", error);
            Ok(ExitCode::from(EX_SOFTWARE))
        }
    }
}

//! MITScript command-line front end
//!
//! `mitscript -s program.ms` parses and runs MITScript source;
//! `mitscript -b program.msbc` runs textual bytecode. `--compile` switches
//! from the bytecode interpreter to the native compiler, and `--mem N` sets
//! the collected-heap budget in megabytes. Exit status is 0 on success and
//! 1 on any error, with the error kind prefixed to the message on stderr.

use clap::Parser;
use mitscript_engine::{compile_source, load_bytecode, ExecMode, Vm, VmOptions};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mitscript")]
#[command(about = "MITScript interpreter and native compiler")]
#[command(version)]
struct Cli {
    /// Input file
    file: PathBuf,

    /// Treat the input as MITScript source text
    #[arg(short = 's', long = "source")]
    source: bool,

    /// Treat the input as textual bytecode
    #[arg(short = 'b', long = "bytecode", conflicts_with = "source")]
    bytecode: bool,

    /// Heap budget in megabytes
    #[arg(long = "mem", value_name = "MB", default_value_t = 1000)]
    mem: usize,

    /// Execute through the native compiler instead of the interpreter
    #[arg(long)]
    compile: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    if cli.source == cli.bytecode {
        return Err("exactly one of -s or -b is required".to_string());
    }

    let text = std::fs::read_to_string(&cli.file)
        .map_err(|e| format!("cannot open file {}: {e}", cli.file.display()))?;

    let mode = if cli.compile {
        ExecMode::Compile
    } else {
        ExecMode::Interpret
    };
    let mut vm = Vm::new(VmOptions {
        max_heap_mb: cli.mem,
        mode,
    });

    let main_fn = if cli.source {
        compile_source(&mut vm, &text)
    } else {
        load_bytecode(&mut vm, &text)
    }
    .map_err(|e| e.to_string())?;

    vm.run(main_fn).map_err(|e| e.to_string())
}

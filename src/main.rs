// File: src/main.rs
//
// Command-line entry point: dispatches to run/repl/disassemble depending on
// the subcommand, exiting with the process code the language defines
// (`ExitCode::Ok`/`CompileError`/`RuntimeError`).

use clap::{Parser as ClapParser, Subcommand};
use lumen::{disassembler, interpret_with, ExitCode, Vm};
use std::fs;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(name = "lumen", about = "lumen: a small Lox-family scripting language", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a script file
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Print each instruction as the VM executes it
        #[arg(long)]
        trace: bool,
    },

    /// Compile a script and print its disassembly without running it
    Disassemble {
        /// Path to the source file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Some(Commands::Run { file, trace }) => run(&file, trace),
        Some(Commands::Disassemble { file }) => disassemble(&file),
        None => {
            run_repl(false);
            ExitCode::Ok
        }
    };

    std::process::exit(exit_code as i32);
}

fn read_source(file: &PathBuf) -> String {
    fs::read_to_string(file).unwrap_or_else(|err| {
        eprintln!("lumen: couldn't read {}: {err}", file.display());
        std::process::exit(1);
    })
}

fn run(file: &PathBuf, trace: bool) -> ExitCode {
    let source = read_source(file);
    let mut vm = Vm::new();
    vm.trace = trace;
    interpret_with(&mut vm, &source)
}

fn disassemble(file: &PathBuf) -> ExitCode {
    let source = read_source(file);
    let mut pool = lumen::intern::InternPool::new();
    match lumen::compiler::compile(&source, &mut pool) {
        Ok(function) => {
            print!("{}", disassembler::disassemble_chunk(&function.chunk, function.display_name()));
            ExitCode::Ok
        }
        Err(errors) => {
            for err in &errors {
                eprint!("{err}");
            }
            ExitCode::CompileError
        }
    }
}

fn run_repl(trace: bool) {
    match lumen::repl::Repl::new() {
        Ok(repl) => {
            if let Err(err) = repl.with_trace(trace).run() {
                eprintln!("lumen: repl error: {err}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("lumen: failed to start repl: {err}");
            std::process::exit(1);
        }
    }
}

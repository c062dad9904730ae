// File: src/lib.rs
//
// Public entry points: compile-and-run a whole source string, or drive the
// VM and compiler directly for embedding.

pub mod chunk;
pub mod compiler;
pub mod disassembler;
pub mod errors;
pub mod intern;
pub mod lexer;
pub mod limits;
pub mod native;
pub mod repl;
pub mod value;
pub mod vm;

pub use errors::{ErrorKind, ExitCode, LumenError};
pub use vm::Vm;

/// Compile and run `source` against a fresh VM, printing diagnostics to
/// stderr and returning the process exit code callers should use.
pub fn interpret(source: &str) -> ExitCode {
    let mut vm = Vm::new();
    interpret_with(&mut vm, source)
}

/// Same as [`interpret`], but reuses an existing VM so its globals persist
/// — the REPL's building block.
pub fn interpret_with(vm: &mut Vm, source: &str) -> ExitCode {
    match vm.interpret(source) {
        Ok(()) => ExitCode::Ok,
        Err(errors) => {
            let kind = errors.first().map(|e| e.kind).unwrap_or(ErrorKind::Compile);
            for err in &errors {
                eprint!("{err}");
            }
            match kind {
                ErrorKind::Compile => ExitCode::CompileError,
                ErrorKind::Runtime => ExitCode::RuntimeError,
            }
        }
    }
}

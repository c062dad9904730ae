// File: src/repl.rs
//
// Interactive read-eval-print loop. A single `Vm` lives for the whole
// session so globals defined on one line are visible to the next. Bare
// expressions get an echoed result the way a teaching REPL does, without
// requiring `print` for every scratch calculation.

use crate::errors::{ErrorKind, LumenError};
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Self { vm: Vm::new(), editor })
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.vm.trace = trace;
        self
    }

    fn show_banner(&self) {
        println!("{}", "lumen REPL".bright_cyan().bold());
        println!("  {} Ctrl+D to exit, bare expressions are echoed", "tip:".dimmed());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() { "lumen> ".bright_green().to_string() } else { "  ...> ".bright_blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_balanced(&buffer) {
                        self.eval(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {err}", "Error:".bright_red());
                    break;
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, source: &str) {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return;
        }

        let worth_echoing = !trimmed.ends_with(';') && !trimmed.starts_with("print");
        if worth_echoing {
            let wrapped = format!("print {trimmed};");
            match self.vm.interpret(&wrapped) {
                Ok(()) => return,
                Err(errors) if errors.iter().any(|e| e.kind == ErrorKind::Compile) => {
                    // Not a bare expression after all — fall through and
                    // compile it as a plain statement instead.
                }
                Err(errors) => {
                    self.report(&errors);
                    return;
                }
            }
        }

        let statement = if trimmed.ends_with(';') { trimmed.to_string() } else { format!("{trimmed};") };
        if let Err(errors) = self.vm.interpret(&statement) {
            self.report(&errors);
        }
    }

    fn report(&self, errors: &[LumenError]) {
        for err in errors {
            eprint!("{err}");
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to start line editor")
    }
}

/// True once every brace/bracket/paren is closed and we're not mid-string —
/// the same balance check a multi-line REPL needs to know when to execute.
fn is_balanced(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                while let Some(c) = chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            _ => {}
        }
    }

    !in_string && depth <= 0
}

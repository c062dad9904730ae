// File: src/disassembler.rs
//
// Human-readable bytecode listings, built on the same `chunk::decode` the VM
// dispatch loop uses. Backs both `lumen disassemble` and the `--trace` flag.

use crate::chunk::{decode, Chunk, Instruction};
use crate::value::Value;
use std::fmt::Write as _;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, consumed) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset += consumed;
    }
    out
}

/// Render the instruction at `offset`, returning the rendered line and the
/// number of bytes it occupied on the wire.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let (instruction, len) = decode(chunk, offset);
    let line_no = chunk.line_for_offset(offset);
    let same_line = offset > 0 && chunk.line_for_offset(offset - 1) == line_no;
    let mut out = String::new();
    let _ = write!(out, "{offset:04} ");
    if same_line {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{line_no:4} ");
    }
    let _ = write!(out, "{}", render(&instruction, chunk, offset));
    (out, len)
}

fn render(instruction: &Instruction, chunk: &Chunk, offset: usize) -> String {
    match instruction {
        Instruction::Constant(idx) => format!("OP_CONSTANT         {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::Nil => "OP_NIL".to_string(),
        Instruction::True => "OP_TRUE".to_string(),
        Instruction::False => "OP_FALSE".to_string(),
        Instruction::Pop => "OP_POP".to_string(),
        Instruction::GetLocal(slot) => format!("OP_GET_LOCAL        {slot:4}"),
        Instruction::SetLocal(slot) => format!("OP_SET_LOCAL        {slot:4}"),
        Instruction::GetGlobal(idx) => format!("OP_GET_GLOBAL       {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::SetGlobal(idx) => format!("OP_SET_GLOBAL       {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::DefineGlobal(idx) => format!("OP_DEFINE_GLOBAL    {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::GetUpvalue(slot) => format!("OP_GET_UPVALUE      {slot:4}"),
        Instruction::SetUpvalue(slot) => format!("OP_SET_UPVALUE      {slot:4}"),
        Instruction::GetProperty(idx) => format!("OP_GET_PROPERTY     {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::SetProperty(idx) => format!("OP_SET_PROPERTY     {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::Equal => "OP_EQUAL".to_string(),
        Instruction::Greater => "OP_GREATER".to_string(),
        Instruction::Less => "OP_LESS".to_string(),
        Instruction::Add => "OP_ADD".to_string(),
        Instruction::Subtract => "OP_SUBTRACT".to_string(),
        Instruction::Multiply => "OP_MULTIPLY".to_string(),
        Instruction::Divide => "OP_DIVIDE".to_string(),
        Instruction::BitwiseAnd => "OP_BITWISE_AND".to_string(),
        Instruction::BitwiseOr => "OP_BITWISE_OR".to_string(),
        Instruction::Not => "OP_NOT".to_string(),
        Instruction::Negate => "OP_NEGATE".to_string(),
        Instruction::Print => "OP_PRINT".to_string(),
        Instruction::Jump(dist) => format!("OP_JUMP             {offset:4} -> {}", offset + 3 + *dist as usize),
        Instruction::JumpIfFalse(dist) => {
            format!("OP_JUMP_IF_FALSE    {offset:4} -> {}", offset + 3 + *dist as usize)
        }
        Instruction::Loop(dist) => format!("OP_LOOP             {offset:4} -> {}", offset + 3 - *dist as usize),
        Instruction::Call(argc) => format!("OP_CALL             {argc:4}"),
        Instruction::Invoke(idx, argc) => {
            format!("OP_INVOKE           ({argc} args) {idx:4} '{}'", fmt_const(chunk, *idx))
        }
        Instruction::Closure(idx, upvalues) => {
            let mut s = format!("OP_CLOSURE          {idx:4} '{}'", fmt_const(chunk, *idx));
            for (is_local, index) in upvalues {
                let _ = write!(s, "\n      | {} {index}", if *is_local { "local" } else { "upvalue" });
            }
            s
        }
        Instruction::CloseUpvalue => "OP_CLOSE_UPVALUE".to_string(),
        Instruction::Return => "OP_RETURN".to_string(),
        Instruction::Class(idx) => format!("OP_CLASS            {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::Inherit => "OP_INHERIT".to_string(),
        Instruction::Method(idx) => format!("OP_METHOD           {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::Initializer(idx) => format!("OP_INITIALIZER      {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::GetSuper(idx) => format!("OP_GET_SUPER        {idx:4} '{}'", fmt_const(chunk, *idx)),
        Instruction::SuperInvoke(idx, argc) => {
            format!("OP_SUPER_INVOKE     ({argc} args) {idx:4} '{}'", fmt_const(chunk, *idx))
        }
    }
}

fn fmt_const(chunk: &Chunk, idx: usize) -> String {
    match chunk.constants.get(idx) {
        Some(Value::Function(f)) => format!("<fn {}>", f.display_name()),
        Some(v) => v.to_string(),
        None => "?".to_string(),
    }
}

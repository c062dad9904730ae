// File: src/compiler.rs
//
// Single-pass compiler: a Pratt expression parser and recursive-descent
// statement grammar that emit bytecode directly into a `Chunk` as they go.
// There is no intermediate AST; by the time a rule returns, its bytecode has
// already been written.

use crate::chunk::*;
use crate::errors::{LumenError, SourceLocation};
use crate::intern::InternPool;
use crate::lexer::{Scanner, Token, TokenType};
use crate::limits::{MAX_ARGS, MAX_LOCALS, MAX_UPVALUES, ONCE_BITS};
use crate::value::{Function, UpvalueDescriptor, Value};
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

fn next_precedence(p: Precedence) -> Precedence {
    use Precedence::*;
    match p {
        None => Assignment,
        Assignment => Ternary,
        Ternary => Or,
        Or => And,
        And => Equality,
        Equality => Comparison,
        Comparison => Term,
        Term => Factor,
        Factor => Unary,
        Unary => Call,
        Call => Primary,
        Primary => Primary,
    }
}

fn infix_precedence(kind: TokenType) -> Precedence {
    use TokenType::*;
    match kind {
        Question => Precedence::Ternary,
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash | Ampersand | Pipe => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

struct Local {
    name: String,
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

struct LoopCtx {
    depth: i32,
    continue_target: usize,
    break_jumps: Vec<usize>,
}

struct ClassCtx {
    name: String,
    has_superclass: bool,
}

struct FunctionState {
    name: Option<String>,
    arity: u8,
    upvalues: Vec<UpvalueDescriptor>,
    chunk: Chunk,
    function_type: FunctionType,
    is_initializer: bool,
    locals: Vec<Local>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    once_slot: Option<u8>,
    once_next_bit: u32,
}

pub struct Compiler<'src, 'pool> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<LumenError>,
    pool: &'pool mut InternPool,
    func_stack: Vec<FunctionState>,
    class_stack: Vec<ClassCtx>,
    const_globals: HashSet<String>,
}

/// Compile `source` into a top-level script function. On failure, returns
/// every diagnostic collected across panic-mode recovery, not just the
/// first.
pub fn compile(source: &str, pool: &mut InternPool) -> Result<Rc<Function>, Vec<LumenError>> {
    let mut c = Compiler::new(source, pool);
    c.advance();
    while !c.check(TokenType::Eof) {
        c.declaration();
    }
    let (function, _upvalues) = c.end_current_function();
    if c.had_error {
        Err(c.errors)
    } else {
        Ok(function)
    }
}

impl<'src, 'pool> Compiler<'src, 'pool> {
    fn new(source: &'src str, pool: &'pool mut InternPool) -> Self {
        let dummy = Token { kind: TokenType::Eof, lexeme: "", line: 0 };
        let mut c = Self {
            scanner: Scanner::new(source),
            previous: dummy.clone(),
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            pool,
            func_stack: Vec::new(),
            class_stack: Vec::new(),
            const_globals: HashSet::new(),
        };
        c.push_function_state(FunctionType::Script, None);
        c.setup_once_tracker();
        c
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenType::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenType) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenType, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        let lexeme = self.current.lexeme.to_string();
        self.error_at(line, &lexeme, message);
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        let lexeme = self.previous.lexeme.to_string();
        self.error_at(line, &lexeme, message);
    }

    fn error_at(&mut self, line: u32, lexeme: &str, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(LumenError::compile_at(message.to_string(), SourceLocation::new(line), lexeme));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenType::Eof) {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }
            use TokenType::*;
            match self.current.kind {
                Class | Fun | Var | Const | For | If | While | Print | Return | Switch => return,
                _ => self.advance(),
            }
        }
    }

    // ---- function / scope bookkeeping --------------------------------

    fn cur_fn_idx(&self) -> usize {
        self.func_stack.len() - 1
    }

    fn scope_depth(&self) -> i32 {
        self.func_stack.last().unwrap().scope_depth
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.func_stack.last_mut().unwrap().chunk
    }

    fn mangle(&self, name: &str) -> String {
        if let Some(rest) = name.strip_prefix("__") {
            if let Some(cls) = self.class_stack.last() {
                return format!("__{}_{}", cls.name, rest);
            }
        }
        name.to_string()
    }

    fn push_function_state(&mut self, ftype: FunctionType, name: Option<String>) {
        self.func_stack.push(FunctionState {
            name,
            arity: 0,
            upvalues: Vec::new(),
            chunk: Chunk::new(),
            function_type: ftype,
            is_initializer: ftype == FunctionType::Initializer,
            locals: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            once_slot: None,
            once_next_bit: 0,
        });
        if ftype != FunctionType::Script {
            self.begin_scope();
        }
        let slot0_name = if matches!(ftype, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        self.add_local_raw(slot0_name, true, true);
    }

    /// Allocate and initialize the hidden `<once>` tracker local. Must run
    /// after parameters are declared (slot 0 is the receiver/reserved slot,
    /// slots `1..=arity` are parameters) so the tracker lands at slot
    /// `arity + 1` both at compile time and at runtime — the caller has
    /// already placed the arguments in slots `1..=arity` before the body's
    /// bytecode runs, so this `CONSTANT 0.0` push must be the first body
    /// instruction emitted *after* parameter bookkeeping, not before it.
    fn setup_once_tracker(&mut self) {
        let line = self.line();
        self.chunk_mut().emit_constant(Value::Number(0.0), line);
        self.add_local_raw("<once>", true, true);
        let idx = (self.func_stack.last().unwrap().locals.len() - 1) as u8;
        self.func_stack.last_mut().unwrap().once_slot = Some(idx);
    }

    fn end_current_function(&mut self) -> (Rc<Function>, Vec<UpvalueDescriptor>) {
        let is_init = self.func_stack.last().unwrap().is_initializer;
        let line = self.line();
        if is_init {
            self.chunk_mut().emit_op(OP_GET_LOCAL, line);
            self.chunk_mut().emit_byte(0, line);
        } else {
            self.chunk_mut().emit_op(OP_NIL, line);
        }
        self.chunk_mut().emit_op(OP_RETURN, line);

        let fs = self.func_stack.pop().unwrap();
        if fs.chunk.constant_overflow {
            self.error("Too many constants in one chunk.");
        }
        let name = fs.name.map(|n| self.pool.intern(&n));
        let upvalues = fs.upvalues.clone();
        let function = Rc::new(Function {
            name,
            arity: fs.arity,
            upvalues: fs.upvalues,
            chunk: fs.chunk,
            is_initializer: fs.is_initializer,
        });
        (function, upvalues)
    }

    fn emit_function_value(&mut self, function: Rc<Function>, upvalues: Vec<UpvalueDescriptor>, line: u32) {
        if upvalues.is_empty() {
            self.chunk_mut().emit_constant(Value::Function(function), line);
        } else {
            let idx = self.chunk_mut().add_constant(Value::Function(function));
            self.emit_closure(idx, &upvalues, line);
        }
    }

    fn emit_closure(&mut self, func_idx: usize, upvalues: &[UpvalueDescriptor], line: u32) {
        let chunk = self.chunk_mut();
        if func_idx <= u8::MAX as usize {
            chunk.emit_op(OP_CLOSURE, line);
            chunk.emit_byte(func_idx as u8, line);
        } else {
            chunk.emit_op(OP_CLOSURE_LONG, line);
            chunk.emit_byte(((func_idx >> 16) & 0xff) as u8, line);
            chunk.emit_byte(((func_idx >> 8) & 0xff) as u8, line);
            chunk.emit_byte((func_idx & 0xff) as u8, line);
        }
        for uv in upvalues {
            chunk.emit_byte(uv.is_local as u8, line);
            chunk.emit_byte(uv.index, line);
        }
    }

    fn emit_invoke(&mut self, short_op: u8, long_op: u8, name_idx: usize, argc: u8, line: u32) {
        let chunk = self.chunk_mut();
        if name_idx <= u8::MAX as usize {
            chunk.emit_op(short_op, line);
            chunk.emit_byte(name_idx as u8, line);
            chunk.emit_byte(argc, line);
        } else {
            chunk.emit_op(long_op, line);
            chunk.emit_byte(((name_idx >> 16) & 0xff) as u8, line);
            chunk.emit_byte(((name_idx >> 8) & 0xff) as u8, line);
            chunk.emit_byte((name_idx & 0xff) as u8, line);
            chunk.emit_byte(argc, line);
        }
    }

    fn try_patch_jump(&mut self, offset: usize) {
        let line = self.line();
        if let Err(msg) = self.chunk_mut().patch_jump(offset) {
            self.error_at(line, "", &msg);
        }
    }

    fn try_emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        if let Err(msg) = self.chunk_mut().emit_loop(loop_start, line) {
            self.error_at(line, "", &msg);
        }
    }

    fn begin_scope(&mut self) {
        self.func_stack.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.line();
        let func_idx = self.cur_fn_idx();
        self.func_stack[func_idx].scope_depth -= 1;
        let depth = self.func_stack[func_idx].scope_depth;
        loop {
            let should_pop = matches!(self.func_stack[func_idx].locals.last(), Some(l) if l.depth > depth);
            if !should_pop {
                break;
            }
            let local = self.func_stack[func_idx].locals.pop().unwrap();
            if local.is_captured {
                self.chunk_mut().emit_op(OP_CLOSE_UPVALUE, line);
            } else {
                self.chunk_mut().emit_op(OP_POP, line);
            }
        }
    }

    fn emit_discard_above(&mut self, target_depth: i32) {
        let line = self.line();
        let func_idx = self.cur_fn_idx();
        let mut i = self.func_stack[func_idx].locals.len();
        while i > 0 {
            let local = &self.func_stack[func_idx].locals[i - 1];
            if local.depth <= target_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.chunk_mut().emit_op(OP_CLOSE_UPVALUE, line);
            } else {
                self.chunk_mut().emit_op(OP_POP, line);
            }
            i -= 1;
        }
    }

    // ---- locals / globals / upvalues ---------------------------------

    fn add_local_raw(&mut self, name: &str, is_const: bool, initialized: bool) {
        let depth = if initialized { self.scope_depth() } else { -1 };
        let func_idx = self.cur_fn_idx();
        self.func_stack[func_idx].locals.push(Local { name: name.to_string(), depth, is_const, is_captured: false });
    }

    fn add_local(&mut self, name: &str, is_const: bool) {
        let func_idx = self.cur_fn_idx();
        if self.func_stack[func_idx].locals.len() >= MAX_LOCALS {
            self.error("Too many locals (>1024).");
            return;
        }
        self.add_local_raw(name, is_const, false);
    }

    fn declare_variable(&mut self, name: &str, is_const: bool) {
        if self.scope_depth() == 0 {
            return;
        }
        let func_idx = self.cur_fn_idx();
        let depth = self.scope_depth();
        let mut duplicate = false;
        for local in self.func_stack[func_idx].locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name, is_const);
    }

    fn mark_initialized(&mut self) {
        if self.scope_depth() == 0 {
            return;
        }
        let depth = self.scope_depth();
        let func_idx = self.cur_fn_idx();
        if let Some(local) = self.func_stack[func_idx].locals.last_mut() {
            local.depth = depth;
        }
    }

    fn make_constant_for_name(&mut self, name: &str) -> usize {
        let handle = self.pool.intern(name);
        self.chunk_mut().add_constant(Value::Str(handle))
    }

    fn define_variable(&mut self, global_idx: Option<usize>) {
        if self.scope_depth() > 0 {
            self.mark_initialized();
            return;
        }
        let line = self.line();
        let idx = global_idx.expect("global index required at depth 0");
        self.chunk_mut().emit_constant_op(OP_DEFINE_GLOBAL, OP_DEFINE_GLOBAL_LONG, idx, line);
    }

    fn resolve_local(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        let len = self.func_stack[func_idx].locals.len();
        for i in (0..len).rev() {
            let uninitialized;
            let matches_name;
            {
                let local = &self.func_stack[func_idx].locals[i];
                matches_name = local.name == name;
                uninitialized = local.depth == -1;
            }
            if matches_name {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some(slot) = self.resolve_local(enclosing, name) {
            self.func_stack[enclosing].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, slot, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, up, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        {
            let upvalues = &self.func_stack[func_idx].upvalues;
            for (i, uv) in upvalues.iter().enumerate() {
                if uv.index == index && uv.is_local == is_local {
                    return i as u8;
                }
            }
        }
        if self.func_stack[func_idx].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.func_stack[func_idx].upvalues.push(UpvalueDescriptor { is_local, index });
        (self.func_stack[func_idx].upvalues.len() - 1) as u8
    }

    fn named_variable_get(&mut self, name: &str, line: u32) {
        let func_idx = self.cur_fn_idx();
        if let Some(slot) = self.resolve_local(func_idx, name) {
            self.chunk_mut().emit_op(OP_GET_LOCAL, line);
            self.chunk_mut().emit_byte(slot, line);
        } else if let Some(up) = self.resolve_upvalue(func_idx, name) {
            self.chunk_mut().emit_op(OP_GET_UPVALUE, line);
            self.chunk_mut().emit_byte(up, line);
        } else {
            let idx = self.make_constant_for_name(name);
            self.chunk_mut().emit_constant_op(OP_GET_GLOBAL, OP_GET_GLOBAL_LONG, idx, line);
        }
    }

    fn named_variable_set(&mut self, name: &str, line: u32) {
        let func_idx = self.cur_fn_idx();
        if let Some(slot) = self.resolve_local(func_idx, name) {
            if self.func_stack[func_idx].locals[slot as usize].is_const {
                self.error("Cannot assign to a const variable.");
            }
            self.chunk_mut().emit_op(OP_SET_LOCAL, line);
            self.chunk_mut().emit_byte(slot, line);
        } else if let Some(up) = self.resolve_upvalue(func_idx, name) {
            self.chunk_mut().emit_op(OP_SET_UPVALUE, line);
            self.chunk_mut().emit_byte(up, line);
        } else {
            if self.const_globals.contains(name) {
                self.error("Cannot assign to a const variable.");
            }
            let idx = self.make_constant_for_name(name);
            self.chunk_mut().emit_constant_op(OP_SET_GLOBAL, OP_SET_GLOBAL_LONG, idx, line);
        }
    }

    // ---- declarations --------------------------------------------------

    fn declaration(&mut self) {
        if self.match_tok(TokenType::Class) {
            self.class_declaration();
        } else if self.match_tok(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_tok(TokenType::Var) {
            self.var_declaration(false);
        } else if self.match_tok(TokenType::Const) {
            self.var_declaration(true);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        self.consume(TokenType::Identifier, "Expect variable name.");
        let raw = self.previous.lexeme.to_string();
        let name = self.mangle(&raw);
        let line = self.line();

        self.declare_variable(&name, is_const);
        let global_idx = if self.scope_depth() == 0 { Some(self.make_constant_for_name(&name)) } else { None };

        if is_const {
            self.consume(TokenType::Equal, "Expect '=' after const name.");
            self.expression();
        } else if self.match_tok(TokenType::Equal) {
            self.expression();
        } else {
            self.chunk_mut().emit_op(OP_NIL, line);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        if is_const && self.scope_depth() == 0 {
            self.const_globals.insert(name);
        }
        self.define_variable(global_idx);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect function name.");
        let raw = self.previous.lexeme.to_string();
        let name = self.mangle(&raw);

        self.declare_variable(&name, true);
        let global_idx = if self.scope_depth() == 0 { Some(self.make_constant_for_name(&name)) } else { None };
        if self.scope_depth() > 0 {
            self.mark_initialized();
        }

        self.compile_function(FunctionType::Function, &name);
        self.define_variable(global_idx);
    }

    fn compile_function(&mut self, ftype: FunctionType, name: &str) {
        self.push_function_state(ftype, Some(name.to_string()));
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                {
                    let func_idx = self.cur_fn_idx();
                    self.func_stack[func_idx].arity += 1;
                    if self.func_stack[func_idx].arity as usize > MAX_ARGS {
                        self.error_at_current("Too many parameters.");
                    }
                }
                self.consume(TokenType::Identifier, "Expect parameter name.");
                let raw = self.previous.lexeme.to_string();
                let pname = self.mangle(&raw);
                self.declare_variable(&pname, false);
                self.define_variable(None);
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.setup_once_tracker();
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let line = self.line();
        let (function, upvalues) = self.end_current_function();
        self.emit_function_value(function, upvalues, line);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let line = self.line();

        let name_const = self.make_constant_for_name(&class_name);
        self.declare_variable(&class_name, true);
        let global_idx = if self.scope_depth() == 0 { Some(self.make_constant_for_name(&class_name)) } else { None };
        self.chunk_mut().emit_constant_op(OP_CLASS, OP_CLASS_LONG, name_const, line);
        self.define_variable(global_idx);

        self.class_stack.push(ClassCtx { name: class_name.clone(), has_superclass: false });

        if self.match_tok(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            let line = self.line();
            self.named_variable_get(&super_name, line);
            self.begin_scope();
            self.add_local("super", true);
            self.mark_initialized();
            self.named_variable_get(&class_name, line);
            self.chunk_mut().emit_op(OP_INHERIT, line);
            self.class_stack.last_mut().unwrap().has_superclass = true;
        }

        let line = self.line();
        self.named_variable_get(&class_name, line);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);

        let ctx = self.class_stack.pop().unwrap();
        if ctx.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme.to_string();
        let name_const = self.make_constant_for_name(&method_name);
        let ftype = if method_name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.compile_function(ftype, &method_name);
        let line = self.line();
        if ftype == FunctionType::Initializer {
            self.chunk_mut().emit_constant_op(OP_INITIALIZER, OP_INITIALIZER_LONG, name_const, line);
        } else {
            self.chunk_mut().emit_constant_op(OP_METHOD, OP_METHOD_LONG, name_const, line);
        }
    }

    // ---- statements ------------------------------------------------

    fn statement(&mut self) {
        if self.match_tok(TokenType::Print) {
            self.print_statement();
        } else if self.match_tok(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_tok(TokenType::If) {
            self.if_statement();
        } else if self.match_tok(TokenType::While) {
            self.while_statement();
        } else if self.match_tok(TokenType::For) {
            self.for_statement();
        } else if self.match_tok(TokenType::Switch) {
            self.switch_statement();
        } else if self.match_tok(TokenType::Break) {
            self.break_statement();
        } else if self.match_tok(TokenType::Continue) {
            self.continue_statement();
        } else if self.match_tok(TokenType::Return) {
            self.return_statement();
        } else if self.match_tok(TokenType::Once) {
            self.once_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        let line = self.line();
        self.chunk_mut().emit_op(OP_PRINT, line);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let line = self.line();
        let then_jump = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        self.chunk_mut().emit_op(OP_POP, line);
        self.statement();

        let line = self.line();
        let else_jump = self.chunk_mut().emit_op(OP_JUMP, line);
        self.chunk_mut().emit_u16(0, line);

        self.try_patch_jump(then_jump);
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);

        if self.match_tok(TokenType::Else) {
            self.statement();
        }
        self.try_patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().len();
        self.func_stack.last_mut().unwrap().loops.push(LoopCtx {
            depth: self.scope_depth(),
            continue_target: loop_start,
            break_jumps: Vec::new(),
        });

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let line = self.line();
        let exit_jump = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        self.chunk_mut().emit_op(OP_POP, line);

        self.statement();
        self.try_emit_loop(loop_start);

        self.try_patch_jump(exit_jump);
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);

        let loop_ctx = self.func_stack.last_mut().unwrap().loops.pop().unwrap();
        for j in loop_ctx.break_jumps {
            self.try_patch_jump(j);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.match_tok(TokenType::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenType::Var) {
            self.var_declaration(false);
        } else if self.match_tok(TokenType::Const) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().len();
        self.func_stack.last_mut().unwrap().loops.push(LoopCtx {
            depth: self.scope_depth(),
            continue_target: loop_start,
            break_jumps: Vec::new(),
        });

        let mut exit_jump: Option<usize> = None;
        if !self.match_tok(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            let line = self.line();
            let j = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
            self.chunk_mut().emit_u16(0, line);
            self.chunk_mut().emit_op(OP_POP, line);
            exit_jump = Some(j);
        }

        if !self.check(TokenType::RightParen) {
            let line = self.line();
            let body_jump = self.chunk_mut().emit_op(OP_JUMP, line);
            self.chunk_mut().emit_u16(0, line);

            let increment_start = self.chunk_mut().len();
            self.expression();
            let line = self.line();
            self.chunk_mut().emit_op(OP_POP, line);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.try_emit_loop(loop_start);
            loop_start = increment_start;
            self.try_patch_jump(body_jump);

            self.func_stack.last_mut().unwrap().loops.last_mut().unwrap().continue_target = increment_start;
        } else {
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
        }

        self.statement();
        self.try_emit_loop(loop_start);

        if let Some(j) = exit_jump {
            self.try_patch_jump(j);
            let line = self.line();
            self.chunk_mut().emit_op(OP_POP, line);
        }

        let loop_ctx = self.func_stack.last_mut().unwrap().loops.pop().unwrap();
        for j in loop_ctx.break_jumps {
            self.try_patch_jump(j);
        }
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after switch value.");

        self.begin_scope();
        self.add_local("<switch>", true);
        self.mark_initialized();
        let slot = (self.func_stack.last().unwrap().locals.len() - 1) as u8;

        self.consume(TokenType::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut pending_case_jump: Option<usize> = None;

        while self.match_tok(TokenType::Case) {
            if let Some(j) = pending_case_jump.take() {
                self.try_patch_jump(j);
                let line = self.line();
                self.chunk_mut().emit_op(OP_POP, line);
            }
            self.expression();
            self.consume(TokenType::Colon, "Expect ':' after case value.");

            let line = self.line();
            self.chunk_mut().emit_op(OP_GET_LOCAL, line);
            self.chunk_mut().emit_byte(slot, line);
            self.chunk_mut().emit_op(OP_EQUAL, line);
            let jf = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
            self.chunk_mut().emit_u16(0, line);
            self.chunk_mut().emit_op(OP_POP, line);
            pending_case_jump = Some(jf);

            while !self.check(TokenType::Case) && !self.check(TokenType::Default) && !self.check(TokenType::RightBrace) {
                self.statement();
            }
            let line = self.line();
            let end_j = self.chunk_mut().emit_op(OP_JUMP, line);
            self.chunk_mut().emit_u16(0, line);
            end_jumps.push(end_j);
        }

        if let Some(j) = pending_case_jump.take() {
            self.try_patch_jump(j);
            let line = self.line();
            self.chunk_mut().emit_op(OP_POP, line);
        }

        if self.match_tok(TokenType::Default) {
            self.consume(TokenType::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenType::RightBrace) {
                self.statement();
            }
        }

        self.consume(TokenType::RightBrace, "Expect '}' after switch body.");
        for j in end_jumps {
            self.try_patch_jump(j);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        let func_idx = self.cur_fn_idx();
        if self.func_stack[func_idx].loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
            return;
        }
        let depth = self.func_stack[func_idx].loops.last().unwrap().depth;
        self.emit_discard_above(depth);
        let line = self.line();
        let j = self.chunk_mut().emit_op(OP_JUMP, line);
        self.chunk_mut().emit_u16(0, line);
        self.func_stack[func_idx].loops.last_mut().unwrap().break_jumps.push(j);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        let func_idx = self.cur_fn_idx();
        if self.func_stack[func_idx].loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
            return;
        }
        let (depth, target) = {
            let l = self.func_stack[func_idx].loops.last().unwrap();
            (l.depth, l.continue_target)
        };
        self.emit_discard_above(depth);
        self.try_emit_loop(target);
    }

    fn return_statement(&mut self) {
        let func_idx = self.cur_fn_idx();
        if self.func_stack[func_idx].function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenType::Semicolon) {
            let line = self.line();
            if self.func_stack[func_idx].is_initializer {
                self.chunk_mut().emit_op(OP_GET_LOCAL, line);
                self.chunk_mut().emit_byte(0, line);
            } else {
                self.chunk_mut().emit_op(OP_NIL, line);
            }
            self.chunk_mut().emit_op(OP_RETURN, line);
            return;
        }
        if self.func_stack[func_idx].is_initializer {
            self.error("Can't return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after return value.");
        let line = self.line();
        self.chunk_mut().emit_op(OP_RETURN, line);
    }

    fn once_statement(&mut self) {
        let func_idx = self.cur_fn_idx();
        let bit = self.func_stack[func_idx].once_next_bit;
        if bit >= ONCE_BITS {
            self.error("Too many 'once' statements in function.");
            return;
        }
        self.func_stack[func_idx].once_next_bit += 1;
        let slot = self.func_stack[func_idx].once_slot.unwrap();
        let mask = (1u64 << bit) as f64;

        let line = self.line();
        self.chunk_mut().emit_op(OP_GET_LOCAL, line);
        self.chunk_mut().emit_byte(slot, line);
        self.chunk_mut().emit_constant(Value::Number(mask), line);
        self.chunk_mut().emit_op(OP_BITWISE_AND, line);
        self.chunk_mut().emit_constant(Value::Number(0.0), line);
        self.chunk_mut().emit_op(OP_EQUAL, line);
        let skip = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        self.chunk_mut().emit_op(OP_POP, line);

        self.chunk_mut().emit_op(OP_GET_LOCAL, line);
        self.chunk_mut().emit_byte(slot, line);
        self.chunk_mut().emit_constant(Value::Number(mask), line);
        self.chunk_mut().emit_op(OP_BITWISE_OR, line);
        self.chunk_mut().emit_op(OP_SET_LOCAL, line);
        self.chunk_mut().emit_byte(slot, line);
        self.chunk_mut().emit_op(OP_POP, line);

        self.statement();

        let end = self.chunk_mut().emit_op(OP_JUMP, line);
        self.chunk_mut().emit_u16(0, line);
        self.try_patch_jump(skip);
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);
        self.try_patch_jump(end);
    }

    // ---- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, min: Precedence) {
        self.advance();
        let can_assign = min <= Precedence::Assignment;
        if !self.prefix(can_assign) {
            self.error("Expect expression.");
            return;
        }
        while infix_precedence(self.current.kind) >= min {
            self.advance();
            self.infix(can_assign);
        }
        if can_assign && self.match_tok(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, can_assign: bool) -> bool {
        use TokenType::*;
        match self.previous.kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string_lit(),
            True | False | Nil => self.literal(),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, can_assign: bool) {
        use TokenType::*;
        match self.previous.kind {
            Plus | Minus | Star | Slash | Ampersand | Pipe | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and_(),
            Or => self.or_(),
            Question => self.ternary(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        let line = self.line();
        self.chunk_mut().emit_constant(Value::Number(value), line);
    }

    fn string_lit(&mut self) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let handle = self.pool.intern(content);
        let line = self.line();
        self.chunk_mut().emit_constant(Value::Str(handle), line);
    }

    fn literal(&mut self) {
        let line = self.line();
        match self.previous.kind {
            TokenType::True => self.chunk_mut().emit_op(OP_TRUE, line),
            TokenType::False => self.chunk_mut().emit_op(OP_FALSE, line),
            TokenType::Nil => self.chunk_mut().emit_op(OP_NIL, line),
            _ => unreachable!(),
        };
    }

    fn unary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        let line = self.line();
        match op {
            TokenType::Minus => self.chunk_mut().emit_op(OP_NEGATE, line),
            TokenType::Bang => self.chunk_mut().emit_op(OP_NOT, line),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self) {
        let op = self.previous.kind;
        let prec = infix_precedence(op);
        self.parse_precedence(next_precedence(prec));
        let line = self.line();
        match op {
            TokenType::Plus => {
                self.chunk_mut().emit_op(OP_ADD, line);
            }
            TokenType::Minus => {
                self.chunk_mut().emit_op(OP_SUBTRACT, line);
            }
            TokenType::Star => {
                self.chunk_mut().emit_op(OP_MULTIPLY, line);
            }
            TokenType::Slash => {
                self.chunk_mut().emit_op(OP_DIVIDE, line);
            }
            TokenType::Ampersand => {
                self.chunk_mut().emit_op(OP_BITWISE_AND, line);
            }
            TokenType::Pipe => {
                self.chunk_mut().emit_op(OP_BITWISE_OR, line);
            }
            TokenType::EqualEqual => {
                self.chunk_mut().emit_op(OP_EQUAL, line);
            }
            TokenType::BangEqual => {
                self.chunk_mut().emit_op(OP_EQUAL, line);
                self.chunk_mut().emit_op(OP_NOT, line);
            }
            TokenType::Greater => {
                self.chunk_mut().emit_op(OP_GREATER, line);
            }
            TokenType::GreaterEqual => {
                self.chunk_mut().emit_op(OP_LESS, line);
                self.chunk_mut().emit_op(OP_NOT, line);
            }
            TokenType::Less => {
                self.chunk_mut().emit_op(OP_LESS, line);
            }
            TokenType::LessEqual => {
                self.chunk_mut().emit_op(OP_GREATER, line);
                self.chunk_mut().emit_op(OP_NOT, line);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let line = self.line();
        let end_jump = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        self.chunk_mut().emit_op(OP_POP, line);
        self.parse_precedence(Precedence::And);
        self.try_patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let line = self.line();
        let else_jump = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        let end_jump = self.chunk_mut().emit_op(OP_JUMP, line);
        self.chunk_mut().emit_u16(0, line);
        self.try_patch_jump(else_jump);
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);
        self.parse_precedence(Precedence::Or);
        self.try_patch_jump(end_jump);
    }

    fn ternary(&mut self) {
        let line = self.line();
        let then_jump = self.chunk_mut().emit_op(OP_JUMP_IF_FALSE, line);
        self.chunk_mut().emit_u16(0, line);
        self.chunk_mut().emit_op(OP_POP, line);

        self.parse_precedence(Precedence::Assignment);
        let line = self.line();
        let else_jump = self.chunk_mut().emit_op(OP_JUMP, line);
        self.chunk_mut().emit_u16(0, line);

        self.try_patch_jump(then_jump);
        let line = self.line();
        self.chunk_mut().emit_op(OP_POP, line);

        self.consume(TokenType::Colon, "Expect ':' in ternary expression.");
        self.parse_precedence(Precedence::Ternary);
        self.try_patch_jump(else_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        let line = self.line();
        self.chunk_mut().emit_op(OP_CALL, line);
        self.chunk_mut().emit_byte(argc, line);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argc as usize == MAX_ARGS {
                    self.error("Too many arguments.");
                }
                argc += 1;
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.make_constant_for_name(&name);

        if can_assign && self.match_tok(TokenType::Equal) {
            self.expression();
            let line = self.line();
            self.chunk_mut().emit_constant_op(OP_SET_PROPERTY, OP_SET_PROPERTY_LONG, name_const, line);
        } else if self.match_tok(TokenType::LeftParen) {
            let argc = self.argument_list();
            let line = self.line();
            self.emit_invoke(OP_INVOKE, OP_INVOKE_LONG, name_const, argc, line);
        } else {
            let line = self.line();
            self.chunk_mut().emit_constant_op(OP_GET_PROPERTY, OP_GET_PROPERTY_LONG, name_const, line);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let raw = self.previous.lexeme.to_string();
        let name = self.mangle(&raw);
        let line = self.line();
        if can_assign && self.match_tok(TokenType::Equal) {
            self.expression();
            self.named_variable_set(&name, line);
        } else {
            self.named_variable_get(&name, line);
        }
    }

    fn this_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
        }
        let line = self.line();
        self.named_variable_get("this", line);
    }

    fn super_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_stack.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.make_constant_for_name(&name);

        let line = self.line();
        self.named_variable_get("this", line);
        if self.match_tok(TokenType::LeftParen) {
            let argc = self.argument_list();
            let line = self.line();
            self.named_variable_get("super", line);
            self.emit_invoke(OP_SUPER_INVOKE, OP_SUPER_INVOKE_LONG, name_const, argc, line);
        } else {
            let line = self.line();
            self.named_variable_get("super", line);
            self.chunk_mut().emit_constant_op(OP_GET_SUPER, OP_GET_SUPER_LONG, name_const, line);
        }
    }
}

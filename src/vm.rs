// File: src/vm.rs
//
// The stack-based virtual machine: fetch/decode/execute loop over a
// compiled chunk, call frame management, upvalue capture/closing, and the
// class/instance/bound-method runtime semantics.

use crate::chunk::{decode, Chunk, Instruction};
use crate::disassembler;
use crate::errors::{LumenError, SourceLocation, TraceFrame};
use crate::intern::{InternPool, StringHandle};
use crate::limits::MAX_CALL_DEPTH;
use crate::value::{BoundMethod, Class, Closure, Function, Instance, NativeFunction, Upvalue, Value};
use ahash::AHashMap;
use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

enum Callable {
    Function(Rc<Function>),
    Closure(Rc<Closure>),
}

impl Callable {
    fn chunk(&self) -> &Chunk {
        match self {
            Callable::Function(f) => &f.chunk,
            Callable::Closure(c) => &c.function.chunk,
        }
    }

    fn arity(&self) -> u8 {
        match self {
            Callable::Function(f) => f.arity,
            Callable::Closure(c) => c.function.arity,
        }
    }

    fn display_name(&self) -> &str {
        match self {
            Callable::Function(f) => f.display_name(),
            Callable::Closure(c) => c.function.display_name(),
        }
    }
}

struct CallFrame {
    callable: Callable,
    ip: usize,
    base: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    globals: AHashMap<StringHandle, Value>,
    pool: InternPool,
    current_line: u32,
    pub trace: bool,
    output: Option<Rc<RefCell<Vec<u8>>>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: AHashMap::new(),
            pool: InternPool::new(),
            current_line: 0,
            trace: false,
            output: None,
        };
        crate::native::install_defaults(&mut vm);
        vm
    }

    /// Redirect `print` output to a shared buffer instead of stdout — used
    /// by tests that need to assert on what a program printed.
    pub fn set_output(&mut self, sink: Rc<RefCell<Vec<u8>>>) {
        self.output = Some(sink);
    }

    fn write_output(&self, message: &str) {
        match &self.output {
            Some(sink) => {
                let _ = writeln!(sink.borrow_mut(), "{message}");
            }
            None => println!("{message}"),
        }
    }

    pub fn register_native(
        &mut self,
        name: &str,
        arity: u8,
        func: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) {
        let handle = self.pool.intern(name);
        let native = Rc::new(NativeFunction::new(handle.clone(), arity, func));
        self.globals.insert(handle, Value::NativeFunction(native));
    }

    /// Compile and run `source` against this VM's existing global state (so
    /// a REPL can persist variables and functions across lines).
    pub fn interpret(&mut self, source: &str) -> Result<(), Vec<LumenError>> {
        let function = crate::compiler::compile(source, &mut self.pool).map_err(|errs| errs)?;
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.push(Value::Function(function.clone()));
        self.frames.push(CallFrame { callable: Callable::Function(function), ip: 0, base: 0 });
        self.run().map_err(|e| vec![e])
    }

    // ---- stack helpers -------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn read_constant(&self, idx: usize) -> Value {
        self.frames.last().unwrap().callable.chunk().constants[idx].clone()
    }

    fn read_string_constant(&self, idx: usize) -> StringHandle {
        match self.read_constant(idx) {
            Value::Str(s) => s,
            other => panic!("corrupt bytecode: expected string constant, got {other:?}"),
        }
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        let n = self.frames.len();
        self.frames
            .iter()
            .enumerate()
            .rev()
            .map(|(i, frame)| {
                let line = if i + 1 == n {
                    self.current_line
                } else {
                    frame.callable.chunk().line_for_offset(frame.ip.saturating_sub(1))
                };
                TraceFrame { function_name: frame.callable.display_name().to_string(), line }
            })
            .collect()
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> LumenError {
        LumenError::runtime(message.into(), SourceLocation::new(self.current_line)).with_trace(self.build_trace())
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, stack_idx: usize) -> Rc<RefCell<Upvalue>> {
        for uv in &self.open_upvalues {
            if let Upvalue::Open(idx) = *uv.borrow() {
                if idx == stack_idx {
                    return uv.clone();
                }
            }
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(stack_idx)));
        let pos = self
            .open_upvalues
            .iter()
            .position(|u| matches!(*u.borrow(), Upvalue::Open(i) if i < stack_idx))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, cell.clone());
        cell
    }

    fn close_upvalues(&mut self, from_idx: usize) {
        while let Some(first) = self.open_upvalues.first() {
            let idx = match *first.borrow() {
                Upvalue::Open(i) => i,
                Upvalue::Closed(_) => break,
            };
            if idx < from_idx {
                break;
            }
            let cell = self.open_upvalues.remove(0);
            let value = self.stack[idx].clone();
            *cell.borrow_mut() = Upvalue::Closed(value);
        }
    }

    fn current_closure_upvalue(&self, slot: u8) -> Rc<RefCell<Upvalue>> {
        match &self.frames.last().unwrap().callable {
            Callable::Closure(c) => c.upvalues[slot as usize].clone(),
            Callable::Function(_) => panic!("corrupt bytecode: upvalue access in a non-closure frame"),
        }
    }

    fn read_upvalue(&self, cell: &Rc<RefCell<Upvalue>>) -> Value {
        match &*cell.borrow() {
            Upvalue::Open(idx) => self.stack[*idx].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, cell: &Rc<RefCell<Upvalue>>, value: Value) {
        let open_idx = match &*cell.borrow() {
            Upvalue::Open(idx) => Some(*idx),
            Upvalue::Closed(_) => None,
        };
        match open_idx {
            Some(idx) => self.stack[idx] = value,
            None => *cell.borrow_mut() = Upvalue::Closed(value),
        }
    }

    fn make_closure(&mut self, func_idx: usize, upvalues: &[(bool, u8)]) -> Result<(), LumenError> {
        let function = match self.read_constant(func_idx) {
            Value::Function(f) => f,
            other => return Err(self.runtime_error(format!("corrupt bytecode: expected function, got {}", other.type_name()))),
        };
        let base = self.frames.last().unwrap().base;
        let mut cells = Vec::with_capacity(upvalues.len());
        for &(is_local, index) in upvalues {
            if is_local {
                cells.push(self.capture_upvalue(base + index as usize));
            } else {
                let cell = match &self.frames.last().unwrap().callable {
                    Callable::Closure(c) => c.upvalues[index as usize].clone(),
                    Callable::Function(_) => {
                        return Err(self.runtime_error("corrupt bytecode: upvalue capture from a non-closure frame"))
                    }
                };
                cells.push(cell);
            }
        }
        self.push(Value::Closure(Rc::new(Closure { function, upvalues: cells })));
        Ok(())
    }

    // ---- calls ----------------------------------------------------------

    fn push_frame(&mut self, callable: Callable) -> Result<(), LumenError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - callable.arity() as usize - 1;
        self.frames.push(CallFrame { callable, ip: 0, base });
        Ok(())
    }

    fn call_function(&mut self, f: Rc<Function>, argc: u8) -> Result<(), LumenError> {
        if f.arity != argc {
            return Err(self.runtime_error(format!("Expected {} arguments but got {argc}.", f.arity)));
        }
        self.push_frame(Callable::Function(f))
    }

    fn call_closure(&mut self, c: Rc<Closure>, argc: u8) -> Result<(), LumenError> {
        if c.function.arity != argc {
            return Err(self.runtime_error(format!("Expected {} arguments but got {argc}.", c.function.arity)));
        }
        self.push_frame(Callable::Closure(c))
    }

    fn call_native(&mut self, n: Rc<NativeFunction>, argc: u8) -> Result<(), LumenError> {
        if n.arity != argc {
            return Err(self.runtime_error(format!("Expected {} arguments but got {argc}.", n.arity)));
        }
        let start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let result = (n.func)(&args).map_err(|e| self.runtime_error(e))?;
        self.stack.truncate(start - 1);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class: Rc<RefCell<Class>>, argc: u8) -> Result<(), LumenError> {
        let instance = Rc::new(RefCell::new(Instance::new(class.clone())));
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = Value::Instance(instance);
        let init = class.borrow().initializer.clone();
        match init {
            Some(m) => self.invoke_callable(m, argc),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    fn call_bound(&mut self, b: Rc<BoundMethod>, argc: u8) -> Result<(), LumenError> {
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = b.receiver.clone();
        self.invoke_callable(b.method.clone(), argc)
    }

    fn invoke_callable(&mut self, callee: Value, argc: u8) -> Result<(), LumenError> {
        match callee {
            Value::Closure(c) => self.call_closure(c, argc),
            Value::Function(f) => self.call_function(f, argc),
            Value::NativeFunction(n) => self.call_native(n, argc),
            Value::Class(c) => self.call_class(c, argc),
            Value::BoundMethod(b) => self.call_bound(b, argc),
            other => Err(self.runtime_error(format!("Can only call functions and classes, got {}.", other.type_name()))),
        }
    }

    fn call_value(&mut self, argc: u8) -> Result<(), LumenError> {
        let callee = self.peek(argc as usize).clone();
        self.invoke_callable(callee, argc)
    }

    fn invoke(&mut self, idx: usize, argc: u8) -> Result<(), LumenError> {
        let name = self.read_string_constant(idx);
        let receiver = self.peek(argc as usize).clone();
        let instance = match receiver {
            Value::Instance(i) => i,
            other => return Err(self.runtime_error(format!("Only instances have methods, got {}.", other.type_name()))),
        };
        let field = instance.borrow().fields.get(&name).cloned();
        if let Some(field) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field.clone();
            return self.invoke_callable(field, argc);
        }
        let method = instance.borrow().class.borrow().find_method(&name);
        match method {
            Some(m) => self.invoke_callable(m, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_str()))),
        }
    }

    fn super_invoke(&mut self, idx: usize, argc: u8) -> Result<(), LumenError> {
        let name = self.read_string_constant(idx);
        let superclass = match self.pop() {
            Value::Class(c) => c,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let method = superclass.borrow().find_method(&name);
        match method {
            Some(m) => self.invoke_callable(m, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_str()))),
        }
    }

    // ---- properties / classes -------------------------------------------

    fn get_property(&mut self, idx: usize) -> Result<(), LumenError> {
        let name = self.read_string_constant(idx);
        let receiver = self.peek(0).clone();
        let instance = match receiver.clone() {
            Value::Instance(i) => i,
            other => return Err(self.runtime_error(format!("Only instances have properties, got {}.", other.type_name()))),
        };
        if let Some(v) = instance.borrow().fields.get(&name).cloned() {
            self.pop();
            self.push(v);
            return Ok(());
        }
        let method = instance.borrow().class.borrow().find_method(&name);
        match method {
            Some(m) => {
                self.pop();
                self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method: m })));
                Ok(())
            }
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_str()))),
        }
    }

    fn set_property(&mut self, idx: usize) -> Result<(), LumenError> {
        let name = self.read_string_constant(idx);
        let value = self.pop();
        let receiver = self.pop();
        let instance = match receiver {
            Value::Instance(i) => i,
            other => return Err(self.runtime_error(format!("Only instances have fields, got {}.", other.type_name()))),
        };
        instance.borrow_mut().fields.insert(name, value.clone());
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self, idx: usize) -> Result<(), LumenError> {
        let name = self.read_string_constant(idx);
        let superclass = match self.pop() {
            Value::Class(c) => c,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let receiver = self.pop();
        let method = superclass.borrow().find_method(&name);
        match method {
            Some(m) => {
                self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method: m })));
                Ok(())
            }
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_str()))),
        }
    }

    fn inherit(&mut self) -> Result<(), LumenError> {
        let superclass = match self.peek(1).clone() {
            Value::Class(c) => c,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let subclass = match self.peek(0).clone() {
            Value::Class(c) => c,
            other => panic!("corrupt bytecode: OP_INHERIT subclass operand is not a class: {other:?}"),
        };
        let methods: Vec<(StringHandle, Value)> =
            superclass.borrow().methods.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (k, v) in methods {
            subclass.borrow_mut().methods.insert(k, v);
        }
        let init = superclass.borrow().initializer.clone();
        subclass.borrow_mut().initializer = init;
        subclass.borrow_mut().superclass = Some(superclass);
        self.pop();
        Ok(())
    }

    fn define_method(&mut self, idx: usize, is_initializer: bool) {
        let name = self.read_string_constant(idx);
        let method = self.pop();
        if let Value::Class(c) = self.peek(0) {
            if is_initializer {
                c.borrow_mut().initializer = Some(method.clone());
            }
            c.borrow_mut().methods.insert(name, method);
        }
    }

    // ---- arithmetic -------------------------------------------------------

    fn numeric_binop(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn bitwise_binop(&mut self, op: impl Fn(u64, u64) -> u64) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let xi = x.round() as u64;
                let yi = y.round() as u64;
                self.push(Value::Number(op(xi, yi) as f64));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
                Ok(())
            }
            (Value::Str(x), Value::Str(y)) => {
                let handle = self.pool.concat(x.as_str(), y.as_str());
                self.push(Value::Str(handle));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    // ---- dispatch loop ----------------------------------------------------

    fn run(&mut self) -> Result<(), LumenError> {
        loop {
            let frame_ip = self.frames.last().unwrap().ip;
            let (instruction, len) = {
                let frame = self.frames.last().unwrap();
                decode(frame.callable.chunk(), frame_ip)
            };
            self.current_line = self.frames.last().unwrap().callable.chunk().line_for_offset(frame_ip);

            if self.trace {
                let frame = self.frames.last().unwrap();
                let (line, _) = disassembler::disassemble_instruction(frame.callable.chunk(), frame_ip);
                let stack_str: String = self.stack.iter().map(|v| format!("[ {v} ]")).collect();
                eprintln!("{stack_str}  {line}");
            }

            self.frames.last_mut().unwrap().ip += len;

            match instruction {
                Instruction::Constant(idx) => {
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                Instruction::Nil => self.push(Value::Nil),
                Instruction::True => self.push(Value::Bool(true)),
                Instruction::False => self.push(Value::Bool(false)),
                Instruction::Pop => {
                    self.pop();
                }
                Instruction::GetLocal(slot) => {
                    let base = self.frames.last().unwrap().base;
                    let v = self.stack[base + slot as usize].clone();
                    self.push(v);
                }
                Instruction::SetLocal(slot) => {
                    let base = self.frames.last().unwrap().base;
                    let v = self.peek(0).clone();
                    self.stack[base + slot as usize] = v;
                }
                Instruction::GetGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    match self.globals.get(&name).cloned() {
                        Some(v) => self.push(v),
                        None => return Err(self.runtime_error(format!("Undefined variable '{}'.", name.as_str()))),
                    }
                }
                Instruction::SetGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", name.as_str())));
                    }
                    let v = self.peek(0).clone();
                    self.globals.insert(name, v);
                }
                Instruction::DefineGlobal(idx) => {
                    let name = self.read_string_constant(idx);
                    let v = self.pop();
                    self.globals.insert(name, v);
                }
                Instruction::GetUpvalue(slot) => {
                    let cell = self.current_closure_upvalue(slot);
                    let v = self.read_upvalue(&cell);
                    self.push(v);
                }
                Instruction::SetUpvalue(slot) => {
                    let cell = self.current_closure_upvalue(slot);
                    let v = self.peek(0).clone();
                    self.write_upvalue(&cell, v);
                }
                Instruction::GetProperty(idx) => self.get_property(idx)?,
                Instruction::SetProperty(idx) => self.set_property(idx)?,
                Instruction::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Instruction::Greater => self.numeric_compare(|a, b| a > b)?,
                Instruction::Less => self.numeric_compare(|a, b| a < b)?,
                Instruction::Add => self.add()?,
                Instruction::Subtract => self.numeric_binop(|a, b| a - b)?,
                Instruction::Multiply => self.numeric_binop(|a, b| a * b)?,
                Instruction::Divide => self.numeric_binop(|a, b| a / b)?,
                Instruction::BitwiseAnd => self.bitwise_binop(|a, b| a & b)?,
                Instruction::BitwiseOr => self.bitwise_binop(|a, b| a | b)?,
                Instruction::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                Instruction::Negate => match self.peek(0) {
                    Value::Number(_) => {
                        let n = match self.pop() {
                            Value::Number(n) => n,
                            _ => unreachable!(),
                        };
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                Instruction::Print => {
                    let v = self.pop();
                    self.write_output(&v.to_string());
                }
                Instruction::Jump(dist) => {
                    self.frames.last_mut().unwrap().ip += dist as usize;
                }
                Instruction::JumpIfFalse(dist) => {
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += dist as usize;
                    }
                }
                Instruction::Loop(dist) => {
                    self.frames.last_mut().unwrap().ip -= dist as usize;
                }
                Instruction::Call(argc) => self.call_value(argc)?,
                Instruction::Invoke(idx, argc) => self.invoke(idx, argc)?,
                Instruction::Closure(idx, upvalues) => self.make_closure(idx, &upvalues)?,
                Instruction::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Instruction::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                Instruction::Class(idx) => {
                    let name = self.read_string_constant(idx);
                    self.push(Value::Class(Rc::new(RefCell::new(Class::new(name)))));
                }
                Instruction::Inherit => self.inherit()?,
                Instruction::Method(idx) => self.define_method(idx, false),
                Instruction::Initializer(idx) => self.define_method(idx, true),
                Instruction::GetSuper(idx) => self.get_super(idx)?,
                Instruction::SuperInvoke(idx, argc) => self.super_invoke(idx, argc)?,
            }
        }
    }
}

//! Stack-based virtual machine
//!
//! A single dispatch loop reads one opcode at a time and mutates the value
//! stack. Call frames index into the shared stack; closures capture stack
//! slots through upvalue objects that close when their slot leaves the
//! stack. Garbage collection runs between instructions whenever the heap's
//! threshold (or stress mode) asks for it, with the stack, frames, globals,
//! open upvalues and the interned `init` string as roots.

mod frame;

pub use frame::CallFrame;

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use opal_config::VmConfig;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::error::{CompileError, InterpretError, RuntimeError, TraceFrame};
use crate::heap::{Heap, ObjRef, Roots};
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, Obj, UpvalueLocation,
};
use crate::table::Table;
use crate::value::Value;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;
/// Maximum value-stack depth
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Shared writable sink for `print` output
pub type OutputSink = Rc<RefCell<dyn Write>>;

/// Virtual machine state
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by descending stack slot
    open_upvalues: Option<ObjRef>,
    /// The interned `init` string, for initializer dispatch
    init_string: ObjRef,
    output: OutputSink,
    suppress_print: bool,
}

impl Vm {
    /// Create a VM and register the default natives
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.gc.clone());
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            output: Rc::new(RefCell::new(io::stdout())),
            suppress_print: config.suppress_print,
        };
        crate::stdlib::install(&mut vm);
        vm
    }

    /// Redirect `print` output (tests, embedders)
    pub fn set_output(&mut self, sink: OutputSink) {
        self.output = sink;
    }

    /// Compile and run a source string
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = self.compile(source)?;
        self.execute(function)?;
        Ok(())
    }

    /// Compile a source string to its top-level function object
    ///
    /// The returned handle is what a back-end or the serializer consumes.
    pub fn compile(&mut self, source: &str) -> Result<ObjRef, Vec<CompileError>> {
        compiler::compile(
            source,
            &mut self.heap,
            Some(&self.globals),
            Some(self.init_string),
        )
    }

    /// Execute a compiled top-level function
    pub fn execute(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        let closure = self.heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    /// Register a native function under a global name
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let hash = self.heap.str_hash(name).unwrap_or(0);
        let native = self.heap.alloc(Obj::Native(NativeObj { function }));
        self.globals.set(name, hash, Value::Obj(native));
    }

    /// Push a value (native/embedding stack access)
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop a value (native/embedding stack access)
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    /// Borrow the heap (embedders constructing values)
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Borrow the heap immutably
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ===== Dispatch loop =====

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            // Safe point: collect between instructions, never during one
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if self.stack.len() >= STACK_MAX {
                return Err(self.runtime_error("Stack overflow."));
            }

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    return Err(self.runtime_error("Compiler bug: unknown opcode."));
                }
            };

            match op {
                // ===== Constants and literals =====
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.stack.push(value);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop_value();
                }

                // ===== Variables =====
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    match self.globals.get(name, hash) {
                        Some(value) => self.stack.push(value),
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.as_str(name).unwrap_or("?")
                            );
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop_value();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let value = self.peek(0);
                    // Assignment must not create: undo and report if new
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let message = format!(
                            "Undefined variable '{}'.",
                            self.heap.as_str(name).unwrap_or("?")
                        );
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index)?;
                    let value = self.read_upvalue(upvalue);
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index)?;
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }

                // ===== Properties and indexing =====
                OpCode::GetProperty => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let target = self.peek(0);
                    let Some((class, field)) = self.instance_parts(target, name, hash) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    if let Some(value) = field {
                        self.pop_value();
                        self.stack.push(value);
                    } else {
                        self.bind_method(class, name, hash)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let target = self.peek(1);
                    let value = self.peek(0);
                    let Some(instance) = self.as_instance(target) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    match self.heap.get_mut(instance) {
                        Obj::Instance(obj) => {
                            obj.fields.set(name, hash, value);
                        }
                        _ => unreachable!("as_instance returned a non-instance"),
                    }
                    self.heap.note_growth(std::mem::size_of::<Value>());
                    self.pop_value();
                    self.pop_value();
                    self.stack.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let superclass = self.pop_value();
                    let Some(class) = self.as_class(superclass) else {
                        return Err(self.runtime_error("Compiler bug: 'super' is not a class."));
                    };
                    self.bind_method(class, name, hash)?;
                }
                OpCode::GetIndex => {
                    let key = self.pop_value();
                    let target = self.pop_value();
                    let value = self.index_get(target, key)?;
                    self.stack.push(value);
                }
                OpCode::SetIndex => {
                    let value = self.pop_value();
                    let key = self.pop_value();
                    let target = self.pop_value();
                    self.index_set(target, key, value)?;
                    self.stack.push(value);
                }

                // ===== Comparison and arithmetic =====
                OpCode::Equal => {
                    let b = self.pop_value();
                    let a = self.pop_value();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => {
                    let b = self.pop_value();
                    let a = self.pop_value();
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            self.stack.push(Value::Number(x + y));
                        }
                        _ if self.is_string(a) || self.is_string(b) => {
                            let mut text = self.heap.stringify(a);
                            text.push_str(&self.heap.stringify(b));
                            let handle = self.heap.intern(&text);
                            self.stack.push(Value::Obj(handle));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.",
                            ));
                        }
                    }
                }
                OpCode::Subtract => self.binary_numeric(|a, b| a - b)?,
                OpCode::Multiply => self.binary_numeric(|a, b| a * b)?,
                OpCode::Divide => self.binary_numeric(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop_value();
                    self.stack.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop_value();
                    match value {
                        Value::Number(n) => self.stack.push(Value::Number(-n)),
                        _ => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }

                // ===== Output =====
                OpCode::Print => {
                    let value = self.pop_value();
                    if !self.suppress_print {
                        let text = self.heap.display(value);
                        let _ = writeln!(self.output.borrow_mut(), "{}", text);
                    }
                }

                // ===== Control flow =====
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                // ===== Calls =====
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let argc = self.read_byte() as usize;
                    self.invoke(name, hash, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop_value();
                    let Some(class) = self.as_class(superclass) else {
                        return Err(self.runtime_error("Compiler bug: 'super' is not a class."));
                    };
                    self.invoke_from_class(class, name, hash, argc)?;
                }

                // ===== Closures =====
                OpCode::Closure => {
                    let function = self.read_constant();
                    let Some(function) = function.as_obj() else {
                        return Err(
                            self.runtime_error("Compiler bug: closure constant is not an object.")
                        );
                    };
                    let upvalue_count = self
                        .heap
                        .as_function(function)
                        .map(|f| f.upvalue_count)
                        .unwrap_or(0);
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let current = self.frame().closure;
                            let upvalue = match self.heap.get(current) {
                                Obj::Closure(c) => c.upvalues[index],
                                _ => {
                                    return Err(self.runtime_error(
                                        "Compiler bug: frame without a closure.",
                                    ))
                                }
                            };
                            upvalues.push(upvalue);
                        }
                    }
                    let closure = self
                        .heap
                        .alloc(Obj::Closure(ClosureObj { function, upvalues }));
                    self.stack.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop_value();
                }
                OpCode::Return => {
                    let result = self.pop_value();
                    let frame = self
                        .frames
                        .pop()
                        .expect("return without a frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.stack.push(result);
                }

                // ===== Classes =====
                OpCode::Class => {
                    let name = self.read_string_constant()?;
                    let class = self.heap.alloc(Obj::Class(ClassObj {
                        name,
                        methods: Table::new(),
                    }));
                    self.stack.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Some(superclass) = self.as_class(superclass) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = self.peek(0);
                    let Some(subclass) = self.as_class(subclass) else {
                        return Err(self.runtime_error("Compiler bug: inherit on a non-class."));
                    };
                    // Copy-down inheritance: the subclass starts with every
                    // superclass method; later Method ops may override.
                    let methods = match self.heap.get(superclass) {
                        Obj::Class(c) => c.methods.clone(),
                        _ => unreachable!("as_class returned a non-class"),
                    };
                    match self.heap.get_mut(subclass) {
                        Obj::Class(c) => c.methods.extend_from(&methods),
                        _ => unreachable!("as_class returned a non-class"),
                    }
                    self.pop_value();
                }
                OpCode::Method => {
                    let name = self.read_string_constant()?;
                    let hash = self.string_hash(name)?;
                    let method = self.peek(0);
                    let class = self.peek(1);
                    let Some(class) = self.as_class(class) else {
                        return Err(self.runtime_error("Compiler bug: method on a non-class."));
                    };
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => {
                            c.methods.set(name, hash, method);
                        }
                        _ => unreachable!("as_class returned a non-class"),
                    }
                    self.heap.note_growth(std::mem::size_of::<Value>());
                    self.pop_value();
                }

                // ===== Arrays =====
                OpCode::ArrayEmpty => {
                    let array = self.heap.new_array(Vec::new());
                    self.stack.push(Value::Obj(array));
                }
                OpCode::ArrayPush => {
                    let count = match self.pop_value() {
                        Value::Number(n) => n as usize,
                        _ => {
                            return Err(
                                self.runtime_error("Compiler bug: array count is not a number.")
                            )
                        }
                    };
                    // Elements were pushed front-to-back; popping reverses
                    // them, so reverse again to preserve source order.
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(self.pop_value());
                    }
                    items.reverse();
                    let target = self.peek(0);
                    let Some(array) = self.as_array(target) else {
                        return Err(self.runtime_error("Compiler bug: array push without array."));
                    };
                    self.heap
                        .note_growth(count * std::mem::size_of::<Value>());
                    match self.heap.get_mut(array) {
                        Obj::Array(a) => a.items.extend(items),
                        _ => unreachable!("as_array returned a non-array"),
                    }
                }
                OpCode::ArrayRange => {
                    let end = self.pop_value();
                    let start = self.pop_value();
                    let target = self.pop_value();
                    let value = self.array_range(target, start, end)?;
                    self.stack.push(value);
                }

                // ===== Placeholders =====
                OpCode::Break | OpCode::Continue | OpCode::CaseFallthrough => {
                    return Err(self.runtime_error(
                        "Compiler bug: placeholder opcode reached at runtime.",
                    ));
                }
            }
        }
    }

    // ===== Instruction reading =====

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no call frame")
    }

    fn chunk_of(&self, closure: ObjRef) -> &Chunk {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => panic!("frame closure is not a closure"),
        };
        match self.heap.get(function) {
            Obj::Function(f) => &f.chunk,
            _ => panic!("closure function is not a function"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        self.chunk_of(closure).code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let closure = self.frame().closure;
        self.chunk_of(closure).constants[index]
    }

    fn read_string_constant(&mut self) -> Result<ObjRef, RuntimeError> {
        let value = self.read_constant();
        match value.as_obj() {
            Some(handle) if self.heap.as_str(handle).is_some() => Ok(handle),
            _ => Err(self.runtime_error("Compiler bug: name constant is not a string.")),
        }
    }

    fn string_hash(&mut self, name: ObjRef) -> Result<u32, RuntimeError> {
        match self.heap.str_hash(name) {
            Some(hash) => Ok(hash),
            None => Err(self.runtime_error("Compiler bug: name constant is not a string.")),
        }
    }

    // ===== Stack helpers =====

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn pop_value(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn binary_numeric(&mut self, op: fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop_value();
        let a = self.pop_value();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop_value();
        let a = self.pop_value();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // ===== Object downcasts =====

    fn is_string(&self, value: Value) -> bool {
        value
            .as_obj()
            .is_some_and(|handle| self.heap.as_str(handle).is_some())
    }

    fn as_class(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&handle| matches!(self.heap.get(handle), Obj::Class(_)))
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&handle| matches!(self.heap.get(handle), Obj::Instance(_)))
    }

    fn as_array(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&handle| matches!(self.heap.get(handle), Obj::Array(_)))
    }

    /// For an instance value: its class and the named field, if present
    fn instance_parts(
        &self,
        value: Value,
        name: ObjRef,
        hash: u32,
    ) -> Option<(ObjRef, Option<Value>)> {
        let handle = value.as_obj()?;
        match self.heap.get(handle) {
            Obj::Instance(instance) => {
                Some((instance.class, instance.fields.get(name, hash)))
            }
            _ => None,
        }
    }

    // ===== Calls =====

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let Some(handle) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.get(handle) {
            Obj::Closure(_) => self.call_closure(handle, argc),
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Obj::Class(class) => {
                let init = class.methods.get(self.init_string, self.init_hash());
                let instance = self.heap.alloc(Obj::Instance(InstanceObj {
                    class: handle,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::Obj(instance);
                match init {
                    Some(init) => {
                        let Some(closure) = init.as_obj() else {
                            return Err(
                                self.runtime_error("Compiler bug: initializer is not a closure.")
                            );
                        };
                        self.call_closure(closure, argc)
                    }
                    None if argc != 0 => {
                        let message = format!("Expected 0 arguments but got {}.", argc);
                        Err(self.runtime_error(message))
                    }
                    None => Ok(()),
                }
            }
            Obj::Native(native) => {
                let function = native.function;
                let args_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = function(&mut self.heap, &args);
                self.stack.truncate(args_start - 1);
                self.stack.push(result);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let arity = match self.heap.get(closure) {
            Obj::Closure(c) => self
                .heap
                .as_function(c.function)
                .map(|f| f.arity as usize)
                .unwrap_or(0),
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        if argc != arity {
            let message = format!("Expected {} arguments but got {}.", arity, argc);
            return Err(self.runtime_error(message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// Fused property access + call: skips the bound-method allocation
    fn invoke(&mut self, name: ObjRef, hash: u32, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let Some((class, field)) = self.instance_parts(receiver, name, hash) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        if let Some(field) = field {
            // A field shadows a method; call it like any other value
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, hash, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => None,
        };
        let Some(method) = method else {
            let message = format!(
                "Undefined property '{}'.",
                self.heap.as_str(name).unwrap_or("?")
            );
            return Err(self.runtime_error(message));
        };
        let Some(closure) = method.as_obj() else {
            return Err(self.runtime_error("Compiler bug: method is not a closure."));
        };
        self.call_closure(closure, argc)
    }

    /// Pop the named method from `class` and bind it to the receiver on top
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, hash: u32) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => None,
        };
        let Some(method) = method else {
            let message = format!(
                "Undefined property '{}'.",
                self.heap.as_str(name).unwrap_or("?")
            );
            return Err(self.runtime_error(message));
        };
        let Some(method) = method.as_obj() else {
            return Err(self.runtime_error("Compiler bug: method is not a closure."));
        };
        let receiver = self.peek(0);
        let bound = self.heap.alloc(Obj::BoundMethod(BoundMethodObj {
            receiver,
            method,
        }));
        self.pop_value();
        self.stack.push(Value::Obj(bound));
        Ok(())
    }

    fn init_hash(&self) -> u32 {
        self.heap.str_hash(self.init_string).unwrap_or(0)
    }

    // ===== Upvalues =====

    fn current_upvalue(&mut self, index: usize) -> Result<ObjRef, RuntimeError> {
        let closure = self.frame().closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => match c.upvalues.get(index) {
                Some(upvalue) => Ok(*upvalue),
                None => Err(self.runtime_error("Compiler bug: upvalue index out of range.")),
            },
            _ => Err(self.runtime_error("Compiler bug: frame without a closure.")),
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => match u.location {
                UpvalueLocation::Stack(slot) => self.stack[slot],
                UpvalueLocation::Closed(value) => value,
            },
            _ => panic!("upvalue handle is not an upvalue"),
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.get_mut(upvalue) {
            Obj::Upvalue(u) => match u.location {
                UpvalueLocation::Stack(slot) => self.stack[slot] = value,
                UpvalueLocation::Closed(_) => u.location = UpvalueLocation::Closed(value),
            },
            _ => panic!("upvalue handle is not an upvalue"),
        }
    }

    /// Find or create the open upvalue for an absolute stack slot.
    ///
    /// The open list is sorted by strictly decreasing slot; an existing
    /// upvalue for the slot is shared so every closure sees one location.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(handle) = current {
            let (location, next) = match self.heap.get(handle) {
                Obj::Upvalue(u) => (u.location, u.next_open),
                _ => panic!("open-upvalue list holds a non-upvalue"),
            };
            match location {
                UpvalueLocation::Stack(existing) if existing > slot => {
                    previous = Some(handle);
                    current = next;
                }
                UpvalueLocation::Stack(existing) if existing == slot => {
                    return handle;
                }
                _ => break,
            }
        }

        let created = self.heap.new_upvalue(slot, current);
        match previous {
            None => self.open_upvalues = Some(created),
            Some(previous) => match self.heap.get_mut(previous) {
                Obj::Upvalue(u) => u.next_open = Some(created),
                _ => panic!("open-upvalue list holds a non-upvalue"),
            },
        }
        created
    }

    /// Close every open upvalue at or above `last`, moving the stack value
    /// into the upvalue object
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let (slot, next) = match self.heap.get(handle) {
                Obj::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(slot) => (slot, u.next_open),
                    UpvalueLocation::Closed(_) => {
                        panic!("closed upvalue on the open list")
                    }
                },
                _ => panic!("open-upvalue list holds a non-upvalue"),
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            match self.heap.get_mut(handle) {
                Obj::Upvalue(u) => {
                    u.location = UpvalueLocation::Closed(value);
                    u.next_open = None;
                }
                _ => panic!("open-upvalue list holds a non-upvalue"),
            }
            self.open_upvalues = next;
        }
    }

    // ===== Indexing =====

    /// Resolve a string table key to its handle and cached hash
    fn table_key(&mut self, key: Value) -> Result<(ObjRef, u32), RuntimeError> {
        let hash = key.as_obj().and_then(|handle| self.heap.str_hash(handle));
        match (key.as_obj(), hash) {
            (Some(handle), Some(hash)) => Ok((handle, hash)),
            _ => Err(self.runtime_error("Table key must be a string.")),
        }
    }

    fn index_get(&mut self, target: Value, key: Value) -> Result<Value, RuntimeError> {
        let Some(handle) = target.as_obj() else {
            return Err(self.runtime_error("Only arrays and tables can be indexed."));
        };
        if let Obj::Array(array) = self.heap.get(handle) {
            let len = array.items.len();
            let Some(index) = key.as_number() else {
                return Err(self.runtime_error("Array index must be a number."));
            };
            let Some(index) = to_element_index(index, len) else {
                return Err(self.runtime_error("Array index out of bounds."));
            };
            let value = match self.heap.get(handle) {
                Obj::Array(array) => array.items[index],
                _ => unreachable!("array changed kind mid-read"),
            };
            return Ok(value);
        }
        if matches!(self.heap.get(handle), Obj::Table(_)) {
            let (key, hash) = self.table_key(key)?;
            let value = match self.heap.get(handle) {
                // Missing keys read as nil
                Obj::Table(table) => table.entries.get(key, hash).unwrap_or(Value::Nil),
                _ => unreachable!("table changed kind mid-read"),
            };
            return Ok(value);
        }
        Err(self.runtime_error("Only arrays and tables can be indexed."))
    }

    fn index_set(&mut self, target: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        let Some(handle) = target.as_obj() else {
            return Err(self.runtime_error("Only arrays and tables can be indexed."));
        };
        if let Obj::Array(array) = self.heap.get(handle) {
            let len = array.items.len();
            let Some(index) = key.as_number() else {
                return Err(self.runtime_error("Array index must be a number."));
            };
            let Some(index) = to_element_index(index, len) else {
                return Err(self.runtime_error("Array index out of bounds."));
            };
            match self.heap.get_mut(handle) {
                Obj::Array(array) => array.items[index] = value,
                _ => unreachable!("array changed kind mid-write"),
            }
            return Ok(());
        }
        if matches!(self.heap.get(handle), Obj::Table(_)) {
            let (key, hash) = self.table_key(key)?;
            match self.heap.get_mut(handle) {
                Obj::Table(table) => {
                    table.entries.set(key, hash, value);
                }
                _ => unreachable!("table changed kind mid-write"),
            }
            self.heap.note_growth(std::mem::size_of::<Value>());
            return Ok(());
        }
        Err(self.runtime_error("Only arrays and tables can be indexed."))
    }

    /// `a[start:end]` — copy a validated slice into a fresh array
    fn array_range(
        &mut self,
        target: Value,
        start: Value,
        end: Value,
    ) -> Result<Value, RuntimeError> {
        let Some(handle) = target.as_obj() else {
            return Err(self.runtime_error("Can only slice arrays."));
        };
        let len = match self.heap.get(handle) {
            Obj::Array(array) => array.items.len(),
            _ => return Err(self.runtime_error("Can only slice arrays.")),
        };

        let start = match start {
            Value::Nil => 0,
            Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
            _ => return Err(self.runtime_error("Slice bounds must be whole numbers.")),
        };
        let end = match end {
            Value::Nil => len,
            Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
            _ => return Err(self.runtime_error("Slice bounds must be whole numbers.")),
        };
        if start > end || end > len {
            return Err(self.runtime_error("Invalid slice range."));
        }

        let items = match self.heap.get(handle) {
            Obj::Array(array) => array.items[start..end].to_vec(),
            _ => unreachable!("array changed kind mid-slice"),
        };
        let sliced = self.heap.new_array(items);
        Ok(Value::Obj(sliced))
    }

    // ===== Errors and GC =====

    /// Build a runtime error with a stack trace, then reset the stack
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let chunk = self.chunk_of(frame.closure);
            let offset = frame.ip.saturating_sub(1).min(chunk.lines.len().saturating_sub(1));
            let line = chunk.lines.get(offset).copied().unwrap_or(0);
            let name = match self.heap.get(frame.closure) {
                Obj::Closure(c) => self
                    .heap
                    .as_function(c.function)
                    .and_then(|f| f.name)
                    .and_then(|n| self.heap.as_str(n))
                    .map(|s| s.to_string()),
                _ => None,
            };
            trace.push(TraceFrame { line, name });
        }
        self.reset_stack();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    fn collect_garbage(&mut self) {
        let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            globals: Some(&self.globals),
            open_upvalues: self.open_upvalues,
            init_string: Some(self.init_string),
            ..Roots::default()
        };
        self.heap.collect(&roots);
    }
}

/// Convert an f64 index into a checked element index
fn to_element_index(index: f64, len: usize) -> Option<usize> {
    if index < 0.0 || index.fract() != 0.0 {
        return None;
    }
    let index = index as usize;
    if index < len {
        Some(index)
    } else {
        None
    }
}

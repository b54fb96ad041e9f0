//! Single-pass bytecode compiler
//!
//! A Pratt parser that emits bytecode as it parses; there is no AST. The
//! compiler is an explicit context (no globals): nested function compilation
//! pushes a `FuncCompiler` whose `enclosing` link owns the outer one, and
//! the chain doubles as the GC root set for everything still under
//! construction.
//!
//! `break`/`continue`/fallthrough sites emit placeholder opcodes with
//! two-byte operands; when the innermost loop or switch ends, the compiler
//! sweeps that byte range with `op_arg_size` and rewrites each placeholder
//! to a real `Jump`/`Loop`. A placeholder that survives to runtime is a
//! compiler bug and the VM reports it as such.

mod expr;
mod stmt;

use crate::chunk::{Chunk, OpCode};
use crate::error::{CompileError, ErrorAt};
use crate::heap::{Heap, ObjRef, Roots};
use crate::lexer::Scanner;
use crate::object::{FunctionObj, Obj};
use crate::table::Table;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Maximum locals per function (one-byte slot operand)
pub const MAX_LOCALS: usize = 256;
/// Maximum upvalues per function
pub const MAX_UPVALUES: usize = 256;
/// Maximum call arguments
pub const MAX_ARGS: usize = 255;

/// What kind of function body is being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    /// Top-level script
    Script,
    /// A plain function
    Function,
    /// A class method
    Method,
    /// An `init` method: `return;` yields the receiver
    Initializer,
    /// A `defer` body
    Defer,
}

/// A local variable slot
struct Local<'src> {
    name: Token<'src>,
    /// Scope depth, or -1 while declared but uninitialized
    depth: i32,
    is_captured: bool,
}

/// One upvalue of the function being compiled
#[derive(Clone, Copy)]
pub(crate) struct UpvalueSpec {
    pub index: u8,
    pub is_local: bool,
}

/// What a `break` can exit
enum BreakableKind {
    Loop {
        /// Back-edge target for `continue`
        continue_target: usize,
    },
    Switch,
}

/// An active loop or switch, for placeholder patching
struct Breakable {
    kind: BreakableKind,
    /// Start of the byte range the end-of-construct sweep rewrites
    region_start: usize,
    /// Scope depth outside the construct body; break/continue discard
    /// deeper locals before jumping
    depth: i32,
}

/// Per-function compiler state; `enclosing` owns the outer function's state
struct FuncCompiler<'src> {
    enclosing: Option<Box<FuncCompiler<'src>>>,
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    /// Synthetic local slots holding defer closures, in FIFO order
    deferred: Vec<u8>,
    breakables: Vec<Breakable>,
}

impl<'src> FuncCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the frame: the receiver in methods, otherwise
        // an unnameable placeholder.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                Token::synthetic("this")
            } else {
                Token::synthetic("")
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            enclosing: None,
            function: FunctionObj {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name,
            },
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            deferred: Vec::new(),
            breakables: Vec::new(),
        }
    }

    /// Resolve a name to a local slot; errors on read-in-own-initializer
    fn resolve_local(&self, name: &Token) -> Result<Option<u8>, &'static str> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name.lexeme == name.lexeme {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Resolve a name through the enclosing chain, registering upvalues
    fn resolve_upvalue(&mut self, name: &Token) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_mut() else {
            return Ok(None);
        };
        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[local as usize].is_captured = true;
            return self.add_upvalue(local, true).map(Some);
        }
        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }
        Ok(None)
    }

    /// Add (or reuse) an upvalue entry for this function
    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(UpvalueSpec { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Innermost loop, if any (for `continue`)
    fn innermost_loop(&self) -> Option<&Breakable> {
        self.breakables
            .iter()
            .rev()
            .find(|b| matches!(b.kind, BreakableKind::Loop { .. }))
    }
}

/// Class-compiler stack entry
struct ClassCompiler {
    has_superclass: bool,
}

/// Token-stream state
struct ParserState<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
}

/// The compiler context
pub struct Compiler<'src, 'h> {
    parser: ParserState<'src>,
    heap: &'h mut Heap,
    func: Box<FuncCompiler<'src>>,
    class_compilers: Vec<ClassCompiler>,
    errors: Vec<CompileError>,
    panic_mode: bool,
    /// Globals owned by the embedding VM, rooted during compile-time GC
    host_globals: Option<&'h Table>,
    /// The VM's interned `init` string, rooted during compile-time GC
    host_init_string: Option<ObjRef>,
}

/// Compile a source string into a top-level function object
///
/// `host_globals` and `host_init_string` are the embedding VM's live roots;
/// they keep already-registered natives and interned names alive when a
/// collection runs during compilation.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    host_globals: Option<&Table>,
    host_init_string: Option<ObjRef>,
) -> Result<ObjRef, Vec<CompileError>> {
    // The lifetimes of the two host borrows are tied together through 'h.
    let mut compiler = Compiler {
        parser: ParserState {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
        },
        heap,
        func: Box::new(FuncCompiler::new(FunctionKind::Script, None)),
        class_compilers: Vec::new(),
        errors: Vec::new(),
        panic_mode: false,
        host_globals,
        host_init_string,
    };

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    let handle = compiler.heap.alloc(Obj::Function(function));

    if compiler.errors.is_empty() {
        Ok(handle)
    } else {
        Err(compiler.errors)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // ===== Token stream =====

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.next_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme.to_string();
            self.error_at_current_bare(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ===== Error reporting =====

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.report(token, message, false);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.report(token, message, false);
    }

    /// Scanner errors already carry their message; no lexeme suffix
    fn error_at_current_bare(&mut self, message: &str) {
        let token = self.parser.current;
        self.report(token, message, true);
    }

    fn report(&mut self, token: Token, message: &str, bare: bool) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let at = if bare {
            ErrorAt::Bare
        } else if token.kind == TokenKind::Eof {
            ErrorAt::End
        } else {
            ErrorAt::Lexeme(token.lexeme.to_string())
        };
        self.errors.push(CompileError {
            line: token.line,
            at,
            message: message.to_string(),
        });
    }

    /// Discard tokens until a statement boundary
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch
                | TokenKind::Defer => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ===== Emission =====

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.func.function.chunk
    }

    fn line(&self) -> u32 {
        self.parser.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_ops(OpCode::Constant, index);
    }

    /// Intern an identifier's lexeme and store it in the constant pool
    fn identifier_constant(&mut self, token: Token) -> u8 {
        let handle = self.heap.intern(token.lexeme);
        self.make_constant(Value::Obj(handle))
    }

    /// Emit a jump with a placeholder operand; returns the operand offset
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current_chunk().code.len() - 2
    }

    /// Rewrite a forward-jump operand to land at the current offset
    fn patch_jump(&mut self, operand_offset: usize) {
        let jump = self.current_chunk().code.len() - operand_offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current_chunk().patch_u16(operand_offset, jump as u16);
    }

    /// Rewrite a pending `CaseFallthrough` placeholder into a real `Jump`
    /// landing at the current offset (the next case body)
    fn patch_fallthrough(&mut self, operand_offset: usize) {
        self.patch_jump(operand_offset);
        let chunk = self.current_chunk();
        chunk.code[operand_offset - 1] = OpCode::Jump.into();
    }

    /// Emit a back-edge to `target`
    fn emit_loop(&mut self, target: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() + 2 - target;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            self.emit_byte(0xFF);
            self.emit_byte(0xFF);
            return;
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xFF) as u8);
    }

    /// Run the recorded defer closures, oldest first
    fn emit_defer_calls(&mut self) {
        for i in 0..self.func.deferred.len() {
            let slot = self.func.deferred[i];
            self.emit_ops(OpCode::GetLocal, slot);
            self.emit_ops(OpCode::Call, 0);
            self.emit_op(OpCode::Pop);
        }
    }

    /// Emit the implicit function epilogue
    fn emit_return(&mut self) {
        self.emit_defer_calls();
        if self.func.kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ===== Scopes and variables =====

    fn begin_scope(&mut self) {
        self.func.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func.scope_depth -= 1;
        while let Some(local) = self.func.locals.last() {
            if local.depth <= self.func.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.func.locals.pop();
        }
    }

    /// Emit pops for locals deeper than `depth` without forgetting them;
    /// used before break/continue jumps so the stack stays balanced.
    fn discard_locals(&mut self, depth: i32) {
        let ops: Vec<OpCode> = self
            .func
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.func.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.func.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    /// Add an unnameable local owned by the compiler (scrutinees, defers)
    fn add_synthetic_local(&mut self, name: &'static str) -> u8 {
        if self.func.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return 0;
        }
        let depth = self.func.scope_depth;
        self.func.locals.push(Local {
            name: Token::synthetic(name),
            depth,
            is_captured: false,
        });
        (self.func.locals.len() - 1) as u8
    }

    fn declare_variable(&mut self) {
        if self.func.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous;
        let mut duplicate = false;
        for local in self.func.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.func.scope_depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        if self.func.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.func.locals.last_mut() {
            local.depth = self.func.scope_depth;
        }
    }

    /// Parse a variable name; returns its global-name constant (0 for locals)
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.func.scope_depth > 0 {
            return 0;
        }
        let token = self.parser.previous;
        self.identifier_constant(token)
    }

    fn define_variable(&mut self, global: u8) {
        if self.func.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    // ===== Nested function compilation =====

    /// Push a fresh function compiler for a nested function body
    fn push_func(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        let fresh = Box::new(FuncCompiler::new(kind, name));
        let enclosing = std::mem::replace(&mut self.func, fresh);
        self.func.enclosing = Some(enclosing);
    }

    /// Finish the current function: emit the epilogue and pop its state.
    /// Returns the function and its upvalue layout for `Closure` emission.
    fn end_function(&mut self) -> (FunctionObj, Vec<UpvalueSpec>) {
        self.emit_return();
        let enclosing = self.func.enclosing.take();
        let finished = match enclosing {
            Some(outer) => std::mem::replace(&mut self.func, outer),
            None => {
                // Top-level script: leave a placeholder so `compile` can
                // extract the finished function.
                let placeholder = Box::new(FuncCompiler::new(FunctionKind::Script, None));
                std::mem::replace(&mut self.func, placeholder)
            }
        };
        (finished.function, finished.upvalues)
    }

    // ===== Placeholder patching =====

    /// Rewrite `Break` (and, for loops, `Continue`) placeholders emitted in
    /// `[region_start, end)` into real jumps. Walks instruction by
    /// instruction with `op_arg_size`, so variable-length `Closure`
    /// operands are skipped correctly. Already-rewritten inner regions are
    /// skipped naturally because their opcodes are no longer placeholders.
    fn patch_breakable_region(
        &mut self,
        region_start: usize,
        end: usize,
        continue_target: Option<usize>,
    ) {
        let mut offset = region_start;
        while offset < end {
            let size = {
                let chunk = &self.func.function.chunk;
                chunk.op_arg_size(offset, self.heap)
            };
            let op = OpCode::try_from(self.func.function.chunk.code[offset])
                .expect("invalid opcode during patch sweep");
            match op {
                OpCode::Break => {
                    let jump = end - (offset + 3);
                    if jump > u16::MAX as usize {
                        self.error("Too much code to jump over.");
                    } else {
                        let chunk = self.current_chunk();
                        chunk.code[offset] = OpCode::Jump.into();
                        chunk.patch_u16(offset + 1, jump as u16);
                    }
                }
                OpCode::Continue => {
                    if let Some(target) = continue_target {
                        let back = (offset + 3) - target;
                        if back > u16::MAX as usize {
                            self.error("Loop body too large.");
                        } else {
                            let chunk = self.current_chunk();
                            chunk.code[offset] = OpCode::Loop.into();
                            chunk.patch_u16(offset + 1, back as u16);
                        }
                    }
                    // Inside a switch sweep the placeholder is left for the
                    // enclosing loop's sweep.
                }
                _ => {}
            }
            offset += 1 + size;
        }
    }

    // ===== GC safe point =====

    /// Collect if the heap asks for it, rooting the compiler chain and the
    /// host VM's live structures.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut compiler_chunks = Vec::new();
        let mut compiler_names = Vec::new();
        let mut cursor = Some(&self.func);
        while let Some(fc) = cursor {
            compiler_chunks.push(&fc.function.chunk);
            if let Some(name) = fc.function.name {
                compiler_names.push(name);
            }
            cursor = fc.enclosing.as_ref();
        }
        let roots = Roots {
            globals: self.host_globals,
            init_string: self.host_init_string,
            compiler_chunks,
            compiler_names,
            ..Roots::default()
        };
        self.heap.collect(&roots);
    }
}

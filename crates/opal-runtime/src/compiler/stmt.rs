//! Statement and declaration parsing

use super::{Breakable, BreakableKind, Compiler, FunctionKind, UpvalueSpec};
use crate::chunk::OpCode;
use crate::object::{FunctionObj, Obj};
use crate::token::TokenKind;
use crate::value::Value;

impl<'src, 'h> Compiler<'src, 'h> {
    /// One declaration; this is also the compiler's GC safe point
    pub(super) fn declaration(&mut self) {
        self.maybe_collect();

        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Defer) {
            self.defer_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    // ===== Declarations =====

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized before the body so the function can call itself
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body (name is the previous token) and emit the
    /// closure that wraps it
    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.parser.previous.lexeme);
        self.push_func(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.func.function.arity = arity.min(255) as u8;
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        self.emit_closure(function, &upvalues);
    }

    /// Allocate a finished function and emit `Closure` with its upvalue pairs
    fn emit_closure(&mut self, function: FunctionObj, upvalues: &[UpvalueSpec]) {
        let handle = self.heap.alloc(Obj::Function(function));
        let constant = self.make_constant(Value::Obj(handle));
        self.emit_ops(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(super::ClassCompiler {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.parser.previous;
            self.named_variable(super_name, false);

            if class_name.lexeme == super_name.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_synthetic_local("super");
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class_compilers.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self
            .class_compilers
            .last()
            .is_some_and(|class| class.has_superclass)
        {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.parser.previous;
        let constant = self.identifier_constant(name_token);

        let kind = if name_token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_ops(OpCode::Method, constant);
    }

    // ===== Simple statements =====

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    pub(super) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn return_statement(&mut self) {
        if self.func.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.func.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            // The result is computed first; the defers run over it, then
            // the frame unwinds.
            self.emit_defer_calls();
            self.emit_op(OpCode::Return);
        }
    }

    // ===== Control flow =====

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let depth = self.func.scope_depth;
        let region_start = self.current_chunk().code.len();
        self.func.breakables.push(Breakable {
            kind: BreakableKind::Loop {
                continue_target: loop_start,
            },
            region_start,
            depth,
        });

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.finish_breakable();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        // Initializer clause
        if self.matches(TokenKind::Semicolon) {
            // No initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();

        // Condition clause
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // Increment clause: jump over it into the body; the body's back
        // edge lands on the increment, which then loops to the condition.
        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.func.scope_depth;
        let region_start = self.current_chunk().code.len();
        self.func.breakables.push(Breakable {
            kind: BreakableKind::Loop {
                continue_target: loop_start,
            },
            region_start,
            depth,
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        self.finish_breakable();
        self.end_scope();
    }

    /// Pop the innermost breakable and rewrite its placeholders
    fn finish_breakable(&mut self) {
        let end = self.current_chunk().code.len();
        let breakable = self
            .func
            .breakables
            .pop()
            .expect("breakable stack underflow");
        let continue_target = match breakable.kind {
            BreakableKind::Loop { continue_target } => Some(continue_target),
            BreakableKind::Switch => None,
        };
        self.patch_breakable_region(breakable.region_start, end, continue_target);
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(depth) = self.func.breakables.last().map(|b| b.depth) else {
            self.error("Can't use 'break' outside of a loop or switch.");
            return;
        };
        self.discard_locals(depth);
        self.emit_jump(OpCode::Break);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(depth) = self.func.innermost_loop().map(|b| b.depth) else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.discard_locals(depth);
        self.emit_jump(OpCode::Continue);
    }

    // ===== Switch =====

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");

        // The scrutinee is evaluated once into a synthetic local
        self.begin_scope();
        let scrutinee = self.add_synthetic_local("$switch");
        let depth = self.func.scope_depth;

        self.consume(TokenKind::LeftBrace, "Expect '{' after switch value.");
        let region_start = self.current_chunk().code.len();
        self.func.breakables.push(Breakable {
            kind: BreakableKind::Switch,
            region_start,
            depth,
        });

        // Offset of the previous case's false-jump operand
        let mut pending_case_jump: Option<usize> = None;
        // Offset of a fallthrough operand waiting for the next body
        let mut pending_fallthrough: Option<usize> = None;
        let mut saw_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) {
                if saw_default {
                    self.error("Can't have a case after 'default'.");
                }
                if let Some(jump) = pending_case_jump.take() {
                    self.patch_jump(jump);
                    self.emit_op(OpCode::Pop);
                }

                self.emit_ops(OpCode::GetLocal, scrutinee);
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit_op(OpCode::Equal);
                pending_case_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
                self.emit_op(OpCode::Pop);

                if let Some(fallthrough) = pending_fallthrough.take() {
                    self.patch_fallthrough(fallthrough);
                }

                if self.check(TokenKind::Case)
                    || self.check(TokenKind::Default)
                    || self.check(TokenKind::RightBrace)
                {
                    // Empty case: fall through to the next body, which the
                    // end-of-switch check requires to exist
                    pending_fallthrough = Some(self.emit_jump(OpCode::CaseFallthrough));
                } else {
                    self.case_body();
                }
            } else if self.matches(TokenKind::Default) {
                if saw_default {
                    self.error("Can't have more than one 'default'.");
                }
                saw_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");

                if let Some(jump) = pending_case_jump.take() {
                    self.patch_jump(jump);
                    self.emit_op(OpCode::Pop);
                }
                if let Some(fallthrough) = pending_fallthrough.take() {
                    self.patch_fallthrough(fallthrough);
                }
                self.case_body();
            } else {
                self.error_at_current("Expect 'case' or 'default'.");
                break;
            }
        }

        if pending_fallthrough.is_some() {
            self.error("A case with no body must be followed by another case.");
        }
        if let Some(jump) = pending_case_jump.take() {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");

        self.finish_breakable();
        self.end_scope();
    }

    /// A case (or default) body: scoped statements terminated by `Break`
    fn case_body(&mut self) {
        self.begin_scope();
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
        {
            self.declaration();
        }
        self.end_scope();
        self.emit_jump(OpCode::Break);
    }

    // ===== Defer =====

    fn defer_statement(&mut self) {
        match self.func.kind {
            FunctionKind::Script => {
                self.error("Can't use 'defer' outside of a function.");
            }
            _ if self.func.scope_depth != 1 => {
                // The recorded slot must exist unconditionally at every
                // return site, so a defer can only live at body level.
                self.error("'defer' must be declared directly in the function body.");
            }
            _ => {}
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' after 'defer'.");
        let name = self.heap.intern("defer");
        self.push_func(FunctionKind::Defer, Some(name));
        self.begin_scope();
        self.block();
        let (function, upvalues) = self.end_function();
        self.emit_closure(function, &upvalues);

        // The closure just pushed becomes a synthetic local; its slot is
        // loaded and called at every return site, oldest defer first.
        let slot = self.add_synthetic_local("$defer");
        self.func.deferred.push(slot);
    }
}

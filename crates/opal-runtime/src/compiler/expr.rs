//! Expression parsing: the Pratt rule table and parselets
//!
//! A constant table indexed by token kind drives parsing: each row names an
//! optional prefix parselet, an optional infix parselet, and the infix
//! precedence. Every token kind has a row; a unit test walks the whole
//! table so a new token kind cannot silently parse as "expect expression".

use super::{Compiler, MAX_ARGS};
use crate::chunk::OpCode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Infix binding strength, weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(super) enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` unary `-`
    Unary,
    /// `()` `.` `[]`
    Call,
    Primary,
}

impl Precedence {
    /// One level stronger (used for left-associative infix operators)
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// A parselet: mutates the compiler, consuming tokens and emitting code
pub(super) type ParseFn = for<'a, 'src, 'h> fn(&'a mut Compiler<'src, 'h>, bool);

/// One row of the rule table
pub(super) struct ParseRule {
    pub prefix: Option<ParseFn>,
    pub infix: Option<ParseFn>,
    pub precedence: Precedence,
}

const fn rule(
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// The rule table, in `TokenKind` discriminant order
pub(super) static RULES: [ParseRule; TokenKind::COUNT] = [
    rule(Some(grouping), Some(call), Precedence::Call), // LeftParen
    rule(None, None, Precedence::None),                 // RightParen
    rule(None, None, Precedence::None),                 // LeftBrace
    rule(None, None, Precedence::None),                 // RightBrace
    rule(Some(array_literal), Some(index), Precedence::Call), // LeftBracket
    rule(None, None, Precedence::None),                 // RightBracket
    rule(None, None, Precedence::None),                 // Comma
    rule(None, Some(dot), Precedence::Call),            // Dot
    rule(Some(unary), Some(binary), Precedence::Term),  // Minus
    rule(None, Some(binary), Precedence::Term),         // Plus
    rule(None, None, Precedence::None),                 // Colon
    rule(None, None, Precedence::None),                 // Semicolon
    rule(None, Some(binary), Precedence::Factor),       // Slash
    rule(None, Some(binary), Precedence::Factor),       // Star
    rule(Some(unary), None, Precedence::None),          // Bang
    rule(None, Some(binary), Precedence::Equality),     // BangEqual
    rule(None, None, Precedence::None),                 // Equal
    rule(None, Some(binary), Precedence::Equality),     // EqualEqual
    rule(None, Some(binary), Precedence::Comparison),   // Greater
    rule(None, Some(binary), Precedence::Comparison),   // GreaterEqual
    rule(None, Some(binary), Precedence::Comparison),   // Less
    rule(None, Some(binary), Precedence::Comparison),   // LessEqual
    rule(Some(variable), None, Precedence::None),       // Identifier
    rule(Some(string), None, Precedence::None),         // String
    rule(Some(number), None, Precedence::None),         // Number
    rule(None, Some(and_op), Precedence::And),          // And
    rule(None, None, Precedence::None),                 // Break
    rule(None, None, Precedence::None),                 // Case
    rule(None, None, Precedence::None),                 // Class
    rule(None, None, Precedence::None),                 // Continue
    rule(None, None, Precedence::None),                 // Default
    rule(None, None, Precedence::None),                 // Defer
    rule(None, None, Precedence::None),                 // Else
    rule(Some(literal), None, Precedence::None),        // False
    rule(None, None, Precedence::None),                 // For
    rule(None, None, Precedence::None),                 // Fun
    rule(None, None, Precedence::None),                 // If
    rule(Some(literal), None, Precedence::None),        // Nil
    rule(None, Some(or_op), Precedence::Or),            // Or
    rule(None, None, Precedence::None),                 // Print
    rule(None, None, Precedence::None),                 // Return
    rule(Some(super_), None, Precedence::None),         // Super
    rule(None, None, Precedence::None),                 // Switch
    rule(Some(this_), None, Precedence::None),          // This
    rule(Some(literal), None, Precedence::None),        // True
    rule(None, None, Precedence::None),                 // Var
    rule(None, None, Precedence::None),                 // While
    rule(None, None, Precedence::None),                 // Error
    rule(None, None, Precedence::None),                 // Eof
];

pub(super) fn rule_for(kind: TokenKind) -> &'static ParseRule {
    &RULES[kind as usize]
}

impl<'src, 'h> Compiler<'src, 'h> {
    /// Compile one expression
    pub(super) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: parse at the given binding strength or stronger
    pub(super) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.parser.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.parser.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule_for(self.parser.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Emit a read or (when assigning) write of a named variable
    pub(super) fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = match self.func.resolve_local(&name) {
            Err(message) => {
                self.error(message);
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => match self.func.resolve_upvalue(&name) {
                Err(message) => {
                    self.error(message);
                    (OpCode::GetLocal, OpCode::SetLocal, 0)
                }
                Ok(Some(index)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    /// Parse a parenthesized argument list; returns the argument count
    pub(super) fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARGS) as u8
    }
}

// ===== Prefix parselets =====

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(c: &mut Compiler, _can_assign: bool) {
    match c.parser.previous.lexeme.parse::<f64>() {
        Ok(value) => c.emit_constant(Value::Number(value)),
        Err(_) => c.error("Invalid number literal."),
    }
}

fn string(c: &mut Compiler, _can_assign: bool) {
    let lexeme = c.parser.previous.lexeme;
    let contents = &lexeme[1..lexeme.len() - 1];
    let handle = c.heap.intern(contents);
    c.emit_constant(Value::Obj(handle));
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.parser.previous.kind {
        TokenKind::False => c.emit_op(OpCode::False),
        TokenKind::True => c.emit_op(OpCode::True),
        TokenKind::Nil => c.emit_op(OpCode::Nil),
        _ => unreachable!("literal parselet on non-literal token"),
    }
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.parser.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Minus => c.emit_op(OpCode::Negate),
        TokenKind::Bang => c.emit_op(OpCode::Not),
        _ => unreachable!("unary parselet on non-unary token"),
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.parser.previous;
    c.named_variable(name, can_assign);
}

fn this_(c: &mut Compiler, _can_assign: bool) {
    if c.class_compilers.is_empty() {
        c.error("Can't use 'this' outside of a class.");
        return;
    }
    c.named_variable(Token::synthetic("this"), false);
}

fn super_(c: &mut Compiler, _can_assign: bool) {
    match c.class_compilers.last() {
        None => c.error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            c.error("Can't use 'super' in a class with no superclass.");
        }
        Some(_) => {}
    }

    c.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    c.consume(TokenKind::Identifier, "Expect superclass method name.");
    let token = c.parser.previous;
    let name = c.identifier_constant(token);

    c.named_variable(Token::synthetic("this"), false);
    if c.matches(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.named_variable(Token::synthetic("super"), false);
        c.emit_ops(OpCode::SuperInvoke, name);
        c.emit_byte(argc);
    } else {
        c.named_variable(Token::synthetic("super"), false);
        c.emit_ops(OpCode::GetSuper, name);
    }
}

/// `[e1, e2, …]`: push an empty array, the elements, then a counted append
fn array_literal(c: &mut Compiler, _can_assign: bool) {
    c.emit_op(OpCode::ArrayEmpty);
    let mut count: usize = 0;
    if !c.check(TokenKind::RightBracket) {
        loop {
            c.expression();
            count += 1;
            if !c.matches(TokenKind::Comma) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
    if count > 0 {
        c.emit_constant(Value::Number(count as f64));
        c.emit_op(OpCode::ArrayPush);
    }
}

// ===== Infix parselets =====

fn binary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.parser.previous.kind;
    c.parse_precedence(rule_for(operator).precedence.next());
    match operator {
        TokenKind::Plus => c.emit_op(OpCode::Add),
        TokenKind::Minus => c.emit_op(OpCode::Subtract),
        TokenKind::Star => c.emit_op(OpCode::Multiply),
        TokenKind::Slash => c.emit_op(OpCode::Divide),
        TokenKind::EqualEqual => c.emit_op(OpCode::Equal),
        TokenKind::BangEqual => {
            c.emit_op(OpCode::Equal);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Greater => c.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => {
            c.emit_op(OpCode::Less);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Less => c.emit_op(OpCode::Less),
        TokenKind::LessEqual => {
            c.emit_op(OpCode::Greater);
            c.emit_op(OpCode::Not);
        }
        _ => unreachable!("binary parselet on non-binary token"),
    }
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let argc = c.argument_list();
    c.emit_ops(OpCode::Call, argc);
}

fn dot(c: &mut Compiler, can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let token = c.parser.previous;
    let name = c.identifier_constant(token);

    if can_assign && c.matches(TokenKind::Equal) {
        c.expression();
        c.emit_ops(OpCode::SetProperty, name);
    } else if c.matches(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.emit_ops(OpCode::Invoke, name);
        c.emit_byte(argc);
    } else {
        c.emit_ops(OpCode::GetProperty, name);
    }
}

/// `a[i]`, `a[i] = v`, and the slice forms `a[i:j]`, `a[:j]`, `a[i:]`
fn index(c: &mut Compiler, can_assign: bool) {
    if c.matches(TokenKind::Colon) {
        c.emit_op(OpCode::Nil);
        slice_end(c);
        return;
    }

    c.expression();
    if c.matches(TokenKind::Colon) {
        slice_end(c);
        return;
    }

    c.consume(TokenKind::RightBracket, "Expect ']' after index.");
    if can_assign && c.matches(TokenKind::Equal) {
        c.expression();
        c.emit_op(OpCode::SetIndex);
    } else {
        c.emit_op(OpCode::GetIndex);
    }
}

/// Parse the end bound of a slice (nil when omitted) and emit the range op
fn slice_end(c: &mut Compiler) {
    if c.check(TokenKind::RightBracket) {
        c.emit_op(OpCode::Nil);
    } else {
        c.expression();
    }
    c.consume(TokenKind::RightBracket, "Expect ']' after slice.");
    c.emit_op(OpCode::ArrayRange);
}

fn and_op(c: &mut Compiler, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(end_jump);
}

fn or_op(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(end_jump);
}

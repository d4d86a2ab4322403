//! Passe unique : Pratt parser qui écrit le bytecode directement dans le
//! chunk de la fonction en cours, sans jamais matérialiser d'AST.
//!
//! Le compilateur est piloté entièrement par [`get_rule`], une table
//! `TokenKind -> ParseRule` assemblée une fois par appel (elle ne capture
//! rien : ce sont des pointeurs de fonction, pas des fermetures).

use std::rc::Rc;

use lumen_core::{intern_string, Heap, LFunction, Obj, OpCode, Table, Value};

use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Échelle de précédence Pratt, du plus faible au plus fort. L'ordre de
/// déclaration porte l'ordre total : `derive(PartialOrd, Ord)` en tire parti
/// directement, sans table de priorité séparée.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
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

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
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
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        Minus => ParseRule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => ParseRule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        BangEqual => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => ParseRule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
        String => ParseRule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None },
        Number => ParseRule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None },
        And => ParseRule { prefix: None, infix: Some(Compiler::and_), precedence: Precedence::And },
        Or => ParseRule { prefix: None, infix: Some(Compiler::or_), precedence: Precedence::Or },
        False | Nil | True => ParseRule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        _ => ParseRule { prefix: None, infix: None, precedence: Precedence::None },
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

enum Resolved {
    Found(u8),
    Uninitialized,
    NotFound,
}

/// Un contexte de compilation par fonction en cours d'émission ; le script
/// top-level compte comme la fonction englobante la plus externe.
struct FunctionScope<'src> {
    enclosing: Option<Box<FunctionScope<'src>>>,
    function: LFunction,
    #[allow(dead_code)]
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(kind: FunctionKind, name: Option<Rc<lumen_core::LString>>) -> Self {
        Self {
            enclosing: None,
            function: LFunction::new(name),
            kind,
            locals: vec![Local { name: "", depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Cherche `name` parmi les locales de *ce* contexte seulement, du plus
    /// récemment déclaré au plus ancien.
    fn resolve_local(&self, name: &str) -> Resolved {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                return if local.depth == -1 { Resolved::Uninitialized } else { Resolved::Found(i as u8) };
            }
        }
        Resolved::NotFound
    }

    /// Résout `name` comme upvalue en remontant la chaîne `enclosing`,
    /// propageant `is_captured` et ajoutant une entrée d'upvalue dans chaque
    /// contexte intermédiaire traversé.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let enclosing = match self.enclosing.as_deref_mut() {
            Some(e) => e,
            None => return Ok(None),
        };
        match enclosing.resolve_local(name) {
            Resolved::Found(slot) => {
                enclosing.locals[slot as usize].is_captured = true;
                return Ok(Some(self.add_upvalue(slot, true)?));
            }
            Resolved::Uninitialized => {
                return Err("Can't read local variable in its own initializer.");
            }
            Resolved::NotFound => {}
        }
        match enclosing.resolve_upvalue(name)? {
            Some(upvalue) => Ok(Some(self.add_upvalue(upvalue, false)?)),
            None => Ok(None),
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, uv) in self.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(UpvalueDesc { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// État complet du compilateur pendant une compilation.
struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    scope: Box<FunctionScope<'src>>,
    heap: &'h mut Heap,
    strings: &'h mut Table,
    errors: Vec<String>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, strings: &'h mut Table) -> Self {
        let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self {
            scanner: Scanner::new(source),
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            scope: Box::new(FunctionScope::new(FunctionKind::Script, None)),
            heap,
            strings,
            errors: Vec::new(),
        }
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // -- diagnostics --------------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let mut rendered = format!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => rendered.push_str(" at end"),
            TokenKind::Error => {}
            _ => rendered.push_str(&format!(" at '{}'", token.lexeme)),
        }
        rendered.push_str(&format!(": {message}"));
        self.errors.push(rendered);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- bytecode emission --------------------------------------------------

    fn current_chunk_len(&self) -> usize {
        self.scope.function.chunk.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.scope.function.chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.as_u8());
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.scope.function.chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.scope.function.chunk.patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn intern_bytes(&mut self, bytes: &[u8]) -> Rc<lumen_core::LString> {
        intern_string(self.heap, self.strings, bytes)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let rc = self.intern_bytes(name.as_bytes());
        self.make_constant(Value::Obj(Obj::String(rc)))
    }

    // -- scopes and variables -------------------------------------------------

    fn begin_scope(&mut self) {
        self.scope.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope.scope_depth -= 1;
        let depth = self.scope.scope_depth;
        while let Some(local) = self.scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.scope.locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.scope.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = self.scope.scope_depth;
        let mut redeclared = false;
        for local in self.scope.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                redeclared = true;
                break;
            }
        }
        if redeclared {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.scope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.scope.scope_depth == 0 {
            return;
        }
        let depth = self.scope.scope_depth;
        if let Some(local) = self.scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.scope.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let get_op;
        let set_op;
        let arg: u8;
        match self.scope.resolve_local(name) {
            Resolved::Found(slot) => {
                get_op = OpCode::GetLocal;
                set_op = OpCode::SetLocal;
                arg = slot;
            }
            Resolved::Uninitialized => {
                self.error("Can't read local variable in its own initializer.");
                get_op = OpCode::GetLocal;
                set_op = OpCode::SetLocal;
                arg = 0;
            }
            Resolved::NotFound => match self.scope.resolve_upvalue(name) {
                Ok(Some(slot)) => {
                    get_op = OpCode::GetUpvalue;
                    set_op = OpCode::SetUpvalue;
                    arg = slot;
                }
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    get_op = OpCode::GetGlobal;
                    set_op = OpCode::SetGlobal;
                    arg = constant;
                }
                Err(message) => {
                    self.error(message);
                    get_op = OpCode::GetGlobal;
                    set_op = OpCode::SetGlobal;
                    arg = 0;
                }
            },
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // -- expressions ----------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_rule = get_rule(self.previous.kind).prefix;
        let prefix_rule = match prefix_rule {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix_rule = get_rule(self.previous.kind)
                .infix
                .expect("token with an infix precedence must have an infix handler");
            infix_rule(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only emits well-formed numerals");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let bytes = &lexeme.as_bytes()[1..lexeme.len() - 1];
        let rc = self.intern_bytes(bytes);
        self.emit_constant(Value::Obj(Obj::String(rc)));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal() only ever runs for false/nil/true tokens"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only ever runs for -/! tokens"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = get_rule(op_kind);
        self.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() only ever runs for known binary operator tokens"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    // -- statements -------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = if kind == FunctionKind::Function {
            Some(self.intern_bytes(self.previous.lexeme.as_bytes()))
        } else {
            None
        };
        let new_scope = Box::new(FunctionScope::new(kind, name));
        let previous_scope = std::mem::replace(&mut self.scope, new_scope);
        self.scope.enclosing = Some(previous_scope);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.scope.function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.scope.function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let upvalue_count = function.upvalue_count;
        debug_assert_eq!(upvalue_count, upvalues.len());
        let rc = Rc::new(function);
        self.heap.track(Obj::Function(rc.clone()));
        let idx = self.make_constant(Value::Obj(Obj::Function(rc)));
        self.emit_op(OpCode::MakeClosure);
        self.emit_byte(idx);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    /// Clôt le contexte courant : termine son chunk et restaure le contexte
    /// englobant, en renvoyant la fonction finie et ses descripteurs d'upvalue.
    fn end_function(&mut self) -> (LFunction, Vec<UpvalueDesc>) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
        let enclosing =
            self.scope.enclosing.take().expect("end_function is only called on a pushed function scope");
        let finished = std::mem::replace(&mut self.scope, enclosing);
        let FunctionScope { function, upvalues, .. } = *finished;
        (function, upvalues)
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
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
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            self.emit_op(OpCode::Nil);
            self.emit_op(OpCode::Return);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

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
        let loop_start = self.current_chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer clause.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }
}

/// Compile `source` en une fonction top-level prête à être enveloppée dans
/// une fermeture par la VM.
///
/// `heap` et `strings` sont ceux de la VM qui exécutera le résultat : les
/// chaînes internées par le compilateur (identifiants, littéraux) doivent
/// être les mêmes objets que ceux que la VM retrouvera en résolvant les
/// globales par nom.
pub fn compile(source: &str, heap: &mut Heap, strings: &mut Table) -> Result<Rc<LFunction>, Vec<String>> {
    #[cfg(feature = "tracing")]
    tracing::trace!(bytes = source.len(), "compiling source");
    let mut compiler = Compiler::new(source, heap, strings);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_op(OpCode::Nil);
    compiler.emit_op(OpCode::Return);

    if compiler.had_error {
        return Err(compiler.errors);
    }

    let FunctionScope { function, .. } = *compiler.scope;
    let rc = Rc::new(function);
    compiler.heap.track(Obj::Function(rc.clone()));
    Ok(rc)
}

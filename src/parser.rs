//! Parser and semantic analyzer for Evy
//!
//! This is a recursive descent parser that performs all semantic checks
//! inline and produces a fully typed AST. It checks declarations and
//! scoping, argument counts and types, late composite-literal typing with
//! implicit `any` boxing, reachability (unreachable code, missing
//! returns) and unused variables.
//!
//! Errors accumulate; the parser resynchronizes at the next line end or
//! block terminator rather than aborting, so one pass reports several
//! problems.
//!
//! Evy's grammar is whitespace sensitive in two places. Command-style
//! calls (`print a b`) take space-separated arguments, so inside an
//! argument a binary operator only binds when it touches its left operand
//! (`y-10` is one argument, `0 -1` is two). And postfix `[`/`.` bind only
//! when adjacent to the expression, which distinguishes `f a[1]` (indexed
//! argument) from `f a [1]` (two arguments).

use crate::ast::*;
use crate::builtins::{Builtins, FuncSig};
use crate::lexer::Lexer;
use crate::span::Position;
use crate::token::{Token, TokenKind};
use crate::types::Type;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// A single parse error with its source position
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{pos}: {message}")]
pub struct ParseError {
    pub message: String,
    pub pos: Position,
}

/// All errors accumulated over a parse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseErrors(pub Vec<ParseError>);

impl ParseErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The first `n` errors, for truncated reporting
    pub fn truncate(&self, n: usize) -> ParseErrors {
        ParseErrors(self.0.iter().take(n).cloned().collect())
    }
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in &self.0 {
            writeln!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseErrors {}

/// Parse a program, returning the accumulated errors if there are any
pub fn parse(source: &str, builtins: Builtins) -> Result<Program, ParseErrors> {
    let mut parser = Parser::new(source, builtins);
    let program = parser.parse();
    let errors = parser.errors();
    if errors.is_empty() {
        Ok(program)
    } else {
        Err(errors)
    }
}

struct VarInfo {
    ty: Type,
    pos: Position,
    used: bool,
    builtin: bool,
}

/// One lexical scope frame; order of declaration is kept for error reporting
#[derive(Default)]
struct ScopeFrame {
    vars: HashMap<String, VarInfo>,
    order: Vec<String>,
}

/// The parser for Evy
pub struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
    builtins: Builtins,
    /// User function signatures collected by the pre-scan, so calls may
    /// appear before definitions
    func_sigs: HashMap<String, FuncSig>,
    funcs: HashMap<String, Rc<FuncDef>>,
    event_handlers: HashMap<String, Rc<EventHandler>>,
    called_builtins: Vec<String>,
    scopes: Vec<ScopeFrame>,
    loop_depth: usize,
    /// Return type of the function currently being parsed; `None` at top
    /// level
    func_ret: Option<Type>,
    in_event_handler: bool,
}

type PResult<T> = Result<T, ()>;

impl<'src> Parser<'src> {
    pub fn new(source: &'src str, builtins: Builtins) -> Self {
        let (tokens, lex_errors) = Lexer::new(source).tokenize();
        let errors = lex_errors
            .into_iter()
            .map(|e| match e {
                crate::lexer::LexError::UnexpectedChar { ch, pos } => ParseError {
                    message: format!("unexpected character {:?}", ch),
                    pos,
                },
                crate::lexer::LexError::UnterminatedString { pos } => ParseError {
                    message: "unterminated string".to_string(),
                    pos,
                },
            })
            .collect();
        Self {
            source,
            tokens,
            pos: 0,
            errors,
            builtins,
            func_sigs: HashMap::new(),
            funcs: HashMap::new(),
            event_handlers: HashMap::new(),
            called_builtins: Vec::new(),
            scopes: Vec::new(),
            loop_depth: 0,
            func_ret: None,
            in_event_handler: false,
        }
    }

    pub fn errors(&self) -> ParseErrors {
        ParseErrors(self.errors.clone())
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Parse the whole program
    pub fn parse(&mut self) -> Program {
        self.scan_func_sigs();
        self.push_scope();
        for (name, ty) in self.builtins.globals.clone() {
            self.declare_builtin_global(name, ty);
        }
        let statements = self.parse_statements(&[]);
        self.pop_scope();
        Program {
            statements,
            funcs: std::mem::take(&mut self.funcs),
            event_handlers: std::mem::take(&mut self.event_handlers),
            called_builtins: std::mem::take(&mut self.called_builtins),
        }
    }

    // ============ Token access ============

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_kind(&self) -> TokenKind {
        self.cur().kind
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.cur_kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn text(&self, token: &Token) -> &'src str {
        token.text(self.source)
    }

    fn cur_desc(&self) -> String {
        self.cur().describe(self.source)
    }

    /// Is the current token adjacent to the previous one (no whitespace)?
    fn adjacent(&self) -> bool {
        self.pos > 0 && self.tokens[self.pos - 1].span.end == self.cur().span.start
    }

    fn error(&mut self, pos: Position, message: impl Into<String>) {
        self.errors.push(ParseError {
            message: message.into(),
            pos,
        });
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            let msg = format!("expected {}, got {}", what, self.cur_desc());
            self.error(self.cur().pos, msg);
            Err(())
        }
    }

    /// Consume an optional trailing comment, then the statement-ending
    /// newline
    fn end_of_line(&mut self) -> PResult<()> {
        if self.at(TokenKind::Comment) {
            self.advance();
        }
        match self.cur_kind() {
            TokenKind::NewLine => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => {
                let msg = format!("expected end of line, found {}", self.cur_desc());
                self.error(self.cur().pos, msg);
                Err(())
            }
        }
    }

    /// Skip to the next line or block boundary after an error
    fn synchronize(&mut self) {
        loop {
            match self.cur_kind() {
                TokenKind::Eof | TokenKind::End | TokenKind::Else => return,
                TokenKind::NewLine => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ============ Scopes ============

    fn push_scope(&mut self) {
        self.scopes.push(ScopeFrame::default());
    }

    fn pop_scope(&mut self) {
        if let Some(frame) = self.scopes.pop() {
            for name in &frame.order {
                if let Some(info) = frame.vars.get(name) {
                    if !info.used && !info.builtin {
                        self.error(info.pos, format!("{:?} declared but not used", name));
                    }
                }
            }
        }
    }

    fn declare_builtin_global(&mut self, name: String, ty: Type) {
        if let Some(frame) = self.scopes.last_mut() {
            frame.order.push(name.clone());
            frame.vars.insert(
                name,
                VarInfo {
                    ty,
                    pos: Position::default(),
                    used: true,
                    builtin: true,
                },
            );
        }
    }

    fn is_func_name(&self, name: &str) -> bool {
        self.func_sigs.contains_key(name) || self.builtins.funcs.contains_key(name)
    }

    fn is_builtin_global(&self, name: &str) -> bool {
        self.builtins.globals.iter().any(|(n, _)| n == name)
    }

    /// Declare a variable in the innermost scope, reporting name clashes.
    /// `mark_used` exempts parameters from the unused-variable check.
    fn declare_var(&mut self, name: &str, ty: Type, pos: Position, mark_used: bool) {
        if self.is_builtin_global(name) {
            self.error(pos, format!("redeclaration of builtin variable {:?}", name));
            return;
        }
        if self.is_func_name(name) {
            self.error(
                pos,
                format!("invalid declaration of {:?}, already used as function name", name),
            );
            return;
        }
        let frame = match self.scopes.last_mut() {
            Some(frame) => frame,
            None => return,
        };
        if frame.vars.contains_key(name) {
            self.error(pos, format!("redeclaration of {:?}", name));
            return;
        }
        frame.order.push(name.to_string());
        frame.vars.insert(
            name.to_string(),
            VarInfo {
                ty,
                pos,
                used: mark_used,
                builtin: false,
            },
        );
    }

    /// Look a variable up through the scope chain, marking it as read
    fn lookup_var(&mut self, name: &str) -> Option<Type> {
        for frame in self.scopes.iter_mut().rev() {
            if let Some(info) = frame.vars.get_mut(name) {
                info.used = true;
                return Some(info.ty.clone());
            }
        }
        None
    }

    /// Look a variable up without marking it as read (assignment targets)
    fn lookup_var_no_use(&self, name: &str) -> Option<Type> {
        for frame in self.scopes.iter().rev() {
            if let Some(info) = frame.vars.get(name) {
                return Some(info.ty.clone());
            }
        }
        None
    }

    // ============ Function signature pre-scan ============

    /// Collect user function signatures before the main pass so calls can
    /// precede definitions. Malformed signatures are ignored here; the
    /// main pass reports them.
    fn scan_func_sigs(&mut self) {
        let mut i = 0;
        while i < self.tokens.len() {
            let at_line_start = i == 0 || self.tokens[i - 1].kind == TokenKind::NewLine;
            if !at_line_start || self.tokens[i].kind != TokenKind::Func {
                i += 1;
                continue;
            }
            i += 1;
            if self.token_kind_at(i) != TokenKind::Ident {
                continue;
            }
            let name = self.text(&self.tokens[i]).to_string();
            i += 1;
            let mut sig = FuncSig {
                params: vec![],
                variadic: None,
                return_type: Type::None,
                optional_params: 0,
            };
            if self.token_kind_at(i) == TokenKind::Colon {
                if let Some((ty, next)) = self.scan_type(i + 1) {
                    sig.return_type = ty;
                    i = next;
                }
            }
            while self.token_kind_at(i) == TokenKind::Ident {
                if self.token_kind_at(i + 1) != TokenKind::Colon {
                    break;
                }
                let Some((ty, next)) = self.scan_type(i + 2) else {
                    break;
                };
                i = next;
                if self.token_kind_at(i) == TokenKind::DotDotDot {
                    i += 1;
                    sig.variadic = Some(ty);
                } else {
                    sig.params.push(ty);
                }
            }
            self.func_sigs.entry(name).or_insert(sig);
        }
    }

    fn token_kind_at(&self, i: usize) -> TokenKind {
        self.tokens.get(i).map(|t| t.kind).unwrap_or(TokenKind::Eof)
    }

    /// Index-based type scan used by the signature pre-scan
    fn scan_type(&self, i: usize) -> Option<(Type, usize)> {
        match self.token_kind_at(i) {
            TokenKind::Num => Some((Type::Num, i + 1)),
            TokenKind::String => Some((Type::String, i + 1)),
            TokenKind::Bool => Some((Type::Bool, i + 1)),
            TokenKind::Any => Some((Type::Any, i + 1)),
            TokenKind::LBracket if self.token_kind_at(i + 1) == TokenKind::RBracket => {
                let (sub, next) = self.scan_type(i + 2)?;
                Some((Type::array(sub), next))
            }
            TokenKind::LBrace if self.token_kind_at(i + 1) == TokenKind::RBrace => {
                let (sub, next) = self.scan_type(i + 2)?;
                Some((Type::map(sub), next))
            }
            _ => None,
        }
    }

    // ============ Statements ============

    fn parse_statements(&mut self, terminators: &[TokenKind]) -> Vec<Stmt> {
        let mut statements = Vec::new();
        let mut terminated = false;
        let mut unreachable_reported = false;
        while !self.at(TokenKind::Eof) && !terminators.contains(&self.cur_kind()) {
            let before = self.pos;
            match self.parse_statement() {
                Ok(stmt) => {
                    let is_empty = matches!(stmt.kind, StmtKind::Empty);
                    if terminated && !is_empty && !unreachable_reported {
                        self.error(stmt.pos, "unreachable code");
                        unreachable_reported = true;
                    }
                    if stmt_terminates(&stmt) {
                        terminated = true;
                    }
                    statements.push(stmt);
                }
                Err(()) => self.synchronize(),
            }
            if self.pos == before {
                // ensure progress even on a stuck error
                self.advance();
            }
        }
        statements
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let pos = self.cur().pos;
        match self.cur_kind() {
            TokenKind::NewLine => {
                self.advance();
                Ok(Stmt { kind: StmtKind::Empty, pos })
            }
            TokenKind::Comment => {
                self.advance();
                if self.at(TokenKind::NewLine) {
                    self.advance();
                }
                Ok(Stmt { kind: StmtKind::Empty, pos })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Func => self.parse_func_def(),
            TokenKind::On => self.parse_event_handler(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => self.parse_break(),
            TokenKind::Ident => self.parse_ident_statement(),
            _ => {
                let msg = format!("unexpected input {}", self.cur_desc());
                self.error(pos, msg);
                Err(())
            }
        }
    }

    fn parse_ident_statement(&mut self) -> PResult<Stmt> {
        let name_tok = self.cur().clone();
        let name = self.text(&name_tok).to_string();
        let pos = name_tok.pos;

        if name == "_" {
            match self.peek_kind() {
                TokenKind::Declare | TokenKind::Colon => {
                    self.error(pos, "declaration of anonymous variable \"_\" not allowed here");
                }
                _ => {
                    self.error(pos, "anonymous variable \"_\" cannot be read");
                }
            }
            return Err(());
        }

        match self.peek_kind() {
            TokenKind::Declare => self.parse_inferred_decl(),
            TokenKind::Colon => self.parse_typed_decl(),
            _ => {
                if self.is_func_name(&name) {
                    if self.peek_kind() == TokenKind::Eq {
                        self.error(
                            pos,
                            format!("cannot assign to {:?} as it is a function not a variable", name),
                        );
                        return Err(());
                    }
                    return self.parse_call_statement();
                }
                if self.lookup_var_no_use(&name).is_some() {
                    return self.parse_assignment();
                }
                match self.peek_kind() {
                    TokenKind::Eq | TokenKind::LBracket | TokenKind::Dot => {
                        self.error(pos, format!("unknown variable name {:?}", name));
                    }
                    _ => {
                        self.error(pos, format!("unknown function {:?}", name));
                    }
                }
                Err(())
            }
        }
    }

    fn parse_inferred_decl(&mut self) -> PResult<Stmt> {
        let name_tok = self.advance();
        let name = self.text(&name_tok).to_string();
        let pos = name_tok.pos;
        self.advance(); // :=
        let value = self.parse_toplevel_expr()?;
        if value.ty == Type::None {
            let msg = match &value.kind {
                ExprKind::Call(call) => format!(
                    "invalid declaration, function {:?} has no return value",
                    call.name
                ),
                _ => "invalid declaration of value with no type".to_string(),
            };
            self.error(self.cur().pos, msg);
            return Err(());
        }
        self.declare_var(&name, value.ty.clone(), pos, false);
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::InferredDecl { name, value },
            pos,
        })
    }

    fn parse_typed_decl(&mut self) -> PResult<Stmt> {
        let name_tok = self.advance();
        let name = self.text(&name_tok).to_string();
        let pos = name_tok.pos;
        self.advance(); // :
        let Ok(ty) = self.parse_type() else {
            self.error(pos, format!("invalid type declaration for {:?}", name));
            return Err(());
        };
        self.declare_var(&name, ty.clone(), pos, false);
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::TypedDecl { name, ty },
            pos,
        })
    }

    /// Parse a type: `num`, `string`, `bool`, `any`, `[]T`, `{}T`.
    /// Fails silently; callers attach the error message.
    fn parse_type(&mut self) -> PResult<Type> {
        match self.cur_kind() {
            TokenKind::Num => {
                self.advance();
                Ok(Type::Num)
            }
            TokenKind::String => {
                self.advance();
                Ok(Type::String)
            }
            TokenKind::Bool => {
                self.advance();
                Ok(Type::Bool)
            }
            TokenKind::Any => {
                self.advance();
                Ok(Type::Any)
            }
            TokenKind::LBracket => {
                self.advance();
                if !self.at(TokenKind::RBracket) {
                    return Err(());
                }
                self.advance();
                Ok(Type::array(self.parse_type()?))
            }
            TokenKind::LBrace => {
                self.advance();
                if !self.at(TokenKind::RBrace) {
                    return Err(());
                }
                self.advance();
                Ok(Type::map(self.parse_type()?))
            }
            _ => Err(()),
        }
    }

    fn parse_assignment(&mut self) -> PResult<Stmt> {
        let pos = self.cur().pos;
        let root_name = self.text(self.cur()).to_string();
        let target = self.parse_assign_target()?;
        self.expect(TokenKind::Eq, "\"=\"")?;
        let value = self.parse_toplevel_expr()?;
        let value = match self.try_wrap(&target.ty, &value) {
            Some(wrapped) => wrapped,
            None => {
                self.error(
                    pos,
                    format!(
                        "{:?} accepts values of type {}, found {}",
                        root_name, target.ty, value.ty
                    ),
                );
                value
            }
        };
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::Assign { target, value },
            pos,
        })
    }

    fn parse_assign_target(&mut self) -> PResult<Expr> {
        let name_tok = self.advance();
        let name = self.text(&name_tok).to_string();
        let pos = name_tok.pos;
        if self.is_builtin_global(&name) {
            self.error(pos, format!("cannot assign to builtin variable {:?}", name));
            return Err(());
        }
        let ty = match self.lookup_var_no_use(&name) {
            Some(ty) => ty,
            None => {
                self.error(pos, format!("unknown variable name {:?}", name));
                return Err(());
            }
        };
        let mut target = Expr::new(ExprKind::Var(name.clone()), ty, pos);
        if self.at(TokenKind::LBracket) || self.at(TokenKind::Dot) {
            // indexed assignment reads the container
            self.lookup_var(&name);
            target = self.parse_postfix_ops(target)?;
        }
        Ok(target)
    }

    fn parse_call_statement(&mut self) -> PResult<Stmt> {
        let name_tok = self.advance();
        let name = self.text(&name_tok).to_string();
        let pos = name_tok.pos;
        let args = self.parse_call_args(&[])?;
        let call = self.check_call(&name, pos, args);
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::FuncCall(call),
            pos,
        })
    }

    fn parse_return(&mut self) -> PResult<Stmt> {
        let pos = self.advance().pos;
        let value = match self.cur_kind() {
            TokenKind::NewLine | TokenKind::Eof | TokenKind::Comment => None,
            _ => Some(self.parse_toplevel_expr()?),
        };
        let value = match self.func_ret.clone() {
            None => {
                let err_pos = value.as_ref().map(|v| v.pos).unwrap_or(pos);
                self.error(err_pos, "return statement not allowed here");
                value
            }
            Some(ret) => match (&ret, value) {
                (Type::None, Some(v)) => {
                    self.error(v.pos, format!("expected no return value, found {}", v.ty));
                    Some(v)
                }
                (Type::None, None) => None,
                (_, None) => {
                    self.error(pos, format!("expected return value of type {}, found none", ret));
                    None
                }
                (_, Some(v)) => match self.try_wrap(&ret, &v) {
                    Some(wrapped) => Some(wrapped),
                    None => {
                        self.error(
                            v.pos,
                            format!("expected return value of type {}, found {}", ret, v.ty),
                        );
                        Some(v)
                    }
                },
            },
        };
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::Return { value },
            pos,
        })
    }

    fn parse_break(&mut self) -> PResult<Stmt> {
        let pos = self.advance().pos;
        if self.loop_depth == 0 {
            self.error(pos, "break is not in a loop");
            return Err(());
        }
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::Break,
            pos,
        })
    }

    fn parse_cond(&mut self) -> PResult<Expr> {
        let cond = self.parse_toplevel_expr()?;
        if cond.ty != Type::Bool {
            self.error(
                cond.pos,
                format!("expected condition of type bool, found {}", cond.ty),
            );
        }
        Ok(cond)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let pos = self.advance().pos;
        let cond = self.parse_cond()?;
        self.end_of_line()?;
        let block = self.parse_block(&[TokenKind::Else, TokenKind::End]);
        let mut blocks = vec![CondBlock { cond, block }];
        let mut else_block = None;
        while self.at(TokenKind::Else) {
            self.advance();
            if self.at(TokenKind::If) {
                self.advance();
                let cond = self.parse_cond()?;
                self.end_of_line()?;
                let block = self.parse_block(&[TokenKind::Else, TokenKind::End]);
                blocks.push(CondBlock { cond, block });
            } else {
                self.end_of_line()?;
                else_block = Some(self.parse_block(&[TokenKind::End]));
                break;
            }
        }
        self.expect(TokenKind::End, "\"end\"")?;
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::If { blocks, else_block },
            pos,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let pos = self.advance().pos;
        let cond = self.parse_cond()?;
        self.end_of_line()?;
        self.loop_depth += 1;
        let block = self.parse_block(&[TokenKind::End]);
        self.loop_depth -= 1;
        self.expect(TokenKind::End, "\"end\"")?;
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::While(CondBlock { cond, block }),
            pos,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let pos = self.advance().pos;
        let mut loop_var = None;
        let mut loop_var_pos = Position::default();
        if self.at(TokenKind::Ident) {
            let name_tok = self.advance();
            let name = self.text(&name_tok).to_string();
            loop_var_pos = name_tok.pos;
            if name == "_" {
                self.error(
                    loop_var_pos,
                    "declaration of anonymous variable \"_\" not allowed here",
                );
                return Err(());
            }
            self.expect(TokenKind::Declare, "\":=\"")?;
            loop_var = Some(name);
        }
        let range_tok = self.expect(TokenKind::Range, "\"range\"")?;
        let args = self.parse_call_args(&[])?;
        let range = self.check_range_args(args, range_tok.pos)?;
        let loop_var_ty = match &range {
            ForRange::Step { .. } => Type::Num,
            ForRange::Iter { iterable } => match &iterable.ty {
                Type::String => Type::String,
                Type::Map(_) => Type::String,
                Type::Array(sub) if **sub == Type::None => Type::Any,
                Type::Array(sub) => (**sub).clone(),
                _ => Type::Any,
            },
        };
        self.end_of_line()?;

        self.push_scope();
        if let Some(name) = &loop_var {
            self.declare_var(&name.clone(), loop_var_ty, loop_var_pos, true);
        }
        self.loop_depth += 1;
        let statements = self.parse_statements(&[TokenKind::End]);
        self.loop_depth -= 1;
        if statements.iter().all(|s| matches!(s.kind, StmtKind::Empty)) {
            self.error(self.cur().pos, "at least one statement is required here");
        }
        self.pop_scope();
        self.expect(TokenKind::End, "\"end\"")?;
        self.end_of_line()?;
        Ok(Stmt {
            kind: StmtKind::For {
                loop_var,
                range,
                block: Block { statements },
            },
            pos,
        })
    }

    fn check_range_args(&mut self, args: Vec<Expr>, range_pos: Position) -> PResult<ForRange> {
        if args.is_empty() {
            let msg = format!("unexpected {}", self.cur_desc());
            self.error(self.cur().pos, msg);
            return Err(());
        }
        if args.len() == 1 {
            let arg = args.into_iter().next().ok_or(())?;
            return match &arg.ty {
                Type::Num => Ok(ForRange::Step {
                    start: None,
                    stop: arg,
                    step: None,
                }),
                Type::String | Type::Array(_) | Type::Map(_) => {
                    Ok(ForRange::Iter { iterable: arg })
                }
                other => {
                    let msg = format!(
                        "expected num, string, array or map after range, found {}",
                        other
                    );
                    self.error(self.cur().pos, msg);
                    Err(())
                }
            };
        }
        if args.len() > 3 {
            self.error(
                range_pos,
                format!("range can take up to 3 num arguments, found {}", args.len()),
            );
            return Err(());
        }
        for (i, arg) in args.iter().enumerate() {
            if arg.ty != Type::Num {
                self.error(
                    range_pos,
                    format!(
                        "range expects num type for {} argument, found {}",
                        ordinal(i + 1),
                        arg.ty
                    ),
                );
                return Err(());
            }
        }
        let mut args = args.into_iter();
        let start = args.next().ok_or(())?;
        let stop = args.next().ok_or(())?;
        Ok(ForRange::Step {
            start: Some(start),
            stop,
            step: args.next(),
        })
    }

    /// Parse a block with its own scope, requiring at least one real
    /// statement
    fn parse_block(&mut self, terminators: &[TokenKind]) -> Block {
        self.push_scope();
        let statements = self.parse_statements(terminators);
        if statements.iter().all(|s| matches!(s.kind, StmtKind::Empty)) {
            self.error(self.cur().pos, "at least one statement is required here");
        }
        self.pop_scope();
        Block { statements }
    }

    // ============ Function definitions and event handlers ============

    fn parse_func_def(&mut self) -> PResult<Stmt> {
        let func_pos = self.cur().pos;
        if self.scopes.len() > 1 || self.func_ret.is_some() {
            self.error(func_pos, "function definitions are only allowed at the top level");
        }
        self.advance(); // func
        let name_tok = self.expect(TokenKind::Ident, "identifier")?;
        let name = self.text(&name_tok).to_string();

        if self.builtins.funcs.contains_key(&name) {
            self.error(func_pos, format!("cannot override builtin function {:?}", name));
        } else if self.is_builtin_global(&name) {
            self.error(func_pos, format!("cannot override builtin variable {:?}", name));
        } else if self.funcs.contains_key(&name) {
            self.error(func_pos, format!("redeclaration of function {:?}", name));
        }

        let return_type = if self.at(TokenKind::Colon) {
            self.advance();
            match self.parse_type() {
                Ok(ty) => ty,
                Err(()) => {
                    self.error(func_pos, format!("invalid type declaration for {:?}", name));
                    return Err(());
                }
            }
        } else {
            Type::None
        };

        let (params, variadic_param) = self.parse_params(&name, false)?;
        self.end_of_line()?;

        self.push_scope();
        for p in params.iter().chain(variadic_param.iter()) {
            if p.name != "_" {
                let ty = match &variadic_param {
                    Some(v) if v.name == p.name => Type::array(p.ty.clone()),
                    _ => p.ty.clone(),
                };
                let frame = self.scopes.last_mut().ok_or(())?;
                frame.order.push(p.name.clone());
                frame.vars.insert(
                    p.name.clone(),
                    VarInfo {
                        ty,
                        pos: func_pos,
                        used: true,
                        builtin: false,
                    },
                );
            }
        }
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        let saved_ret = self.func_ret.replace(return_type.clone());
        let statements = self.parse_statements(&[TokenKind::End]);
        self.func_ret = saved_ret;
        self.loop_depth = saved_loop_depth;
        self.pop_scope();
        let end_tok = self.expect(TokenKind::End, "\"end\"")?;
        if return_type != Type::None && !block_returns(&statements) {
            self.error(end_tok.pos, "missing return");
        }
        self.end_of_line()?;

        let def = Rc::new(FuncDef {
            name: name.clone(),
            params,
            variadic_param,
            return_type,
            body: Block { statements },
            pos: func_pos,
        });
        if !self.funcs.contains_key(&name) && !self.builtins.funcs.contains_key(&name) {
            self.funcs.insert(name, def.clone());
        }
        Ok(Stmt {
            kind: StmtKind::FuncDef(def),
            pos: func_pos,
        })
    }

    /// Parse `name:type` parameters up to the end of the line. At most one
    /// variadic parameter is allowed, and only on its own. In `strict`
    /// mode (event handlers) anything that is not a parameter is an error.
    fn parse_params(&mut self, func_name: &str, strict: bool) -> PResult<(Vec<Param>, Option<Param>)> {
        let mut params: Vec<Param> = Vec::new();
        let mut variadic: Option<Param> = None;
        let mut seen = std::collections::HashSet::new();
        loop {
            if !self.at(TokenKind::Ident) {
                if strict
                    && !matches!(
                        self.cur_kind(),
                        TokenKind::NewLine | TokenKind::Eof | TokenKind::Comment
                    )
                {
                    self.expect(TokenKind::Ident, "identifier")?;
                }
                break;
            }
            let name_tok = self.advance();
            let p_name = self.text(&name_tok).to_string();
            let p_pos = name_tok.pos;
            if p_name == *func_name || self.is_func_name(&p_name) {
                self.error(
                    p_pos,
                    format!("invalid declaration of {:?}, already used as function name", p_name),
                );
            } else if p_name != "_" && seen.contains(&p_name) {
                self.error(p_pos, format!("redeclaration of {:?}", p_name));
            }
            seen.insert(p_name.clone());
            if !self.at(TokenKind::Colon) {
                self.error(p_pos, format!("invalid type declaration for {:?}", p_name));
                return Err(());
            }
            self.advance();
            let Ok(ty) = self.parse_type() else {
                self.error(p_pos, format!("invalid type declaration for {:?}", p_name));
                return Err(());
            };
            if self.at(TokenKind::DotDotDot) {
                self.advance();
                if !params.is_empty() {
                    self.error(
                        self.cur().pos,
                        "variadic parameter cannot be used with other parameters",
                    );
                }
                variadic = Some(Param { name: p_name, ty });
            } else {
                if variadic.is_some() {
                    self.error(
                        p_pos,
                        "variadic parameter cannot be used with other parameters",
                    );
                }
                params.push(Param { name: p_name, ty });
            }
        }
        Ok((params, variadic))
    }

    fn parse_event_handler(&mut self) -> PResult<Stmt> {
        let on_pos = self.cur().pos;
        if self.scopes.len() > 1 || self.func_ret.is_some() {
            self.error(on_pos, "event handlers are only allowed at the top level");
        }
        self.advance(); // on
        let name_tok = self.expect(TokenKind::Ident, "identifier")?;
        let name = self.text(&name_tok).to_string();
        let event_sig = self.builtins.event_handlers.get(&name).cloned();
        if event_sig.is_none() {
            self.error(name_tok.pos, format!("unknown event name {}", name));
        }

        let (params, variadic) = self.parse_params(&name, true)?;
        if variadic.is_some() {
            self.error(on_pos, "event handlers cannot have variadic parameters");
        }
        self.end_of_line()?;

        // a handler may ignore all event arguments by declaring none
        if let Some(sig) = &event_sig {
            if !params.is_empty() && params.len() != sig.len() {
                self.error(
                    self.cur().pos,
                    format!(
                        "wrong number of parameters expected {}, got {}",
                        sig.len(),
                        params.len()
                    ),
                );
            } else {
                for (param, want) in params.iter().zip(sig.iter()) {
                    if param.ty != want.ty {
                        self.error(
                            on_pos,
                            format!(
                                "event handler {:?} expects parameter of type {}, found {}",
                                name, want.ty, param.ty
                            ),
                        );
                    }
                }
            }
        }

        self.push_scope();
        for p in &params {
            if p.name != "_" {
                let frame = self.scopes.last_mut().ok_or(())?;
                frame.order.push(p.name.clone());
                frame.vars.insert(
                    p.name.clone(),
                    VarInfo {
                        ty: p.ty.clone(),
                        pos: on_pos,
                        used: true,
                        builtin: false,
                    },
                );
            }
        }
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        let saved_ret = self.func_ret.replace(Type::None);
        let saved_handler = std::mem::replace(&mut self.in_event_handler, true);
        let statements = self.parse_statements(&[TokenKind::End]);
        self.in_event_handler = saved_handler;
        self.func_ret = saved_ret;
        self.loop_depth = saved_loop_depth;
        self.pop_scope();
        self.expect(TokenKind::End, "\"end\"")?;
        self.end_of_line()?;

        let handler = Rc::new(EventHandler {
            name: name.clone(),
            params,
            body: Block { statements },
            pos: on_pos,
        });
        if event_sig.is_some() && !self.event_handlers.contains_key(&name) {
            self.event_handlers.insert(name, handler.clone());
        }
        Ok(Stmt {
            kind: StmtKind::EventHandler(handler),
            pos: on_pos,
        })
    }

    // ============ Calls ============

    /// Arguments of a command-style call: tight expressions up to the end
    /// of the line or one of the stop tokens
    fn parse_call_args(&mut self, stop: &[TokenKind]) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        loop {
            match self.cur_kind() {
                TokenKind::NewLine | TokenKind::Eof | TokenKind::Comment => break,
                kind if stop.contains(&kind) => break,
                _ => args.push(self.parse_arg()?),
            }
        }
        Ok(args)
    }

    /// Check arity and argument types against the callee's signature,
    /// inserting `any` wraps where needed
    fn check_call(&mut self, name: &str, pos: Position, args: Vec<Expr>) -> FuncCall {
        let is_user = self.func_sigs.contains_key(name);
        let sig = self
            .func_sigs
            .get(name)
            .or_else(|| self.builtins.funcs.get(name))
            .cloned()
            .unwrap_or(FuncSig {
                params: vec![],
                variadic: None,
                return_type: Type::None,
                optional_params: 0,
            });
        if !is_user && self.builtins.funcs.contains_key(name) {
            if !self.called_builtins.iter().any(|n| n == name) {
                self.called_builtins.push(name.to_string());
            }
        }

        let mut checked = Vec::with_capacity(args.len());
        if let Some(elem) = &sig.variadic {
            for arg in args {
                match self.try_wrap(elem, &arg) {
                    Some(wrapped) => checked.push(wrapped),
                    None => {
                        self.error(
                            arg.pos,
                            format!(
                                "{:?} takes variadic arguments of type {}, found {}",
                                name, elem, arg.ty
                            ),
                        );
                        checked.push(arg);
                    }
                }
            }
        } else {
            let want = sig.params.len();
            let min_want = want - sig.optional_params.min(want);
            if args.len() > want {
                let pos = args[want].pos;
                self.error(pos, count_error(name, want, args.len()));
            } else if args.len() < min_want {
                self.error(self.cur().pos, count_error(name, want, args.len()));
            }
            for (i, arg) in args.into_iter().enumerate() {
                match sig.params.get(i) {
                    Some(want_ty) => match self.try_wrap(want_ty, &arg) {
                        Some(wrapped) => checked.push(wrapped),
                        None => {
                            self.error(
                                arg.pos,
                                format!(
                                    "{:?} takes {} argument of type {}, found {}",
                                    name,
                                    ordinal(i + 1),
                                    want_ty,
                                    arg.ty
                                ),
                            );
                            checked.push(arg);
                        }
                    },
                    None => checked.push(arg),
                }
            }
        }
        FuncCall {
            name: name.to_string(),
            args: checked,
            ret_type: sig.return_type,
            pos,
        }
    }

    // ============ Expressions ============

    /// A declaration/assignment right-hand side, return value or
    /// condition: either a command-style call (`len "abc"`) or a full
    /// expression
    fn parse_toplevel_expr(&mut self) -> PResult<Expr> {
        if self.at(TokenKind::Ident) {
            let name = self.text(self.cur()).to_string();
            if self.is_func_name(&name) {
                let name_tok = self.advance();
                let args = self.parse_call_args(&[])?;
                let call = self.check_call(&name, name_tok.pos, args);
                let ty = call.ret_type.clone();
                return Ok(Expr::new(ExprKind::Call(call), ty, name_tok.pos));
            }
        }
        self.parse_expr()
    }

    /// Full expression grammar with free spacing, used in statement
    /// position and inside brackets
    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while self.at(TokenKind::Or) {
            let op_pos = self.advance().pos;
            let right = self.parse_and()?;
            left = self.new_binary(BinaryOp::Or, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_comparison()?;
        while self.at(TokenKind::And) {
            let op_pos = self.advance().pos;
            let right = self.parse_comparison()?;
            left = self.new_binary(BinaryOp::And, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.cur_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => break,
            };
            let op_pos = self.advance().pos;
            let right = self.parse_term()?;
            left = self.new_binary(op, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.cur_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let op_pos = self.advance().pos;
            let right = self.parse_factor()?;
            left = self.new_binary(op, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.cur_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let op_pos = self.advance().pos;
            let right = self.parse_unary()?;
            left = self.new_binary(op, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match self.cur_kind() {
            TokenKind::Minus => {
                let pos = self.advance().pos;
                let operand = self.parse_unary()?;
                Ok(self.new_unary(UnaryOp::Minus, operand, pos))
            }
            TokenKind::Bang => {
                let pos = self.advance().pos;
                let operand = self.parse_unary()?;
                Ok(self.new_unary(UnaryOp::Not, operand, pos))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix_ops(primary)
            }
        }
    }

    /// One command-call argument: a tight expression where a binary
    /// operator binds only when adjacent to its left operand
    fn parse_arg(&mut self) -> PResult<Expr> {
        let mut left = self.parse_arg_unary()?;
        loop {
            let op = match self.cur_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => break,
            };
            if !self.adjacent() {
                break;
            }
            let op_pos = self.advance().pos;
            let right = self.parse_arg_unary()?;
            left = self.new_binary(op, left, right, op_pos);
        }
        Ok(left)
    }

    fn parse_arg_unary(&mut self) -> PResult<Expr> {
        match self.cur_kind() {
            TokenKind::Minus => {
                let pos = self.advance().pos;
                let operand = self.parse_arg_unary()?;
                Ok(self.new_unary(UnaryOp::Minus, operand, pos))
            }
            TokenKind::Bang => {
                let pos = self.advance().pos;
                let operand = self.parse_arg_unary()?;
                Ok(self.new_unary(UnaryOp::Not, operand, pos))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix_ops(primary)
            }
        }
    }

    fn new_unary(&mut self, op: UnaryOp, operand: Expr, pos: Position) -> Expr {
        let ty = match (op, &operand.ty) {
            (UnaryOp::Minus, Type::Num) => Type::Num,
            (UnaryOp::Not, Type::Bool) => Type::Bool,
            (op, other) => {
                self.error(pos, format!("invalid operand for {}: {}", op, other));
                other.clone()
            }
        };
        Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            pos,
        )
    }

    fn new_binary(&mut self, op: BinaryOp, left: Expr, right: Expr, op_pos: Position) -> Expr {
        let ty = self.binary_type(op, &left, &right, op_pos);
        Expr::new(
            ExprKind::Binary {
                op,
                left: Box::new(left.clone()),
                right: Box::new(right),
            },
            ty,
            left.pos,
        )
    }

    fn binary_type(&mut self, op: BinaryOp, left: &Expr, right: &Expr, op_pos: Position) -> Type {
        let lt = &left.ty;
        let rt = &right.ty;
        let mismatch = |p: &mut Self| {
            p.error(op_pos, format!("mismatched type for {}: {}, {}", op_str(op), lt, rt));
        };
        match op {
            BinaryOp::Add => match (lt, rt) {
                (Type::Num, Type::Num) => Type::Num,
                (Type::String, Type::String) => Type::String,
                (Type::Array(a), Type::Array(b)) => {
                    if a == b {
                        lt.clone()
                    } else if **a == Type::None {
                        rt.clone()
                    } else if **b == Type::None {
                        lt.clone()
                    } else {
                        mismatch(self);
                        lt.clone()
                    }
                }
                _ => {
                    mismatch(self);
                    lt.clone()
                }
            },
            BinaryOp::Sub | BinaryOp::Div | BinaryOp::Mod => match (lt, rt) {
                (Type::Num, Type::Num) => Type::Num,
                _ => {
                    mismatch(self);
                    Type::Num
                }
            },
            BinaryOp::Mul => match (lt, rt) {
                (Type::Num, Type::Num) => Type::Num,
                (Type::Array(_), Type::Num) => lt.clone(),
                _ => {
                    mismatch(self);
                    lt.clone()
                }
            },
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => match (lt, rt) {
                (Type::Num, Type::Num) | (Type::String, Type::String) => Type::Bool,
                _ => {
                    mismatch(self);
                    Type::Bool
                }
            },
            BinaryOp::Eq | BinaryOp::NotEq => {
                if lt == rt || *lt == Type::Any || *rt == Type::Any || lt.accepts(rt) || rt.accepts(lt) {
                    Type::Bool
                } else {
                    mismatch(self);
                    Type::Bool
                }
            }
            BinaryOp::And | BinaryOp::Or => match (lt, rt) {
                (Type::Bool, Type::Bool) => Type::Bool,
                _ => {
                    mismatch(self);
                    Type::Bool
                }
            },
        }
    }

    /// Postfix index, slice, dot and type assertion; all bind only when
    /// adjacent to the expression
    fn parse_postfix_ops(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            if self.at(TokenKind::LBracket) && self.adjacent() {
                expr = self.parse_index_or_slice(expr)?;
            } else if self.at(TokenKind::Dot) && self.adjacent() {
                expr = self.parse_dot(expr)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_index_or_slice(&mut self, left: Expr) -> PResult<Expr> {
        self.advance(); // [
        let pos = left.pos;
        if self.at(TokenKind::Colon) {
            // slice with default start
            self.advance();
            let end = if self.at(TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect(TokenKind::RBracket, "\"]\"")?;
            let ty = self.slice_type(&left, None, end.as_deref());
            return Ok(Expr::new(
                ExprKind::Slice {
                    left: Box::new(left),
                    start: None,
                    end,
                },
                ty,
                pos,
            ));
        }
        let index = self.parse_expr()?;
        if self.at(TokenKind::Colon) {
            self.advance();
            let end = if self.at(TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect(TokenKind::RBracket, "\"]\"")?;
            let ty = self.slice_type(&left, Some(&index), end.as_deref());
            return Ok(Expr::new(
                ExprKind::Slice {
                    left: Box::new(left),
                    start: Some(Box::new(index)),
                    end,
                },
                ty,
                pos,
            ));
        }
        self.expect(TokenKind::RBracket, "\"]\"")?;
        let ty = self.index_type(&left, &index);
        Ok(Expr::new(
            ExprKind::Index {
                left: Box::new(left),
                index: Box::new(index),
            },
            ty,
            pos,
        ))
    }

    fn index_type(&mut self, left: &Expr, index: &Expr) -> Type {
        match &left.ty {
            Type::Array(sub) => {
                if index.ty != Type::Num {
                    self.error(index.pos, format!("expected num index, found {}", index.ty));
                }
                if **sub == Type::None {
                    Type::Any
                } else {
                    (**sub).clone()
                }
            }
            Type::String => {
                if index.ty != Type::Num {
                    self.error(index.pos, format!("expected num index, found {}", index.ty));
                }
                Type::String
            }
            Type::Map(sub) => {
                if index.ty != Type::String {
                    self.error(index.pos, format!("expected string index, found {}", index.ty));
                }
                if **sub == Type::None {
                    Type::Any
                } else {
                    (**sub).clone()
                }
            }
            other => {
                self.error(
                    left.pos,
                    format!("expected array, map or string for indexing, found {}", other),
                );
                Type::Any
            }
        }
    }

    fn slice_type(&mut self, left: &Expr, start: Option<&Expr>, end: Option<&Expr>) -> Type {
        for bound in [start, end].into_iter().flatten() {
            if bound.ty != Type::Num {
                self.error(bound.pos, format!("expected num for slice index, found {}", bound.ty));
            }
        }
        match &left.ty {
            Type::String => Type::String,
            Type::Array(_) => left.ty.clone(),
            other => {
                self.error(
                    left.pos,
                    format!("expected array or string for slicing, found {}", other),
                );
                left.ty.clone()
            }
        }
    }

    fn parse_dot(&mut self, left: Expr) -> PResult<Expr> {
        let dot_tok = self.advance();
        if self.at(TokenKind::LParen) && self.adjacent() {
            // type assertion e.(T)
            self.advance();
            let Ok(target) = self.parse_type() else {
                self.error(dot_tok.pos, "invalid type in type assertion");
                return Err(());
            };
            self.expect(TokenKind::RParen, "\")\"")?;
            if left.ty != Type::Any {
                self.error(
                    dot_tok.pos,
                    format!("type assertion requires value of type any, found {}", left.ty),
                );
            }
            let pos = left.pos;
            return Ok(Expr::new(
                ExprKind::TypeAssert {
                    left: Box::new(left),
                    target: target.clone(),
                },
                target,
                pos,
            ));
        }
        if !self.at(TokenKind::Ident) {
            let msg = format!("expected map key, found {}", self.cur_desc());
            self.error(self.cur().pos, msg);
            return Err(());
        }
        if !self.adjacent() {
            self.error(dot_tok.pos, "unexpected whitespace after \".\"");
            return Err(());
        }
        let key_tok = self.advance();
        let key = self.text(&key_tok).to_string();
        let ty = match &left.ty {
            Type::Map(sub) if **sub == Type::None => Type::Any,
            Type::Map(sub) => (**sub).clone(),
            other => {
                self.error(dot_tok.pos, format!("field access requires map type, found {}", other));
                Type::Any
            }
        };
        let pos = left.pos;
        Ok(Expr::new(
            ExprKind::Dot {
                left: Box::new(left),
                key,
            },
            ty,
            pos,
        ))
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.cur().clone();
        let pos = tok.pos;
        match tok.kind {
            TokenKind::NumLiteral => {
                self.advance();
                let text = self.text(&tok);
                let n = text.parse::<f64>().map_err(|_| {
                    self.error(pos, format!("invalid number literal {}", text));
                })?;
                Ok(Expr::new(ExprKind::NumLit(n), Type::Num, pos))
            }
            TokenKind::StringLiteral => {
                self.advance();
                let raw = self.text(&tok);
                let s = self.unescape_string(&raw[1..raw.len() - 1], pos);
                Ok(Expr::new(ExprKind::StrLit(s), Type::String, pos))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(true), Type::Bool, pos))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(false), Type::Bool, pos))
            }
            TokenKind::Ident => {
                let name = self.text(&tok).to_string();
                if name == "_" {
                    self.error(pos, "anonymous variable \"_\" cannot be read");
                    return Err(());
                }
                if self.is_func_name(&name) {
                    self.error(pos, format!("function call must be parenthesized: ({} ...)", name));
                    return Err(());
                }
                match self.lookup_var(&name) {
                    Some(ty) => {
                        self.advance();
                        Ok(Expr::new(ExprKind::Var(name), ty, pos))
                    }
                    None => {
                        self.error(pos, format!("unknown variable name {:?}", name));
                        Err(())
                    }
                }
            }
            TokenKind::LParen => {
                self.advance();
                if self.at(TokenKind::Ident) {
                    let name = self.text(self.cur()).to_string();
                    if self.is_func_name(&name) {
                        let name_tok = self.advance();
                        let args = self.parse_call_args(&[TokenKind::RParen])?;
                        let call = self.check_call(&name, name_tok.pos, args);
                        self.expect(TokenKind::RParen, "\")\"")?;
                        let ty = call.ret_type.clone();
                        return Ok(Expr::new(ExprKind::Call(call), ty, pos));
                    }
                }
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "\")\"")?;
                // keep the inner expression but anchor errors at the paren
                Ok(Expr { pos, ..expr })
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_map_literal(),
            TokenKind::NewLine => {
                self.error(pos, "unexpected end of line");
                Err(())
            }
            TokenKind::Eof => {
                self.error(pos, "unexpected end of input");
                Err(())
            }
            _ => {
                let msg = format!("unexpected {}", self.cur_desc());
                self.error(pos, msg);
                Err(())
            }
        }
    }

    fn unescape_string(&mut self, raw: &str, pos: Position) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    self.error(pos, format!("invalid escape sequence \"\\{}\"", other));
                    out.push(other);
                }
                None => break,
            }
        }
        out
    }

    fn parse_array_literal(&mut self) -> PResult<Expr> {
        let pos = self.advance().pos; // [
        let mut elements = Vec::new();
        while !self.at(TokenKind::RBracket) && !self.at(TokenKind::Eof) {
            elements.push(self.parse_arg()?);
        }
        self.expect(TokenKind::RBracket, "\"]\"")?;
        if elements.is_empty() {
            return Ok(Expr::new(ExprKind::ArrayLit(elements), Type::empty_array(), pos));
        }
        let combined = self.combine_element_types(&elements);
        let elements = self.rewrite_elements(elements, &combined);
        Ok(Expr::new(
            ExprKind::ArrayLit(elements),
            Type::array(combined),
            pos,
        ))
    }

    fn parse_map_literal(&mut self) -> PResult<Expr> {
        let pos = self.advance().pos; // {
        let mut pairs: Vec<(String, Expr)> = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if !self.at(TokenKind::Ident) {
                let msg = format!("expected map key, found {}", self.cur_desc());
                self.error(self.cur().pos, msg);
                return Err(());
            }
            let key_tok = self.advance();
            let key = self.text(&key_tok).to_string();
            if !self.at(TokenKind::Colon) {
                let msg = format!("expected \":\" after map key, found {}", self.cur_desc());
                self.error(self.cur().pos, msg);
                return Err(());
            }
            self.advance();
            let value = self.parse_arg()?;
            pairs.push((key, value));
        }
        self.expect(TokenKind::RBrace, "\"}\"")?;
        if pairs.is_empty() {
            return Ok(Expr::new(ExprKind::MapLit(pairs), Type::empty_map(), pos));
        }
        let values: Vec<Expr> = pairs.iter().map(|(_, v)| v.clone()).collect();
        let combined = self.combine_element_types(&values);
        let rewritten = self.rewrite_elements(values, &combined);
        let pairs = pairs
            .into_iter()
            .zip(rewritten)
            .map(|((k, _), v)| (k, v))
            .collect();
        Ok(Expr::new(ExprKind::MapLit(pairs), Type::map(combined), pos))
    }

    // ============ Composite literal typing ============

    /// The combined element type of a composite literal. Element types
    /// unify level by level, but only as deep as every element can be
    /// rewritten: a variable cannot be retyped, so unification past its
    /// type falls back to `any` (which any value can be boxed into).
    fn combine_element_types(&self, elements: &[Expr]) -> Type {
        let cap = elements.iter().map(rewrite_depth).min().unwrap_or(0);
        let mut combined = elements[0].ty.clone();
        for e in &elements[1..] {
            combined = unify_capped(&combined, &e.ty, cap);
        }
        promote_empty(combined)
    }

    fn rewrite_elements(&mut self, elements: Vec<Expr>, want: &Type) -> Vec<Expr> {
        let mut out = Vec::with_capacity(elements.len());
        let mut fallback = false;
        for e in &elements {
            match self.try_wrap(want, e) {
                Some(wrapped) => out.push(wrapped),
                None => {
                    fallback = true;
                    break;
                }
            }
        }
        if !fallback {
            return out;
        }
        // cannot reach the combined type; box every element instead
        elements
            .into_iter()
            .map(|e| {
                if e.ty == Type::None {
                    self.error(e.pos, "composite literal elements must have a value, found none");
                    e
                } else {
                    any_wrap(e)
                }
            })
            .collect()
    }

    /// Adapt an expression to a wanted type: exact match, boxing into
    /// `any`, empty composites, or element-wise rewriting of composite
    /// literals. Returns `None` when the value cannot be adapted (a type
    /// error at the call site).
    fn try_wrap(&mut self, want: &Type, expr: &Expr) -> Option<Expr> {
        if expr.ty == *want {
            return Some(expr.clone());
        }
        if *want == Type::Any {
            if expr.ty == Type::None {
                return None;
            }
            return Some(any_wrap(expr.clone()));
        }
        if want.accepts(&expr.ty) {
            // empty literal adopting a concrete composite type
            if expr.is_composite_literal() && want.sub().map(|s| *s != Type::None).unwrap_or(false)
            {
                let mut adopted = expr.clone();
                adopted.ty = want.clone();
                return Some(adopted);
            }
            return Some(expr.clone());
        }
        match (want, &expr.kind) {
            (Type::Array(sub), ExprKind::ArrayLit(elements)) => {
                let mut rewritten = Vec::with_capacity(elements.len());
                for e in elements {
                    rewritten.push(self.try_wrap(sub, e)?);
                }
                Some(Expr::new(ExprKind::ArrayLit(rewritten), want.clone(), expr.pos))
            }
            (Type::Map(sub), ExprKind::MapLit(pairs)) => {
                let mut rewritten = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    rewritten.push((k.clone(), self.try_wrap(sub, v)?));
                }
                Some(Expr::new(ExprKind::MapLit(rewritten), want.clone(), expr.pos))
            }
            _ => None,
        }
    }
}

fn any_wrap(mut expr: Expr) -> Expr {
    if expr.ty == Type::Any {
        return expr;
    }
    // a boxed empty literal settles on any elements
    if expr.is_composite_literal() {
        expr.ty = promote_empty(expr.ty);
    }
    let pos = expr.pos;
    Expr::new(ExprKind::AnyWrap(Box::new(expr)), Type::Any, pos)
}

/// How many composite levels of this expression can be retyped: literals
/// one more than their shallowest element, everything else none
fn rewrite_depth(expr: &Expr) -> u32 {
    match &expr.kind {
        ExprKind::ArrayLit(elements) => {
            let min = elements.iter().map(rewrite_depth).min().unwrap_or(u32::MAX);
            min.saturating_add(1)
        }
        ExprKind::MapLit(pairs) => {
            let min = pairs
                .iter()
                .map(|(_, v)| rewrite_depth(v))
                .min()
                .unwrap_or(u32::MAX);
            min.saturating_add(1)
        }
        _ => 0,
    }
}

/// Unify two types, recursing into composites only `cap` levels deep
fn unify_capped(a: &Type, b: &Type, cap: u32) -> Type {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Type::None, other) | (other, Type::None) => other.clone(),
        (Type::Array(x), Type::Array(y)) if cap > 0 => {
            Type::array(unify_capped(x, y, cap - 1))
        }
        (Type::Map(x), Type::Map(y)) if cap > 0 => Type::map(unify_capped(x, y, cap - 1)),
        _ => Type::Any,
    }
}

/// An all-empty combination (`[[] []]`) settles on `any` elements
fn promote_empty(ty: Type) -> Type {
    match ty {
        Type::Array(sub) if *sub == Type::None => Type::array(Type::Any),
        Type::Map(sub) if *sub == Type::None => Type::map(Type::Any),
        other => other,
    }
}

fn op_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
    }
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, 11) | (2, 12) | (3, 13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

fn count_error(name: &str, want: usize, got: usize) -> String {
    let plural = if want == 1 { "argument" } else { "arguments" };
    format!("{:?} takes {} {}, found {}", name, want, plural, got)
}

/// Does this statement stop execution of the statements after it?
fn stmt_terminates(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return { .. } | StmtKind::Break => true,
        StmtKind::If { blocks, else_block } => {
            else_block
                .as_ref()
                .map(|b| block_terminates(&b.statements))
                .unwrap_or(false)
                && blocks.iter().all(|b| block_terminates(&b.block.statements))
        }
        _ => false,
    }
}

fn block_terminates(statements: &[Stmt]) -> bool {
    statements.iter().any(stmt_terminates)
}

/// Does every path through this block reach a `return`?
fn stmt_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return { .. } => true,
        StmtKind::If { blocks, else_block } => {
            else_block
                .as_ref()
                .map(|b| block_returns(&b.statements))
                .unwrap_or(false)
                && blocks.iter().all(|b| block_returns(&b.block.statements))
        }
        _ => false,
    }
}

fn block_returns(statements: &[Stmt]) -> bool {
    statements.iter().any(stmt_returns)
}

//! Abstract syntax tree for Evy
//!
//! The parser produces a fully typed AST: every expression carries its
//! resolved type and source position before evaluation or compilation
//! starts. Synthetic `AnyWrap` nodes record where a value is boxed into an
//! `any` slot so both runtimes apply the same boxing.
//!
//! Two textual forms are derived from the tree: `Display` renders the
//! canonical dump used by tests (`x=1`, `print(any(x))`), and
//! [`Program::to_source`] pretty-prints valid Evy source.

use crate::span::Position;
use crate::types::Type;
use crate::value::format_num;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

/// A complete Evy program
#[derive(Debug, Clone)]
pub struct Program {
    pub statements: Vec<Stmt>,
    /// User-defined functions by name; bodies are filled in at their
    /// definition site, calls may appear textually earlier
    pub funcs: HashMap<String, Rc<FuncDef>>,
    /// Event handlers by event name
    pub event_handlers: HashMap<String, Rc<EventHandler>>,
    /// Names of builtin functions the program actually calls
    pub called_builtins: Vec<String>,
}

/// A statement with its source position
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// A blank or comment-only line
    Empty,
    /// `x := expr`
    InferredDecl { name: String, value: Expr },
    /// `x:T`, default-initialized
    TypedDecl { name: String, ty: Type },
    /// `target = value` where target is a variable, index chain or dot
    Assign { target: Expr, value: Expr },
    /// A function call in statement position: `print a b`
    FuncCall(FuncCall),
    FuncDef(Rc<FuncDef>),
    EventHandler(Rc<EventHandler>),
    Return { value: Option<Expr> },
    Break,
    If {
        blocks: Vec<CondBlock>,
        else_block: Option<Block>,
    },
    While(CondBlock),
    For {
        loop_var: Option<String>,
        range: ForRange,
        block: Block,
    },
}

/// A condition plus the block guarded by it (`if`, `else if`, `while`)
#[derive(Debug, Clone)]
pub struct CondBlock {
    pub cond: Expr,
    pub block: Block,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum ForRange {
    /// `range [start] stop [step]` over nums
    Step {
        start: Option<Expr>,
        stop: Expr,
        step: Option<Expr>,
    },
    /// `range s` over a string, array or map
    Iter { iterable: Expr },
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<Param>,
    pub variadic_param: Option<Param>,
    pub return_type: Type,
    pub body: Block,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct EventHandler {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Block,
    pub pos: Position,
}

/// A call to a user function or builtin
#[derive(Debug, Clone)]
pub struct FuncCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub ret_type: Type,
    pub pos: Position,
}

/// An expression with its resolved type and source position
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    NumLit(f64),
    StrLit(String),
    BoolLit(bool),
    Var(String),
    ArrayLit(Vec<Expr>),
    /// Ordered key/value pairs
    MapLit(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        left: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    Dot {
        left: Box<Expr>,
        key: String,
    },
    /// Type assertion `e.(T)`
    TypeAssert {
        left: Box<Expr>,
        target: Type,
    },
    /// Synthetic boxing into an `any` slot
    AnyWrap(Box<Expr>),
    Call(FuncCall),
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type, pos: Position) -> Self {
        Self { kind, ty, pos }
    }

    /// Is this expression a composite literal (or an `any`-wrap of one)?
    /// Only literals may be retyped by late composite typing.
    pub fn is_composite_literal(&self) -> bool {
        match &self.kind {
            ExprKind::ArrayLit(_) | ExprKind::MapLit(_) => true,
            ExprKind::AnyWrap(inner) => inner.is_composite_literal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Minus => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    NotEq,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
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
            BinaryOp::And => " and ",
            BinaryOp::Or => " or ",
        };
        write!(f, "{}", s)
    }
}

// ============ Canonical dump ============

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.statements.is_empty() {
            return writeln!(f);
        }
        for stmt in &self.statements {
            writeln!(f, "{}", stmt)?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            writeln!(f, "{}", stmt)?;
        }
        Ok(())
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StmtKind::Empty => Ok(()),
            StmtKind::InferredDecl { name, value } => write!(f, "{}={}", name, value),
            StmtKind::TypedDecl { name, ty } => write!(f, "{}={}", name, ty.zero_literal()),
            StmtKind::Assign { target, value } => write!(f, "{} = {}", target, value),
            StmtKind::FuncCall(call) => write!(f, "{}", call),
            StmtKind::FuncDef(def) => {
                let mut params: Vec<&str> = def.params.iter().map(|p| p.name.as_str()).collect();
                if let Some(p) = &def.variadic_param {
                    params.push(p.name.as_str());
                }
                write!(f, "{}({}){{\n{}}}", def.name, params.join(", "), def.body)?;
                writeln!(f)
            }
            StmtKind::EventHandler(handler) => {
                let params: Vec<&str> = handler.params.iter().map(|p| p.name.as_str()).collect();
                write!(f, "on {}({}){{\n{}}}", handler.name, params.join(", "), handler.body)?;
                writeln!(f)
            }
            StmtKind::Return { value: None } => write!(f, "return"),
            StmtKind::Return { value: Some(v) } => write!(f, "return {}", v),
            StmtKind::Break => write!(f, "break"),
            StmtKind::If { blocks, else_block } => {
                write!(f, "if ({}) {{\n{}}}", blocks[0].cond, blocks[0].block)?;
                for block in &blocks[1..] {
                    write!(f, " else if ({}) {{\n{}}}", block.cond, block.block)?;
                }
                if let Some(else_block) = else_block {
                    write!(f, " else {{\n{}}}", else_block)?;
                }
                Ok(())
            }
            StmtKind::While(cond_block) => {
                write!(f, "while ({}) {{\n{}}}", cond_block.cond, cond_block.block)
            }
            StmtKind::For {
                loop_var,
                range,
                block,
            } => {
                write!(f, "for ")?;
                if let Some(v) = loop_var {
                    write!(f, "{} := ", v)?;
                }
                write!(f, "range ")?;
                match range {
                    ForRange::Step { start, stop, step } => {
                        if let Some(start) = start {
                            write!(f, "{} ", start)?;
                        }
                        write!(f, "{}", stop)?;
                        if let Some(step) = step {
                            write!(f, " {}", step)?;
                        }
                    }
                    ForRange::Iter { iterable } => write!(f, "{}", iterable)?,
                }
                write!(f, " {{\n{}}}", block)
            }
        }
    }
}

impl fmt::Display for FuncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.name, args.join(", "))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::NumLit(n) => write!(f, "{}", format_num(*n)),
            ExprKind::StrLit(s) => write!(f, "\"{}\"", escape_string(s)),
            ExprKind::BoolLit(b) => write!(f, "{}", b),
            ExprKind::Var(name) => write!(f, "{}", name),
            ExprKind::ArrayLit(elements) => {
                let parts: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            ExprKind::MapLit(pairs) => {
                let parts: Vec<String> =
                    pairs.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            ExprKind::Unary { op, operand } => write!(f, "{}{}", op, operand),
            ExprKind::Binary { op, left, right } => write!(f, "({}{}{})", left, op, right),
            ExprKind::Index { left, index } => write!(f, "{}[{}]", left, index),
            ExprKind::Slice { left, start, end } => {
                write!(f, "{}[", left)?;
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                write!(f, ":")?;
                if let Some(end) = end {
                    write!(f, "{}", end)?;
                }
                write!(f, "]")
            }
            ExprKind::Dot { left, key } => write!(f, "{}.{}", left, key),
            ExprKind::TypeAssert { left, target } => write!(f, "{}.({})", left, target),
            ExprKind::AnyWrap(inner) => write!(f, "any({})", inner),
            ExprKind::Call(call) => write!(f, "{}", call),
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

// ============ Evy source formatting ============

impl Program {
    /// Pretty-print the program back to Evy source. Reparsing the output
    /// yields a structurally equivalent tree.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            write_stmt(&mut out, stmt, 0);
        }
        out
    }
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn write_block(out: &mut String, block: &Block, level: usize) {
    for stmt in &block.statements {
        write_stmt(out, stmt, level);
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    match &stmt.kind {
        StmtKind::Empty => {}
        _ => indent(out, level),
    }
    match &stmt.kind {
        StmtKind::Empty => {}
        StmtKind::InferredDecl { name, value } => {
            let _ = write!(out, "{} := {}", name, source_expr(value, false));
        }
        StmtKind::TypedDecl { name, ty } => {
            let _ = write!(out, "{}:{}", name, ty);
        }
        StmtKind::Assign { target, value } => {
            let _ = write!(
                out,
                "{} = {}",
                source_expr(target, true),
                source_expr(value, false)
            );
        }
        StmtKind::FuncCall(call) => {
            out.push_str(&source_call(call, false));
        }
        StmtKind::FuncDef(def) => {
            let _ = write!(out, "func {}", def.name);
            if def.return_type != Type::None {
                let _ = write!(out, ":{}", def.return_type);
            }
            for p in &def.params {
                let _ = write!(out, " {}:{}", p.name, p.ty);
            }
            if let Some(p) = &def.variadic_param {
                let _ = write!(out, " {}:{}...", p.name, p.ty);
            }
            out.push('\n');
            write_block(out, &def.body, level + 1);
            indent(out, level);
            out.push_str("end");
        }
        StmtKind::EventHandler(handler) => {
            let _ = write!(out, "on {}", handler.name);
            for p in &handler.params {
                let _ = write!(out, " {}:{}", p.name, p.ty);
            }
            out.push('\n');
            write_block(out, &handler.body, level + 1);
            indent(out, level);
            out.push_str("end");
        }
        StmtKind::Return { value } => {
            out.push_str("return");
            if let Some(v) = value {
                let _ = write!(out, " {}", source_expr(v, true));
            }
        }
        StmtKind::Break => out.push_str("break"),
        StmtKind::If { blocks, else_block } => {
            let _ = write!(out, "if {}\n", source_expr(&blocks[0].cond, false));
            write_block(out, &blocks[0].block, level + 1);
            for block in &blocks[1..] {
                indent(out, level);
                let _ = write!(out, "else if {}\n", source_expr(&block.cond, false));
                write_block(out, &block.block, level + 1);
            }
            if let Some(else_block) = else_block {
                indent(out, level);
                out.push_str("else\n");
                write_block(out, else_block, level + 1);
            }
            indent(out, level);
            out.push_str("end");
        }
        StmtKind::While(cond_block) => {
            let _ = write!(out, "while {}\n", source_expr(&cond_block.cond, false));
            write_block(out, &cond_block.block, level + 1);
            indent(out, level);
            out.push_str("end");
        }
        StmtKind::For {
            loop_var,
            range,
            block,
        } => {
            out.push_str("for ");
            if let Some(v) = loop_var {
                let _ = write!(out, "{} := ", v);
            }
            out.push_str("range");
            match range {
                ForRange::Step { start, stop, step } => {
                    if let Some(start) = start {
                        let _ = write!(out, " {}", source_expr(start, true));
                    }
                    let _ = write!(out, " {}", source_expr(stop, true));
                    if let Some(step) = step {
                        let _ = write!(out, " {}", source_expr(step, true));
                    }
                }
                ForRange::Iter { iterable } => {
                    let _ = write!(out, " {}", source_expr(iterable, true));
                }
            }
            out.push('\n');
            write_block(out, block, level + 1);
            indent(out, level);
            out.push_str("end");
        }
    }
    out.push('\n');
}

fn source_call(call: &FuncCall, parenthesized: bool) -> String {
    let mut out = String::new();
    if parenthesized {
        out.push('(');
    }
    out.push_str(&call.name);
    for arg in &call.args {
        out.push(' ');
        out.push_str(&source_expr(arg, true));
    }
    if parenthesized {
        out.push(')');
    }
    out
}

/// Render an expression as Evy source. In `tight` mode (argument position)
/// binary operators are written without surrounding spaces so the result
/// still reads as a single argument.
fn source_expr(expr: &Expr, tight: bool) -> String {
    match &expr.kind {
        ExprKind::NumLit(n) => format_num(*n),
        ExprKind::StrLit(s) => format!("\"{}\"", escape_string(s)),
        ExprKind::BoolLit(b) => b.to_string(),
        ExprKind::Var(name) => name.clone(),
        ExprKind::ArrayLit(elements) => {
            let parts: Vec<String> = elements.iter().map(|e| source_expr(e, true)).collect();
            format!("[{}]", parts.join(" "))
        }
        ExprKind::MapLit(pairs) => {
            let parts: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", k, source_expr(v, true)))
                .collect();
            format!("{{{}}}", parts.join(" "))
        }
        ExprKind::Unary { op, operand } => format!("{}{}", op, source_expr(operand, true)),
        ExprKind::Binary { op, left, right } => {
            // always parenthesized so precedence survives reparsing
            let (l, r) = (source_expr(left, tight), source_expr(right, tight));
            match op {
                BinaryOp::And => format!("({} and {})", l, r),
                BinaryOp::Or => format!("({} or {})", l, r),
                _ if tight => format!("({}{}{})", l, op, r),
                _ => format!("({} {} {})", l, op, r),
            }
        }
        ExprKind::Index { left, index } => {
            format!("{}[{}]", source_expr(left, true), source_expr(index, false))
        }
        ExprKind::Slice { left, start, end } => {
            let start = start.as_ref().map(|e| source_expr(e, false)).unwrap_or_default();
            let end = end.as_ref().map(|e| source_expr(e, false)).unwrap_or_default();
            format!("{}[{}:{}]", source_expr(left, true), start, end)
        }
        ExprKind::Dot { left, key } => format!("{}.{}", source_expr(left, true), key),
        ExprKind::TypeAssert { left, target } => {
            format!("{}.({})", source_expr(left, true), target)
        }
        ExprKind::AnyWrap(inner) => source_expr(inner, tight),
        ExprKind::Call(call) => source_call(call, true),
    }
}

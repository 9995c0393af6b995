//! Bytecode compiler for Evy
//!
//! Lowers a typed AST to instructions plus a constants table. The
//! compiler covers the statement subset the opcode set can express:
//! declarations, assignments, literals, unary and binary expressions,
//! indexing and slicing, `if`/`else`, `while`, `break`, and `for range`
//! over step ranges, arrays and strings. Everything else (function
//! definitions and calls, event handlers, `return`, type assertions,
//! map ranges) reports [`CompileError::Unsupported`]; the tree evaluator
//! is the complete runtime.
//!
//! Lowering details: constants are interned by type and value; `for
//! range` loops keep a hidden counter in a compiler-allocated global
//! slot; `break` emits a jump that is back-patched to the slot after the
//! loop's increment block; `and`/`or` short-circuit with conditional
//! jumps.

use super::{make, Bytecode, Opcode};
use crate::ast::*;
use crate::types::Type;
use crate::value::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("undefined variable {0:?}")]
    Undefined(String),

    #[error("too many constants")]
    TooManyConstants,

    #[error("too many globals")]
    TooManyGlobals,
}

/// Interning key for the constants table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Num(u64),
    Str(String),
    Bool(bool),
    None,
}

/// Global slots by name. The bytecode backend has a single flat
/// namespace: redeclaring a name (a shadowing block declaration or a
/// `for` loop variable) reuses its slot.
#[derive(Default)]
struct SymbolTable {
    slots: HashMap<String, u16>,
    next: u16,
}

impl SymbolTable {
    fn define(&mut self, name: &str) -> Result<u16, CompileError> {
        if let Some(slot) = self.slots.get(name) {
            return Ok(*slot);
        }
        let slot = self.advance()?;
        self.slots.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn resolve(&self, name: &str) -> Option<u16> {
        self.slots.get(name).copied()
    }

    /// A fresh unnamed slot for a hidden loop counter
    fn hidden(&mut self) -> Result<u16, CompileError> {
        self.advance()
    }

    fn advance(&mut self) -> Result<u16, CompileError> {
        let slot = self.next;
        self.next = self.next.checked_add(1).ok_or(CompileError::TooManyGlobals)?;
        Ok(slot)
    }
}

/// The bytecode compiler
pub struct Compiler {
    instructions: Vec<u8>,
    constants: Vec<Value>,
    const_keys: HashMap<ConstKey, u16>,
    globals: SymbolTable,
    /// Break jump offsets per enclosing loop, patched at loop end
    loop_breaks: Vec<Vec<usize>>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            constants: Vec::new(),
            const_keys: HashMap::new(),
            globals: SymbolTable::default(),
            loop_breaks: Vec::new(),
        }
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), CompileError> {
        self.compile_stmts(&program.statements)
    }

    pub fn bytecode(self) -> Bytecode {
        Bytecode {
            instructions: self.instructions,
            constants: self.constants,
        }
    }

    // ============ Emission helpers ============

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let pos = self.instructions.len();
        self.instructions.extend(make(op, operands));
        pos
    }

    /// Emit a jump with a placeholder target, to be patched later
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit(op, &[0xFFFF])
    }

    /// Point the jump at `pos` to the current end of the instructions
    fn patch_jump(&mut self, pos: usize) {
        let target = (self.instructions.len() as u16).to_be_bytes();
        self.instructions[pos + 1] = target[0];
        self.instructions[pos + 2] = target[1];
    }

    fn add_constant(&mut self, value: Value) -> Result<u16, CompileError> {
        let key = match &value {
            Value::Num(n) => ConstKey::Num(n.to_bits()),
            Value::Str(s) => ConstKey::Str(s.clone()),
            Value::Bool(b) => ConstKey::Bool(*b),
            Value::None => ConstKey::None,
            _ => return Err(CompileError::Unsupported("composite constant".to_string())),
        };
        if let Some(index) = self.const_keys.get(&key) {
            return Ok(*index);
        }
        if self.constants.len() >= u16::MAX as usize {
            return Err(CompileError::TooManyConstants);
        }
        let index = self.constants.len() as u16;
        self.constants.push(value);
        self.const_keys.insert(key, index);
        Ok(index)
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        let index = self.add_constant(value)?;
        self.emit(Opcode::Constant, &[index as usize]);
        Ok(())
    }

    // ============ Statements ============

    fn compile_stmts(&mut self, statements: &[Stmt]) -> Result<(), CompileError> {
        for statement in statements {
            self.compile_stmt(statement)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Empty => Ok(()),
            StmtKind::InferredDecl { name, value } => {
                self.compile_expr(value)?;
                let slot = self.globals.define(name)?;
                self.emit(Opcode::SetGlobal, &[slot as usize]);
                Ok(())
            }
            StmtKind::TypedDecl { name, ty } => {
                self.compile_zero_value(ty)?;
                let slot = self.globals.define(name)?;
                self.emit(Opcode::SetGlobal, &[slot as usize]);
                Ok(())
            }
            StmtKind::Assign { target, value } => self.compile_assign(target, value),
            StmtKind::If { blocks, else_block } => self.compile_if(blocks, else_block.as_ref()),
            StmtKind::While(cond_block) => self.compile_while(cond_block),
            StmtKind::For {
                loop_var,
                range,
                block,
            } => self.compile_for(loop_var.as_deref(), range, block),
            StmtKind::Break => {
                let pos = self.emit_jump(Opcode::Jump);
                match self.loop_breaks.last_mut() {
                    Some(breaks) => breaks.push(pos),
                    None => {
                        return Err(CompileError::Unsupported(
                            "break outside of a loop".to_string(),
                        ))
                    }
                }
                Ok(())
            }
            StmtKind::FuncCall(call) => Err(CompileError::Unsupported(format!(
                "function call {:?}",
                call.name
            ))),
            StmtKind::FuncDef(def) => Err(CompileError::Unsupported(format!(
                "function definition {:?}",
                def.name
            ))),
            StmtKind::EventHandler(handler) => Err(CompileError::Unsupported(format!(
                "event handler {:?}",
                handler.name
            ))),
            StmtKind::Return { .. } => {
                Err(CompileError::Unsupported("return statement".to_string()))
            }
        }
    }

    fn compile_zero_value(&mut self, ty: &Type) -> Result<(), CompileError> {
        match ty {
            Type::Num => self.emit_constant(Value::Num(0.0)),
            Type::String => self.emit_constant(Value::Str(String::new())),
            // an any slot starts off holding false
            Type::Bool | Type::Any => self.emit_constant(Value::Bool(false)),
            Type::Array(_) => {
                self.emit(Opcode::Array, &[0]);
                Ok(())
            }
            Type::Map(_) => {
                self.emit(Opcode::Map, &[0]);
                Ok(())
            }
            Type::None => self.emit_constant(Value::None),
        }
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Var(name) => {
                self.compile_expr(value)?;
                let slot = self
                    .globals
                    .resolve(name)
                    .ok_or_else(|| CompileError::Undefined(name.clone()))?;
                self.emit(Opcode::SetGlobal, &[slot as usize]);
                Ok(())
            }
            ExprKind::Index { left, index } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[]);
                Ok(())
            }
            ExprKind::Dot { left, key } => {
                self.compile_expr(left)?;
                self.emit_constant(Value::Str(key.clone()))?;
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[]);
                Ok(())
            }
            _ => Err(CompileError::Unsupported("assignment target".to_string())),
        }
    }

    fn compile_if(
        &mut self,
        blocks: &[CondBlock],
        else_block: Option<&Block>,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::with_capacity(blocks.len());
        for block in blocks {
            self.compile_expr(&block.cond)?;
            let skip = self.emit_jump(Opcode::JumpOnFalse);
            self.compile_stmts(&block.block.statements)?;
            end_jumps.push(self.emit_jump(Opcode::Jump));
            self.patch_jump(skip);
        }
        if let Some(else_block) = else_block {
            self.compile_stmts(&else_block.statements)?;
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_while(&mut self, cond_block: &CondBlock) -> Result<(), CompileError> {
        let loop_start = self.instructions.len();
        self.compile_expr(&cond_block.cond)?;
        let exit = self.emit_jump(Opcode::JumpOnFalse);
        self.loop_breaks.push(Vec::new());
        self.compile_stmts(&cond_block.block.statements)?;
        self.emit(Opcode::Jump, &[loop_start]);
        self.patch_jump(exit);
        let breaks = self.loop_breaks.pop().unwrap_or_default();
        for jump in breaks {
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        loop_var: Option<&str>,
        range: &ForRange,
        block: &Block,
    ) -> Result<(), CompileError> {
        match range {
            ForRange::Step { start, stop, step } => {
                // the loop variable doubles as the counter; without one a
                // hidden slot is allocated
                let counter = match loop_var {
                    Some(name) => self.globals.define(name)?,
                    None => self.globals.hidden()?,
                };
                match start {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Value::Num(0.0))?,
                }
                self.emit(Opcode::SetGlobal, &[counter as usize]);

                let loop_start = self.instructions.len();
                self.emit(Opcode::GetGlobal, &[counter as usize]);
                match step {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Value::Num(1.0))?,
                }
                self.compile_expr(stop)?;
                self.emit(Opcode::StepRange, &[]);
                let exit = self.emit_jump(Opcode::JumpOnFalse);

                self.loop_breaks.push(Vec::new());
                self.compile_stmts(&block.statements)?;

                // counter = counter + step
                self.emit(Opcode::GetGlobal, &[counter as usize]);
                match step {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Value::Num(1.0))?,
                }
                self.emit(Opcode::Add, &[]);
                self.emit(Opcode::SetGlobal, &[counter as usize]);
                self.emit(Opcode::Jump, &[loop_start]);

                self.patch_jump(exit);
                let breaks = self.loop_breaks.pop().unwrap_or_default();
                for jump in breaks {
                    self.patch_jump(jump);
                }
                Ok(())
            }
            ForRange::Iter { iterable } => {
                if matches!(iterable.ty, Type::Map(_)) {
                    return Err(CompileError::Unsupported("for range over a map".to_string()));
                }
                let counter = self.globals.hidden()?;
                self.emit_constant(Value::Num(0.0))?;
                self.emit(Opcode::SetGlobal, &[counter as usize]);

                let loop_start = self.instructions.len();
                self.emit(Opcode::GetGlobal, &[counter as usize]);
                self.compile_expr(iterable)?;
                self.emit(Opcode::IterRange, &[]);
                let exit = self.emit_jump(Opcode::JumpOnFalse);

                if let Some(name) = loop_var {
                    // loopvar = iterable[counter]
                    self.compile_expr(iterable)?;
                    self.emit(Opcode::GetGlobal, &[counter as usize]);
                    self.emit(Opcode::Index, &[]);
                    let slot = self.globals.define(name)?;
                    self.emit(Opcode::SetGlobal, &[slot as usize]);
                }

                self.loop_breaks.push(Vec::new());
                self.compile_stmts(&block.statements)?;

                self.emit(Opcode::GetGlobal, &[counter as usize]);
                self.emit_constant(Value::Num(1.0))?;
                self.emit(Opcode::Add, &[]);
                self.emit(Opcode::SetGlobal, &[counter as usize]);
                self.emit(Opcode::Jump, &[loop_start]);

                self.patch_jump(exit);
                let breaks = self.loop_breaks.pop().unwrap_or_default();
                for jump in breaks {
                    self.patch_jump(jump);
                }
                Ok(())
            }
        }
    }

    // ============ Expressions ============

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::NumLit(n) => self.emit_constant(Value::Num(*n)),
            ExprKind::StrLit(s) => self.emit_constant(Value::Str(s.clone())),
            ExprKind::BoolLit(b) => self.emit_constant(Value::Bool(*b)),
            ExprKind::Var(name) => {
                let slot = self
                    .globals
                    .resolve(name)
                    .ok_or_else(|| CompileError::Undefined(name.clone()))?;
                self.emit(Opcode::GetGlobal, &[slot as usize]);
                Ok(())
            }
            ExprKind::ArrayLit(elements) => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
                Ok(())
            }
            ExprKind::MapLit(pairs) => {
                for (key, value) in pairs {
                    self.emit_constant(Value::Str(key.clone()))?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Map, &[pairs.len()]);
                Ok(())
            }
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Minus => self.emit(Opcode::Minus, &[]),
                    UnaryOp::Not => self.emit(Opcode::Bang, &[]),
                };
                Ok(())
            }
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right),
            ExprKind::Index { left, index } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Opcode::Index, &[]);
                Ok(())
            }
            ExprKind::Slice { left, start, end } => {
                self.compile_expr(left)?;
                match start {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Value::None)?,
                }
                match end {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Value::None)?,
                }
                self.emit(Opcode::Slice, &[]);
                Ok(())
            }
            ExprKind::Dot { left, key } => {
                self.compile_expr(left)?;
                self.emit_constant(Value::Str(key.clone()))?;
                self.emit(Opcode::Index, &[]);
                Ok(())
            }
            // VM values are dynamically typed; boxing is a no-op here
            ExprKind::AnyWrap(inner) => self.compile_expr(inner),
            ExprKind::TypeAssert { .. } => {
                Err(CompileError::Unsupported("type assertion".to_string()))
            }
            ExprKind::Call(call) => Err(CompileError::Unsupported(format!(
                "function call {:?}",
                call.name
            ))),
        }
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<(), CompileError> {
        match op {
            BinaryOp::And => {
                self.compile_expr(left)?;
                let short = self.emit_jump(Opcode::JumpOnFalse);
                self.compile_expr(right)?;
                let end = self.emit_jump(Opcode::Jump);
                self.patch_jump(short);
                self.emit_constant(Value::Bool(false))?;
                self.patch_jump(end);
                Ok(())
            }
            BinaryOp::Or => {
                self.compile_expr(left)?;
                let rhs = self.emit_jump(Opcode::JumpOnFalse);
                self.emit_constant(Value::Bool(true))?;
                let end = self.emit_jump(Opcode::Jump);
                self.patch_jump(rhs);
                self.compile_expr(right)?;
                self.patch_jump(end);
                Ok(())
            }
            _ => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op {
                    BinaryOp::Add => Opcode::Add,
                    BinaryOp::Sub => Opcode::Subtract,
                    BinaryOp::Mul => Opcode::Multiply,
                    BinaryOp::Div => Opcode::Divide,
                    BinaryOp::Mod => Opcode::Modulo,
                    BinaryOp::Eq => Opcode::Equal,
                    BinaryOp::NotEq => Opcode::NotEqual,
                    BinaryOp::Lt => Opcode::LessThan,
                    BinaryOp::LtEq => Opcode::LessEqual,
                    BinaryOp::Gt => Opcode::GreaterThan,
                    BinaryOp::GtEq => Opcode::GreaterEqual,
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                };
                self.emit(opcode, &[]);
                Ok(())
            }
        }
    }
}

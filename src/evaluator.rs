//! Tree-walking evaluator for Evy
//!
//! The evaluator walks the typed AST depth first, single threaded and
//! run to completion. Control flow uses a [`Flow`] result instead of
//! unwinding: `break` and `return` propagate outward through statement
//! evaluation until the enclosing loop or call consumes them. Runtime
//! errors are terminal and bubble all the way up.
//!
//! Scopes form a chain of frames. Blocks and conditional bodies get a
//! fresh inner scope per entry; a function call's scope is a child of the
//! global frame, because Evy is lexically scoped and all user functions
//! are top level.

use crate::ast::*;
use crate::builtins::{self, Runtime};
use crate::parser::Parser;
use crate::value::{MapValue, RuntimeError, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Parse and evaluate an Evy program. Parse errors (the first 8) and
/// runtime errors are reported through the runtime's print function.
pub fn run(source: &str, runtime: &mut Runtime) {
    let mut parser = Parser::new(source, builtins::parser_builtins());
    let program = parser.parse();
    if parser.has_errors() {
        let errors = parser.errors();
        runtime.print(&errors.truncate(8).to_string());
        return;
    }
    let mut evaluator = Evaluator::new(&program, runtime);
    if let Err(err) = evaluator.run(&program) {
        evaluator.runtime.print(&format!("{}\n", err));
    }
}

type ScopeRef = Rc<RefCell<Scope>>;

/// One frame of the lexical scope chain
struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<ScopeRef>,
}

impl Scope {
    fn root() -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: None,
        }))
    }

    fn child_of(parent: &ScopeRef) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: Some(parent.clone()),
        }))
    }

    fn get(scope: &ScopeRef, name: &str) -> Option<Value> {
        let frame = scope.borrow();
        if let Some(value) = frame.vars.get(name) {
            return Some(value.clone());
        }
        frame.parent.as_ref().and_then(|p| Scope::get(p, name))
    }

    fn declare(scope: &ScopeRef, name: &str, value: Value) {
        scope.borrow_mut().vars.insert(name.to_string(), value);
    }

    /// Assign to an existing binding somewhere up the chain. Arrays and
    /// maps keep their handle and take over the contents of the source,
    /// so every alias observes the assignment.
    fn assign(scope: &ScopeRef, name: &str, value: Value) -> bool {
        let mut frame = scope.borrow_mut();
        if let Some(existing) = frame.vars.get_mut(name) {
            match (&*existing, &value) {
                (Value::Array(dst), Value::Array(src)) => {
                    if !Rc::ptr_eq(dst, src) {
                        let elements = src.borrow().clone();
                        *dst.borrow_mut() = elements;
                    }
                }
                (Value::Map(dst), Value::Map(src)) => {
                    if !Rc::ptr_eq(dst, src) {
                        let map = src.borrow().clone();
                        *dst.borrow_mut() = map;
                    }
                }
                _ => *existing = value,
            }
            return true;
        }
        match &frame.parent {
            Some(parent) => Scope::assign(parent, name, value),
            None => false,
        }
    }
}

/// Result of evaluating a statement
enum Flow {
    Normal,
    Break,
    Return(Value),
}

/// The tree-walking evaluator
pub struct Evaluator<'rt> {
    runtime: &'rt mut Runtime,
    funcs: HashMap<String, Rc<FuncDef>>,
    event_handlers: HashMap<String, Rc<EventHandler>>,
    global: ScopeRef,
}

impl<'rt> Evaluator<'rt> {
    pub fn new(program: &Program, runtime: &'rt mut Runtime) -> Self {
        let global = Scope::root();
        Scope::declare(&global, "err", Value::Bool(false));
        Scope::declare(&global, "errmsg", Value::Str(String::new()));
        Self {
            runtime,
            funcs: program.funcs.clone(),
            event_handlers: program.event_handlers.clone(),
            global,
        }
    }

    pub fn runtime(&mut self) -> &mut Runtime {
        self.runtime
    }

    /// Evaluate the program's top-level statements
    pub fn run(&mut self, program: &Program) -> Result<(), RuntimeError> {
        let scope = self.global.clone();
        self.eval_stmts(&scope, &program.statements)?;
        Ok(())
    }

    /// Invoke an `on` handler by event name with the event's argument
    /// values. Unknown events and events without a handler are ignored.
    pub fn call_event_handler(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<(), RuntimeError> {
        let Some(handler) = self.event_handlers.get(name).cloned() else {
            return Ok(());
        };
        let scope = Scope::child_of(&self.global);
        for (param, arg) in handler.params.iter().zip(args.iter()) {
            Scope::declare(&scope, &param.name, arg.clone());
        }
        self.eval_stmts(&scope, &handler.body.statements)?;
        Ok(())
    }

    fn eval_stmts(&mut self, scope: &ScopeRef, statements: &[Stmt]) -> Result<Flow, RuntimeError> {
        for statement in statements {
            match self.eval_stmt(scope, statement)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn eval_stmt(&mut self, scope: &ScopeRef, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        match &stmt.kind {
            StmtKind::Empty => Ok(Flow::Normal),
            StmtKind::InferredDecl { name, value } => {
                let value = self.eval_expr(scope, value)?;
                Scope::declare(scope, name, value);
                Ok(Flow::Normal)
            }
            StmtKind::TypedDecl { name, ty } => {
                Scope::declare(scope, name, Value::zero(ty));
                Ok(Flow::Normal)
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval_expr(scope, value)?;
                self.assign_target(scope, target, value)?;
                Ok(Flow::Normal)
            }
            StmtKind::FuncCall(call) => {
                self.eval_call(scope, call)?;
                Ok(Flow::Normal)
            }
            // definitions were collected by the parser
            StmtKind::FuncDef(_) | StmtKind::EventHandler(_) => Ok(Flow::Normal),
            StmtKind::Return { value } => {
                let value = match value {
                    Some(expr) => self.eval_expr(scope, expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::If { blocks, else_block } => {
                for block in blocks {
                    let inner = Scope::child_of(scope);
                    if self.eval_cond(&inner, &block.cond)? {
                        return self.eval_stmts(&inner, &block.block.statements);
                    }
                }
                if let Some(else_block) = else_block {
                    let inner = Scope::child_of(scope);
                    return self.eval_stmts(&inner, &else_block.statements);
                }
                Ok(Flow::Normal)
            }
            StmtKind::While(cond_block) => {
                loop {
                    let inner = Scope::child_of(scope);
                    if !self.eval_cond(&inner, &cond_block.cond)? {
                        return Ok(Flow::Normal);
                    }
                    match self.eval_stmts(&inner, &cond_block.block.statements)? {
                        Flow::Normal => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::For {
                loop_var,
                range,
                block,
            } => self.eval_for(scope, loop_var.as_deref(), range, block),
        }
    }

    fn eval_cond(&mut self, scope: &ScopeRef, cond: &Expr) -> Result<bool, RuntimeError> {
        match self.eval_expr(scope, cond)?.unwrap_any() {
            Value::Bool(b) => Ok(*b),
            other => Err(RuntimeError::Generic(format!(
                "conditional not a bool: {}",
                other
            ))),
        }
    }

    fn eval_for(
        &mut self,
        scope: &ScopeRef,
        loop_var: Option<&str>,
        range: &ForRange,
        block: &Block,
    ) -> Result<Flow, RuntimeError> {
        match range {
            ForRange::Step { start, stop, step } => {
                let start = match start {
                    Some(e) => self.eval_num(scope, e)?,
                    None => 0.0,
                };
                let stop = self.eval_num(scope, stop)?;
                let step = match step {
                    Some(e) => self.eval_num(scope, e)?,
                    None => 1.0,
                };
                let mut i = start;
                while step > 0.0 && i < stop || step < 0.0 && i > stop {
                    let inner = Scope::child_of(scope);
                    if let Some(name) = loop_var {
                        Scope::declare(&inner, name, Value::Num(i));
                    }
                    match self.eval_stmts(&inner, &block.statements)? {
                        Flow::Normal => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                    i += step;
                }
                Ok(Flow::Normal)
            }
            ForRange::Iter { iterable } => {
                let iterable = self.eval_expr(scope, iterable)?;
                match iterable.unwrap_any() {
                    Value::Str(s) => {
                        for c in s.chars().collect::<Vec<char>>() {
                            let inner = Scope::child_of(scope);
                            if let Some(name) = loop_var {
                                Scope::declare(&inner, name, Value::Str(c.to_string()));
                            }
                            match self.eval_stmts(&inner, &block.statements)? {
                                Flow::Normal => {}
                                Flow::Break => return Ok(Flow::Normal),
                                flow @ Flow::Return(_) => return Ok(flow),
                            }
                        }
                        Ok(Flow::Normal)
                    }
                    Value::Array(elements) => {
                        let mut i = 0;
                        loop {
                            let element = {
                                let elements = elements.borrow();
                                if i >= elements.len() {
                                    break;
                                }
                                elements[i].clone()
                            };
                            let inner = Scope::child_of(scope);
                            if let Some(name) = loop_var {
                                Scope::declare(&inner, name, element);
                            }
                            match self.eval_stmts(&inner, &block.statements)? {
                                Flow::Normal => {}
                                Flow::Break => return Ok(Flow::Normal),
                                flow @ Flow::Return(_) => return Ok(flow),
                            }
                            i += 1;
                        }
                        Ok(Flow::Normal)
                    }
                    Value::Map(map) => {
                        // index-based iteration over the key order: keys
                        // added during the loop are visited, deleted keys
                        // are skipped
                        let mut i = 0;
                        loop {
                            let key = {
                                let map = map.borrow();
                                match map.keys().get(i) {
                                    Some(key) => key.clone(),
                                    None => break,
                                }
                            };
                            let inner = Scope::child_of(scope);
                            if let Some(name) = loop_var {
                                Scope::declare(&inner, name, Value::Str(key));
                            }
                            match self.eval_stmts(&inner, &block.statements)? {
                                Flow::Normal => {}
                                Flow::Break => return Ok(Flow::Normal),
                                flow @ Flow::Return(_) => return Ok(flow),
                            }
                            i += 1;
                        }
                        Ok(Flow::Normal)
                    }
                    other => Err(RuntimeError::Generic(format!(
                        "cannot iterate over {}",
                        other.type_of()
                    ))),
                }
            }
        }
    }

    fn eval_num(&mut self, scope: &ScopeRef, expr: &Expr) -> Result<f64, RuntimeError> {
        match self.eval_expr(scope, expr)?.unwrap_any() {
            Value::Num(n) => Ok(*n),
            other => Err(RuntimeError::Generic(format!(
                "expected num, found {}",
                other.type_of()
            ))),
        }
    }

    fn assign_target(
        &mut self,
        scope: &ScopeRef,
        target: &Expr,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match &target.kind {
            ExprKind::Var(name) => {
                if !Scope::assign(scope, name, value) {
                    return Err(RuntimeError::Generic(format!(
                        "cannot find variable {}",
                        name
                    )));
                }
                Ok(())
            }
            ExprKind::Index { left, index } => {
                let container = self.eval_expr(scope, left)?;
                let index = self.eval_expr(scope, index)?;
                container.set_index(&index, value)
            }
            ExprKind::Dot { left, key } => {
                let container = self.eval_expr(scope, left)?;
                container.set_index(&Value::Str(key.clone()), value)
            }
            _ => Err(RuntimeError::Generic(
                "invalid assignment target".to_string(),
            )),
        }
    }

    fn eval_expr(&mut self, scope: &ScopeRef, expr: &Expr) -> Result<Value, RuntimeError> {
        match &expr.kind {
            ExprKind::NumLit(n) => Ok(Value::Num(*n)),
            ExprKind::StrLit(s) => Ok(Value::Str(s.clone())),
            ExprKind::BoolLit(b) => Ok(Value::Bool(*b)),
            ExprKind::Var(name) => Scope::get(scope, name)
                .ok_or_else(|| RuntimeError::Generic(format!("cannot find variable {}", name))),
            ExprKind::ArrayLit(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for e in elements {
                    out.push(self.eval_expr(scope, e)?);
                }
                Ok(Value::array(out))
            }
            ExprKind::MapLit(pairs) => {
                let mut map = MapValue::new();
                for (key, value) in pairs {
                    let value = self.eval_expr(scope, value)?;
                    map.insert(key, value);
                }
                Ok(Value::map(map))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(scope, operand)?;
                match (op, value.unwrap_any()) {
                    (UnaryOp::Minus, Value::Num(n)) => Ok(Value::Num(-n)),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (op, other) => Err(RuntimeError::Generic(format!(
                        "unknown unary operation: {}{}",
                        op, other
                    ))),
                }
            }
            ExprKind::Binary { op, left, right } => self.eval_binary(scope, *op, left, right),
            ExprKind::Index { left, index } => {
                let left = self.eval_expr(scope, left)?;
                let index = self.eval_expr(scope, index)?;
                left.index(&index)
            }
            ExprKind::Slice { left, start, end } => {
                let left = self.eval_expr(scope, left)?;
                let start = match start {
                    Some(e) => self.eval_expr(scope, e)?,
                    None => Value::None,
                };
                let end = match end {
                    Some(e) => self.eval_expr(scope, e)?,
                    None => Value::None,
                };
                left.slice(&start, &end)
            }
            ExprKind::Dot { left, key } => {
                let left = self.eval_expr(scope, left)?;
                left.index(&Value::Str(key.clone()))
            }
            ExprKind::TypeAssert { left, target } => {
                let value = self.eval_expr(scope, left)?;
                value.assert_type(target)
            }
            ExprKind::AnyWrap(inner) => {
                let value = self.eval_expr(scope, inner)?;
                Ok(value.wrap_any(inner.ty.clone()))
            }
            ExprKind::Call(call) => self.eval_call(scope, call),
        }
    }

    fn eval_binary(
        &mut self,
        scope: &ScopeRef,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, RuntimeError> {
        // and/or never evaluate the right operand when the left decides
        if op == BinaryOp::And || op == BinaryOp::Or {
            let left = match self.eval_expr(scope, left)?.unwrap_any() {
                Value::Bool(b) => *b,
                other => {
                    return Err(RuntimeError::Generic(format!(
                        "expected bool operand, found {}",
                        other.type_of()
                    )))
                }
            };
            if op == BinaryOp::And && !left {
                return Ok(Value::Bool(false));
            }
            if op == BinaryOp::Or && left {
                return Ok(Value::Bool(true));
            }
            return match self.eval_expr(scope, right)?.unwrap_any() {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                other => Err(RuntimeError::Generic(format!(
                    "expected bool operand, found {}",
                    other.type_of()
                ))),
            };
        }

        let left = self.eval_expr(scope, left)?;
        let right = self.eval_expr(scope, right)?;
        if op == BinaryOp::Eq {
            return Ok(Value::Bool(left.equals(&right)));
        }
        if op == BinaryOp::NotEq {
            return Ok(Value::Bool(!left.equals(&right)));
        }
        match (left.unwrap_any(), right.unwrap_any()) {
            (Value::Num(l), Value::Num(r)) => eval_binary_num(op, *l, *r),
            (Value::Str(l), Value::Str(r)) => eval_binary_str(op, l, r),
            (Value::Array(_), _) => match op {
                BinaryOp::Add => left.concat(&right),
                BinaryOp::Mul => match right.unwrap_any() {
                    Value::Num(n) => left.repeat(*n),
                    other => Err(RuntimeError::Generic(format!(
                        "bad repetition count of type {}",
                        other.type_of()
                    ))),
                },
                _ => Err(unknown_binary(op, &left, &right)),
            },
            _ => Err(unknown_binary(op, &left, &right)),
        }
    }

    fn eval_call(&mut self, scope: &ScopeRef, call: &FuncCall) -> Result<Value, RuntimeError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval_expr(scope, arg)?);
        }

        if let Some(result) = builtins::call_builtin(&call.name, &args, self.runtime) {
            let outcome = result?;
            if let Some((is_err, msg)) = outcome.global_err {
                Scope::assign(&self.global, "err", Value::Bool(is_err));
                Scope::assign(&self.global, "errmsg", Value::Str(msg));
            }
            return Ok(outcome.value);
        }

        let def = self
            .funcs
            .get(&call.name)
            .cloned()
            .ok_or_else(|| RuntimeError::Generic(format!("cannot find function {}", call.name)))?;
        // lexical scoping: the function's parent frame is the global one
        let func_scope = Scope::child_of(&self.global);
        for (param, arg) in def.params.iter().zip(args.iter()) {
            Scope::declare(&func_scope, &param.name, arg.clone());
        }
        if let Some(variadic) = &def.variadic_param {
            let rest = args.get(def.params.len()..).unwrap_or(&[]).to_vec();
            Scope::declare(&func_scope, &variadic.name, Value::array(rest));
        }
        match self.eval_stmts(&func_scope, &def.body.statements)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }
}

fn eval_binary_num(op: BinaryOp, l: f64, r: f64) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => Ok(Value::Num(l + r)),
        BinaryOp::Sub => Ok(Value::Num(l - r)),
        BinaryOp::Mul => Ok(Value::Num(l * r)),
        BinaryOp::Div => {
            if r == 0.0 {
                Err(RuntimeError::DivideByZero)
            } else {
                Ok(Value::Num(l / r))
            }
        }
        BinaryOp::Mod => {
            if r == 0.0 {
                Err(RuntimeError::DivideByZero)
            } else {
                Ok(Value::Num(l % r))
            }
        }
        BinaryOp::Lt => Ok(Value::Bool(l < r)),
        BinaryOp::LtEq => Ok(Value::Bool(l <= r)),
        BinaryOp::Gt => Ok(Value::Bool(l > r)),
        BinaryOp::GtEq => Ok(Value::Bool(l >= r)),
        _ => Err(RuntimeError::Generic(format!("unknown num operation: {}", op))),
    }
}

fn eval_binary_str(op: BinaryOp, l: &str, r: &str) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => Ok(Value::Str(format!("{}{}", l, r))),
        BinaryOp::Lt => Ok(Value::Bool(l < r)),
        BinaryOp::LtEq => Ok(Value::Bool(l <= r)),
        BinaryOp::Gt => Ok(Value::Bool(l > r)),
        BinaryOp::GtEq => Ok(Value::Bool(l >= r)),
        _ => Err(RuntimeError::Generic(format!(
            "unknown string operation: {}",
            op
        ))),
    }
}

fn unknown_binary(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::Generic(format!(
        "unknown binary operation: {} {} {}",
        left.type_of(),
        op,
        right.type_of()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_capture(input: &str) -> String {
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        let mut runtime = Runtime::new(move |s| sink.borrow_mut().push_str(s));
        run(input, &mut runtime);
        let result = output.borrow().clone();
        result
    }

    #[test]
    fn test_print() {
        assert_eq!("1 abc true\n", run_capture("print 1 \"abc\" true"));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!("7\n", run_capture("x := 1 + 2 * 3\nprint x"));
        assert_eq!("0.5\n", run_capture("x := 1 / 2\nprint x"));
        assert_eq!("1\n", run_capture("x := 7 % 3\nprint x"));
        assert_eq!("-3\n", run_capture("x := -3\nprint x"));
    }

    #[test]
    fn test_string_ops() {
        assert_eq!("ab\n", run_capture("x := \"a\" + \"b\"\nprint x"));
        assert_eq!("true\n", run_capture("print \"a\" < \"b\""));
        assert_eq!("c\n", run_capture("print \"abc\"[-1]"));
        assert_eq!("bc\n", run_capture("print \"abc\"[1:3]"));
    }

    #[test]
    fn test_divide_by_zero() {
        assert_eq!("division by zero\n", run_capture("x := 2 / 0\nprint x"));
        assert_eq!("division by zero\n", run_capture("x := 2 % 0\nprint x"));
    }

    #[test]
    fn test_if_else() {
        let input = r#"
x := 10
if x > 10
    print "big"
else if x > 5
    print "medium"
else
    print "small"
end"#;
        assert_eq!("medium\n", run_capture(input));
    }

    #[test]
    fn test_while_break() {
        let input = r#"
x := 0
while x < 5
    x = x + 1
    if x == 3
        break
    end
end
print x"#;
        assert_eq!("3\n", run_capture(input));
    }

    #[test]
    fn test_break_innermost_loop_only() {
        let input = r#"
x := 0
while true
    while true
        break
    end
    x = x + 1
    break
end
print x"#;
        assert_eq!("1\n", run_capture(input));
    }

    #[test]
    fn test_for_range() {
        assert_eq!("0\n1\n2\n", run_capture("for i := range 3\n print i\nend"));
        assert_eq!("2\n4\n", run_capture("for i := range 2 6 2\n print i\nend"));
        assert_eq!("1\n", run_capture("x := 0\nfor i := range 10 0 -1\n x = i\nend\nprint x"));
        assert_eq!("", run_capture("for i := range -10\n print i\nend"));
    }

    #[test]
    fn test_for_range_string() {
        assert_eq!("a\nb\nc\n", run_capture("for c := range \"abc\"\n print c\nend"));
    }

    #[test]
    fn test_for_range_array() {
        assert_eq!(
            "1\n2\n3\n",
            run_capture("for e := range [1 2 3]\n print e\nend")
        );
    }

    #[test]
    fn test_for_range_map_order() {
        let input = "m := {c:1 a:2 b:3}\nfor k := range m\n print k\nend";
        assert_eq!("c\na\nb\n", run_capture(input));
    }

    #[test]
    fn test_map_mutation_during_iteration() {
        let input = r#"
m := {a:1 b:2}
for k := range m
    if k == "a"
        del m "b"
    end
    print k
end"#;
        assert_eq!("a\n", run_capture(input));
    }

    #[test]
    fn test_func_call() {
        let input = r#"
func add:num a:num b:num
    return a + b
end
print (add 1 2)"#;
        assert_eq!("3\n", run_capture(input));
    }

    #[test]
    fn test_recursion() {
        let input = r#"
func fib:num n:num
    if n < 2
        return n
    end
    return (fib n-1) + (fib n-2)
end
print (fib 10)"#;
        assert_eq!("55\n", run_capture(input));
    }

    #[test]
    fn test_variadic() {
        let input = r#"
func sum:num nums:num...
    total := 0
    for n := range nums
        total = total + n
    end
    return total
end
print (sum 1 2 3)
print (sum)"#;
        assert_eq!("6\n0\n", run_capture(input));
    }

    #[test]
    fn test_func_modifies_global() {
        let input = r#"
x := 1
func bump
    x = x + 1
end
bump
bump
print x"#;
        assert_eq!("3\n", run_capture(input));
    }

    #[test]
    fn test_func_local_shadows_global() {
        let input = r#"
x := 1
func foo
    x := "abc"
    print x
end
foo
print x"#;
        assert_eq!("abc\n1\n", run_capture(input));
    }

    #[test]
    fn test_array_aliasing() {
        let input = "x := [1 2]\ny := x\ny[0] = 3\nprint x";
        assert_eq!("[3 2]\n", run_capture(input));
    }

    #[test]
    fn test_assignment_updates_aliases() {
        let input = "a := [1 2]\nb := a\na = [3 4]\nprint b";
        assert_eq!("[3 4]\n", run_capture(input));
    }

    #[test]
    fn test_concat_makes_new_array() {
        let input = "x := [1 2]\ny := [3 4]\ny = x + y\nprint x y";
        assert_eq!("[1 2] [1 2 3 4]\n", run_capture(input));
    }

    #[test]
    fn test_slice_copies() {
        let input = "x := [1 2 3]\ny := x[1:]\ny[0] = 8\nprint x y";
        assert_eq!("[1 2 3] [8 3]\n", run_capture(input));
    }

    #[test]
    fn test_array_repetition() {
        assert_eq!("[1 2 1 2 1 2]\n", run_capture("print [1 2] * 3"));
        assert_eq!("[]\n", run_capture("print [1 2] * 0"));
        assert_eq!("bad repetition count: -1\n", run_capture("print [1 2] * -1"));
    }

    #[test]
    fn test_index_errors() {
        assert_eq!(
            "index 3 out of bounds, length 3\n",
            run_capture("print [1 2 3][3]")
        );
        assert_eq!(
            "no value for map key: \"c\"\n",
            run_capture("m := {a:1 b:2}\nprint m[\"c\"]")
        );
        assert_eq!("invalid slice: 2:1\n", run_capture("print [1 2 3][2:1]"));
    }

    #[test]
    fn test_any_wrap_and_assert() {
        let input = "x:any\nx = 1\ny := x.(num) + 1\nprint y";
        assert_eq!("2\n", run_capture(input));
        let input = "a:any\na = [1 2]\nprint a.([]num)[1]";
        assert_eq!("2\n", run_capture(input));
    }

    #[test]
    fn test_failed_type_assertion() {
        let input = "x:any\nx = 1\nprint x.(bool)";
        assert_eq!(
            "type assertion failed: expected bool, found num\n",
            run_capture(input)
        );
    }

    #[test]
    fn test_equality_through_any() {
        let input = "x:any\nx = 1\nprint x == 1";
        assert_eq!("true\n", run_capture(input));
    }

    #[test]
    fn test_err_globals() {
        let input = r#"
n := str2num "7"
print n err
m := str2num "abc"
print m err errmsg
k := str2num "1"
print k err"#;
        assert_eq!(
            "7 false\n0 true str2num: cannot parse \"abc\"\n1 false\n",
            run_capture(input)
        );
    }

    #[test]
    fn test_str2bool() {
        let input = "b := str2bool \"true\"\nprint b err";
        assert_eq!("true false\n", run_capture(input));
    }

    #[test]
    fn test_short_circuit() {
        // the divisions would fail if the right side were evaluated
        let input = "x := 0\ny := false and 1 / x == 1\nprint y\nz := true or 1 / x == 1\nprint z";
        assert_eq!("false\ntrue\n", run_capture(input));
    }

    #[test]
    fn test_parse_errors_printed() {
        let got = run_capture("x := foo\n");
        assert_eq!("line 1 column 6: unknown variable name \"foo\"\n", got);
    }

    #[test]
    fn test_parse_errors_truncated() {
        let mut input = String::new();
        for _ in 0..12 {
            input.push_str("nope\n");
        }
        let got = run_capture(&input);
        assert_eq!(8, got.lines().count());
    }

    #[test]
    fn test_builtin_len_has_del() {
        let input = r#"
m := {a:1 b:2}
print (len m) (has m "a")
del m "a"
print (len m) (has m "a")"#;
        assert_eq!("2 true\n1 false\n", run_capture(input));
    }

    #[test]
    fn test_string_builtins_end_to_end() {
        let input = r#"
s := "hello world"
print (upper s)
print (split s " ")
print (join (split s " ") "-")
print (replace s "world" "evy")"#;
        assert_eq!(
            "HELLO WORLD\n[hello world]\nhello-world\nhello evy\n",
            run_capture(input)
        );
    }

    #[test]
    fn test_sprintf_builtin() {
        let input = "s := sprintf \"%s is %d\" \"x\" 42\nprint s";
        assert_eq!("x is 42\n", run_capture(input));
    }

    #[test]
    fn test_graphics_not_implemented() {
        assert_eq!("'move' not yet implemented\n", run_capture("move 10 10"));
    }

    #[test]
    fn test_event_handler_invocation() {
        let source = r#"
on down x:num y:num
    print "down:" x y
end"#;
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        let mut runtime = Runtime::new(move |s| sink.borrow_mut().push_str(s));
        let mut parser = Parser::new(source, builtins::parser_builtins());
        let program = parser.parse();
        assert!(!parser.has_errors(), "errors: {}", parser.errors());
        let mut evaluator = Evaluator::new(&program, &mut runtime);
        evaluator.run(&program).expect("run");
        evaluator
            .call_event_handler("down", &[Value::Num(1.0), Value::Num(2.0)])
            .expect("handler");
        assert_eq!("down: 1 2\n", *output.borrow());
    }

    #[test]
    fn test_nested_index_assignment() {
        let input = "x := [[1 2] [3 4]]\nx[0][0] = x[0][1]\nprint x";
        assert_eq!("[[2 2] [3 4]]\n", run_capture(input));
    }

    #[test]
    fn test_map_dot_assignment() {
        let input = "m := {name: \"mali\"}\nm.sport = \"climbing\"\nprint m.sport";
        assert_eq!("climbing\n", run_capture(input));
    }

    #[test]
    fn test_error_stops_execution() {
        let input = "print 1\nx := 2 / 0\nprint x";
        assert_eq!("1\ndivision by zero\n", run_capture(input));
    }
}

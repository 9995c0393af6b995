//! Stack VM for Evy bytecode
//!
//! A fetch-decode-execute loop over the instruction stream with an
//! operand stack and a globals array indexed by compiler-assigned slots.
//! Runtime errors halt the loop and are returned to the host.
//!
//! Popping leaves the value in place below the stack pointer, so tests
//! can inspect the most recently popped value through
//! [`Vm::last_popped_stack_elem`].

use super::{read_u16, Bytecode, Opcode};
use crate::value::{MapValue, RuntimeError, Value};

const STACK_SIZE: usize = 2048;
const GLOBALS_SIZE: usize = 65536;

/// The Evy virtual machine
pub struct Vm {
    constants: Vec<Value>,
    instructions: Vec<u8>,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self {
            constants: bytecode.constants,
            instructions: bytecode.instructions,
            stack: vec![Value::None; STACK_SIZE],
            sp: 0,
            globals: vec![Value::None; GLOBALS_SIZE],
        }
    }

    /// The stack slot just above the current top: the value most
    /// recently popped
    pub fn last_popped_stack_elem(&self) -> &Value {
        &self.stack[self.sp]
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        if self.sp == 0 {
            return Value::None;
        }
        self.sp -= 1;
        self.stack[self.sp].clone()
    }

    fn pop_num(&mut self) -> Result<f64, RuntimeError> {
        match self.pop().unwrap_any() {
            Value::Num(n) => Ok(*n),
            other => Err(RuntimeError::Generic(format!(
                "expected num, found {}",
                other.type_of()
            ))),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, RuntimeError> {
        match self.pop().unwrap_any() {
            Value::Bool(b) => Ok(*b),
            other => Err(RuntimeError::Generic(format!(
                "expected bool, found {}",
                other.type_of()
            ))),
        }
    }

    /// Execute the whole program
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let mut ip = 0;
        while ip < self.instructions.len() {
            let op = Opcode::from_byte(self.instructions[ip]).ok_or_else(|| {
                RuntimeError::Generic(format!("invalid opcode {}", self.instructions[ip]))
            })?;
            ip += 1;
            match op {
                Opcode::Constant => {
                    let index = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::Generic(format!("invalid constant index {}", index))
                        })?;
                    self.push(value)?;
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::GetGlobal => {
                    let slot = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    self.push(self.globals[slot].clone())?;
                }
                Opcode::SetGlobal => {
                    let slot = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    self.globals[slot] = self.pop();
                }
                Opcode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    target.set_index(&index, value)?;
                }
                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Modulo => {
                    let right = self.pop();
                    let left = self.pop();
                    let result = binary_op(op, &left, &right)?;
                    self.push(result)?;
                }
                Opcode::Minus => {
                    let n = self.pop_num()?;
                    self.push(Value::Num(-n))?;
                }
                Opcode::Bang => {
                    let b = self.pop_bool()?;
                    self.push(Value::Bool(!b))?;
                }
                Opcode::Equal => {
                    let right = self.pop();
                    let left = self.pop();
                    self.push(Value::Bool(left.equals(&right)))?;
                }
                Opcode::NotEqual => {
                    let right = self.pop();
                    let left = self.pop();
                    self.push(Value::Bool(!left.equals(&right)))?;
                }
                Opcode::GreaterThan
                | Opcode::LessThan
                | Opcode::GreaterEqual
                | Opcode::LessEqual => {
                    let right = self.pop();
                    let left = self.pop();
                    let result = compare_op(op, &left, &right)?;
                    self.push(result)?;
                }
                Opcode::Jump => {
                    ip = read_u16(&self.instructions, ip) as usize;
                }
                Opcode::JumpOnFalse => {
                    let target = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    if !self.pop_bool()? {
                        ip = target;
                    }
                }
                Opcode::Array => {
                    let count = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    let mut elements = vec![Value::None; count];
                    for i in (0..count).rev() {
                        elements[i] = self.pop();
                    }
                    self.push(Value::array(elements))?;
                }
                Opcode::Map => {
                    let count = read_u16(&self.instructions, ip) as usize;
                    ip += 2;
                    let mut pairs = vec![(String::new(), Value::None); count];
                    for i in (0..count).rev() {
                        let value = self.pop();
                        let key = match self.pop().unwrap_any() {
                            Value::Str(s) => s.clone(),
                            other => {
                                return Err(RuntimeError::Generic(format!(
                                    "expected string map key, found {}",
                                    other.type_of()
                                )))
                            }
                        };
                        pairs[i] = (key, value);
                    }
                    let mut map = MapValue::new();
                    for (key, value) in pairs {
                        map.insert(&key, value);
                    }
                    self.push(Value::map(map))?;
                }
                Opcode::Index => {
                    let index = self.pop();
                    let target = self.pop();
                    let value = target.index(&index)?;
                    self.push(value)?;
                }
                Opcode::Slice => {
                    let end = self.pop();
                    let start = self.pop();
                    let target = self.pop();
                    let value = target.slice(&start, &end)?;
                    self.push(value)?;
                }
                Opcode::StepRange => {
                    let stop = self.pop_num()?;
                    let step = self.pop_num()?;
                    let i = self.pop_num()?;
                    self.push(Value::Bool(step > 0.0 && i < stop || step < 0.0 && i > stop))?;
                }
                Opcode::IterRange => {
                    let iterable = self.pop();
                    let i = self.pop_num()?;
                    let length = iterable.count().ok_or_else(|| {
                        RuntimeError::Generic(format!(
                            "cannot iterate over {}",
                            iterable.type_of()
                        ))
                    })?;
                    self.push(Value::Bool(i < length as f64))?;
                }
            }
        }
        Ok(())
    }
}

fn binary_op(op: Opcode, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left.unwrap_any(), right.unwrap_any()) {
        (Value::Num(l), Value::Num(r)) => match op {
            Opcode::Add => Ok(Value::Num(l + r)),
            Opcode::Subtract => Ok(Value::Num(l - r)),
            Opcode::Multiply => Ok(Value::Num(l * r)),
            Opcode::Divide => {
                if *r == 0.0 {
                    Err(RuntimeError::DivideByZero)
                } else {
                    Ok(Value::Num(l / r))
                }
            }
            Opcode::Modulo => {
                if *r == 0.0 {
                    Err(RuntimeError::DivideByZero)
                } else {
                    Ok(Value::Num(l % r))
                }
            }
            _ => Err(invalid_operands(op, left, right)),
        },
        (Value::Str(l), Value::Str(r)) if op == Opcode::Add => {
            Ok(Value::Str(format!("{}{}", l, r)))
        }
        (Value::Array(_), Value::Array(_)) if op == Opcode::Add => left.concat(right),
        (Value::Array(_), Value::Num(n)) if op == Opcode::Multiply => left.repeat(*n),
        _ => Err(invalid_operands(op, left, right)),
    }
}

fn compare_op(op: Opcode, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let result = match (left.unwrap_any(), right.unwrap_any()) {
        (Value::Num(l), Value::Num(r)) => match op {
            Opcode::GreaterThan => l > r,
            Opcode::LessThan => l < r,
            Opcode::GreaterEqual => l >= r,
            Opcode::LessEqual => l <= r,
            _ => return Err(invalid_operands(op, left, right)),
        },
        (Value::Str(l), Value::Str(r)) => match op {
            Opcode::GreaterThan => l > r,
            Opcode::LessThan => l < r,
            Opcode::GreaterEqual => l >= r,
            Opcode::LessEqual => l <= r,
            _ => return Err(invalid_operands(op, left, right)),
        },
        _ => return Err(invalid_operands(op, left, right)),
    };
    Ok(Value::Bool(result))
}

fn invalid_operands(op: Opcode, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::Generic(format!(
        "invalid operands for {}: {}, {}",
        op.name(),
        left.type_of(),
        right.type_of()
    ))
}

#[cfg(test)]
mod tests {
    use super::super::{disassemble, make, CompileError, Compiler};
    use super::*;
    use crate::builtins;
    use crate::parser::Parser;

    /// Compile a test program. A trailing `x = x` is appended so `x`
    /// counts as used, then its instructions are stripped again, leaving
    /// the test's own last write as the most recently popped value.
    fn compile_bytecode(input: &str) -> Bytecode {
        let input = format!("{}\nx = x", input);
        let mut parser = Parser::new(&input, builtins::parser_builtins());
        let program = parser.parse();
        assert!(
            !parser.has_errors(),
            "unexpected parse errors for {:?}:\n{}",
            input,
            parser.errors()
        );
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("unexpected compile error");
        let mut bytecode = compiler.bytecode();
        let len = bytecode.instructions.len() - 6;
        bytecode.instructions.truncate(len);
        bytecode
    }

    fn run_vm(input: &str) -> Vm {
        let mut vm = Vm::new(compile_bytecode(input));
        vm.run().expect("runtime error");
        vm
    }

    fn assert_stack_top(input: &str, want: Value) {
        let vm = run_vm(input);
        let got = vm.last_popped_stack_elem();
        assert!(
            got.equals(&want),
            "input: {:?}\nwant: {}\ngot: {}",
            input,
            want,
            got
        );
    }

    fn assert_runtime_error(input: &str, want: RuntimeError) {
        let mut vm = Vm::new(compile_bytecode(input));
        let err = vm.run().expect_err("expected runtime error");
        assert_eq!(want, err, "input: {:?}", input);
    }

    fn num(n: f64) -> Value {
        Value::Num(n)
    }

    fn string(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    fn array(elements: &[Value]) -> Value {
        Value::array(elements.to_vec())
    }

    fn instructions(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_globals() {
        assert_stack_top("x := 1", num(1.0));
        assert_stack_top("x := 1\ny := x\ny = x + 1\ny = y", num(2.0));
        assert_stack_top(
            "x := [1 2 3]\nx[0] = x[2]\nx[2] = 1\nx = x",
            array(&[num(3.0), num(2.0), num(1.0)]),
        );
        assert_stack_top(
            "x := [[1 2] [3 4]]\nx[0][0] = x[0][1]\nx = x",
            array(&[array(&[num(2.0), num(2.0)]), array(&[num(3.0), num(4.0)])]),
        );
    }

    #[test]
    fn test_user_error() {
        assert_runtime_error("x := 2 / 0\nx = x", RuntimeError::DivideByZero);
        assert_runtime_error("x := 2 % 0\nx = x", RuntimeError::DivideByZero);
    }

    #[test]
    fn test_bool_expressions() {
        assert_stack_top("x := true", Value::Bool(true));
        assert_stack_top("x := false", Value::Bool(false));
        assert_stack_top("x := !true", Value::Bool(false));
        assert_stack_top("x := 1 == 1", Value::Bool(true));
        assert_stack_top("x := 1 != 1", Value::Bool(false));
    }

    #[test]
    fn test_num_operations() {
        assert_stack_top("x := 2 + 1", num(3.0));
        assert_stack_top("x := 2 - 1", num(1.0));
        assert_stack_top("x := 2 * 1", num(2.0));
        assert_stack_top("x := 2 / 1", num(2.0));
        assert_stack_top("x := 2 % 1", num(0.0));
        assert_stack_top("x := 2.5 % 1.3", num(2.5 % 1.3));
        assert_stack_top("x := -1", num(-1.0));
        assert_stack_top("x := 1 + 2 - 3 * 4 / 5 % 6", num(1.0 + 2.0 - (3.0 * 4.0 / 5.0) % 6.0));
        assert_stack_top("x := (1 + 2 - 3) * 4 / 5 % 6", num((1.0 + 2.0 - 3.0) * 4.0 / 5.0 % 6.0));
        assert_stack_top("x := 1 < 2", Value::Bool(true));
        assert_stack_top("x := 1 <= 2", Value::Bool(true));
        assert_stack_top("x := 1 > 2", Value::Bool(false));
        assert_stack_top("x := 1 >= 2", Value::Bool(false));
    }

    #[test]
    fn test_short_circuit() {
        // the right operand dividing by zero must never run
        assert_stack_top("x := false and 1 / 0 == 1", Value::Bool(false));
        assert_stack_top("x := true or 1 / 0 == 1", Value::Bool(true));
        assert_stack_top("x := true and false", Value::Bool(false));
        assert_stack_top("x := false or true", Value::Bool(true));
    }

    #[test]
    fn test_string_expressions() {
        assert_stack_top("x := \"a\"", string("a"));
        assert_stack_top("x := \"a\" + \"b\"", string("ab"));
        assert_stack_top("x := \"a\" < \"b\"", Value::Bool(true));
        assert_stack_top("x := \"a\" <= \"b\"", Value::Bool(true));
        assert_stack_top("x := \"a\" > \"b\"", Value::Bool(false));
        assert_stack_top("x := \"a\" >= \"b\"", Value::Bool(false));
        assert_stack_top("x := \"abc\"[0]", string("a"));
        assert_stack_top("x := \"abc\"[-1]", string("c"));
        assert_stack_top("x := \"abc\"[1:3]", string("bc"));
        assert_stack_top("x := \"abc\"[-3:-1]", string("ab"));
        assert_stack_top("x := \"abc\"[:1]", string("a"));
        assert_stack_top("x := \"abc\"[1:]", string("bc"));
        assert_stack_top("x := \"abc\"[3:]", string(""));
    }

    #[test]
    fn test_arrays() {
        assert_stack_top("x := []", array(&[]));
        assert_stack_top("x := [1 2 3]", array(&[num(1.0), num(2.0), num(3.0)]));
        assert_stack_top(
            "x := [1 2] + [3 4]",
            array(&[num(1.0), num(2.0), num(3.0), num(4.0)]),
        );
        assert_stack_top(
            "x := [1 2] * 3",
            array(&[num(1.0), num(2.0), num(1.0), num(2.0), num(1.0), num(2.0)]),
        );
        assert_stack_top("x := [1 2] * 0", array(&[]));
        assert_stack_top(
            "x := [1 2]\ny := [3 4]\ny = x + y\nx = x",
            array(&[num(1.0), num(2.0)]),
        );
        assert_stack_top("x := [1 2 3][0]", num(1.0));
        assert_stack_top("x := [1 2 3][-1]", num(3.0));
        assert_stack_top("x := [1 2 3][1:3]", array(&[num(2.0), num(3.0)]));
        assert_stack_top("x := [1 2 3][-3:-1]", array(&[num(1.0), num(2.0)]));
        assert_stack_top("x := [1 2 3][:1]", array(&[num(1.0)]));
        assert_stack_top("x := [1 2 3][1:]", array(&[num(2.0), num(3.0)]));
        assert_stack_top("x := [1 2 3][3:]", array(&[]));
        assert_stack_top(
            "x := [1 2 3]\ny := x[1:]\ny[0] = 8\nx = x",
            array(&[num(1.0), num(2.0), num(3.0)]),
        );
    }

    #[test]
    fn test_err_array_repetition() {
        assert_runtime_error("x := [1 2 3] * 4.5\nx = x", RuntimeError::BadRepetition(4.5));
        assert_runtime_error("x := [1 2 3] * -1\nx = x", RuntimeError::BadRepetition(-1.0));
    }

    #[test]
    fn test_err_bounds() {
        assert_runtime_error(
            "x := \"abc\"[3]\nx = x",
            RuntimeError::Bounds { index: 3, length: 3 },
        );
        assert_runtime_error(
            "x := \"abc\"[-4]\nx = x",
            RuntimeError::Bounds { index: -4, length: 3 },
        );
        assert_runtime_error(
            "x := [1 2 3][3]\nx = x",
            RuntimeError::Bounds { index: 3, length: 3 },
        );
        assert_runtime_error(
            "x := [1 2 3][-4]\nx = x",
            RuntimeError::Bounds { index: -4, length: 3 },
        );
    }

    #[test]
    fn test_err_index() {
        assert_runtime_error("x := \"abc\"[1.1]\nx = x", RuntimeError::IndexValue(1.1));
        assert_runtime_error("x := [1 2 3][1.1]\nx = x", RuntimeError::IndexValue(1.1));
        assert_runtime_error("x := [1 2 3][1.1:2.1]\nx = x", RuntimeError::IndexValue(1.1));
    }

    #[test]
    fn test_err_slice() {
        assert_runtime_error("x := \"abc\"[2:1]\nx = x", RuntimeError::Slice(2.0, 1.0));
        assert_runtime_error("x := [1 2 3][2:1]\nx = x", RuntimeError::Slice(2.0, 1.0));
    }

    #[test]
    fn test_map() {
        let mut want = MapValue::new();
        want.insert("a", num(1.0));
        want.insert("b", num(2.0));
        assert_stack_top("x := {a: 1 b: 2}", Value::map(want));
        assert_stack_top("x := {}", Value::map(MapValue::new()));
        assert_stack_top("x := {a: 1 b: 2}[\"b\"]", num(2.0));
    }

    #[test]
    fn test_err_map_key() {
        assert_runtime_error(
            "x := {a: 1}[\"b\"]\nx = x",
            RuntimeError::MapKey("b".to_string()),
        );
    }

    #[test]
    fn test_if() {
        assert_stack_top("x := 1\nif x == 1\n\tx = 2\nend\nx = x", num(2.0));
        assert_stack_top("x := 10\nif x < 5\n\tx = 20\nelse\n\tx = 5\nend\nx = x", num(5.0));
        assert_stack_top(
            "x := 10\nif x > 10\n\tx = 10\nelse if x > 5\n\tx = 5\nelse\n\tx = 1\nend\nx = x",
            num(5.0),
        );
        assert_stack_top(
            "x := 3\nif x == 1\n\tx = 11\nelse if x == 2\n\tx = 12\nelse if x == 3\n\tx = 13\nelse\n\tx = 14\nend\nx = x",
            num(13.0),
        );
        assert_stack_top(
            "x := 1\nif false\n\tx = 2\nelse if false\n\tx = 3\nelse if false\n\tx = 4\nend\nx = x",
            num(1.0),
        );
    }

    #[test]
    fn test_while() {
        assert_stack_top("x := 0\nwhile x < 5\n\tx = x + 1\nend\nx = x", num(5.0));
        assert_stack_top("x := 0\nwhile x > 5\n\tx = x + 1\nend\nx = x", num(0.0));
        assert_stack_top(
            "x := 0\nwhile x < 5\n\tx = x + 1\n\tif x == 3\n\t\tbreak\n\tend\nend\nx = x",
            num(3.0),
        );
        assert_stack_top(
            "\nx := 0\nwhile true\n\twhile true\n\t\tbreak\n\tend\n\tx = x + 1\n\tbreak\nend\nx = x",
            num(1.0),
        );
    }

    #[test]
    fn test_step_range() {
        let input = "x := 0\nfor range 10\n\tx = x + 1\nend\nx = x";
        assert_stack_top(input, num(10.0));
        let bytecode = compile_bytecode(input);
        // constants interned by value: 0, 1, 10
        let want_constants = vec![num(0.0), num(1.0), num(10.0)];
        assert_eq!(want_constants.len(), bytecode.constants.len());
        for (want, got) in want_constants.iter().zip(bytecode.constants.iter()) {
            assert!(want.equals(got));
        }
        let want = instructions(&[
            // x := 0
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[0]),
            // for range 10 (hidden counter := 0)
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[1]),
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[1]), // step 1
            make(Opcode::Constant, &[2]), // stop 10
            make(Opcode::StepRange, &[]),
            make(Opcode::JumpOnFalse, &[48]),
            // x = x + 1
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[0]),
            // hidden counter = counter + 1
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[1]),
            // end
            make(Opcode::Jump, &[12]),
            // x = x
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::SetGlobal, &[0]),
        ]);
        assert_eq!(want, bytecode.instructions, "\n{}", disassemble(&bytecode));
    }

    #[test]
    fn test_step_range_variants() {
        assert_stack_top("x := 0\nfor range 2 10\n\tx = x + 1\nend\nx = x", num(8.0));
        assert_stack_top("x := 0\nfor i := range 10\n\tx = i\nend\nx = x", num(9.0));
        assert_stack_top("x := 0\nfor i := range 0 10 4\n\tx = i\nend\nx = x", num(8.0));
        assert_stack_top("x := 0\nfor range -10\n\tx = x + 1\nend\nx = x", num(0.0));
        assert_stack_top("x := 0\nfor range 0\n\tx = x + 1\nend\nx = x", num(0.0));
    }

    #[test]
    fn test_step_range_negative_step() {
        let input = "x := 0\nfor i := range 10 0 -1\n\tx = i\nend\nx = x";
        assert_stack_top(input, num(1.0));
        let bytecode = compile_bytecode(input);
        // constants interned by value: 0, 10, 1
        let want = instructions(&[
            // x := 0
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[0]),
            // i := 10
            make(Opcode::Constant, &[1]),
            make(Opcode::SetGlobal, &[1]),
            make(Opcode::GetGlobal, &[1]),
            // step -1 compiles as 1 negated
            make(Opcode::Constant, &[2]),
            make(Opcode::Minus, &[]),
            make(Opcode::Constant, &[0]), // stop 0
            make(Opcode::StepRange, &[]),
            make(Opcode::JumpOnFalse, &[46]),
            // x = i
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::SetGlobal, &[0]),
            // i = i + -1
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[2]),
            make(Opcode::Minus, &[]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[1]),
            // end
            make(Opcode::Jump, &[12]),
            // x = x
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::SetGlobal, &[0]),
        ]);
        assert_eq!(want, bytecode.instructions, "\n{}", disassemble(&bytecode));
    }

    #[test]
    fn test_for_break() {
        let input = "x := 0\nfor range 5\n\tx = x + 1\n\tif x == 3\n\t\tbreak\n\tend\nend\nx = x";
        assert_stack_top(input, num(3.0));
        let bytecode = compile_bytecode(input);
        // constants interned by value: 0, 1, 5, 3
        let want = instructions(&[
            // x := 0
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[0]),
            // for range 5 (hidden counter := 0)
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[1]),
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[1]), // step 1
            make(Opcode::Constant, &[2]), // stop 5
            make(Opcode::StepRange, &[]),
            make(Opcode::JumpOnFalse, &[64]),
            // x = x + 1
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[0]),
            // if x == 3
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::Constant, &[3]),
            make(Opcode::Equal, &[]),
            make(Opcode::JumpOnFalse, &[51]),
            // break jumps past the increment block
            make(Opcode::Jump, &[64]),
            // end of if block
            make(Opcode::Jump, &[51]),
            // hidden counter = counter + 1
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[1]),
            // end
            make(Opcode::Jump, &[12]),
            // x = x
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::SetGlobal, &[0]),
        ]);
        assert_eq!(want, bytecode.instructions, "\n{}", disassemble(&bytecode));
    }

    #[test]
    fn test_array_range() {
        let input = "x := 0\nfor e := range [1 2 3]\n\tx = e\nend\nx = x";
        assert_stack_top(input, num(3.0));
        let bytecode = compile_bytecode(input);
        // constants interned by value: 0, 1, 2, 3
        let want = instructions(&[
            // x := 0
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[0]),
            // hidden counter := 0
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[1]),
            make(Opcode::GetGlobal, &[1]),
            // [1 2 3]
            make(Opcode::Constant, &[1]),
            make(Opcode::Constant, &[2]),
            make(Opcode::Constant, &[3]),
            make(Opcode::Array, &[3]),
            make(Opcode::IterRange, &[]),
            make(Opcode::JumpOnFalse, &[69]),
            // e := [1 2 3][counter]
            make(Opcode::Constant, &[1]),
            make(Opcode::Constant, &[2]),
            make(Opcode::Constant, &[3]),
            make(Opcode::Array, &[3]),
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Index, &[]),
            make(Opcode::SetGlobal, &[2]),
            // x = e
            make(Opcode::GetGlobal, &[2]),
            make(Opcode::SetGlobal, &[0]),
            // counter = counter + 1
            make(Opcode::GetGlobal, &[1]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::SetGlobal, &[1]),
            // end
            make(Opcode::Jump, &[12]),
            // x = x
            make(Opcode::GetGlobal, &[0]),
            make(Opcode::SetGlobal, &[0]),
        ]);
        assert_eq!(want, bytecode.instructions, "\n{}", disassemble(&bytecode));
    }

    #[test]
    fn test_array_range_variants() {
        assert_stack_top(
            "x := 0\nfor range [1 2 3]\n\tx = x + 1\nend\nx = x",
            num(3.0),
        );
        assert_stack_top(
            "x := 0\ny := [1 2 3]\nfor e := range y\n\tx = e\nend\nx = x",
            num(3.0),
        );
        assert_stack_top(
            "x := 0\nfor x := range [1 2 3]\n\tif x == 2\n\t\tbreak\n\tend\nend\nx = x",
            num(2.0),
        );
    }

    #[test]
    fn test_string_range() {
        assert_stack_top(
            "x := \"\"\nfor c := range \"abc\"\n\tx = x + c\nend\nx = x",
            string("abc"),
        );
    }

    #[test]
    fn test_compile_ok_implies_parse_ok() {
        // anything that compiles parsed cleanly; unsupported constructs
        // are compile errors, not parse errors
        let input = "func f\n\tprint 1\nend\nf";
        let mut parser = Parser::new(input, builtins::parser_builtins());
        let program = parser.parse();
        assert!(!parser.has_errors());
        let mut compiler = Compiler::new();
        let err = compiler.compile(&program).expect_err("compile should fail");
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn test_map_range_unsupported() {
        let input = "m := {a:1}\nfor k := range m\n\tprint k\nend";
        let mut parser = Parser::new(input, builtins::parser_builtins());
        let program = parser.parse();
        assert!(!parser.has_errors());
        let mut compiler = Compiler::new();
        let err = compiler.compile(&program).expect_err("compile should fail");
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

}

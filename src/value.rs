//! Runtime values for Evy
//!
//! One value representation is shared by the tree evaluator and the VM.
//! Numbers, strings and bools are plain values; arrays and maps are shared
//! handles (`Rc<RefCell<...>>`) so mutation through one alias is visible
//! through all others. Slicing, concatenation and literal construction
//! allocate fresh handles with shallow-copied elements.
//!
//! A value stored in an `any` slot is boxed together with its static type,
//! which is what type assertion `e.(T)` checks against. Equality looks
//! through boxes.

use crate::types::Type;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Terminal runtime errors; evaluation halts and the message is printed
/// via the host's print function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivideByZero,

    #[error("index {index} out of bounds, length {length}")]
    Bounds { index: i64, length: usize },

    #[error("index not an integer: {}", format_num(*.0))]
    IndexValue(f64),

    #[error("invalid slice: {}:{}", format_num(*.0), format_num(*.1))]
    Slice(f64, f64),

    #[error("no value for map key: {0:?}")]
    MapKey(String),

    #[error("bad repetition count: {}", format_num(*.0))]
    BadRepetition(f64),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("type assertion failed: expected {want}, found {got}")]
    TypeAssertion { want: Type, got: Type },

    #[error("stack overflow")]
    StackOverflow,

    #[error("{0}")]
    Generic(String),
}

/// A runtime value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    None,
    Num(f64),
    Str(String),
    Bool(bool),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<MapValue>>),
    Any(Box<AnyValue>),
}

/// The contents of an `any` box: the boxed value and its static type
#[derive(Debug, Clone, PartialEq)]
pub struct AnyValue {
    pub ty: Type,
    pub value: Value,
}

/// A string-keyed map preserving first-insertion key order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapValue {
    pairs: HashMap<String, Value>,
    order: Vec<String>,
}

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.pairs.get(key).cloned()
    }

    /// Insert or update; a new key goes to the end of the iteration order
    pub fn insert(&mut self, key: &str, value: Value) {
        if !self.pairs.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.pairs.insert(key.to_string(), value);
    }

    pub fn delete(&mut self, key: &str) {
        if self.pairs.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    /// Keys in first-insertion order
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Value {
    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn map(map: MapValue) -> Value {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    /// Box a value for storage in an `any` slot, recording its static
    /// type. Boxing an existing box is a no-op.
    pub fn wrap_any(self, ty: Type) -> Value {
        match self {
            Value::Any(_) => self,
            value => Value::Any(Box::new(AnyValue { ty, value })),
        }
    }

    /// Look through an `any` box
    pub fn unwrap_any(&self) -> &Value {
        match self {
            Value::Any(inner) => inner.value.unwrap_any(),
            other => other,
        }
    }

    /// The default value for a declared but uninitialized variable
    pub fn zero(ty: &Type) -> Value {
        match ty {
            Type::None => Value::None,
            Type::Num => Value::Num(0.0),
            Type::String => Value::Str(String::new()),
            Type::Bool => Value::Bool(false),
            Type::Any => Value::Bool(false).wrap_any(Type::Bool),
            Type::Array(_) => Value::array(vec![]),
            Type::Map(_) => Value::map(MapValue::new()),
        }
    }

    /// The runtime kind of this value, as a type for error messages
    pub fn type_of(&self) -> Type {
        match self {
            Value::None => Type::None,
            Value::Num(_) => Type::Num,
            Value::Str(_) => Type::String,
            Value::Bool(_) => Type::Bool,
            Value::Array(_) => Type::empty_array(),
            Value::Map(_) => Type::empty_map(),
            Value::Any(_) => Type::Any,
        }
    }

    /// Deep equality; `any` boxes compare by content
    pub fn equals(&self, other: &Value) -> bool {
        match (self.unwrap_any(), other.unwrap_any()) {
            (Value::None, Value::None) => true,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.keys().iter().all(|k| match (a.get(k), b.get(k)) {
                        (Some(x), Some(y)) => x.equals(&y),
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    /// Number of elements: code points for strings, elements for arrays,
    /// entries for maps
    pub fn count(&self) -> Option<usize> {
        match self.unwrap_any() {
            Value::Str(s) => Some(s.chars().count()),
            Value::Array(elements) => Some(elements.borrow().len()),
            Value::Map(map) => Some(map.borrow().len()),
            _ => None,
        }
    }

    /// Index into a string, array or map. Sequence indices must be
    /// integers; negative indices count from the end.
    pub fn index(&self, index: &Value) -> Result<Value, RuntimeError> {
        match (self.unwrap_any(), index.unwrap_any()) {
            (Value::Array(elements), Value::Num(n)) => {
                let elements = elements.borrow();
                let i = sequence_index(*n, elements.len())?;
                Ok(elements[i].clone())
            }
            (Value::Str(s), Value::Num(n)) => {
                let chars: Vec<char> = s.chars().collect();
                let i = sequence_index(*n, chars.len())?;
                Ok(Value::Str(chars[i].to_string()))
            }
            (Value::Map(map), Value::Str(key)) => map
                .borrow()
                .get(key)
                .ok_or_else(|| RuntimeError::MapKey(key.clone())),
            (Value::Map(_), other) => Err(RuntimeError::BadArguments(format!(
                "expected string for map index, found {}",
                other.type_of()
            ))),
            (_, other) => Err(RuntimeError::IndexValue(match other {
                Value::Num(n) => *n,
                _ => f64::NAN,
            })),
        }
    }

    /// Assign through an index: `a[i] = v`, `m["k"] = v`, `m.k = v`
    pub fn set_index(&self, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match (self.unwrap_any(), index.unwrap_any()) {
            (Value::Array(elements), Value::Num(n)) => {
                let mut elements = elements.borrow_mut();
                let len = elements.len();
                let i = sequence_index(*n, len)?;
                elements[i] = value;
                Ok(())
            }
            (Value::Map(map), Value::Str(key)) => {
                map.borrow_mut().insert(key, value);
                Ok(())
            }
            (target, _) => Err(RuntimeError::BadArguments(format!(
                "cannot index into {}",
                target.type_of()
            ))),
        }
    }

    /// Slice a string or array: `a[start:end]`, either bound optional
    /// (`Value::None`). Produces a new handle with shallow-copied elements.
    pub fn slice(&self, start: &Value, end: &Value) -> Result<Value, RuntimeError> {
        match self.unwrap_any() {
            Value::Array(elements) => {
                let elements = elements.borrow();
                let (from, to) = slice_bounds(start, end, elements.len())?;
                Ok(Value::array(elements[from..to].to_vec()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (from, to) = slice_bounds(start, end, chars.len())?;
                Ok(Value::Str(chars[from..to].iter().collect()))
            }
            other => Err(RuntimeError::BadArguments(format!(
                "cannot slice {}",
                other.type_of()
            ))),
        }
    }

    /// Array concatenation: a fresh handle with shallow copies of both sides
    pub fn concat(&self, other: &Value) -> Result<Value, RuntimeError> {
        match (self.unwrap_any(), other.unwrap_any()) {
            (Value::Array(a), Value::Array(b)) => {
                let mut elements = a.borrow().clone();
                elements.extend(b.borrow().iter().cloned());
                Ok(Value::array(elements))
            }
            _ => Err(RuntimeError::BadArguments("expected arrays for +".to_string())),
        }
    }

    /// Array repetition `[1 2] * 3`; the count must be a non-negative integer
    pub fn repeat(&self, count: f64) -> Result<Value, RuntimeError> {
        if count < 0.0 || count.fract() != 0.0 {
            return Err(RuntimeError::BadRepetition(count));
        }
        match self.unwrap_any() {
            Value::Array(elements) => {
                let elements = elements.borrow();
                let mut out = Vec::with_capacity(elements.len() * count as usize);
                for _ in 0..count as usize {
                    out.extend(elements.iter().cloned());
                }
                Ok(Value::array(out))
            }
            other => Err(RuntimeError::BadArguments(format!(
                "cannot repeat {}",
                other.type_of()
            ))),
        }
    }

    /// Check a type assertion `e.(T)` and unbox on success
    pub fn assert_type(&self, target: &Type) -> Result<Value, RuntimeError> {
        match self {
            Value::Any(inner) => {
                if inner.ty == *target {
                    Ok(inner.value.clone())
                } else {
                    Err(RuntimeError::TypeAssertion {
                        want: target.clone(),
                        got: inner.ty.clone(),
                    })
                }
            }
            other => {
                if other.type_of() == *target {
                    Ok(other.clone())
                } else {
                    Err(RuntimeError::TypeAssertion {
                        want: target.clone(),
                        got: other.type_of(),
                    })
                }
            }
        }
    }
}

/// Resolve a num index into a sequence of the given length, supporting
/// negative indices
fn sequence_index(n: f64, len: usize) -> Result<usize, RuntimeError> {
    if n.fract() != 0.0 {
        return Err(RuntimeError::IndexValue(n));
    }
    let mut i = n as i64;
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i >= len as i64 {
        return Err(RuntimeError::Bounds {
            index: n as i64,
            length: len,
        });
    }
    Ok(i as usize)
}

fn slice_bounds(start: &Value, end: &Value, len: usize) -> Result<(usize, usize), RuntimeError> {
    let from = slice_bound(start, 0.0, len)?;
    let to = slice_bound(end, len as f64, len)?;
    if from > to {
        return Err(RuntimeError::Slice(from as f64, to as f64));
    }
    Ok((from, to))
}

/// Resolve one slice bound; unlike indexing, a bound may equal the length
fn slice_bound(bound: &Value, default: f64, len: usize) -> Result<usize, RuntimeError> {
    let n = match bound.unwrap_any() {
        Value::None => default,
        Value::Num(n) => *n,
        other => {
            return Err(RuntimeError::BadArguments(format!(
                "expected num for slice bound, found {}",
                other.type_of()
            )))
        }
    };
    if n.fract() != 0.0 {
        return Err(RuntimeError::IndexValue(n));
    }
    let mut i = n as i64;
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i > len as i64 {
        return Err(RuntimeError::Bounds {
            index: n as i64,
            length: len,
        });
    }
    Ok(i as usize)
}

/// Format a num the canonical way: integral values print without a
/// decimal point
pub fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Num(n) => write!(f, "{}", format_num(*n)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(elements) => {
                let parts: Vec<String> =
                    elements.borrow().iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", parts.join(" "))
            }
            Value::Map(map) => {
                let map = map.borrow();
                let parts: Vec<String> = map
                    .keys()
                    .iter()
                    .filter_map(|k| map.get(k).map(|v| format!("{}:{}", k, v)))
                    .collect();
                write!(f, "{{{}}}", parts.join(" "))
            }
            Value::Any(inner) => write!(f, "{}", inner.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_reflexive() {
        let values = vec![
            Value::Num(1.5),
            Value::Str("abc".to_string()),
            Value::Bool(true),
            Value::array(vec![Value::Num(1.0), Value::Num(2.0)]),
        ];
        for v in &values {
            assert!(v.equals(v));
        }
    }

    #[test]
    fn test_equality_through_any() {
        let boxed = Value::Num(1.0).wrap_any(Type::Num);
        assert!(boxed.equals(&Value::Num(1.0)));
        assert!(Value::Num(1.0).equals(&boxed));
    }

    #[test]
    fn test_deep_array_equality() {
        let a = Value::array(vec![Value::array(vec![Value::Num(1.0)])]);
        let b = Value::array(vec![Value::array(vec![Value::Num(1.0)])]);
        let c = Value::array(vec![Value::array(vec![Value::Num(2.0)])]);
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let mut m1 = MapValue::new();
        m1.insert("a", Value::Num(1.0));
        m1.insert("b", Value::Num(2.0));
        let mut m2 = MapValue::new();
        m2.insert("b", Value::Num(2.0));
        m2.insert("a", Value::Num(1.0));
        assert!(Value::map(m1).equals(&Value::map(m2)));
    }

    #[test]
    fn test_negative_index() {
        let s = Value::Str("abc".to_string());
        assert!(s.index(&Value::Num(-1.0)).unwrap().equals(&Value::Str("c".to_string())));
        let a = Value::array(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        assert!(a.index(&Value::Num(-1.0)).unwrap().equals(&Value::Num(3.0)));
    }

    #[test]
    fn test_index_errors() {
        let a = Value::array(vec![Value::Num(1.0)]);
        assert_eq!(
            a.index(&Value::Num(1.0)),
            Err(RuntimeError::Bounds { index: 1, length: 1 })
        );
        assert_eq!(a.index(&Value::Num(0.5)), Err(RuntimeError::IndexValue(0.5)));
        let mut m = MapValue::new();
        m.insert("a", Value::Num(1.0));
        assert_eq!(
            Value::map(m).index(&Value::Str("b".to_string())),
            Err(RuntimeError::MapKey("b".to_string()))
        );
    }

    #[test]
    fn test_full_slice_equals_original() {
        let a = Value::array(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        let sliced = a.slice(&Value::None, &Value::None).unwrap();
        assert!(a.equals(&sliced));
    }

    #[test]
    fn test_slice_concat_partition() {
        // a[i:j] + a[j:k] == a[i:k]
        let a = Value::array((0..6).map(|n| Value::Num(n as f64)).collect());
        let left = a.slice(&Value::Num(1.0), &Value::Num(3.0)).unwrap();
        let right = a.slice(&Value::Num(3.0), &Value::Num(5.0)).unwrap();
        let joined = left.concat(&right).unwrap();
        let direct = a.slice(&Value::Num(1.0), &Value::Num(5.0)).unwrap();
        assert!(joined.equals(&direct));
    }

    #[test]
    fn test_slice_copies() {
        let a = Value::array(vec![Value::Num(1.0), Value::Num(2.0)]);
        let b = a.slice(&Value::None, &Value::None).unwrap();
        b.set_index(&Value::Num(0.0), Value::Num(9.0)).unwrap();
        assert!(a
            .index(&Value::Num(0.0))
            .unwrap()
            .equals(&Value::Num(1.0)));
    }

    #[test]
    fn test_invalid_slice() {
        let a = Value::array(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        assert_eq!(
            a.slice(&Value::Num(2.0), &Value::Num(1.0)),
            Err(RuntimeError::Slice(2.0, 1.0))
        );
    }

    #[test]
    fn test_repeat() {
        let a = Value::array(vec![Value::Num(1.0), Value::Num(2.0)]);
        let repeated = a.repeat(3.0).unwrap();
        assert_eq!(repeated.count(), Some(6));
        assert_eq!(a.repeat(-1.0), Err(RuntimeError::BadRepetition(-1.0)));
        assert_eq!(a.repeat(4.5), Err(RuntimeError::BadRepetition(4.5)));
    }

    #[test]
    fn test_map_insertion_order() {
        let mut m = MapValue::new();
        m.insert("c", Value::Num(1.0));
        m.insert("a", Value::Num(2.0));
        m.insert("b", Value::Num(3.0));
        m.insert("a", Value::Num(4.0)); // update keeps position
        assert_eq!(m.keys(), &["c".to_string(), "a".to_string(), "b".to_string()]);
        m.delete("a");
        assert_eq!(m.keys(), &["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_type_assertion() {
        let boxed = Value::Num(1.0).wrap_any(Type::Num);
        assert!(boxed.assert_type(&Type::Num).unwrap().equals(&Value::Num(1.0)));
        assert_eq!(
            boxed.assert_type(&Type::Bool),
            Err(RuntimeError::TypeAssertion {
                want: Type::Bool,
                got: Type::Num,
            })
        );
    }

    #[test]
    fn test_shared_handles() {
        let a = Value::array(vec![Value::Num(1.0)]);
        let alias = a.clone();
        alias.set_index(&Value::Num(0.0), Value::Num(5.0)).unwrap();
        assert!(a.index(&Value::Num(0.0)).unwrap().equals(&Value::Num(5.0)));
    }

    #[test]
    fn test_format_num() {
        assert_eq!(format_num(1.0), "1");
        assert_eq!(format_num(2.5), "2.5");
        assert_eq!(format_num(-3.0), "-3");
        assert_eq!(format_num(0.0), "0");
    }

    #[test]
    fn test_display() {
        let a = Value::array(vec![Value::Num(1.0), Value::Str("x".to_string())]);
        assert_eq!(a.to_string(), "[1 x]");
        let mut m = MapValue::new();
        m.insert("a", Value::Num(1.0));
        m.insert("b", Value::Bool(true));
        assert_eq!(Value::map(m).to_string(), "{a:1 b:true}");
    }
}

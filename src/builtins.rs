//! Builtin functions and the host runtime
//!
//! Builtins are pre-declared in the top scope by the parser (so calls type
//! check like any function call) and dispatched by name at runtime, before
//! user-defined functions. The host supplies I/O through [`Runtime`]:
//! print, read, sleep and optional graphics callbacks. A graphics builtin
//! without an injected callback prints a "not yet implemented" notice.
//!
//! The conversion builtins `str2num` and `str2bool` never fail hard; they
//! report through the global `err`/`errmsg` soft error channel instead.

use crate::ast::Param;
use crate::types::Type;
use crate::value::{format_num, RuntimeError, Value};
use rand::Rng;
use std::collections::HashMap;
use std::io::BufRead;
use std::time::Duration;

/// A function signature as the parser sees it
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub params: Vec<Type>,
    pub variadic: Option<Type>,
    pub return_type: Type,
    /// Number of trailing params that may be omitted (`rand` takes 0 or 1)
    pub optional_params: usize,
}

impl FuncSig {
    fn new(params: Vec<Type>, return_type: Type) -> Self {
        Self {
            params,
            variadic: None,
            return_type,
            optional_params: 0,
        }
    }

    fn variadic(param: Type, return_type: Type) -> Self {
        Self {
            params: vec![],
            variadic: Some(param),
            return_type,
            optional_params: 0,
        }
    }
}

/// Everything the parser pre-declares: builtin functions, event
/// signatures, and the global variables `err` and `errmsg`
#[derive(Debug, Clone, Default)]
pub struct Builtins {
    pub funcs: HashMap<String, FuncSig>,
    pub event_handlers: HashMap<String, Vec<Param>>,
    pub globals: Vec<(String, Type)>,
}

/// The default builtin declarations known to the parser
pub fn parser_builtins() -> Builtins {
    let mut funcs = HashMap::new();
    let mut sig = |name: &str, s: FuncSig| {
        funcs.insert(name.to_string(), s);
    };

    sig("read", FuncSig::new(vec![], Type::String));
    sig("print", FuncSig::variadic(Type::Any, Type::None));
    sig("printf", FuncSig::variadic(Type::Any, Type::None));
    sig("sprint", FuncSig::variadic(Type::Any, Type::String));
    sig("sprintf", FuncSig::variadic(Type::Any, Type::String));

    sig(
        "join",
        FuncSig::new(vec![Type::empty_array(), Type::String], Type::String),
    );
    sig(
        "split",
        FuncSig::new(
            vec![Type::String, Type::String],
            Type::array(Type::String),
        ),
    );
    sig("upper", FuncSig::new(vec![Type::String], Type::String));
    sig("lower", FuncSig::new(vec![Type::String], Type::String));
    sig("index", FuncSig::new(vec![Type::String, Type::String], Type::Num));
    sig(
        "startswith",
        FuncSig::new(vec![Type::String, Type::String], Type::Bool),
    );
    sig(
        "endswith",
        FuncSig::new(vec![Type::String, Type::String], Type::Bool),
    );
    sig("trim", FuncSig::new(vec![Type::String, Type::String], Type::String));
    sig(
        "replace",
        FuncSig::new(vec![Type::String, Type::String, Type::String], Type::String),
    );

    sig("str2num", FuncSig::new(vec![Type::String], Type::Num));
    sig("str2bool", FuncSig::new(vec![Type::String], Type::Bool));

    sig("len", FuncSig::new(vec![Type::Any], Type::Num));
    sig("has", FuncSig::new(vec![Type::empty_map(), Type::String], Type::Bool));
    sig("del", FuncSig::new(vec![Type::empty_map(), Type::String], Type::None));

    sig("sleep", FuncSig::new(vec![Type::Num], Type::None));
    sig(
        "rand",
        FuncSig {
            params: vec![Type::Num],
            variadic: None,
            return_type: Type::Num,
            optional_params: 1,
        },
    );

    for name in ["floor", "ceil", "round", "log", "sqrt", "sin", "cos"] {
        sig(name, FuncSig::new(vec![Type::Num], Type::Num));
    }
    for name in ["min", "max", "pow", "atan2"] {
        sig(name, FuncSig::new(vec![Type::Num, Type::Num], Type::Num));
    }

    for name in ["move", "line", "rect"] {
        sig(name, FuncSig::new(vec![Type::Num, Type::Num], Type::None));
    }
    for name in ["circle", "width"] {
        sig(name, FuncSig::new(vec![Type::Num], Type::None));
    }
    sig("color", FuncSig::new(vec![Type::String], Type::None));
    sig("colour", FuncSig::new(vec![Type::String], Type::None));

    let xy = vec![
        Param { name: "x".to_string(), ty: Type::Num },
        Param { name: "y".to_string(), ty: Type::Num },
    ];
    let event_handlers = HashMap::from([
        ("down".to_string(), xy.clone()),
        ("up".to_string(), xy.clone()),
        ("move".to_string(), xy),
        (
            "key".to_string(),
            vec![Param { name: "k".to_string(), ty: Type::String }],
        ),
        (
            "input".to_string(),
            vec![
                Param { name: "id".to_string(), ty: Type::String },
                Param { name: "val".to_string(), ty: Type::String },
            ],
        ),
        (
            "animate".to_string(),
            vec![Param { name: "n".to_string(), ty: Type::Num }],
        ),
    ]);

    let globals = vec![
        ("err".to_string(), Type::Bool),
        ("errmsg".to_string(), Type::String),
    ];

    Builtins {
        funcs,
        event_handlers,
        globals,
    }
}

/// Host callbacks for graphics builtins; any may be absent
#[derive(Default)]
pub struct GraphicsRuntime {
    pub move_fn: Option<Box<dyn FnMut(f64, f64)>>,
    pub line_fn: Option<Box<dyn FnMut(f64, f64)>>,
    pub rect_fn: Option<Box<dyn FnMut(f64, f64)>>,
    pub circle_fn: Option<Box<dyn FnMut(f64)>>,
    pub width_fn: Option<Box<dyn FnMut(f64)>>,
    pub color_fn: Option<Box<dyn FnMut(&str)>>,
}

/// The host environment injected into the runtimes
pub struct Runtime {
    pub print: Box<dyn FnMut(&str)>,
    pub read: Box<dyn FnMut() -> String>,
    pub sleep: Box<dyn FnMut(Duration)>,
    pub graphics: GraphicsRuntime,
}

impl Runtime {
    /// A runtime with a custom print function; read returns empty lines
    /// and sleep blocks the thread
    pub fn new(print: impl FnMut(&str) + 'static) -> Self {
        Self {
            print: Box::new(print),
            read: Box::new(String::new),
            sleep: Box::new(std::thread::sleep),
            graphics: GraphicsRuntime::default(),
        }
    }

    /// The standard CLI runtime: stdout, stdin, thread sleep
    pub fn stdio() -> Self {
        Self {
            print: Box::new(|s| print!("{}", s)),
            read: Box::new(|| {
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
                line.truncate(line.trim_end_matches('\n').len());
                line
            }),
            sleep: Box::new(std::thread::sleep),
            graphics: GraphicsRuntime::default(),
        }
    }

    pub fn print(&mut self, s: &str) {
        (self.print)(s);
    }
}

/// The outcome of a builtin call: its value, and an update to the global
/// soft error channel if the builtin drives it
#[derive(Debug)]
pub struct BuiltinOutcome {
    pub value: Value,
    pub global_err: Option<(bool, String)>,
}

impl BuiltinOutcome {
    fn value(value: Value) -> Self {
        Self {
            value,
            global_err: None,
        }
    }
}

/// Dispatch a builtin call by name. Returns `None` if the name is not a
/// builtin, so the caller falls through to user-defined functions.
pub fn call_builtin(
    name: &str,
    args: &[Value],
    rt: &mut Runtime,
) -> Option<Result<BuiltinOutcome, RuntimeError>> {
    let result = match name {
        "read" => Ok(Value::Str((rt.read)())),
        "print" => {
            let line = join_values(args, " ") + "\n";
            rt.print(&line);
            Ok(Value::None)
        }
        "printf" => match sprintf_args(name, args) {
            Ok(s) => {
                rt.print(&s);
                Ok(Value::None)
            }
            Err(err) => Err(err),
        },
        "sprint" => Ok(Value::Str(join_values(args, " "))),
        "sprintf" => sprintf_args(name, args).map(Value::Str),
        "join" => array_arg(args, 0).and_then(|elements| {
            let sep = str_arg(args, 1)?;
            Ok(Value::Str(join_values(&elements, &sep)))
        }),
        "split" => str_arg(args, 0).and_then(|s| {
            let sep = str_arg(args, 1)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::Str(c.to_string())).collect()
            } else {
                s.split(&sep).map(|p| Value::Str(p.to_string())).collect()
            };
            Ok(Value::array(parts))
        }),
        "upper" => str_arg(args, 0).map(|s| Value::Str(s.to_uppercase())),
        "lower" => str_arg(args, 0).map(|s| Value::Str(s.to_lowercase())),
        "index" => str_arg(args, 0).and_then(|s| {
            let sub = str_arg(args, 1)?;
            let index = match s.find(&sub) {
                Some(byte_index) => s[..byte_index].chars().count() as f64,
                None => -1.0,
            };
            Ok(Value::Num(index))
        }),
        "startswith" => str_arg(args, 0).and_then(|s| {
            let prefix = str_arg(args, 1)?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }),
        "endswith" => str_arg(args, 0).and_then(|s| {
            let suffix = str_arg(args, 1)?;
            Ok(Value::Bool(s.ends_with(&suffix)))
        }),
        "trim" => str_arg(args, 0).and_then(|s| {
            let cutset = str_arg(args, 1)?;
            let trimmed = s.trim_matches(|c| cutset.contains(c));
            Ok(Value::Str(trimmed.to_string()))
        }),
        "replace" => str_arg(args, 0).and_then(|s| {
            let old = str_arg(args, 1)?;
            let new = str_arg(args, 2)?;
            Ok(Value::Str(s.replace(&old, &new)))
        }),
        "str2num" => {
            return Some(str_arg(args, 0).map(|s| {
                let (value, global_err) = match s.parse::<f64>() {
                    Ok(n) => (Value::Num(n), (false, String::new())),
                    Err(_) => (
                        Value::Num(0.0),
                        (true, format!("str2num: cannot parse {:?}", s)),
                    ),
                };
                BuiltinOutcome {
                    value,
                    global_err: Some(global_err),
                }
            }))
        }
        "str2bool" => {
            return Some(str_arg(args, 0).map(|s| {
                let (value, global_err) = match s.as_str() {
                    "true" | "True" | "TRUE" | "t" | "T" | "1" => {
                        (Value::Bool(true), (false, String::new()))
                    }
                    "false" | "False" | "FALSE" | "f" | "F" | "0" => {
                        (Value::Bool(false), (false, String::new()))
                    }
                    _ => (
                        Value::Bool(false),
                        (true, format!("str2bool: cannot parse {:?}", s)),
                    ),
                };
                BuiltinOutcome {
                    value,
                    global_err: Some(global_err),
                }
            }))
        }
        "len" => match args.first().map(|a| a.count()) {
            Some(Some(n)) => Ok(Value::Num(n as f64)),
            _ => Err(RuntimeError::BadArguments(format!(
                "'len' takes 1 argument of type 'string', array '[]' or map '{{}}' not {}",
                args.first().map(|a| a.unwrap_any().type_of()).unwrap_or(Type::None)
            ))),
        },
        "has" => map_arg(args, 0).and_then(|map| {
            let key = str_arg(args, 1)?;
            Ok(Value::Bool(map.borrow().has(&key)))
        }),
        "del" => map_arg(args, 0).and_then(|map| {
            let key = str_arg(args, 1)?;
            map.borrow_mut().delete(&key);
            Ok(Value::None)
        }),
        "sleep" => num_arg(args, 0).map(|secs| {
            if secs > 0.0 {
                (rt.sleep)(Duration::from_secs_f64(secs));
            }
            Value::None
        }),
        "rand" => {
            if args.is_empty() {
                Ok(Value::Num(rand::thread_rng().gen::<f64>()))
            } else {
                num_arg(args, 0).and_then(|upper| {
                    let upper = upper as i64;
                    if upper < 1 {
                        return Err(RuntimeError::BadArguments(format!(
                            "'rand' requires a positive upper bound, found {}",
                            format_num(upper as f64)
                        )));
                    }
                    Ok(Value::Num(rand::thread_rng().gen_range(0..upper) as f64))
                })
            }
        }
        "floor" => num_arg(args, 0).map(|n| Value::Num(n.floor())),
        "ceil" => num_arg(args, 0).map(|n| Value::Num(n.ceil())),
        "round" => num_arg(args, 0).map(|n| Value::Num(n.round())),
        "log" => num_arg(args, 0).map(|n| Value::Num(n.ln())),
        "sqrt" => num_arg(args, 0).map(|n| Value::Num(n.sqrt())),
        "sin" => num_arg(args, 0).map(|n| Value::Num(n.sin())),
        "cos" => num_arg(args, 0).map(|n| Value::Num(n.cos())),
        "min" => num_args2(args).map(|(x, y)| Value::Num(x.min(y))),
        "max" => num_args2(args).map(|(x, y)| Value::Num(x.max(y))),
        "pow" => num_args2(args).map(|(x, y)| Value::Num(x.powf(y))),
        "atan2" => num_args2(args).map(|(x, y)| Value::Num(x.atan2(y))),
        "move" | "line" | "rect" => num_args2(args).map(|(x, y)| {
            let f = match name {
                "move" => rt.graphics.move_fn.as_mut(),
                "line" => rt.graphics.line_fn.as_mut(),
                _ => rt.graphics.rect_fn.as_mut(),
            };
            match f {
                Some(f) => f(x, y),
                None => (rt.print)(&not_implemented(name)),
            }
            Value::None
        }),
        "circle" | "width" => num_arg(args, 0).map(|n| {
            let f = match name {
                "circle" => rt.graphics.circle_fn.as_mut(),
                _ => rt.graphics.width_fn.as_mut(),
            };
            match f {
                Some(f) => f(n),
                None => (rt.print)(&not_implemented(name)),
            }
            Value::None
        }),
        "color" | "colour" => str_arg(args, 0).map(|s| {
            match rt.graphics.color_fn.as_mut() {
                Some(f) => f(&s),
                None => (rt.print)(&not_implemented(name)),
            }
            Value::None
        }),
        _ => return None,
    };
    Some(result.map(BuiltinOutcome::value))
}

fn not_implemented(name: &str) -> String {
    format!("'{}' not yet implemented\n", name)
}

fn join_values(args: &[Value], sep: &str) -> String {
    let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    parts.join(sep)
}

fn num_arg(args: &[Value], i: usize) -> Result<f64, RuntimeError> {
    match args.get(i).map(Value::unwrap_any) {
        Some(Value::Num(n)) => Ok(*n),
        other => Err(bad_arg("num", i, other)),
    }
}

fn num_args2(args: &[Value]) -> Result<(f64, f64), RuntimeError> {
    Ok((num_arg(args, 0)?, num_arg(args, 1)?))
}

fn str_arg(args: &[Value], i: usize) -> Result<String, RuntimeError> {
    match args.get(i).map(Value::unwrap_any) {
        Some(Value::Str(s)) => Ok(s.clone()),
        other => Err(bad_arg("string", i, other)),
    }
}

fn array_arg(args: &[Value], i: usize) -> Result<Vec<Value>, RuntimeError> {
    match args.get(i).map(Value::unwrap_any) {
        Some(Value::Array(elements)) => Ok(elements.borrow().clone()),
        other => Err(bad_arg("array", i, other)),
    }
}

fn map_arg(
    args: &[Value],
    i: usize,
) -> Result<std::rc::Rc<std::cell::RefCell<crate::value::MapValue>>, RuntimeError> {
    match args.get(i).map(Value::unwrap_any) {
        Some(Value::Map(map)) => Ok(map.clone()),
        other => Err(bad_arg("map", i, other)),
    }
}

fn bad_arg(want: &str, i: usize, got: Option<&Value>) -> RuntimeError {
    RuntimeError::BadArguments(format!(
        "expected {} for argument {}, found {}",
        want,
        i + 1,
        got.map(|v| v.type_of().to_string()).unwrap_or_else(|| "nothing".to_string())
    ))
}

fn sprintf_args(name: &str, args: &[Value]) -> Result<String, RuntimeError> {
    match args.first().map(Value::unwrap_any) {
        Some(Value::Str(format)) => Ok(sprintf(format, &args[1..])),
        Some(_) => Err(RuntimeError::BadArguments(format!(
            "first argument of '{}' must be a string",
            name
        ))),
        None => Err(RuntimeError::BadArguments(format!(
            "'{}' takes at least 1 argument",
            name
        ))),
    }
}

/// A small printf-style formatter covering the directives Evy programs
/// use: %v %s %d %f %t %q and %%, with optional `-` flag, width and
/// precision.
pub fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut next_arg = 0;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut left_align = false;
        let mut width = String::new();
        let mut precision = String::new();
        while let Some(&next) = chars.peek() {
            match next {
                '-' if width.is_empty() => {
                    left_align = true;
                    chars.next();
                }
                '0'..='9' => {
                    width.push(next);
                    chars.next();
                }
                '.' => {
                    chars.next();
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_digit() {
                            precision.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    break;
                }
                _ => break,
            }
        }
        let verb = match chars.next() {
            Some(v) => v,
            None => {
                out.push('%');
                break;
            }
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = match args.get(next_arg) {
            Some(arg) => arg,
            None => {
                out.push_str(&format!("%!{}(MISSING)", verb));
                continue;
            }
        };
        next_arg += 1;
        let rendered = match verb {
            'v' => arg.to_string(),
            's' => arg.to_string(),
            'q' => format!("{:?}", arg.to_string()),
            't' => match arg.unwrap_any() {
                Value::Bool(b) => b.to_string(),
                other => format!("%!t({})", other),
            },
            'd' => match arg.unwrap_any() {
                Value::Num(n) => format!("{}", n.trunc() as i64),
                other => format!("%!d({})", other),
            },
            'f' => match arg.unwrap_any() {
                Value::Num(n) => {
                    let prec: usize = precision.parse().unwrap_or(6);
                    format!("{:.*}", prec, n)
                }
                other => format!("%!f({})", other),
            },
            other => format!("%!{}(UNKNOWN)", other),
        };
        let width: usize = width.parse().unwrap_or(0);
        if rendered.chars().count() >= width {
            out.push_str(&rendered);
        } else {
            let pad = width - rendered.chars().count();
            if left_align {
                out.push_str(&rendered);
                out.extend(std::iter::repeat(' ').take(pad));
            } else {
                out.extend(std::iter::repeat(' ').take(pad));
                out.push_str(&rendered);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture_runtime() -> (Runtime, Rc<RefCell<String>>) {
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        let rt = Runtime::new(move |s| sink.borrow_mut().push_str(s));
        (rt, output)
    }

    fn call(name: &str, args: &[Value], rt: &mut Runtime) -> Value {
        call_builtin(name, args, rt)
            .expect("builtin exists")
            .expect("builtin succeeds")
            .value
    }

    #[test]
    fn test_print() {
        let (mut rt, output) = capture_runtime();
        call(
            "print",
            &[Value::Num(1.0), Value::Str("abc".to_string())],
            &mut rt,
        );
        assert_eq!(*output.borrow(), "1 abc\n");
    }

    #[test]
    fn test_sprint() {
        let (mut rt, _) = capture_runtime();
        let got = call("sprint", &[Value::Num(1.5), Value::Bool(true)], &mut rt);
        assert!(got.equals(&Value::Str("1.5 true".to_string())));
    }

    #[test]
    fn test_sprintf() {
        assert_eq!(sprintf("%v %v", &[Value::Num(1.0), Value::Bool(true)]), "1 true");
        assert_eq!(sprintf("%d!", &[Value::Num(2.7)]), "2!");
        assert_eq!(sprintf("%.2f", &[Value::Num(1.0)]), "1.00");
        assert_eq!(sprintf("%5s|", &[Value::Str("ab".to_string())]), "   ab|");
        assert_eq!(sprintf("%-5s|", &[Value::Str("ab".to_string())]), "ab   |");
        assert_eq!(sprintf("%q", &[Value::Str("a".to_string())]), "\"a\"");
        assert_eq!(sprintf("100%%", &[]), "100%");
        assert_eq!(sprintf("%s", &[]), "%!s(MISSING)");
    }

    #[test]
    fn test_string_builtins() {
        let (mut rt, _) = capture_runtime();
        let s = |v: &str| Value::Str(v.to_string());
        assert!(call("upper", &[s("abc")], &mut rt).equals(&s("ABC")));
        assert!(call("lower", &[s("ABC")], &mut rt).equals(&s("abc")));
        assert!(call("index", &[s("hello"), s("ll")], &mut rt).equals(&Value::Num(2.0)));
        assert!(call("index", &[s("hello"), s("x")], &mut rt).equals(&Value::Num(-1.0)));
        assert!(call("startswith", &[s("hello"), s("he")], &mut rt).equals(&Value::Bool(true)));
        assert!(call("endswith", &[s("hello"), s("he")], &mut rt).equals(&Value::Bool(false)));
        assert!(call("trim", &[s("xxhixx"), s("x")], &mut rt).equals(&s("hi")));
        assert!(call("replace", &[s("aba"), s("a"), s("c")], &mut rt).equals(&s("cbc")));
    }

    #[test]
    fn test_split_join() {
        let (mut rt, _) = capture_runtime();
        let s = |v: &str| Value::Str(v.to_string());
        let parts = call("split", &[s("a,b,c"), s(",")], &mut rt);
        assert!(parts.equals(&Value::array(vec![s("a"), s("b"), s("c")])));
        let joined = call("join", &[parts, s("-")], &mut rt);
        assert!(joined.equals(&s("a-b-c")));
    }

    #[test]
    fn test_str2num() {
        let (mut rt, _) = capture_runtime();
        let outcome = call_builtin("str2num", &[Value::Str("2.5".to_string())], &mut rt)
            .expect("builtin")
            .expect("ok");
        assert!(outcome.value.equals(&Value::Num(2.5)));
        assert_eq!(outcome.global_err, Some((false, String::new())));

        let outcome = call_builtin("str2num", &[Value::Str("abc".to_string())], &mut rt)
            .expect("builtin")
            .expect("ok");
        assert!(outcome.value.equals(&Value::Num(0.0)));
        let (is_err, msg) = outcome.global_err.expect("err update");
        assert!(is_err);
        assert!(msg.contains("str2num"));
    }

    #[test]
    fn test_str2bool() {
        let (mut rt, _) = capture_runtime();
        let outcome = call_builtin("str2bool", &[Value::Str("true".to_string())], &mut rt)
            .expect("builtin")
            .expect("ok");
        assert!(outcome.value.equals(&Value::Bool(true)));
        assert_eq!(outcome.global_err, Some((false, String::new())));
    }

    #[test]
    fn test_len() {
        let (mut rt, _) = capture_runtime();
        assert!(call("len", &[Value::Str("héllo".to_string())], &mut rt).equals(&Value::Num(5.0)));
        let arr = Value::array(vec![Value::Num(1.0), Value::Num(2.0)]);
        assert!(call("len", &[arr], &mut rt).equals(&Value::Num(2.0)));
        let err = call_builtin("len", &[Value::Num(1.0)], &mut rt)
            .expect("builtin")
            .expect_err("len of num fails");
        assert!(matches!(err, RuntimeError::BadArguments(_)));
    }

    #[test]
    fn test_has_del() {
        let (mut rt, _) = capture_runtime();
        let mut map = crate::value::MapValue::new();
        map.insert("a", Value::Num(1.0));
        let m = Value::map(map);
        let s = |v: &str| Value::Str(v.to_string());
        assert!(call("has", &[m.clone(), s("a")], &mut rt).equals(&Value::Bool(true)));
        call("del", &[m.clone(), s("a")], &mut rt);
        assert!(call("has", &[m, s("a")], &mut rt).equals(&Value::Bool(false)));
    }

    #[test]
    fn test_math() {
        let (mut rt, _) = capture_runtime();
        assert!(call("floor", &[Value::Num(1.7)], &mut rt).equals(&Value::Num(1.0)));
        assert!(call("ceil", &[Value::Num(1.2)], &mut rt).equals(&Value::Num(2.0)));
        assert!(call("min", &[Value::Num(1.0), Value::Num(2.0)], &mut rt).equals(&Value::Num(1.0)));
        assert!(call("pow", &[Value::Num(2.0), Value::Num(10.0)], &mut rt).equals(&Value::Num(1024.0)));
        assert!(call("sqrt", &[Value::Num(9.0)], &mut rt).equals(&Value::Num(3.0)));
    }

    #[test]
    fn test_rand() {
        let (mut rt, _) = capture_runtime();
        for _ in 0..20 {
            let n = match call("rand", &[Value::Num(3.0)], &mut rt) {
                Value::Num(n) => n,
                other => panic!("rand returned {:?}", other),
            };
            assert!((0.0..3.0).contains(&n));
            assert_eq!(n.fract(), 0.0);
        }
        let f = match call("rand", &[], &mut rt) {
            Value::Num(n) => n,
            other => panic!("rand returned {:?}", other),
        };
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn test_graphics_without_callback() {
        let (mut rt, output) = capture_runtime();
        call("move", &[Value::Num(1.0), Value::Num(2.0)], &mut rt);
        assert_eq!(*output.borrow(), "'move' not yet implemented\n");
    }

    #[test]
    fn test_graphics_with_callback() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut rt = Runtime::new(|_| {});
        rt.graphics.circle_fn = Some(Box::new(move |r| sink.borrow_mut().push(r)));
        call("circle", &[Value::Num(5.0)], &mut rt);
        assert_eq!(*seen.borrow(), vec![5.0]);
    }

    #[test]
    fn test_unknown_builtin() {
        let (mut rt, _) = capture_runtime();
        assert!(call_builtin("no_such_builtin", &[], &mut rt).is_none());
    }
}

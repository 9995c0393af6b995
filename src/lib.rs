//! Evy language core
//!
//! Evy is a small, statically typed, block-structured scripting language
//! aimed at beginners, with first-class graphics and event-handler hooks.
//! This crate contains the language core: the parser with inline static
//! analysis, and the runtime in two forms - a tree-walking evaluator and
//! a bytecode compiler with a stack VM.
//!
//! # Architecture
//!
//! ```text
//! Source Code (.evy)
//!       │
//!       ▼
//! ┌─────────────┐
//! │    Lexer    │  → Tokens
//! └─────────────┘
//!       │
//!       ▼
//! ┌─────────────┐
//! │   Parser +  │  → Typed AST
//! │   Analyzer  │
//! └─────────────┘
//!       │
//!       ├──────────────────┐
//!       ▼                  ▼
//! ┌─────────────┐   ┌─────────────┐
//! │  Evaluator  │   │  Compiler   │  → Bytecode
//! └─────────────┘   └─────────────┘
//!                          │
//!                          ▼
//!                   ┌─────────────┐
//!                   │  Stack VM   │
//!                   └─────────────┘
//! ```
//!
//! The host embeds the core by injecting a [`Runtime`] with print, read,
//! sleep and optional graphics callbacks; see [`run`] for the one-call
//! entry point.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod span;
pub mod token;
pub mod types;
pub mod value;

// Re-exports for convenience
pub use builtins::Runtime;
pub use evaluator::{run, Evaluator};
pub use lexer::Lexer;
pub use parser::{parse, ParseErrors, Parser};
pub use token::{Token, TokenKind};
pub use value::{RuntimeError, Value};

use bytecode::{Bytecode, CompileError, Compiler};
use thiserror::Error;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File extension for Evy source files
pub const FILE_EXTENSION: &str = "evy";

/// A failure to produce bytecode: either the source did not parse, or it
/// uses a construct the bytecode backend does not cover
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseErrors),

    #[error("{0}")]
    Compile(#[from] CompileError),
}

/// Compile a source program to bytecode
pub fn compile(source: &str) -> Result<Bytecode, Error> {
    let program = parse(source, builtins::parser_builtins())?;
    let mut compiler = Compiler::new();
    compiler.compile(&program)?;
    Ok(compiler.bytecode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_facade() {
        let err = compile("x := 1 + 2\nprint x").expect_err("print is not compilable");
        assert!(matches!(err, Error::Compile(_)));
        let bytecode = compile("x := 1 + 2\nx = x").expect("compiles");
        assert!(!bytecode.instructions.is_empty());
    }

    #[test]
    fn test_compile_parse_error() {
        let err = compile("x := ").expect_err("parse error");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_run_facade() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        let mut runtime = Runtime::new(move |s| sink.borrow_mut().push_str(s));
        run("print \"hello\"", &mut runtime);
        assert_eq!("hello\n", *output.borrow());
    }
}

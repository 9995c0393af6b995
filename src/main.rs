//! Evy command line interface
//!
//! `evy run FILE` parses and evaluates an Evy source file with the
//! standard I/O runtime. The exit code is 0 on a clean run and 1 on a
//! parse or runtime error.

use clap::{Parser as ClapParser, Subcommand};
use evy::bytecode::{self, Compiler, Vm};
use evy::{builtins, Evaluator, Parser, Runtime};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(name = "evy")]
#[command(version = evy::VERSION)]
#[command(about = "Evy is a simple programming language, made to learn coding", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an Evy source file
    Run {
        /// Input file to run
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Execute with the bytecode VM instead of the tree evaluator
        #[arg(long)]
        vm: bool,

        /// Emit tokens (for debugging)
        #[arg(long)]
        emit_tokens: bool,

        /// Emit the canonical AST dump (for debugging)
        #[arg(long)]
        emit_ast: bool,

        /// Emit disassembled bytecode (for debugging, implies --vm)
        #[arg(long)]
        emit_bytecode: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            input,
            vm,
            emit_tokens,
            emit_ast,
            emit_bytecode,
        } => run_file(&input, vm || emit_bytecode, emit_tokens, emit_ast, emit_bytecode),
    }
}

fn run_file(
    input: &PathBuf,
    use_vm: bool,
    emit_tokens: bool,
    emit_ast: bool,
    emit_bytecode: bool,
) -> ExitCode {
    let source = match fs::read_to_string(input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {}: {}", input.display(), err);
            return ExitCode::FAILURE;
        }
    };

    if emit_tokens {
        let (tokens, _) = evy::lexer::lex(&source);
        for token in &tokens {
            println!("{}: {} {:?}", token.pos, token.kind, token.text(&source));
        }
    }

    let mut parser = Parser::new(&source, builtins::parser_builtins());
    let program = parser.parse();
    if parser.has_errors() {
        eprint!("{}", parser.errors().truncate(8));
        return ExitCode::FAILURE;
    }

    if emit_ast {
        print!("{}", program);
    }

    if use_vm {
        let mut compiler = Compiler::new();
        if let Err(err) = compiler.compile(&program) {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
        let bytecode = compiler.bytecode();
        if emit_bytecode {
            print!("{}", bytecode::disassemble(&bytecode));
        }
        let mut vm = Vm::new(bytecode);
        if let Err(err) = vm.run() {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    let mut runtime = Runtime::stdio();
    let mut evaluator = Evaluator::new(&program, &mut runtime);
    if let Err(err) = evaluator.run(&program) {
        println!("{}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

//! The main compiler binary. Takes a HolyC source file, an optional output
//! stage, and an optimization flag.
//!
//! Run with `--help` for more info.

use holyc_core::back::{aot, codegen};
use holyc_core::config::CompilerConfig;
use holyc_core::diagnostics::DiagnosticBag;
use holyc_core::front;
use holyc_core::middle::{self, optimize, types::TypeChecker};

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// The input source file.
    file: String,
    /// The output stage to emit.
    #[arg(value_enum, short, long, default_value_t = Output::Aot)]
    out: Output,
    /// Turn on the optimizer passes.
    #[arg(short = 'O', long, default_value_t = false)]
    optimize: bool,
    /// Load origin address for the AOT image (§3, §4.6).
    #[arg(long, default_value_t = 0x0000_0000_0040_0000)]
    origin: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// The list of tokens.
    Tokens,
    /// The AST, after parsing and scope/symbol resolution.
    Ast,
    /// The linear IR, after lowering and (optionally) optimization.
    Ir,
    /// The generated x86-64 instruction stream, one function at a time.
    Asm,
    /// The assembled AOT binary image (default).
    Aot,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn report(diags: &DiagnosticBag) {
    for record in diags.records() {
        eprintln!("{record}");
    }
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let input = String::from_utf8(std::fs::read(&args.file).expect("input file should be readable"))
        .expect("input file should be valid utf-8");

    let config = CompilerConfig::default();

    if args.out == Output::Tokens {
        let mut lexer = front::lex::Lexer::new(&input);
        let mut lex_diags = DiagnosticBag::new();
        loop {
            let token = lexer.next(&mut lex_diags);
            let done = token.kind == front::token::TokenKind::Eof;
            println!("{token}");
            if done {
                break;
            }
        }
        report(&lex_diags);
        std::process::exit(lex_diags.exit_code());
    }

    let (ast, symbols, mut diags) = front::parse(&input, &config);
    if args.out == Output::Ast {
        println!("{ast:#?}");
        report(&diags);
        std::process::exit(diags.exit_code());
    }

    let type_diags = TypeChecker::new(&ast, &symbols).check_program();
    diags.merge(type_diags);

    if diags.has_errors() {
        report(&diags);
        std::process::exit(diags.exit_code());
    }

    let mut program = middle::lower(&ast);
    if args.optimize {
        program = optimize::optimize(program, config.enabled_passes);
    }

    if args.out == Output::Ir {
        println!("{program:#?}");
        report(&diags);
        std::process::exit(diags.exit_code());
    }

    let functions = codegen::codegen(&program);
    if args.out == Output::Asm {
        for f in &functions {
            println!("{}:", f.name);
            for instr in &f.body {
                println!("  {instr:?}");
            }
        }
        report(&diags);
        std::process::exit(diags.exit_code());
    }

    let image = aot::assemble(&functions, &program.globals, args.origin, &config);
    println!(
        "origin=0x{:x} bytes={} blocks={} unresolved_locals={} unresolved_globals={} heap_globals={}",
        image.header.origin,
        image.header.total_bytes,
        image.blocks.len(),
        image.header.unresolved_local_count,
        image.header.unresolved_global_count,
        image.header.heap_global_count,
    );
    if !image.unresolved_globals.is_empty() {
        eprintln!("note: unresolved import symbols left for the loader:");
        for r in &image.unresolved_globals {
            eprintln!("  {} at image offset {}", r.symbol, r.offset);
        }
    }

    report(&diags);
    std::process::exit(diags.exit_code());
}

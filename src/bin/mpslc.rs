//! A thin development CLI over the `mpsl` library: dumps tokens, the
//! analyzed/folded AST, the optimized IR, or the generated machine code for
//! a source file against a caller-described argument layout.
//!
//! Not part of the library's public contract (spec.md calls demo
//! executables out of scope); this exists the way `src/bin/smolc.rs` does
//! in the teacher crate, as development tooling that drives the pipeline
//! end to end.
//!
//! run with `--help` for more info.

use clap::{Parser, ValueEnum};

use mpsl::common::diag::{Category, CollectingLog};
use mpsl::common::lang::{parse_type_name, Access, Type};
use mpsl::front::lex::Lexer;
use mpsl::{CompileOptions, Context, Layout, Program};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input source file
    file: String,
    /// what to print
    #[arg(value_enum, short, long, default_value_t = Output::Asm)]
    out: Output,
    /// an argument-block field, `name:type[:ro|wo]` (e.g. `ia:int:ro`),
    /// repeatable; offsets are assigned in order, each at its type's
    /// natural alignment
    #[arg(long = "field")]
    fields: Vec<String>,
    #[arg(long)]
    disable_sse4_1: bool,
    #[arg(long)]
    disable_avx: bool,
    #[arg(long)]
    disable_avx2: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the analyzed, folded ast
    Ast,
    /// the optimized ir
    Ir,
    /// the resulting machine code, as a hex dump
    Asm,
}

fn build_layout(specs: &[String]) -> Layout {
    let mut layout = Layout::new();
    let mut offset = 0u32;
    for spec in specs {
        let mut parts = spec.splitn(3, ':');
        let name = parts.next().expect("field needs a name");
        let type_name = parts.next().expect("field needs `name:type`");
        let access = match parts.next() {
            Some("ro") => Access::ReadOnly,
            Some("wo") => Access::WriteOnly,
            Some(other) => panic!("unknown access `{other}`, expected `ro` or `wo`"),
            None => Access::ReadOnly,
        };
        let ty = parse_type_name(type_name)
            .unwrap_or_else(|| panic!("unknown type `{type_name}` in field `{spec}`"))
            .with_access(access);
        let align = ty.align_bytes().max(1);
        offset = offset.div_ceil(align) * align;
        layout.add_member(name, ty, offset).expect("field should be addable");
        offset += ty.size_bytes();
    }
    layout
}

fn main() {
    env_logger::init();
    use Output::*;
    let args = Args::parse();

    let input = std::fs::read_to_string(&args.file).expect("file should be readable as utf-8");
    let layout = build_layout(&args.fields);

    match args.out {
        Tokens => {
            let mut lexer = Lexer::new(&input);
            loop {
                match lexer.next() {
                    Ok(Some(tok)) => println!("{tok}"),
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("lex error: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        Ast | Ir | Asm => {
            let ctx = Context::create();
            let options = match args.out {
                Ast => CompileOptions::DEBUG_AST,
                Ir => CompileOptions::DEBUG_AST | CompileOptions::DEBUG_IR,
                Asm => CompileOptions::DEBUG_AST | CompileOptions::DEBUG_IR | CompileOptions::DEBUG_ASM,
                Tokens => unreachable!(),
            };
            let options = options
                | if args.disable_sse4_1 { CompileOptions::DISABLE_SSE4_1 } else { CompileOptions::empty() }
                | if args.disable_avx { CompileOptions::DISABLE_AVX } else { CompileOptions::empty() }
                | if args.disable_avx2 { CompileOptions::DISABLE_AVX2 } else { CompileOptions::empty() };

            let log = CollectingLog::new();
            let result = Program::compile(&ctx, &input, options, &layout, Some(&log));

            let want = match args.out {
                Ast => Category::AstFinal,
                Ir => Category::IrFinal,
                Asm => Category::MachineCode,
                Tokens => unreachable!(),
            };
            for msg in log.messages().iter() {
                if msg.category == want || msg.category == Category::Error {
                    println!("--- {} ---\n{}", msg.header, msg.body);
                }
            }
            if let Err(e) = result {
                eprintln!("compile failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use tern_parser::{to_miette_report, Compiler};

use crate::cli::{EXIT_INTERNAL, EXIT_OK, EXIT_UNCAUGHT};
use crate::commands::compile_options;

#[derive(Args)]
pub struct CompileArgs {
    /// The program's main source file
    pub file: PathBuf,

    /// Emit the diagnostics as JSON
    #[arg(long)]
    pub json: bool,

    /// Render diagnostics with source snippets
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Serialize)]
struct Summary {
    functions: usize,
    types: usize,
    files: Vec<String>,
}

pub fn execute(args: CompileArgs) -> i32 {
    let mut compiler = Compiler::new(compile_options());
    match compiler.compile_file(&args.file) {
        Ok(program) => {
            if args.json {
                let summary = Summary {
                    functions: program.functions.len(),
                    types: program.types.len(),
                    files: program.files.clone(),
                };
                println!("{}", serde_json::to_string_pretty(&summary).unwrap());
            } else {
                println!(
                    "{}: {} functions, {} types",
                    args.file.display(),
                    program.functions.len(),
                    program.types.len()
                );
            }
            EXIT_OK
        }
        Err(tern_parser::CompileError::HasErrors(_)) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&compiler.diags).unwrap()
                );
            } else if args.pretty {
                let source = std::fs::read_to_string(&args.file).unwrap_or_default();
                for d in &compiler.diags.diagnostics {
                    let report = to_miette_report(&d.file, &source, d);
                    eprintln!("{report:?}");
                }
            } else {
                eprint!("{}", compiler.diags.render());
            }
            EXIT_UNCAUGHT
        }
        Err(e) => {
            eprintln!("tern: {e}");
            EXIT_INTERNAL
        }
    }
}

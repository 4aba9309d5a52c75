use std::path::PathBuf;

use clap::Args;

use tern_bytecode::debug::dump_program;
use tern_parser::Compiler;

use crate::cli::{EXIT_INTERNAL, EXIT_OK, EXIT_UNCAUGHT};
use crate::commands::compile_options;

#[derive(Args)]
pub struct DisArgs {
    /// The program's main source file
    pub file: PathBuf,
}

pub fn execute(args: DisArgs) -> i32 {
    let mut compiler = Compiler::new(compile_options());
    match compiler.compile_file(&args.file) {
        Ok(program) => {
            print!("{}", dump_program(&program));
            EXIT_OK
        }
        Err(tern_parser::CompileError::HasErrors(_)) => {
            eprint!("{}", compiler.diags.render());
            EXIT_UNCAUGHT
        }
        Err(e) => {
            eprintln!("tern: {e}");
            EXIT_INTERNAL
        }
    }
}

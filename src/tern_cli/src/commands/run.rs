use std::path::PathBuf;

use clap::Args;
use log::debug;

use tern_parser::Compiler;
use tern_vm::{Outcome, Vm};

use crate::cli::{EXIT_INTERNAL, EXIT_OK, EXIT_REQUESTED, EXIT_UNCAUGHT};
use crate::commands::compile_options;

#[derive(Args)]
pub struct RunArgs {
    /// The program's main source file
    pub file: PathBuf,

    /// Arguments passed to the program's Main function
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

pub fn execute(args: RunArgs) -> i32 {
    let mut compiler = Compiler::new(compile_options());
    let program = match compiler.compile_file(&args.file) {
        Ok(p) => p,
        Err(tern_parser::CompileError::HasErrors(_)) => {
            eprint!("{}", compiler.diags.render());
            return EXIT_UNCAUGHT;
        }
        Err(e) => {
            eprintln!("tern: {e}");
            return EXIT_INTERNAL;
        }
    };
    debug!(
        "compiled {} functions, {} types",
        program.functions.len(),
        program.types.len()
    );

    let mut vm = Vm::new(program);
    match vm.run(&args.args) {
        Outcome::Finished => EXIT_OK,
        Outcome::ExitRequested(code) => {
            if code == 0 {
                EXIT_OK
            } else if code > 0 {
                code.min(255)
            } else {
                EXIT_REQUESTED
            }
        }
        Outcome::Uncaught(rendered) => {
            eprint!("{rendered}");
            EXIT_UNCAUGHT
        }
    }
}

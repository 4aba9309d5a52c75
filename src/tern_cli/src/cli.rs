use std::ffi::OsString;

use clap::{Parser, Subcommand};

use crate::commands;

/// Exit statuses: 0 success, 2 user-requested exit, 3 uncaught
/// exception, 4 internal error.
pub const EXIT_OK: i32 = 0;
pub const EXIT_REQUESTED: i32 = 2;
pub const EXIT_UNCAUGHT: i32 = 3;
pub const EXIT_INTERNAL: i32 = 4;

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "The Tern interpreter", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile and run a Tern program
    Run(commands::run::RunArgs),

    /// Compile a program and report diagnostics without running it
    Compile(commands::compile::CompileArgs),

    /// Print the disassembly of a compiled program
    Dis(commands::dis::DisArgs),
}

const SUBCOMMANDS: &[&str] = &["run", "compile", "dis", "help"];

/// The plain invocation form `tern <source-file> [args...]` runs the
/// program: when the first argument names neither a subcommand nor an
/// option, a `run` is inserted in front of it.
fn normalized_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = std::env::args_os().collect();
    let is_bare_file = args
        .get(1)
        .map(|first| {
            let text = first.to_string_lossy();
            !text.starts_with('-') && !SUBCOMMANDS.contains(&text.as_ref())
        })
        .unwrap_or(false);
    if is_bare_file {
        args.insert(1, OsString::from("run"));
    }
    args
}

pub fn run() -> i32 {
    let cli = Cli::parse_from(normalized_args());
    match cli.command {
        Commands::Run(args) => commands::run::execute(args),
        Commands::Compile(args) => commands::compile::execute(args),
        Commands::Dis(args) => commands::dis::execute(args),
    }
}

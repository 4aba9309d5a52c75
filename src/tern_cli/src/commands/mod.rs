pub mod compile;
pub mod dis;
pub mod run;

use std::path::PathBuf;

use tern_parser::CompileOptions;

/// Search paths for module resolution: the entries of `TERNPATH` (the
/// source file's directory is prepended by the compiler, the standard
/// library base would follow).
pub fn search_paths_from_env() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    match std::env::var("TERNPATH") {
        Ok(val) => val
            .split(sep)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn compile_options() -> CompileOptions {
    CompileOptions {
        search_paths: search_paths_from_env(),
        native_modules: vec![tern_vm::PRELUDE],
    }
}

//! Driver-level errors and diagnostic rendering adapters.
//!
//! User-level problems in source code are never `Err` values; they
//! accumulate as diagnostics so one run reports as many as possible.
//! `CompileError` covers the failures that stop a run outright.

use miette::{LabeledSpan, NamedSource, Report, SourceSpan};
use thiserror::Error;

use tern_syntax::Diagnostic;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("module {0} not found on the search path")]
    ModuleNotFound(String),
    #[error("compilation failed with {0} error(s)")]
    HasErrors(usize),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Build a miette report for one diagnostic, with a labeled span at the
/// start of the offending line.
pub fn to_miette_report(src_name: &str, src: &str, diagnostic: &Diagnostic) -> Report {
    let line = diagnostic.line.max(1) as usize;
    let offset: usize = src
        .lines()
        .take(line - 1)
        .map(|l| l.len() + 1)
        .sum();
    let len = src.lines().nth(line - 1).map(str::len).unwrap_or(0).max(1);
    let span = SourceSpan::new(offset.into(), len.into());
    let label = LabeledSpan::at(span, diagnostic.message.clone());
    miette::miette!(labels = vec![label], "{}", diagnostic.message)
        .with_source_code(NamedSource::new(src_name, src.to_string()))
}

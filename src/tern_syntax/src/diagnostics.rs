//! Accumulated compile-time diagnostics.
//!
//! Compilation never stops at the first problem: errors collect here with
//! their location and context, the compiler recovers, and one run reports
//! as many errors as possible. Rendering prefixes each run of diagnostics
//! that share a context with a single context line.

use serde::{Deserialize, Serialize};

/// Tern diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // Lexical
    UnterminatedString,   // String literal not closed before end of line
    InvalidNumeric,       // Malformed numeric literal
    UnrecognizedChar,     // Character outside any literal or comment
    NonAsciiChar,         // Byte >= 128 under the ascii encoding
    InvalidUtf8,          // Malformed UTF-8 sequence
    InvalidEncoding,      // Unknown or conflicting encoding declaration

    // Parse
    ParseError,           // Unexpected token
    InvalidLvalue,        // Assignment target cannot be stored to
    InvalidExceptionType, // except names something that is not a class
    BreakOutsideLoop,     // break with no enclosing loop

    // Semantic
    Redefined,            // Name defined twice in one scope or type
    UndefinedName,        // Reference to a name with no meaning
    AmbiguousName,        // Name visible from several imported modules
    CycleInSupertype,     // Supertype chain reaches the class itself
    IncompatibleWithSuper,// Member kind conflicts with an inherited member
    InterfaceNotImplemented, // Required interface member missing
    InvalidInterfaceMember,  // Interface declares a private or variable member
    ModuleNotFound,       // Import target not present on the search path
    WrongArgumentCount,   // Call arity outside the declared range

    // Internal limits
    FrameTooLarge,        // Too many locals in one function
    TooDeepNesting,       // Anonymous functions nested too deeply
    ExpressionTooDeep,    // Expression recursion limit

    // Resources
    OutOfMemory,          // Allocator failure during compilation
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// The enclosing definition a diagnostic points into, used for the
/// rendered prefix chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticContext {
    None,
    MainLevel,
    Function(String),
    Class(String),
    Member { class: String, member: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub context: DiagnosticContext,
}

impl Diagnostic {
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            code,
            severity: Severity::Error,
            message: message.into(),
            file: String::new(),
            line: 0,
            context: DiagnosticContext::None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Diagnostic {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn in_context(mut self, context: DiagnosticContext) -> Diagnostic {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticCollection {
    pub diagnostics: Vec<Diagnostic>,
    /// Set when the allocator failed; rendered last.
    pub out_of_memory: bool,
}

impl DiagnosticCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d.severity, Severity::Error))
    }

    pub fn has_errors(&self) -> bool {
        self.out_of_memory || self.errors().count() > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn extend(&mut self, other: DiagnosticCollection) {
        self.diagnostics.extend(other.diagnostics);
        self.out_of_memory |= other.out_of_memory;
    }

    /// Render every diagnostic, deduplicating context prefixes across
    /// adjacent diagnostics that share one.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut prev_context: Option<(&str, &DiagnosticContext)> = None;
        for d in &self.diagnostics {
            let ctx = (d.file.as_str(), &d.context);
            if prev_context != Some(ctx) {
                match &d.context {
                    DiagnosticContext::None => {}
                    DiagnosticContext::MainLevel => {
                        out.push_str(&format!("{}: At main level:\n", d.file));
                    }
                    DiagnosticContext::Function(name) => {
                        out.push_str(&format!("{}: In function \"{}\":\n", d.file, name));
                    }
                    DiagnosticContext::Class(name) => {
                        out.push_str(&format!("{}: In class \"{}\":\n", d.file, name));
                    }
                    DiagnosticContext::Member { class, member } => {
                        out.push_str(&format!(
                            "{}: In member \"{}\" of class \"{}\":\n",
                            d.file, member, class
                        ));
                    }
                }
                prev_context = Some(ctx);
            }
            out.push_str(&format!("{}, line {}: {}\n", d.file, d.line, d.message));
        }
        if self.out_of_memory {
            out.push_str("Out of memory during compilation\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_context_prefixes_are_deduplicated() {
        let mut c = DiagnosticCollection::new();
        let ctx = DiagnosticContext::Function("Main".to_string());
        c.add(
            Diagnostic::error(DiagnosticCode::UndefinedName, "\"x\" undefined")
                .at("a.tn", 2)
                .in_context(ctx.clone()),
        );
        c.add(
            Diagnostic::error(DiagnosticCode::UndefinedName, "\"y\" undefined")
                .at("a.tn", 3)
                .in_context(ctx),
        );
        let rendered = c.render();
        assert_eq!(rendered.matches("In function \"Main\"").count(), 1);
        assert!(rendered.contains("a.tn, line 2: \"x\" undefined"));
        assert!(rendered.contains("a.tn, line 3: \"y\" undefined"));
    }

    #[test]
    fn out_of_memory_is_rendered_last() {
        let mut c = DiagnosticCollection::new();
        c.add(Diagnostic::error(DiagnosticCode::ParseError, "unexpected token").at("a.tn", 1));
        c.out_of_memory = true;
        assert!(c.has_errors());
        assert!(c.render().ends_with("Out of memory during compilation\n"));
    }
}

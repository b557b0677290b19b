//! Structured diagnostics shared across every phase of the pipeline (§3.1,
//! §6, §7).
//!
//! Every phase pushes [`Diagnostic`] values into a shared [`DiagnosticBag`]
//! rather than printing directly, so presentation is left to the driver
//! (out of scope, §1).

use std::fmt;

use derive_more::Display;

use crate::common::Id;

/// Which phase of the pipeline produced a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Phase {
    #[display("Lex")]
    Lex,
    #[display("Parse")]
    Parse,
    #[display("Type")]
    Type,
    #[display("Ir")]
    Ir,
    #[display("Codegen")]
    Codegen,
    #[display("Aot")]
    Aot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
}

/// A single structured diagnostic record (§6 Error reporting).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub phase: Phase,
    pub file: Option<Id>,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(phase: Phase, line: u32, column: u32, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            phase,
            file: None,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn warning(phase: Phase, line: u32, column: u32, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            phase,
            file: None,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn with_file(mut self, file: Id) -> Self {
        self.file = Some(file);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            // Kept as "Parse error" for the Parse phase to match the exact
            // user-visible wording in §7; other phases use their own prefix.
            Severity::Error if matches!(self.phase, Phase::Parse) => write!(
                f,
                "Parse error at line {}, column {}: {}",
                self.line, self.column, self.message
            ),
            Severity::Error => write!(
                f,
                "{} error at line {}, column {}: {}",
                self.phase, self.line, self.column, self.message
            ),
            Severity::Warning => write!(
                f,
                "Warning at line {}, column {}: {}",
                self.line, self.column, self.message
            ),
        }
    }
}

/// Accumulates diagnostics across the whole pipeline and tracks whether
/// compilation should be reported as failed (§6, §7: exit code is non-zero
/// iff the error count is non-zero).
#[derive(Clone, Debug, Default)]
pub struct DiagnosticBag {
    records: Vec<Diagnostic>,
    error_count: u32,
    warning_count: u32,
}

impl DiagnosticBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        match diag.severity {
            Severity::Error => self.error_count += 1,
            Severity::Warning => self.warning_count += 1,
        }
        self.records.push(diag);
    }

    pub fn error(&mut self, phase: Phase, line: u32, column: u32, message: impl Into<String>) {
        self.push(Diagnostic::error(phase, line, column, message));
    }

    pub fn warning(&mut self, phase: Phase, line: u32, column: u32, message: impl Into<String>) {
        self.push(Diagnostic::warning(phase, line, column, message));
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Exit code per §6/§7: 0 iff no error-severity record was produced.
    pub fn exit_code(&self) -> i32 {
        if self.has_errors() {
            1
        } else {
            0
        }
    }

    pub fn merge(&mut self, other: DiagnosticBag) {
        for record in other.records {
            self.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_zero_with_only_warnings() {
        let mut bag = DiagnosticBag::new();
        bag.warning(Phase::Parse, 3, 1, "variable 'a' already defined in current scope");
        assert_eq!(bag.exit_code(), 0);
        assert!(!bag.has_errors());
    }

    #[test]
    fn exit_code_is_nonzero_with_any_error() {
        let mut bag = DiagnosticBag::new();
        bag.warning(Phase::Lex, 1, 1, "cosmetic");
        bag.error(Phase::Type, 2, 5, "incompatible assignment");
        assert_eq!(bag.exit_code(), 1);
        assert_eq!(bag.error_count(), 1);
        assert_eq!(bag.warning_count(), 1);
    }

    #[test]
    fn display_matches_documented_wire_format() {
        let err = Diagnostic::error(Phase::Parse, 4, 2, "expected ';'");
        assert_eq!(
            err.to_string(),
            "Parse error at line 4, column 2: expected ';'"
        );
        let warn = Diagnostic::warning(Phase::Parse, 4, 2, "redeclaration");
        assert_eq!(warn.to_string(), "Warning at line 4, column 2: redeclaration");
    }
}

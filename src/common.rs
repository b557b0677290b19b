//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers. Interned so that equality and hashing are pointer-cheap and so
/// that every phase shares one canonical name for a given symbol.
pub type Id = internment::Intern<String>;

/// Intern a string as an [`Id`].
pub fn intern(s: impl Into<String>) -> Id {
    internment::Intern::new(s.into())
}

/// A 1-based source line/column pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub const START: Pos = Pos { line: 1, column: 1 };

    pub fn new(line: u32, column: u32) -> Self {
        Pos { line, column }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

//! Rule language: lexer, parser, and tree-walking interpreter.
//!
//! `compile` turns rule source into a [`CompiledRule`]; `execute` runs one
//! compiled rule against one typed event. Compilation is pure and
//! deterministic, so compiled rules are cached per (rule id, revision) and
//! only rebuilt when the logic changes.

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;

pub use ast::{CompiledRule, Value};
pub use interp::{execute, ListResolver, RuntimeError};
pub use parser::compile;

use std::fmt;

/// Rejection of rule source at authoring time: bad syntax, an unsupported
/// construct, or a reference that is not `$field`/`@List`/literal/operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub fragment: String,
    pub message: String,
}

impl CompileError {
    pub fn new(line: usize, fragment: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            fragment: fragment.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fragment.is_empty() {
            write!(f, "line {}: {}", self.line, self.message)
        } else {
            write!(f, "line {}: {} (near '{}')", self.line, self.message, self.fragment)
        }
    }
}

impl std::error::Error for CompileError {}

//! Abstract syntax for the rule language.
//!
//! Rules are a restricted, indentation-sensitive expression/statement
//! language. The only ways out of a rule's own scope are `$field` (event
//! lookup) and `@Name` (named-list lookup); there is deliberately no
//! assignment, no calls, no imports, and no attribute access, so an
//! executing rule can never reach host I/O or mutate anything.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Runtime value flowing through rule evaluation.
///
/// Event fields arrive as JSON and are lifted into this type by the field
/// type registry before any rule sees them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Timestamp(_) => "datetime",
        }
    }

    /// Truthiness follows the source language: empty/zero/null are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Timestamp(_) => true,
        }
    }

    /// Numeric view for mixed int/float arithmetic and comparison.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality with int/float coercion (`1 == 1.0` holds).
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `$name` — event field lookup, resolved at execution time.
    Field(String),
    /// `@Name` — named-list lookup, resolved at execution time.
    ListRef(String),
    /// Bare identifier, only valid when bound by an enclosing `for`.
    Var(String),
    ListLit(Vec<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    If {
        /// (condition, block) arms: the `if` plus any `elif`s, in order.
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_block: Option<Vec<Stmt>>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Return(Expr),
}

/// Validated, executable form of one rule at one revision.
///
/// Immutable once built; the engine caches these per (rule id, revision) and
/// rebuilds on any logic change. Field/list references stay symbolic so list
/// membership and field casts can change without recompiling.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub body: Vec<Stmt>,
    /// Distinct `$` identifiers in source order.
    pub referenced_fields: Vec<String>,
    /// Distinct `@` names in source order.
    pub referenced_lists: Vec<String>,
}

impl CompiledRule {
    pub fn referenced_fields(&self) -> &[String] {
        &self.referenced_fields
    }

    pub fn referenced_lists(&self) -> &[String] {
        &self.referenced_lists
    }
}

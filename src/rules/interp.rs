//! Tree-walking evaluator for compiled rules.
//!
//! Execution is side-effect-free and bounded: the only inputs are the typed
//! event and the list resolver, the only output is an optional outcome
//! string, and every evaluated node costs one step against a fixed budget.
//! Anything that goes wrong mid-expression is a [`RuntimeError`]; the
//! orchestrator decides whether that is contained (fan-out, shadow) or
//! surfaced (authoring-time test runs).

use std::collections::HashMap;
use std::fmt;

use super::ast::{BinOp, CompiledRule, Expr, Stmt, UnaryOp, Value};

/// Event payload after field casting: field name -> typed value.
pub type TypedEvent = HashMap<String, Value>;

/// Read-only view of named lists at execution time.
///
/// Resolved per reference, not at compile time, so list edits take effect
/// without recompiling any rule.
pub trait ListResolver {
    fn members(&self, name: &str) -> Option<Vec<String>>;
}

impl ListResolver for HashMap<String, Vec<String>> {
    fn members(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).cloned()
    }
}

/// Upper bound on evaluated AST nodes per execution. A rule that exceeds it
/// is treated as failed, never as a stall on the evaluation path.
const STEP_BUDGET: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    MissingField(String),
    UnknownList(String),
    UnboundVariable(String),
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    NotIterable(&'static str),
    DivisionByZero,
    Arithmetic(String),
    NonStringOutcome(&'static str),
    BudgetExceeded,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::MissingField(name) => write!(f, "event has no field '{name}'"),
            RuntimeError::UnknownList(name) => write!(f, "no named list '{name}'"),
            RuntimeError::UnboundVariable(name) => write!(f, "unbound variable '{name}'"),
            RuntimeError::TypeMismatch { op, lhs, rhs } => {
                write!(f, "cannot apply '{op}' to {lhs} and {rhs}")
            }
            RuntimeError::NotIterable(t) => write!(f, "cannot iterate over {t}"),
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::Arithmetic(msg) => write!(f, "{msg}"),
            RuntimeError::NonStringOutcome(t) => {
                write!(f, "rule returned {t}, outcomes must be strings")
            }
            RuntimeError::BudgetExceeded => write!(f, "rule exceeded its execution budget"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Run one compiled rule against one typed event.
///
/// `Ok(None)` means the rule completed without returning an outcome, which
/// is the normal "no decision" result for non-matching events.
pub fn execute(
    compiled: &CompiledRule,
    event: &TypedEvent,
    lists: &dyn ListResolver,
) -> Result<Option<String>, RuntimeError> {
    let mut interp = Interp {
        event,
        lists,
        scope: Vec::new(),
        steps: 0,
    };
    match interp.exec_block(&compiled.body)? {
        Some(Value::Str(outcome)) => Ok(Some(outcome)),
        Some(other) => Err(RuntimeError::NonStringOutcome(other.type_name())),
        None => Ok(None),
    }
}

struct Interp<'a> {
    event: &'a TypedEvent,
    lists: &'a dyn ListResolver,
    /// Loop-variable bindings, innermost last.
    scope: Vec<(String, Value)>,
    steps: usize,
}

impl<'a> Interp<'a> {
    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        if self.steps > STEP_BUDGET {
            Err(RuntimeError::BudgetExceeded)
        } else {
            Ok(())
        }
    }

    /// Execute statements until one returns. `Some(value)` propagates the
    /// `return` up through every enclosing block and loop.
    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Option<Value>, RuntimeError> {
        for stmt in stmts {
            self.tick()?;
            match stmt {
                Stmt::Return(expr) => {
                    let value = self.eval(expr)?;
                    return Ok(Some(value));
                }
                Stmt::If { arms, else_block } => {
                    let mut matched = false;
                    for (cond, block) in arms {
                        if self.eval(cond)?.is_truthy() {
                            matched = true;
                            if let Some(ret) = self.exec_block(block)? {
                                return Ok(Some(ret));
                            }
                            break;
                        }
                    }
                    if !matched {
                        if let Some(block) = else_block {
                            if let Some(ret) = self.exec_block(block)? {
                                return Ok(Some(ret));
                            }
                        }
                    }
                }
                Stmt::For { var, iter, body } => {
                    let items = match self.eval(iter)? {
                        Value::List(items) => items,
                        other => return Err(RuntimeError::NotIterable(other.type_name())),
                    };
                    for item in items {
                        self.tick()?;
                        self.scope.push((var.clone(), item));
                        let result = self.exec_block(body);
                        self.scope.pop();
                        if let Some(ret) = result? {
                            return Ok(Some(ret));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        self.tick()?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(name) => self
                .event
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::MissingField(name.clone())),
            Expr::ListRef(name) => {
                let members = self
                    .lists
                    .members(name)
                    .ok_or_else(|| RuntimeError::UnknownList(name.clone()))?;
                Ok(Value::List(members.into_iter().map(Value::Str).collect()))
            }
            Expr::Var(name) => self
                .scope
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| RuntimeError::UnboundVariable(name.clone())),
            Expr::ListLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::List(out))
            }
            Expr::Unary { op, expr } => {
                let v = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => i
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| RuntimeError::Arithmetic("integer overflow".into())),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(RuntimeError::TypeMismatch {
                            op: "-",
                            lhs: other.type_name(),
                            rhs: "",
                        }),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
        }
    }

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, RuntimeError> {
        // Short-circuit forms first.
        match op {
            BinOp::And => {
                let l = self.eval(lhs)?;
                if !l.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(r.is_truthy()));
            }
            BinOp::Or => {
                let l = self.eval(lhs)?;
                if l.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(r.is_truthy()));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;

        let mismatch = |op: BinOp, l: &Value, r: &Value| RuntimeError::TypeMismatch {
            op: op.symbol(),
            lhs: l.type_name(),
            rhs: r.type_name(),
        };

        match op {
            BinOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
            BinOp::Ne => Ok(Value::Bool(!l.loose_eq(&r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = match (&l, &r) {
                    (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                    (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
                    _ => match (l.as_number(), r.as_number()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => return Err(mismatch(op, &l, &r)),
                    },
                };
                let ord = ord.ok_or_else(|| mismatch(op, &l, &r))?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                }))
            }
            BinOp::In | BinOp::NotIn => {
                let contained = match (&l, &r) {
                    (_, Value::List(items)) => items.iter().any(|item| item.loose_eq(&l)),
                    (Value::Str(needle), Value::Str(hay)) => hay.contains(needle.as_str()),
                    _ => return Err(mismatch(op, &l, &r)),
                };
                Ok(Value::Bool(if op == BinOp::In {
                    contained
                } else {
                    !contained
                }))
            }
            BinOp::Add => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a
                    .checked_add(*b)
                    .map(Value::Int)
                    .ok_or_else(|| RuntimeError::Arithmetic("integer overflow".into())),
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
                (Value::List(a), Value::List(b)) => {
                    let mut out = a.clone();
                    out.extend(b.iter().cloned());
                    Ok(Value::List(out))
                }
                _ => match (l.as_number(), r.as_number()) {
                    (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                    _ => Err(mismatch(op, &l, &r)),
                },
            },
            BinOp::Sub | BinOp::Mul => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => {
                    let res = if op == BinOp::Sub {
                        a.checked_sub(*b)
                    } else {
                        a.checked_mul(*b)
                    };
                    res.map(Value::Int)
                        .ok_or_else(|| RuntimeError::Arithmetic("integer overflow".into()))
                }
                _ => match (l.as_number(), r.as_number()) {
                    (Some(a), Some(b)) => Ok(Value::Float(if op == BinOp::Sub {
                        a - b
                    } else {
                        a * b
                    })),
                    _ => Err(mismatch(op, &l, &r)),
                },
            },
            BinOp::Div => match (l.as_number(), r.as_number()) {
                (Some(_), Some(b)) if b == 0.0 => Err(RuntimeError::DivisionByZero),
                (Some(a), Some(b)) => Ok(Value::Float(a / b)),
                _ => Err(mismatch(op, &l, &r)),
            },
            BinOp::Mod => match (&l, &r) {
                (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
                _ => match (l.as_number(), r.as_number()) {
                    (Some(_), Some(b)) if b == 0.0 => Err(RuntimeError::DivisionByZero),
                    (Some(a), Some(b)) => Ok(Value::Float(a % b)),
                    _ => Err(mismatch(op, &l, &r)),
                },
            },
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compile;

    fn event(pairs: &[(&str, Value)]) -> TypedEvent {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn no_lists() -> HashMap<String, Vec<String>> {
        HashMap::new()
    }

    #[test]
    fn hold_rule_matches_large_amount() {
        let rule = compile("if $amount > 10000:\n    return \"HOLD\"").unwrap();
        let out = execute(
            &rule,
            &event(&[("amount", Value::Float(15000.0))]),
            &no_lists(),
        )
        .unwrap();
        assert_eq!(out, Some("HOLD".to_string()));
    }

    #[test]
    fn hold_rule_no_outcome_below_threshold() {
        let rule = compile("if $amount > 10000:\n    return \"HOLD\"").unwrap();
        let out = execute(
            &rule,
            &event(&[("amount", Value::Float(9999.0))]),
            &no_lists(),
        )
        .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        let rule = compile("if $amount >= 10000:\n    return 'HOLD'").unwrap();
        let out = execute(&rule, &event(&[("amount", Value::Int(10000))]), &no_lists()).unwrap();
        assert_eq!(out, Some("HOLD".to_string()));
    }

    #[test]
    fn missing_field_is_a_runtime_error() {
        let rule = compile("if $amount > 10:\n    return 'X'").unwrap();
        let err = execute(&rule, &event(&[]), &no_lists()).unwrap_err();
        assert_eq!(err, RuntimeError::MissingField("amount".to_string()));
    }

    #[test]
    fn list_membership_against_named_list() {
        let rule = compile("if $country in @HighRisk:\n    return 'HOLD'").unwrap();
        let mut lists = HashMap::new();
        lists.insert(
            "HighRisk".to_string(),
            vec!["KP".to_string(), "IR".to_string()],
        );
        let hit = execute(
            &rule,
            &event(&[("country", Value::Str("IR".into()))]),
            &lists,
        )
        .unwrap();
        assert_eq!(hit, Some("HOLD".to_string()));

        let miss = execute(
            &rule,
            &event(&[("country", Value::Str("DE".into()))]),
            &lists,
        )
        .unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn unknown_list_is_a_runtime_error() {
        let rule = compile("if $country in @Nope:\n    return 'X'").unwrap();
        let err = execute(
            &rule,
            &event(&[("country", Value::Str("DE".into()))]),
            &no_lists(),
        )
        .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownList("Nope".to_string()));
    }

    #[test]
    fn for_loop_return_propagates() {
        let src = "for x in @Watch:\n    if x == $sender:\n        return 'FLAG'";
        let rule = compile(src).unwrap();
        let mut lists = HashMap::new();
        lists.insert("Watch".to_string(), vec!["a".to_string(), "b".to_string()]);
        let out = execute(&rule, &event(&[("sender", Value::Str("b".into()))]), &lists).unwrap();
        assert_eq!(out, Some("FLAG".to_string()));
    }

    #[test]
    fn arithmetic_and_division_by_zero() {
        let ok = compile("return 'R'\n").unwrap();
        assert_eq!(execute(&ok, &event(&[]), &no_lists()).unwrap(), Some("R".into()));

        let div = compile("if $a / $b > 1:\n    return 'X'").unwrap();
        let err = execute(
            &div,
            &event(&[("a", Value::Int(1)), ("b", Value::Int(0))]),
            &no_lists(),
        )
        .unwrap_err();
        assert_eq!(err, RuntimeError::DivisionByZero);
    }

    #[test]
    fn non_string_outcome_is_rejected() {
        let rule = compile("return 1 + 2").unwrap();
        let err = execute(&rule, &event(&[]), &no_lists()).unwrap_err();
        assert_eq!(err, RuntimeError::NonStringOutcome("int"));
    }

    #[test]
    fn and_or_short_circuit_skips_missing_fields() {
        // $missing is never evaluated when the left side decides.
        let rule = compile("if $flag or $missing > 1:\n    return 'X'").unwrap();
        let out = execute(&rule, &event(&[("flag", Value::Bool(true))]), &no_lists()).unwrap();
        assert_eq!(out, Some("X".to_string()));
    }

    #[test]
    fn string_comparison_never_used_for_configured_numbers() {
        // "9999" cast to float compares numerically: 9999.0 > 10000 is false,
        // where lexicographic "9999" > "10000" would be true.
        let rule = compile("if $amount > 10000:\n    return 'HOLD'").unwrap();
        let out = execute(
            &rule,
            &event(&[("amount", Value::Float(9999.0))]),
            &no_lists(),
        )
        .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn runaway_loops_hit_the_step_budget() {
        // Three nested loops over 60 items each is ~216k iterations, which
        // must trip the budget rather than complete.
        let items = (0..60).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let src = format!(
            "for a in [{items}]:\n    for b in [{items}]:\n        for c in [{items}]:\n            if a == b and b == c and a == -1:\n                return 'X'"
        );
        let rule = compile(&src).unwrap();
        let err = execute(&rule, &event(&[]), &no_lists()).unwrap_err();
        assert_eq!(err, RuntimeError::BudgetExceeded);
    }
}

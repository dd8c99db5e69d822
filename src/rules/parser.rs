//! Recursive-descent parser producing [`CompiledRule`].
//!
//! Also performs the static validation the authoring path relies on: every
//! bare identifier must be bound by an enclosing `for`, and only the
//! `$`/`@` reference forms can reach outside the rule. Referenced fields
//! and lists are collected in source order as a side product.

use super::ast::{BinOp, CompiledRule, Expr, Stmt, UnaryOp, Value};
use super::lexer::{tokenize, Spanned, Token};
use super::CompileError;

pub fn compile(source: &str) -> Result<CompiledRule, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        fields: Vec::new(),
        lists: Vec::new(),
        loop_vars: Vec::new(),
    };
    let body = parser.parse_program()?;
    if body.is_empty() {
        return Err(CompileError::new(1, "", "rule has no statements"));
    }
    Ok(CompiledRule {
        body,
        referenced_fields: parser.fields,
        referenced_lists: parser.lists,
    })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    fields: Vec<String>,
    lists: Vec<String>,
    loop_vars: Vec<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, l)| *l)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token, context: &str) -> Result<(), CompileError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            let found = self
                .peek()
                .map(|t| t.describe())
                .unwrap_or_else(|| "end of rule".to_string());
            Err(CompileError::new(
                self.line(),
                found,
                format!("expected {} {}", tok.describe(), context),
            ))
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        match self.peek() {
            Some(Token::If) => self.parse_if(),
            Some(Token::For) => self.parse_for(),
            Some(Token::Return) => self.parse_return(),
            Some(other) => Err(CompileError::new(
                self.line(),
                other.describe(),
                "expected 'if', 'for', or 'return'",
            )),
            None => Err(CompileError::new(self.line(), "", "unexpected end of rule")),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        self.expect(Token::If, "")?;
        let cond = self.parse_expr()?;
        let block = self.parse_block("after 'if' condition")?;
        let mut arms = vec![(cond, block)];
        let mut else_block = None;

        loop {
            if self.eat(&Token::Elif) {
                let cond = self.parse_expr()?;
                let block = self.parse_block("after 'elif' condition")?;
                arms.push((cond, block));
            } else if self.eat(&Token::Else) {
                else_block = Some(self.parse_block("after 'else'")?);
                break;
            } else {
                break;
            }
        }

        Ok(Stmt::If { arms, else_block })
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        self.expect(Token::For, "")?;
        let var = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(CompileError::new(
                    self.line(),
                    other.map(|t| t.describe()).unwrap_or_default(),
                    "expected a loop variable name after 'for'",
                ))
            }
        };
        self.expect(Token::In, "after the loop variable")?;
        let iter = self.parse_expr()?;

        self.loop_vars.push(var.clone());
        let body = self.parse_block("after 'for' header");
        self.loop_vars.pop();

        Ok(Stmt::For {
            var,
            iter,
            body: body?,
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, CompileError> {
        self.expect(Token::Return, "")?;
        let expr = self.parse_expr()?;
        self.expect(Token::Newline, "after 'return' value")?;
        Ok(Stmt::Return(expr))
    }

    /// `: NEWLINE INDENT stmt+ DEDENT`
    fn parse_block(&mut self, context: &str) -> Result<Vec<Stmt>, CompileError> {
        self.expect(Token::Colon, context)?;
        self.expect(Token::Newline, "after ':'")?;
        self.expect(Token::Indent, "(block must be indented)")?;
        let mut stmts = Vec::new();
        while self.peek() != Some(&Token::Dedent) && self.peek().is_some() {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(Token::Dedent, "to close the block")?;
        if stmts.is_empty() {
            return Err(CompileError::new(self.line(), "", "empty block"));
        }
        Ok(stmts)
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.eat(&Token::Not) {
            let expr = self.parse_not()?;
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            })
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_arith()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinOp::Eq),
            Some(Token::Ne) => Some(BinOp::Ne),
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            Some(Token::In) => Some(BinOp::In),
            Some(Token::Not) => {
                // `not in` is the only postfix use of 'not'.
                if self.tokens.get(self.pos + 1).map(|(t, _)| t) == Some(&Token::In) {
                    self.pos += 1;
                    Some(BinOp::NotIn)
                } else {
                    None
                }
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let rhs = self.parse_arith()?;
                Ok(Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            None => Ok(lhs),
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Expr, CompileError> {
        if self.eat(&Token::Minus) {
            let expr = self.parse_factor()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::None) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Field(name)) => {
                if !self.fields.contains(&name) {
                    self.fields.push(name.clone());
                }
                Ok(Expr::Field(name))
            }
            Some(Token::ListName(name)) => {
                if !self.lists.contains(&name) {
                    self.lists.push(name.clone());
                }
                Ok(Expr::ListRef(name))
            }
            Some(Token::Ident(name)) => {
                if self.loop_vars.contains(&name) {
                    Ok(Expr::Var(name))
                } else {
                    Err(CompileError::new(
                        line,
                        name.clone(),
                        format!("unknown identifier '{name}'; event fields are written as ${name}"),
                    ))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "to close '('")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                        // Tolerate a trailing comma.
                        if self.peek() == Some(&Token::RBracket) {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket, "to close '['")?;
                Ok(Expr::ListLit(items))
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of rule".to_string());
                Err(CompileError::new(line, found, "expected an expression"))
            }
        }
    }
}

/// Outcome strings that appear as literal `return` values.
///
/// Used by the save path to check a rule against the outcome allow-list
/// without running it.
pub fn literal_outcomes(rule: &CompiledRule) -> Vec<String> {
    fn walk(stmts: &[Stmt], out: &mut Vec<String>) {
        for stmt in stmts {
            match stmt {
                Stmt::Return(Expr::Literal(Value::Str(s))) => {
                    if !out.contains(s) {
                        out.push(s.clone());
                    }
                }
                Stmt::Return(_) => {}
                Stmt::If { arms, else_block } => {
                    for (_, block) in arms {
                        walk(block, out);
                    }
                    if let Some(block) = else_block {
                        walk(block, out);
                    }
                }
                Stmt::For { body, .. } => walk(body, out),
            }
        }
    }
    let mut out = Vec::new();
    walk(&rule.body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_hold_rule() {
        let rule = compile("if $amount > 10000:\n    return \"HOLD\"").unwrap();
        assert_eq!(rule.referenced_fields(), &["amount".to_string()]);
        assert_eq!(literal_outcomes(&rule), vec!["HOLD".to_string()]);
    }

    #[test]
    fn referenced_fields_are_distinct_and_in_source_order() {
        let src = "if $b > 1 and $a > 2:\n    return 'X'\nif $a > 3 and $c > 4:\n    return 'Y'";
        let rule = compile(src).unwrap();
        assert_eq!(
            rule.referenced_fields(),
            &["b".to_string(), "a".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn referenced_lists_collected() {
        let rule = compile("if $country in @HighRisk:\n    return 'HOLD'").unwrap();
        assert_eq!(rule.referenced_lists(), &["HighRisk".to_string()]);
    }

    #[test]
    fn elif_else_chain() {
        let src = "if $a > 10:\n    return 'HIGH'\nelif $a > 5:\n    return 'MID'\nelse:\n    return 'LOW'";
        let rule = compile(src).unwrap();
        match &rule.body[0] {
            Stmt::If { arms, else_block } => {
                assert_eq!(arms.len(), 2);
                assert!(else_block.is_some());
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn for_loop_binds_variable() {
        let src = "for x in @Watchlist:\n    if x == $sender:\n        return 'FLAG'";
        compile(src).unwrap();
    }

    #[test]
    fn unbound_identifier_is_rejected() {
        let err = compile("if amount > 10:\n    return 'X'").unwrap_err();
        assert!(err.message.contains("unknown identifier"));
        assert!(err.message.contains("$amount"));
    }

    #[test]
    fn loop_variable_not_visible_outside_loop() {
        let src = "for x in [1, 2]:\n    return 'A'\nif x == 1:\n    return 'B'";
        let err = compile(src).unwrap_err();
        assert!(err.message.contains("unknown identifier"));
    }

    #[test]
    fn rejects_empty_source() {
        let err = compile("   \n# just a comment\n").unwrap_err();
        assert!(err.message.contains("no statements"));
    }

    #[test]
    fn rejects_unbalanced_control_flow() {
        let err = compile("if $a > 1:\nreturn 'X'").unwrap_err();
        assert!(err.message.contains("block"));
    }

    #[test]
    fn rejects_else_without_if() {
        let err = compile("else:\n    return 'X'").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn not_in_operator() {
        let rule = compile("if $country not in @Allowed:\n    return 'HOLD'").unwrap();
        match &rule.body[0] {
            Stmt::If { arms, .. } => match &arms[0].0 {
                Expr::Binary { op, .. } => assert_eq!(*op, BinOp::NotIn),
                other => panic!("expected binary, got {other:?}"),
            },
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn operator_precedence_mul_before_add_before_compare() {
        let rule = compile("return $a + $b * 2 > 10").unwrap();
        let Stmt::Return(Expr::Binary { op, lhs, .. }) = &rule.body[0] else {
            panic!("expected return of a comparison");
        };
        assert_eq!(*op, BinOp::Gt);
        let Expr::Binary { op: add, rhs, .. } = lhs.as_ref() else {
            panic!("expected addition on the left");
        };
        assert_eq!(*add, BinOp::Add);
        assert!(matches!(rhs.as_ref(), Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn compile_is_deterministic() {
        let src = "if $amount > 10000 and $country in @HighRisk:\n    return 'HOLD'";
        assert_eq!(compile(src).unwrap(), compile(src).unwrap());
    }
}

//! Indentation-aware tokenizer for rule source.
//!
//! Produces a flat token stream with explicit `Indent`/`Dedent`/`Newline`
//! markers so the parser can treat blocks like any other delimiter. Blank
//! lines and `#` comments are dropped before indentation is measured.

use super::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Indent,
    Dedent,
    Newline,

    If,
    Elif,
    Else,
    For,
    In,
    Return,
    And,
    Or,
    Not,
    True,
    False,
    None,

    /// Bare identifier (loop variable).
    Ident(String),
    /// `$name` event field reference.
    Field(String),
    /// `@Name` named-list reference.
    ListName(String),

    Int(i64),
    Float(f64),
    Str(String),

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
}

impl Token {
    /// Short rendering used in parser diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Token::Indent => "indented block".to_string(),
            Token::Dedent => "end of block".to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Field(s) => format!("${s}"),
            Token::ListName(s) => format!("@{s}"),
            Token::Int(i) => i.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(s) => format!("'{s}'"),
            Token::If => "if".to_string(),
            Token::Elif => "elif".to_string(),
            Token::Else => "else".to_string(),
            Token::For => "for".to_string(),
            Token::In => "in".to_string(),
            Token::Return => "return".to_string(),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::True => "True".to_string(),
            Token::False => "False".to_string(),
            Token::None => "None".to_string(),
            Token::Eq => "==".to_string(),
            Token::Ne => "!=".to_string(),
            Token::Lt => "<".to_string(),
            Token::Le => "<=".to_string(),
            Token::Gt => ">".to_string(),
            Token::Ge => ">=".to_string(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::Comma => ",".to_string(),
            Token::Colon => ":".to_string(),
        }
    }
}

/// Token plus the 1-based source line it came from.
pub type Spanned = (Token, usize);

/// Host-language keywords that must never appear in rule source. Matching
/// them here gives a pointed message instead of a generic parse failure.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "lambda", "while", "global", "exec", "eval", "open",
    "assert", "del", "with", "yield", "try", "except", "raise", "pass", "break", "continue",
];

fn keyword(word: &str) -> Option<Token> {
    match word {
        "if" => Some(Token::If),
        "elif" => Some(Token::Elif),
        "else" => Some(Token::Else),
        "for" => Some(Token::For),
        "in" => Some(Token::In),
        "return" => Some(Token::Return),
        "and" => Some(Token::And),
        "or" => Some(Token::Or),
        "not" => Some(Token::Not),
        "True" => Some(Token::True),
        "False" => Some(Token::False),
        "None" => Some(Token::None),
        _ => None,
    }
}

/// Indent width of a line, tabs counted as 8 columns.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 8,
            _ => break,
        }
    }
    width
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut indent_stack: Vec<usize> = vec![0];

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let without_comment = strip_comment(raw_line);
        if without_comment.trim().is_empty() {
            continue;
        }

        let width = indent_width(without_comment);
        let current = *indent_stack.last().unwrap_or(&0);
        if width > current {
            indent_stack.push(width);
            tokens.push((Token::Indent, line_no));
        } else if width < current {
            while *indent_stack.last().unwrap_or(&0) > width {
                indent_stack.pop();
                tokens.push((Token::Dedent, line_no));
            }
            if *indent_stack.last().unwrap_or(&0) != width {
                return Err(CompileError::new(
                    line_no,
                    without_comment.trim(),
                    "inconsistent indentation",
                ));
            }
        }

        tokenize_line(without_comment.trim_start(), line_no, &mut tokens)?;
        tokens.push((Token::Newline, line_no));
    }

    let last_line = source.lines().count().max(1);
    while indent_stack.len() > 1 {
        indent_stack.pop();
        tokens.push((Token::Dedent, last_line));
    }

    Ok(tokens)
}

/// Strip a trailing `#` comment, honoring string literals. A backslash
/// inside a string escapes the next character, matching `scan_string`.
fn strip_comment(line: &str) -> &str {
    let mut in_str: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (c, in_str) {
            ('#', None) => return &line[..i],
            ('\'' | '"', None) => in_str = Some(c),
            ('\\', Some(_)) => escaped = true,
            (q, Some(open)) if q == open => in_str = None,
            _ => {}
        }
    }
    line
}

fn tokenize_line(line: &str, line_no: usize, out: &mut Vec<Spanned>) -> Result<(), CompileError> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                out.push((Token::LParen, line_no));
                i += 1;
            }
            ')' => {
                out.push((Token::RParen, line_no));
                i += 1;
            }
            '[' => {
                out.push((Token::LBracket, line_no));
                i += 1;
            }
            ']' => {
                out.push((Token::RBracket, line_no));
                i += 1;
            }
            ',' => {
                out.push((Token::Comma, line_no));
                i += 1;
            }
            ':' => {
                out.push((Token::Colon, line_no));
                i += 1;
            }
            '+' => {
                out.push((Token::Plus, line_no));
                i += 1;
            }
            '-' => {
                out.push((Token::Minus, line_no));
                i += 1;
            }
            '*' => {
                out.push((Token::Star, line_no));
                i += 1;
            }
            '/' => {
                out.push((Token::Slash, line_no));
                i += 1;
            }
            '%' => {
                out.push((Token::Percent, line_no));
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push((Token::Eq, line_no));
                    i += 2;
                } else {
                    return Err(CompileError::new(
                        line_no,
                        "=",
                        "assignment is not supported in rules; did you mean '=='?",
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push((Token::Ne, line_no));
                    i += 2;
                } else {
                    return Err(CompileError::new(line_no, "!", "unexpected character '!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push((Token::Le, line_no));
                    i += 2;
                } else {
                    out.push((Token::Lt, line_no));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push((Token::Ge, line_no));
                    i += 2;
                } else {
                    out.push((Token::Gt, line_no));
                    i += 1;
                }
            }
            '$' | '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                if end == start {
                    return Err(CompileError::new(
                        line_no,
                        c.to_string(),
                        format!("'{c}' must be followed by a name"),
                    ));
                }
                let name: String = chars[start..end].iter().collect();
                let tok = if c == '$' {
                    Token::Field(name)
                } else {
                    Token::ListName(name)
                };
                out.push((tok, line_no));
                i = end;
            }
            '\'' | '"' => {
                let (s, next) = scan_string(&chars, i, line_no)?;
                out.push((Token::Str(s), line_no));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (tok, next) = scan_number(&chars, i, line_no)?;
                out.push((tok, line_no));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                    return Err(CompileError::new(
                        line_no,
                        word.clone(),
                        format!("'{word}' is not allowed in rules"),
                    ));
                }
                out.push((keyword(&word).unwrap_or(Token::Ident(word)), line_no));
                i = end;
            }
            other => {
                return Err(CompileError::new(
                    line_no,
                    other.to_string(),
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    Ok(())
}

fn scan_string(
    chars: &[char],
    open_at: usize,
    line_no: usize,
) -> Result<(String, usize), CompileError> {
    let quote = chars[open_at];
    let mut s = String::new();
    let mut i = open_at + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or_else(|| {
                    CompileError::new(line_no, "\\", "dangling escape in string literal")
                })?;
                s.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((s, i + 1)),
            c => {
                s.push(c);
                i += 1;
            }
        }
    }
    Err(CompileError::new(
        line_no,
        s,
        "unterminated string literal",
    ))
}

fn scan_number(
    chars: &[char],
    start: usize,
    line_no: usize,
) -> Result<(Token, usize), CompileError> {
    let mut end = start;
    let mut saw_dot = false;
    while end < chars.len() {
        match chars[end] {
            c if c.is_ascii_digit() => end += 1,
            '.' if !saw_dot && chars.get(end + 1).is_some_and(|c| c.is_ascii_digit()) => {
                saw_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    let text: String = chars[start..end].iter().collect();
    let tok = if saw_dot {
        Token::Float(text.parse().map_err(|_| {
            CompileError::new(line_no, text.clone(), "invalid numeric literal")
        })?)
    } else {
        Token::Int(text.parse().map_err(|_| {
            CompileError::new(line_no, text.clone(), "invalid numeric literal")
        })?)
    };
    Ok((tok, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn tokenizes_comparison_with_field() {
        assert_eq!(
            toks("$amount > 10000"),
            vec![
                Token::Field("amount".into()),
                Token::Gt,
                Token::Int(10000),
                Token::Newline
            ]
        );
    }

    #[test]
    fn emits_indent_and_dedent_pairs() {
        let t = toks("if $a > 1:\n    return 'X'\nreturn 'Y'");
        assert!(t.contains(&Token::Indent));
        assert!(t.contains(&Token::Dedent));
        let indents = t.iter().filter(|t| **t == Token::Indent).count();
        let dedents = t.iter().filter(|t| **t == Token::Dedent).count();
        assert_eq!(indents, dedents);
    }

    #[test]
    fn closes_open_blocks_at_eof() {
        let t = toks("if $a > 1:\n    if $b > 2:\n        return 'X'");
        let dedents = t.iter().filter(|t| **t == Token::Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn rejects_assignment() {
        let err = tokenize("x = 1").unwrap_err();
        assert!(err.message.contains("assignment"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn rejects_forbidden_keywords() {
        for src in ["import os", "while True:", "exec('x')"] {
            let err = tokenize(src).unwrap_err();
            assert!(err.message.contains("not allowed"), "{src}: {err}");
        }
    }

    #[test]
    fn rejects_attribute_access() {
        let err = tokenize("$user.name == 'x'").unwrap_err();
        assert!(err.message.contains("unexpected character"));
    }

    #[test]
    fn strings_comments_and_escapes() {
        assert_eq!(
            toks("return \"a#b\"  # trailing"),
            vec![Token::Return, Token::Str("a#b".into()), Token::Newline]
        );
        assert_eq!(
            toks(r#"return 'it\'s'"#),
            vec![Token::Return, Token::Str("it's".into()), Token::Newline]
        );
    }

    #[test]
    fn escaped_quote_does_not_close_string_before_comment() {
        assert_eq!(
            toks(r#"return 'don\'t'  # note"#),
            vec![Token::Return, Token::Str("don't".into()), Token::Newline]
        );
    }

    #[test]
    fn list_reference_and_membership() {
        assert_eq!(
            toks("$country in @HighRisk"),
            vec![
                Token::Field("country".into()),
                Token::In,
                Token::ListName("HighRisk".into()),
                Token::Newline
            ]
        );
    }

    #[test]
    fn inconsistent_indentation_is_an_error() {
        let err = tokenize("if $a > 1:\n        return 'X'\n    return 'Y'").unwrap_err();
        assert!(err.message.contains("indentation"));
    }

    #[test]
    fn float_and_int_literals() {
        assert_eq!(
            toks("1.5 + 2"),
            vec![Token::Float(1.5), Token::Plus, Token::Int(2), Token::Newline]
        );
    }
}

//! Filter expression language for selecting tests
//!
//! A filter is a boolean expression over root-span attributes, compiled once
//! and evaluated against every candidate test:
//!
//! ```text
//! method=GET path=/api/* status=200..299 and not name~flaky
//! duration<500ms or duration>2s
//! ```
//!
//! Terms: `method=`, `path=` (glob), `status=` (single or inclusive range),
//! `duration` with `<`, `<=`, `>`, `>=` (`ms`/`s`/`m` suffixes), `name~`
//! (substring). Juxtaposition means `and`; `or`, `not`, and parentheses
//! behave as usual. Compilation of the rendered form yields an equal filter.

use crate::test::Test;
use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::ops::RangeInclusive;

const KNOWN_FIELDS: &str = "method, path, status, duration, name";

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Term(Term),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Method(String),
    Path(glob::Pattern),
    Status(RangeInclusive<u16>),
    Duration { op: CmpOp, millis: u64 },
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl Filter {
    /// Compile a filter expression. Unknown fields and malformed terms fail
    /// with a message naming the offending token.
    pub fn compile(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            bail!("unexpected token {:?} after end of expression", parser.tokens[parser.pos]);
        }
        Ok(filter)
    }

    /// Evaluate against a test's root-span attributes.
    pub fn matches(&self, test: &Test) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|p| p.matches(test)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(test)),
            Self::Not(inner) => !inner.matches(test),
            Self::Term(term) => term.matches(test),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Or(_) => 0,
            Self::And(_) => 1,
            Self::Not(_) => 2,
            Self::Term(_) => 3,
        }
    }

    fn fmt_child(&self, child: &Filter, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({child})")
        } else {
            write!(f, "{child}")
        }
    }
}

impl Term {
    fn matches(&self, test: &Test) -> bool {
        match self {
            Self::Method(method) => test.method.eq_ignore_ascii_case(method),
            Self::Path(pattern) => pattern.matches(&test.path),
            Self::Status(range) => test.status.is_some_and(|s| range.contains(&s)),
            Self::Duration { op, millis } => match op {
                CmpOp::Lt => test.duration_ms < *millis,
                CmpOp::Le => test.duration_ms <= *millis,
                CmpOp::Gt => test.duration_ms > *millis,
                CmpOp::Ge => test.duration_ms >= *millis,
            },
            Self::Name(needle) => test.display_name.contains(needle.as_str()),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " and ")?;
                    }
                    self.fmt_child(part, f)?;
                }
                Ok(())
            }
            Self::Or(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    self.fmt_child(part, f)?;
                }
                Ok(())
            }
            Self::Not(inner) => {
                write!(f, "not ")?;
                self.fmt_child(inner, f)
            }
            Self::Term(term) => write!(f, "{term}"),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(m) => write!(f, "method={}", quote_if_needed(m)),
            Self::Path(p) => write!(f, "path={}", quote_if_needed(p.as_str())),
            Self::Status(range) if range.start() == range.end() => {
                write!(f, "status={}", range.start())
            }
            Self::Status(range) => write!(f, "status={}..{}", range.start(), range.end()),
            Self::Duration { op, millis } => write!(f, "duration{}{}ms", op.as_str(), millis),
            Self::Name(n) => write!(f, "name~{}", quote_if_needed(n)),
        }
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) || value.contains(['(', ')', '"']) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Term { field: String, op: String, value: String },
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            _ => {
                let word = read_word(&mut chars)?;
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(classify_term(&word)?),
                }
            }
        }
    }
    if tokens.is_empty() {
        bail!("empty filter expression");
    }
    Ok(tokens)
}

fn read_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String> {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => word.push(escaped),
                            None => bail!("unterminated escape in quoted string"),
                        },
                        Some('"') => break,
                        Some(inner) => word.push(inner),
                        None => bail!("unterminated quoted string"),
                    }
                }
            }
            c if c.is_whitespace() || c == '(' || c == ')' => break,
            _ => {
                word.push(c);
                chars.next();
            }
        }
    }
    Ok(word)
}

fn classify_term(word: &str) -> Result<Token> {
    for op in ["<=", ">=", "<", ">", "=", "~"] {
        if let Some(idx) = word.find(op) {
            let field = word[..idx].to_string();
            let value = word[idx + op.len()..].to_string();
            if field.is_empty() {
                bail!("filter term {word:?} is missing a field name");
            }
            if value.is_empty() {
                bail!("filter term {word:?} is missing a value");
            }
            return Ok(Token::Term {
                field,
                op: op.to_string(),
                value,
            });
        }
    }
    bail!("expected a filter term like field=value, got {word:?}")
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<Filter> {
        let mut parts = vec![self.and_expr()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            parts.push(self.and_expr()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Filter::Or(parts)
        })
    }

    fn and_expr(&mut self) -> Result<Filter> {
        let mut parts = vec![self.unary()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    parts.push(self.unary()?);
                }
                // Juxtaposition: `method=GET path=/x` means and.
                Some(Token::Not) | Some(Token::LParen) | Some(Token::Term { .. }) => {
                    parts.push(self.unary()?);
                }
                _ => break,
            }
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Filter::And(parts)
        })
    }

    fn unary(&mut self) -> Result<Filter> {
        match self.peek().cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Filter::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => bail!("missing closing parenthesis"),
                }
            }
            Some(Token::Term { field, op, value }) => {
                self.pos += 1;
                Ok(Filter::Term(parse_term(&field, &op, &value)?))
            }
            Some(other) => bail!("unexpected token {other:?}"),
            None => bail!("unexpected end of filter expression"),
        }
    }
}

fn parse_term(field: &str, op: &str, value: &str) -> Result<Term> {
    match field.to_ascii_lowercase().as_str() {
        "method" => {
            expect_op(field, op, "=")?;
            Ok(Term::Method(value.to_string()))
        }
        "path" => {
            expect_op(field, op, "=")?;
            let pattern = glob::Pattern::new(value)
                .map_err(|err| anyhow!("invalid path glob {value:?}: {err}"))?;
            Ok(Term::Path(pattern))
        }
        "status" => {
            expect_op(field, op, "=")?;
            Ok(Term::Status(parse_status_range(value)?))
        }
        "duration" => {
            let op = match op {
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::Ge,
                other => bail!("duration supports <, <=, >, >= (got {other:?})"),
            };
            Ok(Term::Duration {
                op,
                millis: parse_duration_millis(value)?,
            })
        }
        "name" => {
            expect_op(field, op, "~")?;
            Ok(Term::Name(value.to_string()))
        }
        other => bail!("unknown filter field: {other} (expected {KNOWN_FIELDS})"),
    }
}

fn expect_op(field: &str, got: &str, want: &str) -> Result<()> {
    if got != want {
        bail!("field {field} supports only the {want:?} operator (got {got:?})");
    }
    Ok(())
}

fn parse_status_range(value: &str) -> Result<RangeInclusive<u16>> {
    if let Some((lo, hi)) = value.split_once("..") {
        let lo: u16 = lo
            .parse()
            .map_err(|_| anyhow!("invalid status range start {lo:?}"))?;
        let hi: u16 = hi
            .parse()
            .map_err(|_| anyhow!("invalid status range end {hi:?}"))?;
        if lo > hi {
            bail!("status range {value:?} is inverted");
        }
        Ok(lo..=hi)
    } else {
        let status: u16 = value
            .parse()
            .map_err(|_| anyhow!("invalid status {value:?}"))?;
        Ok(status..=status)
    }
}

fn parse_duration_millis(value: &str) -> Result<u64> {
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "ms"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid duration {value:?}"))?;
    match unit {
        "ms" => Ok(amount),
        "s" => Ok(amount * 1_000),
        "m" => Ok(amount * 60_000),
        other => bail!("invalid duration unit {other:?} in {value:?} (expected ms, s, or m)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::test::TestOrigin;
    use serde_json::json;

    fn test_with(method: &str, path: &str, status: u16, duration_ms: u64) -> Test {
        let root: Span = serde_json::from_value(json!({
            "trace_id": "trc_f",
            "span_id": "spn_root",
            "package_name": "http",
            "submodule_name": method,
            "is_root_span": true,
            "input_value": {"method": method, "target": path},
            "output_value": {"status": status},
            "timestamp": "2026-01-10T08:00:00Z",
            "duration_ms": duration_ms
        }))
        .unwrap();
        Test::from_trace(
            "trc_f".to_string(),
            root,
            Vec::new(),
            TestOrigin::File { path: "trc_f.jsonl".into() },
        )
    }

    #[test]
    fn test_simple_terms() {
        let filter = Filter::compile("method=GET path=/api/* status=200..299").unwrap();
        assert!(filter.matches(&test_with("GET", "/api/users", 200, 10)));
        assert!(!filter.matches(&test_with("POST", "/api/users", 200, 10)));
        assert!(!filter.matches(&test_with("GET", "/health", 200, 10)));
        assert!(!filter.matches(&test_with("GET", "/api/users", 404, 10)));
    }

    #[test]
    fn test_or_and_not_precedence() {
        let filter = Filter::compile("method=GET or method=POST and status=201").unwrap();
        // `and` binds tighter than `or`.
        assert!(filter.matches(&test_with("GET", "/x", 500, 10)));
        assert!(filter.matches(&test_with("POST", "/x", 201, 10)));
        assert!(!filter.matches(&test_with("POST", "/x", 200, 10)));

        let filter = Filter::compile("(method=GET or method=POST) and status=201").unwrap();
        assert!(!filter.matches(&test_with("GET", "/x", 500, 10)));
    }

    #[test]
    fn test_duration_bounds() {
        let filter = Filter::compile("duration<500ms").unwrap();
        assert!(filter.matches(&test_with("GET", "/x", 200, 499)));
        assert!(!filter.matches(&test_with("GET", "/x", 200, 500)));

        let filter = Filter::compile("duration>=2s").unwrap();
        assert!(filter.matches(&test_with("GET", "/x", 200, 2_000)));
        assert!(!filter.matches(&test_with("GET", "/x", 200, 1_999)));
    }

    #[test]
    fn test_name_substring_and_not() {
        let filter = Filter::compile("not name~health").unwrap();
        assert!(!filter.matches(&test_with("GET", "/health", 200, 10)));
        assert!(filter.matches(&test_with("GET", "/orders", 200, 10)));
    }

    #[test]
    fn test_unknown_field_fails_compile() {
        let err = Filter::compile("verb=GET").unwrap_err();
        assert!(err.to_string().contains("unknown filter field: verb"));
        assert!(err.to_string().contains("method"));
    }

    #[test]
    fn test_wrong_operator_fails_compile() {
        assert!(Filter::compile("method~GET").is_err());
        assert!(Filter::compile("duration=500ms").is_err());
        assert!(Filter::compile("status=500..200").is_err());
    }

    #[test]
    fn test_compile_is_idempotent_through_display() {
        for expr in [
            "method=GET",
            "method=GET path=/api/* status=200..299",
            "method=GET or method=POST and status=201",
            "not (method=GET or name~flaky)",
            "duration<1s or duration>=2m",
            "name~\"two words\"",
        ] {
            let first = Filter::compile(expr).unwrap();
            let rendered = first.to_string();
            let second = Filter::compile(&rendered).unwrap();
            assert_eq!(first, second, "round trip failed for {expr:?} -> {rendered:?}");
        }
    }

    #[test]
    fn test_quoted_values() {
        let filter = Filter::compile("name~\"create order\"").unwrap();
        let mut test = test_with("POST", "/orders", 201, 10);
        test.display_name = "create order v2".to_string();
        assert!(filter.matches(&test));
    }
}

//! Client-side row filters
//!
//! Parses the compact `column op value` grammar (with `and` / `or` /
//! `not` and parentheses) into an in-process predicate over the record
//! JSON. The evaluator never touches the database; unknown columns are
//! caught at subscription time via [`RowFilter::columns`].

use std::fmt;

use crate::error::{Error, Result};

/// Comparison operators, matching the REST layer's set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Like,
    ILike,
    IsNull,
    IsNotNull,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "in" => Some(Self::In),
            "like" => Some(Self::Like),
            "ilike" => Some(Self::ILike),
            "is_null" => Some(Self::IsNull),
            "is_not_null" => Some(Self::IsNotNull),
            _ => None,
        }
    }
}

/// Literal values appearing on the right-hand side
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    List(Vec<Literal>),
}

/// Parsed filter expression
#[derive(Debug, Clone)]
pub enum RowFilter {
    Compare {
        column: String,
        op: Op,
        value: Option<Literal>,
    },
    And(Box<RowFilter>, Box<RowFilter>),
    Or(Box<RowFilter>, Box<RowFilter>),
    Not(Box<RowFilter>),
}

impl RowFilter {
    /// Parse a filter expression
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::BadRequest(format!(
                "unexpected trailing input in filter near '{}'",
                parser.peek().map(|t| t.to_string()).unwrap_or_default()
            )));
        }
        Ok(filter)
    }

    /// Every column the filter references (for registration validation)
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { column, .. } => out.push(column),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Self::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Evaluate against a record object
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        match self {
            Self::And(a, b) => a.matches(record) && b.matches(record),
            Self::Or(a, b) => a.matches(record) || b.matches(record),
            Self::Not(inner) => !inner.matches(record),
            Self::Compare { column, op, value } => {
                let field = record.get(column).unwrap_or(&serde_json::Value::Null);
                compare(field, *op, value.as_ref())
            }
        }
    }
}

fn compare(field: &serde_json::Value, op: Op, value: Option<&Literal>) -> bool {
    use serde_json::Value;

    match op {
        Op::IsNull => return field.is_null(),
        Op::IsNotNull => return !field.is_null(),
        _ => {}
    }

    let Some(value) = value else { return false };

    match op {
        Op::Eq => literal_eq(field, value),
        Op::Neq => !literal_eq(field, value),
        Op::In => match value {
            Literal::List(items) => items.iter().any(|item| literal_eq(field, item)),
            _ => false,
        },
        Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
            let ordering = match (field, value) {
                (Value::Number(n), Literal::Number(rhs)) => {
                    n.as_f64().and_then(|lhs| lhs.partial_cmp(rhs))
                }
                (Value::String(s), Literal::String(rhs)) => Some(s.as_str().cmp(rhs.as_str())),
                _ => None,
            };
            match ordering {
                Some(ordering) => match op {
                    Op::Lt => ordering.is_lt(),
                    Op::Lte => ordering.is_le(),
                    Op::Gt => ordering.is_gt(),
                    Op::Gte => ordering.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
        Op::Like | Op::ILike => match (field, value) {
            (Value::String(s), Literal::String(pattern)) => {
                if op == Op::ILike {
                    wildcard_match(&pattern.to_lowercase(), &s.to_lowercase())
                } else {
                    wildcard_match(pattern, s)
                }
            }
            _ => false,
        },
        Op::IsNull | Op::IsNotNull => unreachable!(),
    }
}

fn literal_eq(field: &serde_json::Value, value: &Literal) -> bool {
    use serde_json::Value;
    match (field, value) {
        (Value::String(s), Literal::String(rhs)) => s == rhs,
        (Value::Number(n), Literal::Number(rhs)) => n.as_f64() == Some(*rhs),
        (Value::Bool(b), Literal::Bool(rhs)) => b == rhs,
        (Value::Null, Literal::Null) => true,
        _ => false,
    }
}

/// SQL LIKE semantics: `%` any run, `_` any single char
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    like_match(&pattern, &text)
}

fn like_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => {
            (0..=text.len()).any(|skip| like_match(rest, &text[skip..]))
        }
        Some(('_', rest)) => match text.split_first() {
            Some((_, text_rest)) => like_match(rest, text_rest),
            None => false,
        },
        Some((c, rest)) => match text.split_first() {
            Some((t, text_rest)) if t == c => like_match(rest, text_rest),
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    String(String),
    Number(f64),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "{}", s),
            Self::String(s) => write!(f, "'{}'", s),
            Self::Number(n) => write!(f, "{}", n),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(Error::BadRequest(
                                "unterminated string in filter".into(),
                            ));
                        }
                    }
                }
                tokens.push(Token::String(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = number
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad number '{}' in filter", number)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(Error::BadRequest(format!(
                    "unexpected character '{}' in filter",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<RowFilter> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = RowFilter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<RowFilter> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and") {
            let right = self.parse_unary()?;
            left = RowFilter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<RowFilter> {
        if self.eat_keyword("not") {
            return Ok(RowFilter::Not(Box::new(self.parse_unary()?)));
        }

        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(Error::BadRequest("missing ')' in filter".into())),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<RowFilter> {
        let column = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(Error::BadRequest(format!(
                    "expected column name, found '{}'",
                    other.map(|t| t.to_string()).unwrap_or_default()
                )));
            }
        };

        let op = match self.next() {
            Some(Token::Ident(name)) => Op::parse(&name).ok_or_else(|| {
                Error::BadRequest(format!("unknown operator '{}' in filter", name))
            })?,
            other => {
                return Err(Error::BadRequest(format!(
                    "expected operator, found '{}'",
                    other.map(|t| t.to_string()).unwrap_or_default()
                )));
            }
        };

        let value = match op {
            Op::IsNull | Op::IsNotNull => None,
            Op::In => Some(self.parse_list()?),
            _ => Some(self.parse_literal()?),
        };

        Ok(RowFilter::Compare { column, op, value })
    }

    fn parse_list(&mut self) -> Result<Literal> {
        match self.next() {
            Some(Token::LParen) => {}
            _ => return Err(Error::BadRequest("'in' requires a parenthesized list".into())),
        }

        let mut items = Vec::new();
        loop {
            items.push(self.parse_literal()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(Error::BadRequest("malformed list in filter".into())),
            }
        }
        Ok(Literal::List(items))
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.next() {
            Some(Token::String(s)) => Ok(Literal::String(s)),
            Some(Token::Number(n)) => Ok(Literal::Number(n)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                Ok(Literal::Bool(true))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                Ok(Literal::Bool(false))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Ok(Literal::Null),
            other => Err(Error::BadRequest(format!(
                "expected literal value, found '{}'",
                other.map(|t| t.to_string()).unwrap_or_default()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_comparisons() {
        let record = json!({"status": "active", "age": 30, "deleted": false});

        assert!(RowFilter::parse("status eq 'active'").unwrap().matches(&record));
        assert!(!RowFilter::parse("status eq 'archived'").unwrap().matches(&record));
        assert!(RowFilter::parse("status neq 'archived'").unwrap().matches(&record));
        assert!(RowFilter::parse("age gt 18").unwrap().matches(&record));
        assert!(RowFilter::parse("age gte 30").unwrap().matches(&record));
        assert!(!RowFilter::parse("age lt 30").unwrap().matches(&record));
        assert!(RowFilter::parse("age lte 30").unwrap().matches(&record));
        assert!(RowFilter::parse("deleted eq false").unwrap().matches(&record));
    }

    #[test]
    fn test_null_checks() {
        let record = json!({"note": null, "title": "hi"});
        assert!(RowFilter::parse("note is_null").unwrap().matches(&record));
        assert!(!RowFilter::parse("title is_null").unwrap().matches(&record));
        assert!(RowFilter::parse("title is_not_null").unwrap().matches(&record));
        // Absent columns evaluate as null
        assert!(RowFilter::parse("missing is_null").unwrap().matches(&record));
    }

    #[test]
    fn test_in_operator() {
        let record = json!({"status": "active", "priority": 2});
        assert!(RowFilter::parse("status in ('active', 'paused')")
            .unwrap()
            .matches(&record));
        assert!(!RowFilter::parse("status in ('archived')").unwrap().matches(&record));
        assert!(RowFilter::parse("priority in (1, 2, 3)").unwrap().matches(&record));
    }

    #[test]
    fn test_like_and_ilike() {
        let record = json!({"email": "pat@example.com"});
        assert!(RowFilter::parse("email like '%@example.com'")
            .unwrap()
            .matches(&record));
        assert!(!RowFilter::parse("email like '%@EXAMPLE.com'")
            .unwrap()
            .matches(&record));
        assert!(RowFilter::parse("email ilike '%@EXAMPLE.com'")
            .unwrap()
            .matches(&record));
        assert!(RowFilter::parse("email like 'pat@_______.com'")
            .unwrap()
            .matches(&record));
    }

    #[test]
    fn test_boolean_combinators() {
        let record = json!({"status": "active", "age": 30});

        assert!(RowFilter::parse("status eq 'active' and age gt 18")
            .unwrap()
            .matches(&record));
        assert!(!RowFilter::parse("status eq 'active' and age gt 40")
            .unwrap()
            .matches(&record));
        assert!(RowFilter::parse("status eq 'archived' or age gt 18")
            .unwrap()
            .matches(&record));
        assert!(RowFilter::parse("not status eq 'archived'").unwrap().matches(&record));
        assert!(RowFilter::parse("not (status eq 'active' and age lt 18)")
            .unwrap()
            .matches(&record));
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        // a or (b and c), not (a or b) and c
        let filter = RowFilter::parse("x eq 1 or x eq 2 and y eq 3").unwrap();
        assert!(filter.matches(&json!({"x": 1, "y": 0})));
        assert!(!filter.matches(&json!({"x": 2, "y": 0})));
        assert!(filter.matches(&json!({"x": 2, "y": 3})));
    }

    #[test]
    fn test_columns_collection() {
        let filter =
            RowFilter::parse("status eq 'a' and (age gt 1 or status neq 'b')").unwrap();
        assert_eq!(filter.columns(), vec!["age", "status"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(RowFilter::parse("").is_err());
        assert!(RowFilter::parse("status").is_err());
        assert!(RowFilter::parse("status badop 1").is_err());
        assert!(RowFilter::parse("status eq 'unterminated").is_err());
        assert!(RowFilter::parse("status eq 'a' garbage").is_err());
        assert!(RowFilter::parse("(status eq 'a'").is_err());
        assert!(RowFilter::parse("status in 'not-a-list'").is_err());
        assert!(RowFilter::parse("status eq 'a' and").is_err());
    }

    #[test]
    fn test_type_mismatches_never_match() {
        let record = json!({"age": 30});
        assert!(!RowFilter::parse("age eq 'thirty'").unwrap().matches(&record));
        assert!(!RowFilter::parse("age like '3%'").unwrap().matches(&record));
        assert!(!RowFilter::parse("age gt 'abc'").unwrap().matches(&record));
    }
}

//! Derived expressions for open projections
//!
//! The language is deliberately small: terms joined by `+`, where a term is
//! a quoted literal or a field path. Paths may go through one relation and
//! may carry a leading `target.` prefix.
//!
//! ```text
//! expression := term ( '+' term )*
//! term       := 'literal' | "literal" | path
//! path       := ident ( '.' ident )?
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use serde_json::Value;

use crate::record::Record;
use crate::repository::{relation_of, QueryError, QueryOperation, QueryResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Literal(String),
    Path(String),
}

/// A parsed concatenation expression
///
/// # Example
///
/// ```rust
/// use acton_query::projection::Expression;
/// use acton_query::record::Record;
///
/// let expression = Expression::parse("username + ' ' + age + ' ' + team.name").unwrap();
/// let member = Record::new("member", 1)
///     .with_field("username", "member1")
///     .with_field("age", 10)
///     .with_related("team", Record::new("team", 1).with_field("name", "teamA"));
/// assert_eq!(expression.evaluate(&member).unwrap(), "member1 10 teamA");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    terms: Vec<Term>,
}

impl Expression {
    /// Parse an expression, failing with `Configuration` on malformed input
    pub fn parse(source: &str) -> QueryResult<Self> {
        let mut chars = source.chars().peekable();
        let mut terms = Vec::new();

        loop {
            skip_whitespace(&mut chars);
            terms.push(parse_term(&mut chars, source)?);
            skip_whitespace(&mut chars);
            match chars.next() {
                None => break,
                Some('+') => continue,
                Some(other) => {
                    return Err(malformed(
                        source,
                        &format!("expected '+' but found '{}'", other),
                    ))
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    /// The expression text as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field paths the expression reads
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|term| match term {
            Term::Path(path) => Some(path.as_str()),
            Term::Literal(_) => None,
        })
    }

    /// Relations the expression reads through
    pub fn relations(&self) -> BTreeSet<String> {
        self.paths()
            .filter_map(relation_of)
            .map(str::to_string)
            .collect()
    }

    /// Concatenate every term against `record`
    ///
    /// Null values render as `null`; relations read must be resolved.
    pub fn evaluate(&self, record: &Record) -> QueryResult<String> {
        let mut out = String::new();
        for term in &self.terms {
            match term {
                Term::Literal(text) => out.push_str(text),
                Term::Path(path) => out.push_str(&render(&record.path_value(path)?)),
            }
        }
        Ok(out)
    }
}

impl FromStr for Expression {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

fn parse_term(chars: &mut Peekable<Chars<'_>>, source: &str) -> QueryResult<Term> {
    match chars.peek().copied() {
        None => Err(malformed(source, "expected a term")),
        Some(quote @ ('\'' | '"')) => {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    None => return Err(malformed(source, "unterminated literal")),
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(malformed(source, "unterminated literal")),
                    },
                    Some(c) if c == quote => break,
                    Some(c) => text.push(c),
                }
            }
            Ok(Term::Literal(text))
        }
        Some(c) if c.is_alphabetic() || c == '_' => {
            let mut path = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '.' {
                    path.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let path = path.strip_prefix("target.").unwrap_or(&path).to_string();
            let segments: Vec<&str> = path.split('.').collect();
            if segments.iter().any(|segment| segment.is_empty()) {
                return Err(malformed(source, &format!("bad path '{}'", path)));
            }
            if segments.len() > 2 {
                return Err(malformed(
                    source,
                    &format!("path '{}' traverses more than one relation", path),
                ));
            }
            Ok(Term::Path(path))
        }
        Some(other) => Err(malformed(source, &format!("unexpected '{}'", other))),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn malformed(source: &str, reason: &str) -> QueryError {
    QueryError::configuration(
        QueryOperation::Project,
        format!("Malformed expression '{}': {}", source, reason),
    )
}

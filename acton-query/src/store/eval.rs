//! In-process predicate evaluation and ordering
//!
//! Follows SQL semantics where they matter for parity with the SQL stores:
//! comparisons against null are unknown, `NOT unknown` stays unknown, and
//! only rows whose predicate is definitely true match.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

use crate::record::Record;
use crate::repository::{Direction, Filter, FilterOperator, FilterValue, Sort};
use crate::specification::Predicate;

/// A row plus the rows joined to it, keyed by relation name
///
/// A relation mapped to `None` was left joined and had no partner row.
pub(crate) struct RowView<'a> {
    pub record: &'a Record,
    pub related: &'a BTreeMap<String, Option<Record>>,
}

impl RowView<'_> {
    pub fn value(&self, path: &str) -> Value {
        match path.split_once('.') {
            None => self.record.value(path),
            Some((relation, field)) => match self.related.get(relation) {
                Some(Some(related)) => related.value(field),
                Some(None) => Value::Null,
                None => self.record.path_value(path).unwrap_or(Value::Null),
            },
        }
    }
}

/// Whether the predicate definitely holds for the row
pub(crate) fn matches(predicate: &Predicate, row: &RowView<'_>) -> bool {
    evaluate(predicate, row) == Some(true)
}

fn evaluate(predicate: &Predicate, row: &RowView<'_>) -> Option<bool> {
    match predicate {
        Predicate::Condition(filter) => evaluate_filter(filter, row),
        Predicate::All(children) => {
            let mut unknown = false;
            for child in children {
                match evaluate(child, row) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        Predicate::Any(children) => {
            let mut unknown = false;
            for child in children {
                match evaluate(child, row) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        Predicate::Not(child) => evaluate(child, row).map(|holds| !holds),
    }
}

fn evaluate_filter(filter: &Filter, row: &RowView<'_>) -> Option<bool> {
    let actual = row.value(&filter.field);
    match filter.operator {
        FilterOperator::IsNull => return Some(actual.is_null()),
        FilterOperator::IsNotNull => return Some(!actual.is_null()),
        _ => {}
    }
    if actual.is_null() || filter.value == FilterValue::Null {
        return None;
    }

    let expected = filter.value.to_json();
    let ordering = || compare_values(&actual, &expected);
    let holds = match filter.operator {
        FilterOperator::Equal => ordering() == Some(Ordering::Equal),
        FilterOperator::NotEqual => ordering().is_some_and(|o| o != Ordering::Equal),
        FilterOperator::GreaterThan => ordering() == Some(Ordering::Greater),
        FilterOperator::GreaterThanOrEqual => {
            matches!(ordering(), Some(Ordering::Greater | Ordering::Equal))
        }
        FilterOperator::LessThan => ordering() == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => {
            matches!(ordering(), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::Like => match (&actual, &expected) {
            (Value::String(text), Value::String(pattern)) => like(text, pattern),
            _ => false,
        },
        FilterOperator::In => match &expected {
            Value::Array(items) => items
                .iter()
                .any(|item| compare_values(&actual, item) == Some(Ordering::Equal)),
            _ => false,
        },
        FilterOperator::IsNull | FilterOperator::IsNotNull => false,
    };
    Some(holds)
}

/// Compare two JSON values of the same kind
///
/// Numbers compare numerically across integer and float. Mismatched kinds
/// are incomparable.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) | Value::Object(_) => 3,
        Value::Null => 4,
    }
}

/// Total order for sorting: nulls sort last ascending and first descending
pub(crate) fn compare_for_sort(a: &Value, b: &Value, direction: Direction) -> Ordering {
    let ascending = compare_values(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)));
    match direction {
        Direction::Asc => ascending,
        Direction::Desc => ascending.reverse(),
    }
}

/// Compare two rows by every order in `sort`; ties fall through in order
pub(crate) fn compare_rows(sort: &Sort, a: &RowView<'_>, b: &RowView<'_>) -> Ordering {
    sort.orders()
        .iter()
        .map(|order| {
            compare_for_sort(
                &a.value(&order.field),
                &b.value(&order.field),
                order.direction,
            )
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Any,
    One,
    Char(char),
}

/// SQL `LIKE`: `%` matches any run, `_` one character, `\` escapes
pub(crate) fn like(text: &str, pattern: &str) -> bool {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Char(chars.next().unwrap_or('\\')),
            other => Token::Char(other),
        });
    }

    let text: Vec<char> = text.chars().collect();
    // reachable[j]: the first i tokens can consume text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        for j in 0..=text.len() {
            match token {
                Token::Any => next[j] = reachable[j] || (j > 0 && next[j - 1]),
                Token::One => next[j] = j > 0 && reachable[j - 1],
                Token::Char(c) => next[j] = j > 0 && reachable[j - 1] && text[j - 1] == c,
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

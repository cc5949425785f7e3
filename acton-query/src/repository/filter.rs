//! Filter types for building predicates
//!
//! A [`Filter`] names a field path, an operator and a value. Field paths may
//! traverse one relation (`team.name`); such filters need a join declaration
//! when they are turned into a specification.
//!
//! # Example
//!
//! ```rust
//! use acton_query::repository::Filter;
//!
//! let filters = vec![
//!     Filter::eq("username", "member1"),
//!     Filter::gte("age", 18),
//!     Filter::eq("team.name", "teamA"),
//! ];
//! assert_eq!(filters[2].relation(), Some("team"));
//! ```

use std::fmt;

use serde_json::Value;

/// Comparison operators for filters
///
/// # Example
///
/// ```rust
/// use acton_query::repository::FilterOperator;
///
/// assert_eq!(format!("{}", FilterOperator::Equal), "=");
/// assert_eq!(format!("{}", FilterOperator::Like), "LIKE");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Equal to (=)
    Equal,
    /// Not equal to (!=)
    NotEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal to (>=)
    GreaterThanOrEqual,
    /// Less than (<)
    LessThan,
    /// Less than or equal to (<=)
    LessThanOrEqual,
    /// Pattern matching (LIKE), `%` and `_` wildcards, `\` escapes
    Like,
    /// Value is in a list (IN)
    In,
    /// Value is null (IS NULL)
    IsNull,
    /// Value is not null (IS NOT NULL)
    IsNotNull,
}

impl FilterOperator {
    /// Whether the operator compares against a value at all
    pub const fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterThanOrEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessThanOrEqual => write!(f, "<="),
            Self::Like => write!(f, "LIKE"),
            Self::In => write!(f, "IN"),
            Self::IsNull => write!(f, "IS NULL"),
            Self::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// A value that can be used in filters
///
/// `Option<T>` converts to [`FilterValue::Null`] when `None`, which makes an
/// optional search parameter an absent filter without any caller branching.
///
/// # Example
///
/// ```rust
/// use acton_query::repository::FilterValue;
///
/// let name: FilterValue = "member1".into();
/// let age: FilterValue = 42_i64.into();
/// let missing: FilterValue = Option::<String>::None.into();
/// assert!(missing.is_empty());
/// assert!(!age.is_empty());
/// # let _ = name;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// String value
    String(String),
    /// 64-bit integer value
    Integer(i64),
    /// 64-bit floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// List of string values (for IN operator)
    StringList(Vec<String>),
    /// List of integer values (for IN operator)
    IntegerList(Vec<i64>),
    /// Null value
    Null,
}

impl FilterValue {
    /// Whether this value counts as "absent" (null, empty string, empty list)
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::StringList(list) => list.is_empty(),
            Self::IntegerList(list) => list.is_empty(),
            Self::Integer(_) | Self::Float(_) | Self::Boolean(_) => false,
        }
    }

    /// Convert a JSON argument into a filter value
    ///
    /// Arrays become string or integer lists; mixed arrays fall back to
    /// their string renderings. Objects are not filterable and map to `Null`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null | Value::Object(_) => Self::Null,
            Value::Bool(b) => Self::Boolean(*b),
            Value::String(s) => Self::String(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            Value::Array(items) => {
                let integers: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
                match integers {
                    Some(list) if !list.is_empty() => Self::IntegerList(list),
                    _ => Self::StringList(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect(),
                    ),
                }
            }
        }
    }

    /// Convert into a JSON value for in-memory comparison
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(n) => Value::from(*n),
            Self::Float(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Boolean(b) => Value::Bool(*b),
            Self::StringList(list) => Value::Array(list.iter().cloned().map(Value::String).collect()),
            Self::IntegerList(list) => Value::Array(list.iter().copied().map(Value::from).collect()),
            Self::Null => Value::Null,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for FilterValue {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(list: Vec<String>) -> Self {
        Self::StringList(list)
    }
}

impl From<Vec<&str>> for FilterValue {
    fn from(list: Vec<&str>) -> Self {
        Self::StringList(list.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<i64>> for FilterValue {
    fn from(list: Vec<i64>) -> Self {
        Self::IntegerList(list)
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A single filter over one field path
///
/// # Example
///
/// ```rust
/// use acton_query::repository::Filter;
///
/// let status = Filter::eq("username", "member1");
/// let age = Filter::gte("age", 18_i64);
/// let name = Filter::contains("username", "mem");
/// let orphan = Filter::is_null("team");
/// # let _ = (status, age, name, orphan);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// The field path to filter on (`age`, `team.name`)
    pub field: String,
    /// The comparison operator
    pub operator: FilterOperator,
    /// The value to compare against
    pub value: FilterValue,
}

impl Filter {
    /// Create a new filter
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter (field = value)
    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::Equal, value.into())
    }

    /// Create a not-equal filter (field != value)
    pub fn ne(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::NotEqual, value.into())
    }

    /// Create a greater-than filter (field > value)
    pub fn gt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::GreaterThan, value.into())
    }

    /// Create a greater-than-or-equal filter (field >= value)
    pub fn gte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::GreaterThanOrEqual, value.into())
    }

    /// Create a less-than filter (field < value)
    pub fn lt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::LessThan, value.into())
    }

    /// Create a less-than-or-equal filter (field <= value)
    pub fn lte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::LessThanOrEqual, value.into())
    }

    /// Create a pattern matching filter (field LIKE pattern)
    ///
    /// The pattern is used verbatim; see [`Filter::contains`] for an escaped
    /// substring match.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Like, FilterValue::String(pattern.into()))
    }

    /// Substring match with LIKE wildcards in `needle` escaped
    pub fn contains(field: impl Into<String>, needle: &str) -> Self {
        Self::like_affixed(field, needle, "%", "%")
    }

    /// Prefix match with LIKE wildcards in `prefix` escaped
    pub fn starts_with(field: impl Into<String>, prefix: &str) -> Self {
        Self::like_affixed(field, prefix, "", "%")
    }

    /// Suffix match with LIKE wildcards in `suffix` escaped
    pub fn ends_with(field: impl Into<String>, suffix: &str) -> Self {
        Self::like_affixed(field, suffix, "%", "")
    }

    fn like_affixed(field: impl Into<String>, text: &str, before: &str, after: &str) -> Self {
        // An empty needle stays absent instead of becoming a match-all "%%".
        if text.is_empty() {
            return Self::new(field, FilterOperator::Like, FilterValue::Null);
        }
        Self::like(
            field,
            format!("{}{}{}", before, escape_like_wildcards(text), after),
        )
    }

    /// Create an IN filter over string values
    pub fn in_strings(field: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(field, FilterOperator::In, FilterValue::StringList(values))
    }

    /// Create an IN filter over integer values
    pub fn in_integers(field: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(field, FilterOperator::In, FilterValue::IntegerList(values))
    }

    /// Create a null check filter (field IS NULL)
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNull, FilterValue::Null)
    }

    /// Create a not-null check filter (field IS NOT NULL)
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNotNull, FilterValue::Null)
    }

    /// Whether this filter must be dropped instead of constraining the query
    ///
    /// Null checks are never absent; every other operator is absent when its
    /// value is null, an empty string or an empty list.
    pub fn is_absent(&self) -> bool {
        self.operator.takes_value() && self.value.is_empty()
    }

    /// The relation this filter traverses, if any
    pub fn relation(&self) -> Option<&str> {
        relation_of(&self.field)
    }
}

/// The relation segment of a dotted field path (`team.name` -> `team`)
pub fn relation_of(path: &str) -> Option<&str> {
    path.split_once('.').map(|(relation, _)| relation)
}

/// Escape `%`, `_` and `\` so user text matches literally inside LIKE
pub fn escape_like_wildcards(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_operator_display() {
        assert_eq!(format!("{}", FilterOperator::Equal), "=");
        assert_eq!(format!("{}", FilterOperator::NotEqual), "!=");
        assert_eq!(format!("{}", FilterOperator::GreaterThanOrEqual), ">=");
        assert_eq!(format!("{}", FilterOperator::In), "IN");
        assert_eq!(format!("{}", FilterOperator::IsNotNull), "IS NOT NULL");
    }

    #[test]
    fn test_filter_value_from_conversions() {
        assert_eq!(FilterValue::from("x"), FilterValue::String("x".to_string()));
        assert_eq!(FilterValue::from(10_i32), FilterValue::Integer(10));
        assert_eq!(FilterValue::from(true), FilterValue::Boolean(true));
        assert_eq!(
            FilterValue::from(vec!["a", "b"]),
            FilterValue::StringList(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(FilterValue::from(Some(5_i64)), FilterValue::Integer(5));
        assert_eq!(FilterValue::from(Option::<i64>::None), FilterValue::Null);
    }

    #[test]
    fn test_absent_values() {
        assert!(Filter::eq("username", "").is_absent());
        assert!(Filter::eq("username", Option::<String>::None).is_absent());
        assert!(Filter::in_strings("username", vec![]).is_absent());
        assert!(Filter::contains("username", "").is_absent());
        assert!(!Filter::eq("age", 0).is_absent());
        assert!(!Filter::eq("active", false).is_absent());
    }

    #[test]
    fn test_null_checks_are_never_absent() {
        assert!(!Filter::is_null("team").is_absent());
        assert!(!Filter::is_not_null("team").is_absent());
    }

    #[test]
    fn test_relation_path() {
        assert_eq!(Filter::eq("team.name", "teamA").relation(), Some("team"));
        assert_eq!(Filter::eq("username", "m").relation(), None);
    }

    #[test]
    fn test_like_helpers_escape_wildcards() {
        let filter = Filter::contains("username", "50%_off");
        assert_eq!(filter.operator, FilterOperator::Like);
        assert_eq!(
            filter.value,
            FilterValue::String("%50\\%\\_off%".to_string())
        );
        assert_eq!(
            Filter::starts_with("username", "mem").value,
            FilterValue::String("mem%".to_string())
        );
        assert_eq!(
            Filter::ends_with("username", "1").value,
            FilterValue::String("%1".to_string())
        );
    }

    #[test]
    fn test_from_json_arguments() {
        assert_eq!(FilterValue::from_json(&json!(20)), FilterValue::Integer(20));
        assert_eq!(FilterValue::from_json(&json!(1.5)), FilterValue::Float(1.5));
        assert_eq!(
            FilterValue::from_json(&json!(["AAA", "BBB"])),
            FilterValue::StringList(vec!["AAA".to_string(), "BBB".to_string()])
        );
        assert_eq!(
            FilterValue::from_json(&json!([1, 2])),
            FilterValue::IntegerList(vec![1, 2])
        );
        assert_eq!(FilterValue::from_json(&json!(null)), FilterValue::Null);
        assert_eq!(FilterValue::from_json(&json!({"a": 1})), FilterValue::Null);
    }

    #[test]
    fn test_to_json() {
        assert_eq!(FilterValue::Integer(3).to_json(), json!(3));
        assert_eq!(FilterValue::IntegerList(vec![1, 2]).to_json(), json!([1, 2]));
        assert_eq!(FilterValue::Null.to_json(), Value::Null);
    }
}

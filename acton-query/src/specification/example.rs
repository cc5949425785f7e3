//! Query by example
//!
//! A probe record describes the rows to find: every non-null field becomes a
//! filter, and every resolved relation on the probe becomes an inner join with
//! filters on the related fields.

use std::collections::BTreeSet;

use serde_json::Value;

use super::{JoinDeclaration, Specification, SpecificationBuilder};
use crate::record::Record;
use crate::repository::{Filter, FilterValue, QueryResult};

/// How string fields of the probe are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringMatching {
    /// Exact equality
    #[default]
    Exact,
    /// Field contains the probe value
    Contains,
    /// Field starts with the probe value
    StartsWith,
    /// Field ends with the probe value
    EndsWith,
}

/// Which probe paths take part in matching, and how strings compare
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExampleMatcher {
    ignored_paths: BTreeSet<String>,
    string_matching: StringMatching,
    match_ids: bool,
}

impl ExampleMatcher {
    /// Match every non-null probe field exactly; ids are ignored
    pub fn matching() -> Self {
        Self::default()
    }

    /// Builder: skip the given paths (`age`, `team.name`)
    #[must_use]
    pub fn with_ignore_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.ignored_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Builder: string comparison mode
    #[must_use]
    pub fn with_string_matching(mut self, matching: StringMatching) -> Self {
        self.string_matching = matching;
        self
    }

    /// Builder: also match the probe's id and related ids
    #[must_use]
    pub fn with_id_matching(mut self) -> Self {
        self.match_ids = true;
        self
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths.contains(path)
    }

    fn filter(&self, path: String, value: &Value) -> Filter {
        match (value, self.string_matching) {
            (Value::String(text), StringMatching::Contains) => Filter::contains(path, text),
            (Value::String(text), StringMatching::StartsWith) => Filter::starts_with(path, text),
            (Value::String(text), StringMatching::EndsWith) => Filter::ends_with(path, text),
            _ => Filter::eq(path, FilterValue::from_json(value)),
        }
    }
}

/// A probe record plus the matcher that interprets it
///
/// # Example
///
/// ```rust
/// use acton_query::record::Record;
/// use acton_query::specification::{Example, ExampleMatcher};
///
/// let probe = Record::probe("member")
///     .with_field("username", "m1")
///     .with_field("age", 0)
///     .with_related("team", Record::probe("team").with_field("name", "teamA"));
///
/// let spec = Example::of(probe)
///     .with_matcher(ExampleMatcher::matching().with_ignore_paths(["age"]))
///     .to_specification()
///     .unwrap();
/// assert_eq!(spec.joins().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    probe: Record,
    matcher: ExampleMatcher,
}

impl Example {
    /// An example matching every non-null field of `probe`
    pub fn of(probe: Record) -> Self {
        Self {
            probe,
            matcher: ExampleMatcher::matching(),
        }
    }

    /// Builder: replace the matcher
    #[must_use]
    pub fn with_matcher(mut self, matcher: ExampleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Entity the probe belongs to
    pub fn entity(&self) -> &str {
        self.probe.entity()
    }

    /// The specification this example stands for
    pub fn to_specification(&self) -> QueryResult<Specification> {
        let matcher = &self.matcher;
        let mut filters = Vec::new();
        let mut joins = Vec::new();

        if matcher.match_ids && !matcher.is_ignored("id") {
            filters.push(Filter::eq("id", FilterValue::from_json(&self.probe.id().to_value())));
        }
        for (name, value) in self.probe.fields() {
            if !value.is_null() && !matcher.is_ignored(name) {
                filters.push(matcher.filter(name.clone(), value));
            }
        }

        for (name, relation) in self.probe.relations() {
            if matcher.is_ignored(name) {
                continue;
            }
            let related_filters: Vec<Filter> = match relation.get() {
                Some(related) => {
                    let mut out = Vec::new();
                    if matcher.match_ids {
                        out.push(Filter::eq(
                            format!("{}.id", name),
                            FilterValue::from_json(&related.id().to_value()),
                        ));
                    }
                    for (field, value) in related.fields() {
                        let path = format!("{}.{}", name, field);
                        if !value.is_null() && !matcher.is_ignored(&path) {
                            out.push(matcher.filter(path, value));
                        }
                    }
                    out
                }
                None => vec![Filter::eq(
                    format!("{}.id", name),
                    FilterValue::from_json(&relation.id().to_value()),
                )],
            };
            if !related_filters.is_empty() {
                joins.push(JoinDeclaration::inner(name.clone()));
                filters.extend(related_filters);
            }
        }

        SpecificationBuilder::new().joins(&joins).build(&filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specification::Predicate;

    fn fields(spec: &Specification) -> Vec<String> {
        spec.predicate()
            .map(|p| p.filters().into_iter().map(|f| f.field.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_probe_with_team_and_ignored_age() {
        let probe = Record::probe("member")
            .with_field("username", "m1")
            .with_field("age", 0)
            .with_related("team", Record::probe("team").with_field("name", "teamA"));

        let spec = Example::of(probe)
            .with_matcher(ExampleMatcher::matching().with_ignore_paths(["age"]))
            .to_specification()
            .unwrap();

        assert_eq!(fields(&spec), vec!["username", "team.name"]);
        assert_eq!(spec.joins(), &[JoinDeclaration::inner("team")]);
    }

    #[test]
    fn test_null_fields_and_ids_are_skipped() {
        let probe = Record::new("member", 5)
            .with_field("username", "m1")
            .with_field("nickname", Value::Null);
        let spec = Example::of(probe.clone()).to_specification().unwrap();
        assert_eq!(fields(&spec), vec!["username"]);

        let spec = Example::of(probe)
            .with_matcher(ExampleMatcher::matching().with_id_matching())
            .to_specification()
            .unwrap();
        assert_eq!(fields(&spec), vec!["id", "username"]);
    }

    #[test]
    fn test_unresolved_relation_matches_by_id() {
        let probe = Record::probe("member").with_relation("team", "team", 2);
        let spec = Example::of(probe).to_specification().unwrap();
        assert_eq!(fields(&spec), vec!["team.id"]);
        assert_eq!(spec.joins().len(), 1);
    }

    #[test]
    fn test_string_matching_modes() {
        let probe = Record::probe("member").with_field("username", "mem");
        let spec = Example::of(probe)
            .with_matcher(ExampleMatcher::matching().with_string_matching(StringMatching::StartsWith))
            .to_specification()
            .unwrap();
        match spec.predicate() {
            Some(Predicate::Condition(filter)) => {
                assert_eq!(filter.value, FilterValue::String("mem%".to_string()))
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_empty_probe_is_unrestricted() {
        let spec = Example::of(Record::probe("member")).to_specification().unwrap();
        assert!(spec.is_unrestricted());
    }
}

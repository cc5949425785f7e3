//! Specification builder
//!
//! Turns an ordered list of [`Filter`]s plus join declarations into a
//! composable [`Specification`]. Absent filters contribute nothing; relation
//! filters need an explicit join declaration.
//!
//! # Example
//!
//! ```rust
//! use acton_query::repository::Filter;
//! use acton_query::specification::{Combinator, JoinDeclaration, SpecificationBuilder};
//!
//! let team_name: Option<String> = None;
//! let by_team = SpecificationBuilder::new()
//!     .join(JoinDeclaration::inner("team"))
//!     .build(&[Filter::eq("team.name", team_name)])
//!     .unwrap();
//! assert!(by_team.is_unrestricted());
//!
//! let by_name = SpecificationBuilder::new()
//!     .combine_with(Combinator::Or)
//!     .build(&[Filter::eq("username", "m1"), Filter::eq("username", "m2")])
//!     .unwrap();
//! let spec = by_team.and(by_name);
//! assert!(!spec.is_unrestricted());
//! ```

mod example;

pub use example::{Example, ExampleMatcher, StringMatching};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::repository::{Filter, QueryError, QueryOperation, QueryResult};

/// How a joined relation treats rows without a related record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Rows without a related record are excluded
    #[default]
    Inner,
    /// Rows without a related record are kept; related fields read as null
    Left,
}

/// A relation the query joins, and how
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinDeclaration {
    /// Relation name, as used in field paths
    pub relation: String,
    /// Join kind
    #[serde(default)]
    pub kind: JoinKind,
}

impl JoinDeclaration {
    /// Inner join on `relation`
    pub fn inner(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            kind: JoinKind::Inner,
        }
    }

    /// Left join on `relation`
    pub fn left(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            kind: JoinKind::Left,
        }
    }
}

/// Boolean operator used to combine the filters of one build call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// Every filter must hold
    #[default]
    And,
    /// At least one filter must hold
    Or,
}

/// Boolean condition tree over filters
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// A single filter
    Condition(Filter),
    /// All children hold
    All(Vec<Predicate>),
    /// At least one child holds
    Any(Vec<Predicate>),
    /// The child does not hold
    Not(Box<Predicate>),
}

impl Predicate {
    /// Conjunction, flattening nested conjunctions
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let mut children = match self {
            Self::All(children) => children,
            single => vec![single],
        };
        match other {
            Self::All(more) => children.extend(more),
            single => children.push(single),
        }
        Self::All(children)
    }

    /// Disjunction, flattening nested disjunctions
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        let mut children = match self {
            Self::Any(children) => children,
            single => vec![single],
        };
        match other {
            Self::Any(more) => children.extend(more),
            single => children.push(single),
        }
        Self::Any(children)
    }

    /// Negation; double negation collapses
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Every filter in the tree, depth first
    pub fn filters(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_filters(&mut out);
        out
    }

    fn collect_filters<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            Self::Condition(filter) => out.push(filter),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_filters(out);
                }
            }
            Self::Not(inner) => inner.collect_filters(out),
        }
    }

    fn from_filters(mut filters: Vec<Filter>, combinator: Combinator) -> Option<Self> {
        if filters.len() <= 1 {
            return filters.pop().map(Self::Condition);
        }
        let children = filters.into_iter().map(Self::Condition).collect();
        Some(match combinator {
            Combinator::And => Self::All(children),
            Combinator::Or => Self::Any(children),
        })
    }
}

/// A reusable predicate together with the joins it needs
///
/// An unrestricted specification (no predicate) matches every row and acts
/// as the identity for both [`Specification::and`] and [`Specification::or`]:
/// a side with nothing to say contributes nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Specification {
    predicate: Option<Predicate>,
    joins: Vec<JoinDeclaration>,
}

impl Specification {
    /// The specification that matches every row
    pub fn all() -> Self {
        Self::default()
    }

    /// A specification from a predicate and joins
    ///
    /// Fails with `Configuration` when the predicate traverses a relation
    /// without a matching join declaration, or declarations conflict.
    pub fn new(predicate: Option<Predicate>, joins: Vec<JoinDeclaration>) -> QueryResult<Self> {
        let joins = normalize_joins(&joins)?;
        if let Some(predicate) = &predicate {
            for filter in predicate.filters() {
                check_filter(filter, &joins)?;
            }
        }
        Ok(Self { predicate, joins })
    }

    /// The predicate, `None` when unrestricted
    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Declared joins
    pub fn joins(&self) -> &[JoinDeclaration] {
        &self.joins
    }

    /// The join declared for `relation`
    pub fn join(&self, relation: &str) -> Option<&JoinDeclaration> {
        self.joins.iter().find(|join| join.relation == relation)
    }

    /// Whether this specification places no restriction on the rows
    ///
    /// Inner joins restrict rows too, so a predicate-free specification with
    /// an inner join is not unrestricted.
    pub fn is_unrestricted(&self) -> bool {
        self.predicate.is_none() && self.joins.iter().all(|join| join.kind == JoinKind::Left)
    }

    /// Relations the predicate reads from
    pub fn referenced_relations(&self) -> BTreeSet<String> {
        self.predicate
            .as_ref()
            .map(|predicate| {
                predicate
                    .filters()
                    .into_iter()
                    .filter_map(|filter| filter.relation().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Both specifications hold
    #[must_use]
    pub fn and(self, other: Specification) -> Self {
        self.combine(other, Predicate::and)
    }

    /// At least one specification holds
    #[must_use]
    pub fn or(self, other: Specification) -> Self {
        self.combine(other, Predicate::or)
    }

    /// The predicate does not hold; an unrestricted specification stays unrestricted
    #[must_use]
    pub fn negate(self) -> Self {
        Self {
            predicate: self.predicate.map(Predicate::negate),
            joins: self.joins,
        }
    }

    /// Add a join declaration; an inner declaration wins over a left one
    #[must_use]
    pub fn with_join(mut self, declaration: JoinDeclaration) -> Self {
        merge_join(&mut self.joins, declaration);
        self
    }

    /// Keep only the joins for which `keep` returns true
    ///
    /// Joins the predicate needs are always kept.
    #[must_use]
    pub fn retain_joins<F>(mut self, mut keep: F) -> Self
    where
        F: FnMut(&JoinDeclaration) -> bool,
    {
        let referenced = self.referenced_relations();
        self.joins
            .retain(|join| referenced.contains(join.relation.as_str()) || keep(join));
        self
    }

    fn combine<F>(self, other: Specification, op: F) -> Self
    where
        F: FnOnce(Predicate, Predicate) -> Predicate,
    {
        let predicate = match (self.predicate, other.predicate) {
            (Some(left), Some(right)) => Some(op(left, right)),
            (left, right) => left.or(right),
        };
        let mut joins = self.joins;
        for declaration in other.joins {
            merge_join(&mut joins, declaration);
        }
        Self { predicate, joins }
    }
}

/// Builds specifications from filters with a fixed set of join declarations
///
/// Building is pure: the same filters always produce equal specifications.
#[derive(Debug, Clone, Default)]
pub struct SpecificationBuilder {
    joins: Vec<JoinDeclaration>,
    combinator: Combinator,
}

impl SpecificationBuilder {
    /// A builder without joins that combines filters with AND
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: declare a join for relation filters
    #[must_use]
    pub fn join(mut self, declaration: JoinDeclaration) -> Self {
        self.joins.push(declaration);
        self
    }

    /// Builder: declare several joins
    #[must_use]
    pub fn joins(mut self, declarations: &[JoinDeclaration]) -> Self {
        self.joins.extend_from_slice(declarations);
        self
    }

    /// Builder: operator used between the filters of one build
    #[must_use]
    pub fn combine_with(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }

    /// Build a specification from `filters`
    ///
    /// Absent filters are dropped, and so are joins only they referenced.
    /// Every filter is validated, present or not: a relation filter without a
    /// join declaration is a `Configuration` error either way.
    pub fn build(&self, filters: &[Filter]) -> QueryResult<Specification> {
        let declared = normalize_joins(&self.joins)?;

        let mut present = Vec::with_capacity(filters.len());
        for filter in filters {
            check_filter(filter, &declared)?;
            if filter.is_absent() {
                tracing::trace!(field = %filter.field, operator = %filter.operator, "dropping absent filter");
                continue;
            }
            present.push(filter.clone());
        }

        let used: BTreeSet<&str> = present.iter().filter_map(Filter::relation).collect();
        let joins = declared
            .into_iter()
            .filter(|join| used.contains(join.relation.as_str()))
            .collect();

        Ok(Specification {
            predicate: Predicate::from_filters(present, self.combinator),
            joins,
        })
    }
}

/// Build an AND-combined specification from filters and join declarations
pub fn build_specification(
    filters: &[Filter],
    joins: &[JoinDeclaration],
) -> QueryResult<Specification> {
    SpecificationBuilder::new().joins(joins).build(filters)
}

fn check_filter(filter: &Filter, joins: &[JoinDeclaration]) -> QueryResult<()> {
    if filter.field.is_empty() || filter.field.starts_with('.') || filter.field.ends_with('.') {
        return Err(QueryError::configuration(
            QueryOperation::Build,
            format!("Malformed filter field '{}'", filter.field),
        ));
    }
    if let Some(relation) = filter.relation() {
        if !joins.iter().any(|join| join.relation == relation) {
            return Err(QueryError::configuration(
                QueryOperation::Build,
                format!(
                    "Filter on '{}' needs a join declaration for relation '{}'",
                    filter.field, relation
                ),
            ));
        }
    }
    Ok(())
}

fn normalize_joins(declarations: &[JoinDeclaration]) -> QueryResult<Vec<JoinDeclaration>> {
    let mut joins: Vec<JoinDeclaration> = Vec::with_capacity(declarations.len());
    for declaration in declarations {
        if declaration.relation.is_empty() || declaration.relation.contains('.') {
            return Err(QueryError::configuration(
                QueryOperation::Build,
                format!("Malformed join relation '{}'", declaration.relation),
            ));
        }
        match joins.iter().find(|join| join.relation == declaration.relation) {
            Some(existing) if existing.kind != declaration.kind => {
                return Err(QueryError::configuration(
                    QueryOperation::Build,
                    format!(
                        "Relation '{}' is declared as both inner and left join",
                        declaration.relation
                    ),
                ));
            }
            Some(_) => {}
            None => joins.push(declaration.clone()),
        }
    }
    Ok(joins)
}

fn merge_join(joins: &mut Vec<JoinDeclaration>, declaration: JoinDeclaration) {
    match joins
        .iter_mut()
        .find(|join| join.relation == declaration.relation)
    {
        Some(existing) => {
            if declaration.kind == JoinKind::Inner {
                existing.kind = JoinKind::Inner;
            }
        }
        None => joins.push(declaration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::QueryErrorKind;

    #[test]
    fn test_absent_filters_are_dropped() {
        let with_absent = build_specification(
            &[
                Filter::eq("username", ""),
                Filter::gte("age", 20),
                Filter::eq("nickname", Option::<String>::None),
            ],
            &[],
        )
        .unwrap();
        let without = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        assert_eq!(with_absent, without);
    }

    #[test]
    fn test_all_absent_is_unrestricted() {
        let spec = build_specification(&[Filter::eq("username", "")], &[]).unwrap();
        assert!(spec.is_unrestricted());
        assert!(spec.predicate().is_none());
    }

    #[test]
    fn test_relation_filter_without_join_fails() {
        let err = build_specification(&[Filter::eq("team.name", "teamA")], &[]).unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Configuration);
        assert_eq!(err.operation, QueryOperation::Build);

        let err = build_specification(&[Filter::eq("team.name", "")], &[]).unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Configuration);
    }

    #[test]
    fn test_absent_relation_filter_drops_its_join() {
        let spec = build_specification(
            &[Filter::eq("team.name", ""), Filter::eq("username", "m1")],
            &[JoinDeclaration::inner("team")],
        )
        .unwrap();
        assert!(spec.joins().is_empty());

        let spec = build_specification(
            &[Filter::eq("team.name", "teamA")],
            &[JoinDeclaration::inner("team")],
        )
        .unwrap();
        assert_eq!(spec.join("team"), Some(&JoinDeclaration::inner("team")));
    }

    #[test]
    fn test_conflicting_join_declarations_fail() {
        let err = build_specification(
            &[],
            &[JoinDeclaration::inner("team"), JoinDeclaration::left("team")],
        )
        .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Configuration);
    }

    #[test]
    fn test_malformed_filter_field_fails() {
        let err = build_specification(&[Filter::eq("", 1)], &[]).unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Configuration);
        let err = build_specification(&[Filter::eq("team.", 1)], &[JoinDeclaration::inner("team")])
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Configuration);
    }

    #[test]
    fn test_build_is_idempotent() {
        let builder = SpecificationBuilder::new().join(JoinDeclaration::left("team"));
        let filters = [Filter::eq("team.name", "teamA"), Filter::lt("age", 30)];
        assert_eq!(builder.build(&filters).unwrap(), builder.build(&filters).unwrap());
    }

    #[test]
    fn test_combinator_or() {
        let spec = SpecificationBuilder::new()
            .combine_with(Combinator::Or)
            .build(&[Filter::eq("username", "a"), Filter::eq("username", "b")])
            .unwrap();
        assert!(matches!(spec.predicate(), Some(Predicate::Any(children)) if children.len() == 2));
    }

    #[test]
    fn test_unrestricted_is_identity_for_and_or() {
        let age = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        assert_eq!(Specification::all().and(age.clone()), age);
        assert_eq!(age.clone().or(Specification::all()), age);
    }

    #[test]
    fn test_and_or_flatten_and_merge_joins() {
        let team = build_specification(
            &[Filter::eq("team.name", "teamA")],
            &[JoinDeclaration::left("team")],
        )
        .unwrap();
        let inner_team = Specification::all().with_join(JoinDeclaration::inner("team"));
        let age = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        let name = build_specification(&[Filter::eq("username", "m1")], &[]).unwrap();

        let spec = team.and(age).and(name).and(inner_team);
        assert!(matches!(spec.predicate(), Some(Predicate::All(children)) if children.len() == 3));
        assert_eq!(spec.joins(), &[JoinDeclaration::inner("team")]);
    }

    #[test]
    fn test_not_negates_and_collapses() {
        let age = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        let negated = age.clone().negate();
        assert!(matches!(negated.predicate(), Some(Predicate::Not(_))));
        assert_eq!(negated.negate(), age);
        assert!(Specification::all().negate().is_unrestricted());
    }

    #[test]
    fn test_new_validates_relation_paths() {
        let predicate = Predicate::Condition(Filter::eq("team.name", "teamA"));
        assert!(Specification::new(Some(predicate.clone()), vec![]).is_err());
        assert!(Specification::new(Some(predicate), vec![JoinDeclaration::inner("team")]).is_ok());
    }

    #[test]
    fn test_inner_join_alone_is_a_restriction() {
        let spec = Specification::all().with_join(JoinDeclaration::inner("team"));
        assert!(!spec.is_unrestricted());
        let spec = Specification::all().with_join(JoinDeclaration::left("team"));
        assert!(spec.is_unrestricted());
    }

    #[test]
    fn test_retain_joins_keeps_referenced() {
        let spec = build_specification(
            &[Filter::eq("team.name", "teamA")],
            &[JoinDeclaration::left("team")],
        )
        .unwrap()
        .with_join(JoinDeclaration::left("club"))
        .retain_joins(|_| false);
        assert_eq!(spec.joins(), &[JoinDeclaration::left("team")]);
    }
}

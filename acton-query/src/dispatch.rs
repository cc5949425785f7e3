//! Repository facades
//!
//! A [`RepositoryFacade`] exposes one named surface over an entity. Three
//! kinds of operations share that surface:
//!
//! - base operations every facade has (`find_by_id`, `find_all`, `count`,
//!   `exists_by_id`, `delete_by_id`)
//! - [`GeneratedOperation`]s, built from explicit parameter to filter bindings
//! - hand-written [`QueryFragment`]s, such as [`NativeFragment`] and
//!   [`BulkUpdateFragment`]
//!
//! Names must be unique across all three; [`FacadeBuilder::build`] rejects a
//! collision with `Configuration` before any call is made.
//!
//! # Example
//!
//! ```rust,ignore
//! let facade = FacadeBuilder::new("member")
//!     .generated(
//!         GeneratedOperation::new("find_by_username", ResultShape::Single)
//!             .bind("username", "username", FilterOperator::Equal),
//!     )
//!     .build()?;
//!
//! let outcome = facade
//!     .dispatch(&session, "find_by_username", &Args::new().with("username", "member1"))
//!     .await?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::QueryConfig;
use crate::paging::Paginator;
use crate::projection::{project, ProjectionRegistry, ProjectionSpec};
use crate::record::{Record, RecordId};
use crate::repository::{
    Assignment, BulkUpdate, CountQuery, CountStrategy, Filter, FilterOperator, FilterValue,
    LockMode, NativeQuery, PageRequest, PagedResult, QueryError, QueryOperation, QueryResult,
    RecordStore, RelationLoader, SelectQuery, Sort,
};
use crate::specification::{Combinator, JoinDeclaration, Specification, SpecificationBuilder};

/// Named arguments of one dispatched call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: BTreeMap<String, Value>,
    page: Option<PageRequest>,
    projection: Option<String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: named argument
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Builder: page request for paged operations
    #[must_use]
    pub fn page(mut self, request: PageRequest) -> Self {
        self.page = Some(request);
        self
    }

    /// Builder: shape results through a registered projection
    #[must_use]
    pub fn project(mut self, projection: impl Into<String>) -> Self {
        self.projection = Some(projection.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn page_request(&self) -> Option<&PageRequest> {
        self.page.as_ref()
    }

    pub fn projection(&self) -> Option<&str> {
        self.projection.as_deref()
    }

    fn id(&self, operation: &str) -> QueryResult<RecordId> {
        self.get("id").and_then(RecordId::from_value).ok_or_else(|| {
            QueryError::configuration(
                QueryOperation::Dispatch,
                format!("Operation '{}' needs an 'id' argument", operation),
            )
        })
    }
}

/// Result of a dispatched call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Zero or more records
    Records(Vec<Record>),
    /// A single-result lookup; `None` when nothing matched
    Record(Option<Record>),
    /// A page, slice or unpaged result
    Paged(PagedResult<Record>),
    /// A page of projected values
    ProjectedPage(PagedResult<Value>),
    /// Projected values
    Projected(Vec<Value>),
    Count(u64),
    Exists(bool),
    /// Rows changed by a bulk statement or delete
    Affected(u64),
}

/// What a generated operation returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    #[default]
    List,
    /// At most one record; more is `MultipleResults`
    Single,
    Count,
    Exists,
    /// Bulk delete of the matched rows
    Delete,
    /// Paged with the given count strategy; without [`Args::page`] the
    /// first page of the configured default size is returned
    Page(CountStrategy),
}

impl ResultShape {
    /// Whether the result is made of records a projection can shape
    fn yields_records(self) -> bool {
        matches!(self, Self::List | Self::Single | Self::Page(_))
    }
}

/// Maps one named argument onto a filter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBinding {
    pub param: String,
    pub field: String,
    pub operator: FilterOperator,
}

impl ParamBinding {
    /// Filter for this binding; a missing argument gives an absent filter
    ///
    /// Objects, and lists holding objects, are rejected rather than read as
    /// absent: dropping the filter would widen the query.
    fn filter(&self, operation: &str, args: &Args) -> QueryResult<Filter> {
        let value = match args.get(&self.param) {
            None => FilterValue::Null,
            Some(value) if is_structured(value) => {
                return Err(QueryError::configuration(
                    QueryOperation::Dispatch,
                    format!(
                        "Operation '{}' cannot filter '{}' by a structured '{}' argument",
                        operation, self.field, self.param
                    ),
                ));
            }
            Some(value) => FilterValue::from_json(value),
        };
        Ok(Filter::new(self.field.clone(), self.operator, value))
    }
}

fn is_structured(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(Value::is_object),
        _ => false,
    }
}

fn bound_filters(operation: &str, bindings: &[ParamBinding], args: &Args) -> QueryResult<Vec<Filter>> {
    bindings
        .iter()
        .map(|binding| binding.filter(operation, args))
        .collect()
}

/// A query operation described by bindings rather than code
///
/// A binding whose argument is missing or empty contributes no filter.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedOperation {
    name: String,
    shape: ResultShape,
    bindings: Vec<ParamBinding>,
    joins: Vec<JoinDeclaration>,
    combinator: Combinator,
    sort: Sort,
    limit: Option<u64>,
    lock: LockMode,
    fetch: Vec<String>,
    read_only: bool,
}

impl GeneratedOperation {
    pub fn new(name: impl Into<String>, shape: ResultShape) -> Self {
        Self {
            name: name.into(),
            shape,
            bindings: Vec::new(),
            joins: Vec::new(),
            combinator: Combinator::And,
            sort: Sort::unsorted(),
            limit: None,
            lock: LockMode::None,
            fetch: Vec::new(),
            read_only: false,
        }
    }

    /// Builder: bind argument `param` to a filter on `field`
    #[must_use]
    pub fn bind(
        mut self,
        param: impl Into<String>,
        field: impl Into<String>,
        operator: FilterOperator,
    ) -> Self {
        self.bindings.push(ParamBinding {
            param: param.into(),
            field: field.into(),
            operator,
        });
        self
    }

    #[must_use]
    pub fn join(mut self, declaration: JoinDeclaration) -> Self {
        self.joins.push(declaration);
        self
    }

    #[must_use]
    pub fn combine_with(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }

    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub fn fetch(mut self, relation: impl Into<String>) -> Self {
        self.fetch.push(relation.into());
        self
    }

    /// Builder: return rows without entering them in the session cache
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that every relation binding has a join declaration
    fn validate(&self) -> QueryResult<()> {
        for binding in &self.bindings {
            if let Some(relation) = binding.field.split_once('.').map(|(r, _)| r) {
                if !self.joins.iter().any(|join| join.relation == relation) {
                    return Err(QueryError::configuration(
                        QueryOperation::Build,
                        format!(
                            "Operation '{}' binds '{}' without a join on '{}'",
                            self.name, binding.field, relation
                        ),
                    ));
                }
            }
        }
        if self.shape == ResultShape::Delete && self.lock != LockMode::None {
            return Err(QueryError::configuration(
                QueryOperation::Build,
                format!("Operation '{}' cannot lock rows it deletes", self.name),
            ));
        }
        Ok(())
    }

    fn specification(&self, args: &Args) -> QueryResult<Specification> {
        let filters = bound_filters(&self.name, &self.bindings, args)?;
        SpecificationBuilder::new()
            .joins(&self.joins)
            .combine_with(self.combinator)
            .build(&filters)
    }

    fn select(&self, entity: &str, args: &Args) -> QueryResult<SelectQuery> {
        let mut query = SelectQuery::new(entity)
            .with_specification(self.specification(args)?)
            .with_sort(self.sort.clone())
            .with_lock(self.lock);
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        for relation in &self.fetch {
            query = query.fetch(relation.clone());
        }
        if self.read_only {
            query = query.read_only();
        }
        Ok(query)
    }
}

/// A hand-written operation
#[async_trait]
pub trait QueryFragment<S>: Send + Sync {
    /// Name the operation is dispatched under
    fn name(&self) -> &str;

    /// Whether [`call`](Self::call) returns records a projection can shape
    ///
    /// A projected call to a fragment that does not is rejected before it runs.
    fn yields_records(&self) -> bool {
        false
    }

    async fn call(&self, store: &S, args: &Args) -> QueryResult<Outcome>;
}

/// A raw native query with named arguments bound positionally
///
/// Nothing checks the query text; see [`NativeQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct NativeFragment {
    name: String,
    entity: String,
    sql: String,
    params: Vec<String>,
    single: bool,
}

impl NativeFragment {
    pub fn new(name: impl Into<String>, entity: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            sql: sql.into(),
            params: Vec::new(),
            single: false,
        }
    }

    /// Builder: next positional parameter, read from argument `param`
    #[must_use]
    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Builder: expect at most one row
    #[must_use]
    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }
}

#[async_trait]
impl<S> QueryFragment<S> for NativeFragment
where
    S: RecordStore + RelationLoader,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn yields_records(&self) -> bool {
        true
    }

    async fn call(&self, store: &S, args: &Args) -> QueryResult<Outcome> {
        let query = self.params.iter().fold(
            NativeQuery::new(self.entity.clone(), self.sql.clone()),
            |query, param| query.bind(args.get(param).cloned().unwrap_or(Value::Null)),
        );
        let records = store.native(&query).await?;
        if self.single {
            single(records).map(Outcome::Record)
        } else {
            Ok(Outcome::Records(records))
        }
    }
}

/// A bulk update over bound filters
///
/// Assignments are fixed, or read from an argument with
/// [`assign_param`](Self::assign_param).
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdateFragment {
    name: String,
    entity: String,
    bindings: Vec<ParamBinding>,
    joins: Vec<JoinDeclaration>,
    assignments: Vec<Assignment>,
    param_assignments: Vec<(String, String)>,
    keep_cache: bool,
}

impl BulkUpdateFragment {
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            bindings: Vec::new(),
            joins: Vec::new(),
            assignments: Vec::new(),
            param_assignments: Vec::new(),
            keep_cache: false,
        }
    }

    #[must_use]
    pub fn bind(
        mut self,
        param: impl Into<String>,
        field: impl Into<String>,
        operator: FilterOperator,
    ) -> Self {
        self.bindings.push(ParamBinding {
            param: param.into(),
            field: field.into(),
            operator,
        });
        self
    }

    #[must_use]
    pub fn join(mut self, declaration: JoinDeclaration) -> Self {
        self.joins.push(declaration);
        self
    }

    #[must_use]
    pub fn assign(mut self, assignment: Assignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    /// Builder: set `field` to the value of argument `param`
    #[must_use]
    pub fn assign_param(mut self, field: impl Into<String>, param: impl Into<String>) -> Self {
        self.param_assignments.push((field.into(), param.into()));
        self
    }

    /// Builder: leave the session cache alone afterwards
    #[must_use]
    pub fn keep_cache(mut self) -> Self {
        self.keep_cache = true;
        self
    }
}

#[async_trait]
impl<S> QueryFragment<S> for BulkUpdateFragment
where
    S: RecordStore + RelationLoader,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, store: &S, args: &Args) -> QueryResult<Outcome> {
        let filters = bound_filters(&self.name, &self.bindings, args)?;
        let specification = SpecificationBuilder::new()
            .joins(&self.joins)
            .build(&filters)?;

        let mut assignments = self.assignments.clone();
        for (field, param) in &self.param_assignments {
            let value = args.get(param).cloned().ok_or_else(|| {
                QueryError::configuration(
                    QueryOperation::Dispatch,
                    format!("Operation '{}' needs a '{}' argument", self.name, param),
                )
            })?;
            assignments.push(Assignment::set(field.clone(), value));
        }

        let mut statement = BulkUpdate::update(self.entity.clone(), specification, assignments);
        if self.keep_cache {
            statement = statement.keep_cache();
        }
        store.execute(&statement).await.map(Outcome::Affected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseOperation {
    FindById,
    FindAll,
    Count,
    ExistsById,
    DeleteById,
}

impl BaseOperation {
    fn yields_records(self) -> bool {
        matches!(self, Self::FindById | Self::FindAll)
    }

    const ALL: [(&'static str, BaseOperation); 5] = [
        ("find_by_id", Self::FindById),
        ("find_all", Self::FindAll),
        ("count", Self::Count),
        ("exists_by_id", Self::ExistsById),
        ("delete_by_id", Self::DeleteById),
    ];
}

enum Operation<S> {
    Base(BaseOperation),
    Generated(GeneratedOperation),
    Custom(Arc<dyn QueryFragment<S>>),
}

impl<S> Operation<S> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Base(_) => "base",
            Self::Generated(_) => "generated",
            Self::Custom(_) => "custom",
        }
    }

    fn yields_records(&self) -> bool {
        match self {
            Self::Base(base) => base.yields_records(),
            Self::Generated(generated) => generated.shape.yields_records(),
            Self::Custom(fragment) => fragment.yields_records(),
        }
    }
}

/// Assembles a [`RepositoryFacade`]
pub struct FacadeBuilder<S> {
    entity: String,
    entries: Vec<(String, Operation<S>)>,
    registry: ProjectionRegistry,
    paginator: Paginator,
    count_strategy: CountStrategy,
    default_page_size: u64,
}

impl<S> FacadeBuilder<S>
where
    S: RecordStore + RelationLoader,
{
    /// Builder for `entity` with the base operations
    pub fn new(entity: impl Into<String>) -> Self {
        let entries = BaseOperation::ALL
            .iter()
            .map(|(name, base)| ((*name).to_string(), Operation::Base(*base)))
            .collect();
        Self {
            entity: entity.into(),
            entries,
            registry: ProjectionRegistry::new(),
            paginator: Paginator::default(),
            count_strategy: CountStrategy::default(),
            default_page_size: QueryConfig::default().default_page_size,
        }
    }

    /// Builder: page sizes and default count strategy
    #[must_use]
    pub fn with_config(mut self, config: &QueryConfig) -> Self {
        self.paginator = Paginator::from_config(config);
        self.count_strategy = config.count_strategy;
        self.default_page_size = config.default_page_size;
        self
    }

    #[must_use]
    pub fn generated(mut self, operation: GeneratedOperation) -> Self {
        self.entries
            .push((operation.name.clone(), Operation::Generated(operation)));
        self
    }

    #[must_use]
    pub fn fragment<F>(mut self, fragment: F) -> Self
    where
        F: QueryFragment<S> + 'static,
    {
        self.entries
            .push((fragment.name().to_string(), Operation::Custom(Arc::new(fragment))));
        self
    }

    /// Builder: projections selectable per call with [`Args::project`]
    #[must_use]
    pub fn projections(mut self, registry: ProjectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Check names and generated operations, then assemble the facade
    pub fn build(self) -> QueryResult<RepositoryFacade<S>> {
        let mut operations = BTreeMap::new();
        let mut seen = HashSet::new();
        for (name, operation) in self.entries {
            if let Operation::Generated(generated) = &operation {
                generated.validate()?;
            }
            if !seen.insert(name.clone()) {
                let existing: &Operation<S> = &operations[&name];
                return Err(QueryError::configuration(
                    QueryOperation::Build,
                    format!(
                        "Operation '{}' is defined twice ({} and {})",
                        name,
                        existing.kind(),
                        operation.kind()
                    ),
                ));
            }
            operations.insert(name, operation);
        }

        tracing::debug!(
            entity = %self.entity,
            operations = operations.len(),
            "repository facade assembled"
        );
        Ok(RepositoryFacade {
            entity: self.entity,
            operations,
            registry: self.registry,
            paginator: self.paginator,
            count_strategy: self.count_strategy,
            default_page_size: self.default_page_size,
        })
    }
}

/// One named operation surface over an entity
pub struct RepositoryFacade<S> {
    entity: String,
    operations: BTreeMap<String, Operation<S>>,
    registry: ProjectionRegistry,
    paginator: Paginator,
    count_strategy: CountStrategy,
    default_page_size: u64,
}

impl<S> std::fmt::Debug for RepositoryFacade<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryFacade")
            .field("entity", &self.entity)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S> RepositoryFacade<S>
where
    S: RecordStore + RelationLoader,
{
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Names of every operation, sorted
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Route a call to the operation registered under `name`
    pub async fn dispatch(&self, store: &S, name: &str, args: &Args) -> QueryResult<Outcome> {
        let operation = self.operations.get(name).ok_or_else(|| {
            QueryError::configuration(
                QueryOperation::Dispatch,
                format!("No operation '{}' on entity '{}'", name, self.entity),
            )
        })?;
        let projection = args
            .projection()
            .map(|name| self.registry.get(name))
            .transpose()?;
        if projection.is_some() && !operation.yields_records() {
            return Err(QueryError::configuration(
                QueryOperation::Dispatch,
                format!(
                    "Operation '{}' does not return records and cannot be projected",
                    name
                ),
            ));
        }
        tracing::debug!(
            entity = %self.entity,
            operation = name,
            kind = operation.kind(),
            projection = args.projection(),
            "dispatching"
        );

        match operation {
            Operation::Base(base) => self.run_base(store, name, *base, args, projection).await,
            Operation::Generated(generated) => {
                self.run_generated(store, generated, args, projection).await
            }
            Operation::Custom(fragment) => {
                let outcome = fragment.call(store, args).await?;
                match projection {
                    Some(spec) => project_outcome(store, outcome, spec).await,
                    None => Ok(outcome),
                }
            }
        }
    }

    async fn run_base(
        &self,
        store: &S,
        name: &str,
        base: BaseOperation,
        args: &Args,
        projection: Option<&ProjectionSpec>,
    ) -> QueryResult<Outcome> {
        let outcome = match base {
            BaseOperation::FindById => {
                Outcome::Record(store.find_by_id(&self.entity, &args.id(name)?).await?)
            }
            BaseOperation::FindAll => {
                let query = SelectQuery::new(self.entity.clone());
                match args.page_request() {
                    Some(request) => Outcome::Paged(
                        self.paginator
                            .paginate(store, &query, request, self.count_strategy)
                            .await?,
                    ),
                    None => Outcome::Records(store.query(&query).await?),
                }
            }
            BaseOperation::Count => Outcome::Count(
                store
                    .count(&CountQuery::new(self.entity.clone(), Specification::all()))
                    .await?,
            ),
            BaseOperation::ExistsById => Outcome::Exists(
                store
                    .find_by_id(&self.entity, &args.id(name)?)
                    .await?
                    .is_some(),
            ),
            BaseOperation::DeleteById => Outcome::Affected(u64::from(
                store.delete(&self.entity, &args.id(name)?).await?,
            )),
        };
        match projection {
            Some(spec) => project_outcome(store, outcome, spec).await,
            None => Ok(outcome),
        }
    }

    async fn run_generated(
        &self,
        store: &S,
        operation: &GeneratedOperation,
        args: &Args,
        projection: Option<&ProjectionSpec>,
    ) -> QueryResult<Outcome> {
        let mut query = operation.select(&self.entity, args)?;
        if let Some(spec) = projection {
            query = query.with_selection(spec.selection());
        }

        let outcome = match operation.shape {
            ResultShape::List => Outcome::Records(store.query(&query).await?),
            ResultShape::Single => {
                // a second row is only fetched to detect MultipleResults
                let limit = operation.limit.map_or(2, |limit| limit.min(2));
                Outcome::Record(single(store.query(&query.with_limit(limit)).await?)?)
            }
            ResultShape::Count => Outcome::Count(store.count(&CountQuery::from_select(&query)).await?),
            ResultShape::Exists => {
                Outcome::Exists(!store.query(&query.with_limit(1)).await?.is_empty())
            }
            ResultShape::Delete => Outcome::Affected(
                store
                    .execute(&BulkUpdate::delete(
                        self.entity.clone(),
                        query.specification,
                    ))
                    .await?,
            ),
            ResultShape::Page(strategy) => {
                let request = match args.page_request() {
                    Some(request) => request.clone(),
                    None => PageRequest::of(0, self.default_page_size)?,
                };
                Outcome::Paged(
                    self.paginator
                        .paginate(store, &query, &request, strategy)
                        .await?,
                )
            }
        };
        match projection {
            Some(spec) => project_outcome(store, outcome, spec).await,
            None => Ok(outcome),
        }
    }
}

/// At most one record; two or more is `MultipleResults`
fn single(mut records: Vec<Record>) -> QueryResult<Option<Record>> {
    match records.len() {
        0 | 1 => Ok(records.pop()),
        found => Err(QueryError::multiple_results(QueryOperation::Dispatch, found)),
    }
}

async fn project_outcome<L>(loader: &L, outcome: Outcome, spec: &ProjectionSpec) -> QueryResult<Outcome>
where
    L: RelationLoader,
{
    match outcome {
        Outcome::Records(records) => Ok(Outcome::Projected(project(loader, records, spec).await?)),
        Outcome::Record(record) => Ok(Outcome::Projected(
            project(loader, record.into_iter().collect(), spec).await?,
        )),
        Outcome::Paged(paged) => {
            let mut values = project(loader, paged.content().to_vec(), spec)
                .await?
                .into_iter();
            Ok(Outcome::ProjectedPage(
                paged.map(|_| values.next().unwrap_or_default()),
            ))
        }
        _ => Err(QueryError::configuration(
            QueryOperation::Project,
            "Only record results can be projected",
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::repository::QueryErrorKind;
    use crate::schema::{EntityModel, Schema};
    use crate::store::{MemoryDatabase, MemorySession};

    fn schema() -> Schema {
        Schema::new()
            .with_entity(EntityModel::new("team").field("name"))
            .with_entity(
                EntityModel::new("member")
                    .field("username")
                    .field("age")
                    .relation("team", "team", "team_id"),
            )
    }

    async fn seeded() -> (MemoryDatabase, MemorySession) {
        let db = MemoryDatabase::new(schema());
        let session = db.session();
        session
            .save(Record::new("team", 1).with_field("name", "teamA"))
            .await
            .unwrap();
        for (id, age) in [(1, 10), (2, 19), (3, 20), (4, 21), (5, 40)] {
            session
                .save(
                    Record::new("member", id)
                        .with_field("username", format!("member{}", id))
                        .with_field("age", age)
                        .with_relation("team", "team", 1),
                )
                .await
                .unwrap();
        }
        (db, session)
    }

    fn facade() -> RepositoryFacade<MemorySession> {
        let registry = ProjectionRegistry::new()
            .with(
                "summary",
                ProjectionSpec::new().field("username").field_as("teamName", "team.name"),
            )
            .unwrap();
        FacadeBuilder::new("member")
            .generated(
                GeneratedOperation::new("find_by_username", ResultShape::Single)
                    .bind("username", "username", FilterOperator::Equal),
            )
            .generated(
                GeneratedOperation::new("find_by_team_and_min_age", ResultShape::List)
                    .bind("team", "team.name", FilterOperator::Equal)
                    .bind("min_age", "age", FilterOperator::GreaterThanOrEqual)
                    .join(JoinDeclaration::inner("team"))
                    .sort(Sort::asc("id")),
            )
            .generated(
                GeneratedOperation::new("find_older_than", ResultShape::Single)
                    .bind("age", "age", FilterOperator::GreaterThan),
            )
            .generated(
                GeneratedOperation::new("page_by_age", ResultShape::Page(CountStrategy::FetchPlusOne))
                    .sort(Sort::desc("age")),
            )
            .fragment(
                BulkUpdateFragment::new("bump_age", "member")
                    .bind("min_age", "age", FilterOperator::GreaterThanOrEqual)
                    .assign(Assignment::increment("age", 1)),
            )
            .fragment(NativeFragment::new(
                "native_members",
                "member",
                "SELECT * FROM member",
            ))
            .projections(registry)
            .build()
            .unwrap()
    }

    fn ages(records: &[Record]) -> Vec<Value> {
        records.iter().map(|r| r.value("age")).collect()
    }

    #[test]
    fn test_name_collision_is_detected_at_build() {
        let err = FacadeBuilder::<MemorySession>::new("member")
            .generated(GeneratedOperation::new("count", ResultShape::Count))
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.message.contains("count"));

        let err = FacadeBuilder::<MemorySession>::new("member")
            .fragment(BulkUpdateFragment::new("bump", "member"))
            .generated(GeneratedOperation::new("bump", ResultShape::List))
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_relation_binding_needs_join() {
        let err = FacadeBuilder::<MemorySession>::new("member")
            .generated(
                GeneratedOperation::new("by_team", ResultShape::List)
                    .bind("team", "team.name", FilterOperator::Equal),
            )
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (_db, session) = seeded().await;
        let err = facade()
            .dispatch(&session, "find_by_nickname", &Args::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_base_operations() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let outcome = facade
            .dispatch(&session, "count", &Args::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Count(5));

        let outcome = facade
            .dispatch(&session, "exists_by_id", &Args::new().with("id", 9))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Exists(false));

        let outcome = facade
            .dispatch(&session, "delete_by_id", &Args::new().with("id", 5))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Affected(1));

        let Outcome::Record(found) = facade
            .dispatch(&session, "find_by_id", &Args::new().with("id", 2))
            .await
            .unwrap()
        else {
            panic!("expected a single record");
        };
        assert_eq!(found.unwrap().value("username"), json!("member2"));

        let err = facade
            .dispatch(&session, "find_by_id", &Args::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_single_lookup_outcomes() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let outcome = facade
            .dispatch(&session, "find_by_username", &Args::new().with("username", "member9"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Record(None));

        let err = facade
            .dispatch(&session, "find_older_than", &Args::new().with("age", 19))
            .await
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::MultipleResults);
    }

    #[tokio::test]
    async fn test_single_lookup_honours_limit_one() {
        let (_db, session) = seeded().await;
        let facade = FacadeBuilder::<MemorySession>::new("member")
            .generated(
                GeneratedOperation::new("find_oldest_above", ResultShape::Single)
                    .bind("age", "age", FilterOperator::GreaterThan)
                    .sort(Sort::desc("age"))
                    .limit(1),
            )
            .build()
            .unwrap();

        let Outcome::Record(found) = facade
            .dispatch(&session, "find_oldest_above", &Args::new().with("age", 15))
            .await
            .unwrap()
        else {
            panic!("expected a single record");
        };
        assert_eq!(found.unwrap().value("age"), json!(40));
    }

    #[tokio::test]
    async fn test_structured_argument_is_rejected() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let args = Args::new().with("username", json!({"first": "member1"}));
        let err = facade
            .dispatch(&session, "find_by_username", &args)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.operation, QueryOperation::Dispatch);

        let args = Args::new().with("min_age", json!([{"age": 20}]));
        let err = facade.dispatch(&session, "bump_age", &args).await.unwrap_err();
        assert!(err.is_configuration());

        let Outcome::Records(records) = facade
            .dispatch(&session, "find_by_team_and_min_age", &Args::new())
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        assert_eq!(
            ages(&records),
            [json!(10), json!(19), json!(20), json!(21), json!(40)]
        );
    }

    #[tokio::test]
    async fn test_read_only_operation() {
        let (db, _seed) = seeded().await;
        let session = db.session();
        let facade = FacadeBuilder::<MemorySession>::new("member")
            .generated(
                GeneratedOperation::new("find_all_read_only", ResultShape::List)
                    .sort(Sort::asc("id"))
                    .read_only(),
            )
            .fragment(
                BulkUpdateFragment::new("bump_age", "member")
                    .assign(Assignment::increment("age", 1))
                    .keep_cache(),
            )
            .build()
            .unwrap();

        facade
            .dispatch(&session, "find_all_read_only", &Args::new())
            .await
            .unwrap();
        facade.dispatch(&session, "bump_age", &Args::new()).await.unwrap();

        let Outcome::Record(found) = facade
            .dispatch(&session, "find_by_id", &Args::new().with("id", 1))
            .await
            .unwrap()
        else {
            panic!("expected a single record");
        };
        assert_eq!(found.unwrap().value("age"), json!(11));
    }

    #[tokio::test]
    async fn test_missing_argument_drops_filter() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let Outcome::Records(all) = facade
            .dispatch(&session, "find_by_team_and_min_age", &Args::new())
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        assert_eq!(all.len(), 5);

        let Outcome::Records(some) = facade
            .dispatch(
                &session,
                "find_by_team_and_min_age",
                &Args::new().with("team", "teamA").with("min_age", 20),
            )
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        assert_eq!(ages(&some), [json!(20), json!(21), json!(40)]);

        let Outcome::Records(none) = facade
            .dispatch(
                &session,
                "find_by_team_and_min_age",
                &Args::new().with("team", "teamB"),
            )
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_fragment_then_reread() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let outcome = facade
            .dispatch(&session, "bump_age", &Args::new().with("min_age", 20))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Affected(3));

        let Outcome::Records(records) = facade
            .dispatch(&session, "find_by_team_and_min_age", &Args::new())
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        assert_eq!(
            ages(&records),
            [json!(10), json!(19), json!(21), json!(22), json!(41)]
        );
    }

    #[tokio::test]
    async fn test_paged_operation_defaults_to_first_page() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let Outcome::Paged(page) = facade
            .dispatch(&session, "page_by_age", &Args::new())
            .await
            .unwrap()
        else {
            panic!("expected a page");
        };
        assert_eq!(page.content().len(), 5);
        assert_eq!(page.has_next(), Some(false));

        let config = QueryConfig {
            default_page_size: 2,
            ..QueryConfig::default()
        };
        let small = FacadeBuilder::<MemorySession>::new("member")
            .with_config(&config)
            .generated(
                GeneratedOperation::new("page_by_age", ResultShape::Page(CountStrategy::FetchPlusOne))
                    .sort(Sort::desc("age")),
            )
            .build()
            .unwrap();
        let Outcome::Paged(page) = small
            .dispatch(&session, "page_by_age", &Args::new())
            .await
            .unwrap()
        else {
            panic!("expected a page");
        };
        assert_eq!(ages(page.content()), [json!(40), json!(21)]);
        assert_eq!(page.has_next(), Some(true));

        let args = Args::new().page(PageRequest::of(0, 2).unwrap());
        let Outcome::Paged(page) = facade.dispatch(&session, "page_by_age", &args).await.unwrap()
        else {
            panic!("expected a page");
        };
        assert_eq!(ages(page.content()), [json!(40), json!(21)]);
        assert_eq!(page.has_next(), Some(true));
    }

    #[tokio::test]
    async fn test_projection_chosen_per_call() {
        let (_db, session) = seeded().await;
        let facade = facade();

        let args = Args::new().with("username", "member1").project("summary");
        let outcome = facade
            .dispatch(&session, "find_by_username", &args)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Projected(vec![json!({"username": "member1", "teamName": "teamA"})])
        );

        let args = Args::new().page(PageRequest::of(0, 2).unwrap()).project("summary");
        let Outcome::ProjectedPage(page) =
            facade.dispatch(&session, "page_by_age", &args).await.unwrap()
        else {
            panic!("expected a projected page");
        };
        assert_eq!(page.content()[0]["username"], json!("member5"));

        let err = facade
            .dispatch(&session, "count", &Args::new().project("summary"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        let args = Args::new().with("id", 1).project("summary");
        let err = facade
            .dispatch(&session, "delete_by_id", &args)
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        let args = Args::new().with("min_age", 20).project("summary");
        let err = facade.dispatch(&session, "bump_age", &args).await.unwrap_err();
        assert!(err.is_configuration());

        assert_eq!(
            facade.dispatch(&session, "count", &Args::new()).await.unwrap(),
            Outcome::Count(5)
        );
        let Outcome::Record(untouched) = facade
            .dispatch(&session, "find_by_id", &Args::new().with("id", 5))
            .await
            .unwrap()
        else {
            panic!("expected a single record");
        };
        assert_eq!(untouched.unwrap().value("age"), json!(40));

        let err = facade
            .dispatch(&session, "find_all", &Args::new().project("missing"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_native_fragment_is_unsupported_in_memory() {
        let (_db, session) = seeded().await;
        let err = facade()
            .dispatch(&session, "native_members", &Args::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Unsupported);
    }
}

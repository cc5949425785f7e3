//! PostgreSQL statements for store queries, built with `sea-query`
//!
//! The base table is addressed by its own name and every joined relation by
//! the relation name, so `team.name` renders as `"team"."name"`. Selects list
//! the base table's columns explicitly; rows come back through
//! [`SqlRenderer::decode`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_query::{
    Alias, Asterisk, Cond, DeleteStatement, Expr, JoinType, Keyword, LockType, Order,
    PostgresQueryBuilder, Query, SelectStatement, SimpleExpr, UpdateStatement,
};
use serde_json::Value;

use super::{validate_bulk, validate_select, validate_specification};
use crate::config::StoreConfig;
use crate::projection::Selection;
use crate::record::{Record, RecordId, Relation};
use crate::repository::{
    Assignment, BulkAction, BulkUpdate, CountQuery, Direction, Filter, FilterOperator,
    FilterValue, LockMode, QueryError, QueryOperation, QueryResult, SelectQuery,
};
use crate::schema::{EntityModel, Schema};
use crate::specification::{JoinKind, Predicate, Specification};

const CREATED_AT: &str = "created_at";
const UPDATED_AT: &str = "updated_at";

/// Renders store queries as PostgreSQL text
///
/// # Example
///
/// ```rust
/// use acton_query::repository::{Filter, SelectQuery, Sort};
/// use acton_query::schema::{EntityModel, Schema};
/// use acton_query::specification::build_specification;
/// use acton_query::store::SqlRenderer;
///
/// let schema = Schema::new().with_entity(EntityModel::new("member").field("age"));
/// let spec = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
/// let sql = SqlRenderer::new(&schema)
///     .select(&SelectQuery::new("member").with_specification(spec).with_limit(3))
///     .unwrap();
/// assert!(sql.contains(r#""member"."age" >= 20"#));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SqlRenderer<'a> {
    schema: &'a Schema,
}

impl<'a> SqlRenderer<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// `SELECT` for a bounded content query
    pub fn select(&self, query: &SelectQuery) -> QueryResult<String> {
        validate_select(self.schema, query)?;
        let model = self.schema.entity(&query.entity)?;
        let table = Alias::new(&model.table);

        let mut statement = Query::select();
        for column in base_columns(model, query.options.selection.as_ref()) {
            statement.column((table.clone(), Alias::new(column)));
        }
        statement.from(table.clone());
        self.apply_specification(&mut statement, model, &query.specification)?;

        for order in query.sort.orders() {
            let direction = match order.direction {
                Direction::Asc => Order::Asc,
                Direction::Desc => Order::Desc,
            };
            statement.order_by_expr(self.column(model, &order.field)?.into(), direction);
        }
        if let Some(limit) = query.limit {
            statement.limit(limit);
        }
        if query.offset > 0 {
            statement.offset(query.offset);
        }
        match query.options.lock {
            LockMode::None => {}
            LockMode::SharedRead => {
                statement.lock_with_tables(LockType::Share, [table]);
            }
            LockMode::ExclusiveWrite => {
                statement.lock_with_tables(LockType::Update, [table]);
            }
        }

        Ok(statement.to_string(PostgresQueryBuilder))
    }

    /// `SELECT COUNT(*)` for an unbounded count
    pub fn count(&self, query: &CountQuery) -> QueryResult<String> {
        validate_specification(
            self.schema,
            &query.entity,
            &query.specification,
            QueryOperation::Count,
        )?;
        let model = self.schema.entity(&query.entity)?;

        let mut statement = Query::select();
        statement
            .expr(Expr::col(Asterisk).count())
            .from(Alias::new(&model.table));
        self.apply_specification(&mut statement, model, &query.specification)?;

        Ok(statement.to_string(PostgresQueryBuilder))
    }

    /// `UPDATE` or `DELETE` for a bulk statement
    ///
    /// Predicates over joined relations select the affected ids in a subquery.
    pub fn bulk(&self, statement: &BulkUpdate) -> QueryResult<String> {
        validate_bulk(self.schema, statement)?;
        let model = self.schema.entity(&statement.entity)?;
        let condition = self.bulk_condition(model, &statement.specification)?;

        match &statement.action {
            BulkAction::Update(assignments) => {
                let mut update = Query::update();
                update.table(Alias::new(&model.table));
                for assignment in assignments {
                    let column = self.assigned_column(model, assignment.field());
                    let value: SimpleExpr = match assignment {
                        Assignment::Set { value, .. } => json_expr(value),
                        Assignment::Increment { by, .. } => {
                            Expr::col(Alias::new(&column)).add(*by).into()
                        }
                    };
                    update.value(Alias::new(column), value);
                }
                if model.audited {
                    update.value(Alias::new(UPDATED_AT), Expr::current_timestamp());
                }
                if let Some(condition) = condition {
                    update.cond_where(condition);
                }
                Ok(update.to_string(PostgresQueryBuilder))
            }
            BulkAction::Delete => {
                let mut delete = Query::delete();
                delete.from_table(Alias::new(&model.table));
                if let Some(condition) = condition {
                    delete.cond_where(condition);
                }
                Ok(delete.to_string(PostgresQueryBuilder))
            }
        }
    }

    /// `SELECT` of rows of `entity` by id
    pub fn find_by_ids(&self, entity: &str, ids: &[RecordId]) -> QueryResult<String> {
        let model = self.schema.entity(entity)?;
        let table = Alias::new(&model.table);

        let mut statement = Query::select();
        for column in base_columns(model, None) {
            statement.column((table.clone(), Alias::new(column)));
        }
        statement.from(table.clone()).and_where(
            Expr::col((table, Alias::new(&model.id_column)))
                .is_in(ids.iter().map(id_value).collect::<Vec<_>>()),
        );
        Ok(statement.to_string(PostgresQueryBuilder))
    }

    /// `INSERT … RETURNING *` for a new record
    pub fn insert(&self, record: &Record) -> QueryResult<String> {
        let model = self.schema.entity(record.entity())?;
        let mut columns = vec![Alias::new(&model.id_column)];
        let mut values: Vec<SimpleExpr> = vec![Expr::val(id_value(record.id())).into()];

        for (column, value) in record_columns(model, record) {
            columns.push(Alias::new(column));
            values.push(value);
        }
        if model.audited {
            columns.push(Alias::new(CREATED_AT));
            values.push(timestamp_expr(record.created_at()));
            columns.push(Alias::new(UPDATED_AT));
            values.push(timestamp_expr(record.updated_at().or(record.created_at())));
        }

        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(&model.table))
            .columns(columns)
            .values(values)
            .map_err(|e| QueryError::configuration(QueryOperation::Save, e.to_string()))?;
        insert.returning_all();
        Ok(insert.to_string(PostgresQueryBuilder))
    }

    /// `UPDATE … RETURNING *` for a stored record
    pub fn update(&self, record: &Record) -> QueryResult<String> {
        let model = self.schema.entity(record.entity())?;
        let mut update: UpdateStatement = Query::update();
        update.table(Alias::new(&model.table));
        for (column, value) in record_columns(model, record) {
            update.value(Alias::new(column), value);
        }
        if model.audited {
            update.value(Alias::new(UPDATED_AT), Expr::current_timestamp());
        }
        update
            .and_where(Expr::col(Alias::new(&model.id_column)).eq(id_value(record.id())))
            .returning_all();
        Ok(update.to_string(PostgresQueryBuilder))
    }

    /// `DELETE` of one row by id
    pub fn delete(&self, entity: &str, id: &RecordId) -> QueryResult<String> {
        let model = self.schema.entity(entity)?;
        let mut delete: DeleteStatement = Query::delete();
        delete
            .from_table(Alias::new(&model.table))
            .and_where(Expr::col(Alias::new(&model.id_column)).eq(id_value(id)));
        Ok(delete.to_string(PostgresQueryBuilder))
    }

    /// Turn a `row_to_json` object of `entity`'s table into a record
    ///
    /// Rows read back are never new: tables without audit columns get the
    /// load time as their creation stamp.
    pub fn decode(&self, entity: &str, row: Value) -> QueryResult<Record> {
        let model = self.schema.entity(entity)?;
        let Value::Object(mut columns) = row else {
            return Err(QueryError::serialization_error(
                QueryOperation::Select,
                format!("Expected a row object for '{}'", entity),
            ));
        };

        let id = columns
            .remove(&model.id_column)
            .and_then(|value| RecordId::from_value(&value))
            .ok_or_else(|| {
                QueryError::serialization_error(
                    QueryOperation::Select,
                    format!("Row of '{}' has no usable '{}'", entity, model.id_column),
                )
            })?;

        let mut record = Record::new(entity, id);
        for field in &model.fields {
            if let Some(value) = columns.remove(field) {
                record.set(field.clone(), value);
            }
        }
        for relation in &model.relations {
            match columns.remove(&relation.join_column) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    let id = RecordId::from_value(&value).ok_or_else(|| {
                        QueryError::serialization_error(
                            QueryOperation::Select,
                            format!("'{}' is not an id for '{}'", value, relation.name),
                        )
                    })?;
                    record.insert_relation(
                        relation.name.clone(),
                        Relation::new(relation.target.clone(), id),
                    );
                }
            }
        }

        if model.audited {
            record.set_created_at(parse_timestamp(columns.get(CREATED_AT)));
            if let Some(updated) = parse_timestamp(columns.get(UPDATED_AT)) {
                record.stamp_updated(updated);
            }
        }
        if record.created_at().is_none() {
            record.set_created_at(Some(Utc::now()));
        }
        Ok(record)
    }

    /// Row count returned by a `COUNT(*)` statement
    pub fn decode_count(&self, entity: &str, total: i64) -> QueryResult<u64> {
        u64::try_from(total).map_err(|_| {
            QueryError::serialization_error(
                QueryOperation::Count,
                format!("Count of '{}' came back negative ({})", entity, total),
            )
        })
    }

    fn apply_specification(
        &self,
        statement: &mut SelectStatement,
        model: &EntityModel,
        specification: &Specification,
    ) -> QueryResult<()> {
        for join in specification.joins() {
            let (relation, target) = self.schema.relation(&model.name, &join.relation)?;
            let kind = match join.kind {
                JoinKind::Inner => JoinType::InnerJoin,
                JoinKind::Left => JoinType::LeftJoin,
            };
            statement.join_as(
                kind,
                Alias::new(&target.table),
                Alias::new(&relation.name),
                Expr::col((Alias::new(&model.table), Alias::new(&relation.join_column)))
                    .equals((Alias::new(&relation.name), Alias::new(&target.id_column))),
            );
        }
        if let Some(predicate) = specification.predicate() {
            statement.cond_where(self.condition(model, predicate)?);
        }
        Ok(())
    }

    fn bulk_condition(
        &self,
        model: &EntityModel,
        specification: &Specification,
    ) -> QueryResult<Option<Cond>> {
        if specification.joins().is_empty() {
            return specification
                .predicate()
                .map(|predicate| self.condition(model, predicate))
                .transpose();
        }
        let table = Alias::new(&model.table);
        let mut ids = Query::select();
        ids.column((table.clone(), Alias::new(&model.id_column)))
            .from(table.clone());
        self.apply_specification(&mut ids, model, specification)?;
        Ok(Some(Cond::all().add(
            Expr::col((table, Alias::new(&model.id_column))).in_subquery(ids),
        )))
    }

    fn condition(&self, model: &EntityModel, predicate: &Predicate) -> QueryResult<Cond> {
        Ok(match predicate {
            Predicate::Condition(filter) => Cond::all().add(self.filter_expr(model, filter)?),
            Predicate::All(children) => {
                let mut condition = Cond::all();
                for child in children {
                    condition = condition.add(self.condition(model, child)?);
                }
                condition
            }
            Predicate::Any(children) => {
                let mut condition = Cond::any();
                for child in children {
                    condition = condition.add(self.condition(model, child)?);
                }
                condition
            }
            Predicate::Not(child) => self.condition(model, child)?.not(),
        })
    }

    fn filter_expr(&self, model: &EntityModel, filter: &Filter) -> QueryResult<SimpleExpr> {
        let column = self.column(model, &filter.field)?;
        let expr = match (filter.operator, &filter.value) {
            (FilterOperator::IsNull, _) => column.is_null(),
            (FilterOperator::IsNotNull, _) => column.is_not_null(),
            (FilterOperator::In, FilterValue::StringList(values)) => column.is_in(values.clone()),
            (FilterOperator::In, FilterValue::IntegerList(values)) => column.is_in(values.clone()),
            (FilterOperator::Like, FilterValue::String(pattern)) => column.like(pattern.as_str()),
            (operator, value) => {
                let value = scalar(&filter.field, value)?;
                match operator {
                    FilterOperator::Equal => column.eq(value),
                    FilterOperator::NotEqual => column.ne(value),
                    FilterOperator::GreaterThan => column.gt(value),
                    FilterOperator::GreaterThanOrEqual => column.gte(value),
                    FilterOperator::LessThan => column.lt(value),
                    FilterOperator::LessThanOrEqual => column.lte(value),
                    other => {
                        return Err(QueryError::configuration(
                            QueryOperation::Plan,
                            format!("Operator {} cannot compare '{}' with a single value", other, filter.field),
                        ))
                    }
                }
            }
        };
        Ok(expr)
    }

    /// Column expression for a path: base columns, relation keys, joined columns
    fn column(&self, model: &EntityModel, path: &str) -> QueryResult<Expr> {
        let base = Alias::new(&model.table);
        Ok(match path.split_once('.') {
            None if path == "id" => Expr::col((base, Alias::new(&model.id_column))),
            None => match model.find_relation(path) {
                Some(relation) => Expr::col((base, Alias::new(&relation.join_column))),
                None => Expr::col((base, Alias::new(path))),
            },
            Some((relation, field)) => {
                let (_, target) = self.schema.relation(&model.name, relation)?;
                let column = if field == "id" {
                    target.id_column.as_str()
                } else {
                    field
                };
                Expr::col((Alias::new(relation), Alias::new(column)))
            }
        })
    }

    fn assigned_column(&self, model: &EntityModel, field: &str) -> String {
        model
            .find_relation(field)
            .map_or_else(|| field.to_string(), |relation| relation.join_column.clone())
    }
}

/// Columns a select reads from the base table
/// `SET LOCAL` statements that apply the store settings to a transaction
pub(crate) fn session_settings(config: &StoreConfig) -> Vec<String> {
    let mut settings = vec![format!(
        "SET LOCAL lock_timeout = '{}ms'",
        config.lock_timeout_ms
    )];
    if let Some(timeout) = config.query_timeout() {
        settings.push(statement_timeout(Some(timeout)));
    }
    settings
}

/// `SET LOCAL statement_timeout`; `None` disables the timeout
pub(crate) fn statement_timeout(timeout: Option<Duration>) -> String {
    let setting = timeout.map_or_else(
        || "0".to_string(),
        |timeout| format!("{}ms", timeout.as_millis().max(1)),
    );
    format!("SET LOCAL statement_timeout = '{}'", setting)
}

fn base_columns(model: &EntityModel, selection: Option<&Selection>) -> Vec<String> {
    let keeps = |name: &str| selection.map_or(true, |selection| selection.keeps(name));
    let mut columns = vec![model.id_column.clone()];
    columns.extend(model.fields.iter().filter(|f| keeps(f)).cloned());
    columns.extend(
        model
            .relations
            .iter()
            .filter(|relation| keeps(&relation.name))
            .map(|relation| relation.join_column.clone()),
    );
    if model.audited {
        columns.push(CREATED_AT.to_string());
        columns.push(UPDATED_AT.to_string());
    }
    columns
}

/// Field and foreign key values a record writes, in model order
fn record_columns(model: &EntityModel, record: &Record) -> Vec<(String, SimpleExpr)> {
    let mut columns = Vec::new();
    for field in &model.fields {
        if let Some(value) = record.fields().get(field) {
            columns.push((field.clone(), json_expr(value)));
        }
    }
    for relation in &model.relations {
        let value = match record.relation(&relation.name) {
            Some(reference) => Expr::val(id_value(reference.id())).into(),
            None => SimpleExpr::Keyword(Keyword::Null),
        };
        columns.push((relation.join_column.clone(), value));
    }
    columns
}

fn id_value(id: &RecordId) -> sea_query::Value {
    match id {
        RecordId::Int(n) => (*n).into(),
        RecordId::Text(s) => s.clone().into(),
    }
}

fn scalar(field: &str, value: &FilterValue) -> QueryResult<sea_query::Value> {
    match value {
        FilterValue::String(s) => Ok(s.clone().into()),
        FilterValue::Integer(n) => Ok((*n).into()),
        FilterValue::Float(n) => Ok((*n).into()),
        FilterValue::Boolean(b) => Ok((*b).into()),
        FilterValue::StringList(_) | FilterValue::IntegerList(_) | FilterValue::Null => {
            Err(QueryError::configuration(
                QueryOperation::Plan,
                format!("Filter on '{}' has no single value to compare", field),
            ))
        }
    }
}

fn json_expr(value: &Value) -> SimpleExpr {
    match value {
        Value::Null => SimpleExpr::Keyword(Keyword::Null),
        Value::Bool(b) => Expr::val(*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Expr::val(i).into(),
            None => Expr::val(n.as_f64().unwrap_or_default()).into(),
        },
        Value::String(s) => Expr::val(s.as_str()).into(),
        other => Expr::val(other.to_string()).into(),
    }
}

fn timestamp_expr(at: Option<DateTime<Utc>>) -> SimpleExpr {
    match at {
        Some(at) => Expr::val(at.to_rfc3339()).into(),
        None => Expr::current_timestamp().into(),
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::repository::{Sort, SortOrder};
    use crate::schema::EntityModel;
    use crate::specification::{build_specification, JoinDeclaration};

    fn schema() -> Schema {
        Schema::new()
            .with_entity(EntityModel::new("team").field("name"))
            .with_entity(
                EntityModel::new("member")
                    .field("username")
                    .field("age")
                    .relation("team", "team", "team_id")
                    .audited(),
            )
    }

    #[test]
    fn test_select_with_join_sort_window_and_lock() {
        let schema = schema();
        let spec = build_specification(
            &[Filter::eq("team.name", "teamA"), Filter::gte("age", 20)],
            &[JoinDeclaration::inner("team")],
        )
        .unwrap();
        let query = SelectQuery::new("member")
            .with_specification(spec)
            .with_sort(Sort::by(SortOrder::desc("age")))
            .with_limit(3)
            .with_offset(3)
            .with_lock(LockMode::ExclusiveWrite);

        let sql = SqlRenderer::new(&schema).select(&query).unwrap();
        assert!(sql.contains(r#"FROM "member""#), "{}", sql);
        assert!(sql.contains(r#"INNER JOIN "team" AS "team" ON "member"."team_id" = "team"."id""#), "{}", sql);
        assert!(sql.contains(r#""team"."name" = 'teamA'"#), "{}", sql);
        assert!(sql.contains(r#""member"."age" >= 20"#), "{}", sql);
        assert!(sql.contains(r#"ORDER BY "member"."age" DESC"#), "{}", sql);
        assert!(sql.contains("LIMIT 3"), "{}", sql);
        assert!(sql.contains("OFFSET 3"), "{}", sql);
        assert!(sql.contains("FOR UPDATE"), "{}", sql);
    }

    #[test]
    fn test_select_with_shared_lock() {
        let schema = schema();
        let spec = build_specification(&[Filter::eq("id", 1)], &[]).unwrap();
        let query = SelectQuery::new("member")
            .with_specification(spec)
            .with_lock(LockMode::SharedRead);

        let sql = SqlRenderer::new(&schema).select(&query).unwrap();
        assert!(sql.contains(r#"FOR SHARE OF "member""#), "{}", sql);
        assert!(!sql.contains("FOR UPDATE"), "{}", sql);

        let unlocked = SqlRenderer::new(&schema)
            .select(&SelectQuery::new("member"))
            .unwrap();
        assert!(!unlocked.contains(" FOR "), "{}", unlocked);
    }

    #[test]
    fn test_session_settings() {
        let config = StoreConfig::default();
        assert_eq!(
            session_settings(&config),
            vec![format!("SET LOCAL lock_timeout = '{}ms'", config.lock_timeout_ms)]
        );

        let config = StoreConfig {
            lock_timeout_ms: 500,
            query_timeout_ms: Some(2000),
            ..StoreConfig::default()
        };
        assert_eq!(
            session_settings(&config),
            vec![
                "SET LOCAL lock_timeout = '500ms'".to_string(),
                "SET LOCAL statement_timeout = '2000ms'".to_string(),
            ]
        );

        assert_eq!(statement_timeout(None), "SET LOCAL statement_timeout = '0'");
        assert_eq!(
            statement_timeout(Some(Duration::from_micros(10))),
            "SET LOCAL statement_timeout = '1ms'"
        );
    }

    #[test]
    fn test_negative_count_is_rejected() {
        let schema = schema();
        let renderer = SqlRenderer::new(&schema);
        assert_eq!(renderer.decode_count("member", 4).unwrap(), 4);

        let err = renderer.decode_count("member", -1).unwrap_err();
        assert_eq!(err.kind, crate::repository::QueryErrorKind::SerializationError);
        assert_eq!(err.operation, QueryOperation::Count);
    }

    #[test]
    fn test_select_columns_follow_selection() {
        let schema = schema();
        let query = SelectQuery::new("member").with_selection(Selection {
            columns: Some(["username".to_string()].into()),
            fetch: Vec::new(),
        });
        let sql = SqlRenderer::new(&schema).select(&query).unwrap();
        assert!(sql.contains(r#""member"."username""#));
        assert!(!sql.contains(r#""member"."age""#));
        assert!(!sql.contains("team_id"));
    }

    #[test]
    fn test_count_keeps_predicate_only() {
        let schema = schema();
        let spec = build_specification(&[Filter::like("username", "mem%")], &[]).unwrap();
        let sql = SqlRenderer::new(&schema)
            .count(&CountQuery::new("member", spec))
            .unwrap();
        assert!(sql.starts_with("SELECT COUNT(*)"), "{}", sql);
        assert!(sql.contains("LIKE 'mem%'"), "{}", sql);
        assert!(!sql.contains("ORDER BY"));
    }

    #[test]
    fn test_bulk_increment_and_joined_delete() {
        let schema = schema();
        let renderer = SqlRenderer::new(&schema);

        let spec = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        let sql = renderer
            .bulk(&BulkUpdate::update("member", spec, vec![Assignment::increment("age", 1)]))
            .unwrap();
        assert!(sql.starts_with(r#"UPDATE "member" SET"#), "{}", sql);
        assert!(sql.contains(r#""age" = "age" + 1"#), "{}", sql);
        assert!(sql.contains(r#""updated_at" = CURRENT_TIMESTAMP"#), "{}", sql);

        let spec = build_specification(
            &[Filter::eq("team.name", "teamB")],
            &[JoinDeclaration::inner("team")],
        )
        .unwrap();
        let sql = renderer.bulk(&BulkUpdate::delete("member", spec)).unwrap();
        assert!(sql.starts_with(r#"DELETE FROM "member""#), "{}", sql);
        assert!(sql.contains("IN (SELECT"), "{}", sql);
    }

    #[test]
    fn test_negated_any_predicate() {
        let schema = schema();
        let spec = Specification::new(
            Some(
                Predicate::Condition(Filter::is_null("team"))
                    .or(Predicate::Condition(Filter::in_integers("age", vec![10, 20])))
                    .negate(),
            ),
            Vec::new(),
        )
        .unwrap();
        let sql = SqlRenderer::new(&schema)
            .count(&CountQuery::new("member", spec))
            .unwrap();
        assert!(sql.contains("NOT"), "{}", sql);
        assert!(sql.contains(r#""member"."team_id" IS NULL"#), "{}", sql);
        assert!(sql.contains("IN (10, 20)"), "{}", sql);
    }

    #[test]
    fn test_insert_update_delete_one() {
        let schema = schema();
        let renderer = SqlRenderer::new(&schema);
        let member = Record::new("member", 7)
            .with_field("username", "o'brien")
            .with_field("age", 33)
            .with_relation("team", "team", 1);

        let sql = renderer.insert(&member).unwrap();
        assert!(sql.starts_with(r#"INSERT INTO "member""#), "{}", sql);
        assert!(sql.contains("'o''brien'") || sql.contains(r"E'o\'brien'"), "{}", sql);
        assert!(sql.contains("RETURNING *"), "{}", sql);

        let sql = renderer.update(&member).unwrap();
        assert!(sql.contains(r#""team_id" = 1"#), "{}", sql);
        assert!(sql.contains(r#"WHERE "id" = 7"#), "{}", sql);

        let sql = renderer.delete("member", &RecordId::Int(7)).unwrap();
        assert_eq!(sql, r#"DELETE FROM "member" WHERE "id" = 7"#);
    }

    #[test]
    fn test_decode_row() {
        let schema = schema();
        let row = json!({
            "id": 3,
            "username": "member3",
            "age": 20,
            "team_id": 1,
            "created_at": "2024-05-01T10:00:00+00:00",
            "updated_at": "2024-05-02T10:00:00+00:00"
        });
        let record = SqlRenderer::new(&schema).decode("member", row).unwrap();
        assert_eq!(record.id(), &RecordId::Int(3));
        assert_eq!(record.value("team"), json!(1));
        assert!(record.created_at().unwrap() < record.updated_at().unwrap());

        let err = SqlRenderer::new(&schema)
            .decode("member", json!({"username": "x"}))
            .unwrap_err();
        assert_eq!(err.kind, crate::repository::QueryErrorKind::SerializationError);
    }
}

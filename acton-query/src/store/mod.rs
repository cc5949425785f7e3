//! Record store adapters
//!
//! - [`MemoryDatabase`] / [`MemorySession`]: shared in-process tables with
//!   per-session identity maps and row locks
//! - [`SqlRenderer`]: PostgreSQL statements for store queries
//! - [`PgSession`]: a transaction-scoped PostgreSQL session (feature `database`)
//!
//! Every adapter checks paths against a [`Schema`] before touching data, so
//! malformed queries fail with `Configuration` and never reach the store.

mod eval;
mod locks;
mod memory;
#[cfg(feature = "database")]
mod postgres;
mod sql;

pub use memory::{MemoryDatabase, MemorySession};
#[cfg(feature = "database")]
pub use postgres::PgSession;
pub use sql::SqlRenderer;

use crate::repository::{
    Assignment, BulkAction, BulkUpdate, QueryError, QueryOperation, QueryResult, SelectQuery,
};
use crate::schema::Schema;
use crate::specification::Specification;

/// Check the entity, predicate paths and joins of a specification
pub(crate) fn validate_specification(
    schema: &Schema,
    entity: &str,
    specification: &Specification,
    operation: QueryOperation,
) -> QueryResult<()> {
    schema.entity(entity).map_err(|e| e.with_operation(operation))?;
    for join in specification.joins() {
        schema
            .relation(entity, &join.relation)
            .map_err(|e| e.with_operation(operation))?;
    }
    if let Some(predicate) = specification.predicate() {
        for filter in predicate.filters() {
            schema
                .validate_path(entity, &filter.field)
                .map_err(|e| e.with_operation(operation))?;
        }
    }
    Ok(())
}

/// Check a select: specification, sort paths and fetched relations
///
/// Sorting through a relation needs a join for it.
pub(crate) fn validate_select(schema: &Schema, query: &SelectQuery) -> QueryResult<()> {
    let operation = QueryOperation::Select;
    validate_specification(schema, &query.entity, &query.specification, operation)?;
    for order in query.sort.orders() {
        schema
            .validate_path(&query.entity, &order.field)
            .map_err(|e| e.with_operation(operation))?;
        if let Some(relation) = order.relation() {
            if query.specification.join(relation).is_none() {
                return Err(QueryError::configuration(
                    operation,
                    format!(
                        "Sort path '{}' needs a join on relation '{}'",
                        order.field, relation
                    ),
                ));
            }
        }
    }
    for relation in query.relations_to_fetch() {
        schema
            .relation(&query.entity, &relation)
            .map_err(|e| e.with_operation(operation))?;
    }
    Ok(())
}

/// Check a bulk statement: specification plus assignment targets
pub(crate) fn validate_bulk(schema: &Schema, statement: &BulkUpdate) -> QueryResult<()> {
    let operation = QueryOperation::Execute;
    validate_specification(schema, &statement.entity, &statement.specification, operation)?;
    if let BulkAction::Update(assignments) = &statement.action {
        if assignments.is_empty() {
            return Err(QueryError::configuration(
                operation,
                "Bulk update has no assignments",
            ));
        }
        let model = schema.entity(&statement.entity)?;
        for assignment in assignments {
            let field = assignment.field();
            let assignable = field != "id"
                && (model.fields.iter().any(|f| f == field) || model.find_relation(field).is_some());
            if !assignable {
                return Err(QueryError::configuration(
                    operation,
                    format!("Cannot assign '{}' on entity '{}'", field, model.name),
                ));
            }
            if matches!(assignment, Assignment::Increment { .. }) && model.find_relation(field).is_some() {
                return Err(QueryError::configuration(
                    operation,
                    format!("Cannot increment relation '{}'", field),
                ));
            }
        }
    }
    Ok(())
}

//! Query error types
//!
//! Every failure the query layer reports carries the operation that was
//! running, a kind callers can branch on, and optionally the entity involved.
//!
//! # Example
//!
//! ```rust
//! use acton_query::repository::{QueryError, QueryErrorKind};
//!
//! let error = QueryError::not_found("member", "42");
//! assert!(matches!(error.kind, QueryErrorKind::NotFound));
//! assert!(!error.is_retriable());
//! ```

use std::fmt;

/// Operation being performed when the query error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperation {
    /// Building a specification from filters
    Build,
    /// Planning a page request
    Plan,
    /// Running a content query
    Select,
    /// Running a count query
    Count,
    /// Running a bulk update or delete
    Execute,
    /// Looking up a single record by id
    FindById,
    /// Inserting or merging a record
    Save,
    /// Deleting a single record
    Delete,
    /// Resolving a lazy relation
    Resolve,
    /// Shaping records into projections
    Project,
    /// Running a raw store query
    Native,
    /// Routing a facade call
    Dispatch,
}

impl fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Plan => write!(f, "plan"),
            Self::Select => write!(f, "select"),
            Self::Count => write!(f, "count"),
            Self::Execute => write!(f, "execute"),
            Self::FindById => write!(f, "find_by_id"),
            Self::Save => write!(f, "save"),
            Self::Delete => write!(f, "delete"),
            Self::Resolve => write!(f, "resolve"),
            Self::Project => write!(f, "project"),
            Self::Native => write!(f, "native"),
            Self::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// Category of query error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// Malformed filter, join, sort, page request or facade definition
    Configuration,
    /// Entity was not found
    NotFound,
    /// More than one row matched where exactly one was expected
    MultipleResults,
    /// Entity already exists (duplicate key)
    AlreadyExists,
    /// Relation accessed after its owning session closed
    StaleReference,
    /// Projection needed a relation that was never resolved
    RelationNotLoaded,
    /// Pessimistic lock wait exceeded the configured timeout
    LockTimeout,
    /// Caller-supplied deadline expired
    Cancelled,
    /// The store aborted the transaction: serialization failure or deadlock
    Conflict,
    /// Failed to reach the store
    ConnectionFailed,
    /// Underlying store error
    DatabaseError,
    /// Serialization or deserialization error
    SerializationError,
    /// The store does not support the requested operation
    Unsupported,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::NotFound => write!(f, "not_found"),
            Self::MultipleResults => write!(f, "multiple_results"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::StaleReference => write!(f, "stale_reference"),
            Self::RelationNotLoaded => write!(f, "relation_not_loaded"),
            Self::LockTimeout => write!(f, "lock_timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Conflict => write!(f, "conflict"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::DatabaseError => write!(f, "database_error"),
            Self::SerializationError => write!(f, "serialization_error"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Structured query error with operation context
///
/// # Example
///
/// ```rust
/// use acton_query::repository::{QueryError, QueryOperation};
///
/// let error = QueryError::lock_timeout(QueryOperation::Select, "row member:1 is locked");
/// assert!(error.is_retriable());
/// println!("{}", error); // "Query lock_timeout error during select: row member:1 is locked"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    /// The operation being performed when the error occurred
    pub operation: QueryOperation,
    /// The category of error
    pub kind: QueryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The entity involved (e.g., "member", "team")
    pub entity_type: Option<String>,
    /// The id of the entity involved
    pub entity_id: Option<String>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(
        operation: QueryOperation,
        kind: QueryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Create a configuration error
    ///
    /// Raised before any store call for malformed filters, joins, sorts,
    /// page sizes and facade definitions.
    pub fn configuration(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::Configuration, message)
    }

    /// Create a "not found" error with entity context
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            QueryOperation::FindById,
            QueryErrorKind::NotFound,
            "Entity not found",
        )
        .with_entity(entity_type, entity_id)
    }

    /// Create an "already exists" error with entity context
    pub fn already_exists(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            QueryOperation::Save,
            QueryErrorKind::AlreadyExists,
            "Entity already exists",
        )
        .with_entity(entity_type, entity_id)
    }

    /// Create a "multiple results" error
    pub fn multiple_results(operation: QueryOperation, found: usize) -> Self {
        Self::new(
            operation,
            QueryErrorKind::MultipleResults,
            format!("Expected at most one result, found {}", found),
        )
    }

    /// Create a stale reference error
    pub fn stale_reference(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::StaleReference, message)
    }

    /// Create a "relation not loaded" error for the given relation name
    pub fn relation_not_loaded(relation: &str) -> Self {
        Self::new(
            QueryOperation::Project,
            QueryErrorKind::RelationNotLoaded,
            format!("Relation '{}' has not been resolved", relation),
        )
    }

    /// Create a lock timeout error
    pub fn lock_timeout(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::LockTimeout, message)
    }

    /// Create a cancellation error
    pub fn cancelled(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::Cancelled, message)
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            QueryOperation::Select,
            QueryErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a database error
    pub fn database_error(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::DatabaseError, message)
    }

    /// Create a serialization error
    pub fn serialization_error(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::SerializationError, message)
    }

    /// Create an "unsupported" error
    pub fn unsupported(operation: QueryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, QueryErrorKind::Unsupported, message)
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: QueryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Check if this error is retriable
    ///
    /// Lock timeouts, cancellations, transaction conflicts and connection
    /// failures may succeed on a later attempt. The query layer itself never
    /// retries.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            QueryErrorKind::LockTimeout
                | QueryErrorKind::Cancelled
                | QueryErrorKind::Conflict
                | QueryErrorKind::ConnectionFailed
        )
    }

    /// Check if this error was raised before any store call
    pub fn is_configuration(&self) -> bool {
        self.kind == QueryErrorKind::Configuration
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Query {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let (Some(ref entity_type), Some(ref entity_id)) = (&self.entity_type, &self.entity_id) {
            write!(f, " [{}: {}]", entity_type, entity_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for QueryError {}

/// Error kind for a PostgreSQL SQLSTATE
pub(crate) fn kind_for_sqlstate(code: Option<&str>) -> QueryErrorKind {
    match code {
        // lock_not_available
        Some("55P03") => QueryErrorKind::LockTimeout,
        // query_canceled, raised by statement_timeout
        Some("57014") => QueryErrorKind::Cancelled,
        // serialization_failure, deadlock_detected
        Some("40001") | Some("40P01") => QueryErrorKind::Conflict,
        Some("23505") => QueryErrorKind::AlreadyExists,
        _ => QueryErrorKind::DatabaseError,
    }
}

// Conversion from sqlx::Error; callers refine the operation with `with_operation`
#[cfg(feature = "database")]
impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        let operation = QueryOperation::Execute;
        match err {
            E::RowNotFound => Self::new(operation, QueryErrorKind::NotFound, "Row not found"),
            E::PoolTimedOut => Self::connection_failed("Connection pool timed out"),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::Configuration(e) => Self::configuration(operation, e.to_string()),
            E::ColumnDecode { index, source } => Self::serialization_error(
                operation,
                format!("Failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::serialization_error(operation, e.to_string()),
            E::Database(db_err) => {
                let kind = kind_for_sqlstate(db_err.code().as_deref());
                Self::new(operation, kind, db_err.to_string())
            }
            other => Self::database_error(operation, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_operation_display() {
        assert_eq!(format!("{}", QueryOperation::Plan), "plan");
        assert_eq!(format!("{}", QueryOperation::FindById), "find_by_id");
        assert_eq!(format!("{}", QueryOperation::Execute), "execute");
        assert_eq!(format!("{}", QueryOperation::Dispatch), "dispatch");
    }

    #[test]
    fn test_query_error_kind_display() {
        assert_eq!(format!("{}", QueryErrorKind::Configuration), "configuration");
        assert_eq!(
            format!("{}", QueryErrorKind::StaleReference),
            "stale_reference"
        );
        assert_eq!(format!("{}", QueryErrorKind::LockTimeout), "lock_timeout");
        assert_eq!(
            format!("{}", QueryErrorKind::MultipleResults),
            "multiple_results"
        );
    }

    #[test]
    fn test_not_found_convenience() {
        let error = QueryError::not_found("member", "7");
        assert_eq!(error.operation, QueryOperation::FindById);
        assert_eq!(error.kind, QueryErrorKind::NotFound);
        assert_eq!(error.entity_type, Some("member".to_string()));
        assert_eq!(error.entity_id, Some("7".to_string()));
    }

    #[test]
    fn test_multiple_results_message() {
        let error = QueryError::multiple_results(QueryOperation::Dispatch, 2);
        assert_eq!(error.kind, QueryErrorKind::MultipleResults);
        assert!(error.message.contains("found 2"));
    }

    #[test]
    fn test_is_retriable_transient_errors() {
        assert!(QueryError::lock_timeout(QueryOperation::Select, "locked").is_retriable());
        assert!(QueryError::cancelled(QueryOperation::Count, "deadline").is_retriable());
        assert!(QueryError::connection_failed("refused").is_retriable());
    }

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(kind_for_sqlstate(Some("55P03")), QueryErrorKind::LockTimeout);
        assert_eq!(kind_for_sqlstate(Some("57014")), QueryErrorKind::Cancelled);
        assert_eq!(kind_for_sqlstate(Some("23505")), QueryErrorKind::AlreadyExists);
        assert_eq!(kind_for_sqlstate(Some("40001")), QueryErrorKind::Conflict);
        assert_eq!(kind_for_sqlstate(Some("40P01")), QueryErrorKind::Conflict);
        assert_eq!(kind_for_sqlstate(Some("42P01")), QueryErrorKind::DatabaseError);
        assert_eq!(kind_for_sqlstate(None), QueryErrorKind::DatabaseError);

        let conflict = QueryError::new(
            QueryOperation::Execute,
            kind_for_sqlstate(Some("40P01")),
            "deadlock detected",
        );
        assert!(conflict.is_retriable());
        assert_eq!(format!("{}", conflict.kind), "conflict");
    }

    #[test]
    fn test_is_retriable_permanent_errors() {
        assert!(!QueryError::configuration(QueryOperation::Plan, "size 0").is_retriable());
        assert!(!QueryError::stale_reference(QueryOperation::Resolve, "closed").is_retriable());
        assert!(!QueryError::multiple_results(QueryOperation::Select, 3).is_retriable());
        assert!(!QueryError::not_found("member", "1").is_retriable());
    }

    #[test]
    fn test_with_operation() {
        let error = QueryError::connection_failed("refused").with_operation(QueryOperation::Count);
        assert_eq!(error.operation, QueryOperation::Count);
    }

    #[test]
    fn test_display_with_and_without_entity() {
        let error = QueryError::configuration(QueryOperation::Build, "missing join for 'team'");
        let display = format!("{}", error);
        assert!(display.contains("configuration"));
        assert!(display.contains("build"));
        assert!(!display.contains("["));

        let display = format!("{}", QueryError::already_exists("item", "A"));
        assert!(display.contains("[item: A]"));
    }

    #[test]
    fn test_error_is_error_trait() {
        let error: Box<dyn std::error::Error> =
            Box::new(QueryError::relation_not_loaded("team"));
        assert!(error.to_string().contains("relation_not_loaded"));
    }
}

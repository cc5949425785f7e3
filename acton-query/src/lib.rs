//! # acton-query
//!
//! A generic paginated query-and-filter layer. Callers describe what they want
//! as filters, pages and projections; a record store session runs it.
//!
//! ## Features
//!
//! - **Specifications**: composable predicates from filter lists, with absent
//!   filters dropped and explicit relation joins
//! - **Pagination**: page, slice (fetch-plus-one) and unpaged results
//! - **Projections**: closed, open, nested and per-call projections
//! - **Repository facades**: generated and hand-written operations behind one
//!   dispatch surface
//! - **Stores**: an in-memory session with row locks, and a PostgreSQL session
//!   (feature `database`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use acton_query::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let schema = Schema::new()
//!         .with_entity(EntityModel::new("team").field("name"))
//!         .with_entity(
//!             EntityModel::new("member")
//!                 .field("username")
//!                 .field("age")
//!                 .relation("team", "team", "team_id"),
//!         );
//!     let db = MemoryDatabase::new(schema);
//!     let session = db.session_with(&config.store);
//!
//!     let spec = build_specification(&[Filter::gte("age", 20)], &[])?;
//!     let query = SelectQuery::new("member").with_specification(spec);
//!     let request = PageRequest::sorted(0, 3, Sort::desc("username"))?;
//!
//!     let page = Paginator::from_config(&config.query)
//!         .paginate(&session, &query, &request, config.query.count_strategy)
//!         .await?;
//!     println!("{} of {:?}", page.content().len(), page.total_elements());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod paging;
pub mod projection;
pub mod record;
pub mod repository;
pub mod schema;
pub mod specification;
pub mod store;

#[cfg(feature = "database")]
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, QueryConfig, StoreConfig};
    pub use crate::error::{Error, Result};
    pub use crate::observability::init_tracing;

    pub use crate::dispatch::{
        Args, BulkUpdateFragment, FacadeBuilder, GeneratedOperation, NativeFragment, Outcome,
        QueryFragment, RepositoryFacade, ResultShape,
    };
    pub use crate::paging::{paginate, PagePlan, Paginator};
    pub use crate::projection::{
        project, project_as, shape, Projection, ProjectionRegistry, ProjectionSpec, Selection,
    };
    pub use crate::record::{Persistable, Record, RecordId, Relation};
    pub use crate::repository::{
        resolve, resolve_all, Assignment, BulkUpdate, CountQuery, CountStrategy, Direction,
        Filter, FilterOperator, FilterValue, LockMode, NativeQuery, Page, PageRequest,
        PagedResult, QueryError, QueryErrorKind, QueryOperation, QueryResult, RecordStore,
        RelationLoader, SelectQuery, Slice, Sort, SortOrder,
    };
    pub use crate::schema::{EntityModel, RelationModel, Schema};
    pub use crate::specification::{
        build_specification, Combinator, Example, ExampleMatcher, JoinDeclaration, JoinKind,
        Predicate, Specification, SpecificationBuilder, StringMatching,
    };
    pub use crate::store::{MemoryDatabase, MemorySession, SqlRenderer};

    #[cfg(feature = "database")]
    pub use crate::database::Database;
    #[cfg(feature = "database")]
    pub use crate::store::PgSession;
}

//! Query vocabulary shared by every component
//!
//! # Features
//!
//! - **Errors**: [`QueryError`] with operation context and a retriable check
//! - **Filtering**: [`Filter`] for building predicates
//! - **Pagination**: [`PageRequest`], [`Page`], [`Slice`] and [`PagedResult`]
//! - **Store seams**: [`RecordStore`] and [`RelationLoader`]
//! - **Store queries**: [`SelectQuery`], [`CountQuery`], [`BulkUpdate`], [`NativeQuery`]

mod error;
mod filter;
mod pagination;
mod query;
mod traits;

pub use error::{QueryError, QueryErrorKind, QueryOperation};
pub use filter::{escape_like_wildcards, relation_of, Filter, FilterOperator, FilterValue};
pub use pagination::{
    CountStrategy, Direction, Page, PageRequest, PagedResult, Slice, Sort, SortOrder,
};
pub use query::{
    Assignment, BulkAction, BulkUpdate, CountQuery, LockMode, NativeQuery, QueryOptions,
    SelectQuery,
};
pub use traits::{resolve, resolve_all, QueryResult, RecordStore, RelationLoader};

//! Sorting, page requests and page results
//!
//! # Example
//!
//! ```rust
//! use acton_query::repository::{Page, PageRequest, Sort};
//!
//! let request = PageRequest::sorted(0, 3, Sort::desc("username")).unwrap();
//! assert_eq!(request.offset(), 0);
//!
//! let page = Page::new(vec!["member5", "member4", "member3"], &request, 5);
//! assert_eq!(page.total_pages(), 2);
//! assert!(page.is_first());
//! assert!(page.has_next());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{QueryError, QueryOperation};
use super::filter::relation_of;
use super::traits::QueryResult;

/// Direction for ordering results
///
/// # Example
///
/// ```rust
/// use acton_query::repository::Direction;
///
/// assert_eq!(format!("{}", Direction::Asc), "asc");
/// assert_eq!(format!("{}", Direction::Desc), "desc");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Asc,
    /// Sort in descending order (Z-A, 9-0)
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// One `(field, direction)` pair of a sort
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortOrder {
    /// Field path, possibly through one relation (`team.name`)
    pub field: String,
    /// Sort direction
    #[serde(default)]
    pub direction: Direction,
}

impl SortOrder {
    /// Ascending order on `field`
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    /// Descending order on `field`
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    /// The relation this order traverses, if any
    pub fn relation(&self) -> Option<&str> {
        relation_of(&self.field)
    }
}

/// Ordered sequence of sort orders, applied in the given order
///
/// Ties on every listed field leave relative order unspecified; append a
/// unique field such as `id` for stable pagination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sort {
    orders: Vec<SortOrder>,
}

impl Sort {
    /// No ordering
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Ascending on a single field
    pub fn asc(field: impl Into<String>) -> Self {
        Self::by(SortOrder::asc(field))
    }

    /// Descending on a single field
    pub fn desc(field: impl Into<String>) -> Self {
        Self::by(SortOrder::desc(field))
    }

    /// Sort by one order
    pub fn by(order: SortOrder) -> Self {
        Self {
            orders: vec![order],
        }
    }

    /// Append a lower-priority order
    #[must_use]
    pub fn then(mut self, order: SortOrder) -> Self {
        self.orders.push(order);
        self
    }

    /// Append all orders of `other` after this sort's orders
    #[must_use]
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    /// The orders in priority sequence
    pub fn orders(&self) -> &[SortOrder] {
        &self.orders
    }

    /// Whether no order is defined
    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

impl From<Vec<SortOrder>> for Sort {
    fn from(orders: Vec<SortOrder>) -> Self {
        Self { orders }
    }
}

/// A zero-based page index, a page size and a sort
///
/// Construction rejects a size of zero. Deserialized requests are validated
/// again by the paginator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    index: u64,
    size: u64,
    #[serde(default)]
    sort: Sort,
}

impl PageRequest {
    /// Unsorted page request
    pub fn of(index: u64, size: u64) -> QueryResult<Self> {
        Self::sorted(index, size, Sort::unsorted())
    }

    /// Sorted page request
    pub fn sorted(index: u64, size: u64, sort: Sort) -> QueryResult<Self> {
        if size == 0 {
            return Err(QueryError::configuration(
                QueryOperation::Plan,
                "Page size must be greater than zero",
            ));
        }
        Ok(Self { index, size, sort })
    }

    /// Zero-based page index
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Page size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Requested sort
    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    /// Number of rows to skip (`index * size`)
    pub const fn offset(&self) -> u64 {
        self.index.saturating_mul(self.size)
    }

    /// The following page with the same size and sort
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            index: self.index.saturating_add(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    /// The preceding page, or this page if it is the first
    #[must_use]
    pub fn previous_or_first(&self) -> Self {
        Self {
            index: self.index.saturating_sub(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    /// The first page with the same size and sort
    #[must_use]
    pub fn first(&self) -> Self {
        Self {
            index: 0,
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    pub(crate) fn with_size(&self, size: u64) -> Self {
        Self {
            index: self.index,
            size,
            sort: self.sort.clone(),
        }
    }
}

/// How the total size of a paged result is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountStrategy {
    /// Content only, no navigation metadata beyond the page number
    None,
    /// A bounded content query plus an unbounded count query
    #[default]
    SeparateCountQuery,
    /// One content query for `size + 1` rows; the extra row signals a next page
    FetchPlusOne,
}

/// A page of results with a known total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    content: Vec<T>,
    number: u64,
    size: u64,
    total_elements: u64,
}

impl<T> Page<T> {
    /// Assemble a page from content, the request that produced it and the total
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            number: request.index(),
            size: request.size(),
            total_elements,
        }
    }

    /// Page content in query order
    pub fn content(&self) -> &[T] {
        &self.content
    }

    /// Consume the page and return its content
    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    /// Zero-based page number
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// Requested page size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Number of rows on this page
    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    /// Total rows matching the query
    pub const fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// `ceil(total_elements / size)`
    pub const fn total_pages(&self) -> u64 {
        calculate_total_pages(self.total_elements, self.size)
    }

    /// Whether this is the first page
    pub const fn is_first(&self) -> bool {
        self.number == 0
    }

    /// Whether no page follows this one
    pub const fn is_last(&self) -> bool {
        !self.has_next()
    }

    /// Whether a page follows this one
    pub const fn has_next(&self) -> bool {
        self.number.saturating_add(1) < self.total_pages()
    }

    /// Whether a page precedes this one
    pub const fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Map the content, keeping the metadata
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// A page of results that only knows whether more rows follow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice<T> {
    content: Vec<T>,
    number: u64,
    size: u64,
    has_next: bool,
}

impl<T> Slice<T> {
    /// Assemble a slice from content and the request that produced it
    pub fn new(content: Vec<T>, request: &PageRequest, has_next: bool) -> Self {
        Self {
            content,
            number: request.index(),
            size: request.size(),
            has_next,
        }
    }

    /// Slice content in query order
    pub fn content(&self) -> &[T] {
        &self.content
    }

    /// Consume the slice and return its content
    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    /// Zero-based page number
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// Requested page size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is the first slice
    pub const fn is_first(&self) -> bool {
        self.number == 0
    }

    /// Whether a slice follows this one
    pub const fn has_next(&self) -> bool {
        self.has_next
    }

    /// Map the content, keeping the metadata
    pub fn map<U, F>(self, f: F) -> Slice<U>
    where
        F: FnMut(T) -> U,
    {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        }
    }
}

/// Result of a paginated query, shaped by its [`CountStrategy`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PagedResult<T> {
    /// `CountStrategy::SeparateCountQuery`
    Page(Page<T>),
    /// `CountStrategy::FetchPlusOne`
    Slice(Slice<T>),
    /// `CountStrategy::None`
    Unpaged {
        /// Rows in query order
        content: Vec<T>,
        /// Zero-based page number
        number: u64,
    },
}

impl<T> PagedResult<T> {
    /// Content regardless of shape
    pub fn content(&self) -> &[T] {
        match self {
            Self::Page(page) => page.content(),
            Self::Slice(slice) => slice.content(),
            Self::Unpaged { content, .. } => content,
        }
    }

    /// Consume the result and return its content
    pub fn into_content(self) -> Vec<T> {
        match self {
            Self::Page(page) => page.into_content(),
            Self::Slice(slice) => slice.into_content(),
            Self::Unpaged { content, .. } => content,
        }
    }

    /// Zero-based page number
    pub fn number(&self) -> u64 {
        match self {
            Self::Page(page) => page.number(),
            Self::Slice(slice) => slice.number(),
            Self::Unpaged { number, .. } => *number,
        }
    }

    /// Whether this is the first page
    pub fn is_first(&self) -> bool {
        self.number() == 0
    }

    /// Whether more rows follow; unknown without a count strategy
    pub fn has_next(&self) -> Option<bool> {
        match self {
            Self::Page(page) => Some(page.has_next()),
            Self::Slice(slice) => Some(slice.has_next()),
            Self::Unpaged { .. } => None,
        }
    }

    /// Total matching rows; only a page knows it
    pub fn total_elements(&self) -> Option<u64> {
        match self {
            Self::Page(page) => Some(page.total_elements()),
            _ => None,
        }
    }

    /// Total pages; only a page knows it
    pub fn total_pages(&self) -> Option<u64> {
        match self {
            Self::Page(page) => Some(page.total_pages()),
            _ => None,
        }
    }

    /// Map the content, keeping the metadata
    pub fn map<U, F>(self, f: F) -> PagedResult<U>
    where
        F: FnMut(T) -> U,
    {
        match self {
            Self::Page(page) => PagedResult::Page(page.map(f)),
            Self::Slice(slice) => PagedResult::Slice(slice.map(f)),
            Self::Unpaged { content, number } => PagedResult::Unpaged {
                content: content.into_iter().map(f).collect(),
                number,
            },
        }
    }
}

/// Ceiling division of `total` by `per_page`; zero when `per_page` is zero
const fn calculate_total_pages(total: u64, per_page: u64) -> u64 {
    if per_page == 0 {
        0
    } else {
        total.div_ceil(per_page)
    }
}

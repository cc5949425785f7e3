//! Pagination engine
//!
//! [`Paginator::plan`] turns a select and a [`PageRequest`] into the store
//! queries a [`CountStrategy`] needs, without touching the store.
//! [`Paginator::paginate`] runs the plan and assembles the [`PagedResult`].
//!
//! # Example
//!
//! ```rust,ignore
//! let request = PageRequest::sorted(0, 3, Sort::desc("username"))?;
//! let page = paginate(&session, &SelectQuery::new("member"), &request, CountStrategy::SeparateCountQuery).await?;
//! assert_eq!(page.total_elements(), Some(5));
//! ```

use crate::config::QueryConfig;
use crate::record::Record;
use crate::repository::{
    CountQuery, CountStrategy, Page, PageRequest, PagedResult, QueryError, QueryOperation,
    QueryResult, RecordStore, SelectQuery, Slice,
};
use crate::specification::JoinDeclaration;

/// Store queries for one page
#[derive(Debug, Clone, PartialEq)]
pub struct PagePlan {
    /// Bounded content query
    pub content: SelectQuery,
    /// Count query, for `SeparateCountQuery` only
    pub count: Option<CountQuery>,
    /// Strategy the plan was made for
    pub strategy: CountStrategy,
    /// The request after clamping
    pub request: PageRequest,
}

/// Plans and runs paged queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    max_page_size: u64,
}

impl Default for Paginator {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

impl Paginator {
    /// Paginator clamping page sizes to `max_page_size`
    pub fn new(max_page_size: u64) -> Self {
        Self {
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.max_page_size)
    }

    pub fn max_page_size(&self) -> u64 {
        self.max_page_size
    }

    /// Build the store queries for `request` over `query`
    ///
    /// The request sort replaces the query sort unless it is empty. Sorting
    /// through a relation that is not joined adds a left join, so rows without
    /// a related record stay in the result.
    pub fn plan(
        &self,
        query: &SelectQuery,
        request: &PageRequest,
        strategy: CountStrategy,
    ) -> QueryResult<PagePlan> {
        if request.size() == 0 {
            return Err(QueryError::configuration(
                QueryOperation::Plan,
                "Page size must be greater than zero",
            ));
        }
        let request = if request.size() > self.max_page_size {
            tracing::debug!(
                requested = request.size(),
                max = self.max_page_size,
                "clamping page size"
            );
            request.with_size(self.max_page_size)
        } else {
            request.clone()
        };

        let mut content = query.clone();
        if !request.sort().is_unsorted() {
            content.sort = request.sort().clone();
        }
        for order in content.sort.orders() {
            if let Some(relation) = order.relation() {
                if content.specification.join(relation).is_none() {
                    content.specification = content
                        .specification
                        .clone()
                        .with_join(JoinDeclaration::left(relation));
                }
            }
        }

        content.offset = request.offset();
        content.limit = Some(match strategy {
            CountStrategy::FetchPlusOne => request.size().saturating_add(1),
            _ => request.size(),
        });

        let count = (strategy == CountStrategy::SeparateCountQuery)
            .then(|| CountQuery::from_select(&content));

        Ok(PagePlan {
            content,
            count,
            strategy,
            request,
        })
    }

    /// Plan and run a paged query against `store`
    ///
    /// With `SeparateCountQuery` the content and count queries run
    /// concurrently; either failing fails the whole call.
    pub async fn paginate<S: RecordStore>(
        &self,
        store: &S,
        query: &SelectQuery,
        request: &PageRequest,
        strategy: CountStrategy,
    ) -> QueryResult<PagedResult<Record>> {
        let plan = self.plan(query, request, strategy)?;
        tracing::debug!(
            entity = %plan.content.entity,
            index = plan.request.index(),
            size = plan.request.size(),
            ?strategy,
            "paginating"
        );

        match (plan.strategy, plan.count) {
            (CountStrategy::SeparateCountQuery, Some(count)) => {
                let (content, total) =
                    futures::try_join!(store.query(&plan.content), store.count(&count))?;
                Ok(PagedResult::Page(Page::new(content, &plan.request, total)))
            }
            (CountStrategy::FetchPlusOne, _) => {
                let mut content = store.query(&plan.content).await?;
                let size = usize::try_from(plan.request.size()).unwrap_or(usize::MAX);
                let has_next = content.len() > size;
                content.truncate(size);
                Ok(PagedResult::Slice(Slice::new(content, &plan.request, has_next)))
            }
            _ => {
                let content = store.query(&plan.content).await?;
                Ok(PagedResult::Unpaged {
                    content,
                    number: plan.request.index(),
                })
            }
        }
    }
}

/// Run a paged query with the default paginator
pub async fn paginate<S: RecordStore>(
    store: &S,
    query: &SelectQuery,
    request: &PageRequest,
    strategy: CountStrategy,
) -> QueryResult<PagedResult<Record>> {
    Paginator::default()
        .paginate(store, query, request, strategy)
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::repository::{Filter, Sort};
    use crate::schema::{EntityModel, Schema};
    use crate::specification::{build_specification, JoinKind};
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

    async fn members(count: i64) -> (MemoryDatabase, MemorySession) {
        let db = MemoryDatabase::new(schema());
        let session = db.session();
        session
            .save(Record::new("team", 1).with_field("name", "teamA"))
            .await
            .unwrap();
        for id in 1..=count {
            let mut record = Record::new("member", id)
                .with_field("username", format!("member{}", id))
                .with_field("age", 10 * id);
            if id % 2 == 1 {
                record = record.with_relation("team", "team", 1);
            }
            session.save(record).await.unwrap();
        }
        (db, session)
    }

    fn usernames(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.value("username").as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_first_page_sorted_descending() {
        let (_db, session) = members(5).await;
        let request = PageRequest::sorted(0, 3, Sort::desc("username")).unwrap();

        let result = paginate(
            &session,
            &SelectQuery::new("member"),
            &request,
            CountStrategy::SeparateCountQuery,
        )
        .await
        .unwrap();

        assert_eq!(usernames(result.content()), ["member5", "member4", "member3"]);
        assert_eq!(result.total_elements(), Some(5));
        assert_eq!(result.total_pages(), Some(2));
        assert!(result.is_first());
        assert_eq!(result.has_next(), Some(true));
    }

    #[tokio::test]
    async fn test_fetch_plus_one_detects_next_page() {
        let request = PageRequest::sorted(0, 3, Sort::asc("id")).unwrap();

        let (_db, four) = members(4).await;
        let result = paginate(&four, &SelectQuery::new("member"), &request, CountStrategy::FetchPlusOne)
            .await
            .unwrap();
        assert!(matches!(result, PagedResult::Slice(_)));
        assert_eq!(result.content().len(), 3);
        assert_eq!(result.has_next(), Some(true));
        assert_eq!(result.total_elements(), None);

        let (_db, three) = members(3).await;
        let result = paginate(&three, &SelectQuery::new("member"), &request, CountStrategy::FetchPlusOne)
            .await
            .unwrap();
        assert_eq!(result.content().len(), 3);
        assert_eq!(result.has_next(), Some(false));
    }

    #[tokio::test]
    async fn test_page_lengths_sum_to_total() {
        let (_db, session) = members(7).await;
        let spec = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        let query = SelectQuery::new("member").with_specification(spec);
        let mut request = PageRequest::sorted(0, 2, Sort::asc("id")).unwrap();

        let mut seen = 0;
        let total = loop {
            let result = paginate(&session, &query, &request, CountStrategy::SeparateCountQuery)
                .await
                .unwrap();
            assert!(result.content().len() <= 2);
            seen += result.content().len() as u64;
            if result.has_next() != Some(true) {
                break result.total_elements().unwrap();
            }
            request = request.next();
        };
        assert_eq!(total, 6);
        assert_eq!(seen, total);
    }

    #[tokio::test]
    async fn test_page_beyond_end_is_empty() {
        let (_db, session) = members(5).await;
        let request = PageRequest::sorted(4, 3, Sort::asc("id")).unwrap();

        let result = paginate(
            &session,
            &SelectQuery::new("member"),
            &request,
            CountStrategy::SeparateCountQuery,
        )
        .await
        .unwrap();
        assert!(result.content().is_empty());
        assert_eq!(result.has_next(), Some(false));
        assert_eq!(result.total_elements(), Some(5));
    }

    #[tokio::test]
    async fn test_absent_filters_do_not_change_results() {
        let (_db, session) = members(5).await;
        let request = PageRequest::sorted(0, 10, Sort::asc("id")).unwrap();
        let nothing: Option<String> = None;

        let plain = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
        let padded = build_specification(
            &[
                Filter::gte("age", 20),
                Filter::eq("username", nothing),
                Filter::in_strings("username", Vec::new()),
            ],
            &[],
        )
        .unwrap();

        let mut results = Vec::new();
        for spec in [plain, padded] {
            let query = SelectQuery::new("member").with_specification(spec);
            let result = paginate(&session, &query, &request, CountStrategy::SeparateCountQuery)
                .await
                .unwrap();
            results.push((usernames(result.content()), result.total_elements()));
        }
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn test_unpaged_returns_content_only() {
        let (_db, session) = members(5).await;
        let request = PageRequest::sorted(1, 2, Sort::asc("id")).unwrap();

        let result = paginate(&session, &SelectQuery::new("member"), &request, CountStrategy::None)
            .await
            .unwrap();
        assert_eq!(usernames(result.content()), ["member3", "member4"]);
        assert_eq!(result.number(), 1);
        assert_eq!(result.total_elements(), None);
        assert_eq!(result.has_next(), None);
    }

    #[test]
    fn test_plan_clamps_and_windows() {
        let paginator = Paginator::new(50);
        let request = PageRequest::of(2, 500).unwrap();

        let plan = paginator
            .plan(&SelectQuery::new("member"), &request, CountStrategy::FetchPlusOne)
            .unwrap();
        assert_eq!(plan.request.size(), 50);
        assert_eq!(plan.content.offset, 100);
        assert_eq!(plan.content.limit, Some(51));
        assert!(plan.count.is_none());
    }

    #[test]
    fn test_plan_rejects_zero_size() {
        let request: PageRequest = serde_json::from_value(json!({"index": 0, "size": 0})).unwrap();
        let err = Paginator::default()
            .plan(&SelectQuery::new("member"), &request, CountStrategy::None)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_plan_joins_relation_sort_and_count_drops_it() {
        let request = PageRequest::sorted(0, 5, Sort::asc("team.name")).unwrap();
        let plan = Paginator::default()
            .plan(
                &SelectQuery::new("member").with_sort(Sort::asc("id")),
                &request,
                CountStrategy::SeparateCountQuery,
            )
            .unwrap();

        let join = plan.content.specification.join("team").unwrap();
        assert_eq!(join.kind, JoinKind::Left);
        assert_eq!(plan.content.sort, Sort::asc("team.name"));
        let count = plan.count.unwrap();
        assert!(count.specification.joins().is_empty());
    }

    #[tokio::test]
    async fn test_relation_sort_keeps_rows_without_relation() {
        let (_db, session) = members(4).await;
        let request =
            PageRequest::sorted(0, 10, Sort::asc("team.name").and(Sort::asc("id"))).unwrap();

        let result = paginate(
            &session,
            &SelectQuery::new("member"),
            &request,
            CountStrategy::SeparateCountQuery,
        )
        .await
        .unwrap();
        assert_eq!(
            usernames(result.content()),
            ["member1", "member3", "member2", "member4"]
        );
        assert_eq!(result.total_elements(), Some(4));
    }
}

//! Page-at-a-time resources.
//!
//! The endpoint gets `page` and `pageSize` query parameters appended from
//! the held page state. The server may answer with a bare JSON array or with
//! `{ "data": [...], "pagination": {...} }`.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::client::Transport;
use super::resource::{Endpoint, Resource, ResourceOptions, ResourceState, SuccessCallback};
use super::ApiError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            total: 0,
            total_pages: 0,
            has_next: false,
            has_prev: false,
        }
    }
}

/// Append `page`/`pageSize` with `?` or `&` as the path requires.
pub fn page_path(path: &str, page: u32, page_size: u32) -> String {
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{}{}page={}&pageSize={}", path, separator, page, page_size)
}

/// Split a page payload into its items and the server's pagination, if any.
pub fn parse_page<T: DeserializeOwned>(payload: Value) -> Result<(Vec<T>, Option<Pagination>), ApiError> {
    let invalid = |e: serde_json::Error| ApiError::InvalidResponse(e.to_string());
    match payload {
        Value::Object(mut map) if map.contains_key("data") => {
            let pagination = match map.remove("pagination") {
                Some(Value::Null) | None => None,
                Some(p) => Some(serde_json::from_value(p).map_err(invalid)?),
            };
            let items = serde_json::from_value(map.remove("data").unwrap_or(Value::Null)).map_err(invalid)?;
            Ok((items, pagination))
        }
        other => Ok((serde_json::from_value(other).map_err(invalid)?, None)),
    }
}

/// One committed page: its items and the server's pagination, if it sent one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageOptions {
    pub page_size: u32,
    pub initial_page: u32,
    pub retry: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_page: 1,
            retry: 0,
        }
    }
}

struct Pages<T> {
    page: u32,
    all_data: Vec<T>,
}

/// Server pagination is read from the committed `Page` only.
pub struct PaginatedResource<T> {
    resource: Resource<Page<T>>,
    page_size: u32,
    pages: Arc<Mutex<Pages<T>>>,
}

impl<T> Clone for PaginatedResource<T> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            page_size: self.page_size,
            pages: self.pages.clone(),
        }
    }
}

impl<T> PaginatedResource<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<Endpoint>, options: PageOptions) -> Self {
        Self::with_resource_options(transport, endpoint, options, ResourceOptions::get())
    }

    /// `resource_options.transform` is replaced: pages are always parsed by
    /// `parse_page`. `on_success` sees the items of each committed page.
    pub fn with_resource_options(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<Endpoint>,
        options: PageOptions,
        resource_options: ResourceOptions<Vec<T>>,
    ) -> Self {
        let endpoint = endpoint.into();
        let page_size = options.page_size.max(1);
        let pages = Arc::new(Mutex::new(Pages {
            page: options.initial_page.max(1),
            all_data: Vec::new(),
        }));

        let paged_endpoint = {
            let pages = pages.clone();
            Endpoint::resolver(move || {
                let page = lock(&pages).page;
                endpoint.resolve().map(|path| page_path(&path, page, page_size))
            })
        };
        let on_success = resource_options.on_success.map(|f| -> SuccessCallback<Page<T>> {
            Arc::new(move |page: &Page<T>| f(&page.items))
        });
        let page_options = ResourceOptions {
            method: resource_options.method,
            immediate: resource_options.immediate,
            retry: options.retry,
            retry_delay: resource_options.retry_delay,
            transform: None,
            on_success,
            on_error: resource_options.on_error,
            clock: resource_options.clock,
            reporter: resource_options.reporter,
        }
        .transform(|payload: Value| -> Result<Page<T>, ApiError> {
            let (items, pagination) = parse_page(payload)?;
            Ok(Page { items, pagination })
        });

        let resource = Resource::new(transport, paged_endpoint, page_options);
        Self {
            resource,
            page_size,
            pages,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn current_page(&self) -> u32 {
        lock(&self.pages).page
    }

    /// Server pagination when it sent one, otherwise what is known locally.
    pub fn pagination(&self) -> Pagination {
        if let Some(reported) = self.reported() {
            return reported;
        }
        let page = lock(&self.pages).page;
        Pagination {
            page,
            page_size: self.page_size,
            has_prev: page > 1,
            ..Pagination::default()
        }
    }

    fn reported(&self) -> Option<Pagination> {
        self.resource.data().and_then(|page| page.pagination)
    }

    /// Whether the last committed response carried a pagination block.
    pub fn server_reported(&self) -> bool {
        self.reported().is_some()
    }

    /// Items of the current page.
    pub fn data(&self) -> Option<Vec<T>> {
        self.resource.data().map(|page| page.items)
    }

    /// Every page loaded since the last plain fetch.
    pub fn all_data(&self) -> Vec<T> {
        lock(&self.pages).all_data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.resource.is_loading()
    }

    pub fn snapshot(&self) -> ResourceState<Vec<T>> {
        let state = self.resource.snapshot();
        ResourceState {
            data: state.data.map(|page| page.items),
            loading: state.loading,
            error: state.error,
            last_fetch: state.last_fetch,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<Page<T>>> {
        self.resource.subscribe()
    }

    /// Fetch the current page; the accumulated list restarts from it.
    pub async fn fetch(&self) -> Result<Option<Vec<T>>, ApiError> {
        let items = self.resource.fetch().await?.map(|page| page.items);
        if let Some(items) = &items {
            lock(&self.pages).all_data = items.clone();
        }
        Ok(items)
    }

    pub async fn refetch(&self) -> Result<Option<Vec<T>>, ApiError> {
        self.fetch().await
    }

    pub async fn go_to_page(&self, page: u32) -> Result<Option<Vec<T>>, ApiError> {
        lock(&self.pages).page = page.max(1);
        self.fetch().await
    }

    /// No-op unless the server said there is a next page.
    pub async fn next_page(&self) -> Result<Option<Vec<T>>, ApiError> {
        if !self.pagination().has_next {
            return Ok(None);
        }
        let page = self.current_page() + 1;
        self.go_to_page(page).await
    }

    pub async fn prev_page(&self) -> Result<Option<Vec<T>>, ApiError> {
        if !self.pagination().has_prev {
            return Ok(None);
        }
        let page = self.current_page().saturating_sub(1);
        self.go_to_page(page).await
    }

    /// Fetch the next page and append it to `all_data`. No-op while a fetch
    /// is running or when the server reports no next page. The page number
    /// only advances if the fetch succeeds.
    pub async fn load_more(&self) -> Result<Option<Vec<T>>, ApiError> {
        if !self.pagination().has_next || self.is_loading() {
            return Ok(None);
        }
        self.fetch_page_appending().await
    }

    /// Advance one page and append, without consulting `has_next`.
    pub(crate) async fn fetch_page_appending(&self) -> Result<Option<Vec<T>>, ApiError> {
        let previous = {
            let mut pages = lock(&self.pages);
            let previous = pages.page;
            pages.page += 1;
            previous
        };

        match self.resource.fetch().await {
            Ok(Some(page)) => {
                lock(&self.pages).all_data.extend(page.items.iter().cloned());
                Ok(Some(page.items))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                lock(&self.pages).page = previous;
                Err(e)
            }
        }
    }

    /// Back to `page`, dropping accumulated data and server pagination.
    pub(crate) fn rewind(&self, page: u32) {
        self.resource.reset();
        let mut pages = lock(&self.pages);
        pages.page = page.max(1);
        pages.all_data.clear();
    }
}

fn lock<T>(pages: &Mutex<Pages<T>>) -> std::sync::MutexGuard<'_, Pages<T>> {
    pages.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::{ApiRequest, ApiResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Serves `total` numbered items, `{data, pagination}` shaped.
    struct NumberedPages {
        total: u32,
        with_pagination: bool,
        paths: Mutex<Vec<String>>,
    }

    impl NumberedPages {
        fn new(total: u32, with_pagination: bool) -> Arc<Self> {
            Arc::new(Self {
                total,
                with_pagination,
                paths: Mutex::new(Vec::new()),
            })
        }
    }

    fn query_param(path: &str, name: &str) -> u32 {
        path.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
            .and_then(|v| v.parse().ok())
            .unwrap()
    }

    #[async_trait]
    impl Transport for NumberedPages {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
            self.paths.lock().unwrap().push(request.path.clone());
            let page = query_param(&request.path, "page");
            let size = query_param(&request.path, "pageSize");
            let start = (page - 1) * size;
            let items: Vec<u32> = (start..(start + size).min(self.total)).collect();
            let total_pages = self.total.div_ceil(size);
            let data = if self.with_pagination {
                json!({
                    "data": items,
                    "pagination": {
                        "page": page,
                        "pageSize": size,
                        "total": self.total,
                        "totalPages": total_pages,
                        "hasNext": page < total_pages,
                        "hasPrev": page > 1,
                    }
                })
            } else {
                json!(items)
            };
            Ok(ApiResponse {
                status: 200,
                headers: BTreeMap::new(),
                data,
                duration: std::time::Duration::ZERO,
            })
        }
    }

    fn options(page_size: u32) -> PageOptions {
        PageOptions {
            page_size,
            ..PageOptions::default()
        }
    }

    #[test]
    fn test_page_path() {
        assert_eq!(page_path("/users", 2, 20), "/users?page=2&pageSize=20");
        assert_eq!(page_path("/users?role=admin", 1, 5), "/users?role=admin&page=1&pageSize=5");
    }

    #[test]
    fn test_parse_page_shapes() {
        let (items, pagination) = parse_page::<u32>(json!([1, 2])).unwrap();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(pagination, None);

        let (items, pagination) = parse_page::<u32>(json!({
            "data": [3],
            "pagination": {"page": 2, "pageSize": 1, "total": 5, "totalPages": 5, "hasNext": true, "hasPrev": true}
        }))
        .unwrap();
        assert_eq!(items, vec![3]);
        let pagination = pagination.unwrap();
        assert_eq!(pagination.total, 5);
        assert!(pagination.has_next);

        assert!(matches!(
            parse_page::<u32>(json!({"count": 1})),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_navigation_follows_server_flags() {
        let transport = NumberedPages::new(25, true);
        let pages: PaginatedResource<u32> = PaginatedResource::new(transport.clone(), "/users", options(10));

        assert_eq!(pages.fetch().await.unwrap(), Some((0..10).collect()));
        assert!(pages.pagination().has_next);
        assert_eq!(pages.prev_page().await.unwrap(), None);

        pages.next_page().await.unwrap();
        pages.next_page().await.unwrap();
        assert_eq!(pages.current_page(), 3);
        assert_eq!(pages.data(), Some((20..25).collect()));
        assert!(!pages.pagination().has_next);

        // Last page: next is a no-op
        assert_eq!(pages.next_page().await.unwrap(), None);
        assert_eq!(pages.current_page(), 3);

        pages.prev_page().await.unwrap();
        assert_eq!(pages.current_page(), 2);
        assert_eq!(
            transport.paths.lock().unwrap().last().map(String::as_str),
            Some("/users?page=2&pageSize=10")
        );
    }

    #[tokio::test]
    async fn test_load_more_accumulates() {
        let transport = NumberedPages::new(12, true);
        let pages: PaginatedResource<u32> = PaginatedResource::new(transport.clone(), "/events", options(5));

        pages.fetch().await.unwrap();
        pages.load_more().await.unwrap();
        pages.load_more().await.unwrap();
        assert_eq!(pages.all_data(), (0..12).collect::<Vec<_>>());
        assert_eq!(pages.current_page(), 3);

        // No next page left
        assert_eq!(pages.load_more().await.unwrap(), None);
        assert_eq!(transport.paths.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_go_to_page() {
        let transport = NumberedPages::new(100, true);
        let pages: PaginatedResource<u32> = PaginatedResource::new(transport, "/logs", options(20));

        assert_eq!(pages.go_to_page(4).await.unwrap(), Some((60..80).collect()));
        assert_eq!(pages.pagination().page, 4);
        assert!(pages.pagination().has_prev);
    }

    /// Serves page one with a pagination block, running `interrupt` while
    /// the request is in flight.
    struct Interrupted {
        interrupt: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    #[async_trait]
    impl Transport for Interrupted {
        async fn send(&self, _request: ApiRequest) -> Result<ApiResponse, ApiError> {
            let interrupt = self.interrupt.lock().unwrap().take();
            if let Some(interrupt) = interrupt {
                interrupt();
            }
            Ok(ApiResponse {
                status: 200,
                headers: BTreeMap::new(),
                data: json!({"data": [1, 2], "pagination": {"page": 1, "pageSize": 2, "hasNext": true}}),
                duration: std::time::Duration::ZERO,
            })
        }
    }

    #[tokio::test]
    async fn test_superseded_fetch_leaves_no_pagination() {
        let transport = Arc::new(Interrupted {
            interrupt: Mutex::new(None),
        });
        let pages: PaginatedResource<u32> = PaginatedResource::new(transport.clone(), "/users", options(2));
        let rewound = pages.clone();
        *transport.interrupt.lock().unwrap() = Some(Box::new(move || rewound.rewind(1)));

        assert!(matches!(pages.fetch().await, Err(ApiError::Cancelled)));
        assert!(!pages.server_reported());
        assert!(!pages.pagination().has_next);
        assert_eq!(pages.data(), None);

        // The next fetch commits and reports normally
        assert_eq!(pages.fetch().await.unwrap(), Some(vec![1, 2]));
        assert!(pages.pagination().has_next);
    }
}

//! Infinite-scroll resource: successive pages folded into one list.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use super::client::Transport;
use super::paginated::{PageOptions, PaginatedResource};
use super::resource::Endpoint;
use super::ApiError;

struct Scroll<T> {
    items: Vec<T>,
    has_more: bool,
    started: bool,
}

pub struct InfiniteResource<T> {
    pages: PaginatedResource<T>,
    scroll: Arc<Mutex<Scroll<T>>>,
}

impl<T> Clone for InfiniteResource<T> {
    fn clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            scroll: self.scroll.clone(),
        }
    }
}

impl<T> InfiniteResource<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<Endpoint>, page_size: u32) -> Self {
        let options = PageOptions {
            page_size,
            initial_page: 1,
            ..PageOptions::default()
        };
        Self {
            pages: PaginatedResource::new(transport, endpoint, options),
            scroll: Arc::new(Mutex::new(Scroll {
                items: Vec::new(),
                has_more: true,
                started: false,
            })),
        }
    }

    fn scroll(&self) -> std::sync::MutexGuard<'_, Scroll<T>> {
        self.scroll.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn items(&self) -> Vec<T> {
        self.scroll().items.clone()
    }

    pub fn has_more(&self) -> bool {
        self.scroll().has_more
    }

    pub fn is_loading(&self) -> bool {
        self.pages.is_loading()
    }

    pub fn current_page(&self) -> u32 {
        self.pages.current_page()
    }

    /// The server's `hasNext` when it sends pagination. Without it, a full
    /// page is taken to mean more may follow.
    fn more_after(&self, page: &[T]) -> bool {
        if self.pages.server_reported() {
            self.pages.pagination().has_next
        } else {
            !page.is_empty() && page.len() as u32 == self.pages.page_size()
        }
    }

    fn absorb(&self, page: Vec<T>, replace: bool) {
        let has_more = self.more_after(&page);
        let mut scroll = self.scroll();
        if replace {
            scroll.items = page;
        } else {
            scroll.items.extend(page);
        }
        scroll.has_more = has_more;
        scroll.started = true;
    }

    /// Load the first page if nothing is loaded yet, otherwise the next one.
    /// Returns the number of new items. No-op while loading or when no more
    /// pages are expected.
    pub async fn load_more(&self) -> Result<usize, ApiError> {
        if !self.has_more() || self.is_loading() {
            return Ok(0);
        }

        let started = self.scroll().started;
        let page = if started {
            self.pages.fetch_page_appending().await?
        } else {
            self.pages.fetch().await?
        };

        let Some(page) = page else {
            return Ok(0);
        };
        let count = page.len();
        self.absorb(page, !started);
        Ok(count)
    }

    /// Drop everything and start over from page one on the next `load_more`.
    pub fn reset(&self) {
        self.pages.rewind(1);
        let mut scroll = self.scroll();
        scroll.items.clear();
        scroll.has_more = true;
        scroll.started = false;
    }

    /// Reload from page one, replacing the list.
    pub async fn refetch(&self) -> Result<usize, ApiError> {
        self.reset();
        self.load_more().await
    }
}

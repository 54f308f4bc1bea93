//! Page-based pagination for list endpoints.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// `?page=&per_page=` query parameters. Pages are 1-based.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PageQuery {
    /// Clamps out-of-range values instead of rejecting the request.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.normalized().per_page as usize
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        let q = self.normalized();
        (q.page as usize - 1).saturating_mul(q.per_page as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PageMeta {
    #[must_use]
    pub fn new(query: PageQuery, total: u64) -> Self {
        let q = query.normalized();
        let total_pages = total.div_ceil(u64::from(q.per_page));
        Self {
            page: q.page,
            per_page: q.per_page,
            total,
            total_pages,
            has_next: u64::from(q.page) < total_pages,
            has_prev: q.page > 1,
        }
    }
}

/// One page of items plus its metadata.
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

impl<T> Paginated<T> {
    #[must_use]
    pub fn new(data: Vec<T>, query: PageQuery, total: u64) -> Self {
        Self {
            data,
            meta: PageMeta::new(query, total),
        }
    }

    /// Slices an in-memory collection.
    #[must_use]
    pub fn from_items(items: Vec<T>, query: PageQuery) -> Self {
        let total = items.len() as u64;
        let data = items
            .into_iter()
            .skip(query.offset())
            .take(query.limit())
            .collect();
        Self::new(data, query, total)
    }
}

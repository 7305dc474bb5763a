//! Source API boundary.
//!
//! The engine drives pagination; a [`PageSource`] only knows how to fetch
//! one page and classify what went wrong.

use std::time::Duration;

use async_trait::async_trait;

use crate::dataset::DatasetDescriptor;
use crate::record::RawRecord;
use crate::watermark::Watermark;

/// Where a page request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// Pagination root, filtered to records modified at or after `since`.
    First { since: Watermark },
    /// Opaque continuation returned by the previous page.
    Next(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: u32,
    pub position: PagePosition,
}

/// One fetched page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records in source order.
    pub records: Vec<RawRecord>,
    /// Continuation for the next page; `None` marks the last page.
    pub next: Option<String>,
    /// The response reported zero remaining quota.
    pub quota_exhausted: bool,
    /// Retry-after hint attached to a quota-exhausted response.
    pub retry_after: Option<Duration>,
}

impl Page {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Classified page fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Explicit "too many requests" signal.
    #[error("rate limited{}", hint_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    /// Network or server failure worth retrying.
    #[error("transient source error: {0}")]
    Transient(String),
    /// Credentials rejected. Never retried.
    #[error("source authentication failed: {0}")]
    Auth(String),
    /// Anything else. Never retried.
    #[error("source error: {0}")]
    Fatal(String),
}

impl SourceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

fn hint_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}ms)", d.as_millis()))
        .unwrap_or_default()
}

/// Fetches single pages of a dataset from the source API.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        dataset: &DatasetDescriptor,
        request: &PageRequest,
    ) -> Result<Page, SourceError>;
}

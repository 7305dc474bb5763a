//! Paginated extraction.
//!
//! A [`PageWalker`] walks one dataset's page sequence lazily: a page is only
//! fetched once the records of the previous one have been consumed. Every
//! page fetch goes through the retry combinator as a whole.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use shopsync_types::dataset::DatasetDescriptor;
use shopsync_types::record::RawRecord;
use shopsync_types::source::{PagePosition, PageRequest, PageSource};
use shopsync_types::watermark::Watermark;
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;
use crate::retry::{retry_with_backoff, Clock, RetryPolicy};

/// Fetches datasets from a [`PageSource`] with retry and rate-limit pacing.
#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn PageSource>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    page_size: u32,
    cancel: CancellationToken,
}

impl Extractor {
    #[must_use]
    pub fn new(
        source: Arc<dyn PageSource>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            policy,
            clock,
            page_size,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop requesting new pages once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start walking `descriptor` from `since`.
    ///
    /// Nothing is fetched until the walker is polled.
    #[must_use]
    pub fn extract(&self, descriptor: &DatasetDescriptor, since: Watermark) -> PageWalker<'_> {
        PageWalker {
            extractor: self,
            descriptor: descriptor.clone(),
            high_water: since.clone(),
            next: Some(PagePosition::First {
                since: since.clone(),
            }),
            since,
            buffer: VecDeque::new(),
            pending_pause: None,
            pages: 0,
            records_read: 0,
            records_filtered: 0,
        }
    }
}

/// Lazy, finite record sequence for one dataset.
pub struct PageWalker<'a> {
    extractor: &'a Extractor,
    descriptor: DatasetDescriptor,
    since: Watermark,
    /// `None` once the source reported the last page.
    next: Option<PagePosition>,
    buffer: VecDeque<RawRecord>,
    high_water: Watermark,
    pending_pause: Option<Duration>,
    pages: u64,
    records_read: u64,
    records_filtered: u64,
}

impl<'a> PageWalker<'a> {
    /// Next record in source order, or `None` after the last page.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransientFetchExhausted`] when a page fetch
    /// runs out of retries, [`PipelineError::Auth`] or
    /// [`PipelineError::Source`] for non-retryable failures, and
    /// [`PipelineError::Cancelled`] if the run was cancelled before the next
    /// page was requested.
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, PipelineError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.records_read += 1;
                return Ok(Some(record));
            }
            let Some(position) = self.next.take() else {
                return Ok(None);
            };
            if self.extractor.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { step: "next page" });
            }
            if let Some(pause) = self.pending_pause.take() {
                self.extractor.clock.sleep(pause).await;
            }
            self.fetch(position).await?;
        }
    }

    async fn fetch(&mut self, position: PagePosition) -> Result<(), PipelineError> {
        let extractor = self.extractor;
        let descriptor = &self.descriptor;
        let request = PageRequest {
            page_size: extractor.page_size,
            position,
        };
        let request = &request;
        let source = extractor.source.as_ref();
        let page = retry_with_backoff(
            &extractor.policy,
            extractor.clock.as_ref(),
            move |attempt| async move {
                tracing::debug!(dataset = %descriptor.kind, attempt, "Fetching page");
                source.fetch_page(descriptor, request).await
            },
        )
        .await?;

        self.pages += 1;
        tracing::debug!(
            dataset = %self.descriptor.kind,
            page = self.pages,
            records = page.records.len(),
            last = page.is_last(),
            "Fetched page"
        );

        if page.quota_exhausted && !page.is_last() {
            let pause = page
                .retry_after
                .unwrap_or(extractor.policy.base_delay)
                .min(extractor.policy.max_delay);
            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = pause.as_millis() as u64;
            tracing::warn!(
                dataset = %self.descriptor.kind,
                delay_ms,
                "Source quota exhausted, pausing before next page"
            );
            self.pending_pause = Some(pause);
        }
        self.next = page.next.map(PagePosition::Next);

        for record in page.records {
            let cursor = record
                .get(&self.descriptor.cursor_field)
                .and_then(|value| Watermark::from_json(self.descriptor.cursor_kind, value));
            if let Some(cursor) = cursor {
                if !self.since.is_beginning() && cursor < self.since {
                    self.records_filtered += 1;
                    continue;
                }
                if cursor > self.high_water {
                    self.high_water = cursor;
                }
            }
            self.buffer.push_back(record);
        }
        Ok(())
    }

    /// Highest cursor seen so far, or the starting watermark if none.
    #[must_use]
    pub fn high_water(&self) -> &Watermark {
        &self.high_water
    }

    /// Records yielded so far.
    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Records dropped because their cursor was below the starting watermark.
    #[must_use]
    pub fn records_filtered(&self) -> u64 {
        self.records_filtered
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Drain every remaining record, returning them with the candidate
    /// watermark.
    ///
    /// # Errors
    ///
    /// See [`PageWalker::next_record`].
    pub async fn collect_all(mut self) -> Result<(Vec<RawRecord>, Watermark), PipelineError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await? {
            records.push(record);
        }
        Ok((records, self.high_water))
    }

    /// View the walker as a fallible record stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawRecord, PipelineError>> + Send + 'a {
        stream::try_unfold(self, |mut walker| async move {
            Ok(walker.next_record().await?.map(|record| (record, walker)))
        })
    }
}

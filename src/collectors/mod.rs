//! Advisory feed sources and the chunked feed reader

pub mod git;
pub mod http;
pub mod osv_dir;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RetryPolicy;
use crate::error::{IngestError, IngestResult};
use crate::models::RawAdvisory;
use crate::retry::with_retry;

/// One page of upstream records
#[derive(Debug, Default)]
pub struct FeedPage {
    pub records: Vec<RawAdvisory>,
    /// Set when the source knows there is nothing after this page
    pub exhausted: bool,
    /// Set when the source knows more records follow, even if this page
    /// came back shorter than requested
    pub has_more: bool,
}

/// Trait for advisory feed sources
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Feed name
    fn name(&self) -> &'static str;

    /// Called once per run before the first page. `start_offset` is 0 when
    /// the run begins a new sweep.
    async fn prepare(&self, _start_offset: u64) -> Result<()> {
        Ok(())
    }

    /// Fetch up to `limit` records starting at `offset`
    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<FeedPage>;
}

/// A contiguous slice of the feed
#[derive(Debug)]
pub struct Chunk {
    pub offset: u64,
    pub next_offset: u64,
    pub records: Vec<RawAdvisory>,
}

/// Lazy, restartable reader over a [`FeedSource`]
pub struct FeedReader {
    source: Arc<dyn FeedSource>,
    offset: u64,
    chunk_size: usize,
    retry: RetryPolicy,
    exhausted: bool,
}

impl FeedReader {
    pub fn new(source: Arc<dyn FeedSource>, start_offset: u64, chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            source,
            offset: start_offset,
            chunk_size: chunk_size.max(1),
            retry,
            exhausted: false,
        }
    }

    /// Offset of the next record to be read
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Fetch the next chunk, or `None` once the feed is exhausted.
    /// Transient failures are retried; exhausting the retries leaves the
    /// cursor where it was.
    pub async fn next_chunk(&mut self) -> IngestResult<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let offset = self.offset;
        let limit = self.chunk_size;
        let source = Arc::clone(&self.source);
        let operation = format!("fetch {} @{}", source.name(), offset);

        let page = with_retry(&self.retry, &operation, |_| {
            let source = Arc::clone(&source);
            async move { source.fetch_page(offset, limit).await }
        })
        .await
        .map_err(|e| IngestError::ChunkFetch {
            offset,
            attempts: e.attempts,
            message: e.last_error,
        })?;

        let count = page.records.len();
        if page.exhausted || (count < limit && !page.has_more) {
            self.exhausted = true;
        } else if count < limit {
            tracing::debug!(
                source = self.source.name(),
                offset,
                requested = limit,
                returned = count,
                "Short page, source reports more records"
            );
        }
        if count == 0 {
            return Ok(None);
        }

        self.offset = offset + count as u64;
        tracing::info!(
            source = self.source.name(),
            offset,
            records = count,
            "Fetched chunk"
        );

        Ok(Some(Chunk {
            offset,
            next_offset: self.offset,
            records: page.records,
        }))
    }
}

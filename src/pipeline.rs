//! Run orchestration: fetch, normalize, map, filter, submit, checkpoint
//!
//! Chunks are processed strictly in order. A chunk's checkpoint is written in
//! the same transaction as the keys it emitted, and only after every bundle of
//! the chunk was acknowledged, so a failed run resumes at the first chunk that
//! did not make it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use crate::collectors::{Chunk, FeedReader, FeedSource};
use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::mapping::{EntityGraph, EntityMapper, RunContext};
use crate::models::{CanonicalRecord, NaturalKey, RawAdvisory};
use crate::normalize::{Normalized, Normalizer};
use crate::storage::{Checkpoint, StateStore};
use crate::submit::{BundleSubmitter, GraphOutcome, PlatformSink};

/// Cooperative cancellation, checked between chunks
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    FetchingChunk,
    Normalizing,
    Mapping,
    Filtering,
    Submitting,
    Checkpointing,
    Done,
    Aborted,
}

/// Outcome and counters of a single run
#[derive(Debug, Default)]
pub struct RunReport {
    pub phase: RunPhase,
    pub error: Option<IngestError>,
    pub start_offset: u64,
    /// Offset of the last committed checkpoint
    pub end_offset: u64,
    pub chunks: usize,
    pub records: usize,
    pub skipped_malformed: usize,
    pub skipped_no_hashes: usize,
    pub graphs_mapped: usize,
    pub already_seen: usize,
    pub submitted: usize,
    pub accepted: usize,
    pub rejected: usize,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Done
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "Run phase");
        self.phase = phase;
    }
}

/// Drives one ingestion run end to end
pub struct Pipeline {
    config: IngestConfig,
    source: Arc<dyn FeedSource>,
    store: Arc<dyn StateStore>,
    submitter: BundleSubmitter,
    normalizer: Arc<Normalizer>,
    mapper: Arc<EntityMapper>,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn FeedSource>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn PlatformSink>,
    ) -> Self {
        let submitter = BundleSubmitter::new(
            sink,
            config.bundle_max_objects as usize,
            config.submit_retry.clone(),
            config.submit_rate_per_sec,
        );
        let normalizer = Normalizer::new(&config.hash_algorithms, config.summary_max_len as usize);
        let mapper = EntityMapper::new(config.mapping.clone());

        Self {
            config,
            source,
            store,
            submitter,
            normalizer: Arc::new(normalizer),
            mapper: Arc::new(mapper),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> RunReport {
        self.run_at(RunContext::new(Utc::now())).await
    }

    /// Run with a fixed context; mapping output depends only on the records
    /// and `ctx`.
    pub async fn run_at(&self, ctx: RunContext) -> RunReport {
        let mut report = RunReport::default();

        let start = match self.resume_offset().await {
            Ok(offset) => offset,
            Err(e) => return abort(report, e),
        };
        report.start_offset = start;
        report.end_offset = start;

        tracing::info!(
            source = self.source.name(),
            offset = start,
            chunk_size = self.config.chunk_size,
            "Starting ingestion run"
        );

        // Not retried: a clone can outlive any per-request timeout
        if let Err(e) = self.source.prepare(start).await {
            let error = IngestError::ChunkFetch {
                offset: start,
                attempts: 1,
                message: format!("{e:#}"),
            };
            return abort(report, error);
        }

        let mut reader = FeedReader::new(
            Arc::clone(&self.source),
            start,
            self.config.chunk_size as usize,
            self.config.fetch_retry.clone(),
        );

        loop {
            if self.cancel.is_cancelled() {
                return abort(report, IngestError::Cancelled);
            }

            report.enter(RunPhase::FetchingChunk);
            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return abort(report, e),
            };

            if let Err(e) = self.process_chunk(chunk, &ctx, &mut report).await {
                return abort(report, e);
            }
        }

        report.enter(RunPhase::Checkpointing);
        if let Err(e) = self.store.checkpoint(&Checkpoint::completed_at(reader.offset())).await {
            return abort(report, e);
        }
        report.end_offset = reader.offset();
        report.enter(RunPhase::Done);

        if report.skipped_malformed > 0 {
            tracing::warn!(
                skipped = report.skipped_malformed,
                records = report.records,
                "Run skipped malformed records"
            );
        }
        tracing::info!(
            chunks = report.chunks,
            records = report.records,
            graphs = report.graphs_mapped,
            already_seen = report.already_seen,
            accepted = report.accepted,
            rejected = report.rejected,
            end_offset = report.end_offset,
            "Ingestion run complete"
        );

        report
    }

    async fn resume_offset(&self) -> IngestResult<u64> {
        match self.store.last_checkpoint().await {
            Ok(cp) if cp.completed => {
                tracing::info!(previous_end = cp.offset, "Previous sweep completed, starting a new sweep");
                Ok(0)
            }
            Ok(cp) => Ok(cp.offset),
            Err(IngestError::StateCorrupted(reason)) if self.config.reset_on_corruption => {
                tracing::warn!(%reason, "Checkpoint corrupted, restarting from offset 0");
                self.store.reset_checkpoint().await?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn process_chunk(&self, chunk: Chunk, ctx: &RunContext, report: &mut RunReport) -> IngestResult<()> {
        let Chunk {
            offset,
            next_offset,
            records,
        } = chunk;
        report.records += records.len();

        report.enter(RunPhase::Normalizing);
        let canonical = self.normalize_chunk(records, report).await;

        report.enter(RunPhase::Mapping);
        let mapper = Arc::clone(&self.mapper);
        let ctx = ctx.clone();
        let graphs: Vec<EntityGraph> = run_partitioned(canonical, self.workers(), move |record: CanonicalRecord| {
            mapper.map(&record, &ctx)
        })
        .await
        .into_iter()
        .flatten()
        .collect();
        report.graphs_mapped += graphs.len();

        report.enter(RunPhase::Filtering);
        let fresh = self.filter_unseen(graphs, report).await?;

        report.enter(RunPhase::Submitting);
        let mut accepted_keys = vec![];
        if !fresh.is_empty() {
            let submitted = self.submitter.submit(&fresh).await;
            for (graph, outcome) in fresh.iter().zip(&submitted.outcomes) {
                if *outcome == GraphOutcome::Accepted {
                    accepted_keys.extend(graph.keys.iter().cloned());
                }
            }
            let accepted = submitted.count(GraphOutcome::Accepted);
            let rejected = submitted.count(GraphOutcome::Rejected);
            report.submitted += accepted + rejected;
            report.accepted += accepted;
            report.rejected += rejected;

            if let Some(failure) = submitted.failure {
                // Bundles that did land stay recorded; the checkpoint does not move
                if let Err(e) = self.store.mark_seen(&accepted_keys).await {
                    tracing::error!(
                        error = %failure,
                        keys = accepted_keys.len(),
                        "Bundle submission failed and accepted keys could not be recorded"
                    );
                    return Err(e);
                }
                return Err(failure);
            }
            if rejected > 0 {
                tracing::warn!(
                    offset,
                    rejected,
                    "Advancing checkpoint past graphs the platform rejected"
                );
            }
        }

        report.enter(RunPhase::Checkpointing);
        self.store.commit_chunk(&accepted_keys, next_offset).await?;
        report.chunks += 1;
        report.end_offset = next_offset;
        metrics::counter!("malpkg_chunks_committed_total").increment(1);

        tracing::info!(
            offset,
            next_offset,
            emitted = accepted_keys.len(),
            "Committed chunk"
        );
        Ok(())
    }

    async fn normalize_chunk(&self, records: Vec<RawAdvisory>, report: &mut RunReport) -> Vec<CanonicalRecord> {
        let normalizer = Arc::clone(&self.normalizer);
        let results = run_partitioned(records, self.workers(), move |raw: RawAdvisory| {
            let normalized = normalizer.normalize(&raw);
            (raw.locator, normalized)
        })
        .await;

        let mut canonical = Vec::with_capacity(results.len());
        for (locator, normalized) in results {
            match normalized {
                Normalized::Record(record) => canonical.push(record),
                Normalized::Skip(reason) => {
                    metrics::counter!("malpkg_records_skipped_total", "reason" => reason.as_str()).increment(1);
                    if reason.is_malformed() {
                        report.skipped_malformed += 1;
                        tracing::warn!(%locator, %reason, "Skipping malformed record");
                    } else {
                        report.skipped_no_hashes += 1;
                        tracing::debug!(%locator, "Record has no targeted hashes");
                    }
                }
            }
        }
        canonical
    }

    /// Keep graphs with at least one key that is neither committed nor
    /// already queued earlier in this chunk.
    async fn filter_unseen(&self, graphs: Vec<EntityGraph>, report: &mut RunReport) -> IngestResult<Vec<EntityGraph>> {
        let mut keys: Vec<NaturalKey> = graphs.iter().flat_map(|g| g.keys.iter().cloned()).collect();
        keys.sort();
        keys.dedup();

        let mut seen = self.store.seen_many(&keys).await?;

        let mut fresh = Vec::with_capacity(graphs.len());
        for graph in graphs {
            if graph.keys.iter().all(|k| seen.contains(k)) {
                report.already_seen += 1;
                continue;
            }
            seen.extend(graph.keys.iter().cloned());
            fresh.push(graph);
        }

        tracing::debug!(
            fresh = fresh.len(),
            already_seen = report.already_seen,
            "Filtered chunk against emitted keys"
        );
        Ok(fresh)
    }

    fn workers(&self) -> usize {
        self.config.effective_workers()
    }
}

fn abort(mut report: RunReport, error: IngestError) -> RunReport {
    tracing::error!(
        phase = ?report.phase,
        error = %error,
        resume_offset = report.end_offset,
        "Ingestion run aborted"
    );
    report.enter(RunPhase::Aborted);
    report.error = Some(error);
    report
}

/// Apply `f` to `items` on up to `workers` blocking threads, preserving order
async fn run_partitioned<T, U, F>(items: Vec<T>, workers: usize, f: F) -> Vec<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    if items.is_empty() {
        return vec![];
    }

    let total = items.len();
    let per_worker = total.div_ceil(workers.max(1));
    let f = Arc::new(f);

    let mut items = items.into_iter();
    let mut handles = vec![];
    loop {
        let part: Vec<T> = items.by_ref().take(per_worker).collect();
        if part.is_empty() {
            break;
        }
        let f = Arc::clone(&f);
        handles.push(tokio::task::spawn_blocking(move || {
            part.into_iter().map(|item| f(item)).collect::<Vec<U>>()
        }));
    }

    let mut out = Vec::with_capacity(total);
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(part) => out.extend(part),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
    out
}

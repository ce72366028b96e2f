//! Bundle submission to the target platform

pub mod file;
pub mod http;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::config::RetryPolicy;
use crate::error::IngestError;
use crate::mapping::EntityGraph;
use crate::models::stix::StixBundle;
use crate::retry::with_retry;

/// What the platform acknowledged for one bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleAck {
    All,
    Partial { accepted: HashSet<String> },
}

impl BundleAck {
    pub fn accepts(&self, object_id: &str) -> bool {
        match self {
            BundleAck::All => true,
            BundleAck::Partial { accepted } => accepted.contains(object_id),
        }
    }
}

/// Trait for platform ingestion endpoints
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformSink: Send + Sync {
    /// Sink name
    fn name(&self) -> &'static str;

    /// Send one bundle; `Ok` means the request itself went through
    async fn send_bundle(&self, bundle: &StixBundle) -> Result<BundleAck>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphOutcome {
    Accepted,
    Rejected,
    NotAttempted,
}

/// Per-graph outcomes, aligned with the submitted slice
#[derive(Debug)]
pub struct SubmitReport {
    pub outcomes: Vec<GraphOutcome>,
    pub bundles_sent: usize,
    pub failure: Option<IngestError>,
}

impl SubmitReport {
    pub fn count(&self, outcome: GraphOutcome) -> usize {
        self.outcomes.iter().filter(|o| **o == outcome).count()
    }
}

/// Batches graphs into bundles and pushes them through a [`PlatformSink`]
pub struct BundleSubmitter {
    sink: Arc<dyn PlatformSink>,
    max_objects: usize,
    retry: RetryPolicy,
    limiter: DefaultDirectRateLimiter,
}

impl BundleSubmitter {
    pub fn new(sink: Arc<dyn PlatformSink>, max_objects: usize, retry: RetryPolicy, bundles_per_sec: u32) -> Self {
        let rate = NonZeroU32::new(bundles_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            sink,
            max_objects: max_objects.max(1),
            retry,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Submit graphs in order. Stops at the first bundle that fails after
    /// retries; graphs from later bundles are reported as not attempted.
    pub async fn submit(&self, graphs: &[EntityGraph]) -> SubmitReport {
        let mut outcomes = vec![GraphOutcome::NotAttempted; graphs.len()];
        let mut bundles_sent = 0;

        for (index, range) in plan_bundles(graphs, self.max_objects).into_iter().enumerate() {
            let batch = &graphs[range.clone()];
            let bundle = StixBundle::new(batch.iter().flat_map(EntityGraph::objects).collect());
            let operation = format!("submit {} bundle {}", self.sink.name(), index);

            self.limiter.until_ready().await;

            let result = with_retry(&self.retry, &operation, |_| {
                let sink = Arc::clone(&self.sink);
                let bundle = &bundle;
                async move { sink.send_bundle(bundle).await }
            })
            .await;

            let ack = match result {
                Ok(ack) => ack,
                Err(e) => {
                    tracing::error!(
                        sink = self.sink.name(),
                        bundle = index,
                        objects = bundle.objects.len(),
                        attempts = e.attempts,
                        "Bundle submission failed"
                    );
                    return SubmitReport {
                        outcomes,
                        bundles_sent,
                        failure: Some(IngestError::BundleSubmit {
                            bundle: index,
                            attempts: e.attempts,
                            message: e.last_error,
                        }),
                    };
                }
            };

            bundles_sent += 1;
            let mut rejected = 0;
            for (slot, graph) in outcomes[range].iter_mut().zip(batch) {
                if graph.object_ids().all(|id| ack.accepts(id)) {
                    *slot = GraphOutcome::Accepted;
                } else {
                    *slot = GraphOutcome::Rejected;
                    rejected += 1;
                }
            }

            metrics::counter!("malpkg_bundles_submitted_total").increment(1);
            metrics::counter!("malpkg_graphs_submitted_total").increment(batch.len() as u64);
            if rejected > 0 {
                metrics::counter!("malpkg_graphs_rejected_total").increment(rejected as u64);
                tracing::warn!(
                    bundle_id = %bundle.id,
                    graphs = batch.len(),
                    rejected,
                    "Platform partially accepted bundle"
                );
            } else {
                tracing::info!(
                    bundle_id = %bundle.id,
                    objects = bundle.objects.len(),
                    graphs = batch.len(),
                    "Bundle accepted"
                );
            }
        }

        SubmitReport {
            outcomes,
            bundles_sent,
            failure: None,
        }
    }
}

/// Split graphs into consecutive ranges of at most `max_objects` objects.
/// A graph larger than the limit gets a bundle of its own.
fn plan_bundles(graphs: &[EntityGraph], max_objects: usize) -> Vec<Range<usize>> {
    let mut ranges = vec![];
    let mut start = 0;
    let mut objects = 0;

    for (i, graph) in graphs.iter().enumerate() {
        let size = graph.object_count();
        if i > start && objects + size > max_objects {
            ranges.push(start..i);
            start = i;
            objects = 0;
        }
        objects += size;
    }
    if start < graphs.len() {
        ranges.push(start..graphs.len());
    }

    ranges
}

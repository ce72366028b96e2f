//! Shared test doubles

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::collectors::{FeedPage, FeedSource};
use crate::config::{MappingConfig, RetryPolicy};
use crate::mapping::{EntityGraph, EntityMapper, RunContext};
use crate::models::stix::StixBundle;
use crate::models::{CanonicalRecord, FileHash, HashAlgorithm, PackageId, RawAdvisory, RawHash};
use crate::retry::Permanent;
use crate::submit::{BundleAck, PlatformSink};

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        attempt_timeout: Duration::from_secs(1),
    }
}

pub fn run_context() -> RunContext {
    RunContext::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
}

/// An npm advisory for `name` carrying the given `(algorithm, digest)` pairs
pub fn record(name: &str, hashes: &[(&str, &str)]) -> RawAdvisory {
    RawAdvisory {
        id: Some(format!("MAL-{name}")),
        package: Some(name.to_string()),
        ecosystem: Some("npm".to_string()),
        version: Some("1.0.0".to_string()),
        summary: Some(format!("Malicious code in {name}")),
        details: None,
        advisory_url: Some(format!("https://osv.dev/vulnerability/MAL-{name}")),
        published: Some("2024-05-30T08:00:00Z".to_string()),
        hashes: Some(hashes.iter().map(|(alg, digest)| RawHash::new(alg, digest)).collect()),
        locator: format!("test:{name}"),
        parse_error: None,
    }
}

/// One per-hash graph (three objects) per sha256 digest
pub fn graphs_for(digests: &[&str]) -> Vec<EntityGraph> {
    let record = CanonicalRecord {
        advisory_id: "MAL-TEST".to_string(),
        package: PackageId {
            ecosystem: "npm".to_string(),
            name: "left-pad-evil".to_string(),
            version: None,
        },
        summary: "Malicious code in left-pad-evil".to_string(),
        hashes: digests
            .iter()
            .map(|d| FileHash {
                algorithm: HashAlgorithm::Sha256,
                value: d.to_string(),
            })
            .collect(),
        advisory_url: None,
        published: None,
    };
    EntityMapper::new(MappingConfig::default()).map(&record, &run_context())
}

/// In-memory feed with injectable failures
#[derive(Default)]
pub struct MemoryFeed {
    records: Vec<RawAdvisory>,
    fail_first: AtomicU32,
    fail_at: Mutex<Option<u64>>,
    page_cap: Option<usize>,
    prepared: Mutex<Vec<u64>>,
    calls: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(records: Vec<RawAdvisory>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Fail the first `n` page requests
    pub fn failing(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every request for the page at `offset` until healed
    pub fn failing_at(self, offset: u64) -> Self {
        *self.fail_at.lock().unwrap() = Some(offset);
        self
    }

    /// Serve at most `n` records per page, like a server capping `limit`
    pub fn capped(mut self, n: usize) -> Self {
        self.page_cap = Some(n);
        self
    }

    pub fn heal(&self) {
        *self.fail_at.lock().unwrap() = None;
    }

    /// Start offsets passed to `prepare`, one per run
    pub fn prepared(&self) -> Vec<u64> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for MemoryFeed {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn prepare(&self, start_offset: u64) -> Result<()> {
        self.prepared.lock().unwrap().push(start_offset);
        Ok(())
    }

    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<FeedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("503 Service Unavailable");
        }
        if *self.fail_at.lock().unwrap() == Some(offset) {
            anyhow::bail!("connection reset at offset {offset}");
        }

        let limit = self.page_cap.map_or(limit, |cap| cap.min(limit));
        let start = (offset as usize).min(self.records.len());
        let end = (start + limit).min(self.records.len());
        Ok(FeedPage {
            records: self.records[start..end].to_vec(),
            exhausted: end == self.records.len(),
            has_more: end < self.records.len(),
        })
    }
}

/// Sink that keeps every accepted bundle
#[derive(Default)]
pub struct RecordingSink {
    bundles: Mutex<Vec<StixBundle>>,
    fail_after: Mutex<Option<usize>>,
}

impl RecordingSink {
    /// Accept `n` bundles, then refuse everything until healed
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Mutex::new(Some(n)),
            ..Default::default()
        }
    }

    pub fn heal(&self) {
        *self.fail_after.lock().unwrap() = None;
    }

    pub fn bundles(&self) -> Vec<StixBundle> {
        self.bundles.lock().unwrap().clone()
    }

    pub fn object_count(&self) -> usize {
        self.bundles.lock().unwrap().iter().map(|b| b.objects.len()).sum()
    }
}

#[async_trait]
impl PlatformSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send_bundle(&self, bundle: &StixBundle) -> Result<BundleAck> {
        let mut bundles = self.bundles.lock().unwrap();
        if matches!(*self.fail_after.lock().unwrap(), Some(n) if bundles.len() >= n) {
            return Err(Permanent::err("platform refused bundle"));
        }
        bundles.push(bundle.clone());
        Ok(BundleAck::All)
    }
}

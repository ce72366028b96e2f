//! malpkg-intel
//!
//! Ingests malicious-package advisories and publishes them as STIX
//! indicators, file observables and based-on relationships.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{Mutex, MutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

mod collectors;
mod config;
mod error;
mod mapping;
mod models;
mod normalize;
mod pipeline;
mod retry;
mod storage;
mod submit;
#[cfg(test)]
mod testing;

use collectors::FeedSource;
use collectors::http::HttpFeedSource;
use collectors::osv_dir::OsvDirectorySource;
use config::{IndicatorPolicy, IngestConfig, MappingConfig, RetryPolicy};
use models::{HashAlgorithm, Tlp};
use pipeline::{CancelFlag, Pipeline};
use storage::SqliteStateStore;
use submit::PlatformSink;
use submit::file::FileSink;
use submit::http::HttpPlatformSink;

/// malpkg-intel
#[derive(Parser, Debug)]
#[command(name = "malpkg-intel")]
#[command(about = "Ingest malicious-package advisories into a STIX threat intelligence platform")]
struct Args {
    /// Paginated JSON advisory feed (`?offset=&limit=`)
    #[arg(long, env = "FEED_URL", conflicts_with = "osv_dir", required_unless_present = "osv_dir")]
    feed_url: Option<Url>,

    /// Local checkout of the OSV malicious-packages repository
    #[arg(long, env = "OSV_DIR")]
    osv_dir: Option<PathBuf>,

    /// Base URL advisory links are built from when reading a checkout
    #[arg(long, env = "OSV_BLOB_BASE")]
    osv_blob_base: Option<String>,

    /// Clone or update --osv-dir from this repository before each sweep
    #[arg(long, env = "OSV_REPO_URL", requires = "osv_dir")]
    osv_repo_url: Option<String>,

    /// Branch of --osv-repo-url to track
    #[arg(long, env = "OSV_BRANCH", default_value = "main")]
    osv_branch: String,

    /// Platform bundle import endpoint
    #[arg(long, env = "PLATFORM_URL", conflicts_with = "bundle_dir", required_unless_present = "bundle_dir")]
    platform_url: Option<Url>,

    /// Platform API token
    #[arg(long, env = "PLATFORM_TOKEN", hide_env_values = true)]
    platform_token: Option<String>,

    /// Write bundles to this directory instead of a platform
    #[arg(long, env = "BUNDLE_DIR")]
    bundle_dir: Option<PathBuf>,

    /// State database URL
    #[arg(long, env = "STATE_DB", default_value = "sqlite://malpkg-state.db")]
    state_db: String,

    /// Records per chunk
    #[arg(long, env = "CHUNK_SIZE", default_value_t = config::DEFAULT_CHUNK_SIZE)]
    chunk_size: u32,

    /// Hash algorithms to emit indicators for
    #[arg(long, env = "HASH_ALGORITHMS", value_enum, value_delimiter = ',', default_value = "sha256")]
    hash_algorithms: Vec<HashAlgorithm>,

    /// Indicator confidence (0-100)
    #[arg(long, env = "CONFIDENCE", default_value_t = config::DEFAULT_CONFIDENCE)]
    confidence: u8,

    /// TLP marking applied to every object
    #[arg(long, env = "MARKING", value_enum, default_value = "clear")]
    marking: Tlp,

    /// One indicator per hash, or one per record
    #[arg(long, env = "INDICATOR_POLICY", value_enum, default_value = "per-hash")]
    indicator_policy: IndicatorPolicy,

    /// External reference source name
    #[arg(long, env = "SOURCE_NAME", default_value = config::DEFAULT_SOURCE_NAME)]
    source_name: String,

    /// Maximum description length in characters
    #[arg(long, env = "SUMMARY_MAX_LEN", default_value_t = config::DEFAULT_SUMMARY_MAX_LEN)]
    summary_max_len: u32,

    /// Maximum objects per submitted bundle
    #[arg(long, env = "BUNDLE_MAX_OBJECTS", default_value_t = config::DEFAULT_BUNDLE_MAX_OBJECTS)]
    bundle_max_objects: u32,

    /// Bundles submitted per second
    #[arg(long, env = "SUBMIT_RATE", default_value = "10")]
    submit_rate: u32,

    /// Attempts per chunk fetch
    #[arg(long, env = "FETCH_ATTEMPTS", default_value = "4")]
    fetch_attempts: u32,

    /// Attempts per bundle submission
    #[arg(long, env = "SUBMIT_ATTEMPTS", default_value = "4")]
    submit_attempts: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "60")]
    request_timeout_secs: u64,

    /// First retry delay in milliseconds; doubles per attempt
    #[arg(long, env = "RETRY_BASE_MS", default_value = "500")]
    retry_base_ms: u64,

    /// Upper bound on the retry delay in seconds
    #[arg(long, env = "RETRY_MAX_SECS", default_value = "30")]
    retry_max_secs: u64,

    /// Normalize/map workers per chunk (0 = one per CPU)
    #[arg(long, env = "WORKERS", default_value = "0")]
    workers: usize,

    /// Restart from offset 0 when the checkpoint is corrupt
    #[arg(long, env = "RESET_ON_CORRUPTION", default_value = "false")]
    reset_on_corruption: bool,

    /// Cron expression (with seconds) to run on a schedule instead of once
    #[arg(long, env = "SCHEDULE")]
    schedule: Option<String>,

    /// Expose Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,
}

impl Args {
    fn retry(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_secs(self.retry_max_secs),
            attempt_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    fn ingest_config(&self) -> Result<IngestConfig> {
        let config = IngestConfig {
            chunk_size: self.chunk_size,
            hash_algorithms: self.hash_algorithms.clone(),
            summary_max_len: self.summary_max_len,
            mapping: MappingConfig {
                confidence: self.confidence,
                marking: self.marking,
                policy: self.indicator_policy,
                source_name: self.source_name.clone(),
            },
            bundle_max_objects: self.bundle_max_objects,
            submit_rate_per_sec: self.submit_rate,
            workers: self.workers,
            fetch_retry: self.retry(self.fetch_attempts),
            submit_retry: self.retry(self.submit_attempts),
            reset_on_corruption: self.reset_on_corruption,
        };
        Ok(config.validated()?)
    }

    fn feed_source(&self) -> Result<Arc<dyn FeedSource>> {
        if let Some(dir) = &self.osv_dir {
            tracing::info!(path = %dir.display(), "Reading advisories from OSV checkout");
            let mut source = OsvDirectorySource::new(dir.clone(), self.osv_blob_base.clone());
            if let Some(repo) = &self.osv_repo_url {
                tracing::info!(%repo, branch = %self.osv_branch, "Tracking advisory repository");
                source = source.with_repo(repo.clone(), self.osv_branch.clone());
            }
            return Ok(Arc::new(source));
        }

        let url = self.feed_url.clone().context("Either --feed-url or --osv-dir is required")?;
        tracing::info!(%url, "Reading advisories from HTTP feed");
        Ok(Arc::new(HttpFeedSource::new(url, Duration::from_secs(self.request_timeout_secs))?))
    }

    async fn platform_sink(&self) -> Result<Arc<dyn PlatformSink>> {
        if let Some(dir) = &self.bundle_dir {
            let sink = FileSink::new(dir.clone()).await?;
            tracing::info!(path = %sink.dir().display(), "Writing bundles to directory");
            return Ok(Arc::new(sink));
        }

        let url = self
            .platform_url
            .clone()
            .context("Either --platform-url or --bundle-dir is required")?;
        if self.platform_token.is_none() {
            tracing::warn!("No platform token configured");
        }
        tracing::info!(%url, "Submitting bundles to platform");
        Ok(Arc::new(HttpPlatformSink::new(
            url,
            self.platform_token.clone(),
            Duration::from_secs(self.request_timeout_secs),
        )?))
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "malpkg_intel=info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting malpkg-intel");

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        tracing::info!("Metrics on http://{}/metrics", addr);
    }

    let config = args.ingest_config()?;

    let store = Arc::new(
        SqliteStateStore::new(&args.state_db)
            .await
            .context("Failed to open state database")?,
    );
    tracing::info!(keys = store.seen_count().await?, "Opened state database");

    let cancel = CancelFlag::new();
    let pipeline = Arc::new(
        Pipeline::new(config, args.feed_source()?, store, args.platform_sink().await?)
            .with_cancel_flag(cancel.clone()),
    );

    match args.schedule {
        None => {
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping after the current chunk");
                    flag.cancel();
                }
            });

            let report = pipeline.run().await;
            match report.error {
                None => Ok(()),
                Some(e) => Err(anyhow::Error::new(e).context("Ingestion run failed")),
            }
        }
        Some(schedule) => run_scheduled(pipeline, &schedule, cancel).await,
    }
}

async fn run_scheduled(pipeline: Arc<Pipeline>, schedule: &str, cancel: CancelFlag) -> Result<()> {
    let busy = Arc::new(Mutex::new(()));
    let running = Arc::clone(&busy);
    let mut scheduler = JobScheduler::new().await.context("Failed to create scheduler")?;

    let job = Job::new_async(schedule, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let busy = Arc::clone(&busy);
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                tracing::warn!("Previous run still in progress, skipping this tick");
                return;
            };
            let report = pipeline.run().await;
            if let Some(e) = report.error {
                tracing::error!(error = %e, "Scheduled run failed");
            }
        })
    })
    .with_context(|| format!("Invalid schedule {schedule}"))?;

    scheduler.add(job).await.context("Failed to add scheduled job")?;
    scheduler.start().await.context("Failed to start scheduler")?;
    tracing::info!(schedule, "Scheduler started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down scheduler");
    cancel.cancel();

    // Held through shutdown so no new tick starts a run
    let _idle = wait_for_idle(&running).await;
    scheduler.shutdown().await.context("Failed to stop scheduler")?;
    Ok(())
}

/// Wait for an in-flight run to reach its next cancellation point
async fn wait_for_idle(busy: &Mutex<()>) -> MutexGuard<'_, ()> {
    if let Ok(guard) = busy.try_lock() {
        return guard;
    }
    tracing::info!("Waiting for the current run to stop");
    busy.lock().await
}

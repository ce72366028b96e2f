//! OSSF malicious-packages checkout reader
//! Walks `osv/malicious/**.json` in a local clone and reads OSV documents

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::collectors::git::GitCheckout;
use crate::collectors::{FeedPage, FeedSource};
use crate::models::{RawAdvisory, RawHash};

const MALICIOUS_SUBDIR: &str = "osv/malicious";
const ORIGINS_KEY: &str = "malicious-packages-origins";
const ORIGIN_HASH_KEYS: &[&str] = &["sha256", "sha1", "md5", "sha512"];
const READ_CONCURRENCY: usize = 32;

#[derive(Debug, Deserialize)]
struct OsvDocument {
    id: Option<String>,
    summary: Option<String>,
    details: Option<String>,
    published: Option<String>,
    #[serde(default)]
    affected: Vec<OsvAffected>,
    #[serde(default)]
    references: Vec<OsvReference>,
    database_specific: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OsvAffected {
    package: Option<OsvPackage>,
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OsvPackage {
    ecosystem: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsvReference {
    url: Option<String>,
}

/// Files of one sweep, plus the commit they were listed at
#[derive(Debug)]
struct Snapshot {
    files: Vec<PathBuf>,
    commit: Option<String>,
}

/// Feed source over a local checkout of the malicious-packages repository
pub struct OsvDirectorySource {
    root: PathBuf,
    blob_base: Option<String>,
    repo: Option<GitCheckout>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl OsvDirectorySource {
    /// `blob_base` is prepended to each file's relative path to build the
    /// advisory URL, e.g. `https://github.com/ossf/malicious-packages/blob/main`
    pub fn new(root: PathBuf, blob_base: Option<String>) -> Self {
        Self {
            root,
            blob_base: blob_base.map(|b| b.trim_end_matches('/').to_string()),
            repo: None,
            snapshot: RwLock::new(None),
        }
    }

    /// Keep `root` as a clone of `remote`, synced at the start of every
    /// sweep. Advisory URLs then point at the checked-out commit.
    pub fn with_repo(mut self, remote: String, branch: String) -> Self {
        self.repo = Some(GitCheckout::new(self.root.clone(), remote, branch));
        self
    }

    async fn load_snapshot(&self) -> Result<Arc<Snapshot>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || list_advisory_files(&root))
            .await
            .context("Advisory listing task failed")??;

        let commit = match &self.repo {
            Some(repo) => Some(repo.head().await?),
            None => None,
        };
        if let Some(commit) = &commit {
            tracing::info!(%commit, files = files.len(), "Advisory checkout pinned");
        }
        Ok(Arc::new(Snapshot { files, commit }))
    }

    /// Listing for the current sweep, taken lazily if `prepare` was skipped
    async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut slot = self.snapshot.write().await;
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = self.load_snapshot().await?;
        *slot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn to_advisory(&self, commit: Option<&str>, locator: String, doc: OsvDocument) -> RawAdvisory {
        let affected = doc.affected.first();
        let package = affected.and_then(|a| a.package.as_ref());

        let advisory_url = match (&self.repo, commit, &self.blob_base) {
            (Some(repo), Some(commit), _) => Some(repo.blob_url(commit, &locator)),
            (_, _, Some(base)) => Some(format!("{base}/{locator}")),
            _ => doc.references.iter().find_map(|r| r.url.clone()),
        };

        RawAdvisory {
            id: doc.id,
            package: package.and_then(|p| p.name.clone()),
            ecosystem: package.and_then(|p| p.ecosystem.clone()),
            version: affected.and_then(|a| a.versions.first().cloned()),
            summary: doc.summary,
            details: doc.details,
            advisory_url,
            published: doc.published,
            hashes: Some(origin_hashes(doc.database_specific.as_ref())),
            locator,
            parse_error: None,
        }
    }
}

fn list_advisory_files(root: &Path) -> Result<Vec<PathBuf>> {
    let malicious = root.join(MALICIOUS_SUBDIR);
    let base = if malicious.is_dir() { malicious } else { root.to_path_buf() };

    if !base.is_dir() {
        anyhow::bail!("Advisory directory not found: {}", base.display());
    }

    let mut files = vec![];
    for entry in WalkDir::new(&base) {
        let entry = entry.with_context(|| format!("Failed to walk {}", base.display()))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("json")
        {
            files.push(entry.into_path());
        }
    }

    files.sort();
    tracing::info!(root = %base.display(), files = files.len(), "Listed advisory files");
    Ok(files)
}

/// Collect every hash from `database_specific["malicious-packages-origins"]`
fn origin_hashes(database_specific: Option<&Value>) -> Vec<RawHash> {
    let Some(origins) = database_specific
        .and_then(|d| d.get(ORIGINS_KEY))
        .and_then(Value::as_array)
    else {
        return vec![];
    };

    let mut hashes = vec![];
    for origin in origins {
        for key in ORIGIN_HASH_KEYS {
            if let Some(digest) = origin.get(*key).and_then(Value::as_str) {
                hashes.push(RawHash::new(key, digest));
            }
        }
    }
    hashes
}

#[async_trait]
impl FeedSource for OsvDirectorySource {
    fn name(&self) -> &'static str {
        "osv_directory"
    }

    async fn prepare(&self, start_offset: u64) -> Result<()> {
        // A resumed sweep must see the same file list its offsets refer to
        if let (Some(repo), 0) = (&self.repo, start_offset) {
            repo.sync().await?;
        }
        let snapshot = self.load_snapshot().await?;
        *self.snapshot.write().await = Some(snapshot);
        Ok(())
    }

    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<FeedPage> {
        let snapshot = self.snapshot().await?;
        let files = &snapshot.files;
        let commit = snapshot.commit.as_deref();
        let start = (offset as usize).min(files.len());
        let end = start.saturating_add(limit).min(files.len());

        let records = stream::iter(files[start..end].to_vec())
            .map(|path: PathBuf| async move {
                let locator = self.relative_path(&path);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<OsvDocument>(&bytes) {
                        Ok(doc) => self.to_advisory(commit, locator, doc),
                        Err(e) => RawAdvisory::unreadable(locator, e),
                    },
                    Err(e) => RawAdvisory::unreadable(locator, e),
                }
            })
            .buffered(READ_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        Ok(FeedPage {
            records,
            exhausted: end >= files.len(),
            has_more: end < files.len(),
        })
    }
}

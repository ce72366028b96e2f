//! Directory sink for offline and dry runs

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::models::stix::StixBundle;
use crate::submit::{BundleAck, PlatformSink};

/// Writes every bundle to `<dir>/bundle-<digest>.json`, named by the hash
/// of its objects so that replaying the same graphs overwrites the same file.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create bundle directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn bundle_file_name(objects_json: &[u8]) -> String {
    let digest = Sha256::digest(objects_json);
    format!("bundle-{}.json", &hex::encode(digest)[..16])
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move bundle into place at {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl PlatformSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn send_bundle(&self, bundle: &StixBundle) -> Result<BundleAck> {
        let objects = serde_json::to_vec(&bundle.objects)?;
        let path = self.dir.join(bundle_file_name(&objects));
        let contents = serde_json::to_vec_pretty(bundle)?;

        write_atomic(&path, &contents).await?;
        tracing::debug!(path = %path.display(), objects = bundle.objects.len(), "Wrote bundle");

        Ok(BundleAck::All)
    }
}

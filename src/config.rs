//! Runtime configuration for an ingestion run

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::IngestResult;
use crate::models::{HashAlgorithm, Tlp};

pub const DEFAULT_CHUNK_SIZE: u32 = 5000;
pub const DEFAULT_CONFIDENCE: u8 = 50;
pub const DEFAULT_MARKING: Tlp = Tlp::Clear;
pub const DEFAULT_HASH_ALGORITHMS: &[HashAlgorithm] = &[HashAlgorithm::Sha256];
pub const DEFAULT_SUMMARY_MAX_LEN: u32 = 1024;
pub const DEFAULT_BUNDLE_MAX_OBJECTS: u32 = 5000;
pub const DEFAULT_SOURCE_NAME: &str = "ossf-malicious-packages";

/// How a record with several qualifying hashes becomes indicators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IndicatorPolicy {
    /// One indicator, observable and relationship per hash
    #[default]
    PerHash,
    /// One indicator per record, based on every hash observable
    PerRecord,
}

/// Bounded retry with exponential backoff and a per-attempt timeout
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryPolicy {
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Settings that govern mapping output
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MappingConfig {
    #[validate(range(max = 100))]
    pub confidence: u8,
    pub marking: Tlp,
    pub policy: IndicatorPolicy,
    #[validate(length(min = 1))]
    pub source_name: String,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            marking: DEFAULT_MARKING,
            policy: IndicatorPolicy::default(),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestConfig {
    #[validate(range(min = 1, max = 100000))]
    pub chunk_size: u32,
    #[validate(length(min = 1))]
    pub hash_algorithms: Vec<HashAlgorithm>,
    #[validate(range(min = 16))]
    pub summary_max_len: u32,
    #[validate]
    pub mapping: MappingConfig,
    #[validate(range(min = 3))]
    pub bundle_max_objects: u32,
    #[validate(range(min = 1))]
    pub submit_rate_per_sec: u32,
    /// Worker count for per-chunk normalize/map; 0 means one per CPU
    pub workers: usize,
    #[validate]
    pub fetch_retry: RetryPolicy,
    #[validate]
    pub submit_retry: RetryPolicy,
    /// Restart at offset 0 instead of aborting when the checkpoint is corrupt
    pub reset_on_corruption: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_algorithms: DEFAULT_HASH_ALGORITHMS.to_vec(),
            summary_max_len: DEFAULT_SUMMARY_MAX_LEN,
            mapping: MappingConfig::default(),
            bundle_max_objects: DEFAULT_BUNDLE_MAX_OBJECTS,
            submit_rate_per_sec: 10,
            workers: 0,
            fetch_retry: RetryPolicy::default(),
            submit_retry: RetryPolicy::default(),
            reset_on_corruption: false,
        }
    }
}

impl IngestConfig {
    pub fn validated(self) -> IngestResult<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default().validated().unwrap();
        assert_eq!(config.chunk_size, 5000);
        assert_eq!(config.mapping.confidence, 50);
        assert_eq!(config.mapping.marking, Tlp::Clear);
        assert_eq!(config.hash_algorithms, vec![HashAlgorithm::Sha256]);
        assert_eq!(config.mapping.policy, IndicatorPolicy::PerHash);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = IngestConfig::default();
        config.mapping.confidence = 101;
        assert!(config.validated().is_err());

        let mut config = IngestConfig::default();
        config.hash_algorithms.clear();
        assert!(config.validated().is_err());

        let mut config = IngestConfig::default();
        config.chunk_size = 0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }
}

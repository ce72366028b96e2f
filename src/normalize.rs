//! Record normalization: raw advisory -> canonical record

use std::collections::HashSet;

use url::Url;

use crate::models::hashes::{normalize_digest, parse_timestamp, truncate_text};
use crate::models::{CanonicalRecord, FileHash, HashAlgorithm, PackageId, RawAdvisory};

const FALLBACK_SUMMARY: &str = "Malicious package";
const UNKNOWN_ECOSYSTEM: &str = "unknown";

/// Why a record produced no canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unparseable(String),
    MissingPackageName,
    MissingHashList,
    /// Not malformed: the record simply has nothing we target
    NoQualifyingHashes,
}

impl SkipReason {
    pub fn is_malformed(&self) -> bool {
        !matches!(self, SkipReason::NoQualifyingHashes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Unparseable(_) => "unparseable",
            SkipReason::MissingPackageName => "missing_package_name",
            SkipReason::MissingHashList => "missing_hash_list",
            SkipReason::NoQualifyingHashes => "no_qualifying_hashes",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unparseable(e) => write!(f, "unparseable: {e}"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(CanonicalRecord),
    Skip(SkipReason),
}

/// Turns raw advisories into canonical records for a fixed algorithm set
#[derive(Debug, Clone)]
pub struct Normalizer {
    algorithms: HashSet<HashAlgorithm>,
    summary_max_len: usize,
}

impl Normalizer {
    pub fn new(algorithms: &[HashAlgorithm], summary_max_len: usize) -> Self {
        Self {
            algorithms: algorithms.iter().copied().collect(),
            summary_max_len,
        }
    }

    pub fn normalize(&self, raw: &RawAdvisory) -> Normalized {
        if let Some(err) = &raw.parse_error {
            return Normalized::Skip(SkipReason::Unparseable(err.clone()));
        }

        let Some(name) = non_blank(raw.package.as_deref()) else {
            return Normalized::Skip(SkipReason::MissingPackageName);
        };

        let Some(entries) = &raw.hashes else {
            return Normalized::Skip(SkipReason::MissingHashList);
        };

        let mut seen = HashSet::new();
        let mut hashes = vec![];
        for entry in entries {
            let Some(algorithm) = entry.algorithm.as_deref().and_then(HashAlgorithm::from_tag) else {
                continue;
            };
            if !self.algorithms.contains(&algorithm) {
                continue;
            }
            let Some(value) = entry.digest.as_deref().and_then(normalize_digest) else {
                tracing::debug!(locator = %raw.locator, %algorithm, "Dropping invalid digest");
                continue;
            };
            let hash = FileHash { algorithm, value };
            if seen.insert(hash.clone()) {
                hashes.push(hash);
            }
        }

        if hashes.is_empty() {
            return Normalized::Skip(SkipReason::NoQualifyingHashes);
        }

        let ecosystem = non_blank(raw.ecosystem.as_deref())
            .unwrap_or(UNKNOWN_ECOSYSTEM)
            .to_string();

        let summary = non_blank(raw.summary.as_deref())
            .or_else(|| non_blank(raw.details.as_deref()))
            .unwrap_or(FALLBACK_SUMMARY);

        let advisory_url = non_blank(raw.advisory_url.as_deref()).and_then(|u| match Url::parse(u) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                tracing::debug!(locator = %raw.locator, url = u, error = %e, "Ignoring invalid advisory URL");
                None
            }
        });

        let published = raw.published.as_deref().and_then(parse_timestamp);

        let advisory_id = non_blank(raw.id.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{ecosystem}/{name}"));

        Normalized::Record(CanonicalRecord {
            advisory_id,
            package: PackageId {
                ecosystem,
                name: name.to_string(),
                version: non_blank(raw.version.as_deref()).map(str::to_string),
            },
            summary: truncate_text(summary, self.summary_max_len),
            hashes,
            advisory_url,
            published,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawHash;
    use crate::testing::record;

    fn sha256_only() -> Normalizer {
        Normalizer::new(&[HashAlgorithm::Sha256], 64)
    }

    fn expect_record(n: Normalized) -> CanonicalRecord {
        match n {
            Normalized::Record(r) => r,
            Normalized::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn test_keeps_only_targeted_algorithm() {
        let raw = record("left-pad-evil", &[("sha256", "ABC123"), ("md5", "deadbeef")]);
        let canonical = expect_record(sha256_only().normalize(&raw));

        assert_eq!(canonical.package.name, "left-pad-evil");
        assert_eq!(
            canonical.hashes,
            vec![FileHash {
                algorithm: HashAlgorithm::Sha256,
                value: "abc123".to_string()
            }]
        );
    }

    #[test]
    fn test_non_targeted_only_record_is_skipped() {
        let raw = record("md5-only", &[("md5", "deadbeef")]);
        assert_eq!(
            sha256_only().normalize(&raw),
            Normalized::Skip(SkipReason::NoQualifyingHashes)
        );
        assert!(!SkipReason::NoQualifyingHashes.is_malformed());
    }

    #[test]
    fn test_widened_algorithm_set() {
        let raw = record("pkg", &[("sha256", "aa"), ("SHA-1", "bb"), ("md5", "cc")]);
        let normalizer = Normalizer::new(&[HashAlgorithm::Sha256, HashAlgorithm::Sha1], 64);
        let canonical = expect_record(normalizer.normalize(&raw));
        let algorithms: Vec<_> = canonical.hashes.iter().map(|h| h.algorithm).collect();
        assert_eq!(algorithms, vec![HashAlgorithm::Sha256, HashAlgorithm::Sha1]);
    }

    #[test]
    fn test_malformed_records() {
        let mut raw = record("  ", &[("sha256", "aa")]);
        assert_eq!(
            sha256_only().normalize(&raw),
            Normalized::Skip(SkipReason::MissingPackageName)
        );

        raw.package = Some("pkg".to_string());
        raw.hashes = None;
        assert_eq!(
            sha256_only().normalize(&raw),
            Normalized::Skip(SkipReason::MissingHashList)
        );

        let raw = RawAdvisory::unreadable("offset:3".to_string(), "expected object");
        let skipped = sha256_only().normalize(&raw);
        assert!(matches!(skipped, Normalized::Skip(SkipReason::Unparseable(_))));
    }

    #[test]
    fn test_duplicate_and_invalid_digests_are_dropped() {
        let mut raw = record("pkg", &[("sha256", "aa"), ("sha256", "AA"), ("sha256", "zz")]);
        raw.hashes.as_mut().unwrap().push(RawHash::default());
        let canonical = expect_record(sha256_only().normalize(&raw));
        assert_eq!(canonical.hashes.len(), 1);
    }

    #[test]
    fn test_fills_defaults_and_normalizes_fields() {
        let mut raw = record("pkg", &[("sha256", "aa")]);
        raw.id = None;
        raw.ecosystem = None;
        raw.summary = Some(" ".to_string());
        raw.details = Some("Exfiltrates tokens to a remote host on install and then deletes itself".to_string());
        raw.advisory_url = Some("not a url".to_string());
        raw.published = Some("2024-02-03T04:05:06+01:00".to_string());

        let canonical = expect_record(sha256_only().normalize(&raw));
        assert_eq!(canonical.advisory_id, "unknown/pkg");
        assert_eq!(canonical.package.ecosystem, "unknown");
        assert!(canonical.summary.starts_with("Exfiltrates tokens"));
        assert!(canonical.summary.chars().count() <= 64);
        assert_eq!(canonical.advisory_url, None);
        assert_eq!(
            canonical.published.map(|p| p.to_rfc3339()),
            Some("2024-02-03T03:05:06+00:00".to_string())
        );
    }

    #[test]
    fn test_missing_summary_uses_fallback() {
        let mut raw = record("pkg", &[("sha256", "aa")]);
        raw.summary = None;
        raw.details = None;
        let canonical = expect_record(sha256_only().normalize(&raw));
        assert_eq!(canonical.summary, "Malicious package");
    }
}

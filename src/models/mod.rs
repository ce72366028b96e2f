//! Core data models for malicious-package advisories

pub mod hashes;
pub mod stix;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hash algorithms an advisory may carry
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parse a feed tag such as `sha256`, `SHA-256` or `sha_256`
    pub fn from_tag(tag: &str) -> Option<Self> {
        let folded: String = tag
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();

        match folded.as_str() {
            "md5" => Some(HashAlgorithm::Md5),
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Hash name as used in STIX `hashes` dictionaries and patterns
    pub fn stix_name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Traffic light protocol marking applied to every emitted object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Tlp {
    #[value(alias = "white")]
    Clear,
    Green,
    Amber,
    AmberStrict,
    Red,
}

impl Tlp {
    /// Well-known STIX marking-definition id for this level
    pub fn marking_ref(&self) -> &'static str {
        match self {
            Tlp::Clear => "marking-definition--613f2e26-407d-48c7-9eca-b8e91df99dc9",
            Tlp::Green => "marking-definition--34098fce-860f-48ae-8e50-ebd3cc5e41da",
            Tlp::Amber => "marking-definition--f88d31f6-486f-44da-b317-01333bde1b82",
            Tlp::AmberStrict => "marking-definition--826578e1-40ad-459f-bc73-ede076f81f37",
            Tlp::Red => "marking-definition--5e57c739-391a-4eb3-b6be-7d15ca92d5ed",
        }
    }
}

impl std::fmt::Display for Tlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tlp::Clear => write!(f, "TLP:CLEAR"),
            Tlp::Green => write!(f, "TLP:GREEN"),
            Tlp::Amber => write!(f, "TLP:AMBER"),
            Tlp::AmberStrict => write!(f, "TLP:AMBER+STRICT"),
            Tlp::Red => write!(f, "TLP:RED"),
        }
    }
}

/// Cross-run dedup key: one hash algorithm plus one digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl NaturalKey {
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// One hash entry as published upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawHash {
    #[serde(default, alias = "type")]
    pub algorithm: Option<String>,
    #[serde(default, alias = "value")]
    pub digest: Option<String>,
}

impl RawHash {
    pub fn new(algorithm: &str, digest: &str) -> Self {
        Self {
            algorithm: Some(algorithm.to_string()),
            digest: Some(digest.to_string()),
        }
    }
}

/// Upstream advisory record, as fetched
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawAdvisory {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "package_name", alias = "name")]
    pub package: Option<String>,
    #[serde(default)]
    pub ecosystem: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default, alias = "url")]
    pub advisory_url: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub hashes: Option<Vec<RawHash>>,

    /// Where the record came from (file path or feed offset)
    #[serde(skip)]
    pub locator: String,
    /// Decode failure, if the upstream value could not be read
    #[serde(skip)]
    pub parse_error: Option<String>,
}

impl RawAdvisory {
    /// Decode one feed value. Undecodable values still yield a record so that
    /// the normalizer can report them without failing the whole chunk.
    pub fn from_value(locator: String, value: serde_json::Value) -> Self {
        match serde_json::from_value::<RawAdvisory>(value) {
            Ok(mut advisory) => {
                advisory.locator = locator;
                advisory
            }
            Err(e) => RawAdvisory {
                locator,
                parse_error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn unreadable(locator: String, error: impl std::fmt::Display) -> Self {
        RawAdvisory {
            locator,
            parse_error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Package identity of an advisory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageId {
    pub ecosystem: String,
    pub name: String,
    pub version: Option<String>,
}

/// A normalized (algorithm, lower-case hex) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl FileHash {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.algorithm, self.value.clone())
    }
}

/// Normalized advisory, ready for mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub advisory_id: String,
    pub package: PackageId,
    pub summary: String,
    pub hashes: Vec<FileHash>,
    pub advisory_url: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

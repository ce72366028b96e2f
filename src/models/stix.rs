//! STIX 2.1 objects emitted to the target platform
//!
//! Identifiers are UUIDv5 over the canonical JSON of each object's
//! id-contributing properties, so the platform can upsert on them.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::HashAlgorithm;

/// Namespace shared with the platform for deterministic ids
pub const STIX_ID_NAMESPACE: Uuid = Uuid::from_u128(0x00abedb4_aa42_466c_9c01_fed23315a9b7);

pub const SPEC_VERSION: &str = "2.1";

pub const BASED_ON: &str = "based-on";

fn deterministic_id(object_type: &str, contributing: &BTreeMap<&str, Value>) -> String {
    // BTreeMap serializes with sorted keys and no whitespace
    let canonical = serde_json::to_string(contributing).unwrap_or_default();
    format!(
        "{}--{}",
        object_type,
        Uuid::new_v5(&STIX_ID_NAMESPACE, canonical.as_bytes())
    )
}

/// Deterministic id for a file observable
pub fn file_id(name: &str, hashes: &BTreeMap<String, String>) -> String {
    let mut contributing = BTreeMap::new();
    contributing.insert("hashes", serde_json::to_value(hashes).unwrap_or(Value::Null));
    contributing.insert("name", Value::String(name.to_string()));
    deterministic_id("file", &contributing)
}

/// Deterministic id for an indicator
pub fn indicator_id(pattern: &str) -> String {
    let mut contributing = BTreeMap::new();
    contributing.insert("pattern", Value::String(pattern.trim().to_string()));
    deterministic_id("indicator", &contributing)
}

/// Deterministic id for a relationship
pub fn relationship_id(relationship_type: &str, source_ref: &str, target_ref: &str) -> String {
    let mut contributing = BTreeMap::new();
    contributing.insert("relationship_type", Value::String(relationship_type.to_string()));
    contributing.insert("source_ref", Value::String(source_ref.to_string()));
    contributing.insert("target_ref", Value::String(target_ref.to_string()));
    deterministic_id("relationship", &contributing)
}

/// STIX comparison expression matching one file hash
pub fn hash_pattern(algorithm: HashAlgorithm, value: &str) -> String {
    format!("[file:hashes.'{}' = '{}']", algorithm.stix_name(), value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalReference {
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// File cyber-observable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileObservable {
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub spec_version: &'static str,
    pub id: String,
    pub name: String,
    pub hashes: BTreeMap<String, String>,
    pub object_marking_refs: Vec<String>,
    pub x_opencti_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Indicator {
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub spec_version: &'static str,
    pub id: String,
    pub created: String,
    pub modified: String,
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub pattern_type: &'static str,
    pub valid_from: String,
    pub confidence: u8,
    pub labels: Vec<String>,
    pub external_references: Vec<ExternalReference>,
    pub object_marking_refs: Vec<String>,
    pub x_opencti_score: u8,
    pub x_opencti_main_observable_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub spec_version: &'static str,
    pub id: String,
    pub created: String,
    pub modified: String,
    pub relationship_type: &'static str,
    pub source_ref: String,
    pub target_ref: String,
    pub object_marking_refs: Vec<String>,
}

/// Any object that can appear in a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StixObject {
    File(FileObservable),
    Indicator(Indicator),
    Relationship(Relationship),
}

impl StixObject {
    pub fn id(&self) -> &str {
        match self {
            StixObject::File(o) => &o.id,
            StixObject::Indicator(o) => &o.id,
            StixObject::Relationship(o) => &o.id,
        }
    }
}

/// Bundle handed to the platform ingestion interface
#[derive(Debug, Clone, Serialize)]
pub struct StixBundle {
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub id: String,
    pub objects: Vec<StixObject>,
}

impl StixBundle {
    pub fn new(objects: Vec<StixObject>) -> Self {
        Self {
            object_type: "bundle",
            id: format!("bundle--{}", Uuid::new_v4()),
            objects,
        }
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(StixObject::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicator_id_is_stable() {
        let pattern = hash_pattern(HashAlgorithm::Sha256, "abc123");
        assert_eq!(pattern, "[file:hashes.'SHA-256' = 'abc123']");
        assert_eq!(indicator_id(&pattern), indicator_id(&pattern));
        assert!(indicator_id(&pattern).starts_with("indicator--"));
        assert_eq!(indicator_id(&pattern), indicator_id(&format!(" {pattern} ")));
    }

    #[test]
    fn test_file_id_depends_on_package_name() {
        let mut hashes = BTreeMap::new();
        hashes.insert("SHA-256".to_string(), "abc123".to_string());

        let a = file_id("left-pad-evil", &hashes);
        let b = file_id("right-pad-evil", &hashes);
        assert!(a.starts_with("file--"));
        assert_ne!(a, b);
        assert_eq!(a, file_id("left-pad-evil", &hashes));
    }

    #[test]
    fn test_non_ascii_name_is_hashed_as_raw_utf8() {
        let mut hashes = BTreeMap::new();
        hashes.insert("SHA-256".to_string(), "abc123".to_string());

        // JCS (RFC 8785) leaves non-ASCII unescaped
        let canonical = r#"{"hashes":{"SHA-256":"abc123"},"name":"paquete-ñ"}"#;
        assert_eq!(
            file_id("paquete-ñ", &hashes),
            format!("file--{}", Uuid::new_v5(&STIX_ID_NAMESPACE, canonical.as_bytes()))
        );
    }

    #[test]
    fn test_relationship_id_depends_on_endpoints() {
        let a = relationship_id(BASED_ON, "indicator--1", "file--1");
        let b = relationship_id(BASED_ON, "indicator--1", "file--2");
        assert!(a.starts_with("relationship--"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_bundle_serializes_type_field() {
        let bundle = StixBundle::new(vec![]);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["type"], "bundle");
        assert!(json["id"].as_str().unwrap().starts_with("bundle--"));
    }
}

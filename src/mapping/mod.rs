//! Entity mapping: canonical record -> STIX object graphs
//!
//! Mapping is pure. The same record and run context always produce the same
//! graphs, byte for byte, which is what lets the dedup filter work on keys
//! alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::{IndicatorPolicy, MappingConfig};
use crate::models::hashes::format_timestamp;
use crate::models::stix::{
    self, BASED_ON, ExternalReference, FileObservable, Indicator, Relationship, SPEC_VERSION,
    StixObject,
};
use crate::models::{CanonicalRecord, FileHash, NaturalKey, Tlp};

const MALICIOUS_PACKAGE_LABEL: &str = "malicious-package";

/// Per-run inputs to mapping
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_time: DateTime<Utc>,
}

impl RunContext {
    pub fn new(run_time: DateTime<Utc>) -> Self {
        Self { run_time }
    }
}

/// One indicator with the observables it is based on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGraph {
    /// Natural keys covered by this graph
    pub keys: Vec<NaturalKey>,
    pub indicator: Indicator,
    pub observables: Vec<FileObservable>,
    pub relationships: Vec<Relationship>,
    pub external_reference: ExternalReference,
    pub marking: Tlp,
}

impl EntityGraph {
    pub fn object_count(&self) -> usize {
        1 + self.observables.len() + self.relationships.len()
    }

    /// Objects in bundle order: observables, indicator, relationships
    pub fn objects(&self) -> Vec<StixObject> {
        let mut objects = Vec::with_capacity(self.object_count());
        objects.extend(self.observables.iter().cloned().map(StixObject::File));
        objects.push(StixObject::Indicator(self.indicator.clone()));
        objects.extend(self.relationships.iter().cloned().map(StixObject::Relationship));
        objects
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &str> {
        self.observables
            .iter()
            .map(|o| o.id.as_str())
            .chain(std::iter::once(self.indicator.id.as_str()))
            .chain(self.relationships.iter().map(|r| r.id.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct EntityMapper {
    config: MappingConfig,
}

impl EntityMapper {
    pub fn new(config: MappingConfig) -> Self {
        Self { config }
    }

    pub fn map(&self, record: &CanonicalRecord, ctx: &RunContext) -> Vec<EntityGraph> {
        if record.hashes.is_empty() {
            return vec![];
        }

        match self.config.policy {
            IndicatorPolicy::PerHash => record
                .hashes
                .iter()
                .map(|hash| self.build_graph(record, std::slice::from_ref(hash), ctx))
                .collect(),
            IndicatorPolicy::PerRecord => vec![self.build_graph(record, &record.hashes, ctx)],
        }
    }

    fn external_reference(&self, record: &CanonicalRecord) -> ExternalReference {
        ExternalReference {
            source_name: self.config.source_name.clone(),
            url: record.advisory_url.clone(),
            external_id: Some(record.advisory_id.clone()),
        }
    }

    fn observable(&self, record: &CanonicalRecord, hash: &FileHash) -> FileObservable {
        let mut hashes = BTreeMap::new();
        hashes.insert(hash.algorithm.stix_name().to_string(), hash.value.clone());

        FileObservable {
            object_type: "file",
            spec_version: SPEC_VERSION,
            id: stix::file_id(&record.package.name, &hashes),
            name: record.package.name.clone(),
            hashes,
            object_marking_refs: vec![self.config.marking.marking_ref().to_string()],
            x_opencti_description: record.summary.clone(),
        }
    }

    fn build_graph(&self, record: &CanonicalRecord, hashes: &[FileHash], ctx: &RunContext) -> EntityGraph {
        let timestamp = format_timestamp(&ctx.run_time);
        let marking_refs = vec![self.config.marking.marking_ref().to_string()];
        let external_reference = self.external_reference(record);

        let pattern = hashes
            .iter()
            .map(|h| stix::hash_pattern(h.algorithm, &h.value))
            .collect::<Vec<_>>()
            .join(" OR ");

        let indicator = Indicator {
            object_type: "indicator",
            spec_version: SPEC_VERSION,
            id: stix::indicator_id(&pattern),
            created: timestamp.clone(),
            modified: timestamp.clone(),
            name: record.package.name.clone(),
            description: record.summary.clone(),
            pattern,
            pattern_type: "stix",
            valid_from: timestamp.clone(),
            confidence: self.config.confidence,
            labels: vec![
                MALICIOUS_PACKAGE_LABEL.to_string(),
                record.package.ecosystem.to_lowercase(),
            ],
            external_references: vec![external_reference.clone()],
            object_marking_refs: marking_refs.clone(),
            x_opencti_score: self.config.confidence,
            x_opencti_main_observable_type: "StixFile",
        };

        let observables: Vec<FileObservable> =
            hashes.iter().map(|h| self.observable(record, h)).collect();

        let relationships = observables
            .iter()
            .map(|observable| Relationship {
                object_type: "relationship",
                spec_version: SPEC_VERSION,
                id: stix::relationship_id(BASED_ON, &indicator.id, &observable.id),
                created: timestamp.clone(),
                modified: timestamp.clone(),
                relationship_type: BASED_ON,
                source_ref: indicator.id.clone(),
                target_ref: observable.id.clone(),
                object_marking_refs: marking_refs.clone(),
            })
            .collect();

        EntityGraph {
            keys: hashes.iter().map(FileHash::natural_key).collect(),
            indicator,
            observables,
            relationships,
            external_reference,
            marking: self.config.marking,
        }
    }
}

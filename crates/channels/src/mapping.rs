//! Field mapping between a channel's record shape and canonical field names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connector::ExternalRecord;

/// Translation table: external field name -> canonical field name.
///
/// Keys without an entry pass through unchanged, so an empty mapping is the
/// identity. Nested canonical targets are not supported; mappings are flat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    entries: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, external: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.entries.insert(external.into(), canonical.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn canonical_name<'a>(&'a self, external: &'a str) -> &'a str {
        self.entries.get(external).map(String::as_str).unwrap_or(external)
    }

    pub fn external_name<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(_, c)| c.as_str() == canonical)
            .map(|(e, _)| e.as_str())
            .unwrap_or(canonical)
    }

    /// Rename an inbound record's keys to canonical names.
    pub fn to_canonical(&self, record: &ExternalRecord) -> Map<String, Value> {
        record
            .iter()
            .map(|(k, v)| (self.canonical_name(k).to_string(), v.clone()))
            .collect()
    }

    /// Rename canonical keys to the channel's external names.
    pub fn to_external(&self, canonical: &Map<String, Value>) -> ExternalRecord {
        canonical
            .iter()
            .map(|(k, v)| (self.external_name(k).to_string(), v.clone()))
            .collect()
    }
}

//! The last-applied state store.
//!
//! The store maps each logical resource name to the snapshot of inputs it
//! was last applied with, a fingerprint of that snapshot, and the outputs
//! the provider returned. The convergence engine consults it to turn
//! unchanged resources into no-ops and is its sole writer during a run.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StateError;
use crate::resource::{ResourceKind, Value};

/// Last-applied snapshot of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub kind: ResourceKind,
    pub inputs: BTreeMap<String, Value>,
    pub(crate) input_hash: Hash32,
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateStore {
    version: u32,
    resources: BTreeMap<String, Record>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            version: 1,
            resources: BTreeMap::new(),
        }
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the store from a JSON state file. A missing file is an empty
    /// store, so the first run of a fresh stack needs no setup.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, StateError> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Saves the store as pretty-printed JSON, creating parent directories
    /// as needed. Pretty output keeps converged-state diffs readable.
    pub fn save(&self, path: impl AsRef<Utf8Path>) -> Result<(), StateError> {
        let path = path.as_ref();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.resources.get(name)
    }

    pub(crate) fn put(&mut self, name: &str, record: Record) {
        self.resources.insert(name.to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Fingerprints a resolved input map. Serialization is canonical because
/// both the outer and any nested maps keep sorted keys.
pub(crate) fn fingerprint(inputs: &BTreeMap<String, Value>) -> Hash32 {
    let buffer = serde_json::to_vec(inputs).expect("resolved inputs serialize to JSON");
    Hash32::hash(buffer)
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(kind: ResourceKind, id: &str) -> Record {
        let inputs = BTreeMap::from([("cidr".to_string(), Value::from("10.0.0.0/16"))]);
        Record {
            kind,
            input_hash: fingerprint(&inputs),
            inputs,
            outputs: BTreeMap::from([("id".to_string(), Value::from(id))]),
        }
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = BTreeMap::from([("port".to_string(), Value::from(80))]);
        let b = BTreeMap::from([("port".to_string(), Value::from(80))]);
        let c = BTreeMap::from([("port".to_string(), Value::from(443))]);

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let store = StateStore::load("does/not/exist.json").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path())
            .unwrap()
            .join("state/deploy.json");

        let mut store = StateStore::new();
        store.put("net", record(ResourceKind::Network, "vpc-1"));
        store.put("cluster", record(ResourceKind::Cluster, "arn:cluster"));
        store.save(&path).unwrap();

        let loaded = StateStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);

        let net = loaded.get("net").unwrap();
        assert_eq!(net.kind, ResourceKind::Network);
        assert_eq!(net.input_hash, store.get("net").unwrap().input_hash);
        assert_eq!(net.outputs["id"], Value::from("vpc-1"));
    }
}

//! Named artifacts published by stages.
//!
//! A phase never writes into a stage's `Payload` directly. It fills a
//! `StagedPayload`, and the engine commits that in one step once the phase
//! has succeeded, so a failed phase publishes nothing.

use crate::data::UnitCell;
use crate::stage::Phase;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    File(PathBuf),
    Number(f64),
    Text(String),
    Cell(UnitCell),
}

impl Artifact {
    pub fn as_file(&self) -> Option<&Path> {
        match self {
            Artifact::File(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Artifact::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Artifact::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    phase: Phase,
    artifact: Artifact,
}

/// The committed artifacts of one stage, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    entries: IndexMap<String, Entry>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.entries.get(key).map(|e| &e.artifact)
    }

    pub fn file(&self, key: &str) -> Option<&Path> {
        self.get(key).and_then(Artifact::as_file)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Artifact::as_number)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.artifact))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace everything published by `phase` or any later phase with the
    /// contents of `staged`.
    pub fn commit(&mut self, phase: Phase, staged: StagedPayload) {
        self.entries.retain(|_, e| e.phase < phase);
        for (key, artifact) in staged.entries {
            self.entries.insert(key, Entry { phase, artifact });
        }
    }

    /// File artifacts whose path no longer exists.
    ///
    /// Advisory only: flags stay authoritative over on-disk state.
    pub fn missing_files(&self) -> Vec<(&str, &Path)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.artifact.as_file().map(|p| (k.as_str(), p)))
            .filter(|(_, p)| !p.exists())
            .collect()
    }
}

/// Artifacts produced by a phase that has not yet succeeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedPayload {
    entries: IndexMap<String, Artifact>,
}

impl StagedPayload {
    pub fn insert(&mut self, key: impl Into<String>, artifact: Artifact) {
        self.entries.insert(key.into(), artifact);
    }

    pub fn insert_file(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) {
        self.insert(key, Artifact::File(path.into()));
    }

    pub fn insert_number(&mut self, key: impl Into<String>, value: f64) {
        self.insert(key, Artifact::Number(value));
    }

    pub fn insert_text(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.insert(key, Artifact::Text(text.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_supersedes_own_and_later_phases() {
        let mut payload = Payload::new();

        let mut prepare = StagedPayload::default();
        prepare.insert_file("XDS.INP", "/work/XDS.INP");
        payload.commit(Phase::Prepare, prepare);

        let mut perform = StagedPayload::default();
        perform.insert_file("XPARM.XDS", "/work/XPARM.XDS");
        perform.insert_file("SPOT.XDS", "/work/SPOT.XDS");
        payload.commit(Phase::Perform, perform);

        let mut finish = StagedPayload::default();
        finish.insert_number("mosaic", 0.2);
        payload.commit(Phase::Finish, finish);
        assert_eq!(payload.len(), 4);

        // A perform re-run that no longer writes SPOT.XDS must not leave
        // the old one or the old finish results behind.
        let mut rerun = StagedPayload::default();
        rerun.insert_file("XPARM.XDS", "/work/XPARM.XDS");
        payload.commit(Phase::Perform, rerun);

        assert!(payload.contains("XDS.INP"));
        assert!(payload.contains("XPARM.XDS"));
        assert!(!payload.contains("SPOT.XDS"));
        assert!(!payload.contains("mosaic"));
    }

    #[test]
    fn test_typed_access() {
        let mut payload = Payload::new();
        let mut staged = StagedPayload::default();
        staged.insert_number("mosaic", 0.25);
        staged.insert_text("spacegroup", "P 41 21 2");
        payload.commit(Phase::Finish, staged);

        assert_eq!(payload.number("mosaic"), Some(0.25));
        assert_eq!(payload.file("mosaic"), None);
        assert_eq!(payload.get("spacegroup").and_then(Artifact::as_text), Some("P 41 21 2"));
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.hkl");
        std::fs::write(&present, "").unwrap();

        let mut staged = StagedPayload::default();
        staged.insert_file("present", &present);
        staged.insert_file("absent", dir.path().join("absent.hkl"));
        let mut payload = Payload::new();
        payload.commit(Phase::Perform, staged);

        let missing = payload.missing_files();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "absent");
    }
}

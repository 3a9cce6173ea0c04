//! JSON persistence of a whole project.
//!
//! Every object carries an `__id__` tag naming its type. Back-references
//! are not stored; they are restored from the forward structure after
//! loading. Stages are stored flat, once each, and schema objects refer
//! to them by key. Output is pure ASCII: everything else is written as
//! `\uXXXX` escapes.

use super::crystal::XCrystal;
use super::project::XProject;
use crate::error::{Error, Result};
use crate::stage::{BackendRegistry, StageGraph, StageRecord};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the saved project in the base directory.
pub const PROJECT_FILE: &str = "xia2.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "XProject")]
pub struct ProjectRecord {
    pub name: String,
    pub base_path: PathBuf,
    #[serde(default)]
    pub crystals: IndexMap<String, XCrystal>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

impl XProject {
    pub fn to_record(&self) -> ProjectRecord {
        ProjectRecord {
            name: self.name.clone(),
            base_path: self.base_path.clone(),
            crystals: self.crystals.clone(),
            stages: self.graph.to_records(),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.to_record())?)
    }

    /// Rebuild a project, constructing stage backends through `registry`.
    pub fn from_record(record: ProjectRecord, registry: &BackendRegistry) -> Result<Self> {
        let graph = StageGraph::from_records(record.stages, registry)?;
        let mut project = XProject {
            name: record.name,
            base_path: record.base_path,
            crystals: record.crystals,
            graph,
        };
        project.relink()?;
        project.check_stage_references()?;
        Ok(project)
    }

    pub fn from_value(value: serde_json::Value, registry: &BackendRegistry) -> Result<Self> {
        Self::from_record(serde_json::from_value(value)?, registry)
    }

    pub fn as_json(&self) -> Result<String> {
        let text = serde_json::to_string_pretty(&self.to_record())?;
        Ok(escape_non_ascii(&text))
    }

    pub fn from_json(text: &str, registry: &BackendRegistry) -> Result<Self> {
        Self::from_record(serde_json::from_str(text)?, registry)
    }

    /// Save to `xia2.json` under the base path, returning the file written.
    pub fn write_json(&self) -> Result<PathBuf> {
        let path = self.base_path.join(PROJECT_FILE);
        fs::create_dir_all(&self.base_path)?;
        fs::write(&path, self.as_json()?)?;
        info!("saved project {} to {}", self.name, path.display());
        Ok(path)
    }

    pub fn read_json(path: &Path, registry: &BackendRegistry) -> Result<Self> {
        debug!("loading project from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_json(&text, registry)
    }

    /// Every stage key held by the schema must exist in the graph.
    fn check_stage_references(&self) -> Result<()> {
        for crystal in self.crystals() {
            let sweep_keys = crystal.sweeps().flat_map(|s| s.stages.keys());
            for key in sweep_keys.chain(crystal.scaler_key()) {
                if !self.graph.contains(key) {
                    return Err(Error::Schema(format!(
                        "XCrystal {} refers to missing stage {key}",
                        crystal.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Replace every non-ASCII character by its UTF-16 `\uXXXX` escapes.
pub fn escape_non_ascii(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            escaped.push(c);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
            let _ = write!(escaped, "\\u{unit:04x}");
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SweepPath;
    use crate::stage::StageStatus;
    use crate::testing::{self, project};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_non_ascii() {
        assert_eq!(escape_non_ascii("Å 1.0"), "\\u00c5 1.0");
        assert_eq!(escape_non_ascii("\u{1F52C}"), "\\ud83d\\udd2c");
        let text = escape_non_ascii(&serde_json::to_string("Ångström").unwrap());
        assert_eq!(serde_json::from_str::<String>(&text).unwrap(), "Ångström");
    }

    #[test]
    fn test_round_trip_keeps_state_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1", "SWEEP2"]);
        project.scaler(&run, "XTAL").unwrap().run().unwrap();
        let jobs = drivers.calls().len();

        let json = project.as_json().unwrap();
        assert!(json.is_ascii());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["__id__"], "XProject");
        assert_eq!(value["crystals"]["XTAL"]["__id__"], "XCrystal");
        assert_eq!(value["stages"][0]["__id__"], "Stage");

        let mut loaded = XProject::from_json(&json, run.registry()).unwrap();
        assert_eq!(loaded.to_value().unwrap(), value);

        let path = SweepPath::new("XTAL", "NATIVE", "SWEEP2");
        let sweep = loaded.sweep(&path).unwrap();
        assert_eq!(sweep.crystal_name(), "XTAL");
        assert_eq!(sweep.wavelength_name(), "NATIVE");
        assert_eq!(loaded.crystal("XTAL").unwrap().project_name(), "AUTOMATIC");

        let mut integrater = loaded.integrater(&run, &path).unwrap();
        assert_eq!(integrater.status().unwrap(), StageStatus::Finished);
        integrater.intensities().unwrap();
        assert_eq!(drivers.calls().len(), jobs);
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        project.ensure_scaler(&run, "XTAL").unwrap();

        let path = project.write_json().unwrap();
        assert_eq!(path, dir.path().join("xia2.json"));
        let loaded = XProject::read_json(&path, run.registry()).unwrap();
        assert_eq!(loaded.graph().len(), 4);
        assert_eq!(loaded.summarise(), project.summarise());
    }

    #[test]
    fn test_dangling_stage_reference_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        project.ensure_integrater(&run, &SweepPath::new("XTAL", "NATIVE", "SWEEP1")).unwrap();

        let mut value = project.to_value().unwrap();
        let stages = value["stages"].as_array_mut().unwrap();
        stages.retain(|s| s["label"] != "SWEEP1 integrater");
        let err = XProject::from_value(value, run.registry()).unwrap_err();
        assert!(err.to_string().contains("refers to missing stage"));
    }

    #[test]
    fn test_sweep_unknown_to_its_sample_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let project = project(dir.path(), &["SWEEP1"]);

        let mut value = project.to_value().unwrap();
        value["crystals"]["XTAL"]["samples"]["X1"]["sweeps"] = serde_json::json!([]);
        let err = XProject::from_value(value, run.registry()).unwrap_err();
        assert!(err.to_string().contains("names sample X1"));
    }
}

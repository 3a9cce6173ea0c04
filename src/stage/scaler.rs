//! Scaler stages: merge the intensities of every sweep of a crystal.

use super::engine::Engine;
use super::handle::StageHandle;
use super::integrater::IntegraterState;
use super::node::{PhaseContext, StageBody, Upstream};
use super::refiner::insert_by_epoch;
use super::traits::{Phase, PhaseOutcome, StageKey};
use crate::data::{numeric_keys, DatasetKey, UnitCell};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

/// Statistics every scaler reports per dataset, each as
/// `[overall, inner shell, outer shell]`.
pub const STATISTIC_NAMES: [&str; 11] = [
    "High resolution limit",
    "Low resolution limit",
    "Completeness",
    "Multiplicity",
    "I/sigma",
    "Rmerge(I+/-)",
    "CC half",
    "Anomalous completeness",
    "Anomalous multiplicity",
    "Total observations",
    "Total unique",
];

/// Formats under which scaled reflections are published.
pub const SCALED_FORMATS: [&str; 4] = ["mtz", "sca", "mtz_unmerged", "sca_unmerged"];

/// Statistics of one dataset, in the order they were reported.
pub type DatasetStatistics = IndexMap<String, Vec<f64>>;

pub trait ScalerBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Decide the symmetry; may ask upstream indexers to check a lattice.
    fn prepare(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn scale(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn finish(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    /// Contributing integraters by sweep epoch.
    #[serde(default, deserialize_with = "numeric_keys::deserialize")]
    pub integraters: BTreeMap<u64, StageKey>,
    pub anomalous: bool,
    pub input_spacegroup: Option<String>,
    /// User high resolution limit per dataset.
    #[serde(default)]
    pub resolution_limits: BTreeMap<DatasetKey, f64>,
    pub reference_reflection_file: Option<PathBuf>,
    pub freer_file: Option<PathBuf>,

    pub spacegroup: Option<String>,
    #[serde(default)]
    pub likely_spacegroups: Vec<String>,
    pub cell: Option<UnitCell>,
    #[serde(default)]
    pub statistics: BTreeMap<DatasetKey, DatasetStatistics>,
}

impl ScalerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_integrater(&mut self, epoch: u64, integrater: StageKey) -> Result<u64> {
        insert_by_epoch(&mut self.integraters, epoch, integrater, "integrater")
    }

    /// Upstream integraters in epoch order, with their states.
    pub fn sweeps<'u>(&self, ctx: &'u PhaseContext<'_>) -> Result<Vec<(&'u Upstream, &'u IntegraterState)>> {
        self.integraters
            .values()
            .map(|key| {
                let upstream = ctx.upstream(*key)?;
                let state = upstream.state.as_integrater().ok_or_else(|| {
                    Error::InvalidArgument(format!("{} is not an integrater", upstream.label))
                })?;
                Ok((upstream, state))
            })
            .collect()
    }

    /// Datasets represented among the integraters, in epoch order.
    pub fn datasets(&self, ctx: &PhaseContext<'_>) -> Result<Vec<DatasetKey>> {
        let mut datasets = Vec::new();
        for (upstream, state) in self.sweeps(ctx)? {
            let key = state.project_info.clone().ok_or_else(|| Error::PayloadMissing {
                stage: upstream.label.clone(),
                key: "project_info".to_string(),
            })?;
            if !datasets.contains(&key) {
                datasets.push(key);
            }
        }
        Ok(datasets)
    }

    fn clear_results(&mut self) {
        self.spacegroup = None;
        self.likely_spacegroups.clear();
        self.cell = None;
        self.statistics.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ScalerStage {
    pub state: ScalerState,
    pub backend: Arc<dyn ScalerBackend>,
}

impl ScalerStage {
    pub fn new(backend: Arc<dyn ScalerBackend>) -> Self {
        Self {
            state: ScalerState::new(),
            backend,
        }
    }

    pub(crate) fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        if self.state.integraters.is_empty() {
            return Err(Error::NoIntegraters);
        }
        match phase {
            Phase::Prepare => {
                self.state.clear_results();
                self.backend.prepare(&mut self.state, ctx)
            }
            Phase::Perform => self.backend.scale(&mut self.state, ctx),
            Phase::Finish => self.backend.finish(&mut self.state, ctx),
        }
    }
}

pub struct ScalerHandle<'a> {
    inner: StageHandle<'a>,
}

impl<'a> ScalerHandle<'a> {
    pub fn new(engine: Engine<'a>, key: StageKey) -> Result<Self> {
        engine.body(key)?.as_scaler()?;
        Ok(Self {
            inner: StageHandle::new(engine, key),
        })
    }

    pub fn state(&self) -> Result<&ScalerState> {
        Ok(&self.inner.node()?.body.as_scaler()?.state)
    }

    pub fn integraters(&self) -> Result<Vec<(u64, StageKey)>> {
        Ok(self.state()?.integraters.iter().map(|(e, k)| (*e, *k)).collect())
    }

    pub fn add_integrater(&mut self, epoch: u64, integrater: StageKey) -> Result<u64> {
        let mut used = epoch;
        self.inner.update(|body| {
            used = body.as_scaler_mut()?.state.add_integrater(epoch, integrater)?;
            Ok(Some(Phase::Prepare))
        })?;
        Ok(used)
    }

    fn change<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ScalerState) -> Option<Phase>,
    {
        self.inner
            .update(|body| Ok(change(&mut body.as_scaler_mut()?.state)))
    }

    pub fn set_anomalous(&mut self, anomalous: bool) -> Result<()> {
        self.change(|s| {
            let changed = s.anomalous != anomalous;
            s.anomalous = anomalous;
            changed.then_some(Phase::Perform)
        })
    }

    pub fn set_input_spacegroup(&mut self, spacegroup: &str) -> Result<()> {
        let spacegroup = spacegroup.trim().to_string();
        self.change(|s| {
            let changed = s.input_spacegroup.as_deref() != Some(spacegroup.as_str());
            s.input_spacegroup = Some(spacegroup);
            changed.then_some(Phase::Prepare)
        })
    }

    pub fn set_resolution_limit(&mut self, dataset: DatasetKey, dmin: f64) -> Result<()> {
        self.change(|s| {
            let previous = s.resolution_limits.insert(dataset, dmin);
            (previous != Some(dmin)).then_some(Phase::Perform)
        })
    }

    pub fn set_reference_reflection_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.change(|s| {
            let changed = s.reference_reflection_file.as_ref() != Some(&path);
            s.reference_reflection_file = Some(path);
            changed.then_some(Phase::Prepare)
        })
    }

    pub fn set_freer_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.change(|s| {
            let changed = s.freer_file.as_ref() != Some(&path);
            s.freer_file = Some(path);
            changed.then_some(Phase::Finish)
        })
    }

    /// Scaled reflections in `format`: one of `mtz`, `sca`,
    /// `mtz_unmerged` or `sca_unmerged`.
    pub fn scaled_reflections(&mut self, format: &str) -> Result<PathBuf> {
        if !SCALED_FORMATS.contains(&format) {
            return Err(Error::InvalidArgument(format!(
                "unknown scaled reflection format {format}"
            )));
        }
        self.inner.payload_file(format)
    }

    pub fn statistics(&mut self) -> Result<BTreeMap<DatasetKey, DatasetStatistics>> {
        self.inner.run()?;
        Ok(self.state()?.statistics.clone())
    }

    pub fn cell(&mut self) -> Result<UnitCell> {
        self.inner.finished("cell", |b| Ok(b.as_scaler()?.state.cell))
    }

    pub fn spacegroup(&mut self) -> Result<String> {
        self.inner
            .finished("spacegroup", |b| Ok(b.as_scaler()?.state.spacegroup.clone()))
    }

    pub fn likely_spacegroups(&mut self) -> Result<Vec<String>> {
        self.inner.run()?;
        Ok(self.state()?.likely_spacegroups.clone())
    }

    /// Best overall high resolution limit across datasets.
    pub fn highest_resolution(&mut self) -> Result<f64> {
        let statistics = self.statistics()?;
        statistics
            .values()
            .filter_map(|s| s.get("High resolution limit").and_then(|v| v.first().copied()))
            .reduce(f64::min)
            .ok_or_else(|| Error::PayloadMissing {
                stage: self.inner.label().map(str::to_string).unwrap_or_default(),
                key: "High resolution limit".to_string(),
            })
    }
}

impl<'a> Deref for ScalerHandle<'a> {
    type Target = StageHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a> DerefMut for ScalerHandle<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub fn scaler_body(backend: Arc<dyn ScalerBackend>) -> StageBody {
    StageBody::Scaler(ScalerStage::new(backend))
}

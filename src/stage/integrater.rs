//! Integrater stages: measure reflection intensities for one sweep.

use super::engine::Engine;
use super::handle::StageHandle;
use super::node::{PhaseContext, StageBody};
use super::refiner::epoch_key;
use super::traits::{Phase, PhaseOutcome, StageKey};
use crate::data::{DatasetKey, FrameProcessor, Lattice, UnitCell};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

/// Images per line of the status summary.
const STATUS_RECORD_LENGTH: usize = 60;

pub trait IntegraterBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn prepare(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    /// Must publish `raw_intensities` and set `state.cell`.
    fn integrate(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    /// Must publish `intensities`.
    fn finish(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;
}

/// Resolution limits in Angstrom; `user` protects them from automatic
/// changes and from being cleared on reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLimits {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MosaicRange {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl MosaicRange {
    /// Range of the finite `values`, or `None` if there are none.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // Summation rounding can push the mean just past either bound.
        let mean = (values.iter().sum::<f64>() / values.len() as f64).clamp(min, max);
        Some(Self { min, mean, max })
    }
}

/// Per-image integration statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageStats {
    pub image: u32,
    /// Non-zero when the program abandoned the image.
    pub error: i32,
    pub scale: f64,
    pub overloads: u64,
    pub all: u64,
    pub strong: u64,
    pub rejected: u64,
    pub mosaic: Option<f64>,
    pub rmsd_pixel: Option<f64>,
}

impl ImageStats {
    pub fn fraction_weak(&self) -> f64 {
        if self.all == 0 {
            1.0
        } else {
            1.0 - self.strong as f64 / self.all as f64
        }
    }

    /// One character summarising how the image integrated.
    pub fn status_char(&self) -> char {
        if self.error != 0 {
            return '@';
        }
        let rmsd = self.rmsd_pixel.unwrap_or(0.0);
        if self.fraction_weak() > 0.99 {
            '.'
        } else if rmsd > 2.5 {
            '!'
        } else if rmsd > 1.0 {
            '%'
        } else if self.overloads as f64 > 0.01 * self.strong as f64 {
            'O'
        } else {
            'o'
        }
    }
}

/// Lines of the per-image status summary.
pub fn render_status(status: &str) -> Vec<String> {
    let mut lines = Vec::new();
    if status.chars().count() > STATUS_RECORD_LENGTH {
        lines.push(format!("Integration status per image ({STATUS_RECORD_LENGTH}/record):"));
    } else {
        lines.push("Integration status per image:".to_string());
    }
    let chars: Vec<char> = status.chars().collect();
    for chunk in chars.chunks(STATUS_RECORD_LENGTH) {
        lines.push(chunk.iter().collect());
    }
    lines.push("\"o\" => good        \"%\" => ok        \"!\" => bad rmsd".to_string());
    lines.push("\"O\" => overloaded  \"#\" => many bad  \".\" => blank".to_string());
    lines.push("\"@\" => abandoned".to_string());
    lines
}

fn valid_reindex_operator(operator: &str) -> bool {
    let parts: Vec<&str> = operator.split(',').collect();
    parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().any(|c| matches!(c, 'h' | 'k' | 'l'))
                && p.chars().all(|c| matches!(c, 'h' | 'k' | 'l' | '+' | '-' | '*' | '/' | '.' | ' ') || c.is_ascii_digit())
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegraterState {
    pub sweep_name: String,
    pub frame: FrameProcessor,
    pub refiner: StageKey,
    /// Epoch under which the refiner published this sweep's geometry.
    pub refiner_epoch: u64,
    pub project_info: Option<DatasetKey>,
    pub epoch: u64,
    pub wedge: Option<(u32, u32)>,
    pub resolution: ResolutionLimits,
    pub ice: bool,
    #[serde(default)]
    pub excluded_regions: Vec<(f64, f64)>,
    pub anomalous: bool,
    pub spacegroup_number: Option<u32>,
    pub reindex_operator: Option<String>,
    /// Program parameters learnt while integrating; cleared on reset.
    #[serde(default)]
    pub program_parameters: IndexMap<String, IndexMap<String, String>>,

    pub cell: Option<UnitCell>,
    pub lattice: Option<Lattice>,
    pub mosaic: Option<MosaicRange>,
    pub reflections: Option<u64>,
    pub batches: Option<(u32, u32)>,
    #[serde(default)]
    pub per_image_status: String,
}

impl IntegraterState {
    pub fn new(sweep_name: impl Into<String>, frame: FrameProcessor, refiner: StageKey, refiner_epoch: u64) -> Self {
        let epoch = frame.start_epoch() as u64;
        Self {
            sweep_name: sweep_name.into(),
            frame,
            refiner,
            refiner_epoch,
            project_info: None,
            epoch,
            wedge: None,
            resolution: ResolutionLimits::default(),
            ice: false,
            excluded_regions: Vec::new(),
            anomalous: false,
            spacegroup_number: None,
            reindex_operator: None,
            program_parameters: IndexMap::new(),
            cell: None,
            lattice: None,
            mosaic: None,
            reflections: None,
            batches: None,
            per_image_status: String::new(),
        }
    }

    /// Images to integrate: the wedge if set, else the whole sweep.
    pub fn images(&self) -> (u32, u32) {
        self.wedge.unwrap_or(self.frame.image_range)
    }

    /// Payload key of a file the refiner published for this sweep.
    pub fn refined(&self, name: &str) -> String {
        epoch_key(self.refiner_epoch, name)
    }

    fn guard_user_limits(&self, user: bool) -> Result<()> {
        if self.resolution.user && !user {
            return Err(Error::InvalidArgument("cannot override user set limits".into()));
        }
        Ok(())
    }

    /// Set both limits, in either order.
    pub fn set_resolution(&mut self, dmin: f64, dmax: f64, user: bool) -> Result<Option<Phase>> {
        self.guard_user_limits(user)?;
        let before = self.resolution;
        self.resolution.user |= user;
        self.resolution.high = Some(dmin.min(dmax));
        self.resolution.low = Some(dmin.max(dmax));
        Ok((before != self.resolution).then_some(Phase::Perform))
    }

    pub fn set_high_resolution(&mut self, dmin: f64, user: bool) -> Result<Option<Phase>> {
        self.guard_user_limits(user)?;
        let before = self.resolution;
        self.resolution.user |= user;
        self.resolution.high = Some(dmin);
        Ok((before != self.resolution).then_some(Phase::Perform))
    }

    pub fn set_low_resolution(&mut self, dmax: f64) -> Option<Phase> {
        let changed = self.resolution.low != Some(dmax);
        self.resolution.low = Some(dmax);
        changed.then_some(Phase::Perform)
    }

    pub fn set_spacegroup_number(&mut self, number: u32) -> Result<Option<Phase>> {
        if !(1..=230).contains(&number) {
            return Err(Error::BadSpacegroup(number.to_string()));
        }
        if self.spacegroup_number == Some(number) {
            return Ok(None);
        }
        debug!("{}: spacegroup set to {number}", self.sweep_name);
        self.spacegroup_number = Some(number);
        self.reindex_operator = None;
        Ok(Some(Phase::Finish))
    }

    /// Replace the reindex operator. Setting the identity when no
    /// operator, or the identity, is already set changes nothing.
    pub fn set_reindex_operator(&mut self, operator: &str) -> Result<Option<Phase>> {
        let operator = operator.trim().to_lowercase().replace(' ', "");
        if !valid_reindex_operator(&operator) {
            return Err(Error::ReindexRejected(operator));
        }
        if operator == "h,k,l" && matches!(self.reindex_operator.as_deref(), None | Some("h,k,l")) {
            return Ok(None);
        }
        if self.reindex_operator.as_deref() == Some(operator.as_str()) {
            return Ok(None);
        }
        self.reindex_operator = Some(operator);
        Ok(Some(Phase::Finish))
    }

    pub fn set_ice(&mut self, ice: bool) -> Option<Phase> {
        let changed = self.ice != ice;
        self.ice = ice;
        changed.then_some(Phase::Prepare)
    }

    pub fn set_excluded_regions(&mut self, regions: Vec<(f64, f64)>) -> Option<Phase> {
        let changed = self.excluded_regions != regions;
        self.excluded_regions = regions;
        changed.then_some(Phase::Prepare)
    }

    pub fn set_anomalous(&mut self, anomalous: bool) -> Option<Phase> {
        let changed = self.anomalous != anomalous;
        self.anomalous = anomalous;
        changed.then_some(Phase::Finish)
    }

    pub fn set_parameter(&mut self, program: &str, name: &str, value: &str) -> Option<Phase> {
        let previous = self
            .program_parameters
            .entry(program.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        (previous.as_deref() != Some(value)).then_some(Phase::Perform)
    }

    pub fn parameter(&self, program: &str, name: &str) -> Option<&str> {
        self.program_parameters
            .get(program)
            .and_then(|p| p.get(name))
            .map(String::as_str)
    }

    pub fn set_project_info(&mut self, info: DatasetKey) -> Option<Phase> {
        let changed = self.project_info.as_ref() != Some(&info);
        self.project_info = Some(info);
        changed.then_some(Phase::Finish)
    }

    pub fn set_wedge(&mut self, start: u32, end: u32) -> Result<Option<Phase>> {
        let (first, last) = self.frame.image_range;
        if start > end || start < first || end > last {
            return Err(Error::InvalidArgument(format!(
                "wedge {start}-{end} outside images {first}-{last}"
            )));
        }
        if self.wedge == Some((start, end)) {
            return Ok(None);
        }
        self.wedge = Some((start, end));
        self.epoch = self.frame.epoch_of(start) as u64;
        Ok(Some(Phase::Prepare))
    }

    /// Clear what a reset of `phase` makes stale.
    pub(crate) fn on_invalidate(&mut self, phase: Phase) {
        if phase <= Phase::Perform {
            self.reindex_operator = None;
        }
        if phase == Phase::Prepare {
            if !self.resolution.user {
                self.resolution.high = None;
                self.resolution.low = None;
            }
            self.program_parameters.clear();
        }
    }

    pub fn status_report(&self) -> Vec<String> {
        render_status(&self.per_image_status)
    }
}

#[derive(Debug, Clone)]
pub struct IntegraterStage {
    pub state: IntegraterState,
    pub backend: Arc<dyn IntegraterBackend>,
}

impl IntegraterStage {
    pub fn new(backend: Arc<dyn IntegraterBackend>, state: IntegraterState) -> Self {
        Self { state, backend }
    }

    pub(crate) fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        match phase {
            Phase::Prepare => self.backend.prepare(&mut self.state, ctx),
            Phase::Perform => {
                let outcome = self.backend.integrate(&mut self.state, ctx)?;
                if !self.state.per_image_status.is_empty() {
                    for line in self.state.status_report() {
                        info!("{line}");
                    }
                }
                Ok(outcome)
            }
            Phase::Finish => {
                let outcome = self.backend.finish(&mut self.state, ctx)?;
                self.check_cell(ctx)?;
                Ok(outcome)
            }
        }
    }

    /// Reject integration results the refined model cannot explain.
    fn check_cell(&mut self, ctx: &PhaseContext<'_>) -> Result<()> {
        let upstream = ctx.upstream(self.state.refiner)?;
        let refiner = upstream.state.as_refiner().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a refiner", upstream.label))
        })?;
        let cell = self.state.cell.ok_or_else(|| Error::PayloadMissing {
            stage: ctx.core.label.clone(),
            key: "cell".to_string(),
        })?;
        if let Some(before) = refiner.cell {
            let change = before.volume_change(&cell);
            if change > ctx.run.config.max_cell_volume_change {
                return Err(Error::CellVolumeChange {
                    before: before.volume(),
                    after: cell.volume(),
                });
            }
        }
        self.state.lattice = refiner.lattice;
        if let Some(lattice) = refiner.lattice {
            if !cell.consistent_with(lattice, ctx.run.config.cell_tolerance) {
                return Err(Error::BadLattice(format!(
                    "integrated cell {cell} does not fit lattice {lattice}"
                )));
            }
        }
        Ok(())
    }
}

pub struct IntegraterHandle<'a> {
    inner: StageHandle<'a>,
}

impl<'a> IntegraterHandle<'a> {
    pub fn new(engine: Engine<'a>, key: StageKey) -> Result<Self> {
        engine.body(key)?.as_integrater()?;
        Ok(Self {
            inner: StageHandle::new(engine, key),
        })
    }

    pub fn state(&self) -> Result<&IntegraterState> {
        Ok(&self.inner.node()?.body.as_integrater()?.state)
    }

    /// Reflection file ready for scaling.
    pub fn intensities(&mut self) -> Result<PathBuf> {
        self.inner.payload_file("intensities")
    }

    /// Reflection file straight from integration, before any reindexing.
    pub fn raw_intensities(&mut self) -> Result<PathBuf> {
        self.inner.payload_file("raw_intensities")
    }

    pub fn cell(&mut self) -> Result<UnitCell> {
        self.inner.finished("cell", |b| Ok(b.as_integrater()?.state.cell))
    }

    pub fn lattice(&mut self) -> Result<Lattice> {
        self.inner.finished("lattice", |b| Ok(b.as_integrater()?.state.lattice))
    }

    pub fn mosaic(&mut self) -> Result<Option<MosaicRange>> {
        self.inner.run()?;
        Ok(self.state()?.mosaic)
    }

    pub fn reflections(&mut self) -> Result<u64> {
        self.inner
            .finished("reflections", |b| Ok(b.as_integrater()?.state.reflections))
    }

    pub fn batches(&mut self) -> Result<(u32, u32)> {
        self.inner.finished("batches", |b| Ok(b.as_integrater()?.state.batches))
    }

    pub fn per_image_status(&mut self) -> Result<String> {
        self.inner.run()?;
        Ok(self.state()?.per_image_status.clone())
    }

    fn change<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut IntegraterState) -> Result<Option<Phase>>,
    {
        self.inner
            .update(|body| change(&mut body.as_integrater_mut()?.state))
    }

    pub fn set_resolution(&mut self, dmin: f64, dmax: f64, user: bool) -> Result<()> {
        self.change(|s| s.set_resolution(dmin, dmax, user))
    }

    pub fn set_high_resolution(&mut self, dmin: f64, user: bool) -> Result<()> {
        self.change(|s| s.set_high_resolution(dmin, user))
    }

    pub fn set_low_resolution(&mut self, dmax: f64) -> Result<()> {
        self.change(|s| Ok(s.set_low_resolution(dmax)))
    }

    pub fn set_spacegroup_number(&mut self, number: u32) -> Result<()> {
        self.change(|s| s.set_spacegroup_number(number))
    }

    pub fn set_reindex_operator(&mut self, operator: &str) -> Result<()> {
        self.change(|s| s.set_reindex_operator(operator))
    }

    pub fn reset_reindex_operator(&mut self) -> Result<()> {
        self.set_reindex_operator("h,k,l")
    }

    pub fn set_ice(&mut self, ice: bool) -> Result<()> {
        self.change(|s| Ok(s.set_ice(ice)))
    }

    pub fn set_excluded_regions(&mut self, regions: Vec<(f64, f64)>) -> Result<()> {
        self.change(|s| Ok(s.set_excluded_regions(regions)))
    }

    pub fn set_anomalous(&mut self, anomalous: bool) -> Result<()> {
        self.change(|s| Ok(s.set_anomalous(anomalous)))
    }

    pub fn set_parameter(&mut self, program: &str, name: &str, value: &str) -> Result<()> {
        self.change(|s| Ok(s.set_parameter(program, name, value)))
    }

    pub fn set_project_info(&mut self, info: DatasetKey) -> Result<()> {
        self.change(|s| Ok(s.set_project_info(info)))
    }

    pub fn set_wedge(&mut self, start: u32, end: u32) -> Result<()> {
        self.change(|s| s.set_wedge(start, end))
    }
}

impl<'a> Deref for IntegraterHandle<'a> {
    type Target = StageHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a> DerefMut for IntegraterHandle<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub fn integrater_body(backend: Arc<dyn IntegraterBackend>, state: IntegraterState) -> StageBody {
    StageBody::Integrater(IntegraterStage::new(backend, state))
}

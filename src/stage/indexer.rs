//! Indexer stages: find the lattice and cell of one sweep.

use super::engine::Engine;
use super::handle::StageHandle;
use super::node::{PhaseContext, StageBody};
use super::traits::{Phase, PhaseOutcome, StageKey};
use crate::data::{FrameProcessor, Lattice, LatticeAssertion, LatticeSolutions, UnitCell};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// One indexing program.
///
/// `index` must fill `state.solutions`; the stage picks the working
/// solution from them.
pub trait IndexerBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Settings needed to rebuild this backend after a reload.
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn prepare(&self, state: &mut IndexerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn index(&self, state: &mut IndexerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;

    fn finish(&self, _state: &mut IndexerState, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        Ok(PhaseOutcome::done())
    }
}

/// Inputs and results of an indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerState {
    pub sweep_name: String,
    pub frame: FrameProcessor,
    /// Image ranges used for spot finding; chosen at prepare when empty.
    #[serde(default)]
    pub wedges: Vec<(u32, u32)>,
    pub input_lattice: Option<Lattice>,
    pub input_cell: Option<UnitCell>,
    /// The target lattice came from the user, not from elimination.
    #[serde(default)]
    pub user_input_lattice: bool,
    pub beam_centre: Option<(f64, f64)>,
    pub distance: Option<f64>,

    pub solutions: Option<LatticeSolutions>,
    pub lattice: Option<Lattice>,
    pub cell: Option<UnitCell>,
    pub mosaic: Option<f64>,
    pub refined_distance: Option<f64>,
    pub refined_beam_centre: Option<(f64, f64)>,
    pub resolution_estimate: Option<f64>,
}

impl IndexerState {
    pub fn new(sweep_name: impl Into<String>, frame: FrameProcessor) -> Self {
        Self {
            sweep_name: sweep_name.into(),
            frame,
            wedges: Vec::new(),
            input_lattice: None,
            input_cell: None,
            user_input_lattice: false,
            beam_centre: None,
            distance: None,
            solutions: None,
            lattice: None,
            cell: None,
            mosaic: None,
            refined_distance: None,
            refined_beam_centre: None,
            resolution_estimate: None,
        }
    }

    /// Returns whether the target changed.
    pub fn set_input_lattice(&mut self, lattice: Lattice, user: bool) -> bool {
        let changed = self.input_lattice != Some(lattice);
        self.input_lattice = Some(lattice);
        self.user_input_lattice = user;
        changed
    }

    pub fn set_input_cell(&mut self, cell: UnitCell) -> bool {
        let changed = self.input_cell != Some(cell);
        self.input_cell = Some(cell);
        changed
    }

    pub fn set_wedges(&mut self, wedges: Vec<(u32, u32)>) -> Result<bool> {
        let (first, last) = self.frame.image_range;
        for &(start, end) in &wedges {
            if start > end || start < first || end > last {
                return Err(Error::InvalidArgument(format!(
                    "wedge {start}-{end} outside images {first}-{last}"
                )));
            }
        }
        let changed = self.wedges != wedges;
        self.wedges = wedges;
        Ok(changed)
    }

    pub fn set_frame(&mut self, frame: FrameProcessor) -> bool {
        if self.frame == frame {
            return false;
        }
        self.frame = frame;
        self.wedges.clear();
        true
    }

    /// Beam centre to index with: the override if set, else the header value.
    pub fn beam(&self) -> (f64, f64) {
        self.beam_centre.unwrap_or(self.frame.beam_centre)
    }

    pub fn detector_distance(&self) -> f64 {
        self.distance.unwrap_or(self.frame.distance)
    }

    /// Drop the current best solution and target the next one.
    pub fn eliminate(&mut self) -> Result<Lattice> {
        let solutions = self.solutions.as_mut().ok_or(Error::NotEnoughLattices)?;
        let next = solutions.eliminate()?.clone();
        self.input_lattice = Some(next.lattice);
        self.input_cell = Some(next.cell);
        self.user_input_lattice = false;
        Ok(next.lattice)
    }

    pub fn assert_lattice(&mut self, lattice: Lattice) -> Result<LatticeAssertion> {
        if self.lattice == Some(lattice) {
            return Ok(LatticeAssertion::Correct);
        }
        let Some(solutions) = self.solutions.as_mut() else {
            return Err(Error::PayloadMissing {
                stage: self.sweep_name.clone(),
                key: "solutions".to_string(),
            });
        };
        if !solutions.contains(lattice) {
            return Ok(LatticeAssertion::Impossible);
        }
        let target = solutions.eliminate_to(lattice)?.clone();
        self.input_lattice = Some(target.lattice);
        self.input_cell = Some(target.cell);
        Ok(LatticeAssertion::Possible)
    }

    /// Pick the working solution: the target lattice if there is one,
    /// otherwise the highest symmetry found.
    fn select_solution(&mut self) -> Result<()> {
        let solutions = self.solutions.as_mut().ok_or_else(|| Error::PayloadMissing {
            stage: self.sweep_name.clone(),
            key: "solutions".to_string(),
        })?;
        if let Some(target) = self.input_lattice {
            if !solutions.contains(target) {
                return Err(Error::BadLattice(format!(
                    "{target} not among indexing solutions {:?}",
                    solutions.lattices()
                )));
            }
            solutions.eliminate_to(target)?;
        }
        let best = solutions.best().clone();
        self.lattice = Some(best.lattice);
        self.cell = Some(best.cell);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IndexerStage {
    pub state: IndexerState,
    pub backend: Arc<dyn IndexerBackend>,
}

impl IndexerStage {
    pub fn new(backend: Arc<dyn IndexerBackend>, sweep_name: impl Into<String>, frame: FrameProcessor) -> Self {
        Self {
            state: IndexerState::new(sweep_name, frame),
            backend,
        }
    }

    /// A fresh indexer on `backend` carrying over the sweep, the wedges,
    /// the user's lattice and cell and the geometry overrides.
    pub fn substitute(&self, backend: Arc<dyn IndexerBackend>) -> Self {
        let old = &self.state;
        let mut state = IndexerState::new(old.sweep_name.clone(), old.frame.clone());
        state.wedges = old.wedges.clone();
        if old.user_input_lattice {
            state.input_lattice = old.input_lattice;
            state.input_cell = old.input_cell;
            state.user_input_lattice = true;
        } else if old.input_lattice.is_none() {
            state.input_cell = old.input_cell;
        }
        state.beam_centre = old.beam_centre;
        state.distance = old.distance;
        Self { state, backend }
    }

    pub(crate) fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        match phase {
            Phase::Prepare => self.backend.prepare(&mut self.state, ctx),
            Phase::Perform => {
                let outcome = self.backend.index(&mut self.state, ctx)?;
                self.state.select_solution()?;
                Ok(outcome)
            }
            Phase::Finish => self.backend.finish(&mut self.state, ctx),
        }
    }
}

pub struct IndexerHandle<'a> {
    inner: StageHandle<'a>,
}

impl<'a> IndexerHandle<'a> {
    pub fn new(engine: Engine<'a>, key: StageKey) -> Result<Self> {
        engine.body(key)?.as_indexer()?;
        Ok(Self {
            inner: StageHandle::new(engine, key),
        })
    }

    /// Inputs and results as they stand, without running anything.
    pub fn state(&self) -> Result<&IndexerState> {
        Ok(&self.inner.node()?.body.as_indexer()?.state)
    }

    pub fn backend_name(&self) -> Result<&'static str> {
        Ok(self.inner.node()?.body.backend_name())
    }

    pub fn cell(&mut self) -> Result<UnitCell> {
        self.inner.finished("cell", |b| Ok(b.as_indexer()?.state.cell))
    }

    pub fn lattice(&mut self) -> Result<Lattice> {
        self.inner.finished("lattice", |b| Ok(b.as_indexer()?.state.lattice))
    }

    pub fn solutions(&mut self) -> Result<LatticeSolutions> {
        self.inner
            .finished("solutions", |b| Ok(b.as_indexer()?.state.solutions.clone()))
    }

    pub fn mosaic(&mut self) -> Result<f64> {
        self.inner.finished("mosaic", |b| Ok(b.as_indexer()?.state.mosaic))
    }

    pub fn distance(&mut self) -> Result<f64> {
        self.inner.finished("distance", |b| {
            let state = &b.as_indexer()?.state;
            Ok(Some(state.refined_distance.unwrap_or_else(|| state.detector_distance())))
        })
    }

    pub fn beam_centre(&mut self) -> Result<(f64, f64)> {
        self.inner.finished("beam_centre", |b| {
            let state = &b.as_indexer()?.state;
            Ok(Some(state.refined_beam_centre.unwrap_or_else(|| state.beam())))
        })
    }

    pub fn resolution_estimate(&mut self) -> Result<f64> {
        self.inner.finished("resolution_estimate", |b| {
            Ok(b.as_indexer()?.state.resolution_estimate)
        })
    }

    pub fn set_input_lattice(&mut self, lattice: Lattice, user: bool) -> Result<()> {
        self.inner.update(|body| {
            let changed = body.as_indexer_mut()?.state.set_input_lattice(lattice, user);
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    pub fn set_input_cell(&mut self, cell: UnitCell) -> Result<()> {
        self.inner.update(|body| {
            let changed = body.as_indexer_mut()?.state.set_input_cell(cell);
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    pub fn set_wedges(&mut self, wedges: Vec<(u32, u32)>) -> Result<()> {
        self.inner.update(|body| {
            let changed = body.as_indexer_mut()?.state.set_wedges(wedges)?;
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    pub fn set_beam_centre(&mut self, beam: (f64, f64)) -> Result<()> {
        self.inner.update(|body| {
            let state = &mut body.as_indexer_mut()?.state;
            let changed = state.beam_centre != Some(beam);
            state.beam_centre = Some(beam);
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    pub fn set_distance(&mut self, distance: f64) -> Result<()> {
        self.inner.update(|body| {
            let state = &mut body.as_indexer_mut()?.state;
            let changed = state.distance != Some(distance);
            state.distance = Some(distance);
            Ok(changed.then_some(Phase::Prepare))
        })
    }

    /// Reject the current lattice and re-index with the next solution.
    pub fn eliminate(&mut self) -> Result<Lattice> {
        self.inner.run()?;
        self.inner.engine.eliminate(self.inner.key)
    }

    pub fn assert_lattice(&mut self, lattice: Lattice) -> Result<LatticeAssertion> {
        self.inner.run()?;
        self.inner.engine.assert_lattice(self.inner.key, lattice)
    }
}

impl<'a> Deref for IndexerHandle<'a> {
    type Target = StageHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a> DerefMut for IndexerHandle<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Build the body for a new indexer stage.
pub fn indexer_body(backend: Arc<dyn IndexerBackend>, sweep_name: &str, frame: FrameProcessor) -> StageBody {
    StageBody::Indexer(IndexerStage::new(backend, sweep_name, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LatticeSolution;
    use crate::testing;

    fn cell(c: [f64; 6]) -> UnitCell {
        UnitCell::new(c).unwrap()
    }

    fn state_with_solutions() -> IndexerState {
        let mut state = IndexerState::new("SWEEP1", FrameProcessor::new("x_####.cbf", "/data").with_image_range(1, 90));
        state.solutions = Some(
            LatticeSolutions::new(vec![
                LatticeSolution {
                    lattice: Lattice::TriclinicP,
                    cell: cell([78.1, 78.0, 37.1, 90.0, 90.1, 89.9]),
                    penalty: 0.0,
                },
                LatticeSolution {
                    lattice: Lattice::OrthorhombicP,
                    cell: cell([78.0, 78.1, 37.1, 90.0, 90.0, 90.0]),
                    penalty: 0.8,
                },
                LatticeSolution {
                    lattice: Lattice::TetragonalP,
                    cell: cell([78.0, 78.0, 37.1, 90.0, 90.0, 90.0]),
                    penalty: 1.2,
                },
            ])
            .unwrap(),
        );
        state.select_solution().unwrap();
        state
    }

    #[test]
    fn test_selects_highest_symmetry() {
        let state = state_with_solutions();
        assert_eq!(state.lattice, Some(Lattice::TetragonalP));
    }

    #[test]
    fn test_eliminate_retargets() {
        let mut state = state_with_solutions();
        assert_eq!(state.eliminate().unwrap(), Lattice::OrthorhombicP);
        assert_eq!(state.input_lattice, Some(Lattice::OrthorhombicP));
        assert_eq!(state.eliminate().unwrap(), Lattice::TriclinicP);
        assert!(matches!(state.eliminate(), Err(Error::NotEnoughLattices)));
    }

    #[test]
    fn test_assert_lattice() {
        let mut state = state_with_solutions();
        assert_eq!(state.assert_lattice(Lattice::TetragonalP).unwrap(), LatticeAssertion::Correct);
        assert_eq!(state.assert_lattice(Lattice::CubicP).unwrap(), LatticeAssertion::Impossible);
        assert_eq!(state.assert_lattice(Lattice::OrthorhombicP).unwrap(), LatticeAssertion::Possible);
        assert_eq!(state.input_lattice, Some(Lattice::OrthorhombicP));

        state.select_solution().unwrap();
        assert_eq!(state.lattice, Some(Lattice::OrthorhombicP));
    }

    #[test]
    fn test_target_missing_from_solutions_is_bad_lattice() {
        let mut state = state_with_solutions();
        state.input_lattice = Some(Lattice::CubicF);
        assert!(state.select_solution().unwrap_err().is_bad_lattice());
    }

    #[test]
    fn test_wedges_must_lie_in_sweep() {
        let mut state = state_with_solutions();
        assert!(state.set_wedges(vec![(1, 5), (86, 90)]).unwrap());
        assert!(!state.set_wedges(vec![(1, 5), (86, 90)]).unwrap());
        assert!(state.set_wedges(vec![(88, 95)]).is_err());
    }

    #[test]
    fn test_substitute_keeps_user_inputs_only() {
        let mut state = state_with_solutions();
        state.beam_centre = Some((105.0, 110.0));
        state.eliminate().unwrap();
        let stage = IndexerStage {
            state,
            backend: crate::stage::BackendRegistry::new_with_defaults().indexer("xds", &serde_json::Value::Null).unwrap(),
        };

        let dials = crate::stage::BackendRegistry::new_with_defaults().indexer("dials", &serde_json::Value::Null).unwrap();
        let fresh = stage.substitute(dials);
        assert_eq!(fresh.backend.name(), "dials");
        assert_eq!(fresh.state.beam_centre, Some((105.0, 110.0)));
        // The eliminated target was not the user's choice.
        assert_eq!(fresh.state.input_lattice, None);
        assert!(fresh.state.solutions.is_none());
    }

    #[test]
    fn test_handle_setters_invalidate_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());

        let mut indexer = IndexerHandle::new(Engine::new(&mut graph, &run), chain.indexer).unwrap();
        let first = indexer.cell().unwrap();
        assert_eq!(indexer.lattice().unwrap(), Lattice::TetragonalP);
        assert_eq!(drivers.count("xds_par"), 1);

        indexer.set_beam_centre((105.0, 110.0)).unwrap();
        assert_eq!(indexer.status().unwrap(), crate::stage::StageStatus::NotPrepared);
        assert_eq!(indexer.cell().unwrap(), first);
        assert_eq!(drivers.count("xds_par"), 2);

        indexer.set_beam_centre((105.0, 110.0)).unwrap();
        assert_eq!(indexer.status().unwrap(), crate::stage::StageStatus::Finished);
        assert_eq!(indexer.state().unwrap().beam_centre, Some((105.0, 110.0)));
        assert_eq!(drivers.count("xds_par"), 2);
    }
}

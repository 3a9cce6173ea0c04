//! The project root: crystals, and the stage graph their sweeps use.
//!
//! Schema objects hold stage keys rather than stages. The stages live in
//! the project's [`StageGraph`] and are created the first time a sweep is
//! asked for one, in `<base>/<crystal>/<wavelength>/<sweep>/{index,refine,integrate}`.

use super::crystal::XCrystal;
use super::sweep::{check_image_range, SweepPath, XSweep};
use crate::context::RunContext;
use crate::data::{DatasetKey, Lattice, UnitCell};
use crate::error::{Error, Result};
use crate::stage::indexer::indexer_body;
use crate::stage::integrater::{integrater_body, IntegraterState};
use crate::stage::refiner::refiner_body;
use crate::stage::scaler::scaler_body;
use crate::stage::{
    Engine, IndexerHandle, IntegraterHandle, Phase, RefinerHandle, ScalerHandle, StageBody, StageGraph, StageKey,
    StageKind,
};
use indexmap::IndexMap;
use log::info;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct XProject {
    pub name: String,
    pub base_path: PathBuf,
    pub(crate) crystals: IndexMap<String, XCrystal>,
    pub(crate) graph: StageGraph,
}

impl XProject {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            crystals: IndexMap::new(),
            graph: StageGraph::new(),
        }
    }

    pub fn add_crystal(&mut self, mut crystal: XCrystal) -> Result<()> {
        if self.crystals.contains_key(&crystal.name) {
            return Err(Error::Schema(format!("XCrystal with name {} already exists", crystal.name)));
        }
        crystal.relink(&self.name)?;
        self.crystals.insert(crystal.name.clone(), crystal);
        Ok(())
    }

    pub fn crystal(&self, name: &str) -> Result<&XCrystal> {
        self.crystals
            .get(name)
            .ok_or_else(|| Error::Schema(format!("no XCrystal {name} in project {}", self.name)))
    }

    /// Structural access to a crystal. Symmetry changes that must reach
    /// existing stages go through [`XProject::set_user_lattice`].
    pub fn crystal_mut(&mut self, name: &str) -> Result<&mut XCrystal> {
        let project = &self.name;
        self.crystals
            .get_mut(name)
            .ok_or_else(|| Error::Schema(format!("no XCrystal {name} in project {project}")))
    }

    pub fn crystals(&self) -> impl Iterator<Item = &XCrystal> {
        self.crystals.values()
    }

    pub fn sweep(&self, path: &SweepPath) -> Result<&XSweep> {
        self.crystal(&path.crystal)?.wavelength(&path.wavelength)?.sweep(&path.sweep)
    }

    fn sweep_mut(&mut self, path: &SweepPath) -> Result<&mut XSweep> {
        self.crystal_mut(&path.crystal)?
            .wavelength_mut(&path.wavelength)?
            .sweep_mut(&path.sweep)
    }

    /// Every sweep in the project, crystal by crystal.
    pub fn sweep_paths(&self) -> Vec<SweepPath> {
        self.crystals.values().flat_map(|c| c.sweeps().map(XSweep::path)).collect()
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn engine<'a>(&'a mut self, run: &'a RunContext) -> Engine<'a> {
        Engine::new(&mut self.graph, run)
    }

    /// The sweep's indexer, created on first use.
    pub fn ensure_indexer(&mut self, run: &RunContext, path: &SweepPath) -> Result<StageKey> {
        let sweep = self.sweep(path)?;
        if let Some(key) = sweep.stages.indexer {
            return Ok(key);
        }
        let crystal = self.crystal(&path.crystal)?;
        let config = &run.config;
        let backend = run.registry().indexer(
            config.backend(StageKind::Indexer),
            &config.backend_settings(StageKind::Indexer),
        )?;
        let mut body = indexer_body(backend, &sweep.name, sweep.frame.clone());
        if let StageBody::Indexer(stage) = &mut body {
            if let Some(lattice) = crystal.lattice {
                stage.state.set_input_lattice(lattice, true);
            }
            if let Some(cell) = crystal.cell {
                stage.state.set_input_cell(cell);
            }
        }
        let dir = sweep.working_dir(&self.base_path).join("index");
        let label = format!("{} indexer", sweep.name);

        let key = self.graph.insert(label, dir, body);
        self.sweep_mut(path)?.stages.indexer = Some(key);
        info!("{path}: created {} indexer {key}", config.backend(StageKind::Indexer));
        Ok(key)
    }

    pub fn ensure_refiner(&mut self, run: &RunContext, path: &SweepPath) -> Result<StageKey> {
        if let Some(key) = self.sweep(path)?.stages.refiner {
            return Ok(key);
        }
        let indexer = self.ensure_indexer(run, path)?;
        let sweep = self.sweep(path)?;
        let config = &run.config;
        let backend = run.registry().refiner(
            config.backend(StageKind::Refiner),
            &config.backend_settings(StageKind::Refiner),
        )?;
        let body = refiner_body(backend, &[(sweep.epoch(), indexer)])?;
        let dir = sweep.working_dir(&self.base_path).join("refine");
        let label = format!("{} refiner", sweep.name);

        let key = self.graph.insert(label, dir, body);
        self.sweep_mut(path)?.stages.refiner = Some(key);
        Ok(key)
    }

    pub fn ensure_integrater(&mut self, run: &RunContext, path: &SweepPath) -> Result<StageKey> {
        if let Some(key) = self.sweep(path)?.stages.integrater {
            return Ok(key);
        }
        let refiner = self.ensure_refiner(run, path)?;
        let crystal = self.crystal(&path.crystal)?;
        let wavelength = crystal.wavelength(&path.wavelength)?;
        let sweep = wavelength.sweep(&path.sweep)?;
        let config = &run.config;
        let backend = run.registry().integrater(
            config.backend(StageKind::Integrater),
            &config.backend_settings(StageKind::Integrater),
        )?;

        let mut state = IntegraterState::new(&sweep.name, sweep.frame.clone(), refiner, sweep.epoch());
        state.set_project_info(DatasetKey::new(&self.name, &crystal.name, &wavelength.name));
        state.set_anomalous(config.anomalous || crystal.is_anomalous());
        if let Some(dmin) = sweep.resolution_high.or(wavelength.dmin) {
            state.set_high_resolution(dmin, true)?;
        }
        let dir = sweep.working_dir(&self.base_path).join("integrate");
        let label = format!("{} integrater", sweep.name);

        let key = self.graph.insert(label, dir, integrater_body(backend, state));
        self.sweep_mut(path)?.stages.integrater = Some(key);
        Ok(key)
    }

    /// The crystal's scaler, created on first use, with an integrater for
    /// every sweep of the crystal attached.
    pub fn ensure_scaler(&mut self, run: &RunContext, crystal: &str) -> Result<StageKey> {
        let paths: Vec<SweepPath> = self.crystal(crystal)?.sweeps().map(XSweep::path).collect();
        let mut integraters = Vec::with_capacity(paths.len());
        for path in &paths {
            let key = self.ensure_integrater(run, path)?;
            integraters.push((self.sweep(path)?.epoch(), key));
        }

        let key = match self.crystal(crystal)?.scaler {
            Some(key) => key,
            None => {
                let xtal = self.crystal(crystal)?;
                let config = &run.config;
                let backend = run.registry().scaler(
                    config.backend(StageKind::Scaler),
                    &config.backend_settings(StageKind::Scaler),
                )?;
                let mut body = scaler_body(backend);
                if let StageBody::Scaler(stage) = &mut body {
                    stage.state.anomalous = config.anomalous || xtal.is_anomalous();
                    stage.state.input_spacegroup = xtal.spacegroup.clone();
                    stage.state.freer_file = xtal.freer_file.clone();
                    stage.state.reference_reflection_file = xtal.reference_reflection_file.clone();
                }
                let dir = xtal.scale_dir(&self.base_path);
                let key = self.graph.insert(format!("{crystal} scaler"), dir, body);
                self.crystal_mut(crystal)?.scaler = Some(key);
                key
            }
        };

        let state = &mut self.graph.node_mut(key)?.body.as_scaler_mut()?.state;
        let mut added = false;
        for (epoch, integrater) in integraters {
            if !state.integraters.values().any(|k| *k == integrater) {
                state.add_integrater(epoch, integrater)?;
                added = true;
            }
        }
        if added {
            self.graph.invalidate(key, Phase::Prepare)?;
        }
        Ok(key)
    }

    pub fn indexer<'a>(&'a mut self, run: &'a RunContext, path: &SweepPath) -> Result<IndexerHandle<'a>> {
        let key = self.ensure_indexer(run, path)?;
        IndexerHandle::new(self.engine(run), key)
    }

    pub fn refiner<'a>(&'a mut self, run: &'a RunContext, path: &SweepPath) -> Result<RefinerHandle<'a>> {
        let key = self.ensure_refiner(run, path)?;
        RefinerHandle::new(self.engine(run), key)
    }

    pub fn integrater<'a>(&'a mut self, run: &'a RunContext, path: &SweepPath) -> Result<IntegraterHandle<'a>> {
        let key = self.ensure_integrater(run, path)?;
        IntegraterHandle::new(self.engine(run), key)
    }

    pub fn scaler<'a>(&'a mut self, run: &'a RunContext, crystal: &str) -> Result<ScalerHandle<'a>> {
        let key = self.ensure_scaler(run, crystal)?;
        ScalerHandle::new(self.engine(run), key)
    }

    /// Change the images of a sweep. Its stages keep their keys and
    /// prepare again.
    pub fn set_image_range(&mut self, path: &SweepPath, first: u32, last: u32) -> Result<()> {
        check_image_range(&path.sweep, (first, last))?;
        let sweep = self.sweep_mut(path)?;
        if sweep.frame.image_range == (first, last) {
            return Ok(());
        }
        sweep.frame.image_range = (first, last);
        let frame = sweep.frame.clone();
        let stages = sweep.stages;

        if let Some(key) = stages.indexer {
            self.graph.node_mut(key)?.body.as_indexer_mut()?.state.set_frame(frame.clone());
            self.graph.invalidate(key, Phase::Prepare)?;
        }
        if let Some(key) = stages.integrater {
            let state = &mut self.graph.node_mut(key)?.body.as_integrater_mut()?.state;
            state.frame = frame;
            state.wedge = None;
            self.graph.invalidate(key, Phase::Prepare)?;
        }
        Ok(())
    }

    /// Assign the crystal's lattice and cell and pass them to every
    /// indexer already created for its sweeps.
    pub fn set_user_lattice(&mut self, crystal: &str, lattice: Lattice, cell: Option<UnitCell>) -> Result<()> {
        let xtal = self.crystal_mut(crystal)?;
        xtal.set_user_lattice(lattice, cell)?;
        let indexers: Vec<StageKey> = xtal.sweeps().filter_map(|s| s.stages.indexer).collect();
        for key in indexers {
            let state = &mut self.graph.node_mut(key)?.body.as_indexer_mut()?.state;
            let mut changed = state.set_input_lattice(lattice, true);
            if let Some(cell) = cell {
                changed |= state.set_input_cell(cell);
            }
            if changed {
                self.graph.invalidate(key, Phase::Prepare)?;
            }
        }
        Ok(())
    }

    /// Set a user high resolution limit on one sweep.
    pub fn set_resolution_high(&mut self, path: &SweepPath, dmin: f64) -> Result<()> {
        let sweep = self.sweep_mut(path)?;
        sweep.resolution_high = Some(dmin);
        if let Some(key) = sweep.stages.integrater {
            let state = &mut self.graph.node_mut(key)?.body.as_integrater_mut()?.state;
            if let Some(phase) = state.set_high_resolution(dmin, true)? {
                self.graph.invalidate(key, phase)?;
            }
        }
        Ok(())
    }

    /// Published files that no longer exist on disk, as
    /// `(stage label, payload key, path)`.
    pub fn missing_payload_files(&self) -> Vec<(String, String, PathBuf)> {
        self.graph
            .nodes()
            .flat_map(|node| {
                node.core
                    .payload
                    .missing_files()
                    .into_iter()
                    .map(move |(key, path)| (node.core.label.clone(), key.to_string(), path.to_path_buf()))
            })
            .collect()
    }

    /// One line per schema object, with the status of each stage.
    pub fn summarise(&self) -> Vec<String> {
        let status = |key: Option<StageKey>| -> String {
            key.and_then(|k| self.graph.node(k).ok())
                .map(|n| format!("{:?}", n.core.flags.status()))
                .unwrap_or_else(|| "-".to_string())
        };

        let mut lines = vec![format!("Project: {}", self.name)];
        for crystal in self.crystals.values() {
            let symmetry = match (crystal.lattice, &crystal.spacegroup) {
                (_, Some(spacegroup)) => format!(" spacegroup {spacegroup}"),
                (Some(lattice), None) => format!(" lattice {lattice}"),
                (None, None) => String::new(),
            };
            lines.push(format!("Crystal: {}{symmetry}", crystal.name));
            for wavelength in crystal.wavelengths() {
                lines.push(format!("  Wavelength: {} ({:.5} A)", wavelength.name, wavelength.wavelength));
                for sweep in wavelength.sweeps() {
                    let (first, last) = sweep.image_range();
                    lines.push(format!(
                        "    Sweep: {} images {first}-{last} indexer {} refiner {} integrater {}",
                        sweep.name,
                        status(sweep.stages.indexer),
                        status(sweep.stages.refiner),
                        status(sweep.stages.integrater),
                    ));
                }
            }
            let Some(scaler) = crystal.scaler else {
                continue;
            };
            lines.push(format!("  Scaler: {}", status(Some(scaler))));
            if let Ok(stage) = self.graph.node(scaler).and_then(|n| n.body.as_scaler()) {
                if let Some(cell) = stage.state.cell {
                    lines.push(format!("    Cell: {cell}"));
                }
                for (dataset, statistics) in &stage.state.statistics {
                    lines.push(format!("    Dataset: {dataset}"));
                    for (name, values) in statistics {
                        let values: Vec<String> = values.iter().map(|v| format!("{v:.3}")).collect();
                        lines.push(format!("      {name}: {}", values.join(" ")));
                    }
                }
            }
        }
        lines
    }

    /// Restore back-references from the forward structure.
    pub(crate) fn relink(&mut self) -> Result<()> {
        for (name, crystal) in self.crystals.iter_mut() {
            if *name != crystal.name {
                return Err(Error::Schema(format!("XCrystal {} stored under {name}", crystal.name)));
            }
            crystal.relink(&self.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageStatus;
    use crate::testing::{self, project};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_duplicate_crystal() {
        let mut project = XProject::new("AUTOMATIC", "/work");
        project.add_crystal(XCrystal::new("XTAL")).unwrap();
        let err = project.add_crystal(XCrystal::new("XTAL")).unwrap_err();
        assert_eq!(err.to_string(), "XCrystal with name XTAL already exists");
        assert_eq!(project.crystal("XTAL").unwrap().project_name(), "AUTOMATIC");
    }

    #[test]
    fn test_stages_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        let path = SweepPath::new("XTAL", "NATIVE", "SWEEP1");

        let refiner = project.ensure_refiner(&run, &path).unwrap();
        assert_eq!(project.graph().len(), 2);
        assert_eq!(project.ensure_refiner(&run, &path).unwrap(), refiner);

        let integrater = project.ensure_integrater(&run, &path).unwrap();
        let node = project.graph().node(integrater).unwrap();
        assert_eq!(node.core.working_dir, dir.path().join("XTAL/NATIVE/SWEEP1/integrate"));
        let state = &node.body.as_integrater().unwrap().state;
        assert_eq!(
            state.project_info,
            Some(DatasetKey::new("AUTOMATIC", "XTAL", "NATIVE"))
        );
        assert_eq!(drivers.calls().len(), 0);
    }

    #[test]
    fn test_user_lattice_reaches_indexers() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        let path = SweepPath::new("XTAL", "NATIVE", "SWEEP1");
        project.indexer(&run, &path).unwrap().run().unwrap();

        project.set_user_lattice("XTAL", Lattice::OrthorhombicP, None).unwrap();
        let mut indexer = project.indexer(&run, &path).unwrap();
        assert_eq!(indexer.status().unwrap(), StageStatus::NotPrepared);
        assert_eq!(indexer.lattice().unwrap(), Lattice::OrthorhombicP);
        assert!(indexer.state().unwrap().user_input_lattice);
    }

    #[test]
    fn test_image_range_change_invalidates_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        let path = SweepPath::new("XTAL", "NATIVE", "SWEEP1");
        project.integrater(&run, &path).unwrap().run().unwrap();

        assert!(project.set_image_range(&path, 5, 1).is_err());
        project.set_image_range(&path, 1, 45).unwrap();
        let stages = project.sweep(&path).unwrap().stages;
        for key in stages.keys() {
            assert_eq!(project.graph().node(key).unwrap().core.flags.status(), StageStatus::NotPrepared);
        }

        let mut integrater = project.integrater(&run, &path).unwrap();
        assert_eq!(integrater.batches().unwrap(), (1, 45));
        assert_eq!(drivers.count_in("xds_par", "index"), 2);
    }

    #[test]
    fn test_summarise() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let mut project = project(dir.path(), &["SWEEP1"]);
        project.scaler(&run, "XTAL").unwrap().run().unwrap();

        let summary = project.summarise();
        assert_eq!(summary[0], "Project: AUTOMATIC");
        assert!(summary.iter().any(|l| l.contains("Sweep: SWEEP1 images 1-90 indexer Finished")));
        assert!(summary.iter().any(|l| l == "  Scaler: Finished"));
        assert!(summary.iter().any(|l| l.contains("Completeness: 99.800 99.100 99.900")));
        assert!(project.missing_payload_files().is_empty());
    }
}

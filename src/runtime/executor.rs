//! Pipeline orchestrator.
//!
//! Drives a project from images to scaled reflections: every sweep is
//! integrated, then every crystal is scaled. Sweeps whose stage chains
//! share nothing are integrated in parallel, each in a graph split off
//! from the project's and merged back once all have finished.

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::schema::{SweepPath, XProject};
use crate::stage::{Engine, StageGraph, StageKey};
use log::{error, info, warn};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// Written to the base directory when a run fails.
pub const ERROR_FILE: &str = "xia2-error.txt";

/// Runs whole projects within one [`RunContext`].
pub struct Pipeline<'a> {
    run: &'a RunContext,
}

impl<'a> Pipeline<'a> {
    pub fn new(run: &'a RunContext) -> Self {
        Self { run }
    }

    /// Bring every sweep's integrater to FINISHED.
    ///
    /// All sweeps are attempted; the first failure is returned.
    pub fn integrate_all(&self, project: &mut XProject) -> Result<()> {
        let mut targets: Vec<(SweepPath, StageKey, Vec<StageKey>)> = Vec::new();
        for path in project.sweep_paths() {
            let key = project.ensure_integrater(self.run, &path)?;
            let mut chain = project.graph().upstream_closure(key)?;
            chain.push(key);
            targets.push((path, key, chain));
        }

        let width = self.run.config.nproc.min(targets.len());
        if width < 2 || !disjoint(targets.iter().map(|(_, _, chain)| chain.as_slice())) {
            let mut first_error = None;
            for (path, key, _) in &targets {
                if let Err(err) = project.engine(self.run).ensure_finished(*key) {
                    error!("{path}: {err}");
                    first_error.get_or_insert(err);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        let mut parts = Vec::with_capacity(targets.len());
        for (_, _, chain) in &targets {
            match project.graph.split_off(chain) {
                Ok(part) => parts.push(part),
                Err(err) => {
                    for part in parts {
                        project.graph.absorb(part)?;
                    }
                    return Err(err);
                }
            }
        }

        info!("integrating {} sweeps on {width} threads", targets.len());
        let run = self.run;
        let work = |(mut part, (path, key, _)): (StageGraph, &(SweepPath, StageKey, Vec<StageKey>))| {
            let result = Engine::new(&mut part, run).ensure_finished(*key);
            if let Err(err) = &result {
                error!("{path}: {err}");
            }
            (part, result)
        };
        let finished: Vec<(StageGraph, Result<()>)> = match rayon::ThreadPoolBuilder::new().num_threads(width).build() {
            Ok(pool) => pool.install(|| parts.into_par_iter().zip(targets.par_iter()).map(work).collect()),
            Err(err) => {
                warn!("cannot start sweep workers ({err}), integrating serially");
                parts.into_iter().zip(targets.iter()).map(work).collect()
            }
        };

        let mut first_error = None;
        for (part, result) in finished {
            project.graph.absorb(part)?;
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Scale one crystal, returning its merged MTZ file.
    pub fn scale_crystal(&self, project: &mut XProject, crystal: &str) -> Result<PathBuf> {
        let mut scaler = project.scaler(self.run, crystal)?;
        let merged = scaler.scaled_reflections("mtz")?;
        let spacegroup = scaler.spacegroup()?;
        let cell = scaler.cell()?;
        info!("{crystal}: {spacegroup} {cell}");
        Ok(merged)
    }

    /// Integrate everything, scale every crystal and save the project.
    pub fn process(&self, project: &mut XProject) -> Result<()> {
        self.integrate_all(project)?;
        let crystals: Vec<String> = project.crystals().map(|c| c.name.clone()).collect();
        for crystal in crystals {
            let merged = self.scale_crystal(project, &crystal)?;
            info!("{crystal}: scaled reflections in {}", merged.display());
        }
        project.write_json()?;
        for line in project.summarise() {
            info!("{line}");
        }
        for line in self.run.timing_report() {
            info!("{line}");
        }
        Ok(())
    }

    /// [`Pipeline::process`], leaving the error and its causes in
    /// `xia2-error.txt` under the base directory if it fails.
    pub fn run_and_report(&self, project: &mut XProject) -> Result<()> {
        let Err(err) = self.process(project) else {
            return Ok(());
        };
        let path = project.base_path.join(ERROR_FILE);
        match fs::create_dir_all(&project.base_path).and_then(|_| fs::write(&path, error_report(&err))) {
            Ok(()) => error!("{err} (details in {})", path.display()),
            Err(io) => error!("{err} (could not write {}: {io})", path.display()),
        }
        Err(err)
    }
}

/// The error followed by each of its sources.
pub fn error_report(err: &Error) -> String {
    let mut report = format!("Error: {err}\n");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let _ = writeln!(report, "Caused by: {cause}");
        source = cause.source();
    }
    report
}

fn disjoint<'k>(chains: impl Iterator<Item = &'k [StageKey]>) -> bool {
    let mut seen = BTreeSet::new();
    chains.flatten().all(|key| seen.insert(*key))
}

//! The dependency engine: pulls stages through their phases on demand and
//! pushes invalidation to everything downstream.
//!
//! Three rules govern every stage:
//!
//! 1. A phase only runs once every earlier phase of the same stage has
//!    succeeded, and only after all producers have FINISHED.
//! 2. Clearing a stage's flags clears the prepare flag of every stage that
//!    consumes it, transitively.
//! 3. A consumer remembers each producer's generation when it prepares;
//!    a producer that has finished again since then makes the consumer
//!    prepare again.
//!
//! Phases are transactional: the stage body runs on a copy, and the copy,
//! the new payload and the flag are committed together only on success.

use super::graph::StageGraph;
use super::node::{PhaseContext, StageBody, Upstream};
use super::traits::{Phase, PhaseOutcome, StageFlags, StageKey, StageKind, StageStatus, UpstreamRequest};
use crate::context::RunContext;
use crate::data::{Lattice, LatticeAssertion, Payload};
use crate::error::{Error, Result};
use log::{debug, info, warn};

pub struct Engine<'a> {
    graph: &'a mut StageGraph,
    run: &'a RunContext,
}

impl<'a> Engine<'a> {
    pub fn new(graph: &'a mut StageGraph, run: &'a RunContext) -> Self {
        Self { graph, run }
    }

    /// A shorter-lived engine over the same graph.
    pub fn reborrow(&mut self) -> Engine<'_> {
        Engine {
            graph: &mut *self.graph,
            run: self.run,
        }
    }

    pub fn graph(&self) -> &StageGraph {
        self.graph
    }

    pub fn run_context(&self) -> &'a RunContext {
        self.run
    }

    pub fn status(&self, key: StageKey) -> Result<StageStatus> {
        Ok(self.graph.node(key)?.core.flags.status())
    }

    pub fn flags(&self, key: StageKey) -> Result<StageFlags> {
        Ok(self.graph.node(key)?.core.flags)
    }

    pub fn payload(&self, key: StageKey) -> Result<&Payload> {
        Ok(&self.graph.node(key)?.core.payload)
    }

    /// Mutable access to a stage's body. Callers must invalidate the
    /// stage themselves if they change an input.
    pub fn body_mut(&mut self, key: StageKey) -> Result<&mut StageBody> {
        Ok(&mut self.graph.node_mut(key)?.body)
    }

    pub fn body(&self, key: StageKey) -> Result<&StageBody> {
        Ok(&self.graph.node(key)?.body)
    }

    /// Drive `key`, and everything it depends on, to FINISHED.
    pub fn ensure_finished(&mut self, key: StageKey) -> Result<()> {
        let limit = self.run.config.max_stage_cycles;
        for _ in 0..limit {
            for producer in self.graph.producers(key)? {
                self.ensure_finished(producer)?;
            }
            self.refresh_seen(key)?;

            let Some(phase) = self.status(key)?.next_phase() else {
                return Ok(());
            };
            match self.run_phase(key, phase) {
                Ok(outcome) => self.apply_requests(key, outcome.requests)?,
                Err(err) => self.recover(key, phase, err)?,
            }
        }
        Err(Error::NoProgress {
            stage: self.graph.node(key)?.core.label.clone(),
            cycles: limit,
        })
    }

    /// Invalidate `key` from `phase`; see [`StageGraph::invalidate`].
    pub fn invalidate(&mut self, key: StageKey, phase: Phase) -> Result<()> {
        self.graph.invalidate(key, phase)
    }

    /// Drop the current lattice of indexer `key` and re-target it at the
    /// next solution.
    pub fn eliminate(&mut self, key: StageKey) -> Result<Lattice> {
        let node = self.graph.node_mut(key)?;
        let label = node.core.label.clone();
        let lattice = node.body.as_indexer_mut()?.state.eliminate()?;
        warn!("{label}: eliminated lattice, now trying {lattice}");
        self.invalidate(key, Phase::Perform)?;
        Ok(lattice)
    }

    /// Check indexer `key` against `lattice`; a possible but non-current
    /// lattice becomes the indexer's target and the indexer re-runs.
    pub fn assert_lattice(&mut self, key: StageKey, lattice: Lattice) -> Result<LatticeAssertion> {
        let node = self.graph.node_mut(key)?;
        let label = node.core.label.clone();
        let assertion = node.body.as_indexer_mut()?.state.assert_lattice(lattice)?;
        match assertion {
            LatticeAssertion::Possible => {
                info!("{label}: lattice {lattice} asserted, re-indexing");
                self.invalidate(key, Phase::Perform)?;
            }
            LatticeAssertion::Impossible => {
                warn!("{label}: asserted lattice {lattice} is not among its solutions");
            }
            LatticeAssertion::Correct => {}
        }
        Ok(assertion)
    }

    /// Replace indexer `key` with a fresh one built on `backend`, keeping
    /// its key so consumers stay attached.
    pub fn replace_indexer(&mut self, key: StageKey, backend: &str) -> Result<()> {
        let backend = self
            .run
            .registry()
            .indexer(backend, &serde_json::Value::Null)?;
        let node = self.graph.node_mut(key)?;
        let replacement = node.body.as_indexer()?.substitute(backend);
        info!(
            "{}: replacing {} indexer with {}",
            node.core.label,
            node.body.backend_name(),
            replacement.backend.name()
        );
        node.body = StageBody::Indexer(replacement);
        node.core.payload = Payload::new();
        node.core.seen.clear();
        self.invalidate(key, Phase::Prepare)
    }

    fn refresh_seen(&mut self, key: StageKey) -> Result<()> {
        let node = self.graph.node(key)?;
        if !node.core.flags.prepare_done {
            return Ok(());
        }
        let mut stale = None;
        for producer in node.body.producers() {
            let generation = self.graph.node(producer)?.core.generation;
            if node.core.seen.get(&producer) != Some(&generation) {
                stale = Some(producer);
                break;
            }
        }
        if let Some(producer) = stale {
            debug!("{}: {} has changed since prepare", node.core.label, producer);
            self.invalidate(key, Phase::Prepare)?;
        }
        Ok(())
    }

    fn run_phase(&mut self, key: StageKey, phase: Phase) -> Result<PhaseOutcome> {
        let upstream = self
            .graph
            .producers(key)?
            .into_iter()
            .map(|p| self.graph.node(p).map(Upstream::from_node))
            .collect::<Result<Vec<_>>>()?;

        let node = self.graph.node(key)?;
        debug!("{}: {}", node.core.label, phase.name());
        let mut body = node.body.clone();
        let result = {
            let mut ctx = PhaseContext::new(self.run, &node.core, &upstream);
            body.run(phase, &mut ctx).map(|outcome| (outcome, ctx.staged))
        };

        let node = self.graph.node_mut(key)?;
        node.core.executions[phase as usize] += 1;
        let (outcome, staged) = result?;

        node.body = body;
        node.core.payload.commit(phase, staged);
        node.core.flags.mark(phase);
        match phase {
            Phase::Prepare => {
                node.core.seen = upstream.iter().map(|u| (u.key, u.generation)).collect();
            }
            Phase::Finish => {
                node.core.generation += 1;
                info!("{}: finished", node.core.label);
            }
            Phase::Perform => {}
        }
        Ok(outcome)
    }

    /// Handle a failed phase: substitute a failed indexer, or eliminate
    /// the lattice a refiner or integrater rejected. Anything else
    /// propagates.
    fn recover(&mut self, key: StageKey, phase: Phase, error: Error) -> Result<()> {
        let node = self.graph.node(key)?;
        let label = node.core.label.clone();
        match node.kind() {
            StageKind::Indexer if error.is_tool() => {
                let failed = node.body.backend_name();
                match self.run.fallback().substitute(key, failed, &error) {
                    Some(replacement) => {
                        warn!("{label}: {failed} {} failed ({error}), trying {replacement}", phase.name());
                        self.replace_indexer(key, &replacement)
                    }
                    None => Err(error),
                }
            }
            StageKind::Refiner | StageKind::Integrater if error.is_bad_lattice() => {
                warn!("{label}: rejecting bad lattice: {error}");
                if self.eliminate_upstream(key)? == 0 {
                    return Err(error);
                }
                Ok(())
            }
            _ => Err(error),
        }
    }

    fn apply_requests(&mut self, key: StageKey, requests: Vec<UpstreamRequest>) -> Result<()> {
        for request in requests {
            match request {
                UpstreamRequest::AssertLattice(lattice) => {
                    for indexer in self.upstream_indexers(key)? {
                        self.assert_lattice(indexer, lattice)?;
                    }
                }
                UpstreamRequest::EliminateLattice => {
                    self.eliminate_upstream(key)?;
                }
                UpstreamRequest::ReplaceIndexer { key: indexer, backend } => {
                    self.replace_indexer(indexer, &backend)?;
                }
            }
        }
        Ok(())
    }

    /// Eliminate the current lattice of every indexer upstream of `key`
    /// that has solutions. Returns how many were changed.
    pub fn eliminate_upstream(&mut self, key: StageKey) -> Result<usize> {
        let mut count = 0;
        for indexer in self.upstream_indexers(key)? {
            let has_solutions = self.graph.node(indexer)?.body.as_indexer()?.state.solutions.is_some();
            if has_solutions {
                self.eliminate(indexer)?;
                count += 1;
            }
        }
        Ok(count)
    }

    fn upstream_indexers(&self, key: StageKey) -> Result<Vec<StageKey>> {
        let mut keys = Vec::new();
        for candidate in self.graph.upstream_closure(key)? {
            if self.graph.node(candidate)?.kind() == StageKind::Indexer {
                keys.push(candidate);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::UnitCell;
    use crate::runtime::policy::NeverFallback;
    use crate::testing::{self, ScriptedDrivers};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_getter_runs_each_phase_once() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);

        engine.ensure_finished(chain.integrater).unwrap();
        engine.ensure_finished(chain.integrater).unwrap();

        for key in [chain.indexer, chain.refiner, chain.integrater] {
            assert_eq!(engine.status(key).unwrap(), StageStatus::Finished);
            let core = &engine.graph().node(key).unwrap().core;
            for phase in Phase::ALL {
                assert_eq!(core.executions(phase), 1, "{} {}", core.label, phase.name());
            }
        }
        assert_eq!(drivers.count_in("xds_par", "index"), 1);
        assert_eq!(drivers.count_in("xds_par", "integrate"), 1);
    }

    #[test]
    fn test_invalidation_cascades_downstream_only() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);
        engine.ensure_finished(chain.integrater).unwrap();

        engine.invalidate(chain.refiner, Phase::Finish).unwrap();
        assert_eq!(engine.status(chain.indexer).unwrap(), StageStatus::Finished);
        assert_eq!(engine.status(chain.refiner).unwrap(), StageStatus::Executed);
        assert_eq!(engine.status(chain.integrater).unwrap(), StageStatus::NotPrepared);
    }

    #[test]
    fn test_producer_rerun_makes_consumer_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);
        engine.ensure_finished(chain.integrater).unwrap();

        // Bump the producer generation behind the engine's back, as a
        // partitioned run that re-indexed would.
        engine.graph.node_mut(chain.indexer).unwrap().core.generation += 1;
        engine.ensure_finished(chain.integrater).unwrap();

        assert_eq!(drivers.count_in("xds_par", "index"), 1);
        let refiner = &engine.graph().node(chain.refiner).unwrap().core;
        assert_eq!(refiner.executions(Phase::Prepare), 2);
        assert_eq!(drivers.count_in("xds_par", "integrate"), 2);
    }

    #[test]
    fn test_failed_phase_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = Arc::new(ScriptedDrivers::standard());
        drivers.fail("xds_par", &["!!! ERROR !!! INSUFFICIENT PERCENTAGE (< 50%) OF INDEXED REFLECTIONS"], 0);
        let run = testing::run_context_with(dir.path(), drivers.clone())
            .with_fallback(Arc::new(NeverFallback));
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);

        let err = engine.ensure_finished(chain.integrater).unwrap_err();
        assert!(err.to_string().contains("INSUFFICIENT PERCENTAGE"), "{err}");

        let indexer = engine.graph().node(chain.indexer).unwrap();
        assert_eq!(indexer.core.flags.status(), StageStatus::Prepared);
        assert!(indexer.body.as_indexer().unwrap().state.solutions.is_none());
        assert!(!indexer.core.payload.contains("XPARM.XDS"));
        assert_eq!(engine.status(chain.refiner).unwrap(), StageStatus::NotPrepared);
    }

    #[test]
    fn test_bad_lattice_eliminates_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = Arc::new(ScriptedDrivers::standard());
        // Integration refines an orthorhombic cell for the first attempt,
        // which the tetragonal lattice cannot hold.
        drivers.set_integrated_cells(&[
            [78.0, 79.5, 37.1, 90.0, 90.0, 90.0],
            [78.0, 79.5, 37.1, 90.0, 90.0, 90.0],
        ]);
        let run = testing::run_context_with(dir.path(), drivers.clone());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);

        engine.ensure_finished(chain.integrater).unwrap();

        let indexer = engine.body(chain.indexer).unwrap().as_indexer().unwrap();
        assert_eq!(indexer.state.lattice, Some(Lattice::OrthorhombicP));
        assert_eq!(drivers.count_in("xds_par", "index"), 2);
        assert_eq!(drivers.count_in("xds_par", "integrate"), 2);
    }

    #[test]
    fn test_indexer_falls_back_to_alternate_engine() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = Arc::new(ScriptedDrivers::standard());
        drivers.fail("xds_par", &["Segmentation fault"], 139);
        let run = testing::run_context_with(dir.path(), drivers.clone());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);
        let cell = UnitCell::new([78.0, 78.0, 37.0, 90.0, 90.0, 90.0]).unwrap();
        let state = &mut engine.body_mut(chain.indexer).unwrap().as_indexer_mut().unwrap().state;
        state.set_input_lattice(Lattice::TetragonalP, true);
        state.set_input_cell(cell);

        engine.ensure_finished(chain.indexer).unwrap();

        let indexer = engine.body(chain.indexer).unwrap();
        assert_eq!(indexer.backend_name(), "dials");
        assert_eq!(drivers.count("dials.index"), 1);
        let state = &indexer.as_indexer().unwrap().state;
        assert_eq!(state.input_cell, Some(cell));
        assert!(state.user_input_lattice);
    }

    #[test]
    fn test_no_progress_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut run, _drivers) = testing::run_context(dir.path());
        run.config.max_stage_cycles = 2;
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let mut engine = Engine::new(&mut graph, &run);

        let err = engine.ensure_finished(chain.indexer).unwrap_err();
        assert!(matches!(err, Error::NoProgress { cycles: 2, .. }), "{err}");
        assert_eq!(engine.status(chain.indexer).unwrap(), StageStatus::Executed);
    }
}

//! Stage nodes: the bookkeeping every stage shares, the per-kind body,
//! and the context a phase runs in.

use super::indexer::{IndexerStage, IndexerState};
use super::integrater::{IntegraterStage, IntegraterState};
use super::refiner::{RefinerStage, RefinerState};
use super::scaler::{ScalerStage, ScalerState};
use super::traits::{Phase, PhaseOutcome, StageFlags, StageKey, StageKind};
use crate::context::RunContext;
use crate::data::{Payload, StagedPayload};
use crate::driver::Driver;
use crate::error::{Error, Result, ToolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bookkeeping shared by every stage regardless of kind.
#[derive(Debug, Clone)]
pub struct StageCore {
    /// Key of the node this core belongs to.
    pub key: StageKey,
    /// Human readable name, e.g. `SWEEP1 indexer`.
    pub label: String,
    /// Where the stage's programs run and write their files.
    pub working_dir: PathBuf,
    /// Which phases are current.
    pub flags: StageFlags,
    /// Bumped every time the stage reaches FINISHED.
    pub generation: u64,
    /// Artifacts committed by phases that succeeded.
    pub payload: Payload,
    /// Producer generations observed when this stage last prepared.
    pub seen: BTreeMap<StageKey, u64>,
    /// Phase executions in this process; never persisted.
    pub executions: [usize; 3],
}

impl StageCore {
    /// A fresh core with every flag cleared and an empty payload.
    pub fn new(key: StageKey, label: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            key,
            label: label.into(),
            working_dir: working_dir.into(),
            flags: StageFlags::default(),
            generation: 0,
            payload: Payload::new(),
            seen: BTreeMap::new(),
            executions: [0; 3],
        }
    }

    /// How many times `phase` has run since this process loaded the stage.
    pub fn executions(&self, phase: Phase) -> usize {
        self.executions[phase as usize]
    }
}

/// Serializable snapshot of a stage's parameters and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageState {
    /// Lattice solutions and beam geometry of one sweep.
    Indexer(IndexerState),
    /// Indexers by sweep epoch and the refined cell.
    Refiner(RefinerState),
    /// Resolution, batches and per-image statistics of one sweep.
    Integrater(IntegraterState),
    /// Integraters by epoch and the merged results.
    Scaler(ScalerState),
}

impl StageState {
    /// The kind of stage this state belongs to.
    pub fn kind(&self) -> StageKind {
        match self {
            StageState::Indexer(_) => StageKind::Indexer,
            StageState::Refiner(_) => StageKind::Refiner,
            StageState::Integrater(_) => StageKind::Integrater,
            StageState::Scaler(_) => StageKind::Scaler,
        }
    }

    /// The indexer state, or `None` for any other kind.
    pub fn as_indexer(&self) -> Option<&IndexerState> {
        match self {
            StageState::Indexer(state) => Some(state),
            _ => None,
        }
    }

    /// The refiner state, or `None` for any other kind.
    pub fn as_refiner(&self) -> Option<&RefinerState> {
        match self {
            StageState::Refiner(state) => Some(state),
            _ => None,
        }
    }

    /// The integrater state, or `None` for any other kind.
    pub fn as_integrater(&self) -> Option<&IntegraterState> {
        match self {
            StageState::Integrater(state) => Some(state),
            _ => None,
        }
    }
}

/// Kind-specific half of a stage: its state and the backend that runs it.
#[derive(Debug, Clone)]
pub enum StageBody {
    Indexer(IndexerStage),
    Refiner(RefinerStage),
    Integrater(IntegraterStage),
    Scaler(ScalerStage),
}

fn wrong_kind(expected: StageKind, found: StageKind) -> Error {
    Error::InvalidArgument(format!("expected {expected} stage, found {found}"))
}

impl StageBody {
    /// The kind of stage this body implements.
    pub fn kind(&self) -> StageKind {
        match self {
            StageBody::Indexer(_) => StageKind::Indexer,
            StageBody::Refiner(_) => StageKind::Refiner,
            StageBody::Integrater(_) => StageKind::Integrater,
            StageBody::Scaler(_) => StageKind::Scaler,
        }
    }

    /// Registered name of the backend, as persisted.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StageBody::Indexer(stage) => stage.backend.name(),
            StageBody::Refiner(stage) => stage.backend.name(),
            StageBody::Integrater(stage) => stage.backend.name(),
            StageBody::Scaler(stage) => stage.backend.name(),
        }
    }

    /// Settings that rebuild the backend through the registry.
    pub fn backend_settings(&self) -> serde_json::Value {
        match self {
            StageBody::Indexer(stage) => stage.backend.settings(),
            StageBody::Refiner(stage) => stage.backend.settings(),
            StageBody::Integrater(stage) => stage.backend.settings(),
            StageBody::Scaler(stage) => stage.backend.settings(),
        }
    }

    /// Snapshot of the state, for saving or for downstream stages.
    pub fn state(&self) -> StageState {
        match self {
            StageBody::Indexer(stage) => StageState::Indexer(stage.state.clone()),
            StageBody::Refiner(stage) => StageState::Refiner(stage.state.clone()),
            StageBody::Integrater(stage) => StageState::Integrater(stage.state.clone()),
            StageBody::Scaler(stage) => StageState::Scaler(stage.state.clone()),
        }
    }

    /// Stages whose payload this one consumes.
    pub fn producers(&self) -> Vec<StageKey> {
        match self {
            StageBody::Indexer(_) => Vec::new(),
            StageBody::Refiner(stage) => stage.state.indexers.values().copied().collect(),
            StageBody::Integrater(stage) => vec![stage.state.refiner],
            StageBody::Scaler(stage) => stage.state.integraters.values().copied().collect(),
        }
    }

    pub(crate) fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        match self {
            StageBody::Indexer(stage) => stage.run(phase, ctx),
            StageBody::Refiner(stage) => stage.run(phase, ctx),
            StageBody::Integrater(stage) => stage.run(phase, ctx),
            StageBody::Scaler(stage) => stage.run(phase, ctx),
        }
    }

    /// Clear derived inputs that do not survive a reset of `phase`.
    pub(crate) fn on_invalidate(&mut self, phase: Phase) {
        if let StageBody::Integrater(stage) = self {
            stage.state.on_invalidate(phase);
        }
    }

    /// The indexer stage; errors naming both kinds if this is another.
    pub fn as_indexer(&self) -> Result<&IndexerStage> {
        match self {
            StageBody::Indexer(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Indexer, other.kind())),
        }
    }

    pub fn as_indexer_mut(&mut self) -> Result<&mut IndexerStage> {
        match self {
            StageBody::Indexer(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Indexer, other.kind())),
        }
    }

    pub fn as_refiner(&self) -> Result<&RefinerStage> {
        match self {
            StageBody::Refiner(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Refiner, other.kind())),
        }
    }

    pub fn as_refiner_mut(&mut self) -> Result<&mut RefinerStage> {
        match self {
            StageBody::Refiner(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Refiner, other.kind())),
        }
    }

    pub fn as_integrater(&self) -> Result<&IntegraterStage> {
        match self {
            StageBody::Integrater(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Integrater, other.kind())),
        }
    }

    pub fn as_integrater_mut(&mut self) -> Result<&mut IntegraterStage> {
        match self {
            StageBody::Integrater(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Integrater, other.kind())),
        }
    }

    pub fn as_scaler(&self) -> Result<&ScalerStage> {
        match self {
            StageBody::Scaler(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Scaler, other.kind())),
        }
    }

    pub fn as_scaler_mut(&mut self) -> Result<&mut ScalerStage> {
        match self {
            StageBody::Scaler(stage) => Ok(stage),
            other => Err(wrong_kind(StageKind::Scaler, other.kind())),
        }
    }
}

/// One stage in the graph.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub core: StageCore,
    pub body: StageBody,
}

impl StageNode {
    /// Shorthand for the body's kind.
    pub fn kind(&self) -> StageKind {
        self.body.kind()
    }
}

/// Read-only view of a producer, taken just before a phase runs.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub key: StageKey,
    pub label: String,
    /// Generation of the producer when the view was taken.
    pub generation: u64,
    /// Name of the producer's backend.
    pub backend: &'static str,
    pub payload: Payload,
    pub state: StageState,
}

impl Upstream {
    /// Snapshot `node` as its consumers will see it.
    pub fn from_node(node: &StageNode) -> Self {
        Self {
            key: node.core.key,
            label: node.core.label.clone(),
            generation: node.core.generation,
            backend: node.body.backend_name(),
            payload: node.core.payload.clone(),
            state: node.body.state(),
        }
    }

    /// A file the producer must have published.
    pub fn require_file(&self, key: &str) -> Result<&Path> {
        self.payload.file(key).ok_or_else(|| Error::PayloadMissing {
            stage: self.label.clone(),
            key: key.to_string(),
        })
    }
}

/// Everything a backend may touch while running one phase.
///
/// Artifacts go into `staged` and are only committed to the stage's
/// payload once the phase returns successfully.
pub struct PhaseContext<'a> {
    pub run: &'a RunContext,
    pub core: &'a StageCore,
    pub upstream: &'a [Upstream],
    pub staged: StagedPayload,
}

impl<'a> PhaseContext<'a> {
    pub fn new(run: &'a RunContext, core: &'a StageCore, upstream: &'a [Upstream]) -> Self {
        Self {
            run,
            core,
            upstream,
            staged: StagedPayload::default(),
        }
    }

    /// The stage's working directory, which may not exist yet.
    pub fn working_dir(&self) -> &Path {
        &self.core.working_dir
    }

    /// The working directory, created if missing.
    pub fn ensure_working_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.core.working_dir)?;
        Ok(&self.core.working_dir)
    }

    /// A numbered driver for `executable`, running in this stage's
    /// working directory.
    pub fn driver(&self, executable: &str) -> Result<Box<dyn Driver>> {
        let dir = self.ensure_working_dir()?;
        let mut driver = self.run.create_driver(executable)?;
        driver.set_working_directory(dir);
        Ok(driver)
    }

    /// Start a driver, wait for it, record its timing and raise any
    /// failure visible in its output.
    pub fn run_job(&self, driver: &mut dyn Driver) -> Result<()> {
        driver.start()?;
        driver.close_wait()?;
        self.record_job(driver);
        driver.check_for_errors()
    }

    /// Record timing for a driver that has been waited on.
    pub fn record_job(&self, driver: &dyn Driver) {
        if let Some(timing) = driver.common().timing() {
            self.run.record_timing(timing);
        }
    }

    /// The snapshot of producer `key`.
    pub fn upstream(&self, key: StageKey) -> Result<&Upstream> {
        self.upstream
            .iter()
            .find(|u| u.key == key)
            .ok_or(Error::UnknownStage(key.0))
    }

    /// Stage a file produced by `program`, failing if it was not written.
    pub fn publish_file(&mut self, program: &str, key: &str, path: PathBuf) -> Result<()> {
        if !path.exists() {
            return Err(ToolError::MissingOutput {
                program: program.to_string(),
                path,
            }
            .into());
        }
        self.staged.insert_file(key, path);
        Ok(())
    }
}

//! Stage kinds, lifecycle phases and phase flags.

use crate::data::Lattice;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four kinds of processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    /// Finds candidate lattices and an orientation from the images of one
    /// sweep.
    Indexer,
    /// Refines the geometry of one or more indexed sweeps.
    Refiner,
    /// Measures reflection intensities over a sweep's images.
    Integrater,
    /// Merges the integrated intensities of every sweep of a crystal.
    Scaler,
}

impl StageKind {
    /// Lowercase name used in labels, logs and configuration keys.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Indexer => "indexer",
            StageKind::Refiner => "refiner",
            StageKind::Integrater => "integrater",
            StageKind::Scaler => "scaler",
        }
    }

    /// Name of the perform phase for this kind.
    pub fn action(&self) -> &'static str {
        match self {
            StageKind::Indexer => "index",
            StageKind::Refiner => "refine",
            StageKind::Integrater => "integrate",
            StageKind::Scaler => "scale",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three lifecycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Set up inputs and settle choices such as the lattice or spacegroup.
    Prepare,
    /// The main job of the stage: index, refine, integrate or scale.
    Perform,
    /// Checks and conversions of the results.
    Finish,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Prepare, Phase::Perform, Phase::Finish];

    /// Lowercase name, as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Perform => "perform",
            Phase::Finish => "finish",
        }
    }
}

/// Overall status derived from the phase flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageStatus {
    /// Nothing has run since creation or the last invalidation.
    NotPrepared,
    /// Prepare succeeded; perform has not.
    Prepared,
    /// Perform succeeded; finish has not.
    Executed,
    /// Every phase is current and results can be read.
    Finished,
}

impl StageStatus {
    /// The phase that must run next, if any.
    pub fn next_phase(&self) -> Option<Phase> {
        match self {
            StageStatus::NotPrepared => Some(Phase::Prepare),
            StageStatus::Prepared => Some(Phase::Perform),
            StageStatus::Executed => Some(Phase::Finish),
            StageStatus::Finished => None,
        }
    }
}

/// The three phase flags of one stage.
///
/// Flags are set one at a time, in phase order, after a phase succeeds.
/// Clearing a flag also clears every later one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub prepare_done: bool,
    pub done: bool,
    pub finish_done: bool,
}

impl StageFlags {
    /// The status these flags amount to.
    pub fn status(&self) -> StageStatus {
        if !self.prepare_done {
            StageStatus::NotPrepared
        } else if !self.done {
            StageStatus::Prepared
        } else if !self.finish_done {
            StageStatus::Executed
        } else {
            StageStatus::Finished
        }
    }

    /// Whether `phase` has completed and not been invalidated since.
    pub fn is_done(&self, phase: Phase) -> bool {
        match phase {
            Phase::Prepare => self.prepare_done,
            Phase::Perform => self.done,
            Phase::Finish => self.finish_done,
        }
    }

    /// Record that `phase` completed.
    pub fn mark(&mut self, phase: Phase) {
        match phase {
            Phase::Prepare => self.prepare_done = true,
            Phase::Perform => self.done = true,
            Phase::Finish => self.finish_done = true,
        }
    }

    /// Clear `phase` and everything after it. Returns whether any flag
    /// actually changed.
    pub fn reset_from(&mut self, phase: Phase) -> bool {
        let before = *self;
        if phase <= Phase::Prepare {
            self.prepare_done = false;
        }
        if phase <= Phase::Perform {
            self.done = false;
        }
        self.finish_done = false;
        before != *self
    }
}

/// Arena key of a stage.
///
/// Keys are handed out by the graph in insertion order and never reused,
/// so they stay valid across save and reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageKey(pub u64);

impl From<u64> for StageKey {
    fn from(key: u64) -> Self {
        StageKey(key)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Follow-up work a phase asks of the stages upstream of it.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    /// Check every upstream indexer against this lattice, re-running those
    /// for which it is possible but not current.
    AssertLattice(Lattice),
    /// Drop the current lattice of every upstream indexer.
    EliminateLattice,
    /// Replace the indexer `key` with a fresh one of backend `backend`.
    ReplaceIndexer { key: StageKey, backend: String },
}

/// Result of one successful phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    /// Applied by the engine, in order, once the phase is committed.
    pub requests: Vec<UpstreamRequest>,
}

impl PhaseOutcome {
    /// A phase with no follow-up work.
    pub fn done() -> Self {
        Self::default()
    }

    /// A phase that asks for follow-up work upstream.
    pub fn with_requests(requests: Vec<UpstreamRequest>) -> Self {
        Self { requests }
    }
}

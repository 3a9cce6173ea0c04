//! Processing stages and the dependency engine that drives them.
//!
//! Every stage runs three phases (prepare, perform, finish) guarded by
//! flags. Changing an input clears the flags from the earliest affected
//! phase, and the [`Engine`] re-runs whatever is needed the next time a
//! result is requested.

pub mod engine;
pub mod graph;
pub mod handle;
pub mod indexer;
pub mod integrater;
pub mod node;
pub mod refiner;
pub mod registry;
pub mod scaler;
pub mod traits;

pub use engine::Engine;
pub use graph::{StageGraph, StageRecord};
pub use handle::StageHandle;
pub use indexer::{IndexerBackend, IndexerHandle, IndexerState};
pub use integrater::{IntegraterBackend, IntegraterHandle, IntegraterState};
pub use node::{PhaseContext, StageBody, StageCore, StageNode, StageState, Upstream};
pub use refiner::{RefinerBackend, RefinerHandle, RefinerState};
pub use registry::{Backend, BackendRegistry};
pub use scaler::{ScalerBackend, ScalerHandle, ScalerState};
pub use traits::{Phase, PhaseOutcome, StageFlags, StageKey, StageKind, StageStatus, UpstreamRequest};

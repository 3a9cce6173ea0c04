//! Unified error type for the crate.
//!
//! The variants follow the four failure classes the pipeline distinguishes:
//! configuration problems found at startup, failures of external programs,
//! scientifically invalid results from a program that nominally succeeded,
//! and violations of the stage-state contract.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the driver layer while running an external program.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("executable {0} does not exist in PATH")]
    NotAvailable(String),

    #[error("child missing library {0}")]
    MissingLibrary(String),

    #[error("child library not loaded: {0}")]
    LibraryNotLoaded(String),

    #[error("child segmentation fault")]
    SegmentationFault,

    #[error("child floating point exception")]
    FloatingPoint,

    #[error("child killed")]
    Killed,

    #[error("child failed")]
    Aborted,

    #[error("python error: {0}")]
    Traceback(String),

    #[error("subprocess failed with exitcode {0}")]
    ExitCode(i32),

    #[error("{program} did not produce {}", path.display())]
    MissingOutput { program: String, path: PathBuf },

    /// The program ran but reported a failure of its own.
    #[error("{message}{}", hint.as_ref().map(|h| format!("\n\n{h}")).unwrap_or_default())]
    Failed {
        program: String,
        message: String,
        hint: Option<String>,
    },

    #[error("batch scheduler error: {0}")]
    Scheduler(String),

    #[error("driver used out of order: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // === Configuration
    // =========================================================================
    #[error("configuration error: {0}")]
    Config(String),

    #[error("environment variable {0} is not set")]
    MissingEnvironment(String),

    // =========================================================================
    // === External programs
    // =========================================================================
    #[error(transparent)]
    Tool(#[from] ToolError),

    // =========================================================================
    // === Domain validity
    // =========================================================================
    /// The current lattice is rejected and the next solution should be tried.
    #[error("bad lattice: {0}")]
    BadLattice(String),

    #[error("catastrophic unit cell volume change: {before:.1} -> {after:.1}")]
    CellVolumeChange { before: f64, after: f64 },

    #[error("illegal spacegroup: {0}")]
    BadSpacegroup(String),

    #[error("reindexing operator {0} rejected")]
    ReindexRejected(String),

    #[error("unit cell {cell} inconsistent with lattice {lattice}")]
    CellInconsistent { lattice: String, cell: String },

    // =========================================================================
    // === Stage state contract
    // =========================================================================
    #[error("not enough lattices")]
    NotEnoughLattices,

    #[error("no stage with key {0}")]
    UnknownStage(u64),

    #[error("payload key {key} missing from {stage}")]
    PayloadMissing { stage: String, key: String },

    #[error("no Indexer implementations assigned for refinement")]
    NoIndexers,

    #[error("no Integrater implementations assigned for scaling")]
    NoIntegraters,

    #[error("stage {stage} made no progress after {cycles} cycles")]
    NoProgress { stage: String, cycles: usize },

    #[error("{0}")]
    Schema(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // === Wrapped library errors
    // =========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True for failures raised by an external program.
    pub fn is_tool(&self) -> bool {
        matches!(self, Error::Tool(_))
    }

    /// True when the error asks for the current lattice to be eliminated.
    pub fn is_bad_lattice(&self) -> bool {
        matches!(self, Error::BadLattice(_))
    }

    /// True for configuration failures that must stop a run before it starts.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::MissingEnvironment(_))
    }
}

//! xia2rs - automated processing of macromolecular diffraction data.
//!
//! This crate orchestrates the external crystallography programs (XDS,
//! DIALS, CCP4) that take a set of rotation images to scaled reflections:
//!
//! - Indexer, Refiner, Integrater and Scaler stages with lazily evaluated
//!   results and flag-based invalidation of everything downstream
//! - A project hierarchy of crystals, wavelengths, samples and sweeps,
//!   saved to and restored from JSON
//! - Program drivers for local child processes and Grid Engine jobs
//! - Parallel integration of independent sweeps using rayon
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Schema (XProject ... XSweep)      │
//! │   lazy stage creation, JSON         │
//! └─────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────┐
//! │         Stage Graph + Engine        │
//! │  ┌───────────┐  ┌───────────────┐  │
//! │  │  Handles  │  │   Backends    │  │
//! │  │ (getters) │  │ XDS/DIALS/CCP4│  │
//! │  └───────────┘  └───────────────┘  │
//! └─────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────┐
//! │   Drivers (child process / qsub)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use xia2rs::{Config, FrameProcessor, Pipeline, RunContext, XCrystal, XProject, XSweep, XWavelength};
//!
//! # fn main() -> xia2rs::Result<()> {
//! let base = std::path::Path::new("/data/processing");
//! let run = RunContext::from_env(Config::default(), base)?;
//!
//! let mut crystal = XCrystal::new("XTAL");
//! crystal.add_wavelength(XWavelength::new("NATIVE", 0.9795))?;
//! let frame = FrameProcessor::new("insulin_1_####.cbf", "/data/images").with_image_range(1, 90);
//! crystal.add_sweep("NATIVE", XSweep::new("SWEEP1", frame)?)?;
//!
//! let mut project = XProject::new("AUTOMATIC", base);
//! project.add_crystal(crystal)?;
//! Pipeline::new(&run).run_and_report(&mut project)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod data;
pub mod driver;
pub mod error;
pub mod runtime;
pub mod schema;
pub mod stage;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use config::{init_logging, Config, PipelineKind};
pub use context::RunContext;
pub use data::{DatasetKey, FrameProcessor, Lattice, Payload, UnitCell};
pub use error::{Error, Result, ToolError};
pub use runtime::{FallbackPolicy, Pipeline};
pub use schema::{SweepPath, XCrystal, XProject, XSample, XSweep, XWavelength};
pub use stage::{Engine, Phase, StageGraph, StageKey, StageKind, StageStatus};

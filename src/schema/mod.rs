//! The crystallographic project hierarchy.
//!
//! `XProject` owns crystals; a crystal owns wavelengths and samples; a
//! wavelength owns sweeps. Children know their parents by name only, and
//! those names are restored after loading.

pub mod crystal;
pub mod project;
pub mod sample;
pub mod serialize;
pub mod sweep;
pub mod wavelength;

pub use crystal::XCrystal;
pub use project::XProject;
pub use sample::XSample;
pub use serialize::{escape_non_ascii, ProjectRecord, PROJECT_FILE};
pub use sweep::{SweepPath, SweepStages, XSweep};
pub use wavelength::XWavelength;

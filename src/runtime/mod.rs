//! Running projects: the pipeline orchestrator and indexer fallback
//! policies.

pub mod executor;
pub mod policy;

pub use executor::{error_report, Pipeline, ERROR_FILE};
pub use policy::{AlternateEngine, FallbackPolicy, NeverFallback, OncePerBackend, SaturationPolicy};

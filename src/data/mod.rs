//! Leaf data types shared by stages and the project schema.

pub mod dataset;
pub mod frame;
pub mod lattice;
pub(crate) mod numeric_keys;
pub mod payload;

pub use dataset::DatasetKey;
pub use frame::{DetectorModel, FrameProcessor};
pub use lattice::{Lattice, LatticeAssertion, LatticeSolution, LatticeSolutions, UnitCell};
pub use payload::{Artifact, Payload, StagedPayload};

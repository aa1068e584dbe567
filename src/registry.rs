//! Client and simulator definition registry.
//!
//! At startup the builder walks the definition trees, builds one image per
//! selected definition and records the result. The registry is read-only
//! for the rest of the process lifetime.

pub mod builder;
pub mod types;

pub use builder::ImageBuilder;
pub use types::{ClientDefinition, ClientMetadata, SimulatorDefinition};

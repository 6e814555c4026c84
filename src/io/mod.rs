//! Persistence: checkpoint records, the type registry and CSV export.

pub mod checkpoint;
pub mod export;
pub mod registry;

pub use checkpoint::{CheckpointReader, CheckpointWriter, Snapshot};
pub use registry::TypeRegistry;
